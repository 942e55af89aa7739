//! The preservation prover.
//!
//! Establishes facts of the form `lhs = rhs` across a procedure, chiefly
//! `r = r` ("the procedure preserves r"). The prover rewrites the left side
//! backwards through the data flow: through assignments by substituting
//! their right sides, through calls by using the callee's proven (or, in a
//! recursion group, premised) facts, and through phis by proving the query
//! for every operand with cycle detection. A query that survives to
//! syntactic equality is proven.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::exp::{Exp, ExpSet};
use crate::operators::Operator;
use crate::prog::{ProcId, Prog};
use crate::settings::Settings;
use crate::stmt::{StatementKind, StmtId};

/// Try to prove `lhs = rhs` for procedure `pid`. Conditional queries are
/// not cached as proven (they depend on premises still in flight).
pub fn prove(
    prog: &mut Prog,
    settings: &Settings,
    pid: ProcId,
    lhs: Exp,
    rhs: Exp,
    conditional: bool,
) -> bool {
    let orig_left = lhs.clone();
    let orig_right = rhs.clone();

    if let Some(known) = prog.proc(pid).proven_true.get(&orig_left) {
        if *known == orig_right {
            return true;
        }
    }
    if settings.no_prove {
        return false;
    }

    // Subscript the right side with the implicit entry definitions.
    let mut query_rhs = rhs;
    let mut locs = ExpSet::new();
    query_rhs.add_used_locs(&mut locs);
    for loc in locs.iter() {
        if !loc.is_subscript() {
            query_rhs = query_rhs.subscript_var(loc, None);
        }
    }

    // Route the left side through the definition reaching the exit.
    let mut query_lhs = lhs;
    if !query_lhs.is_subscript() {
        let def = prog
            .proc(pid)
            .return_stmt
            .and_then(|rid| prog.proc(pid).cfg.try_stmt(rid))
            .and_then(|s| s.as_return())
            .and_then(|r| r.find_def_for(&query_lhs))
            .cloned();
        match def {
            Some(d) => query_lhs = d,
            None => {
                // Nothing defines it on any path to the exit: x = x holds
                // trivially for locations the procedure never touches.
                let right = orig_right.clone().simplify();
                if orig_left == right
                    && !orig_left.is_terminal(Operator::DefineAll)
                    && !defines_anywhere(prog, pid, &orig_left)
                {
                    prog.proc_mut(pid)
                        .proven_true
                        .insert(orig_left, right);
                    return true;
                }
                debug!("{}: {} not in return collector", prog.proc(pid).name, query_lhs);
                return false;
            }
        }
    }

    // Inside a recursion group the query becomes a premise for call bypass.
    let in_cycle = prog.proc(pid).cycle_group.is_some();
    if in_cycle {
        prog.proc_mut(pid)
            .recur_premises
            .insert(orig_left.clone(), orig_right.clone());
    }

    let mut last_phis = BTreeSet::new();
    let mut cache = HashMap::new();
    let result = prover(
        prog,
        settings,
        pid,
        query_lhs,
        query_rhs,
        &mut last_phis,
        &mut cache,
        None,
        0,
    );

    if in_cycle {
        prog.proc_mut(pid).recur_premises.remove(&orig_left);
    }

    debug!(
        "prove {} = {} in {}: {}",
        orig_left,
        orig_right,
        prog.proc(pid).name,
        result
    );
    if result && !conditional {
        prog.proc_mut(pid).proven_true.insert(orig_left, orig_right);
    }
    result
}

fn defines_anywhere(prog: &Prog, pid: ProcId, loc: &Exp) -> bool {
    let proc = prog.proc(pid);
    proc.cfg.statements_in_order().iter().any(|sid| {
        proc.cfg
            .try_stmt(*sid)
            .map(|s| !s.is_implicit() && s.defines_loc(loc))
            .unwrap_or(false)
    })
}

#[allow(clippy::too_many_arguments)]
fn prover(
    prog: &mut Prog,
    settings: &Settings,
    pid: ProcId,
    lhs0: Exp,
    rhs0: Exp,
    last_phis: &mut BTreeSet<StmtId>,
    cache: &mut HashMap<StmtId, Exp>,
    last_phi: Option<StmtId>,
    depth: u32,
) -> bool {
    if depth > settings.prover_budget {
        warn!(
            "{}: proof gave up (recursion budget exceeded)",
            prog.proc(pid).name
        );
        return false;
    }

    let phi_ind = rhs0.clone();
    if let Some(lp) = last_phi {
        if cache.get(&lp) == Some(&phi_ind) {
            return true;
        }
    }

    let mut lhs = lhs0;
    let mut rhs = rhs0;
    let mut refs_to: BTreeSet<StmtId> = BTreeSet::new();
    let mut called: HashMap<StmtId, (Exp, Exp)> = HashMap::new();
    let mut swapped = false;
    let mut change = true;
    let mut rounds = 0u32;

    while change {
        rounds += 1;
        if rounds > settings.prover_budget {
            warn!("{}: proof gave up (rewrite budget exceeded)", prog.proc(pid).name);
            return false;
        }
        change = false;

        if lhs == rhs {
            return true;
        }

        // Move constants to the right.
        let mut const_move: Option<(Exp, i64)> = None;
        if let Exp::Binary(op, a, b) = &lhs {
            if matches!(op, Operator::Plus | Operator::Minus) && b.is_int_const() {
                let k = b.int_value().unwrap_or(0);
                let shifted = if *op == Operator::Plus { -k } else { k };
                const_move = Some(((**a).clone(), shifted));
            }
        }
        if let Some((new_lhs, shifted)) = const_move {
            rhs = Exp::binary(Operator::Plus, rhs, Exp::int(shifted)).simplify();
            lhs = new_lhs;
            change = true;
        }

        // Substitute through the defining statement of a subscripted lhs.
        if !change {
            if let Exp::Ref(base, Some(def)) = lhs.clone() {
                let kind = prog.proc(pid).cfg.try_stmt(def).map(|s| s.kind.clone());
                match kind {
                    Some(StatementKind::Call(call)) => {
                        let dest = call.dest_proc;

                        // Conditional preservation inside a recursion group.
                        let in_group = dest
                            .map(|d| {
                                let dp = prog.proc(d);
                                !dp.is_lib
                                    && dp
                                        .cycle_group
                                        .as_ref()
                                        .map(|g| g.contains(&pid))
                                        .unwrap_or(false)
                            })
                            .unwrap_or(false);

                        if in_group {
                            let callee = dest.unwrap();
                            if let Some(proven) = prog.proc(callee).get_proven(&base) {
                                let new_lhs = call.localise_exp(proven);
                                return prover(
                                    prog, settings, pid, new_lhs, rhs, last_phis, cache,
                                    last_phi, depth + 1,
                                );
                            }
                            if let Some(premised) = prog.proc(callee).get_premised(&base) {
                                debug!(
                                    "conditional preservation via premise for call to {}",
                                    prog.proc(callee).name
                                );
                                let new_lhs = call.localise_exp(premised);
                                return prover(
                                    prog, settings, pid, new_lhs, rhs, last_phis, cache,
                                    last_phi, depth + 1,
                                );
                            }
                            // Assume it as a fresh premise and test it.
                            prog.proc_mut(callee).set_premise((*base).clone());
                            let ok = prove(
                                prog,
                                settings,
                                callee,
                                (*base).clone(),
                                (*base).clone(),
                                true,
                            );
                            prog.proc_mut(callee).kill_premise(&base);
                            if ok {
                                let new_lhs = call.localise_exp((*base).clone());
                                return prover(
                                    prog, settings, pid, new_lhs, rhs, last_phis, cache,
                                    last_phi, depth + 1,
                                );
                            }
                            // No premise holds; the outer proof will fail.
                        } else if let Some(right) =
                            dest.and_then(|d| prog.proc(d).get_proven(&base))
                        {
                            // Loop through the same call with the same query
                            // means no progress.
                            if called.get(&def) == Some(&(lhs.clone(), rhs.clone())) {
                                debug!("call loop detected; proof fails");
                                return false;
                            }
                            called.insert(def, (lhs.clone(), rhs.clone()));
                            lhs = call.localise_exp(right);
                            change = true;
                        }
                    }
                    Some(StatementKind::Phi(p)) => {
                        if last_phis.contains(&def) || last_phi == Some(def) {
                            // Induction: the phi query loops back on itself.
                            if rhs != phi_ind {
                                return false;
                            }
                            lhs = Exp::terminal(Operator::True);
                            change = true;
                        } else {
                            let mut ok = true;
                            for op in p.filled() {
                                let sub_lhs = Exp::Ref(base.clone(), op.def);
                                if let Some(lp) = last_phi {
                                    last_phis.insert(lp);
                                }
                                let r = prover(
                                    prog,
                                    settings,
                                    pid,
                                    sub_lhs,
                                    rhs.clone(),
                                    last_phis,
                                    cache,
                                    Some(def),
                                    depth + 1,
                                );
                                if let Some(lp) = last_phi {
                                    last_phis.remove(&lp);
                                }
                                if !r {
                                    ok = false;
                                    break;
                                }
                            }
                            if ok {
                                cache.insert(def, rhs.clone());
                            }
                            return ok;
                        }
                    }
                    Some(StatementKind::Assign(a)) => {
                        if refs_to.contains(&def) {
                            warn!("{}: ref loop in proof at {}", prog.proc(pid).name, def);
                            return false;
                        }
                        refs_to.insert(def);
                        lhs = a.rhs.clone();
                        change = true;
                    }
                    _ => {}
                }
            }
        }

        // Cancel a memof on both sides.
        if !change {
            let stripped = match (&lhs, &rhs) {
                (Exp::Unary(Operator::MemOf, a), Exp::Unary(Operator::MemOf, b)) => {
                    Some(((**a).clone(), (**b).clone()))
                }
                _ => None,
            };
            if let Some((a, b)) = stripped {
                lhs = a;
                rhs = b;
                change = true;
            }
        }

        // A memof left side can meet the right through a store of the same
        // value: find an assignment `m[x] := rhs` and compare addresses.
        if !change && lhs.is_mem_of() {
            let proc = prog.proc(pid);
            for sid in proc.cfg.statements_in_order() {
                let Some(a) = proc.cfg.try_stmt(sid).and_then(|s| s.as_assign()) else {
                    continue;
                };
                if a.rhs == rhs && a.lhs.is_mem_of() {
                    rhs = a.lhs.clone();
                    change = true;
                    break;
                }
            }
        }

        // Both sides memofs subscripted with the entry state: compare
        // their addresses.
        if !change {
            let strip = |e: &Exp| -> Option<Exp> {
                match e {
                    Exp::Ref(inner, None) => match inner.as_ref() {
                        Exp::Unary(Operator::MemOf, addr) => Some((**addr).clone()),
                        _ => None,
                    },
                    _ => None,
                }
            };
            if let (Some(a), Some(b)) = (strip(&lhs), strip(&rhs)) {
                lhs = a;
                rhs = b;
                change = true;
            }
        }

        // Last chance: swap sides once.
        if !change && !swapped {
            std::mem::swap(&mut lhs, &mut rhs);
            swapped = true;
            refs_to.clear();
            change = true;
        }

        lhs = lhs.simplify();
        rhs = rhs.simplify();
        if lhs.is_terminal(Operator::True) {
            return true;
        }
        if lhs.is_terminal(Operator::False) {
            return false;
        }
    }

    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BbKind, Cfg};
    use crate::rtl::Rtl;
    use crate::settings::Settings;
    use crate::stmt::{Assign, ReturnStatement};

    /// Build a proc with a push/modify/pop body, already in SSA form:
    ///   1: m[r28{-} - 4] := r29{-}
    ///   2: r29 := 99
    ///   3: r29 := m[r28{-} - 4]{1}
    ///   4: RET  (collector: r29 := r29{3})
    fn push_pop_prog() -> (Prog, ProcId) {
        let mut prog = Prog::new("t");
        let pid = prog.create_proc("f", 0x1000, false);
        let proc = prog.proc_mut(pid);
        proc.signature.stack_register = Some(28);

        let slot = Exp::mem(Exp::binary(
            Operator::Minus,
            Exp::subscript_implicit(Exp::reg(28)),
            Exp::int(4),
        ));
        let cfg = &mut proc.cfg;
        let push = cfg.add_stmt(StatementKind::Assign(Assign::new(
            slot.clone(),
            Exp::subscript_implicit(Exp::reg(29)),
        )));
        let clobber =
            cfg.add_stmt(StatementKind::Assign(Assign::new(Exp::reg(29), Exp::int(99))));
        let pop = cfg.add_stmt(StatementKind::Assign(Assign::new(
            Exp::reg(29),
            Exp::subscript(slot.clone(), push),
        )));
        let mut ret = ReturnStatement::new();
        ret.col
            .insert(Assign::new(Exp::reg(29), Exp::subscript(Exp::reg(29), pop)));
        let rid = cfg.add_stmt(StatementKind::Ret(ret));

        let b = cfg
            .new_bb(
                vec![
                    Rtl::with_stmts(0x1000, vec![push, clobber, pop]),
                    Rtl::with_stmts(0x1010, vec![rid]),
                ],
                BbKind::Ret,
            )
            .block();
        cfg.set_entry_and_exit(b);
        proc.return_stmt = Some(rid);
        (prog, pid)
    }

    #[test]
    fn test_push_pop_preservation_is_proven() {
        let (mut prog, pid) = push_pop_prog();
        let settings = Settings::default();
        assert!(prove(
            &mut prog,
            &settings,
            pid,
            Exp::reg(29),
            Exp::reg(29),
            false
        ));
        // Cached for next time.
        assert!(prog.proc(pid).proven_true.contains_key(&Exp::reg(29)));
    }

    #[test]
    fn test_clobbered_register_is_not_preserved() {
        let (mut prog, pid) = push_pop_prog();
        // Point the exit collector at the clobbering definition instead.
        let rid = prog.proc(pid).return_stmt.unwrap();
        let clobber = StmtId(1);
        {
            let proc = prog.proc_mut(pid);
            let r = proc.cfg.stmt_mut(rid).as_return_mut().unwrap();
            r.col.clear();
            r.col
                .insert(Assign::new(Exp::reg(29), Exp::subscript(Exp::reg(29), clobber)));
        }
        let settings = Settings::default();
        assert!(!prove(
            &mut prog,
            &settings,
            pid,
            Exp::reg(29),
            Exp::reg(29),
            false
        ));
    }

    #[test]
    fn test_untouched_location_is_trivially_preserved() {
        let (mut prog, pid) = push_pop_prog();
        let settings = Settings::default();
        // r30 is never defined in the body and absent from the collector.
        assert!(prove(
            &mut prog,
            &settings,
            pid,
            Exp::reg(30),
            Exp::reg(30),
            false
        ));
    }

    #[test]
    fn test_sp_adjustment_proof() {
        // 1: r28 := r28{-} - 4    (push space)
        // 2: r28 := r28{1} + 4    (pop)
        // collector: r28 := r28{2}; prove r28 = r28.
        let mut prog = Prog::new("t");
        let pid = prog.create_proc("f", 0x1000, false);
        let proc = prog.proc_mut(pid);
        let cfg: &mut Cfg = &mut proc.cfg;
        let s1 = cfg.add_stmt(StatementKind::Assign(Assign::new(
            Exp::reg(28),
            Exp::binary(
                Operator::Minus,
                Exp::subscript_implicit(Exp::reg(28)),
                Exp::int(4),
            ),
        )));
        let s2 = cfg.add_stmt(StatementKind::Assign(Assign::new(
            Exp::reg(28),
            Exp::binary(
                Operator::Plus,
                Exp::subscript(Exp::reg(28), s1),
                Exp::int(4),
            ),
        )));
        let mut ret = ReturnStatement::new();
        ret.col
            .insert(Assign::new(Exp::reg(28), Exp::subscript(Exp::reg(28), s2)));
        let rid = cfg.add_stmt(StatementKind::Ret(ret));
        let b = cfg
            .new_bb(
                vec![
                    Rtl::with_stmts(0x1000, vec![s1, s2]),
                    Rtl::with_stmts(0x1010, vec![rid]),
                ],
                BbKind::Ret,
            )
            .block();
        cfg.set_entry_and_exit(b);
        proc.return_stmt = Some(rid);

        let settings = Settings::default();
        assert!(prove(
            &mut prog,
            &settings,
            pid,
            Exp::reg(28),
            Exp::reg(28),
            false
        ));
    }
}
