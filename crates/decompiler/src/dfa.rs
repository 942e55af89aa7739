//! Data-flow based type analysis.
//!
//! Each statement meets its recorded types with the lattice meet of its
//! operand types (ascending through expressions), then pushes the result
//! back down into subexpressions (descending), until nothing changes.
//! Ascend derives the best type for a value from its parts; descend imposes
//! a requirement from the context, meeting against the per-statement
//! annotations refs point at.

use tracing::debug;

use crate::cfg::Cfg;
use crate::exp::{Const, ConstKind, Exp};
use crate::operators::Operator;
use crate::prog::{ProcId, Prog};
use crate::stmt::StatementKind;
use crate::types::Type;

/// Iteration cap for the whole-procedure fixpoint.
const TYPE_PASS_CAP: usize = 20;

/// Best type for `e` given what its operands already know.
pub fn ascend_type(cfg: &Cfg, e: &Exp) -> Type {
    match e {
        Exp::Const(Const { kind, .. }) => match kind {
            ConstKind::Int(_) => Type::int(32),
            ConstKind::Long(_) => Type::int(64),
            ConstKind::Flt(_) => Type::Float(64),
            ConstKind::Str(_) => Type::pointer(Type::Char),
            ConstKind::FuncAddr(_) => Type::pointer(Type::Func),
        },
        Exp::Terminal(Operator::True | Operator::False) => Type::Boolean,
        Exp::Terminal(_) => Type::Void,
        Exp::Ref(base, def) => match def {
            Some(d) => cfg
                .try_stmt(*d)
                .and_then(|s| s.get_type_for(base))
                .cloned()
                .unwrap_or(Type::Void),
            None => Type::Void,
        },
        Exp::Unary(Operator::MemOf, addr) => {
            let at = ascend_type(cfg, addr);
            match at.points_to() {
                Some(t) => t.clone(),
                None => Type::Void,
            }
        }
        Exp::Unary(Operator::AddrOf, inner) => Type::pointer(ascend_type(cfg, inner)),
        Exp::Unary(Operator::Neg | Operator::Not, inner) => ascend_type(cfg, inner),
        Exp::Unary(Operator::FNeg, inner) => {
            let t = ascend_type(cfg, inner);
            if t.is_float() {
                t
            } else {
                Type::Float(64)
            }
        }
        Exp::Unary(Operator::LNot, _) => Type::Boolean,
        Exp::Unary(_, _) => Type::Void,
        Exp::Binary(op, a, b) => {
            if op.is_comparison() {
                return Type::Boolean;
            }
            let ta = ascend_type(cfg, a);
            let tb = ascend_type(cfg, b);
            match op {
                Operator::Plus => {
                    if ta.resolves_to_pointer() {
                        ta
                    } else if tb.resolves_to_pointer() {
                        tb
                    } else {
                        meet_or_int(&ta, &tb)
                    }
                }
                Operator::Minus => {
                    if ta.resolves_to_pointer() && tb.resolves_to_pointer() {
                        Type::int(32)
                    } else if ta.resolves_to_pointer() {
                        ta
                    } else {
                        meet_or_int(&ta, &tb)
                    }
                }
                Operator::FPlus | Operator::FMinus | Operator::FMult | Operator::FDiv => {
                    if ta.is_float() {
                        ta
                    } else if tb.is_float() {
                        tb
                    } else {
                        Type::Float(64)
                    }
                }
                Operator::And | Operator::Or => Type::Boolean,
                Operator::Mult | Operator::Div | Operator::Mod => {
                    unsigned_evidence(meet_or_int(&ta, &tb))
                }
                Operator::MultS | Operator::DivS | Operator::ModS => {
                    signed_evidence(meet_or_int(&ta, &tb))
                }
                _ => meet_or_int(&ta, &tb),
            }
        }
        Exp::Ternary(op, _, to, _) => {
            let size = to.int_value().unwrap_or(32) as u16;
            match op {
                Operator::ZFill | Operator::TruncU => Type::unsigned_int(size),
                Operator::SgnEx | Operator::TruncS | Operator::FToI => Type::signed_int(size),
                Operator::FSize | Operator::IToF => Type::Float(size),
                _ => Type::Void,
            }
        }
        Exp::Typed(ty, _) => ty.clone(),
        Exp::FlagCall(_, _) => Type::Void,
    }
}

fn meet_or_int(a: &Type, b: &Type) -> Type {
    let mut ch = false;
    let t = a.meet_with(b, &mut ch, false);
    if t.is_void() {
        Type::int(32)
    } else {
        t
    }
}

fn signed_evidence(t: Type) -> Type {
    match t {
        Type::Integer { size, signedness } => Type::Integer {
            size,
            signedness: signedness.saturating_add(1),
        },
        t => t,
    }
}

fn unsigned_evidence(t: Type) -> Type {
    match t {
        Type::Integer { size, signedness } => Type::Integer {
            size,
            signedness: signedness.saturating_sub(1),
        },
        t => t,
    }
}

/// Push a required type down into `e`, meeting against the defining
/// statements its refs point at. Sets `changed` when any annotation moved.
pub fn descend_type(cfg: &mut Cfg, e: &Exp, ty: &Type, changed: &mut bool) {
    match e {
        Exp::Ref(base, Some(def)) => {
            if let Some(s) = cfg.stmts.get_mut(*def) {
                s.meet_with_for(ty, base, changed);
            }
        }
        Exp::Ref(_, None) => {}
        Exp::Unary(Operator::MemOf, addr) => {
            descend_type(cfg, addr, &Type::pointer(ty.clone()), changed);
        }
        Exp::Unary(Operator::AddrOf, inner) => {
            if let Some(p) = ty.points_to() {
                let p = p.clone();
                descend_type(cfg, inner, &p, changed);
            }
        }
        Exp::Unary(_, inner) => descend_type(cfg, inner, &Type::Void, changed),
        Exp::Binary(op, a, b) if matches!(op, Operator::Plus | Operator::Minus) => {
            // A pointer requirement lands on the pointer-shaped side; its
            // partner is an offset.
            if ty.resolves_to_pointer() {
                let ta = ascend_type(cfg, a);
                if ta.resolves_to_pointer() {
                    descend_type(cfg, a, ty, changed);
                    descend_type(cfg, b, &Type::int(32), changed);
                } else {
                    descend_type(cfg, b, ty, changed);
                    descend_type(cfg, a, &Type::int(32), changed);
                }
            } else {
                descend_type(cfg, a, ty, changed);
                descend_type(cfg, b, ty, changed);
            }
        }
        Exp::Binary(op, a, b) if op.is_comparison() => {
            // Comparisons impose their signedness on both operands.
            let ta = ascend_type(cfg, a);
            let tb = ascend_type(cfg, b);
            let mut t = meet_or_int(&ta, &tb);
            t = match op {
                Operator::LessUns
                | Operator::GreaterUns
                | Operator::LessEqUns
                | Operator::GreaterEqUns => unsigned_evidence(t),
                Operator::Less | Operator::Greater | Operator::LessEq | Operator::GreaterEq => {
                    signed_evidence(t)
                }
                _ => t,
            };
            descend_type(cfg, a, &t, changed);
            descend_type(cfg, b, &t, changed);
        }
        Exp::Binary(_, a, b) => {
            descend_type(cfg, a, &Type::Void, changed);
            descend_type(cfg, b, &Type::Void, changed);
        }
        Exp::Ternary(_, _, _, c) => descend_type(cfg, c, &Type::Void, changed),
        Exp::Typed(t, inner) => descend_type(cfg, inner, t, changed),
        Exp::FlagCall(_, args) => {
            for a in args {
                descend_type(cfg, a, &Type::Void, changed);
            }
        }
        Exp::Const(_) | Exp::Terminal(_) => {}
    }
}

/// The per-procedure fixpoint: visit every statement, meet and push types,
/// repeat until stable.
pub fn type_analysis(prog: &mut Prog, pid: ProcId) {
    debug!("{}: data-flow type analysis", prog.proc(pid).name);
    for pass in 0..TYPE_PASS_CAP {
        let mut changed = false;
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let proc = prog.proc_mut(pid);
            let Some(mut s) = proc.cfg.stmts.take(sid) else { continue };
            match &mut s.kind {
                StatementKind::Assign(a) => {
                    let tr = ascend_type(&proc.cfg, &a.rhs);
                    let mut ch = false;
                    // The left side may legitimately hold a supertype of
                    // the right (assigning a subtype pointer).
                    let new = a.ty.meet_with(&tr, &mut ch, true);
                    if new != a.ty {
                        a.ty = new;
                    }
                    if ch {
                        changed = true;
                    }
                    let ty = a.ty.clone();
                    descend_type(&mut proc.cfg, &a.rhs, &ty, &mut changed);
                    if let Exp::Unary(Operator::MemOf, addr) = &a.lhs {
                        let want = Type::pointer(ty);
                        descend_type(&mut proc.cfg, addr, &want, &mut changed);
                    }
                }
                StatementKind::Phi(p) => {
                    let mut meet = Type::Void;
                    for op in p.filled() {
                        let t = match op.def {
                            Some(d) => proc
                                .cfg
                                .try_stmt(d)
                                .and_then(|ds| ds.get_type_for(&op.exp))
                                .cloned()
                                .unwrap_or(Type::Void),
                            None => Type::Void,
                        };
                        let mut ch = false;
                        meet = meet.meet_with(&t, &mut ch, false);
                    }
                    let mut ch = false;
                    let new = p.ty.meet_with(&meet, &mut ch, false);
                    if new != p.ty {
                        p.ty = new;
                    }
                    if ch {
                        changed = true;
                    }
                    // Push the merged type back into the operands' defs.
                    let ty = p.ty.clone();
                    for op in p.operands.iter().filter_map(|(_, o)| o.as_ref()) {
                        if let Some(d) = op.def {
                            if let Some(ds) = proc.cfg.stmts.get_mut(d) {
                                ds.meet_with_for(&ty, &op.exp, &mut changed);
                            }
                        }
                    }
                }
                StatementKind::Bool(b) => {
                    if b.ty != Type::Boolean {
                        b.ty = Type::Boolean;
                        changed = true;
                    }
                    let cond = b.cond.clone();
                    descend_type(&mut proc.cfg, &cond, &Type::Boolean, &mut changed);
                }
                StatementKind::Branch(b) => {
                    let cond = b.cond.clone();
                    descend_type(&mut proc.cfg, &cond, &Type::Boolean, &mut changed);
                }
                StatementKind::Call(c) => {
                    for a in &mut c.arguments {
                        let tr = ascend_type(&proc.cfg, &a.rhs);
                        let mut ch = false;
                        let new = a.ty.meet_with(&tr, &mut ch, true);
                        if new != a.ty {
                            a.ty = new;
                        }
                        if ch {
                            changed = true;
                        }
                        let ty = a.ty.clone();
                        descend_type(&mut proc.cfg, &a.rhs, &ty, &mut changed);
                    }
                }
                StatementKind::Ret(r) => {
                    for a in &mut r.returns {
                        let tr = ascend_type(&proc.cfg, &a.rhs);
                        let mut ch = false;
                        let new = a.ty.meet_with(&tr, &mut ch, true);
                        if new != a.ty {
                            a.ty = new;
                        }
                        if ch {
                            changed = true;
                        }
                        let ty = a.ty.clone();
                        descend_type(&mut proc.cfg, &a.rhs, &ty, &mut changed);
                    }
                }
                StatementKind::ImpRef(i) => {
                    let addr = i.addr.clone();
                    let want = Type::pointer(i.ty.clone());
                    descend_type(&mut proc.cfg, &addr, &want, &mut changed);
                }
                _ => {}
            }
            proc.cfg.stmts.put_back(s);
        }
        if !changed {
            debug!("{}: types stable after {} passes", prog.proc(pid).name, pass + 1);
            return;
        }
    }
    tracing::warn!("{}: type analysis hit its pass cap", prog.proc(pid).name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::BbKind;
    use crate::rtl::Rtl;
    use crate::stmt::Assign;
    use crate::stmt::StmtId;

    fn prog_with(stmts: Vec<StatementKind>) -> (Prog, ProcId, Vec<StmtId>) {
        let mut prog = Prog::new("t");
        let pid = prog.create_proc("f", 0x1000, false);
        let proc = prog.proc_mut(pid);
        let ids: Vec<StmtId> = stmts.into_iter().map(|k| proc.cfg.add_stmt(k)).collect();
        let b = proc
            .cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, ids.clone())], BbKind::Ret)
            .block();
        proc.cfg.set_entry_and_exit(b);
        (prog, pid, ids)
    }

    #[test]
    fn test_ascend_const_and_memof() {
        let cfg = Cfg::new();
        assert_eq!(ascend_type(&cfg, &Exp::int(5)), Type::int(32));
        assert_eq!(
            ascend_type(&cfg, &Exp::str("hi")),
            Type::pointer(Type::Char)
        );
        // m[p] where p types as pointer-to-float yields float.
        let e = Exp::mem(Exp::typed(
            Type::pointer(Type::Float(64)),
            Exp::reg(24),
        ));
        assert_eq!(ascend_type(&cfg, &e), Type::Float(64));
    }

    #[test]
    fn test_assignment_type_flows_to_def(){
        // 0: r24 := 5          (type becomes j32 via ascend)
        // 1: r25 := r24{0}     (descend pushes j32 into def 0)
        let (mut prog, pid, ids) = prog_with(vec![
            StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(5))),
            StatementKind::Assign(Assign::new(
                Exp::reg(25),
                Exp::subscript(Exp::reg(24), StmtId(0)),
            )),
        ]);
        type_analysis(&mut prog, pid);
        let proc = prog.proc(pid);
        let t0 = proc.cfg.stmt(ids[0]).get_type_for(&Exp::reg(24)).unwrap();
        assert_eq!(t0, &Type::int(32));
        let t1 = proc.cfg.stmt(ids[1]).get_type_for(&Exp::reg(25)).unwrap();
        assert_eq!(t1, &Type::int(32));
    }

    #[test]
    fn test_unsigned_comparison_pushes_signedness() {
        // 0: r24 := 5
        // 1: BRANCH cond r24{0} <u 10
        let (mut prog, pid, ids) = prog_with(vec![
            StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(5))),
            StatementKind::Branch(crate::stmt::BranchStatement {
                dest: Exp::int(0x2000),
                cond: Exp::binary(
                    Operator::LessUns,
                    Exp::subscript(Exp::reg(24), StmtId(0)),
                    Exp::int(10),
                ),
                branch_type: crate::stmt::BranchType::UnsignedLess,
                is_float: false,
            }),
        ]);
        type_analysis(&mut prog, pid);
        let proc = prog.proc(pid);
        let t0 = proc.cfg.stmt(ids[0]).get_type_for(&Exp::reg(24)).unwrap();
        match t0 {
            Type::Integer { signedness, .. } => assert!(*signedness < 0),
            other => panic!("expected integer, got {other}"),
        }
    }

    #[test]
    fn test_memof_store_types_address_as_pointer() {
        // 0: r28 := 100
        // 1: m[r28{0}] := 5
        let (mut prog, pid, ids) = prog_with(vec![
            StatementKind::Assign(Assign::new(Exp::reg(28), Exp::int(100))),
            StatementKind::Assign(Assign::new(
                Exp::mem(Exp::subscript(Exp::reg(28), StmtId(0))),
                Exp::int(5),
            )),
        ]);
        type_analysis(&mut prog, pid);
        let proc = prog.proc(pid);
        let t0 = proc.cfg.stmt(ids[0]).get_type_for(&Exp::reg(28)).unwrap();
        assert!(t0.resolves_to_pointer());
    }
}
