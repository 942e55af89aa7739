//! The per-procedure decompilation driver.
//!
//! `Driver::decompile` is a depth-first walk of the call graph that detects
//! strongly connected components on the way down and analyses each one as a
//! group once its whole cycle is on the path. Individual procedures go
//! through initialise / early / middle / remove-unused stages; the middle
//! stage iterates phi placement, renaming, return updates and propagation
//! to a fixpoint under a pass cap.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cfg::{BbKind, BlockId};
use crate::dataflow::{find_interferences, find_live_at_dom_phi, find_phi_unites, ConnectionGraph};
use crate::exp::{Exp, ExpSet};
use crate::frontend::Frontend;
use crate::operators::Operator;
use crate::proc::ProcStatus;
use crate::prog::{ProcId, Prog};
use crate::prove::prove;
use crate::settings::{EventSink, Settings};
use crate::stmt::{Assign, Define, ImplicitAssign, StatementKind, StmtId};
use crate::types::Type;

/// Catastrophic per-procedure failures. These are logged and the procedure
/// is left in its current status; they never cross the component boundary.
/// Recoverable conditions (malformed edges, pass caps, failed proofs) are
/// not errors: they record state that later passes check and skip on.
#[derive(Debug, Error)]
pub enum DecompileError {
    #[error("procedure has no basic blocks")]
    NoBlocks,
    #[error("procedure has no entry block")]
    NoEntryBlock,
    #[error("corrupt RTL list: statement {0} is missing from the arena")]
    CorruptRtl(StmtId),
}

/// Owns the pass sequencing; threads settings and the event sink through
/// every stage explicitly.
pub struct Driver<'a> {
    pub settings: &'a Settings,
    pub sink: &'a mut dyn EventSink,
    pub frontend: Option<&'a mut dyn Frontend>,
}

impl<'a> Driver<'a> {
    pub fn new(settings: &'a Settings, sink: &'a mut dyn EventSink) -> Self {
        Driver { settings, sink, frontend: None }
    }

    pub fn with_frontend(
        settings: &'a Settings,
        sink: &'a mut dyn EventSink,
        frontend: &'a mut dyn Frontend,
    ) -> Self {
        Driver { settings, sink, frontend: Some(frontend) }
    }

    /// Decompile every entry point (or every user procedure when no entry
    /// points are registered), then run the global return trim and de-SSA.
    pub fn decompile_all(&mut self, prog: &mut Prog) {
        let roots = if prog.entry_points.is_empty() {
            prog.user_proc_ids()
        } else {
            prog.entry_points.clone()
        };
        let mut path = Vec::new();
        for r in roots {
            if !prog.proc(r).is_lib && prog.proc(r).status < ProcStatus::Final {
                self.decompile(prog, r, &mut path);
            }
        }
        if !self.settings.no_change_signatures {
            self.remove_unused_returns(prog);
        }
        for pid in prog.user_proc_ids() {
            if prog.proc(pid).status >= ProcStatus::Final
                && !self.settings.no_decompile
            {
                self.finalise(prog, pid);
            }
        }
    }

    /// De-SSA and structure a finished procedure for the emitter. A graph
    /// recorded as malformed, or one whose blocks cannot all reach the
    /// return node, is left unstructured (the emitter falls back to gotos).
    pub fn finalise(&mut self, prog: &mut Prog, pid: ProcId) {
        if !prog.proc(pid).cfg.wellformed {
            warn!(
                "{}: malformed control flow graph; emitting without de-SSA or structure",
                prog.proc(pid).name
            );
            return;
        }
        self.from_ssa_form(prog, pid);
        let proc = prog.proc_mut(pid);
        proc.cfg.simplify_all();
        match proc.cfg.establish_rev_dft_order() {
            Ok(()) => crate::structuring::structure(&mut proc.cfg),
            Err(e) => warn!("{}: leaving procedure unstructured: {e}", proc.name),
        }
        proc.set_status(ProcStatus::CodeGenerated);
    }

    // ---- the recursion-aware driver ----------------------------------------

    /// Returns the set of procedures involved in recursion with this one
    /// that are not yet group-analysed (empty when this procedure finished).
    pub fn decompile(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
        path: &mut Vec<ProcId>,
    ) -> BTreeSet<ProcId> {
        let caller = path.last().map(|p| prog.proc(*p).name.clone());
        self.sink
            .considering(caller.as_deref(), &prog.proc(pid).name.clone());

        if prog.proc(pid).status >= ProcStatus::Final {
            warn!("{} is already decompiled", prog.proc(pid).name);
            return BTreeSet::new();
        }

        if prog.proc(pid).status < ProcStatus::Decoded {
            if let Some(fe) = self.frontend.as_deref_mut() {
                fe.process_proc(prog, pid);
                prog.proc_mut(pid).set_status(ProcStatus::Decoded);
            }
        }
        if prog.proc(pid).status < ProcStatus::Visited {
            prog.proc_mut(pid).set_status(ProcStatus::Visited);
        }

        let mut child: BTreeSet<ProcId> = BTreeSet::new();
        path.push(pid);

        if !self.settings.no_decode_children {
            // Depth-first over the resolved calls.
            let call_sites = self.resolved_call_sites(prog, pid);
            for (call_sid, callee) in call_sites {
                if prog.proc(callee).is_lib {
                    continue;
                }
                if prog.proc(callee).status == ProcStatus::Final {
                    self.link_callee_return(prog, pid, call_sid, callee);
                    continue;
                }

                let st = prog.proc(callee).status;
                if st >= ProcStatus::Visited && st <= ProcStatus::EarlyDone {
                    // A new cycle, or a new branch of an existing one.
                    if let Some(pos) = path.iter().position(|p| *p == callee) {
                        for p in &path[pos..] {
                            child.insert(*p);
                        }
                    } else {
                        if let Some(group) = prog.proc(callee).cycle_group.clone() {
                            let first_in_group =
                                path.iter().position(|p| group.contains(p));
                            child.extend(group);
                            if let Some(fpos) = first_in_group {
                                for p in &path[fpos + 1..] {
                                    child.insert(*p);
                                }
                            }
                        }
                    }
                    // Union in every member's existing group and retag.
                    let mut entries: BTreeSet<ProcId> = BTreeSet::new();
                    for cc in &child {
                        if let Some(g) = &prog.proc(*cc).cycle_group {
                            entries.extend(g.iter().copied());
                        }
                    }
                    child.extend(entries);
                    prog.set_cycle_group(&child);
                    prog.proc_mut(pid).set_status(ProcStatus::InCycle);
                } else {
                    debug!(
                        "visiting on the way down {} from {}",
                        prog.proc(callee).name,
                        prog.proc(pid).name
                    );
                    let tmp = self.decompile(prog, callee, path);
                    child.extend(tmp.iter().copied());
                    self.link_callee_return(prog, pid, call_sid, callee);
                    if !tmp.is_empty() {
                        prog.proc_mut(pid).set_status(ProcStatus::InCycle);
                    }
                }
            }
        }

        if child.is_empty() {
            self.sink.start_decompile(&prog.proc(pid).name.clone());
            if let Err(e) = self.initialise_decompile(prog, pid) {
                error!(
                    "{}: {e}; leaving procedure in its current state",
                    prog.proc(pid).name
                );
                if let Some(pos) = path.iter().rposition(|p| *p == pid) {
                    path.remove(pos);
                }
                return BTreeSet::new();
            }
            if self.settings.no_decompile {
                prog.proc_mut(pid).set_status(ProcStatus::Final);
                path.pop();
                return BTreeSet::new();
            }
            self.early_decompile(prog, pid);
            child = self.middle_decompile(prog, pid, path);
            if !child.is_empty() && path.last() != Some(&pid) {
                path.push(pid);
            }
        }

        if child.is_empty() {
            self.rem_unused_stmt_etc(prog, pid);
            prog.proc_mut(pid).set_status(ProcStatus::Final);
            self.sink.end_decompile(&prog.proc(pid).name.clone());
        } else if let Some(group) = prog.proc(pid).cycle_group.clone() {
            // The big test: is the whole strongly connected component on
            // the path with this procedure first?
            let first = path.iter().find(|p| group.contains(*p)).copied();
            if first == Some(pid) {
                // Group analysis marks the healthy members Final itself; a
                // member that failed initialisation keeps its status.
                self.recursion_group_analysis(prog, &group, path);
                self.sink.end_decompile(&prog.proc(pid).name.clone());
                child.clear();
            }
        }

        if let Some(pos) = path.iter().rposition(|p| *p == pid) {
            path.remove(pos);
        } else {
            warn!("path did not contain {} at return", prog.proc(pid).name);
        }
        child
    }

    fn resolved_call_sites(&mut self, prog: &mut Prog, pid: ProcId) -> Vec<(StmtId, ProcId)> {
        self.assign_procs_to_calls(prog, pid);
        let proc = prog.proc(pid);
        let mut out = Vec::new();
        for bid in proc.cfg.block_ids_by_address() {
            if proc.cfg.block(bid).kind != BbKind::Call {
                continue;
            }
            if let Some(sid) = proc.cfg.block(bid).last_stmt() {
                if let Some(c) = proc.cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                    if let Some(callee) = c.dest_proc {
                        out.push((sid, callee));
                    }
                }
            }
        }
        out
    }

    /// Resolve constant call destinations to procedures, creating stubs for
    /// addresses seen for the first time.
    fn assign_procs_to_calls(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let dest = match prog.proc(pid).cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                Some(c) if c.dest_proc.is_none() => match c.dest.func_value() {
                    Some(a) => a,
                    None => match c.dest.int_value() {
                        Some(i) => i as u64,
                        None => continue,
                    },
                },
                _ => continue,
            };
            let callee = match prog.find_proc_by_addr(dest) {
                Some(p) => p,
                None => prog.create_proc_at(dest),
            };
            let callee_name = prog.proc(callee).name.clone();
            if let Some(fe) = self.frontend.as_deref() {
                if fe.is_no_return_call_dest(&callee_name) {
                    prog.proc_mut(callee).no_return = true;
                }
            }
            if !prog.proc(pid).callees.contains(&callee) {
                prog.proc_mut(pid).callees.push(callee);
            }
            if let Some(c) = prog.proc_mut(pid).cfg.stmt_mut(sid).as_call_mut() {
                c.dest_proc = Some(callee);
            }
        }
    }

    fn link_callee_return(&mut self, prog: &mut Prog, pid: ProcId, call_sid: StmtId, callee: ProcId) {
        let ret = prog.proc(callee).return_stmt;
        if let Some(c) = prog.proc_mut(pid).cfg.stmt_mut(call_sid).as_call_mut() {
            c.callee_return = ret;
        }
    }

    // ---- stage: initialise -------------------------------------------------

    /// First look at a decoded procedure. The catastrophic conditions (no
    /// blocks at all, no entry, a corrupt RTL list) surface here as errors;
    /// a merely malformed graph is recorded on the CFG so the later stages
    /// skip their analyses instead.
    pub fn initialise_decompile(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
    ) -> Result<(), DecompileError> {
        self.sink.debug_point(&prog.proc(pid).name.clone(), "before initialise");
        let proc = prog.proc_mut(pid);

        if proc.cfg.num_blocks() == 0 {
            return Err(DecompileError::NoBlocks);
        }
        // A RTL referencing a statement the arena no longer holds would
        // surface as a panic deep inside a pass; catch it up front.
        for bid in proc.cfg.block_ids() {
            for sid in proc.cfg.block(bid).stmt_ids().collect::<Vec<_>>() {
                if !proc.cfg.stmts.contains(sid) {
                    return Err(DecompileError::CorruptRtl(sid));
                }
            }
        }

        // Locate the single return statement.
        if proc.return_stmt.is_none() {
            for bid in proc.cfg.block_ids_by_address() {
                if proc.cfg.block(bid).kind == BbKind::Ret {
                    if let Some(sid) = proc.cfg.block(bid).last_stmt() {
                        if proc.cfg.stmt(sid).is_return() {
                            proc.return_stmt = Some(sid);
                            break;
                        }
                    }
                }
            }
        }

        if proc.cfg.entry.is_none() {
            if let Some(first) = proc.cfg.block_ids_by_address().first() {
                debug!(
                    "{}: no entry block set; using lowest-address block 0x{:x}",
                    proc.name,
                    proc.cfg.block(*first).low_addr
                );
                proc.cfg.set_entry_and_exit(*first);
            }
        }
        if proc.cfg.entry.is_none() {
            return Err(DecompileError::NoEntryBlock);
        }

        // Well-formedness is recoverable: record the verdict and let the
        // analysis stages check it. The forward numbering doubles as the
        // reachability check.
        if proc.cfg.well_form() {
            if let Err(e) = proc.cfg.establish_dft_order() {
                warn!("{}: {e}", proc.name);
                proc.cfg.wellformed = false;
            }
        }
        if proc.cfg.wellformed {
            proc.df.compute_dominators(&proc.cfg);
        }
        self.sink.debug_point(&prog.proc(pid).name.clone(), "after initialise");
        Ok(())
    }

    // ---- stage: early ------------------------------------------------------

    pub fn early_decompile(&mut self, prog: &mut Prog, pid: ProcId) {
        if prog.proc(pid).status >= ProcStatus::EarlyDone {
            return;
        }
        if !prog.proc(pid).cfg.wellformed {
            warn!(
                "{}: malformed control flow graph; skipping early decompile",
                prog.proc(pid).name
            );
            return;
        }
        self.sink.debug_point(&prog.proc(pid).name.clone(), "before early");

        self.update_call_defines(prog, pid);
        self.replace_simple_global_constants(prog, pid);

        let proc = prog.proc_mut(pid);
        proc.df.place_phi_functions(&mut proc.cfg);
        let mut entry_uses = std::mem::take(&mut proc.entry_uses);
        proc.df.rename_block_vars(&mut proc.cfg, &mut entry_uses, true);
        proc.entry_uses = entry_uses;

        self.propagate_statements(prog, pid, 1);
        self.sink.debug_point(&prog.proc(pid).name.clone(), "after early");
    }

    // ---- stage: middle -----------------------------------------------------

    pub fn middle_decompile(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
        path: &mut Vec<ProcId>,
    ) -> BTreeSet<ProcId> {
        if !prog.proc(pid).cfg.wellformed {
            warn!(
                "{}: malformed control flow graph; skipping middle decompile",
                prog.proc(pid).name
            );
            return BTreeSet::new();
        }
        self.sink.debug_point(&prog.proc(pid).name.clone(), "before middle");

        self.fix_call_and_phi_refs(prog, pid);
        if prog.proc(pid).status != ProcStatus::InCycle {
            self.propagate_statements(prog, pid, 2);
        }

        self.find_sp_preservation(prog, pid);
        self.find_preserveds(prog, pid);
        self.fix_call_and_phi_refs(prog, pid);

        if !self.settings.no_promote {
            self.promote_signature(prog, pid);
        }

        self.place_phi_and_rename(prog, pid);
        self.propagate_statements(prog, pid, 2);
        self.update_arguments(prog, pid);
        self.reverse_strength_reduction(prog, pid);

        let mut pass = 3;
        while pass <= self.settings.middle_pass_cap {
            let mut change = self.place_phi_and_rename(prog, pid);

            if prog.proc(pid).return_stmt.is_some() {
                self.update_modifieds(prog, pid);
                self.update_returns(prog, pid);
            }

            if !self.settings.no_change_signatures {
                for _ in 0..self.settings.update_returns_iters {
                    if prog.proc(pid).status != ProcStatus::InCycle {
                        self.rename_vars(prog, pid);
                    }
                    self.find_preserveds(prog, pid);
                    self.update_call_defines(prog, pid);
                    self.fix_call_and_phi_refs(prog, pid);
                    self.find_preserveds(prog, pid);
                }
            }

            loop {
                let (ch, convert) = self.propagate_statements(prog, pid, pass);
                change |= ch;
                change |= self.rename_vars(prog, pid);
                if !convert {
                    break;
                }
                debug!(
                    "{}: restarting propagation after indirect call conversion",
                    prog.proc(pid).name
                );
            }

            self.remove_sp_assigns_if_possible(prog, pid);
            self.remove_matching_assigns_if_possible(
                prog,
                pid,
                &Exp::unary(Operator::Temp, Exp::terminal(Operator::WildStrConst)),
            );
            self.remove_matching_assigns_if_possible(prog, pid, &Exp::terminal(Operator::Pc));

            if !change {
                break;
            }
            pass += 1;
        }
        if pass > self.settings.middle_pass_cap {
            warn!(
                "{}: middle decompile hit its pass cap",
                prog.proc(pid).name
            );
        }

        // All address expressions are now stable; the held-back memory
        // locations can be renamed.
        prog.proc_mut(pid).df.set_rename_locals_params(true);
        self.place_phi_and_rename(prog, pid);
        self.propagate_statements(prog, pid, pass + 1);
        self.fix_call_and_phi_refs(prog, pid);

        if self.analyse_indirect_jumps(prog, pid) {
            // New control flow was discovered: everything done so far for
            // this procedure is invalid. Decode again and start over.
            debug!(
                "{}: restarting decompilation after indirect jump analysis",
                prog.proc(pid).name
            );
            if self.frontend.is_some() {
                let proc = prog.proc_mut(pid);
                proc.cfg.clear();
                proc.df = Default::default();
                proc.return_stmt = None;
                proc.set_status(ProcStatus::Visited);
                if let Some(fe) = self.frontend.as_deref_mut() {
                    fe.process_proc(prog, pid);
                }
                if let Some(pos) = path.iter().rposition(|p| *p == pid) {
                    path.remove(pos);
                }
                let ret = self.decompile(prog, pid, path);
                path.push(pid);
                return ret;
            }
        }

        self.find_preserveds(prog, pid);
        self.eliminate_duplicate_args(prog, pid);

        prog.proc_mut(pid).set_status(ProcStatus::EarlyDone);
        self.sink.debug_point(&prog.proc(pid).name.clone(), "after middle");
        BTreeSet::new()
    }

    fn place_phi_and_rename(&mut self, prog: &mut Prog, pid: ProcId) -> bool {
        let proc = prog.proc_mut(pid);
        let mut change = proc.df.place_phi_functions(&mut proc.cfg);
        change |= {
            let mut entry_uses = std::mem::take(&mut proc.entry_uses);
            let ch = proc.df.rename_block_vars(&mut proc.cfg, &mut entry_uses, false);
            proc.entry_uses = entry_uses;
            ch
        };
        change
    }

    fn rename_vars(&mut self, prog: &mut Prog, pid: ProcId) -> bool {
        let proc = prog.proc_mut(pid);
        let mut entry_uses = std::mem::take(&mut proc.entry_uses);
        let ch = proc.df.rename_block_vars(&mut proc.cfg, &mut entry_uses, false);
        proc.entry_uses = entry_uses;
        ch
    }

    // ---- stage: remove unused ----------------------------------------------

    pub fn rem_unused_stmt_etc(&mut self, prog: &mut Prog, pid: ProcId) {
        if !prog.proc(pid).cfg.wellformed {
            warn!(
                "{}: malformed control flow graph; keeping statements as decoded",
                prog.proc(pid).name
            );
            return;
        }
        self.sink.debug_point(&prog.proc(pid).name.clone(), "before final");

        if prog.proc(pid).status < ProcStatus::Final {
            crate::dfa::type_analysis(prog, pid);
            self.place_phi_and_rename(prog, pid);
            self.propagate_statements(prog, pid, 20);
        }

        if !self.settings.no_remove_null {
            let ref_counts = self.count_refs(prog, pid);
            self.remove_unused_statements(prog, pid, ref_counts);
            self.remove_null_statements(prog, pid);
        }

        // Liveness changed: recompute the call collectors.
        {
            let proc = prog.proc_mut(pid);
            let mut scratch = ConnectionGraph::new();
            find_interferences(&mut proc.cfg, &mut scratch);
        }

        self.find_final_parameters(prog, pid);
        if !self.settings.no_change_signatures {
            self.remove_redundant_parameters(prog, pid);
        }
        if !self.settings.no_parameter_names {
            self.add_parameter_symbols(prog, pid);
        }

        self.update_call_defines(prog, pid);
        self.update_arguments(prog, pid);

        self.branch_analysis(prog, pid);
        self.fix_ugly_branches(prog, pid);

        self.sink.debug_point(&prog.proc(pid).name.clone(), "after final");
    }

    /// Number of *statements* using each definition (two refs from one
    /// statement count once).
    fn count_refs(&self, prog: &Prog, pid: ProcId) -> HashMap<StmtId, i32> {
        let proc = prog.proc(pid);
        let mut counts: HashMap<StmtId, i32> = HashMap::new();
        for sid in proc.cfg.statements_in_order() {
            let Some(s) = proc.cfg.try_stmt(sid) else { continue };
            let mut used = ExpSet::new();
            s.add_used_locs(&mut used, false);
            let mut seen: BTreeSet<StmtId> = BTreeSet::new();
            for u in used.iter() {
                if let Some((_, Some(def))) = u.as_ref_parts() {
                    if seen.insert(def) {
                        *counts.entry(def).or_insert(0) += 1;
                    }
                }
            }
        }
        counts
    }

    fn remove_unused_statements(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
        mut ref_counts: HashMap<StmtId, i32>,
    ) {
        loop {
            let mut removed_any = false;
            let sids = prog.proc(pid).cfg.statements_in_order();
            for sid in sids {
                let Some(s) = prog.proc(pid).cfg.try_stmt(sid) else { continue };
                if !s.is_assignment() || s.is_implicit() {
                    continue;
                }
                let Some(lhs) = s.lhs().cloned() else { continue };

                // Assignments to globals are always observable.
                if matches!(lhs, Exp::Unary(Operator::Global, _)) {
                    continue;
                }
                // Stores through unrenamed memory must stay.
                if lhs.is_mem_of() && !prog.proc(pid).df.can_rename(&lhs) {
                    continue;
                }
                if ref_counts.get(&sid).copied().unwrap_or(0) > 0 {
                    continue;
                }

                // Dead: release the counts it held on its own uses.
                let mut used = ExpSet::new();
                prog.proc(pid)
                    .cfg
                    .stmt(sid)
                    .add_used_locs(&mut used, false);
                let mut seen: BTreeSet<StmtId> = BTreeSet::new();
                for u in used.iter() {
                    if let Some((_, Some(def))) = u.as_ref_parts() {
                        if seen.insert(def) {
                            if let Some(c) = ref_counts.get_mut(&def) {
                                *c -= 1;
                            }
                        }
                    }
                }
                debug!(
                    "{}: removing unused statement {}",
                    prog.proc(pid).name,
                    sid
                );
                prog.proc_mut(pid).remove_statement(sid);
                removed_any = true;
            }
            if !removed_any {
                break;
            }
        }
    }

    fn remove_null_statements(&mut self, prog: &mut Prog, pid: ProcId) -> bool {
        let mut change = false;
        for sid in prog.proc(pid).cfg.statements_in_order() {
            let is_null = prog
                .proc(pid)
                .cfg
                .try_stmt(sid)
                .map(|s| s.is_null_statement())
                .unwrap_or(false);
            if is_null {
                prog.proc_mut(pid).remove_statement(sid);
                change = true;
            }
        }
        change
    }

    // ---- recursion groups --------------------------------------------------

    pub fn recursion_group_analysis(
        &mut self,
        prog: &mut Prog,
        group: &BTreeSet<ProcId>,
        path: &mut Vec<ProcId>,
    ) {
        debug!(
            "recursion group analysis over {:?}",
            group.iter().map(|p| prog.proc(*p).name.clone()).collect::<Vec<_>>()
        );

        // A member failing its first look stays in its current state and
        // drops out of the group passes.
        let mut broken: BTreeSet<ProcId> = BTreeSet::new();
        for p in group {
            prog.proc_mut(*p).set_status(ProcStatus::InCycle);
            if let Err(e) = self.initialise_decompile(prog, *p) {
                error!(
                    "{}: {e}; leaving procedure in its current state",
                    prog.proc(*p).name
                );
                broken.insert(*p);
                continue;
            }
            self.early_decompile(prog, *p);
        }
        for p in group {
            if broken.contains(p) {
                continue;
            }
            self.middle_decompile(prog, *p, path);
            prog.proc_mut(*p).set_status(ProcStatus::Preserveds);
        }

        // Calls between group members become non-childless.
        for p in group {
            if broken.contains(p) {
                continue;
            }
            let sites = self.resolved_call_sites(prog, *p);
            for (sid, callee) in sites {
                if group.contains(&callee) {
                    self.link_callee_return(prog, *p, sid, callee);
                }
            }
        }

        // Propagate into the initial arguments before removing unused code.
        for p in group {
            if broken.contains(p) {
                continue;
            }
            self.update_arguments(prog, *p);
            self.propagate_statements(prog, *p, 0);
        }

        for _ in 0..2 {
            for p in group {
                if broken.contains(p) {
                    continue;
                }
                self.rem_unused_stmt_etc(prog, *p);
            }
        }
        for p in group {
            if !broken.contains(p) {
                prog.proc_mut(*p).set_status(ProcStatus::Final);
            }
        }
    }

    // ---- propagation -------------------------------------------------------

    /// One propagation pass. Returns (changed, converted-indirect-call).
    pub fn propagate_statements(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
        pass: u32,
    ) -> (bool, bool) {
        debug!("{}: propagating, pass {}", prog.proc(pid).name, pass);
        let mut used_by_dom_phi = ExpSet::new();
        find_live_at_dom_phi(&prog.proc(pid).cfg, &mut used_by_dom_phi);

        // How many statements would each definition be copied into?
        let mut dest_counts: HashMap<Exp, u32> = HashMap::new();
        for sid in prog.proc(pid).cfg.statements_in_order() {
            let Some(s) = prog.proc(pid).cfg.try_stmt(sid) else { continue };
            let mut used = ExpSet::new();
            s.add_used_locs(&mut used, false);
            for u in used.iter() {
                if u.is_subscript() {
                    *dest_counts.entry(u.clone()).or_insert(0) += 1;
                }
            }
        }

        let mut change = false;
        let mut convert = false;
        let sids = prog.proc(pid).cfg.statements_in_order();

        // Flag definitions propagate unconditionally: a branch can only
        // become a relational test once it sees the flag call, and the
        // extra copies cost nothing (the flag assigns die right after).
        for sid in &sids {
            change |= self.propagate_flags_into_stmt(prog, pid, *sid);
        }

        for sid in sids {
            let is_phi = prog
                .proc(pid)
                .cfg
                .try_stmt(sid)
                .map(|s| s.is_phi())
                .unwrap_or(true);
            if is_phi {
                continue;
            }
            change |= self.propagate_into_stmt(prog, pid, sid, &dest_counts, &used_by_dom_phi);
            convert |= self.convert_indirect(prog, pid, sid);
        }

        // The exit collector takes the same substitutions so reaching
        // definitions read as values, not subscripts.
        self.propagate_into_return_collector(prog, pid);
        self.propagate_to_collector(prog, pid);

        prog.proc_mut(pid).cfg.simplify_all();
        (change, convert)
    }

    fn propagate_into_stmt(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
        sid: StmtId,
        dest_counts: &HashMap<Exp, u32>,
        used_by_dom_phi: &ExpSet,
    ) -> bool {
        let mut change = false;
        // Chains of copies settle within a few rounds.
        for _ in 0..10 {
            let mut subst: Vec<(Exp, Exp)> = Vec::new();
            {
                let proc = prog.proc(pid);
                let Some(s) = proc.cfg.try_stmt(sid) else { return change };
                let mut used = ExpSet::new();
                s.add_used_locs(&mut used, false);
                for u in used.iter() {
                    let Some((base, Some(def))) = u.as_ref_parts() else { continue };
                    if used_by_dom_phi.contains(u) {
                        continue;
                    }
                    let Some(def_stmt) = proc.cfg.try_stmt(def) else { continue };
                    let StatementKind::Assign(a) = &def_stmt.kind else { continue };
                    if &a.lhs != base {
                        continue;
                    }
                    if proc.is_addr_escaped(&a.lhs) {
                        continue;
                    }
                    // Avoid duplicating non-trivial expressions into many
                    // statements.
                    let fanout = dest_counts.get(u).copied().unwrap_or(0);
                    if fanout > 1 + self.settings.propagation_fanout && !is_trivial(&a.rhs) {
                        continue;
                    }
                    // A memof source must not cross an escaped location.
                    if rhs_aliases_escaped(proc, &a.rhs) {
                        continue;
                    }
                    subst.push((u.clone(), a.rhs.clone()));
                }
            }
            if subst.is_empty() {
                return change;
            }
            let mut this_round = false;
            {
                let proc = prog.proc_mut(pid);
                if let Some(s) = proc.cfg.stmts.get_mut(sid) {
                    for (pat, repl) in &subst {
                        this_round |= s.search_and_replace(pat, repl);
                    }
                    s.simplify();
                }
            }
            if !this_round {
                return change;
            }
            change = true;
        }
        change
    }

    /// Substitute flag-setting definitions into their uses regardless of
    /// the usual fanout limits.
    fn propagate_flags_into_stmt(&mut self, prog: &mut Prog, pid: ProcId, sid: StmtId) -> bool {
        let is_phi = prog
            .proc(pid)
            .cfg
            .try_stmt(sid)
            .map(|s| s.is_phi())
            .unwrap_or(true);
        if is_phi {
            return false;
        }
        let mut subst: Vec<(Exp, Exp)> = Vec::new();
        {
            let proc = prog.proc(pid);
            let Some(s) = proc.cfg.try_stmt(sid) else { return false };
            let mut used = ExpSet::new();
            s.add_used_locs(&mut used, false);
            for u in used.iter() {
                let Some((base, Some(def))) = u.as_ref_parts() else { continue };
                if !matches!(
                    base,
                    Exp::Terminal(
                        Operator::Flags
                            | Operator::FFlags
                            | Operator::CarryFlag
                            | Operator::ZeroFlag
                    )
                ) {
                    continue;
                }
                let Some(a) = proc.cfg.try_stmt(def).and_then(|x| x.as_assign()) else {
                    continue;
                };
                if &a.lhs == base {
                    subst.push((u.clone(), a.rhs.clone()));
                }
            }
        }
        if subst.is_empty() {
            return false;
        }
        let mut changed = false;
        if let Some(s) = prog.proc_mut(pid).cfg.stmts.get_mut(sid) {
            for (pat, repl) in &subst {
                changed |= s.search_and_replace(pat, repl);
            }
            s.simplify();
        }
        changed
    }

    /// Computed call/jump whose destination propagated to a constant
    /// becomes direct. Later writes to a global destination are ignored;
    /// a known limitation carried over from the original analysis.
    fn convert_indirect(&mut self, prog: &mut Prog, pid: ProcId, sid: StmtId) -> bool {
        let dest_addr = {
            let Some(s) = prog.proc(pid).cfg.try_stmt(sid) else { return false };
            match &s.kind {
                StatementKind::Call(c) if c.is_computed => {
                    c.dest.func_value().or(c.dest.int_value().map(|i| i as u64))
                }
                _ => None,
            }
        };
        let Some(addr) = dest_addr else { return false };
        let callee = match prog.find_proc_by_addr(addr) {
            Some(p) => p,
            None => prog.create_proc_at(addr),
        };
        debug!(
            "{}: converted indirect call {} to direct call of {}",
            prog.proc(pid).name,
            sid,
            prog.proc(callee).name
        );
        let bid = prog.proc(pid).cfg.stmt(sid).bb;
        {
            let proc = prog.proc_mut(pid);
            if let Some(c) = proc.cfg.stmt_mut(sid).as_call_mut() {
                c.is_computed = false;
                c.dest_proc = Some(callee);
                c.dest = Exp::func_addr(addr);
            }
            if proc.cfg.block(bid).kind == BbKind::CompCall {
                proc.cfg.block_mut(bid).kind = BbKind::Call;
            }
        }
        true
    }

    fn propagate_into_return_collector(&mut self, prog: &mut Prog, pid: ProcId) {
        let Some(rid) = prog.proc(pid).return_stmt else { return };
        // Resolve each collector entry through plain assignments only.
        for _ in 0..10 {
            let mut subst: Vec<(Exp, Exp)> = Vec::new();
            {
                let proc = prog.proc(pid);
                let Some(r) = proc.cfg.try_stmt(rid).and_then(|s| s.as_return()) else {
                    return;
                };
                for d in r.col.iter() {
                    let mut used = ExpSet::new();
                    d.rhs.add_used_locs(&mut used);
                    for u in used.iter() {
                        let Some((base, Some(def))) = u.as_ref_parts() else { continue };
                        let Some(ds) = proc.cfg.try_stmt(def) else { continue };
                        let StatementKind::Assign(a) = &ds.kind else { continue };
                        if &a.lhs == base && is_trivial(&a.rhs) {
                            subst.push((u.clone(), a.rhs.clone()));
                        }
                    }
                }
            }
            if subst.is_empty() {
                return;
            }
            let mut changed = false;
            let proc = prog.proc_mut(pid);
            if let Some(r) = proc.cfg.stmt_mut(rid).as_return_mut() {
                for d in r.col.iter_mut() {
                    for (pat, repl) in &subst {
                        let rhs = std::mem::replace(&mut d.rhs, Exp::terminal(Operator::Nil));
                        let (out, ch) = rhs.search_replace_all(pat, repl);
                        d.rhs = out.simplify();
                        changed |= ch;
                    }
                }
            }
            if !changed {
                return;
            }
        }
    }

    /// Rewrite memof addresses in the entry use collector through plain
    /// assignments, merging entries that become equal.
    fn propagate_to_collector(&mut self, prog: &mut Prog, pid: ProcId) {
        let entries: Vec<Exp> = prog.proc(pid).entry_uses.iter().cloned().collect();
        for e in entries {
            let Exp::Ref(inner, None) = &e else { continue };
            let Exp::Unary(Operator::MemOf, addr) = inner.as_ref() else { continue };

            let mut used = ExpSet::new();
            addr.add_used_locs(&mut used);
            let mut new_addr = (**addr).clone();
            let mut changed = false;
            for u in used.iter() {
                let Some((base, Some(def))) = u.as_ref_parts() else { continue };
                let proc = prog.proc(pid);
                let Some(ds) = proc.cfg.try_stmt(def) else { continue };
                let StatementKind::Assign(a) = &ds.kind else { continue };
                if &a.lhs != base {
                    continue;
                }
                let (out, ch) = new_addr.search_replace_all(u, &a.rhs);
                new_addr = out;
                changed |= ch;
            }
            if changed {
                let new_e = Exp::subscript_implicit(Exp::mem(new_addr.simplify()));
                let proc = prog.proc_mut(pid);
                proc.entry_uses.remove(&e);
                proc.entry_uses.insert(new_e);
            }
        }
    }

    // ---- call and phi bypass -----------------------------------------------

    /// The call/phi bypass pass, run to a (bounded) fixpoint:
    /// phis drop self-referential operands and collapse when all operands
    /// agree; refs through calls that prove their base preserved are
    /// rewritten into caller terms.
    pub fn fix_call_and_phi_refs(&mut self, prog: &mut Prog, pid: ProcId) {
        debug!("{}: fix call and phi refs", prog.proc(pid).name);

        // Phase 1: prune phi operands that merely restate the phi.
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in &sids {
            let prune = {
                let proc = prog.proc(pid);
                let Some(p) = proc.cfg.try_stmt(*sid).and_then(|s| s.as_phi()) else {
                    continue;
                };
                let self_ref = Exp::subscript(p.lhs.clone(), *sid);
                let mut to_clear = Vec::new();
                for (i, (_, op)) in p.operands.iter().enumerate() {
                    let Some(op) = op else { continue };
                    if op.as_ref_exp() == self_ref {
                        to_clear.push(i);
                        continue;
                    }
                    if let Some(def) = op.def {
                        if let Some(a) = proc
                            .cfg
                            .try_stmt(def)
                            .and_then(|s| s.as_assign())
                        {
                            if a.rhs == self_ref {
                                to_clear.push(i);
                            }
                        }
                    }
                }
                to_clear
            };
            if !prune.is_empty() {
                if let Some(p) = prog.proc_mut(pid).cfg.stmt_mut(*sid).as_phi_mut() {
                    for i in prune.into_iter().rev() {
                        p.operands.remove(i);
                    }
                }
            }
        }

        // Phase 2: bypass refs through calls; collapse redundant phis.
        for sid in &sids {
            let is_phi = prog
                .proc(pid)
                .cfg
                .try_stmt(*sid)
                .map(|s| s.is_phi())
                .unwrap_or(false);
            if is_phi {
                self.bypass_phi(prog, pid, *sid);
            } else {
                self.bypass_stmt(prog, pid, *sid);
            }
        }

        // Phase 3: memof addresses in the entry collector bypass too.
        let entries: Vec<Exp> = prog.proc(pid).entry_uses.iter().cloned().collect();
        for e in entries {
            let Exp::Ref(inner, None) = &e else { continue };
            let Exp::Unary(Operator::MemOf, addr) = inner.as_ref() else { continue };
            if let Some(new_addr) = self.bypass_exp(prog, pid, addr) {
                let proc = prog.proc_mut(pid);
                proc.entry_uses.remove(&e);
                proc.entry_uses
                    .insert(Exp::subscript_implicit(Exp::mem(new_addr.simplify())));
            }
        }
    }

    /// Replacement for `e` with every call-subscripted ref to a preserved
    /// location rewritten, or None when nothing changed.
    fn bypass_exp(&mut self, prog: &Prog, pid: ProcId, e: &Exp) -> Option<Exp> {
        let proc = prog.proc(pid);
        let mut used = ExpSet::new();
        e.add_used_locs(&mut used);
        let mut out = e.clone();
        let mut changed = false;
        for u in used.iter() {
            let Some((base, Some(def))) = u.as_ref_parts() else { continue };
            let Some(call) = proc.cfg.try_stmt(def).and_then(|s| s.as_call()) else {
                continue;
            };
            let Some(callee) = call.dest_proc else { continue };
            let proven = prog
                .proc(callee)
                .get_proven(base)
                .or_else(|| prog.proc(callee).get_premised(base));
            let Some(proven) = proven else { continue };
            let replacement = call.localise_exp(proven).simplify();
            let (new_out, ch) = out.search_replace_all(u, &replacement);
            out = new_out;
            changed |= ch;
        }
        changed.then(|| out.simplify())
    }

    fn bypass_stmt(&mut self, prog: &mut Prog, pid: ProcId, sid: StmtId) {
        // Bounded fixpoint: a bypass can expose another call ref.
        for _ in 0..10 {
            let mut replacements: Vec<(Exp, Exp)> = Vec::new();
            {
                let proc = prog.proc(pid);
                let Some(s) = proc.cfg.try_stmt(sid) else { return };
                let mut used = ExpSet::new();
                s.add_used_locs(&mut used, false);
                for u in used.iter() {
                    let Some((base, Some(def))) = u.as_ref_parts() else { continue };
                    let Some(call) = proc.cfg.try_stmt(def).and_then(|x| x.as_call()) else {
                        continue;
                    };
                    let Some(callee) = call.dest_proc else { continue };
                    let proven = prog
                        .proc(callee)
                        .get_proven(base)
                        .or_else(|| prog.proc(callee).get_premised(base));
                    let Some(proven) = proven else { continue };
                    let replacement = call.localise_exp(proven).simplify();
                    if &replacement != u {
                        replacements.push((u.clone(), replacement));
                    }
                }
            }
            if replacements.is_empty() {
                return;
            }
            let mut any = false;
            if let Some(s) = prog.proc_mut(pid).cfg.stmts.get_mut(sid) {
                for (pat, repl) in &replacements {
                    any |= s.search_and_replace(pat, repl);
                }
                s.simplify();
            }
            if !any {
                return;
            }
        }
    }

    fn bypass_phi(&mut self, prog: &mut Prog, pid: ProcId, sid: StmtId) {
        // Bypass each operand, then collapse if all agree.
        let (lhs, ops) = {
            let Some(p) = prog.proc(pid).cfg.try_stmt(sid).and_then(|s| s.as_phi()) else {
                return;
            };
            if p.num_filled() == 0 {
                return;
            }
            (p.lhs.clone(), p.operands.clone())
        };

        let mut new_ops = ops.clone();
        for (_, op) in new_ops.iter_mut() {
            let Some(op) = op else { continue };
            let r = op.as_ref_exp();
            if let Some(bypassed) = self.bypass_exp(prog, pid, &r) {
                // Accept the bypass only when the result is again a ref of
                // the same base; anything else stays a phi operand as-is.
                if let Exp::Ref(b, d) = bypassed {
                    if *b == lhs || *b == op.exp {
                        op.def = d;
                    }
                }
            }
        }

        let filled: Vec<_> = new_ops.iter().filter_map(|(_, o)| o.clone()).collect();
        let all_same = filled
            .windows(2)
            .all(|w| w[0].as_ref_exp() == w[1].as_ref_exp());

        if all_same && !filled.is_empty() {
            // Choose the best representative: implicit beats assign beats
            // call.
            let mut best = filled[0].clone();
            for op in &filled[1..] {
                if op.def.is_none() {
                    best = op.clone();
                    break;
                }
                if let Some(d) = op.def {
                    if prog
                        .proc(pid)
                        .cfg
                        .try_stmt(d)
                        .map(|s| s.is_assign())
                        .unwrap_or(false)
                    {
                        best = op.clone();
                    }
                }
            }
            let ty = prog
                .proc(pid)
                .cfg
                .try_stmt(sid)
                .and_then(|s| s.as_phi())
                .map(|p| p.ty.clone())
                .unwrap_or(Type::Void);
            debug!("{}: redundant phi {} becomes copy", prog.proc(pid).name, sid);
            let kind = StatementKind::Assign(Assign::typed(ty, lhs, best.as_ref_exp()));
            prog.proc_mut(pid).cfg.stmt_mut(sid).kind = kind;
        } else if let Some(p) = prog.proc_mut(pid).cfg.stmt_mut(sid).as_phi_mut() {
            p.operands = new_ops;
        }
    }

    // ---- preservation ------------------------------------------------------

    pub fn find_sp_preservation(&mut self, prog: &mut Prog, pid: ProcId) {
        let Some(sp) = prog.proc(pid).signature.stack_register else { return };
        debug!("{}: finding sp preservation", prog.proc(pid).name);
        let mut proved = false;
        for _ in 0..2 {
            for p in 0..8 {
                if proved {
                    break;
                }
                let rhs = if p == 0 {
                    Exp::reg(sp)
                } else {
                    Exp::binary(Operator::Plus, Exp::reg(sp), Exp::int(p * 4))
                };
                proved = prove(prog, self.settings, pid, Exp::reg(sp), rhs, false);
            }
        }
    }

    pub fn find_preserveds(&mut self, prog: &mut Prog, pid: ProcId) {
        let Some(rid) = prog.proc(pid).return_stmt else { return };
        debug!("{}: finding preserveds", prog.proc(pid).name);

        let modified: Vec<Exp> = prog
            .proc(pid)
            .cfg
            .try_stmt(rid)
            .and_then(|s| s.as_return())
            .map(|r| r.modifieds.iter().map(|m| m.lhs.clone()).collect())
            .unwrap_or_default();

        for lhs in modified {
            prove(prog, self.settings, pid, lhs.clone(), lhs, false);
        }

        // Drop proven loc = loc facts from the return.
        let preserved: Vec<Exp> = prog
            .proc(pid)
            .proven_true
            .iter()
            .filter(|(l, r)| l == r)
            .map(|(l, _)| l.clone())
            .collect();
        if let Some(r) = prog.proc_mut(pid).cfg.stmt_mut(rid).as_return_mut() {
            for lhs in preserved {
                r.remove_modified(&lhs);
                r.remove_return(&lhs);
            }
        }
    }

    pub fn promote_signature(&mut self, prog: &mut Prog, pid: ProcId) {
        let sp_preserved = match prog.proc(pid).signature.stack_register {
            Some(sp) => prog.proc(pid).proven_true.contains_key(&Exp::reg(sp)),
            None => false,
        };
        prog.proc_mut(pid).signature.promote(sp_preserved);
    }

    // ---- call maintenance --------------------------------------------------

    /// Refresh every call's defines from its callee's modifieds (or from
    /// liveness for childless calls), intersected with what is live after
    /// the call.
    pub fn update_call_defines(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let info = {
                let proc = prog.proc(pid);
                match proc.cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                    Some(c) => Some((c.dest_proc, c.callee_return, c.use_col.initialised)),
                    None => None,
                }
            };
            let Some((dest, callee_ret, live_known)) = info else { continue };

            let mut defines: Vec<Define> = Vec::new();
            match (dest, callee_ret) {
                (Some(callee), Some(_)) => {
                    let mods: Vec<Define> = prog
                        .proc(callee)
                        .return_stmt
                        .and_then(|r| prog.proc(callee).cfg.try_stmt(r))
                        .and_then(|s| s.as_return())
                        .map(|r| r.modifieds.clone())
                        .unwrap_or_default();
                    defines = mods;
                }
                _ => {
                    // Childless: everything live after the call is fair
                    // game, once liveness has run.
                    if live_known {
                        let proc = prog.proc(pid);
                        if let Some(c) = proc.cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                            let mut bases = ExpSet::new();
                            for u in c.use_col.iter() {
                                if let Some((base, _)) = u.as_ref_parts() {
                                    bases.insert(base.clone());
                                }
                            }
                            defines = bases
                                .into_iter()
                                .map(|lhs| Define { ty: Type::Void, lhs })
                                .collect();
                        }
                    }
                }
            }

            // Intersect with liveness when known.
            if live_known {
                let live_bases: ExpSet = {
                    let proc = prog.proc(pid);
                    match proc.cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                        Some(c) => c
                            .use_col
                            .iter()
                            .filter_map(|u| u.as_ref_parts().map(|(b, _)| b.clone()))
                            .collect(),
                        None => ExpSet::new(),
                    }
                };
                defines.retain(|d| live_bases.contains(&d.lhs));
            }

            if let Some(c) = prog.proc_mut(pid).cfg.stmt_mut(sid).as_call_mut() {
                c.defines = defines;
            }
        }
    }

    /// Rebuild each call's arguments from the callee's known parameters,
    /// localising every parameter location to this call site. Existing
    /// argument entries keep their expressions.
    pub fn update_arguments(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let callee = match prog.proc(pid).cfg.try_stmt(sid).and_then(|s| s.as_call()) {
                Some(c) => match c.dest_proc {
                    Some(d) => d,
                    None => continue,
                },
                None => continue,
            };

            // Parameter shapes: the signature when it has them, otherwise
            // the callee's discovered parameter list.
            let mut params: Vec<(Exp, Type)> = prog
                .proc(callee)
                .signature
                .params
                .iter()
                .map(|p| (p.exp.clone(), p.ty.clone()))
                .collect();
            if params.is_empty() {
                params = prog
                    .proc(callee)
                    .parameters
                    .iter()
                    .map(|ia| {
                        let (lhs, _) = ia.lhs.clone().remove_subscripts();
                        (lhs, ia.ty.clone())
                    })
                    .collect();
            }
            if params.is_empty() {
                continue;
            }

            let call = prog
                .proc(pid)
                .cfg
                .try_stmt(sid)
                .and_then(|s| s.as_call())
                .cloned();
            let Some(call) = call else { continue };

            let mut args: Vec<Assign> = Vec::new();
            for (pexp, pty) in params {
                if let Some(existing) = call.arguments.iter().find(|a| a.lhs == pexp) {
                    args.push(existing.clone());
                    continue;
                }
                let value = call.localise_exp(pexp.clone()).simplify();
                args.push(Assign::typed(pty, pexp, value));
            }

            if let Some(c) = prog.proc_mut(pid).cfg.stmt_mut(sid).as_call_mut() {
                c.arguments = args;
            }
        }
    }

    pub fn eliminate_duplicate_args(&mut self, prog: &mut Prog, pid: ProcId) {
        for sid in prog.proc(pid).cfg.statements_in_order() {
            if let Some(c) = prog.proc_mut(pid).cfg.stmts.get_mut(sid).and_then(|s| s.as_call_mut())
            {
                let mut seen: Vec<Exp> = Vec::new();
                c.arguments.retain(|a| {
                    if seen.contains(&a.lhs) {
                        false
                    } else {
                        seen.push(a.lhs.clone());
                        true
                    }
                });
            }
        }
    }

    // ---- returns -----------------------------------------------------------

    /// The modifieds are the definitions reaching the exit, minus filtered
    /// and preserved locations, intersected with what this procedure's
    /// callers actually keep alive.
    pub fn update_modifieds(&mut self, prog: &mut Prog, pid: ProcId) {
        let Some(rid) = prog.proc(pid).return_stmt else { return };

        let caller_live: Option<ExpSet> = {
            let sites = prog.call_sites_of(pid);
            if prog.entry_points.contains(&pid) {
                None // entry points answer to the outside world
            } else if sites.is_empty() {
                Some(ExpSet::new())
            } else {
                let mut any_unknown = false;
                let mut live = ExpSet::new();
                for (cp, cs) in sites {
                    match prog.proc(cp).cfg.try_stmt(cs).and_then(|s| s.as_call()) {
                        Some(c) if c.use_col.initialised => {
                            for u in c.use_col.iter() {
                                if let Some((base, _)) = u.as_ref_parts() {
                                    live.insert(base.clone());
                                }
                            }
                        }
                        _ => any_unknown = true,
                    }
                }
                if any_unknown {
                    None
                } else {
                    Some(live)
                }
            }
        };

        let col_defs: Vec<(Exp, Exp)> = prog
            .proc(pid)
            .cfg
            .try_stmt(rid)
            .and_then(|s| s.as_return())
            .map(|r| r.col.iter().map(|a| (a.lhs.clone(), a.rhs.clone())).collect())
            .unwrap_or_default();

        let mut mods: Vec<Define> = Vec::new();
        for (lhs, _) in col_defs {
            if prog.proc(pid).filter_returns(&lhs) {
                continue;
            }
            if prog.proc(pid).is_preserved(&lhs) {
                continue;
            }
            if let Some(live) = &caller_live {
                if !live.contains(&lhs) {
                    continue;
                }
            }
            let ty = prog
                .proc(pid)
                .cfg
                .try_stmt(rid)
                .and_then(|s| s.as_return())
                .and_then(|r| r.modifieds.iter().find(|m| m.lhs == lhs))
                .map(|m| m.ty.clone())
                .unwrap_or(Type::Void);
            mods.push(Define { ty, lhs });
        }

        if let Some(r) = prog.proc_mut(pid).cfg.stmt_mut(rid).as_return_mut() {
            r.modifieds = mods;
        }
    }

    /// Keep existing returns, drop the ones that merely restate the entry
    /// value, and add a return for every modified without one.
    pub fn update_returns(&mut self, prog: &mut Prog, pid: ProcId) {
        let Some(rid) = prog.proc(pid).return_stmt else { return };
        let (mods, col_rhs): (Vec<Define>, Vec<(Exp, Exp)>) = {
            let Some(r) = prog.proc(pid).cfg.try_stmt(rid).and_then(|s| s.as_return()) else {
                return;
            };
            (
                r.modifieds.clone(),
                r.col.iter().map(|a| (a.lhs.clone(), a.rhs.clone())).collect(),
            )
        };

        if let Some(r) = prog.proc_mut(pid).cfg.stmt_mut(rid).as_return_mut() {
            // A return whose value is the location's own entry value is a
            // no-op.
            r.returns.retain(|a| {
                a.rhs != Exp::subscript_implicit(a.lhs.clone())
            });
            for m in &mods {
                if r.returns.iter().any(|a| a.lhs == m.lhs) {
                    continue;
                }
                let rhs = col_rhs
                    .iter()
                    .find(|(l, _)| *l == m.lhs)
                    .map(|(_, rh)| rh.clone())
                    .unwrap_or_else(|| Exp::subscript_implicit(m.lhs.clone()));
                r.returns.push(Assign::typed(m.ty.clone(), m.lhs.clone(), rhs));
            }
        }
    }

    // ---- readability passes ------------------------------------------------

    /// Remove all assignments to the stack pointer when nothing but the
    /// entry value of sp is ever consumed.
    pub fn remove_sp_assigns_if_possible(&mut self, prog: &mut Prog, pid: ProcId) {
        let Some(sp) = prog.proc(pid).signature.stack_register else { return };
        self.remove_matching_assigns_if_possible(prog, pid, &Exp::reg(sp));
    }

    /// Remove all assignments to locations matching `pattern`, provided no
    /// statement consumes a subscripted value of one.
    pub fn remove_matching_assigns_if_possible(
        &mut self,
        prog: &mut Prog,
        pid: ProcId,
        pattern: &Exp,
    ) {
        let mut found_one = false;
        {
            let proc = prog.proc(pid);
            for sid in proc.cfg.statements_in_order() {
                let Some(s) = proc.cfg.try_stmt(sid) else { continue };
                if let Some(lhs) = s.lhs() {
                    if lhs.matches(pattern) {
                        found_one = true;
                    }
                }
                let mut used = ExpSet::new();
                s.add_used_locs(&mut used, false);
                for u in used.iter() {
                    if let Some((base, Some(def))) = u.as_ref_parts() {
                        if base.matches(pattern) && proc.cfg.stmts.contains(def) {
                            return; // a real use exists; keep the assigns
                        }
                    }
                }
            }
        }
        if !found_one {
            return;
        }
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let is_match = prog
                .proc(pid)
                .cfg
                .try_stmt(sid)
                .map(|s| s.is_assignment() && !s.is_implicit())
                .unwrap_or(false)
                && prog
                    .proc(pid)
                    .cfg
                    .stmt(sid)
                    .lhs()
                    .map(|l| l.matches(pattern))
                    .unwrap_or(false);
            if is_match {
                prog.proc_mut(pid).remove_statement(sid);
            }
        }
    }

    /// Fold `jcond A; jcond B` chains into one branch with a compound
    /// condition, removing the middle block.
    pub fn branch_analysis(&mut self, prog: &mut Prog, pid: ProcId) -> bool {
        let mut removed = false;
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let this = {
                let proc = prog.proc(pid);
                let Some(s) = proc.cfg.try_stmt(sid) else { continue };
                let Some(b) = s.as_branch() else { continue };
                (s.bb, b.clone())
            };
            let (bid, branch) = this;
            let proc = prog.proc(pid);
            if !proc.cfg.has_block(bid) || proc.cfg.block(bid).succs.len() != 2 {
                continue;
            }
            let taken = proc.cfg.block(bid).succs[0];
            let fall = proc.cfg.block(bid).succs[1];

            // The fall block must be exactly one branch with one in edge.
            let fall_stmts: Vec<StmtId> = proc.cfg.block(fall).stmt_ids().collect();
            if fall_stmts.len() != 1 || proc.cfg.block(fall).preds.len() != 1 {
                continue;
            }
            let fb = match proc.cfg.try_stmt(fall_stmts[0]).and_then(|s| s.as_branch()) {
                Some(b) => b.clone(),
                None => continue,
            };
            if proc.cfg.block(fall).succs.len() != 2 {
                continue;
            }
            let fall_taken = proc.cfg.block(fall).succs[0];
            let fall_fall = proc.cfg.block(fall).succs[1];

            if fall_fall == taken {
                //   branch to A if c1; branch to B if c2; A: ...
                // becomes branch to B if !c1 && c2
                let cond = Exp::binary(
                    Operator::And,
                    Exp::unary(Operator::LNot, branch.cond.clone()),
                    fb.cond.clone(),
                )
                .simplify();
                let proc = prog.proc_mut(pid);
                proc.cfg.remove_edge(bid, taken);
                proc.cfg.remove_edge(bid, fall);
                proc.cfg.remove_block(fall);
                proc.cfg.add_edge(bid, fall_taken);
                proc.cfg.add_edge(bid, fall_fall);
                if let Some(b) = proc.cfg.stmt_mut(sid).as_branch_mut() {
                    b.cond = cond;
                    b.dest = fb.dest.clone();
                }
                removed = true;
            } else if fall_taken == taken {
                //   branch to B if c1; branch to B if c2; A: ...
                // becomes branch to B if c1 || c2
                let cond =
                    Exp::binary(Operator::Or, branch.cond.clone(), fb.cond.clone()).simplify();
                let proc = prog.proc_mut(pid);
                proc.cfg.remove_edge(bid, fall);
                proc.cfg.remove_block(fall);
                proc.cfg.add_edge(bid, fall_fall);
                // Keep the taken edge first.
                let succs = &mut proc.cfg.block_mut(bid).succs;
                if succs.len() == 2 && succs[0] != taken {
                    succs.swap(0, 1);
                }
                if let Some(b) = proc.cfg.stmt_mut(sid).as_branch_mut() {
                    b.cond = cond;
                }
                removed = true;
            }
        }
        removed
    }

    /// Rewrite `x{n} - 1 >= 0` into a compare on the phi operand that
    /// computed the subtraction; the emitter gets a readable condition.
    pub fn fix_ugly_branches(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let replacement = {
                let proc = prog.proc(pid);
                let Some(b) = proc.cfg.try_stmt(sid).and_then(|s| s.as_branch()) else {
                    continue;
                };
                let Exp::Binary(Operator::GreaterEq, lhs, rhs) = &b.cond else { continue };
                if rhs.int_value() != Some(0) {
                    continue;
                }
                let Exp::Binary(Operator::Minus, x, one) = lhs.as_ref() else { continue };
                if one.int_value() != Some(1) || !x.is_subscript() {
                    continue;
                }
                let Some((_, Some(def))) = x.as_ref_parts() else { continue };
                let Some(p) = proc.cfg.try_stmt(def).and_then(|s| s.as_phi()) else {
                    continue;
                };
                let mut found = None;
                for op in p.filled() {
                    let Some(opdef) = op.def else { continue };
                    if let Some(a) = proc.cfg.try_stmt(opdef).and_then(|s| s.as_assign()) {
                        if a.rhs == **lhs {
                            found = Some((
                                (**lhs).clone(),
                                Exp::subscript(a.lhs.clone(), opdef),
                            ));
                            break;
                        }
                    }
                }
                found
            };
            if let Some((pat, repl)) = replacement {
                if let Some(s) = prog.proc_mut(pid).cfg.stmts.get_mut(sid) {
                    s.search_and_replace(&pat, &repl);
                }
            }
        }
    }

    /// Undo strength reduction: a counter `x := x{phi} + c` whose other phi
    /// operand is `x := 0` reads better as `x * c` at its uses with a
    /// unit-step counter.
    pub fn reverse_strength_reduction(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let plan = {
                let proc = prog.proc(pid);
                let Some(a) = proc.cfg.try_stmt(sid).and_then(|s| s.as_assign()) else {
                    continue;
                };
                let Exp::Binary(Operator::Plus, r, c) = &a.rhs else { continue };
                let Some(k) = c.int_value() else { continue };
                if k == 1 {
                    continue;
                }
                let Some((base, Some(phi_id))) = r.as_ref_parts() else { continue };
                if base != &a.lhs {
                    continue;
                }
                let Some(p) = proc.cfg.try_stmt(phi_id).and_then(|s| s.as_phi()) else {
                    continue;
                };
                if p.num_filled() != 2 {
                    continue;
                }
                let other = p
                    .filled()
                    .find(|op| op.def != Some(sid))
                    .and_then(|op| op.def);
                let Some(other) = other else { continue };
                let init_is_zero = proc
                    .cfg
                    .try_stmt(other)
                    .and_then(|s| s.as_assign())
                    .map(|ia| ia.rhs.int_value() == Some(0))
                    .unwrap_or(false);
                if !init_is_zero {
                    continue;
                }
                Some(((**r).clone(), k))
            };
            let Some((phi_ref, k)) = plan else { continue };

            // Every other use of the phi becomes phi * k.
            let mult = Exp::binary(Operator::Mult, phi_ref.clone(), Exp::int(k));
            let all = prog.proc(pid).cfg.statements_in_order();
            for other_sid in all {
                if other_sid == sid {
                    continue;
                }
                if let Some(s) = prog.proc_mut(pid).cfg.stmts.get_mut(other_sid) {
                    s.search_and_replace(&phi_ref, &mult);
                }
            }
            // And the counter steps by one.
            if let Some(a) = prog.proc_mut(pid).cfg.stmts.get_mut(sid).and_then(|s| s.as_assign_mut())
            {
                a.rhs = Exp::binary(Operator::Plus, phi_ref, Exp::int(1));
            }
        }
    }

    /// Fold loads of read-only global words into their constant values.
    pub fn replace_simple_global_constants(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        for sid in sids {
            let addr = {
                let proc = prog.proc(pid);
                let Some(a) = proc.cfg.try_stmt(sid).and_then(|s| s.as_assign()) else {
                    continue;
                };
                match &a.rhs {
                    Exp::Unary(Operator::MemOf, inner) => inner.int_value().map(|i| i as u64),
                    _ => None,
                }
            };
            let Some(addr) = addr else { continue };
            let Some(value) = prog.read_const_word(addr) else { continue };
            if let Some(a) = prog.proc_mut(pid).cfg.stmts.get_mut(sid).and_then(|s| s.as_assign_mut())
            {
                a.rhs = Exp::int(value);
            }
        }
    }

    // ---- parameters --------------------------------------------------------

    /// The final parameters are the entry-reaching uses that look like
    /// register or stack parameters.
    pub fn find_final_parameters(&mut self, prog: &mut Prog, pid: ProcId) {
        let candidates: Vec<Exp> = prog.proc(pid).entry_uses.iter().cloned().collect();
        let proc = prog.proc_mut(pid);
        proc.parameters.clear();

        let mut exps: Vec<Exp> = Vec::new();
        for c in candidates {
            let Some((base, None)) = c.as_ref_parts() else { continue };
            let base = base.clone();
            if proc.filter_params(&base) {
                continue;
            }
            if !(base.is_reg_of() || proc.is_local_or_param_pattern(&base)) {
                continue;
            }
            if !exps.contains(&base) {
                exps.push(base);
            }
        }
        exps.sort();
        for e in exps {
            debug!("{}: final parameter {}", proc.name, e);
            proc.parameters.push(ImplicitAssign { ty: Type::Void, lhs: e });
        }
    }

    /// Name the parameters and record them in the symbol map and signature.
    pub fn add_parameter_symbols(&mut self, prog: &mut Prog, pid: ProcId) {
        let proc = prog.proc_mut(pid);
        proc.signature.params.clear();
        let exps: Vec<(Exp, Type)> = proc
            .parameters
            .iter()
            .map(|p| (p.lhs.clone(), p.ty.clone()))
            .collect();
        for (i, (e, ty)) in exps.into_iter().enumerate() {
            let name = format!("param{}", i + 1);
            proc.signature.add_param(name.clone(), e.clone(), ty);
            proc.map_symbol_to(Exp::subscript_implicit(e), Exp::param(name));
        }
    }

    /// Drop parameters whose entry value nothing consumes any more: after
    /// unused-statement removal, a candidate that only fed dead code has no
    /// remaining use. A use that merely feeds the same parameter of a call
    /// back to this procedure is not gainful either; deeper chains through
    /// other procedures are kept conservatively.
    pub fn remove_redundant_parameters(&mut self, prog: &mut Prog, pid: ProcId) -> bool {
        let keep: Vec<bool> = {
            let proc = prog.proc(pid);
            proc.parameters
                .iter()
                .map(|p| {
                    let entry_ref = Exp::subscript_implicit(p.lhs.clone());
                    proc.cfg.statements_in_order().iter().any(|sid| {
                        let Some(s) = proc.cfg.try_stmt(*sid) else { return false };
                        // A self-call argument passing the parameter along
                        // unchanged is not a gainful use.
                        if let Some(c) = s.as_call() {
                            if c.dest_proc == Some(pid) {
                                let elsewhere = c.dest.contains(&entry_ref);
                                let gainful_arg = c.arguments.iter().any(|a| {
                                    a.rhs.contains(&entry_ref) && a.rhs != entry_ref
                                });
                                return elsewhere || gainful_arg;
                            }
                        }
                        let mut used = ExpSet::new();
                        s.add_used_locs(&mut used, false);
                        let found = used.iter().any(|u| u == &entry_ref || u.contains(&entry_ref));
                        found
                    })
                })
                .collect()
        };
        let mut removed = false;
        let proc = prog.proc_mut(pid);
        let name = proc.name.clone();
        let mut it = keep.iter();
        proc.parameters.retain(|p| {
            let k = *it.next().unwrap_or(&true);
            if !k {
                debug!("{}: removing redundant parameter {}", name, p.lhs);
                removed = true;
            }
            k
        });
        removed
    }

    // ---- indirect jumps ----------------------------------------------------

    /// Try to resolve computed jumps into switch tables. Returns true when
    /// new control flow was added (the caller restarts decompilation).
    pub fn analyse_indirect_jumps(&mut self, prog: &mut Prog, pid: ProcId) -> bool {
        let mut resolved_any = false;
        let blocks = prog.proc(pid).cfg.block_ids_by_address();
        for bid in blocks {
            if prog.proc(pid).cfg.block(bid).kind != BbKind::CompJump {
                continue;
            }
            let Some(sid) = prog.proc(pid).cfg.block(bid).last_stmt() else { continue };

            let parsed = {
                let proc = prog.proc(pid);
                let Some(case) = proc.cfg.try_stmt(sid).map(|s| &s.kind) else { continue };
                let StatementKind::Case(cs) = case else { continue };
                parse_jump_table(&cs.dest)
            };
            let Some((scrutinee, table_addr)) = parsed else {
                warn!(
                    "{}: unanalysable indirect jump target in block {}",
                    prog.proc(pid).name, bid
                );
                continue;
            };

            // Bound the table with a guarding comparison on the scrutinee.
            let upper = find_switch_bound(prog, pid, bid, &scrutinee);
            let Some(upper) = upper else {
                warn!(
                    "{}: jump table at 0x{:x} has no discoverable bound",
                    prog.proc(pid).name, table_addr
                );
                continue;
            };

            let Some(image) = prog.image.as_deref() else { continue };
            let mut targets = Vec::new();
            for i in 0..=upper {
                match image.read_native4(table_addr + (i as u64) * 4) {
                    Some(t) => targets.push(t as u64),
                    None => break,
                }
            }
            if targets.len() != (upper + 1) as usize {
                continue;
            }

            debug!(
                "{}: switch with {} cases, table at 0x{:x}",
                prog.proc(pid).name,
                targets.len(),
                table_addr
            );
            let num_cases = targets.len() as u32;
            {
                let proc = prog.proc_mut(pid);
                if let Some(cs) = proc.cfg.stmt_mut(sid).as_case_mut() {
                    cs.switch_info = Some(crate::frontend::SwitchInfo {
                        scrutinee: scrutinee.clone(),
                        form: crate::frontend::SwitchForm::Absolute,
                        lower: 0,
                        upper: upper as i64,
                        table_addr,
                        num_cases,
                    });
                }
                proc.cfg.block_mut(bid).kind = BbKind::Nway;
                for t in targets {
                    proc.cfg.add_edge_to_addr(bid, t);
                }
            }
            resolved_any = true;
        }
        resolved_any
    }

    // ---- global return trim ------------------------------------------------

    /// Drop returns no caller consumes, iterating across the call graph
    /// until stable.
    pub fn remove_unused_returns(&mut self, prog: &mut Prog) {
        for _ in 0..prog.procs.len().max(1) * 2 {
            let mut change = false;
            for pid in prog.user_proc_ids() {
                if prog.entry_points.contains(&pid) {
                    continue;
                }
                let Some(rid) = prog.proc(pid).return_stmt else { continue };
                let sites = prog.call_sites_of(pid);
                if sites.is_empty() {
                    continue;
                }
                let mut used = ExpSet::new();
                let mut any_unknown = false;
                for (cp, cs) in &sites {
                    match prog.proc(*cp).cfg.try_stmt(*cs).and_then(|s| s.as_call()) {
                        Some(c) if c.use_col.initialised => {
                            for u in c.use_col.iter() {
                                if let Some((b, _)) = u.as_ref_parts() {
                                    used.insert(b.clone());
                                }
                            }
                        }
                        _ => any_unknown = true,
                    }
                }
                if any_unknown {
                    continue;
                }
                let doomed: Vec<Exp> = prog
                    .proc(pid)
                    .cfg
                    .try_stmt(rid)
                    .and_then(|s| s.as_return())
                    .map(|r| {
                        r.returns
                            .iter()
                            .map(|a| a.lhs.clone())
                            .filter(|l| !used.contains(l))
                            .collect()
                    })
                    .unwrap_or_default();
                if doomed.is_empty() {
                    continue;
                }
                if let Some(r) = prog.proc_mut(pid).cfg.stmt_mut(rid).as_return_mut() {
                    for d in &doomed {
                        debug!("removing unused return {}", d);
                        r.remove_return(d);
                        r.remove_modified(d);
                    }
                }
                change = true;
            }
            if !change {
                break;
            }
        }
    }

    // ---- de-SSA ------------------------------------------------------------

    /// Transform out of SSA: split live ranges whose types disagree or that
    /// overlap, give surviving ranges local names, then dissolve the phis.
    pub fn from_ssa_form(&mut self, prog: &mut Prog, pid: ProcId) {
        debug!("{}: transforming out of SSA form", prog.proc(pid).name);

        let mut ig = ConnectionGraph::new();
        let mut pu = ConnectionGraph::new();

        // Type-driven splits: a def whose type contradicts the first
        // recorded type of its base cannot share that name.
        {
            let proc = prog.proc(pid);
            let mut first_types: HashMap<Exp, (Type, Exp)> = HashMap::new();
            for sid in proc.cfg.statements_in_order() {
                let Some(s) = proc.cfg.try_stmt(sid) else { continue };
                let mut defs = ExpSet::new();
                s.get_definitions(&mut defs);
                for base in defs.iter() {
                    let ty = s.get_type_for(base).cloned().unwrap_or(Type::Void);
                    let r = Exp::subscript(base.clone(), sid);
                    match first_types.get(base) {
                        None => {
                            first_types.insert(base.clone(), (ty, r));
                        }
                        Some((first, first_ref)) => {
                            if !ty.is_void() && !ty.is_compatible_with(first) {
                                warn!(
                                    "{}: type split for {}: {} vs {}",
                                    proc.name, base, ty, first
                                );
                                ig.connect(&r, first_ref);
                            }
                        }
                    }
                }
            }
        }

        {
            let proc = prog.proc_mut(pid);
            find_interferences(&mut proc.cfg, &mut ig);
            find_phi_unites(&proc.cfg, &mut pu);
        }

        // Split interfering ranges: one endpoint of every edge gets a fresh
        // local. Prefer renaming non-implicit defs, and phi destinations.
        let edges: Vec<(Exp, Exp)> = ig.iter().cloned().collect();
        for (r1, r2) in edges {
            let name1 = prog.proc(pid).lookup_sym_from_ref_any(&r1).cloned();
            let name2 = prog.proc(pid).lookup_sym_from_ref_any(&r2).cloned();
            if let (Some(n1), Some(n2)) = (&name1, &name2) {
                if n1 != n2 {
                    continue;
                }
            }
            let rename = if r1.is_implicit_ref() {
                r2.clone()
            } else if r2.is_implicit_ref() {
                r1.clone()
            } else {
                let r2_is_phi = r2
                    .as_ref_parts()
                    .and_then(|(_, d)| d)
                    .and_then(|d| prog.proc(pid).cfg.try_stmt(d))
                    .map(|s| s.is_phi())
                    .unwrap_or(false);
                if r2_is_phi {
                    r2.clone()
                } else {
                    r1.clone()
                }
            };
            let ty = rename
                .as_ref_parts()
                .and_then(|(base, d)| {
                    d.and_then(|d| prog.proc(pid).cfg.try_stmt(d))
                        .and_then(|s| s.get_type_for(base))
                        .cloned()
                })
                .unwrap_or(Type::Void);
            let local = prog.proc_mut(pid).new_local(ty);
            debug!("{}: splitting {} into {}", prog.proc(pid).name, rename, local);
            prog.proc_mut(pid).map_symbol_to(rename, local);
        }

        // Unite phi families where exactly one endpoint is named.
        let unions: Vec<(Exp, Exp)> = pu.iter().cloned().collect();
        for (r1, r2) in unions {
            if ig.is_connected(&r1, &r2) {
                continue;
            }
            let n1 = prog.proc(pid).symbol_for(&r1).cloned();
            let n2 = prog.proc(pid).symbol_for(&r2).cloned();
            match (n1, n2) {
                (Some(n), None) => prog.proc_mut(pid).map_symbol_to(r2, n),
                (None, Some(n)) => prog.proc_mut(pid).map_symbol_to(r1, n),
                _ => {}
            }
        }

        // Give every remaining ref a name: parameters keep their parameter
        // names, everything else shares one local per base location.
        self.name_remaining_refs(prog, pid);

        // Rewrite the body: every ref becomes its symbol, and the defined
        // location of each assignment takes the name of its own range.
        let sids = prog.proc(pid).cfg.statements_in_order();
        let symbol_map = prog.proc(pid).symbol_map.clone();
        {
            let proc = prog.proc_mut(pid);
            for sid in &sids {
                let Some(s) = proc.cfg.stmts.get_mut(*sid) else { continue };
                if s.is_phi() {
                    continue;
                }
                let lhs_sym = s
                    .lhs()
                    .map(|l| symbol_of(&symbol_map, l, Some(*sid)))
                    .filter(|sym| s.lhs() != Some(sym));
                s.map_exps(&mut |e| replace_refs_with_symbols(e, &symbol_map));
                if let Some(sym) = lhs_sym {
                    match &mut s.kind {
                        StatementKind::Assign(a) => a.lhs = sym,
                        StatementKind::Implicit(i) => i.lhs = sym,
                        StatementKind::Bool(b) => b.lhs = sym,
                        _ => {}
                    }
                }
            }
        }

        // Dissolve the phis.
        for sid in sids {
            let plan = {
                let proc = prog.proc(pid);
                let Some(s) = proc.cfg.try_stmt(sid) else { continue };
                let Some(p) = s.as_phi() else { continue };
                if p.num_filled() == 0 {
                    PhiPlan::Remove
                } else {
                    let lhs_sym = symbol_of(&symbol_map, &p.lhs, Some(sid));
                    let op_syms: Vec<Exp> = p
                        .filled()
                        .map(|op| symbol_of(&symbol_map, &op.exp, op.def))
                        .collect();
                    let first = op_syms[0].clone();
                    if op_syms.iter().all(|o| *o == first) {
                        if first == lhs_sym {
                            PhiPlan::Remove
                        } else {
                            PhiPlan::Copy(lhs_sym, first)
                        }
                    } else {
                        PhiPlan::Split(
                            lhs_sym,
                            p.ty.clone(),
                            p.filled()
                                .map(|op| (op.def, symbol_of(&symbol_map, &op.exp, op.def)))
                                .collect(),
                        )
                    }
                }
            };

            match plan {
                PhiPlan::Remove => prog.proc_mut(pid).remove_statement(sid),
                PhiPlan::Copy(lhs, rhs) => {
                    let ty = prog
                        .proc(pid)
                        .cfg
                        .try_stmt(sid)
                        .and_then(|s| s.as_phi())
                        .map(|p| p.ty.clone())
                        .unwrap_or(Type::Void);
                    prog.proc_mut(pid).cfg.stmt_mut(sid).kind =
                        StatementKind::Assign(Assign::typed(ty, lhs, rhs));
                }
                PhiPlan::Split(lhs, ty, ops) => {
                    // Insert a copy to a fresh temp at each operand's
                    // definition and let the phi become one copy.
                    let temp = prog.proc_mut(pid).new_local(ty.clone());
                    for (def, op_sym) in ops {
                        prog.proc_mut(pid)
                            .insert_assign_after(def, temp.clone(), op_sym);
                    }
                    prog.proc_mut(pid).cfg.stmt_mut(sid).kind =
                        StatementKind::Assign(Assign::typed(ty, lhs, temp));
                }
            }
        }

        // Parameters lose their subscripts last.
        let proc = prog.proc_mut(pid);
        for p in &mut proc.parameters {
            let lhs = std::mem::replace(&mut p.lhs, Exp::terminal(Operator::Nil));
            let (clean, _) = lhs.remove_subscripts();
            p.lhs = clean;
        }
    }

    /// Assign a symbol to every ref that still lacks one: refs of parameter
    /// locations map to the parameter, every other base gets one shared
    /// local.
    fn name_remaining_refs(&mut self, prog: &mut Prog, pid: ProcId) {
        let sids = prog.proc(pid).cfg.statements_in_order();
        let mut pending: Vec<(Exp, Exp)> = Vec::new();
        {
            let proc = prog.proc(pid);
            let param_of = |base: &Exp| -> Option<Exp> {
                proc.signature
                    .params
                    .iter()
                    .find(|p| &p.exp == base)
                    .map(|p| Exp::param(p.name.clone()))
            };
            let mut base_locals: HashMap<Exp, Exp> = HashMap::new();
            let mut next_local = proc.locals.len() as u32;
            let mut refs = Vec::new();
            for sid in &sids {
                let Some(s) = proc.cfg.try_stmt(*sid) else { continue };
                let mut used = ExpSet::new();
                s.add_used_locs(&mut used, false);
                for u in used.iter() {
                    if u.is_subscript() {
                        refs.push(u.clone());
                    }
                }
                let mut defs = ExpSet::new();
                s.get_definitions(&mut defs);
                for d in defs.iter() {
                    refs.push(Exp::subscript(d.clone(), *sid));
                }
            }
            for r in refs {
                if proc.symbol_map.contains_key(&r) {
                    continue;
                }
                if pending.iter().any(|(k, _)| k == &r) {
                    continue;
                }
                let Some((base, def)) = r.as_ref_parts() else { continue };
                if def.is_none() {
                    if let Some(p) = param_of(base) {
                        pending.push((r.clone(), p));
                        continue;
                    }
                }
                // One shared local per base, unless interference renamed a
                // specific ref already.
                let sym = if let Some(existing) = proc.lookup_sym_from_ref_any(&r) {
                    existing.clone()
                } else if let Some(l) = base_locals.get(base) {
                    l.clone()
                } else {
                    let name = format!("local{next_local}");
                    next_local += 1;
                    let l = Exp::local(name);
                    base_locals.insert(base.clone(), l.clone());
                    l
                };
                pending.push((r, sym));
            }
        }
        let proc = prog.proc_mut(pid);
        for (r, sym) in pending {
            if let Exp::Unary(Operator::Local, name) = &sym {
                if let Some(n) = name.str_value() {
                    if !proc.locals.contains_key(n) {
                        proc.locals.insert(n.to_string(), Type::Void);
                    }
                }
            }
            proc.map_symbol_to(r, sym);
        }
    }
}

enum PhiPlan {
    Remove,
    Copy(Exp, Exp),
    Split(Exp, Type, Vec<(Option<StmtId>, Exp)>),
}

fn symbol_of(map: &std::collections::BTreeMap<Exp, Exp>, base: &Exp, def: Option<StmtId>) -> Exp {
    let r = Exp::Ref(Box::new(base.clone()), def);
    if let Some(s) = map.get(&r) {
        return s.clone();
    }
    // Fall back to any mapping of the same base.
    for (k, v) in map {
        if let Some((kb, _)) = k.as_ref_parts() {
            if kb == base {
                return v.clone();
            }
        }
    }
    base.clone()
}

fn replace_refs_with_symbols(e: Exp, map: &std::collections::BTreeMap<Exp, Exp>) -> Exp {
    e.map_top_down(&mut |node| match &node {
        Exp::Ref(base, def) => {
            let sym = symbol_of(map, base, *def);
            (sym, false)
        }
        _ => (node, true),
    })
}

fn is_trivial(e: &Exp) -> bool {
    match e {
        Exp::Const(_) | Exp::Terminal(_) => true,
        Exp::Ref(base, _) => base.is_location(),
        e => e.is_location(),
    }
}

fn rhs_aliases_escaped(proc: &crate::proc::Procedure, rhs: &Exp) -> bool {
    let mut bad = false;
    rhs.visit(&mut |e| {
        if e.is_mem_of() && proc.is_addr_escaped(e) {
            bad = true;
        }
        !bad
    });
    bad
}

/// Recognise `m[T + x*4]` / `m[x*4 + T]` jump-table loads.
fn parse_jump_table(dest: &Exp) -> Option<(Exp, crate::Address)> {
    let Exp::Unary(Operator::MemOf, addr) = dest else { return None };
    let Exp::Binary(Operator::Plus, a, b) = addr.as_ref() else { return None };

    let scaled = |e: &Exp| -> Option<Exp> {
        match e {
            Exp::Binary(Operator::Mult, x, k) if k.int_value() == Some(4) => {
                Some((**x).clone())
            }
            Exp::Binary(Operator::Shl, x, k) if k.int_value() == Some(2) => {
                Some((**x).clone())
            }
            _ => None,
        }
    };

    if let (Some(table), Some(x)) = (a.int_value(), scaled(b)) {
        return Some((x, table as u64));
    }
    if let (Some(x), Some(table)) = (scaled(a), b.int_value()) {
        return Some((x, table as u64));
    }
    None
}

/// Find the `x <=u k` (or inverted `x >u k`) guard dominating the switch.
fn find_switch_bound(prog: &Prog, pid: ProcId, bid: BlockId, scrutinee: &Exp) -> Option<u32> {
    let proc = prog.proc(pid);
    for pred in &proc.cfg.block(bid).preds {
        let Some(sid) = proc.cfg.block(*pred).last_stmt() else { continue };
        let Some(b) = proc.cfg.try_stmt(sid).and_then(|s| s.as_branch()) else { continue };
        let stripped = |e: &Exp| -> Exp {
            match e.as_ref_parts() {
                Some((base, _)) => base.clone(),
                None => e.clone(),
            }
        };
        let scrut_base = stripped(scrutinee);
        match &b.cond {
            Exp::Binary(Operator::LessEqUns, x, k) if stripped(x) == scrut_base => {
                return k.int_value().map(|v| v as u32);
            }
            Exp::Binary(Operator::GreaterUns, x, k) if stripped(x) == scrut_base => {
                return k.int_value().map(|v| v as u32);
            }
            Exp::Binary(Operator::LessUns, x, k) if stripped(x) == scrut_base => {
                return k.int_value().map(|v| (v as u32).saturating_sub(1));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exp::Exp;

    #[test]
    fn test_parse_jump_table_forms() {
        let d = Exp::mem(Exp::binary(
            Operator::Plus,
            Exp::int(0x4000),
            Exp::binary(Operator::Mult, Exp::reg(24), Exp::int(4)),
        ));
        let (scrut, table) = parse_jump_table(&d).unwrap();
        assert_eq!(scrut, Exp::reg(24));
        assert_eq!(table, 0x4000);

        let d2 = Exp::mem(Exp::binary(
            Operator::Plus,
            Exp::binary(Operator::Shl, Exp::reg(24), Exp::int(2)),
            Exp::int(0x4000),
        ));
        assert!(parse_jump_table(&d2).is_some());

        let not = Exp::mem(Exp::reg(24));
        assert!(parse_jump_table(&not).is_none());
    }

    #[test]
    fn test_is_trivial() {
        assert!(is_trivial(&Exp::int(5)));
        assert!(is_trivial(&Exp::reg(24)));
        assert!(is_trivial(&Exp::subscript(Exp::reg(24), StmtId(1))));
        assert!(!is_trivial(&Exp::binary(
            Operator::Plus,
            Exp::reg(24),
            Exp::int(1)
        )));
    }
}
