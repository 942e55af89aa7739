//! The SSA engine: dominance frontiers, phi placement, renaming, liveness
//! and the connection graphs used by de-SSA.
//!
//! Renaming is the classic dominator-tree walk with a stack per location.
//! Memory locations are held back until the middle pipeline turns on
//! `rename_locals_params`; renaming them before their address expressions
//! settle would subscript the wrong thing.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::cfg::{BlockId, Cfg};
use crate::exp::{Exp, ExpSet};
use crate::operators::Operator;
use crate::stmt::{Assign, PhiAssign, StatementKind, StmtId};

/// Locations used upstream of a point: at a call they are candidate
/// arguments, at procedure entry they are candidate parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UseCollector {
    locs: ExpSet,
    pub initialised: bool,
}

impl UseCollector {
    pub fn new() -> Self {
        UseCollector::default()
    }

    pub fn insert(&mut self, e: Exp) {
        self.locs.insert(e);
    }

    pub fn exists(&self, e: &Exp) -> bool {
        self.locs.contains(e)
    }

    pub fn remove(&mut self, e: &Exp) -> bool {
        self.locs.remove(e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exp> {
        self.locs.iter()
    }

    pub fn len(&self) -> usize {
        self.locs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    pub fn clear(&mut self) {
        self.locs.clear();
        self.initialised = false;
    }

    /// Replace the set wholesale (liveness recomputation).
    pub fn set_locs(&mut self, locs: ExpSet) {
        self.locs = locs;
        self.initialised = true;
    }

    pub fn map(&mut self, f: &mut impl FnMut(Exp) -> Exp) {
        let old = std::mem::take(&mut self.locs);
        for e in old {
            self.locs.insert(f(e));
        }
    }
}

/// Definitions reaching a point, as assignments `loc := loc{def}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefCollector {
    defs: Vec<Assign>,
    pub initialised: bool,
}

impl DefCollector {
    pub fn new() -> Self {
        DefCollector::default()
    }

    /// Record a reaching definition; an existing entry for the same
    /// location wins (the collector keeps the first, as renaming refreshes
    /// it wholesale each pass).
    pub fn insert(&mut self, a: Assign) {
        if self.defs.iter().any(|d| d.lhs == a.lhs) {
            return;
        }
        self.defs.push(a);
    }

    /// The reaching-definition expression for `loc`.
    pub fn def_for(&self, loc: &Exp) -> Option<&Exp> {
        self.defs.iter().find(|d| &d.lhs == loc).map(|d| &d.rhs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Assign> {
        self.defs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Assign> {
        self.defs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn clear(&mut self) {
        self.defs.clear();
        self.initialised = false;
    }

    pub fn sort(&mut self) {
        self.defs.sort_by(|a, b| a.lhs.cmp(&b.lhs));
    }
}

/// Undirected graph over refs; used for interference and phi-unites.
#[derive(Debug, Clone, Default)]
pub struct ConnectionGraph {
    edges: Vec<(Exp, Exp)>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        ConnectionGraph::default()
    }

    pub fn connect(&mut self, a: &Exp, b: &Exp) {
        if a == b || self.is_connected(a, b) {
            return;
        }
        self.edges.push((a.clone(), b.clone()));
    }

    pub fn is_connected(&self, a: &Exp, b: &Exp) -> bool {
        self.edges
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Exp, Exp)> {
        self.edges.iter()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Dominance and renaming state for one procedure.
#[derive(Debug, Clone, Default)]
pub struct DataFlow {
    /// Reverse post-order of reachable blocks; indices below refer into it.
    pub bb_order: Vec<BlockId>,
    index_of: HashMap<BlockId, usize>,
    /// Immediate dominator, as an index into `bb_order`.
    pub idom: Vec<usize>,
    /// Dominance frontier per node.
    pub frontier: Vec<BTreeSet<usize>>,
    /// Dominator-tree children per node.
    pub dom_children: Vec<Vec<usize>>,
    /// Gate for renaming memory and global locations.
    pub rename_locals_params: bool,
    stacks: HashMap<Exp, Vec<StmtId>>,
}

impl DataFlow {
    pub fn new() -> Self {
        DataFlow::default()
    }

    pub fn set_rename_locals_params(&mut self, on: bool) {
        self.rename_locals_params = on;
    }

    /// Can this location get an SSA subscript yet?
    pub fn can_rename(&self, e: &Exp) -> bool {
        match e {
            Exp::Unary(Operator::RegOf, _)
            | Exp::Unary(Operator::Temp, _)
            | Exp::Unary(Operator::Local, _)
            | Exp::Unary(Operator::Param, _) => true,
            Exp::Unary(Operator::MemOf, _) | Exp::Unary(Operator::Global, _) => {
                self.rename_locals_params
            }
            Exp::Terminal(op) => matches!(
                op,
                Operator::Flags
                    | Operator::FFlags
                    | Operator::CarryFlag
                    | Operator::ZeroFlag
                    | Operator::Pc
            ),
            _ => false,
        }
    }

    pub fn index_of(&self, b: BlockId) -> Option<usize> {
        self.index_of.get(&b).copied()
    }

    // ---- dominators (Cooper–Harvey–Kennedy) --------------------------------

    /// Compute reverse post-order, immediate dominators and dominance
    /// frontiers for the forward CFG from the entry.
    pub fn compute_dominators(&mut self, cfg: &Cfg) {
        self.bb_order.clear();
        self.index_of.clear();
        let Some(entry) = cfg.entry else { return };

        // Post-order DFS, then reverse.
        let mut post = Vec::new();
        let mut visited: BTreeSet<BlockId> = BTreeSet::new();
        let mut stack = vec![(entry, 0usize)];
        visited.insert(entry);
        while let Some((node, child)) = stack.pop() {
            let succs = cfg.block(node).succs.clone();
            if child < succs.len() {
                stack.push((node, child + 1));
                let s = succs[child];
                if visited.insert(s) {
                    stack.push((s, 0));
                }
            } else {
                post.push(node);
            }
        }
        post.reverse();
        self.bb_order = post;
        for (i, b) in self.bb_order.iter().enumerate() {
            self.index_of.insert(*b, i);
        }

        let n = self.bb_order.len();
        let undefined = usize::MAX;
        self.idom = vec![undefined; n];
        if n == 0 {
            return;
        }
        self.idom[0] = 0;

        let intersect = |idom: &[usize], mut a: usize, mut b: usize| -> usize {
            while a != b {
                while a > b {
                    a = idom[a];
                }
                while b > a {
                    b = idom[b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..n {
                let block = self.bb_order[i];
                let mut new_idom = undefined;
                for p in &cfg.block(block).preds {
                    let Some(pi) = self.index_of(*p) else { continue };
                    if self.idom[pi] == undefined && pi != 0 {
                        continue;
                    }
                    new_idom = if new_idom == undefined {
                        pi
                    } else {
                        intersect(&self.idom, pi, new_idom)
                    };
                }
                if new_idom != undefined && self.idom[i] != new_idom {
                    self.idom[i] = new_idom;
                    changed = true;
                }
            }
        }

        // Dominance frontiers.
        self.frontier = vec![BTreeSet::new(); n];
        for i in 0..n {
            let block = self.bb_order[i];
            let preds: Vec<usize> = cfg
                .block(block)
                .preds
                .iter()
                .filter_map(|p| self.index_of(*p))
                .collect();
            if preds.len() < 2 {
                continue;
            }
            for p in preds {
                let mut runner = p;
                while runner != self.idom[i] {
                    self.frontier[runner].insert(i);
                    if runner == 0 {
                        break;
                    }
                    runner = self.idom[runner];
                }
            }
        }

        // Dominator-tree children.
        self.dom_children = vec![Vec::new(); n];
        for i in 1..n {
            let d = self.idom[i];
            if d != undefined {
                self.dom_children[d].push(i);
            }
        }
    }

    // ---- phi placement -----------------------------------------------------

    /// True when the recorded ordering no longer matches the CFG (blocks
    /// were merged or removed since dominators were computed).
    fn is_stale(&self, cfg: &Cfg) -> bool {
        self.bb_order.is_empty() && cfg.entry.is_some()
            || self.bb_order.iter().any(|b| !cfg.has_block(*b))
    }

    /// Insert phi-assignments at the dominance frontier of every definition
    /// site. Returns true when any phi was added.
    pub fn place_phi_functions(&mut self, cfg: &mut Cfg) -> bool {
        if self.is_stale(cfg) {
            self.compute_dominators(cfg);
        }
        let mut defsites: HashMap<Exp, BTreeSet<usize>> = HashMap::new();
        for (i, bid) in self.bb_order.iter().enumerate() {
            for sid in cfg.block(*bid).stmt_ids().collect::<Vec<_>>() {
                let Some(s) = cfg.try_stmt(sid) else { continue };
                let mut defs = ExpSet::new();
                s.get_definitions(&mut defs);
                for d in defs.iter() {
                    // Strip any subscript: phis are placed on base locations.
                    let base = match d {
                        Exp::Ref(b, _) => (**b).clone(),
                        other => other.clone(),
                    };
                    if self.can_rename(&base) {
                        defsites.entry(base).or_default().insert(i);
                    }
                }
            }
        }

        let mut changed = false;
        let mut locs: Vec<Exp> = defsites.keys().cloned().collect();
        locs.sort();
        for loc in locs {
            let sites = defsites.get(&loc).cloned().unwrap_or_default();
            let mut work: Vec<usize> = sites.iter().copied().collect();
            let mut has_phi: BTreeSet<usize> = BTreeSet::new();
            let mut ever_on_work: BTreeSet<usize> = work.iter().copied().collect();
            while let Some(n) = work.pop() {
                for y in self.frontier[n].clone() {
                    if has_phi.contains(&y) {
                        continue;
                    }
                    let bid = self.bb_order[y];
                    if block_has_phi_for(cfg, bid, &loc) {
                        has_phi.insert(y);
                        continue;
                    }
                    let preds = cfg.block(bid).preds.clone();
                    let phi = PhiAssign::new(loc.clone(), &preds);
                    let sid = cfg.add_stmt(StatementKind::Phi(phi));
                    cfg.stmt_mut(sid).bb = bid;
                    prepend_stmt(cfg, bid, sid);
                    debug!("placed phi for {} in block {}", loc, bid);
                    has_phi.insert(y);
                    changed = true;
                    if ever_on_work.insert(y) {
                        work.push(y);
                    }
                }
            }
        }
        changed
    }

    // ---- renaming ----------------------------------------------------------

    /// Rename block variables over the dominator tree. `entry_uses` receives
    /// locations that reach the entry undefined (the initial parameters).
    /// Returns true when any subscript changed.
    pub fn rename_block_vars(
        &mut self,
        cfg: &mut Cfg,
        entry_uses: &mut UseCollector,
        clear_stacks: bool,
    ) -> bool {
        if self.is_stale(cfg) {
            self.compute_dominators(cfg);
        }
        if self.bb_order.is_empty() {
            return false;
        }
        if clear_stacks {
            self.stacks.clear();
        }
        let mut changed = false;
        self.rename_node(cfg, 0, entry_uses, &mut changed);
        changed
    }

    fn rename_node(
        &mut self,
        cfg: &mut Cfg,
        n: usize,
        entry_uses: &mut UseCollector,
        changed: &mut bool,
    ) {
        let bid = self.bb_order[n];
        let mut pushed: Vec<Exp> = Vec::new();

        for sid in cfg.block(bid).stmt_ids().collect::<Vec<_>>() {
            let Some(mut s) = cfg.stmts.take(sid) else { continue };
            let before = s.clone();

            if !s.is_phi() {
                s.map_use_exps(&mut |e| self.rename_exp(e, entry_uses));
            } else {
                // Only the address inside a memof lhs is renamed here; the
                // operands are filled from the predecessors below.
                s.map_use_exps(&mut |e| self.rename_exp(e, entry_uses));
            }

            // Reaching definitions snapshot for calls and returns. The
            // collectors fill once; afterwards propagation keeps their
            // right sides current, and entries survive the removal of
            // their defining statements (values already propagated in).
            match &mut s.kind {
                StatementKind::Call(c) => {
                    if !c.def_col.initialised {
                        for (loc, stack) in sorted_stacks(&self.stacks) {
                            if let Some(top) = stack.last() {
                                c.def_col.insert(Assign::new(
                                    loc.clone(),
                                    Exp::subscript(loc.clone(), *top),
                                ));
                            }
                        }
                        c.def_col.sort();
                        c.def_col.initialised = true;
                    }
                }
                StatementKind::Ret(r) => {
                    if !r.col.initialised {
                        for (loc, stack) in sorted_stacks(&self.stacks) {
                            if let Some(top) = stack.last() {
                                r.col.insert(Assign::new(
                                    loc.clone(),
                                    Exp::subscript(loc.clone(), *top),
                                ));
                            }
                        }
                        r.col.sort();
                        r.col.initialised = true;
                    }
                }
                _ => {}
            }

            // Push definitions.
            let mut defs = ExpSet::new();
            s.get_definitions(&mut defs);
            for d in defs {
                if self.can_rename(&d) {
                    self.stacks.entry(d.clone()).or_default().push(sid);
                    pushed.push(d);
                }
            }

            if s != before {
                *changed = true;
            }
            cfg.stmts.put_back(s);
        }

        // Fill phi operands in the successors.
        for succ in cfg.block(bid).succs.clone() {
            for psid in cfg.block(succ).stmt_ids().collect::<Vec<_>>() {
                let lhs = match cfg.try_stmt(psid).and_then(|s| s.as_phi()) {
                    Some(p) => p.lhs.clone(),
                    None => continue,
                };
                if !self.can_rename(&lhs) {
                    continue;
                }
                let top = self.stacks.get(&lhs).and_then(|s| s.last()).copied();
                if let Some(p) = cfg.stmt_mut(psid).as_phi_mut() {
                    let old = p
                        .operands
                        .iter()
                        .find(|(b, _)| *b == bid)
                        .and_then(|(_, op)| op.clone());
                    p.set_operand(bid, lhs.clone(), top);
                    let new = p
                        .operands
                        .iter()
                        .find(|(b, _)| *b == bid)
                        .and_then(|(_, op)| op.clone());
                    if old != new {
                        *changed = true;
                    }
                }
            }
        }

        for child in self.dom_children[n].clone() {
            self.rename_node(cfg, child, entry_uses, changed);
        }

        for d in pushed {
            if let Some(stack) = self.stacks.get_mut(&d) {
                stack.pop();
            }
        }
    }

    /// Rename uses inside one expression. Existing refs are left alone;
    /// memof addresses rename before the memof itself.
    fn rename_exp(&mut self, e: Exp, entry_uses: &mut UseCollector) -> Exp {
        match e {
            Exp::Ref(base, def) => Exp::Ref(base, def),
            Exp::Unary(Operator::MemOf, addr) => {
                let addr = self.rename_exp(*addr, entry_uses);
                let m = Exp::mem(addr);
                self.subscript_loc(m, entry_uses)
            }
            e @ (Exp::Unary(Operator::RegOf, _)
            | Exp::Unary(Operator::Temp, _)
            | Exp::Unary(Operator::Local, _)
            | Exp::Unary(Operator::Param, _)
            | Exp::Unary(Operator::Global, _)
            | Exp::Terminal(_)) => self.subscript_loc(e, entry_uses),
            Exp::Unary(op, a) => Exp::Unary(op, Box::new(self.rename_exp(*a, entry_uses))),
            Exp::Binary(op, a, b) => Exp::Binary(
                op,
                Box::new(self.rename_exp(*a, entry_uses)),
                Box::new(self.rename_exp(*b, entry_uses)),
            ),
            Exp::Ternary(op, a, b, c) => Exp::Ternary(
                op,
                Box::new(self.rename_exp(*a, entry_uses)),
                Box::new(self.rename_exp(*b, entry_uses)),
                Box::new(self.rename_exp(*c, entry_uses)),
            ),
            Exp::Typed(ty, a) => Exp::Typed(ty, Box::new(self.rename_exp(*a, entry_uses))),
            Exp::FlagCall(name, args) => Exp::FlagCall(
                name,
                args.into_iter()
                    .map(|a| self.rename_exp(a, entry_uses))
                    .collect(),
            ),
            e => e,
        }
    }

    fn subscript_loc(&mut self, loc: Exp, entry_uses: &mut UseCollector) -> Exp {
        if !self.can_rename(&loc) {
            return loc;
        }
        match self.stacks.get(&loc).and_then(|s| s.last()).copied() {
            Some(def) => Exp::subscript(loc, def),
            None => {
                let r = Exp::subscript_implicit(loc);
                entry_uses.insert(r.clone());
                r
            }
        }
    }
}

fn sorted_stacks(stacks: &HashMap<Exp, Vec<StmtId>>) -> Vec<(&Exp, &Vec<StmtId>)> {
    let mut v: Vec<(&Exp, &Vec<StmtId>)> = stacks.iter().collect();
    v.sort_by(|a, b| a.0.cmp(b.0));
    v
}

fn block_has_phi_for(cfg: &Cfg, bid: BlockId, loc: &Exp) -> bool {
    cfg.block(bid).stmt_ids().any(|sid| {
        cfg.try_stmt(sid)
            .and_then(|s| s.as_phi())
            .map(|p| &p.lhs == loc)
            .unwrap_or(false)
    })
}

/// Insert a synthetic statement at the very front of a block.
pub fn prepend_stmt(cfg: &mut Cfg, bid: BlockId, sid: StmtId) {
    let bb = cfg.block_mut(bid);
    if let Some(first) = bb.rtls.first_mut() {
        if first.is_synthetic() {
            first.stmts.insert(0, sid);
            return;
        }
    }
    bb.rtls.insert(0, crate::rtl::Rtl::with_stmts(0, vec![sid]));
}

// ---- liveness and interference ---------------------------------------------

/// Cap on liveness iterations; beyond it the analysis stops with a warning.
const LIVENESS_CAP: usize = 100_000;

/// Backward liveness over refs. Fills every call's use collector with the
/// locations live after it, and connects same-base refs that are live
/// together into `ig`.
pub fn find_interferences(cfg: &mut Cfg, ig: &mut ConnectionGraph) {
    let order = cfg.block_ids_by_address();
    let mut live_in: HashMap<BlockId, ExpSet> = HashMap::new();
    let mut rounds = 0usize;

    loop {
        let mut changed = false;
        for bid in order.iter().rev() {
            rounds += 1;
            if rounds > LIVENESS_CAP {
                warn!("liveness exceeded its iteration cap; results may be partial");
                return;
            }
            let mut live = ExpSet::new();
            for s in cfg.block(*bid).succs.clone() {
                if let Some(li) = live_in.get(&s) {
                    live.extend_from(li);
                }
                // Phi operands contribute to this predecessor only.
                for psid in cfg.block(s).stmt_ids().collect::<Vec<_>>() {
                    if let Some(p) = cfg.try_stmt(psid).and_then(|x| x.as_phi()) {
                        for (pred, op) in &p.operands {
                            if *pred == *bid {
                                if let Some(op) = op {
                                    live.insert(op.as_ref_exp());
                                }
                            }
                        }
                    }
                }
            }

            let stmt_ids: Vec<StmtId> = cfg.block(*bid).stmt_ids().collect();
            for sid in stmt_ids.iter().rev() {
                let Some(mut s) = cfg.stmts.take(*sid) else { continue };

                if let StatementKind::Call(c) = &mut s.kind {
                    c.use_col.set_locs(live.clone());
                }

                // Kill: refs defined here die above this point.
                let mut defs = ExpSet::new();
                s.get_definitions(&mut defs);
                for d in defs.iter() {
                    let killed: Vec<Exp> = live
                        .iter()
                        .filter(|r| match r {
                            Exp::Ref(base, def) => {
                                def == &Some(*sid) && base.as_ref() == d
                            }
                            _ => false,
                        })
                        .cloned()
                        .collect();
                    for k in killed {
                        live.remove(&k);
                    }
                }

                // Gen: uses become live; same-base overlaps interfere.
                let mut used = ExpSet::new();
                s.add_used_locs(&mut used, false);
                for u in used.iter() {
                    if !u.is_subscript() {
                        continue;
                    }
                    for l in live.iter() {
                        if let (Exp::Ref(b1, d1), Exp::Ref(b2, d2)) = (u, l) {
                            if b1 == b2 && d1 != d2 {
                                ig.connect(u, l);
                            }
                        }
                    }
                    live.insert(u.clone());
                }
                cfg.stmts.put_back(s);
            }

            // Phi lhs defs kill at the top of the block.
            let entry = live_in.entry(*bid).or_default();
            if *entry != live {
                *entry = live;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Connect each phi destination ref with all of its operand refs: these
/// want the same local name after de-SSA.
pub fn find_phi_unites(cfg: &Cfg, pu: &mut ConnectionGraph) {
    for sid in cfg.statements_in_order() {
        let Some(s) = cfg.try_stmt(sid) else { continue };
        let Some(p) = s.as_phi() else { continue };
        let lhs_ref = Exp::subscript(p.lhs.clone(), sid);
        for op in p.filled() {
            pu.connect(&lhs_ref, &op.as_ref_exp());
        }
    }
}

/// Refs consumed by phi functions; propagation must not rewrite these away.
pub fn find_live_at_dom_phi(cfg: &Cfg, used_by_dom_phi: &mut ExpSet) {
    for sid in cfg.statements_in_order() {
        let Some(s) = cfg.try_stmt(sid) else { continue };
        if let Some(p) = s.as_phi() {
            for op in p.filled() {
                used_by_dom_phi.insert(op.as_ref_exp());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::BbKind;
    use crate::rtl::Rtl;
    use crate::stmt::Assign;

    fn assign(cfg: &mut Cfg, lhs: Exp, rhs: Exp) -> StmtId {
        cfg.add_stmt(StatementKind::Assign(Assign::new(lhs, rhs)))
    }

    /// if-diamond defining r24 on both arms.
    fn diamond_cfg() -> (Cfg, DataFlow, BlockId, BlockId, BlockId, BlockId) {
        let mut cfg = Cfg::new();
        let s0 = assign(&mut cfg, Exp::reg(24), Exp::int(1));
        let b0 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![s0])], BbKind::Twoway)
            .block();
        let s1 = assign(&mut cfg, Exp::reg(24), Exp::int(2));
        let b1 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1010, vec![s1])], BbKind::Fall)
            .block();
        let s2 = assign(&mut cfg, Exp::reg(24), Exp::int(3));
        let b2 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1020, vec![s2])], BbKind::Fall)
            .block();
        let s3 = assign(&mut cfg, Exp::reg(25), Exp::reg(24));
        let b3 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1030, vec![s3])], BbKind::Ret)
            .block();
        cfg.add_edge(b0, b1);
        cfg.add_edge(b0, b2);
        cfg.add_edge(b1, b3);
        cfg.add_edge(b2, b3);
        cfg.set_entry_and_exit(b0);

        let mut df = DataFlow::new();
        df.compute_dominators(&cfg);
        (cfg, df, b0, b1, b2, b3)
    }

    #[test]
    fn test_dominators_of_diamond() {
        let (_cfg, df, b0, b1, b2, b3) = diamond_cfg();
        let i0 = df.index_of(b0).unwrap();
        let i1 = df.index_of(b1).unwrap();
        let i2 = df.index_of(b2).unwrap();
        let i3 = df.index_of(b3).unwrap();
        assert_eq!(df.idom[i1], i0);
        assert_eq!(df.idom[i2], i0);
        assert_eq!(df.idom[i3], i0);
        // The join is in the frontier of both arms.
        assert!(df.frontier[i1].contains(&i3));
        assert!(df.frontier[i2].contains(&i3));
    }

    #[test]
    fn test_phi_placed_at_join() {
        let (mut cfg, mut df, _b0, _b1, _b2, b3) = diamond_cfg();
        assert!(df.place_phi_functions(&mut cfg));
        let phis: Vec<StmtId> = cfg
            .block(b3)
            .stmt_ids()
            .filter(|sid| cfg.stmt(*sid).is_phi())
            .collect();
        assert_eq!(phis.len(), 1);
        let p = cfg.stmt(phis[0]).as_phi().unwrap();
        assert_eq!(p.lhs, Exp::reg(24));
        assert_eq!(p.operands.len(), 2);
        // Placement is idempotent.
        assert!(!df.place_phi_functions(&mut cfg));
    }

    #[test]
    fn test_renaming_points_uses_at_reaching_defs() {
        let (mut cfg, mut df, _b0, b1, b2, b3) = diamond_cfg();
        df.place_phi_functions(&mut cfg);
        let mut entry_uses = UseCollector::new();
        df.rename_block_vars(&mut cfg, &mut entry_uses, true);

        let phi_id = cfg
            .block(b3)
            .stmt_ids()
            .find(|sid| cfg.stmt(*sid).is_phi())
            .unwrap();
        let p = cfg.stmt(phi_id).as_phi().unwrap();
        // Each operand refers to the def on its own arm.
        let def_of = |b: BlockId| {
            cfg.block(b)
                .stmt_ids()
                .find(|sid| cfg.stmt(*sid).is_assign())
                .unwrap()
        };
        for (pred, op) in &p.operands {
            let op = op.as_ref().expect("operand filled");
            assert_eq!(op.def, Some(def_of(*pred)));
        }
        let _ = (b1, b2);

        // The use in the ret block refers to the phi.
        let use_stmt = cfg
            .block(b3)
            .stmt_ids()
            .find(|sid| cfg.stmt(*sid).is_assign())
            .unwrap();
        let a = cfg.stmt(use_stmt).as_assign().unwrap();
        assert_eq!(a.rhs, Exp::subscript(Exp::reg(24), phi_id));
    }

    #[test]
    fn test_unrenamed_uses_reach_entry_collector() {
        let mut cfg = Cfg::new();
        let s0 = assign(&mut cfg, Exp::reg(25), Exp::reg(24));
        let b0 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![s0])], BbKind::Ret)
            .block();
        cfg.set_entry_and_exit(b0);
        let mut df = DataFlow::new();
        df.compute_dominators(&cfg);
        let mut entry_uses = UseCollector::new();
        df.rename_block_vars(&mut cfg, &mut entry_uses, true);
        assert!(entry_uses.exists(&Exp::subscript_implicit(Exp::reg(24))));
    }

    #[test]
    fn test_memofs_not_renamed_until_enabled() {
        let mut cfg = Cfg::new();
        let m = Exp::mem(Exp::reg(28));
        let s0 = assign(&mut cfg, Exp::reg(24), m.clone());
        let b0 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![s0])], BbKind::Ret)
            .block();
        cfg.set_entry_and_exit(b0);
        let mut df = DataFlow::new();
        df.compute_dominators(&cfg);
        let mut entry_uses = UseCollector::new();
        df.rename_block_vars(&mut cfg, &mut entry_uses, true);

        let rhs = &cfg.stmt(s0).as_assign().unwrap().rhs;
        // The address got a subscript, the memof itself did not.
        assert_eq!(
            *rhs,
            Exp::mem(Exp::subscript_implicit(Exp::reg(28)))
        );

        df.set_rename_locals_params(true);
        let mut entry_uses = UseCollector::new();
        df.rename_block_vars(&mut cfg, &mut entry_uses, true);
        let rhs = &cfg.stmt(s0).as_assign().unwrap().rhs;
        assert_eq!(
            *rhs,
            Exp::subscript_implicit(Exp::mem(Exp::subscript_implicit(Exp::reg(28))))
        );
    }

    #[test]
    fn test_interference_between_overlapping_versions() {
        // r24 := 1; r25 := r24{a}; r24 := 2; r26 := r24{a} + r24{c}
        // Forced overlap: the first version is used after the second def.
        let mut cfg = Cfg::new();
        let a = assign(&mut cfg, Exp::reg(24), Exp::int(1));
        let b = assign(&mut cfg, Exp::reg(24), Exp::int(2));
        let c = assign(
            &mut cfg,
            Exp::reg(26),
            Exp::binary(
                Operator::Plus,
                Exp::subscript(Exp::reg(24), a),
                Exp::subscript(Exp::reg(24), b),
            ),
        );
        let b0 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![a, b, c])], BbKind::Ret)
            .block();
        cfg.set_entry_and_exit(b0);

        let mut ig = ConnectionGraph::new();
        find_interferences(&mut cfg, &mut ig);
        assert!(ig.is_connected(
            &Exp::subscript(Exp::reg(24), a),
            &Exp::subscript(Exp::reg(24), b)
        ));
    }
}
