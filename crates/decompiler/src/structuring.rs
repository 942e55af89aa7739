//! Control-flow structuring.
//!
//! Runs once data flow is stable: stamps the graph with traversal intervals,
//! computes immediate post-dominators, then classifies conditionals and
//! natural loops and picks their follow nodes. Jumps that defeat structuring
//! are annotated so the emitter can fall back to gotos for just those edges.

use tracing::{debug, warn};

use crate::cfg::{BbKind, BlockId, Cfg};

/// Index of the taken edge of a two-way block.
pub const BTHEN: usize = 0;
/// Index of the fall-through edge of a two-way block.
pub const BELSE: usize = 1;

/// Give up walking post-dominator chains after this many steps.
const PDOM_GIVEUP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StructType {
    #[default]
    Seq,
    Cond,
    Loop,
    LoopCond,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    PreTested,
    PostTested,
    Endless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondType {
    IfThen,
    IfElse,
    IfThenElse,
    Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnstructType {
    #[default]
    Structured,
    JumpInOutLoop,
    JumpIntoCase,
}

/// Per-block structuring metadata.
#[derive(Debug, Clone, Default)]
pub struct StructInfo {
    /// Index in the forward post-ordering.
    pub ord: i32,
    /// Index in the reverse post-ordering.
    pub rev_ord: i32,
    /// DFS interval stamps (entry/exit times) for ancestry tests.
    pub loop_stamps: [i32; 2],
    /// Interval stamps of the reversed-edge-order DFS.
    pub rev_loop_stamps: [i32; 2],
    pub imm_pdom: Option<BlockId>,
    pub loop_head: Option<BlockId>,
    pub case_head: Option<BlockId>,
    pub cond_follow: Option<BlockId>,
    pub loop_follow: Option<BlockId>,
    pub latch: Option<BlockId>,
    pub struct_type: StructType,
    pub loop_type: Option<LoopType>,
    pub cond_type: Option<CondType>,
    pub unstruct_type: UnstructType,
}

/// True when `a`'s traversal interval encloses `b`'s (so `a` is an ancestor
/// of `b` in one of the DFS trees).
pub fn is_ancestor_of(cfg: &Cfg, a: BlockId, b: BlockId) -> bool {
    let sa = &cfg.block(a).sinfo;
    let sb = &cfg.block(b).sinfo;
    (sa.loop_stamps[0] < sb.loop_stamps[0] && sa.loop_stamps[1] > sb.loop_stamps[1])
        || (sa.rev_loop_stamps[0] < sb.rev_loop_stamps[0]
            && sa.rev_loop_stamps[1] > sb.rev_loop_stamps[1])
}

/// True when `b` has a back edge to `dest`.
pub fn has_back_edge_to(cfg: &Cfg, b: BlockId, dest: BlockId) -> bool {
    b == dest || is_ancestor_of(cfg, dest, b)
}

/// True when `b` is the source of any back edge.
pub fn has_back_edge(cfg: &Cfg, b: BlockId) -> bool {
    cfg.block(b)
        .succs
        .iter()
        .any(|s| has_back_edge_to(cfg, b, *s))
}

/// Loop membership test used when tagging nodes between header and latch.
fn in_loop(cfg: &Cfg, node: BlockId, header: BlockId, latch: BlockId) -> bool {
    if node == latch {
        return true;
    }
    let sn = &cfg.block(node).sinfo;
    let sh = &cfg.block(header).sinfo;
    let sl = &cfg.block(latch).sinfo;
    let fwd = sh.loop_stamps[0] < sn.loop_stamps[0]
        && sn.loop_stamps[1] < sh.loop_stamps[1]
        && sn.loop_stamps[0] < sl.loop_stamps[0]
        && sl.loop_stamps[1] < sn.loop_stamps[1];
    let rev = sl.rev_loop_stamps[0] < sn.rev_loop_stamps[0]
        && sn.rev_loop_stamps[1] < sl.rev_loop_stamps[1]
        && sn.rev_loop_stamps[0] < sh.rev_loop_stamps[0]
        && sh.rev_loop_stamps[1] < sn.rev_loop_stamps[1];
    fwd || rev
}

// ---- stamping --------------------------------------------------------------

fn stamp_loops(cfg: &mut Cfg, node: BlockId, time: &mut i32, visited: &mut Vec<bool>) {
    visited[node.0 as usize] = true;
    cfg.block_mut(node).sinfo.loop_stamps[0] = *time;
    *time += 1;
    for s in cfg.block(node).succs.clone() {
        if !visited[s.0 as usize] {
            stamp_loops(cfg, s, time, visited);
        }
    }
    cfg.block_mut(node).sinfo.loop_stamps[1] = *time;
    *time += 1;
    let ord = cfg.ordering.len() as i32;
    cfg.block_mut(node).sinfo.ord = ord;
    cfg.ordering.push(node);
}

fn stamp_rev_loops(cfg: &mut Cfg, node: BlockId, time: &mut i32, visited: &mut Vec<bool>) {
    visited[node.0 as usize] = true;
    cfg.block_mut(node).sinfo.rev_loop_stamps[0] = *time;
    *time += 1;
    let mut succs = cfg.block(node).succs.clone();
    succs.reverse();
    for s in succs {
        if !visited[s.0 as usize] {
            stamp_rev_loops(cfg, s, time, visited);
        }
    }
    cfg.block_mut(node).sinfo.rev_loop_stamps[1] = *time;
    *time += 1;
}

fn build_rev_order(cfg: &mut Cfg, node: BlockId, visited: &mut Vec<bool>) {
    visited[node.0 as usize] = true;
    for p in cfg.block(node).preds.clone() {
        if !visited[p.0 as usize] {
            build_rev_order(cfg, p, visited);
        }
    }
    let ord = cfg.rev_ordering.len() as i32;
    cfg.block_mut(node).sinfo.rev_ord = ord;
    cfg.rev_ordering.push(node);
}

/// Step 1: loop stamps, reverse loop stamps, forward and reverse orderings.
pub fn set_time_stamps(cfg: &mut Cfg) {
    let Some(entry) = cfg.entry else { return };
    let Some(ret) = cfg.find_ret_node() else { return };
    let nslots = cfg.block_ids().iter().map(|b| b.0 as usize + 1).max().unwrap_or(0);

    cfg.ordering.clear();
    let mut time = 1;
    let mut visited = vec![false; nslots];
    stamp_loops(cfg, entry, &mut time, &mut visited);

    let mut time = 1;
    let mut visited = vec![false; nslots];
    stamp_rev_loops(cfg, entry, &mut time, &mut visited);

    cfg.rev_ordering.clear();
    let mut visited = vec![false; nslots];
    build_rev_order(cfg, ret, &mut visited);
}

// ---- post dominators -------------------------------------------------------

fn common_pdom(cfg: &Cfg, cur: Option<BlockId>, succ: Option<BlockId>) -> Option<BlockId> {
    let mut cur = match cur {
        None => return succ,
        Some(c) => c,
    };
    let mut succ = match succ {
        None => return Some(cur),
        Some(s) => s,
    };
    if cfg.block(cur).sinfo.rev_ord == cfg.block(succ).sinfo.rev_ord {
        return Some(cur);
    }
    let original = cur;
    let mut steps = 0;
    while cur != succ {
        if steps >= PDOM_GIVEUP {
            debug!("gave up finding common post-dominator");
            return Some(original);
        }
        steps += 1;
        if cfg.block(cur).sinfo.rev_ord > cfg.block(succ).sinfo.rev_ord {
            match cfg.block(succ).sinfo.imm_pdom {
                Some(next) => succ = next,
                None => return Some(cur),
            }
        } else {
            match cfg.block(cur).sinfo.imm_pdom {
                Some(next) => cur = next,
                None => return Some(succ),
            }
        }
    }
    Some(cur)
}

/// Step 2: immediate post-dominators, with the loop fix-up passes.
pub fn update_immed_pdom(cfg: &mut Cfg) {
    // Bottom-up over the reverse ordering.
    for i in (0..cfg.rev_ordering.len()).rev() {
        let cur = cfg.rev_ordering[i];
        for succ in cfg.block(cur).succs.clone() {
            if cfg.block(succ).sinfo.rev_ord > cfg.block(cur).sinfo.rev_ord {
                let merged = common_pdom(cfg, cfg.block(cur).sinfo.imm_pdom, Some(succ));
                cfg.block_mut(cur).sinfo.imm_pdom = merged;
            }
        }
    }

    // Second pass in the forward ordering, branches only.
    for i in 0..cfg.ordering.len() {
        let cur = cfg.ordering[i];
        if cfg.block(cur).succs.len() <= 1 {
            continue;
        }
        for succ in cfg.block(cur).succs.clone() {
            let merged = common_pdom(cfg, cfg.block(cur).sinfo.imm_pdom, Some(succ));
            cfg.block_mut(cur).sinfo.imm_pdom = merged;
        }
    }

    // Final fix-up for nodes involved in loops.
    for i in 0..cfg.ordering.len() {
        let cur = cfg.ordering[i];
        if cfg.block(cur).succs.len() <= 1 {
            continue;
        }
        for succ in cfg.block(cur).succs.clone() {
            let succ_ipdom = cfg.block(succ).sinfo.imm_pdom;
            let cur_ipdom = cfg.block(cur).sinfo.imm_pdom;
            let use_succ_chain = has_back_edge_to(cfg, cur, succ)
                && cfg.block(cur).succs.len() > 1
                && succ_ipdom.is_some()
                && matches!((succ_ipdom, cur_ipdom), (Some(a), Some(b))
                    if cfg.block(a).sinfo.ord < cfg.block(b).sinfo.ord);
            let merged = if use_succ_chain {
                common_pdom(cfg, succ_ipdom, cur_ipdom)
            } else {
                common_pdom(cfg, cur_ipdom, Some(succ))
            };
            cfg.block_mut(cur).sinfo.imm_pdom = merged;
        }
    }
}

// ---- conditionals ----------------------------------------------------------

/// Tag the nodes of a case body with their head, stopping at the follow.
fn set_case_head(cfg: &mut Cfg, node: BlockId, head: BlockId, follow: Option<BlockId>) {
    if cfg.block(node).sinfo.case_head.is_some() || Some(node) == follow {
        return;
    }
    cfg.block_mut(node).sinfo.case_head = Some(head);
    for s in cfg.block(node).succs.clone() {
        set_case_head(cfg, s, head, follow);
    }
}

/// Step 3: multi-way nodes become conditional headers; their follow is the
/// immediate post-dominator.
pub fn struct_conds(cfg: &mut Cfg) {
    for i in 0..cfg.ordering.len() {
        let cur = cfg.ordering[i];
        if cfg.block(cur).succs.len() <= 1 {
            continue;
        }

        // A two-way header that is itself a back-edge source gets no follow.
        if has_back_edge(cfg, cur) && cfg.block(cur).kind == BbKind::Twoway {
            cfg.block_mut(cur).sinfo.struct_type = StructType::Cond;
            continue;
        }

        let ipdom = cfg.block(cur).sinfo.imm_pdom;
        let is_case = matches!(cfg.block(cur).kind, BbKind::Nway | BbKind::CompJump);
        {
            let si = &mut cfg.block_mut(cur).sinfo;
            si.cond_follow = ipdom;
            si.struct_type = StructType::Cond;
            if is_case {
                si.cond_type = Some(CondType::Case);
            }
        }
        if is_case {
            let follow = cfg.block(cur).sinfo.cond_follow;
            cfg.block_mut(cur).sinfo.case_head = Some(cur);
            for s in cfg.block(cur).succs.clone() {
                set_case_head(cfg, s, cur, follow);
            }
        }
    }
}

// ---- loops -----------------------------------------------------------------

fn determine_loop_type(cfg: &mut Cfg, header: BlockId, loop_nodes: &[bool]) {
    let latch = cfg.block(header).sinfo.latch.expect("loop header has a latch");

    if cfg.block(latch).kind == BbKind::Twoway {
        cfg.block_mut(header).sinfo.loop_type = Some(LoopType::PostTested);
        if cfg.block(header).kind == BbKind::Twoway && header != latch {
            cfg.block_mut(header).sinfo.struct_type = StructType::LoopCond;
        }
    } else if cfg.block(header).kind == BbKind::Twoway {
        // A two-way header whose follow is inside the loop never exits
        // through its condition.
        let follow_inside = cfg.block(header).sinfo.cond_follow.map(|f| {
            loop_nodes
                .get(cfg.block(f).sinfo.ord as usize)
                .copied()
                .unwrap_or(false)
        });
        if follow_inside == Some(true) {
            cfg.block_mut(header).sinfo.loop_type = Some(LoopType::Endless);
            cfg.block_mut(header).sinfo.struct_type = StructType::LoopCond;
        } else {
            cfg.block_mut(header).sinfo.loop_type = Some(LoopType::PreTested);
        }
    } else {
        cfg.block_mut(header).sinfo.loop_type = Some(LoopType::Endless);
    }
}

fn find_loop_follow(cfg: &mut Cfg, header: BlockId, loop_nodes: &[bool]) {
    let latch = cfg.block(header).sinfo.latch.expect("loop header has a latch");
    let ltype = cfg.block(header).sinfo.loop_type.expect("loop type determined");

    match ltype {
        LoopType::PreTested => {
            let succs = cfg.block(header).succs.clone();
            let then_inside = loop_nodes
                .get(cfg.block(succs[BTHEN]).sinfo.ord as usize)
                .copied()
                .unwrap_or(false);
            let follow = if then_inside { succs[BELSE] } else { succs[BTHEN] };
            cfg.block_mut(header).sinfo.loop_follow = Some(follow);
        }
        LoopType::PostTested => {
            let succs = cfg.block(latch).succs.clone();
            let follow = if succs[0] == header {
                succs.get(1).copied()
            } else {
                succs.first().copied()
            };
            cfg.block_mut(header).sinfo.loop_follow = follow;
        }
        LoopType::Endless => {
            // Look for a conditional inside the loop whose follow escapes it,
            // preferring the highest such escape.
            let mut follow: Option<BlockId> = None;
            let h_ord = cfg.block(header).sinfo.ord;
            let l_ord = cfg.block(latch).sinfo.ord;
            let mut i = h_ord - 1;
            while i > l_ord {
                let desc = cfg.ordering[i as usize];
                let si = &cfg.block(desc).sinfo;
                if si.struct_type == StructType::Cond
                    && si.cond_follow.is_some()
                    && si.loop_head == Some(header)
                {
                    let cf = si.cond_follow.unwrap();
                    let cf_ord = cfg.block(cf).sinfo.ord;
                    let cf_inside =
                        loop_nodes.get(cf_ord as usize).copied().unwrap_or(false);
                    if cf_inside {
                        if cfg.block(desc).sinfo.ord > cf_ord {
                            i = cf_ord;
                            continue;
                        } else {
                            break;
                        }
                    } else {
                        let succs = cfg.block(desc).succs.clone();
                        let mut cand = succs.first().copied();
                        if let Some(c) = cand {
                            let c_in = loop_nodes
                                .get(cfg.block(c).sinfo.ord as usize)
                                .copied()
                                .unwrap_or(false);
                            if c_in {
                                cand = succs.get(1).copied().filter(|s| {
                                    !loop_nodes
                                        .get(cfg.block(*s).sinfo.ord as usize)
                                        .copied()
                                        .unwrap_or(false)
                                });
                            }
                        }
                        if let Some(c) = cand {
                            let better = follow
                                .map(|f| cfg.block(c).sinfo.ord > cfg.block(f).sinfo.ord)
                                .unwrap_or(true);
                            if better {
                                follow = Some(c);
                            }
                        }
                    }
                }
                i -= 1;
            }
            if follow.is_some() {
                cfg.block_mut(header).sinfo.loop_follow = follow;
            }
        }
    }
}

fn tag_nodes_in_loop(cfg: &mut Cfg, header: BlockId, loop_nodes: &mut [bool]) {
    let latch = cfg.block(header).sinfo.latch.expect("loop header has a latch");
    let h_ord = cfg.block(header).sinfo.ord;
    let l_ord = cfg.block(latch).sinfo.ord;
    let mut i = h_ord - 1;
    while i >= l_ord {
        let node = cfg.ordering[i as usize];
        if in_loop(cfg, node, header, latch) {
            loop_nodes[i as usize] = true;
            cfg.block_mut(node).sinfo.loop_head = Some(header);
        }
        i -= 1;
    }
    loop_nodes[h_ord as usize] = true;
    cfg.block_mut(header).sinfo.loop_head = Some(header);
}

/// Step 4: find loop headers and classify their loops.
pub fn struct_loops(cfg: &mut Cfg) {
    for i in (0..cfg.ordering.len()).rev() {
        let cur = cfg.ordering[i];
        let mut latch: Option<BlockId> = None;

        // The proper latching node: back-edge source with matching case and
        // loop heads, not an n-way node, not the latch of an enclosing loop,
        // lowest order among candidates.
        for pred in cfg.block(cur).preds.clone() {
            let p = &cfg.block(pred).sinfo;
            let c = &cfg.block(cur).sinfo;
            let enclosing_latch = p
                .loop_head
                .map(|lh| cfg.block(lh).sinfo.latch == Some(pred))
                .unwrap_or(false);
            if p.case_head == c.case_head
                && p.loop_head == c.loop_head
                && latch.map(|l| cfg.block(l).sinfo.ord > p.ord).unwrap_or(true)
                && !enclosing_latch
                && cfg.block(pred).kind != BbKind::Nway
                && has_back_edge_to(cfg, pred, cur)
            {
                latch = Some(pred);
            }
        }

        let Some(latch) = latch else { continue };

        let mut loop_nodes = vec![false; cfg.ordering.len()];
        cfg.block_mut(cur).sinfo.latch = Some(latch);

        // The latch may already look like a conditional header; a multi-block
        // loop resets it to sequential.
        if latch != cur && cfg.block(latch).sinfo.struct_type == StructType::Cond {
            cfg.block_mut(latch).sinfo.struct_type = StructType::Seq;
        }

        cfg.block_mut(cur).sinfo.struct_type = StructType::Loop;
        tag_nodes_in_loop(cfg, cur, &mut loop_nodes);
        determine_loop_type(cfg, cur, &loop_nodes);
        find_loop_follow(cfg, cur, &loop_nodes);
    }
}

// ---- unstructured jumps ----------------------------------------------------

/// Step 5: annotate jumps into/out of loops and into case bodies; give
/// follow-less two-way conditionals their non-back-edge child as follow.
pub fn check_conds(cfg: &mut Cfg) {
    for i in 0..cfg.ordering.len() {
        let cur = cfg.ordering[i];
        let si = cfg.block(cur).sinfo.clone();
        let succs = cfg.block(cur).succs.clone();

        let is_cond_header = matches!(si.struct_type, StructType::Cond | StructType::LoopCond);
        if is_cond_header && si.cond_follow.is_some() && si.cond_type != Some(CondType::Case) {
            let my_loop_head = if si.struct_type == StructType::LoopCond {
                Some(cur)
            } else {
                si.loop_head
            };
            let foll_loop_head = cfg.block(si.cond_follow.unwrap()).sinfo.loop_head;

            if my_loop_head != foll_loop_head {
                // A jump out of the loop goes down the branch holding the latch.
                if let Some(mlh) = my_loop_head {
                    if let Some(my_latch) = cfg.block(mlh).sinfo.latch {
                        if succs.len() > BELSE {
                            if has_back_edge_to(cfg, succs[BTHEN], my_latch)
                                || succs[BTHEN] == my_latch
                                || is_ancestor_of(cfg, succs[BTHEN], my_latch)
                            {
                                let s = &mut cfg.block_mut(cur).sinfo;
                                s.unstruct_type = UnstructType::JumpInOutLoop;
                                s.cond_type = Some(CondType::IfElse);
                            } else if is_ancestor_of(cfg, succs[BELSE], my_latch)
                                || succs[BELSE] == my_latch
                            {
                                let s = &mut cfg.block_mut(cur).sinfo;
                                s.unstruct_type = UnstructType::JumpInOutLoop;
                                s.cond_type = Some(CondType::IfThen);
                            }
                        }
                    }
                }
                if cfg.block(cur).sinfo.unstruct_type == UnstructType::Structured {
                    // Or a jump into another loop's body.
                    if let Some(flh) = foll_loop_head {
                        if succs.len() > BELSE {
                            if is_ancestor_of(cfg, succs[BTHEN], flh) || succs[BTHEN] == flh {
                                let s = &mut cfg.block_mut(cur).sinfo;
                                s.unstruct_type = UnstructType::JumpInOutLoop;
                                s.cond_type = Some(CondType::IfElse);
                            } else if is_ancestor_of(cfg, succs[BELSE], flh)
                                || succs[BELSE] == flh
                            {
                                let s = &mut cfg.block_mut(cur).sinfo;
                                s.unstruct_type = UnstructType::JumpInOutLoop;
                                s.cond_type = Some(CondType::IfThen);
                            }
                        }
                    }
                }
            }

            // Jump into a case body: a child whose case head differs.
            if cfg.block(cur).sinfo.unstruct_type == UnstructType::Structured
                && succs.len() > BELSE
            {
                let my_case = cfg.block(cur).sinfo.case_head;
                let then_case = cfg.block(succs[BTHEN]).sinfo.case_head;
                let else_case = cfg.block(succs[BELSE]).sinfo.case_head;
                if my_case != then_case || my_case != else_case {
                    let my_follow =
                        my_case.and_then(|h| cfg.block(h).sinfo.cond_follow);
                    if then_case == my_case
                        && (my_case.is_none() || Some(succs[BELSE]) != my_follow)
                    {
                        let s = &mut cfg.block_mut(cur).sinfo;
                        s.unstruct_type = UnstructType::JumpIntoCase;
                        s.cond_type = Some(CondType::IfElse);
                    } else if else_case == my_case
                        && (my_case.is_none() || Some(succs[BTHEN]) != my_follow)
                    {
                        let s = &mut cfg.block_mut(cur).sinfo;
                        s.unstruct_type = UnstructType::JumpIntoCase;
                        s.cond_type = Some(CondType::IfThen);
                    }
                }
            }
        }

        // Two-way conditionals with no follow (back-edge sources): the
        // non-back-edge child becomes the follow.
        let si = cfg.block(cur).sinfo.clone();
        if si.struct_type == StructType::Cond
            && si.cond_follow.is_none()
            && si.cond_type != Some(CondType::Case)
            && si.unstruct_type == UnstructType::Structured
            && has_back_edge(cfg, cur)
            && succs.len() > BELSE
        {
            if has_back_edge_to(cfg, cur, succs[BTHEN]) {
                let s = &mut cfg.block_mut(cur).sinfo;
                s.cond_type = Some(CondType::IfThen);
                s.cond_follow = Some(succs[BELSE]);
            } else {
                let s = &mut cfg.block_mut(cur).sinfo;
                s.cond_type = Some(CondType::IfElse);
                s.cond_follow = Some(succs[BTHEN]);
            }
        }
    }
}

/// Run the whole structuring pipeline. Requires a return node; graphs
/// without one keep their default sequential tags and the emitter falls
/// back to gotos.
pub fn structure(cfg: &mut Cfg) {
    if cfg.find_ret_node().is_none() {
        warn!("no return node; leaving the graph unstructured");
        return;
    }
    set_time_stamps(cfg);
    update_immed_pdom(cfg);
    struct_conds(cfg);
    struct_loops(cfg);
    check_conds(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::rtl::Rtl;

    fn bb(cfg: &mut Cfg, addr: u64, kind: BbKind) -> BlockId {
        cfg.new_bb(vec![Rtl::new(addr)], kind).block()
    }

    /// entry -> cond -> (then | else) -> join -> ret
    fn diamond() -> (Cfg, BlockId, BlockId, BlockId, BlockId, BlockId) {
        let mut cfg = Cfg::new();
        let cond = bb(&mut cfg, 0x1000, BbKind::Twoway);
        let then_b = bb(&mut cfg, 0x1010, BbKind::Fall);
        let else_b = bb(&mut cfg, 0x1020, BbKind::Fall);
        let join = bb(&mut cfg, 0x1030, BbKind::Ret);
        cfg.add_edge(cond, then_b);
        cfg.add_edge(cond, else_b);
        cfg.add_edge(then_b, join);
        cfg.add_edge(else_b, join);
        cfg.set_entry_and_exit(cond);
        (cfg, cond, then_b, else_b, join, join)
    }

    #[test]
    fn test_diamond_cond_follow_is_join() {
        let (mut cfg, cond, _, _, join, _) = diamond();
        structure(&mut cfg);
        let si = &cfg.block(cond).sinfo;
        assert_eq!(si.struct_type, StructType::Cond);
        assert_eq!(si.cond_follow, Some(join));
        assert_eq!(si.unstruct_type, UnstructType::Structured);
    }

    #[test]
    fn test_self_loop_is_endless() {
        // entry -> body; body -> body (self edge); no exit from the loop,
        // so the graph needs a synthetic ret to structure against.
        let mut cfg = Cfg::new();
        let entry = bb(&mut cfg, 0x1000, BbKind::Fall);
        let body = bb(&mut cfg, 0x1010, BbKind::Oneway);
        cfg.add_edge(entry, body);
        cfg.add_edge(body, body);
        let ret = bb(&mut cfg, 0x1020, BbKind::Ret);
        cfg.add_edge(body, ret);
        cfg.set_entry_and_exit(entry);

        structure(&mut cfg);
        let si = &cfg.block(body).sinfo;
        assert_eq!(si.latch, Some(body));
        assert_eq!(si.loop_head, Some(body));
    }

    #[test]
    fn test_pretested_loop() {
        // head(2way) -> body -> head; head -> exit(ret)
        let mut cfg = Cfg::new();
        let pre = bb(&mut cfg, 0x1000, BbKind::Fall);
        let head = bb(&mut cfg, 0x1010, BbKind::Twoway);
        let body = bb(&mut cfg, 0x1020, BbKind::Oneway);
        let exit = bb(&mut cfg, 0x1030, BbKind::Ret);
        cfg.add_edge(pre, head);
        cfg.add_edge(head, body); // taken: stay in loop
        cfg.add_edge(head, exit); // fall: leave
        cfg.add_edge(body, head);
        cfg.set_entry_and_exit(pre);

        structure(&mut cfg);
        let si = &cfg.block(head).sinfo;
        assert_eq!(si.struct_type, StructType::Loop);
        assert_eq!(si.loop_type, Some(LoopType::PreTested));
        assert_eq!(si.latch, Some(body));
        assert_eq!(si.loop_follow, Some(exit));
    }

    #[test]
    fn test_posttested_loop() {
        // head -> body(2way); body -> head (back), body -> exit
        let mut cfg = Cfg::new();
        let pre = bb(&mut cfg, 0x1000, BbKind::Fall);
        let head = bb(&mut cfg, 0x1010, BbKind::Fall);
        let latch = bb(&mut cfg, 0x1020, BbKind::Twoway);
        let exit = bb(&mut cfg, 0x1030, BbKind::Ret);
        cfg.add_edge(pre, head);
        cfg.add_edge(head, latch);
        cfg.add_edge(latch, head);
        cfg.add_edge(latch, exit);
        cfg.set_entry_and_exit(pre);

        structure(&mut cfg);
        let si = &cfg.block(head).sinfo;
        assert_eq!(si.loop_type, Some(LoopType::PostTested));
        assert_eq!(si.latch, Some(latch));
        assert_eq!(si.loop_follow, Some(exit));
    }

    #[test]
    fn test_nodes_tagged_in_loop() {
        let mut cfg = Cfg::new();
        let pre = bb(&mut cfg, 0x1000, BbKind::Fall);
        let head = bb(&mut cfg, 0x1010, BbKind::Twoway);
        let body = bb(&mut cfg, 0x1020, BbKind::Oneway);
        let exit = bb(&mut cfg, 0x1030, BbKind::Ret);
        cfg.add_edge(pre, head);
        cfg.add_edge(head, body);
        cfg.add_edge(head, exit);
        cfg.add_edge(body, head);
        cfg.set_entry_and_exit(pre);

        structure(&mut cfg);
        assert_eq!(cfg.block(body).sinfo.loop_head, Some(head));
        assert_eq!(cfg.block(head).sinfo.loop_head, Some(head));
        assert_eq!(cfg.block(exit).sinfo.loop_head, None);
        assert_eq!(cfg.block(pre).sinfo.loop_head, None);
    }
}
