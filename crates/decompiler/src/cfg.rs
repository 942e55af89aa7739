//! Control-flow graph of basic blocks.
//!
//! Blocks and statements live in slot arenas owned by the `Cfg`; ids stay
//! stable across removals. The creation API mirrors what a decoder needs:
//! `new_bb` copes with overlapping decodes by splitting or truncating, and
//! `label` turns an address into a block boundary after the fact.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use thiserror::Error;
use tracing::warn;

use crate::exp::Exp;
use crate::rtl::Rtl;
use crate::stmt::{Statement, StatementKind, StmtId};
use crate::structuring::StructInfo;
use crate::{Address, NO_ADDRESS};

/// Identity of a basic block within its CFG's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbKind {
    Invalid,
    Fall,
    Oneway,
    Twoway,
    Nway,
    Call,
    Ret,
    CompJump,
    CompCall,
}

impl std::fmt::Display for BbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BbKind::Invalid => "Invalid",
            BbKind::Fall => "Fall",
            BbKind::Oneway => "Oneway",
            BbKind::Twoway => "Twoway",
            BbKind::Nway => "Nway",
            BbKind::Call => "Call",
            BbKind::Ret => "Ret",
            BbKind::CompJump => "CompJump",
            BbKind::CompCall => "CompCall",
        };
        f.write_str(s)
    }
}

/// Outcome of `Cfg::new_bb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbCreationResult {
    /// A block was created (or an incomplete one completed) at the address.
    Created(BlockId),
    /// A complete block already covers the address; stop extending.
    AlreadyComplete(BlockId),
    /// The new block overlapped a pending block and was truncated into it;
    /// the caller should wire successor edges into the returned block.
    TruncatedInto(BlockId),
}

impl BbCreationResult {
    pub fn block(self) -> BlockId {
        match self {
            BbCreationResult::Created(b)
            | BbCreationResult::AlreadyComplete(b)
            | BbCreationResult::TruncatedInto(b) => b,
        }
    }
}

/// CFG-level failures.
#[derive(Debug, Error)]
pub enum CfgError {
    #[error("control flow graph is not well-formed: {0}")]
    NotWellFormed(String),
    #[error("procedure has no entry block")]
    NoEntryBlock,
    #[error("no return block found")]
    NoRetBlock,
}

/// A basic block: RTL list plus edges and traversal bookkeeping.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub kind: BbKind,
    pub rtls: Vec<Rtl>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub incomplete: bool,
    pub low_addr: Address,
    pub high_addr: Address,
    pub label_needed: bool,
    /// Forward DFS numbers (pre/post).
    pub dfs_pre: i32,
    pub dfs_post: i32,
    /// Reverse DFS numbers.
    pub rev_dfs_pre: i32,
    pub rev_dfs_post: i32,
    pub traversed: bool,
    /// Structuring metadata.
    pub sinfo: StructInfo,
}

impl BasicBlock {
    fn incomplete_at(addr: Address) -> Self {
        BasicBlock {
            kind: BbKind::Invalid,
            rtls: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            incomplete: true,
            low_addr: addr,
            high_addr: NO_ADDRESS,
            label_needed: false,
            dfs_pre: 0,
            dfs_post: 0,
            rev_dfs_pre: 0,
            rev_dfs_post: 0,
            traversed: false,
            sinfo: StructInfo::default(),
        }
    }

    /// Id of the last statement, usually the control transfer.
    pub fn last_stmt(&self) -> Option<StmtId> {
        self.rtls.iter().rev().find_map(|r| r.last())
    }

    pub fn first_stmt(&self) -> Option<StmtId> {
        self.rtls.iter().find_map(|r| r.stmts.first().copied())
    }

    pub fn stmt_ids(&self) -> impl Iterator<Item = StmtId> + '_ {
        self.rtls.iter().flat_map(|r| r.stmts.iter().copied())
    }
}

/// Statement storage. Slots keep their index forever; removal leaves a hole.
#[derive(Debug, Clone, Default)]
pub struct StmtArena {
    slots: Vec<Option<Statement>>,
}

impl StmtArena {
    pub fn alloc(&mut self, kind: StatementKind) -> StmtId {
        let id = StmtId(self.slots.len() as u32);
        self.slots.push(Some(Statement { id, bb: BlockId(u32::MAX), kind }));
        id
    }

    pub fn get(&self, id: StmtId) -> Option<&Statement> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: StmtId) -> Option<&mut Statement> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Take a statement out for mutation with full arena access; must be
    /// paired with `put_back`.
    pub fn take(&mut self, id: StmtId) -> Option<Statement> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.take())
    }

    pub fn put_back(&mut self, stmt: Statement) {
        let idx = stmt.id.0 as usize;
        self.slots[idx] = Some(stmt);
    }

    pub fn remove(&mut self, id: StmtId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn contains(&self, id: StmtId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Statement> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

/// The control-flow graph of one procedure.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    blocks: Vec<Option<BasicBlock>>,
    pub stmts: StmtArena,
    pub entry: Option<BlockId>,
    pub exit: Option<BlockId>,
    addr_map: BTreeMap<Address, BlockId>,
    /// Implicit entry definitions, one per location.
    implicits: HashMap<Exp, StmtId>,
    /// Verdict of the last `well_form` check; the analysis stages skip a
    /// graph recorded as malformed.
    pub wellformed: bool,
    /// Post-order of forward traversal, built by structuring.
    pub ordering: Vec<BlockId>,
    /// Post-order of reverse traversal, built by structuring.
    pub rev_ordering: Vec<BlockId>,
}

impl Cfg {
    pub fn new() -> Self {
        Cfg::default()
    }

    pub fn clear(&mut self) {
        *self = Cfg::new();
    }

    // ---- block access -----------------------------------------------------

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        self.blocks[id.0 as usize]
            .as_ref()
            .expect("block id refers to a removed block")
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.blocks[id.0 as usize]
            .as_mut()
            .expect("block id refers to a removed block")
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.blocks
            .get(id.0 as usize)
            .map(|b| b.is_some())
            .unwrap_or(false)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// All live block ids in creation order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|_| BlockId(i as u32)))
            .collect()
    }

    /// Block ids ordered by low address; address-less blocks go last.
    pub fn block_ids_by_address(&self) -> Vec<BlockId> {
        let mut mapped: Vec<BlockId> = self.addr_map.values().copied().collect();
        for id in self.block_ids() {
            if !mapped.contains(&id) {
                mapped.push(id);
            }
        }
        mapped.retain(|id| self.has_block(*id));
        mapped
    }

    pub fn block_at_addr(&self, addr: Address) -> Option<BlockId> {
        self.addr_map.get(&addr).copied()
    }

    pub fn exists_bb(&self, addr: Address) -> bool {
        self.addr_map.contains_key(&addr)
    }

    pub fn is_incomplete(&self, addr: Address) -> bool {
        self.block_at_addr(addr)
            .map(|id| self.block(id).incomplete)
            .unwrap_or(false)
    }

    fn push_block(&mut self, bb: BasicBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Some(bb));
        id
    }

    // ---- statement access --------------------------------------------------

    pub fn stmt(&self, id: StmtId) -> &Statement {
        self.stmts.get(id).expect("statement id refers to a removed statement")
    }

    pub fn stmt_mut(&mut self, id: StmtId) -> &mut Statement {
        self.stmts
            .get_mut(id)
            .expect("statement id refers to a removed statement")
    }

    pub fn try_stmt(&self, id: StmtId) -> Option<&Statement> {
        self.stmts.get(id)
    }

    pub fn add_stmt(&mut self, kind: StatementKind) -> StmtId {
        self.stmts.alloc(kind)
    }

    /// Every live statement id, implicit definitions first, then block
    /// bodies in address order.
    pub fn statements_in_order(&self) -> Vec<StmtId> {
        let mut out: Vec<StmtId> = self.implicits.values().copied().collect();
        out.sort();
        for bid in self.block_ids_by_address() {
            out.extend(self.block(bid).stmt_ids());
        }
        out
    }

    // ---- block creation ----------------------------------------------------

    /// Create a new complete block from decoded RTLs.
    ///
    /// Handles three decoder realities: the address may already hold an
    /// incomplete block (fill it), a complete block (stop), or the new body
    /// may run into the next block in the map (truncate and fall through).
    pub fn new_bb(&mut self, mut rtls: Vec<Rtl>, kind: BbKind) -> BbCreationResult {
        let mut start_addr = rtls.first().map(|r| r.addr).unwrap_or(0);
        if start_addr == 0 && rtls.len() > 1 {
            start_addr = rtls[1].addr;
        }
        let last_addr = rtls.last().map(|r| r.addr).unwrap_or(start_addr);

        let current = if start_addr != 0 {
            match self.addr_map.get(&start_addr).copied() {
                Some(existing) if !self.block(existing).incomplete => {
                    // Duplicate decode of the same range, e.g. a forward jump
                    // into the middle of a loop.
                    for r in &rtls {
                        for s in &r.stmts {
                            self.stmts.remove(*s);
                        }
                    }
                    return BbCreationResult::AlreadyComplete(existing);
                }
                Some(existing) => {
                    for r in &rtls {
                        for sid in &r.stmts {
                            if let Some(s) = self.stmts.get_mut(*sid) {
                                s.bb = existing;
                            }
                        }
                    }
                    let bb = self.block_mut(existing);
                    bb.rtls = std::mem::take(&mut rtls);
                    bb.kind = kind;
                    bb.incomplete = false;
                    bb.low_addr = start_addr;
                    bb.high_addr = last_addr;
                    existing
                }
                None => {
                    let mut bb = BasicBlock::incomplete_at(start_addr);
                    bb.kind = kind;
                    bb.incomplete = false;
                    bb.high_addr = last_addr;
                    bb.rtls = std::mem::take(&mut rtls);
                    let id = self.push_block(bb);
                    for sid in self.block(id).stmt_ids().collect::<Vec<_>>() {
                        if let Some(s) = self.stmts.get_mut(sid) {
                            s.bb = id;
                        }
                    }
                    self.addr_map.insert(start_addr, id);
                    id
                }
            }
        } else {
            // Synthetic block with no native address; never mapped.
            let mut bb = BasicBlock::incomplete_at(0);
            bb.kind = kind;
            bb.incomplete = false;
            bb.high_addr = 0;
            bb.rtls = std::mem::take(&mut rtls);
            let id = self.push_block(bb);
            for sid in self.block(id).stmt_ids().collect::<Vec<_>>() {
                if let Some(s) = self.stmts.get_mut(sid) {
                    s.bb = id;
                }
            }
            return BbCreationResult::Created(id);
        };

        // Overlap with the next mapped block?
        let next = self
            .addr_map
            .range((start_addr + 1)..)
            .next()
            .map(|(a, b)| (*a, *b));
        if let Some((next_addr, next_bb)) = next {
            if next_addr <= self.block(current).high_addr {
                let next_was_incomplete = self.block(next_bb).incomplete;
                self.split_bb(current, next_addr, Some(next_bb), false);
                return if next_was_incomplete {
                    BbCreationResult::TruncatedInto(next_bb)
                } else {
                    BbCreationResult::AlreadyComplete(next_bb)
                };
            }
        }

        BbCreationResult::Created(current)
    }

    /// Create an empty placeholder block for a not-yet-decoded address.
    pub fn new_incomplete_bb(&mut self, addr: Address) -> BlockId {
        let id = self.push_block(BasicBlock::incomplete_at(addr));
        self.addr_map.insert(addr, id);
        id
    }

    // ---- edges -------------------------------------------------------------

    pub fn add_edge(&mut self, src: BlockId, dst: BlockId) {
        self.block_mut(src).succs.push(dst);
        self.block_mut(dst).preds.push(src);
        // A oneway block acquiring a second out edge is really twoway.
        let src_bb = self.block_mut(src);
        if src_bb.kind == BbKind::Oneway && src_bb.succs.len() > 1 {
            src_bb.kind = BbKind::Twoway;
            self.block_mut(dst).label_needed = true;
        }
    }

    /// Add an edge to the block at `addr`, creating an incomplete block when
    /// the destination has not been decoded yet.
    pub fn add_edge_to_addr(&mut self, src: BlockId, addr: Address) {
        let dst = match self.block_at_addr(addr) {
            Some(d) => d,
            None => self.new_incomplete_bb(addr),
        };
        self.add_edge(src, dst);
    }

    pub fn remove_edge(&mut self, src: BlockId, dst: BlockId) {
        if let Some(pos) = self.block(src).succs.iter().position(|s| *s == dst) {
            self.block_mut(src).succs.remove(pos);
        }
        if let Some(pos) = self.block(dst).preds.iter().position(|p| *p == src) {
            self.block_mut(dst).preds.remove(pos);
        }
    }

    // ---- label and split ---------------------------------------------------

    /// Mark `addr` as a block boundary. Returns true when the address was
    /// already decoded (so the caller should stop decoding and wire an edge
    /// instead). `cur_bb` is retargeted when the split moves the decode
    /// frontier into a new bottom block.
    pub fn label(&mut self, addr: Address, cur_bb: &mut Option<BlockId>) -> bool {
        if let Some(existing) = self.block_at_addr(addr) {
            if !self.block(existing).incomplete {
                return true;
            }
            // Incomplete entry: a complete predecessor block may cover the
            // address, in which case it must be split into this placeholder.
            if let Some(prev) = self.prev_complete_covering(addr) {
                self.split_bb(prev, addr, Some(existing), false);
                return true;
            }
            return false;
        }

        if let Some(prev) = self.prev_complete_covering(addr) {
            let bottom = self.split_bb(prev, addr, None, false);
            if *cur_bb == Some(prev) {
                *cur_bb = Some(bottom);
            }
            return true;
        }

        self.new_incomplete_bb(addr);
        false
    }

    fn prev_complete_covering(&self, addr: Address) -> Option<BlockId> {
        let (_, prev) = self.addr_map.range(..addr).next_back()?;
        let bb = self.block(*prev);
        if !bb.incomplete && bb.low_addr < addr && bb.high_addr >= addr {
            Some(*prev)
        } else {
            None
        }
    }

    /// Split `bb` at the RTL whose address is `split_addr`. The bottom block
    /// receives the tail RTLs and bb's out edges; bb becomes a fall-through.
    /// When `existing` names an incomplete block it is completed in place;
    /// when it names a complete block the tail statements are discarded
    /// (they duplicate already-decoded instructions).
    pub fn split_bb(
        &mut self,
        bb: BlockId,
        split_addr: Address,
        existing: Option<BlockId>,
        delete_rtls: bool,
    ) -> BlockId {
        let split_idx = match self.block(bb).rtls.iter().position(|r| r.addr == split_addr) {
            Some(i) => i,
            None => {
                warn!(
                    "cannot split block at 0x{:x}: no RTL at 0x{:x}",
                    self.block(bb).low_addr,
                    split_addr
                );
                return bb;
            }
        };

        let tail: Vec<Rtl> = self.block_mut(bb).rtls.split_off(split_idx);
        let old_succs = std::mem::take(&mut self.block_mut(bb).succs);
        let old_kind = self.block(bb).kind;
        let old_high = self.block(bb).high_addr;

        let bottom = match existing {
            None => {
                let mut nb = BasicBlock::incomplete_at(split_addr);
                nb.kind = old_kind;
                nb.incomplete = false;
                nb.high_addr = old_high;
                nb.rtls = tail;
                nb.succs = old_succs.clone();
                let id = self.push_block(nb);
                self.addr_map.insert(split_addr, id);
                for sid in self.block(id).stmt_ids().collect::<Vec<_>>() {
                    if let Some(s) = self.stmts.get_mut(sid) {
                        s.bb = id;
                    }
                }
                id
            }
            Some(id) if self.block(id).incomplete => {
                for r in &tail {
                    for sid in &r.stmts {
                        if let Some(s) = self.stmts.get_mut(*sid) {
                            s.bb = id;
                        }
                    }
                }
                let nb = self.block_mut(id);
                nb.kind = old_kind;
                nb.incomplete = false;
                nb.high_addr = old_high;
                nb.rtls = tail;
                nb.succs = old_succs.clone();
                id
            }
            Some(id) => {
                // Already complete: the tail duplicates its contents.
                let _ = delete_rtls;
                for r in &tail {
                    for sid in &r.stmts {
                        self.stmts.remove(*sid);
                    }
                }
                id
            }
        };

        // Successors of the old block now hang off the bottom.
        for succ in &old_succs {
            let preds = &mut self.block_mut(*succ).preds;
            if let Some(p) = preds.iter_mut().find(|p| **p == bb) {
                *p = bottom;
            }
        }

        let top = self.block_mut(bb);
        top.kind = BbKind::Fall;
        top.high_addr = split_addr.saturating_sub(1).max(top.low_addr);
        self.add_edge(bb, bottom);
        bottom
    }

    /// Merge `u` into `v`; legal only when u→v is v's only in edge and u's
    /// only out edge. u's RTLs are prepended and u is removed.
    pub fn merge_bbs(&mut self, u: BlockId, v: BlockId) -> bool {
        if self.block(u).succs != vec![v] || self.block(v).preds != vec![u] {
            return false;
        }
        let mut moved = std::mem::take(&mut self.block_mut(u).rtls);
        for r in &moved {
            for sid in &r.stmts {
                if let Some(s) = self.stmts.get_mut(*sid) {
                    s.bb = v;
                }
            }
        }
        let u_preds = self.block(u).preds.clone();
        let u_low = self.block(u).low_addr;
        {
            let vb = self.block_mut(v);
            moved.append(&mut vb.rtls);
            vb.rtls = moved;
            vb.low_addr = u_low;
            vb.preds.clear();
        }
        for p in u_preds {
            // Rewire predecessors of u to point at v.
            for s in &mut self.block_mut(p).succs {
                if *s == u {
                    *s = v;
                }
            }
            self.block_mut(v).preds.push(p);
        }
        self.remove_block(u);
        true
    }

    /// Drop a block and all its edges and statements.
    pub fn remove_block(&mut self, id: BlockId) {
        let preds = self.block(id).preds.clone();
        let succs = self.block(id).succs.clone();
        for p in preds {
            if self.has_block(p) {
                self.block_mut(p).succs.retain(|s| *s != id);
            }
        }
        for s in succs {
            if self.has_block(s) {
                self.block_mut(s).preds.retain(|p| *p != id);
            }
        }
        for sid in self.block(id).stmt_ids().collect::<Vec<_>>() {
            self.stmts.remove(sid);
        }
        let low = self.block(id).low_addr;
        if self.addr_map.get(&low) == Some(&id) {
            self.addr_map.remove(&low);
        }
        self.blocks[id.0 as usize] = None;
        if self.entry == Some(id) {
            self.entry = None;
        }
        if self.exit == Some(id) {
            self.exit = None;
        }
    }

    /// Bypass and remove blocks that consist of a single unconditional goto.
    pub fn compress(&mut self) -> bool {
        let mut changed = false;
        for id in self.block_ids() {
            if Some(id) == self.entry {
                continue;
            }
            let bb = self.block(id);
            if bb.kind != BbKind::Oneway || bb.succs.len() != 1 {
                continue;
            }
            let only_goto = {
                let ids: Vec<StmtId> = bb.stmt_ids().collect();
                ids.len() == 1
                    && matches!(self.stmt(ids[0]).kind, StatementKind::Goto(_))
            };
            if !only_goto {
                continue;
            }
            let target = bb.succs[0];
            if target == id {
                continue;
            }
            let preds = self.block(id).preds.clone();
            for p in preds {
                for s in &mut self.block_mut(p).succs {
                    if *s == id {
                        *s = target;
                    }
                }
                self.block_mut(target).preds.push(p);
            }
            self.block_mut(id).preds.clear();
            self.remove_block(id);
            changed = true;
        }
        changed
    }

    /// Remove blocks unreachable from the entry.
    pub fn remove_orphan_bbs(&mut self) -> bool {
        let Some(entry) = self.entry else { return false };
        let mut reached = vec![false; self.blocks.len()];
        let mut work = vec![entry];
        while let Some(b) = work.pop() {
            if reached[b.0 as usize] {
                continue;
            }
            reached[b.0 as usize] = true;
            for s in &self.block(b).succs {
                work.push(*s);
            }
        }
        let mut changed = false;
        for id in self.block_ids() {
            if !reached[id.0 as usize] {
                self.remove_block(id);
                changed = true;
            }
        }
        changed
    }

    // ---- traversal orders --------------------------------------------------

    fn untraverse(&mut self) {
        for id in self.block_ids() {
            self.block_mut(id).traversed = false;
        }
    }

    /// Assign forward DFS pre/post numbers from the entry; errors when some
    /// block is unreachable. The driver runs this at initialise time as the
    /// forward traversability check.
    pub fn establish_dft_order(&mut self) -> Result<(), CfgError> {
        self.untraverse();
        let entry = self.entry.ok_or(CfgError::NoEntryBlock)?;
        let mut first = 0;
        let mut last = 0;
        let visited = self.dfs(entry, &mut first, &mut last);
        if visited != self.num_blocks() {
            return Err(CfgError::NotWellFormed(format!(
                "{} of {} blocks reachable from entry",
                visited,
                self.num_blocks()
            )));
        }
        Ok(())
    }

    fn dfs(&mut self, id: BlockId, first: &mut i32, last: &mut i32) -> usize {
        if self.block(id).traversed {
            return 0;
        }
        self.block_mut(id).traversed = true;
        *first += 1;
        self.block_mut(id).dfs_pre = *first;
        let mut count = 1;
        for s in self.block(id).succs.clone() {
            count += self.dfs(s, first, last);
        }
        *last += 1;
        self.block_mut(id).dfs_post = *last;
        count
    }

    /// Assign reverse DFS numbers from the return node over predecessor
    /// edges; errors when there is no return node or some block cannot
    /// reach it. The driver runs this before structuring.
    pub fn establish_rev_dft_order(&mut self) -> Result<(), CfgError> {
        self.untraverse();
        let ret = self.find_ret_node().ok_or(CfgError::NoRetBlock)?;
        let mut first = 0;
        let mut last = 0;
        let visited = self.rev_dfs(ret, &mut first, &mut last);
        if visited != self.num_blocks() {
            return Err(CfgError::NotWellFormed(format!(
                "{} of {} blocks reach the return node",
                visited,
                self.num_blocks()
            )));
        }
        Ok(())
    }

    fn rev_dfs(&mut self, id: BlockId, first: &mut i32, last: &mut i32) -> usize {
        if self.block(id).traversed {
            return 0;
        }
        self.block_mut(id).traversed = true;
        *first += 1;
        self.block_mut(id).rev_dfs_pre = *first;
        let mut count = 1;
        for p in self.block(id).preds.clone() {
            count += self.rev_dfs(p, first, last);
        }
        *last += 1;
        self.block_mut(id).rev_dfs_post = *last;
        count
    }

    /// The return block, or a no-return call block standing in for it.
    pub fn find_ret_node(&self) -> Option<BlockId> {
        let mut fallback = None;
        for id in self.block_ids() {
            let bb = self.block(id);
            match bb.kind {
                BbKind::Ret => return Some(id),
                BbKind::Call if bb.succs.is_empty() => fallback = Some(id),
                _ => {}
            }
        }
        fallback
    }

    /// Check edge symmetry and completeness. The verdict is recorded in
    /// `wellformed` and returned; later passes check it and skip rather
    /// than analyse a broken graph.
    pub fn well_form(&mut self) -> bool {
        let mut ok = true;
        for id in self.block_ids() {
            let bb = self.block(id);
            if bb.incomplete {
                warn!("block at 0x{:x} is still incomplete", bb.low_addr);
                ok = false;
            }
            for s in &bb.succs {
                if !self.has_block(*s) || !self.block(*s).preds.contains(&id) {
                    warn!(
                        "edge 0x{:x} -> {} has no matching in edge",
                        bb.low_addr, s
                    );
                    ok = false;
                }
            }
            for p in &bb.preds {
                if !self.has_block(*p) || !self.block(*p).succs.contains(&id) {
                    warn!(
                        "in edge {} -> 0x{:x} has no matching out edge",
                        p, bb.low_addr
                    );
                    ok = false;
                }
            }
        }
        self.wellformed = ok;
        ok
    }

    /// Set the entry block; the exit is the return node when one exists.
    pub fn set_entry_and_exit(&mut self, entry: BlockId) {
        self.entry = Some(entry);
        self.exit = self.find_ret_node();
    }

    // ---- implicit definitions ----------------------------------------------

    /// The implicit entry definition for `loc`, creating it on first use.
    pub fn find_or_create_implicit(&mut self, loc: &Exp) -> StmtId {
        if let Some(id) = self.implicits.get(loc) {
            return *id;
        }
        let id = self.stmts.alloc(StatementKind::Implicit(crate::stmt::ImplicitAssign {
            ty: crate::types::Type::Void,
            lhs: loc.clone(),
        }));
        if let (Some(entry), Some(s)) = (self.entry, self.stmts.get_mut(id)) {
            s.bb = entry;
        }
        self.implicits.insert(loc.clone(), id);
        id
    }

    pub fn find_implicit(&self, loc: &Exp) -> Option<StmtId> {
        self.implicits.get(loc).copied()
    }

    pub fn remove_implicit(&mut self, loc: &Exp) {
        if let Some(id) = self.implicits.remove(loc) {
            self.stmts.remove(id);
        }
    }

    pub fn implicit_ids(&self) -> Vec<StmtId> {
        let mut v: Vec<StmtId> = self.implicits.values().copied().collect();
        v.sort();
        v
    }

    // ---- whole-graph expression operations ----------------------------------

    pub fn search_and_replace(&mut self, pattern: &Exp, replacement: &Exp) -> bool {
        let mut changed = false;
        for sid in self.statements_in_order() {
            if let Some(s) = self.stmts.get_mut(sid) {
                changed |= s.search_and_replace(pattern, replacement);
            }
        }
        changed
    }

    pub fn search_all(&self, pattern: &Exp) -> Vec<Exp> {
        let mut out = Vec::new();
        for sid in self.statements_in_order() {
            if let Some(s) = self.stmts.get(sid) {
                out.extend(s.search_all(pattern));
            }
        }
        out
    }

    pub fn simplify_all(&mut self) {
        for sid in self.statements_in_order() {
            if let Some(s) = self.stmts.get_mut(sid) {
                s.simplify();
            }
        }
    }

    // ---- printing -----------------------------------------------------------

    /// Render the graph the way the unit tests expect it.
    pub fn print(&self) -> String {
        let mut out = String::from("Control Flow Graph:\n");
        for id in self.block_ids_by_address() {
            let bb = self.block(id);
            let _ = writeln!(out, "{} BB:", bb.kind);
            let _ = write!(out, "  in edges: ");
            for p in &bb.preds {
                let _ = write!(out, "0x{:08x} ", self.block(*p).low_addr);
            }
            let _ = writeln!(out);
            let _ = write!(out, "  out edges: ");
            for s in &bb.succs {
                let _ = write!(out, "0x{:08x} ", self.block(*s).low_addr);
            }
            let _ = writeln!(out);
            for rtl in &bb.rtls {
                let _ = write!(out, "0x{:08x}", rtl.addr);
                if rtl.stmts.is_empty() {
                    let _ = writeln!(out);
                }
                for sid in &rtl.stmts {
                    let Some(s) = self.stmts.get(*sid) else { continue };
                    let _ = writeln!(out, "{s}");
                    if let StatementKind::Ret(r) = &s.kind {
                        let _ = write!(out, "              Modifieds: ");
                        for (i, m) in r.modifieds.iter().enumerate() {
                            if i > 0 {
                                let _ = write!(out, ",   ");
                            }
                            let _ = write!(out, "{}", m.lhs);
                        }
                        let _ = writeln!(out);
                        let _ = write!(out, "              Reaching definitions: ");
                        for (i, d) in r.col.iter().enumerate() {
                            if i > 0 {
                                let _ = write!(out, ",   ");
                            }
                            let _ = write!(out, "{}={}", d.lhs, d.rhs);
                        }
                        let _ = writeln!(out);
                    }
                }
            }
            let _ = writeln!(out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::{Assign, GotoStatement};

    fn assign(cfg: &mut Cfg, lhs: Exp, rhs: Exp) -> StmtId {
        cfg.add_stmt(StatementKind::Assign(Assign::new(lhs, rhs)))
    }

    #[test]
    fn test_new_bb_and_edges_keep_invariants() {
        let mut cfg = Cfg::new();
        let s1 = assign(&mut cfg, Exp::reg(24), Exp::int(5));
        let b0 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1])], BbKind::Fall)
            .block();
        let b1 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1010, vec![])], BbKind::Ret)
            .block();
        cfg.add_edge(b0, b1);

        assert_eq!(cfg.block(b0).succs, vec![b1]);
        assert_eq!(cfg.block(b1).preds, vec![b0]);
        assert_eq!(cfg.stmt(s1).bb, b0);
        cfg.set_entry_and_exit(b0);
        assert!(cfg.well_form());
    }

    #[test]
    fn test_new_bb_on_complete_block_reports_already_complete() {
        let mut cfg = Cfg::new();
        let b0 = cfg
            .new_bb(vec![Rtl::new(0x1000)], BbKind::Fall)
            .block();
        match cfg.new_bb(vec![Rtl::new(0x1000)], BbKind::Fall) {
            BbCreationResult::AlreadyComplete(id) => assert_eq!(id, b0),
            other => panic!("expected AlreadyComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_new_bb_fills_incomplete_block() {
        let mut cfg = Cfg::new();
        let pending = cfg.new_incomplete_bb(0x1000);
        let res = cfg.new_bb(vec![Rtl::new(0x1000)], BbKind::Oneway);
        assert_eq!(res, BbCreationResult::Created(pending));
        assert!(!cfg.block(pending).incomplete);
        assert_eq!(cfg.block(pending).kind, BbKind::Oneway);
    }

    #[test]
    fn test_new_bb_truncates_into_pending_block() {
        let mut cfg = Cfg::new();
        // A jump target at 0x1008 is known before its code is decoded.
        let pending = cfg.new_incomplete_bb(0x1008);
        let res = cfg.new_bb(
            vec![Rtl::new(0x1000), Rtl::new(0x1004), Rtl::new(0x1008)],
            BbKind::Ret,
        );
        assert_eq!(res, BbCreationResult::TruncatedInto(pending));
        let top = cfg.block_at_addr(0x1000).unwrap();
        assert_eq!(cfg.block(top).kind, BbKind::Fall);
        assert_eq!(cfg.block(top).succs, vec![pending]);
        assert_eq!(cfg.block(pending).kind, BbKind::Ret);
        assert!(!cfg.block(pending).incomplete);
    }

    #[test]
    fn test_label_splits_complete_block() {
        let mut cfg = Cfg::new();
        let s1 = assign(&mut cfg, Exp::reg(24), Exp::int(1));
        let s2 = assign(&mut cfg, Exp::reg(25), Exp::int(2));
        let b0 = cfg
            .new_bb(
                vec![
                    Rtl::with_stmts(0x1000, vec![s1]),
                    Rtl::with_stmts(0x1004, vec![s2]),
                ],
                BbKind::Ret,
            )
            .block();
        let mut cur = Some(b0);
        assert!(cfg.label(0x1004, &mut cur));

        let bottom = cfg.block_at_addr(0x1004).unwrap();
        assert_ne!(bottom, b0);
        assert_eq!(cfg.block(b0).kind, BbKind::Fall);
        assert_eq!(cfg.block(b0).succs, vec![bottom]);
        assert_eq!(cfg.block(bottom).kind, BbKind::Ret);
        assert_eq!(cfg.stmt(s2).bb, bottom);
        // The decode frontier moved into the bottom half.
        assert_eq!(cur, Some(bottom));
    }

    #[test]
    fn test_label_unknown_address_is_not_parsed() {
        let mut cfg = Cfg::new();
        let mut cur = None;
        assert!(!cfg.label(0x2000, &mut cur));
        assert!(cfg.is_incomplete(0x2000));
    }

    #[test]
    fn test_split_preserves_edge_symmetry() {
        let mut cfg = Cfg::new();
        let b0 = cfg
            .new_bb(
                vec![Rtl::new(0x1000), Rtl::new(0x1004)],
                BbKind::Twoway,
            )
            .block();
        let t1 = cfg.new_bb(vec![Rtl::new(0x2000)], BbKind::Ret).block();
        let t2 = cfg.new_bb(vec![Rtl::new(0x3000)], BbKind::Ret).block();
        cfg.add_edge(b0, t1);
        cfg.add_edge(b0, t2);

        let bottom = cfg.split_bb(b0, 0x1004, None, false);
        assert_eq!(cfg.block(b0).succs, vec![bottom]);
        assert_eq!(cfg.block(bottom).succs, vec![t1, t2]);
        assert_eq!(cfg.block(t1).preds, vec![bottom]);
        assert_eq!(cfg.block(t2).preds, vec![bottom]);
        cfg.set_entry_and_exit(b0);
        // Exit resolution finds one of the rets; symmetry must hold.
        assert!(cfg.well_form());
    }

    #[test]
    fn test_merge_bbs() {
        let mut cfg = Cfg::new();
        let s1 = assign(&mut cfg, Exp::reg(24), Exp::int(1));
        let s2 = assign(&mut cfg, Exp::reg(25), Exp::int(2));
        let b0 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![s1])], BbKind::Fall)
            .block();
        let b1 = cfg
            .new_bb(vec![Rtl::with_stmts(0x1004, vec![s2])], BbKind::Ret)
            .block();
        cfg.add_edge(b0, b1);
        assert!(cfg.merge_bbs(b0, b1));
        assert!(!cfg.has_block(b0));
        let merged = cfg.block(b1);
        assert_eq!(merged.rtls.len(), 2);
        assert_eq!(cfg.stmt(s1).bb, b1);
    }

    #[test]
    fn test_compress_removes_goto_only_blocks() {
        let mut cfg = Cfg::new();
        let b0 = cfg.new_bb(vec![Rtl::new(0x1000)], BbKind::Oneway).block();
        let g = cfg.add_stmt(StatementKind::Goto(GotoStatement {
            dest: Exp::int(0x3000),
            is_computed: false,
        }));
        let trampoline = cfg
            .new_bb(vec![Rtl::with_stmts(0x2000, vec![g])], BbKind::Oneway)
            .block();
        let b2 = cfg.new_bb(vec![Rtl::new(0x3000)], BbKind::Ret).block();
        cfg.add_edge(b0, trampoline);
        cfg.add_edge(trampoline, b2);
        cfg.set_entry_and_exit(b0);

        assert!(cfg.compress());
        assert!(!cfg.has_block(trampoline));
        assert_eq!(cfg.block(b0).succs, vec![b2]);
        assert_eq!(cfg.block(b2).preds, vec![b0]);
        assert!(cfg.well_form());
    }

    #[test]
    fn test_remove_orphans() {
        let mut cfg = Cfg::new();
        let b0 = cfg.new_bb(vec![Rtl::new(0x1000)], BbKind::Ret).block();
        let orphan = cfg.new_bb(vec![Rtl::new(0x2000)], BbKind::Fall).block();
        cfg.set_entry_and_exit(b0);
        assert!(cfg.remove_orphan_bbs());
        assert!(!cfg.has_block(orphan));
        assert!(cfg.has_block(b0));
    }

    #[test]
    fn test_dft_order_fails_on_disconnected_graph() {
        let mut cfg = Cfg::new();
        let b0 = cfg.new_bb(vec![Rtl::new(0x1000)], BbKind::Ret).block();
        cfg.new_bb(vec![Rtl::new(0x2000)], BbKind::Fall);
        cfg.set_entry_and_exit(b0);
        assert!(cfg.establish_dft_order().is_err());
    }

    #[test]
    fn test_find_ret_node_falls_back_to_noreturn_call() {
        let mut cfg = Cfg::new();
        let b0 = cfg.new_bb(vec![Rtl::new(0x1000)], BbKind::Call).block();
        assert_eq!(cfg.find_ret_node(), Some(b0));
    }
}
