//! Register transfer lists.
//!
//! An RTL is the ordered list of statements produced for one instruction
//! address. Synthetic RTLs (phi placement, implicit definitions, copies
//! inserted during de-SSA) carry address zero.

use crate::stmt::StmtId;
use crate::Address;

/// One instruction's worth of statements.
#[derive(Debug, Clone, Default)]
pub struct Rtl {
    pub addr: Address,
    pub stmts: Vec<StmtId>,
}

impl Rtl {
    pub fn new(addr: Address) -> Self {
        Rtl { addr, stmts: Vec::new() }
    }

    pub fn with_stmts(addr: Address, stmts: Vec<StmtId>) -> Self {
        Rtl { addr, stmts }
    }

    /// True for RTLs that do not correspond to a source instruction.
    pub fn is_synthetic(&self) -> bool {
        self.addr == 0
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn last(&self) -> Option<StmtId> {
        self.stmts.last().copied()
    }

    pub fn remove_stmt(&mut self, id: StmtId) -> bool {
        let before = self.stmts.len();
        self.stmts.retain(|s| *s != id);
        self.stmts.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_rtls_have_zero_address() {
        assert!(Rtl::new(0).is_synthetic());
        assert!(!Rtl::new(0x1000).is_synthetic());
    }

    #[test]
    fn test_remove_stmt() {
        let mut r = Rtl::with_stmts(0x1000, vec![StmtId(1), StmtId(2)]);
        assert!(r.remove_stmt(StmtId(1)));
        assert!(!r.remove_stmt(StmtId(1)));
        assert_eq!(r.stmts, vec![StmtId(2)]);
    }
}
