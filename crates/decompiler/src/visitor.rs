//! Double-dispatch traversal for external consumers.
//!
//! Inside the engine, passes use explicit matches and the closure-based
//! `visit`/`map_bottom_up` on expressions directly. These traits are the
//! stable surface for an emitter or analysis plugin that wants to walk
//! statements and expressions without knowing every variant.

use crate::exp::Exp;
use crate::stmt::{Statement, StatementKind};

/// Read-only expression visitor. `visit` runs pre-order; returning false
/// skips the node's children.
pub trait ExpVisitor {
    fn visit(&mut self, e: &Exp) -> bool;
}

/// Rewriting visitor; applied bottom-up to every node.
pub trait ExpRewriter {
    fn rewrite(&mut self, e: Exp) -> Exp;
}

impl Exp {
    pub fn accept<V: ExpVisitor>(&self, v: &mut V) {
        self.visit(&mut |e| v.visit(e));
    }

    pub fn accept_rewriter<R: ExpRewriter>(self, r: &mut R) -> Exp {
        self.map_bottom_up(&mut |e| r.rewrite(e))
    }
}

/// Statement visitor: one callback per statement kind, all defaulting to
/// the catch-all.
pub trait StmtVisitor {
    fn visit_stmt(&mut self, _s: &Statement) {}

    fn visit(&mut self, s: &Statement) {
        self.visit_stmt(s);
    }
}

/// Visits every expression of a statement with an expression visitor.
pub struct StmtExpVisitor<'a, V: ExpVisitor> {
    pub ev: &'a mut V,
}

impl<'a, V: ExpVisitor> StmtExpVisitor<'a, V> {
    pub fn new(ev: &'a mut V) -> Self {
        StmtExpVisitor { ev }
    }

    pub fn visit(&mut self, s: &Statement) {
        s.for_each_exp(&mut |e| e.accept(self.ev));
        // Phi operands are not ordinary child expressions but still count
        // as uses for a visitor.
        if let StatementKind::Phi(p) = &s.kind {
            for op in p.filled() {
                op.as_ref_exp().accept(self.ev);
            }
        }
    }
}

/// Rewrites every expression of a statement with an expression rewriter.
pub struct StmtModifier<'a, R: ExpRewriter> {
    pub er: &'a mut R,
}

impl<'a, R: ExpRewriter> StmtModifier<'a, R> {
    pub fn new(er: &'a mut R) -> Self {
        StmtModifier { er }
    }

    pub fn visit(&mut self, s: &mut Statement) {
        let er = &mut *self.er;
        s.map_exps(&mut |e| e.map_bottom_up(&mut |x| er.rewrite(x)));
    }
}

/// Collects every subscripted ref, a common visitor need.
#[derive(Debug, Default)]
pub struct RefCollector {
    pub refs: Vec<Exp>,
}

impl ExpVisitor for RefCollector {
    fn visit(&mut self, e: &Exp) -> bool {
        if e.is_subscript() {
            self.refs.push(e.clone());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::BlockId;
    use crate::operators::Operator;
    use crate::stmt::{Assign, StmtId};

    #[test]
    fn test_ref_collector_via_stmt_exp_visitor() {
        let s = Statement {
            id: StmtId(0),
            bb: BlockId(0),
            kind: StatementKind::Assign(Assign::new(
                Exp::reg(25),
                Exp::binary(
                    Operator::Plus,
                    Exp::subscript(Exp::reg(24), StmtId(1)),
                    Exp::subscript(Exp::reg(26), StmtId(2)),
                ),
            )),
        };
        let mut rc = RefCollector::default();
        StmtExpVisitor::new(&mut rc).visit(&s);
        assert_eq!(rc.refs.len(), 2);
    }

    #[test]
    fn test_rewriter_through_stmt_modifier() {
        struct ConstDoubler;
        impl ExpRewriter for ConstDoubler {
            fn rewrite(&mut self, e: Exp) -> Exp {
                match e.int_value() {
                    Some(i) => Exp::int(i * 2),
                    None => e,
                }
            }
        }
        let mut s = Statement {
            id: StmtId(0),
            bb: BlockId(0),
            kind: StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(21))),
        };
        let mut d = ConstDoubler;
        StmtModifier::new(&mut d).visit(&mut s);
        assert_eq!(s.as_assign().unwrap().rhs, Exp::int(42));
    }
}
