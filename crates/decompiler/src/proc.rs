//! Procedures: signature, locals, symbol map, and the bookkeeping the
//! decompilation passes hang off.
//!
//! A `Procedure` owns its CFG (which owns the statement arena) and its
//! data-flow state. Cross-procedure links are `ProcId`s resolved through the
//! program; nothing here owns another procedure.

use std::collections::BTreeMap;

use tracing::debug;

use crate::cfg::Cfg;
use crate::dataflow::{DataFlow, UseCollector};
use crate::exp::{Exp, ExpSet};
use crate::operators::Operator;
use crate::prog::ProcId;
use crate::rtl::Rtl;
use crate::stmt::{Assign, ImplicitAssign, StatementKind, StmtId};
use crate::types::Type;
use crate::Address;

/// Calling convention of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    /// Nothing promoted yet; parameters and returns are discovered.
    #[default]
    Unknown,
    /// Caller-cleanup C convention.
    C,
    /// Callee-cleanup (Pascal/stdcall-like).
    Pascal,
}

/// One formal parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SigParam {
    pub name: String,
    pub exp: Exp,
    pub ty: Type,
}

/// One formal return.
#[derive(Debug, Clone, PartialEq)]
pub struct SigReturn {
    pub exp: Exp,
    pub ty: Type,
}

/// A procedure signature. For library procedures it also carries the
/// convention's preservation facts, which stand in for a body to prove
/// them against.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Signature {
    pub name: String,
    pub params: Vec<SigParam>,
    pub returns: Vec<SigReturn>,
    pub conv: CallConv,
    pub stack_register: Option<i64>,
    /// Locations the convention preserves (callee-save registers).
    pub preserved: Vec<Exp>,
    /// Net stack-pointer adjustment on return, when the convention fixes it.
    pub sp_delta: Option<i64>,
    pub variadic: bool,
}

impl Signature {
    pub fn new(name: impl Into<String>) -> Self {
        Signature { name: name.into(), ..Signature::default() }
    }

    pub fn add_param(&mut self, name: impl Into<String>, exp: Exp, ty: Type) {
        self.params.push(SigParam { name: name.into(), exp, ty });
    }

    pub fn add_return(&mut self, exp: Exp, ty: Type) {
        self.returns.push(SigReturn { exp, ty });
    }

    pub fn has_param_exp(&self, e: &Exp) -> bool {
        self.params.iter().any(|p| &p.exp == e)
    }

    /// What this signature proves about `left` without a body: either a
    /// preserved location (`left = left`) or a fixed sp adjustment.
    pub fn proven_for(&self, left: &Exp) -> Option<Exp> {
        if self.preserved.contains(left) {
            return Some(left.clone());
        }
        if let (Some(sp), Some(delta)) = (self.stack_register, self.sp_delta) {
            if left.is_reg_n(sp) {
                return Some(
                    Exp::binary(Operator::Plus, Exp::reg(sp), Exp::int(delta)).simplify(),
                );
            }
        }
        None
    }

    /// Promotion: once the stack pointer is proved preserved modulo a
    /// constant, the signature is a known convention and parameter/return
    /// discovery can trust its shapes.
    pub fn promote(&mut self, sp_preserved: bool) {
        if self.conv == CallConv::Unknown && sp_preserved {
            self.conv = CallConv::C;
        }
    }

    pub fn is_promoted(&self) -> bool {
        self.conv != CallConv::Unknown
    }
}

/// Decompilation progress of a procedure; strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcStatus {
    Undecoded,
    Decoded,
    Visited,
    InCycle,
    EarlyDone,
    Preserveds,
    Final,
    CodeGenerated,
}

/// A user or library procedure.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub id: ProcId,
    pub name: String,
    pub addr: Address,
    pub is_lib: bool,
    pub no_return: bool,
    pub signature: Signature,
    pub status: ProcStatus,
    pub cfg: Cfg,
    pub df: DataFlow,
    /// Final parameters, assignment-shaped as the emitter expects.
    pub parameters: Vec<ImplicitAssign>,
    /// Local name -> type.
    pub locals: BTreeMap<String, Type>,
    /// Expression (usually a ref) -> local/param expression.
    pub symbol_map: BTreeMap<Exp, Exp>,
    /// Proven `lhs = rhs` facts.
    pub proven_true: BTreeMap<Exp, Exp>,
    /// Premises assumed while proving inside a recursion group.
    pub recur_premises: BTreeMap<Exp, Exp>,
    /// Locations whose address escapes; never propagate into or past them.
    pub addr_escaped: ExpSet,
    /// Uses reaching the entry: the initial parameter candidates.
    pub entry_uses: UseCollector,
    /// Members of this procedure's recursion group, when in one.
    pub cycle_group: Option<std::collections::BTreeSet<ProcId>>,
    /// The single return statement, once known.
    pub return_stmt: Option<StmtId>,
    pub callees: Vec<ProcId>,
    next_local: u32,
}

impl Procedure {
    pub fn new(id: ProcId, name: impl Into<String>, addr: Address, is_lib: bool) -> Self {
        let name = name.into();
        Procedure {
            id,
            signature: Signature::new(name.clone()),
            name,
            addr,
            is_lib,
            no_return: false,
            status: if is_lib { ProcStatus::Final } else { ProcStatus::Undecoded },
            cfg: Cfg::new(),
            df: DataFlow::new(),
            parameters: Vec::new(),
            locals: BTreeMap::new(),
            symbol_map: BTreeMap::new(),
            proven_true: BTreeMap::new(),
            recur_premises: BTreeMap::new(),
            addr_escaped: ExpSet::new(),
            entry_uses: UseCollector::new(),
            cycle_group: None,
            return_stmt: None,
            callees: Vec::new(),
            next_local: 0,
        }
    }

    pub fn set_status(&mut self, s: ProcStatus) {
        if self.status != s {
            debug!("{}: status {:?} -> {:?}", self.name, self.status, s);
            self.status = s;
        }
    }

    /// True if any RTL of this procedure covers `addr`.
    pub fn contains_addr(&self, addr: Address) -> bool {
        self.cfg.block_ids().iter().any(|b| {
            let bb = self.cfg.block(*b);
            !bb.incomplete && bb.low_addr <= addr && addr <= bb.high_addr
        })
    }

    pub fn get_statements(&self) -> Vec<StmtId> {
        self.cfg.statements_in_order()
    }

    /// Remove a statement from its RTL and the arena.
    pub fn remove_statement(&mut self, sid: StmtId) {
        let Some(bb) = self.cfg.try_stmt(sid).map(|s| s.bb) else { return };
        if self.cfg.has_block(bb) {
            for rtl in &mut self.cfg.block_mut(bb).rtls {
                if rtl.remove_stmt(sid) {
                    break;
                }
            }
        }
        if self.return_stmt == Some(sid) {
            self.return_stmt = None;
        }
        self.cfg.stmts.remove(sid);
    }

    /// Insert `lhs := rhs` immediately after an existing statement (in the
    /// same RTL); used when de-SSA materialises phi copies.
    pub fn insert_assign_after(&mut self, after: Option<StmtId>, lhs: Exp, rhs: Exp) -> StmtId {
        let sid = self.cfg.add_stmt(StatementKind::Assign(Assign::new(lhs, rhs)));
        match after {
            Some(a) if self.cfg.stmts.contains(a) => {
                let bb = self.cfg.stmt(a).bb;
                self.cfg.stmt_mut(sid).bb = bb;
                for rtl in &mut self.cfg.block_mut(bb).rtls {
                    if let Some(pos) = rtl.stmts.iter().position(|s| *s == a) {
                        rtl.stmts.insert(pos + 1, sid);
                        return sid;
                    }
                }
                // Statement exists but is not in a RTL; append a fresh one.
                self.cfg.block_mut(bb).rtls.push(Rtl::with_stmts(0, vec![sid]));
                sid
            }
            _ => {
                // No anchor: front of the entry block.
                if let Some(entry) = self.cfg.entry {
                    self.cfg.stmt_mut(sid).bb = entry;
                    crate::dataflow::prepend_stmt(&mut self.cfg, entry, sid);
                }
                sid
            }
        }
    }

    // ---- locals and symbols -----------------------------------------------

    /// Next fresh local name for an expression of the given shape.
    pub fn new_local_name(&mut self) -> String {
        let name = format!("local{}", self.next_local);
        self.next_local += 1;
        name
    }

    /// Create a new local of the given type and return its expression.
    pub fn new_local(&mut self, ty: Type) -> Exp {
        let name = self.new_local_name();
        debug!("{}: new local {} of type {}", self.name, name, ty);
        self.locals.insert(name.clone(), ty);
        Exp::local(name)
    }

    pub fn add_local(&mut self, name: impl Into<String>, ty: Type) {
        self.locals.insert(name.into(), ty);
    }

    pub fn local_type(&self, name: &str) -> Option<&Type> {
        self.locals.get(name)
    }

    pub fn set_local_type(&mut self, name: &str, ty: Type) {
        if let Some(t) = self.locals.get_mut(name) {
            *t = ty;
        }
    }

    /// Map `from` (usually a subscripted location) to a local or parameter.
    pub fn map_symbol_to(&mut self, from: Exp, to: Exp) {
        self.symbol_map.insert(from, to);
    }

    pub fn symbol_for(&self, from: &Exp) -> Option<&Exp> {
        self.symbol_map.get(from)
    }

    /// Symbol for a ref, trying the exact ref first and then its base
    /// subscripted anywhere.
    pub fn lookup_sym_from_ref_any(&self, r: &Exp) -> Option<&Exp> {
        if let Some(s) = self.symbol_map.get(r) {
            return Some(s);
        }
        let (base, _) = r.as_ref_parts()?;
        self.symbol_map
            .iter()
            .find(|(k, _)| match k.as_ref_parts() {
                Some((kb, _)) => kb == base,
                None => k == &base,
            })
            .map(|(_, v)| v)
    }

    /// Name of the local for an expression, if one is mapped.
    pub fn find_local<'a>(&'a self, e: &'a Exp) -> Option<&'a str> {
        if let Exp::Unary(Operator::Local, name) = e {
            return name.str_value();
        }
        self.symbol_map.get(e).and_then(|s| match s {
            Exp::Unary(Operator::Local, name) => name.str_value(),
            _ => None,
        })
    }

    /// First symbol (local or param) mapped for `e`.
    pub fn find_first_symbol(&self, e: &Exp) -> Option<&Exp> {
        self.symbol_map.get(e)
    }

    /// The expression a named local or parameter stands for.
    pub fn exp_from_symbol(&self, name: &str) -> Option<&Exp> {
        self.symbol_map
            .iter()
            .find(|(_, v)| match v {
                Exp::Unary(Operator::Local, n) | Exp::Unary(Operator::Param, n) => {
                    n.str_value() == Some(name)
                }
                _ => false,
            })
            .map(|(k, _)| k)
    }

    // ---- proofs ------------------------------------------------------------

    /// What is proven about `left`, body-based for user procedures and
    /// convention-based for library procedures.
    pub fn get_proven(&self, left: &Exp) -> Option<Exp> {
        if self.is_lib {
            return self.signature.proven_for(left);
        }
        self.proven_true.get(left).cloned()
    }

    pub fn get_premised(&self, left: &Exp) -> Option<Exp> {
        self.recur_premises.get(left).cloned()
    }

    pub fn set_premise(&mut self, e: Exp) {
        self.recur_premises.insert(e.clone(), e);
    }

    pub fn kill_premise(&mut self, e: &Exp) {
        self.recur_premises.remove(e);
    }

    /// True when `left = left` is proven.
    pub fn is_preserved(&self, left: &Exp) -> bool {
        self.get_proven(left).map(|r| &r == left).unwrap_or(false)
    }

    // ---- filters -----------------------------------------------------------

    /// Locations that never appear in a return set: the pc, the stack
    /// pointer, and the condition-code machinery.
    pub fn filter_returns(&self, e: &Exp) -> bool {
        if self.is_preserved(e) {
            return true;
        }
        match e {
            Exp::Terminal(Operator::Pc)
            | Exp::Terminal(Operator::Flags)
            | Exp::Terminal(Operator::FFlags)
            | Exp::Terminal(Operator::CarryFlag)
            | Exp::Terminal(Operator::ZeroFlag) => true,
            Exp::Unary(Operator::Temp, _) => true,
            _ => match self.signature.stack_register {
                Some(sp) => e.is_reg_n(sp),
                None => false,
            },
        }
    }

    /// Locations that never become parameters.
    pub fn filter_params(&self, e: &Exp) -> bool {
        match e {
            Exp::Terminal(_) => true,
            Exp::Unary(Operator::Temp, _) => true,
            Exp::Unary(Operator::MemOf, addr) => {
                // Memory above the stack frame can be a parameter; memory
                // based on anything else cannot.
                match self.signature.stack_register {
                    Some(sp) => {
                        let mut uses_sp = false;
                        addr.visit(&mut |x| {
                            if x.is_reg_n(sp) {
                                uses_sp = true;
                            }
                            true
                        });
                        !uses_sp
                    }
                    None => true,
                }
            }
            _ => match self.signature.stack_register {
                Some(sp) => e.is_reg_n(sp),
                None => false,
            },
        }
    }

    /// Matches `m[sp{-} ± K]` and bare sp-relative forms: candidate locals
    /// and parameters.
    pub fn is_local_or_param_pattern(&self, e: &Exp) -> bool {
        let Some(sp) = self.signature.stack_register else { return false };
        let Exp::Unary(Operator::MemOf, addr) = e else { return false };
        let is_sp_implicit = |x: &Exp| match x.as_ref_parts() {
            Some((base, None)) => base.is_reg_n(sp),
            _ => x.is_reg_n(sp),
        };
        match addr.as_ref() {
            Exp::Binary(Operator::Plus, a, b) | Exp::Binary(Operator::Minus, a, b) => {
                is_sp_implicit(a) && b.is_int_const()
            }
            other => is_sp_implicit(other),
        }
    }

    /// Record an address-escaped location.
    pub fn mark_addr_escaped(&mut self, e: Exp) {
        self.addr_escaped.insert(e);
    }

    pub fn is_addr_escaped(&self, e: &Exp) -> bool {
        self.addr_escaped.contains(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::BbKind;

    fn user_proc() -> Procedure {
        let mut p = Procedure::new(ProcId(0), "test", 0x123, false);
        p.signature.stack_register = Some(28);
        p
    }

    #[test]
    fn test_new_local_names_are_fresh() {
        let mut p = user_proc();
        let a = p.new_local(Type::signed_int(32));
        let b = p.new_local(Type::signed_int(32));
        assert_eq!(a, Exp::local("local0"));
        assert_eq!(b, Exp::local("local1"));
        assert_eq!(p.local_type("local0"), Some(&Type::signed_int(32)));
    }

    #[test]
    fn test_symbol_lookup_from_ref() {
        let mut p = user_proc();
        let r = Exp::subscript(Exp::reg(24), StmtId(5));
        p.map_symbol_to(r.clone(), Exp::local("local0"));
        assert_eq!(p.symbol_for(&r), Some(&Exp::local("local0")));
        // Any-subscript lookup finds it through a different subscript.
        let r2 = Exp::subscript(Exp::reg(24), StmtId(9));
        assert_eq!(p.lookup_sym_from_ref_any(&r2), Some(&Exp::local("local0")));
    }

    #[test]
    fn test_filters() {
        let p = user_proc();
        assert!(p.filter_returns(&Exp::terminal(Operator::Pc)));
        assert!(p.filter_returns(&Exp::reg(28)));
        assert!(!p.filter_returns(&Exp::reg(24)));
        assert!(p.filter_params(&Exp::reg(28)));
        assert!(!p.filter_params(&Exp::reg(24)));
        // sp-relative memory can be a parameter
        assert!(!p.filter_params(&Exp::mem(Exp::binary(
            Operator::Plus,
            Exp::reg(28),
            Exp::int(4)
        ))));
    }

    #[test]
    fn test_local_or_param_pattern() {
        let p = user_proc();
        let e = Exp::mem(Exp::binary(
            Operator::Minus,
            Exp::subscript_implicit(Exp::reg(28)),
            Exp::int(8),
        ));
        assert!(p.is_local_or_param_pattern(&e));
        let not = Exp::mem(Exp::subscript_implicit(Exp::reg(24)));
        assert!(!p.is_local_or_param_pattern(&not));
    }

    #[test]
    fn test_lib_proc_proven_from_signature() {
        let mut p = Procedure::new(ProcId(1), "libf", 0x2000, true);
        p.signature.stack_register = Some(28);
        p.signature.sp_delta = Some(4);
        p.signature.preserved.push(Exp::reg(29));
        assert_eq!(p.get_proven(&Exp::reg(29)), Some(Exp::reg(29)));
        assert!(p.is_preserved(&Exp::reg(29)));
        assert_eq!(
            p.get_proven(&Exp::reg(28)),
            Some(Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)))
        );
        assert_eq!(p.get_proven(&Exp::reg(24)), None);
    }

    #[test]
    fn test_remove_statement_unlinks_rtl() {
        let mut p = user_proc();
        let sid = p
            .cfg
            .add_stmt(StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(5))));
        let b = p
            .cfg
            .new_bb(vec![Rtl::with_stmts(0x1000, vec![sid])], BbKind::Ret)
            .block();
        p.cfg.set_entry_and_exit(b);
        p.remove_statement(sid);
        assert!(p.cfg.try_stmt(sid).is_none());
        assert!(p.cfg.block(b).rtls[0].is_empty());
    }
}
