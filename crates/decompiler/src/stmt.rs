//! The statement layer.
//!
//! A statement is one step of an RTL: an assignment of some kind, a call, a
//! branch, a computed jump, or a return. Statements live in a per-procedure
//! arena; their arena id doubles as the SSA subscript identity, so removing
//! a statement never renumbers the survivors.

use std::fmt;

use crate::cfg::BlockId;
use crate::dataflow::{DefCollector, UseCollector};
use crate::exp::{Exp, ExpSet};
use crate::frontend::SwitchInfo;
use crate::operators::Operator;
use crate::proc::Signature;
use crate::prog::ProcId;
use crate::types::Type;
use crate::Address;

/// Identity of a statement within its procedure's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StmtId(pub u32);

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// High-level classification of a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchType {
    Equal,
    NotEqual,
    SignedLess,
    SignedLessEq,
    SignedGreaterEq,
    SignedGreater,
    UnsignedLess,
    UnsignedLessEq,
    UnsignedGreaterEq,
    UnsignedGreater,
    Minus,
    Positive,
    Overflow,
    NoOverflow,
    Parity,
}

impl BranchType {
    /// The comparison operator this branch kind stands for, where one exists.
    pub fn comparison(self) -> Option<Operator> {
        match self {
            BranchType::Equal => Some(Operator::Equals),
            BranchType::NotEqual => Some(Operator::NotEqual),
            BranchType::SignedLess => Some(Operator::Less),
            BranchType::SignedLessEq => Some(Operator::LessEq),
            BranchType::SignedGreaterEq => Some(Operator::GreaterEq),
            BranchType::SignedGreater => Some(Operator::Greater),
            BranchType::UnsignedLess => Some(Operator::LessUns),
            BranchType::UnsignedLessEq => Some(Operator::LessEqUns),
            BranchType::UnsignedGreaterEq => Some(Operator::GreaterEqUns),
            BranchType::UnsignedGreater => Some(Operator::GreaterUns),
            _ => None,
        }
    }
}

/// Ordinary assignment `lhs := rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub ty: Type,
    pub lhs: Exp,
    pub rhs: Exp,
}

impl Assign {
    pub fn new(lhs: Exp, rhs: Exp) -> Self {
        Assign { ty: Type::Void, lhs, rhs }
    }

    pub fn typed(ty: Type, lhs: Exp, rhs: Exp) -> Self {
        Assign { ty, lhs, rhs }
    }
}

impl fmt::Display for Assign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*{}* {} := {}", self.ty, self.lhs, self.rhs)
    }
}

/// One incoming value of a phi-assignment: the base expression as defined by
/// `def` (or by the implicit entry state when `None`).
#[derive(Debug, Clone, PartialEq)]
pub struct PhiOperand {
    pub exp: Exp,
    pub def: Option<StmtId>,
}

impl PhiOperand {
    /// The ref this operand denotes.
    pub fn as_ref_exp(&self) -> Exp {
        Exp::Ref(Box::new(self.exp.clone()), self.def)
    }
}

/// Phi-assignment placed at a join point. One operand slot per predecessor
/// block; a slot may be unfilled only transiently during renaming.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiAssign {
    pub ty: Type,
    pub lhs: Exp,
    pub operands: Vec<(BlockId, Option<PhiOperand>)>,
}

impl PhiAssign {
    pub fn new(lhs: Exp, preds: &[BlockId]) -> Self {
        PhiAssign {
            ty: Type::Void,
            lhs,
            operands: preds.iter().map(|p| (*p, None)).collect(),
        }
    }

    pub fn set_operand(&mut self, pred: BlockId, exp: Exp, def: Option<StmtId>) {
        for (p, slot) in &mut self.operands {
            if *p == pred {
                *slot = Some(PhiOperand { exp, def });
                return;
            }
        }
        self.operands.push((pred, Some(PhiOperand { exp, def })));
    }

    /// Filled operands only.
    pub fn filled(&self) -> impl Iterator<Item = &PhiOperand> {
        self.operands.iter().filter_map(|(_, op)| op.as_ref())
    }

    pub fn num_filled(&self) -> usize {
        self.filled().count()
    }
}

/// Synthetic definition at procedure entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplicitAssign {
    pub ty: Type,
    pub lhs: Exp,
}

/// Sets `lhs` to 0 or 1 according to a condition (e.g. x86 SETcc).
#[derive(Debug, Clone, PartialEq)]
pub struct BoolAssign {
    pub ty: Type,
    pub size: u16,
    pub lhs: Exp,
    pub cond: Exp,
    pub is_float: bool,
}

/// A location a call or return defines, with the best type known for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Define {
    pub ty: Type,
    pub lhs: Exp,
}

/// Procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatement {
    /// Destination expression; a function constant once resolved.
    pub dest: Exp,
    /// Resolved callee, if known.
    pub dest_proc: Option<ProcId>,
    /// Callee signature snapshot used to build arguments.
    pub signature: Option<Signature>,
    /// Arguments: callee-side lhs := caller-side value.
    pub arguments: Vec<Assign>,
    /// Locations this call defines, from the callee's modifieds ∩ liveness.
    pub defines: Vec<Define>,
    /// False for calls to no-return procedures.
    pub returns_after: bool,
    /// Computed call (destination not a constant).
    pub is_computed: bool,
    /// Locations live after this call (fills in during liveness).
    pub use_col: UseCollector,
    /// Definitions reaching this call (fills in during renaming).
    pub def_col: DefCollector,
    /// The callee's return statement, once the callee has one. A call with
    /// no link is "childless" and defines everything live after it.
    pub callee_return: Option<StmtId>,
}

impl CallStatement {
    pub fn new(dest: Exp) -> Self {
        let is_computed = !dest.is_func_const() && !dest.is_int_const();
        CallStatement {
            dest,
            dest_proc: None,
            signature: None,
            arguments: Vec::new(),
            defines: Vec::new(),
            returns_after: true,
            is_computed,
            use_col: UseCollector::new(),
            def_col: DefCollector::new(),
            callee_return: None,
        }
    }

    pub fn is_childless(&self) -> bool {
        self.callee_return.is_none()
    }

    /// Rewrite a callee-side expression into caller terms by substituting
    /// every location with its reaching definition at this call site.
    /// Locations with no recorded definition get the implicit subscript.
    pub fn localise_exp(&self, e: Exp) -> Exp {
        let def_col = &self.def_col;
        e.map_bottom_up(&mut |node| {
            if node.is_subscript() || !node.is_location() {
                return node;
            }
            match def_col.def_for(&node) {
                Some(rhs) => rhs.clone(),
                None => Exp::Ref(Box::new(node), None),
            }
        })
    }

    /// The locations this call produces, as the caller sees them.
    pub fn calc_results(&self) -> Vec<Exp> {
        self.defines.iter().map(|d| d.lhs.clone()).collect()
    }

    /// Argument value passed for a callee-side parameter location.
    pub fn arg_value_for(&self, param: &Exp) -> Option<&Exp> {
        self.arguments.iter().find(|a| &a.lhs == param).map(|a| &a.rhs)
    }
}

/// Conditional branch.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchStatement {
    pub dest: Exp,
    pub cond: Exp,
    pub branch_type: BranchType,
    pub is_float: bool,
}

impl BranchStatement {
    pub fn new(dest: Address) -> Self {
        BranchStatement {
            dest: Exp::int(dest as i64),
            cond: Exp::terminal(Operator::Flags),
            branch_type: BranchType::Equal,
            is_float: false,
        }
    }

    /// Set the branch kind; rebuilds a default condition on the flags when
    /// none better is known.
    pub fn set_cond_type(&mut self, bt: BranchType, is_float: bool) {
        self.branch_type = bt;
        self.is_float = is_float;
        if self.cond == Exp::terminal(Operator::Flags) {
            if let Some(cmp) = bt.comparison() {
                self.cond = Exp::binary(cmp, Exp::terminal(Operator::Flags), Exp::int(0));
            }
        }
    }

    pub fn fixed_dest(&self) -> Option<Address> {
        self.dest.int_value().map(|i| i as Address)
    }

    /// Rewrite a flag-call condition into the relational test this branch
    /// kind implies, once propagation has substituted the flag definition.
    /// `SUBFLAGS(a, b, r)` compares a against b, `LOGICALFLAGS(r)` compares
    /// r against zero, `SETFFLAGS(a, b)` is the floating variant.
    pub fn cond_to_relational(&mut self) {
        if let Some((cond, is_float)) = flag_call_to_relational(&self.cond, self.branch_type) {
            self.cond = cond.simplify();
            if is_float {
                self.is_float = true;
            }
        }
    }
}

/// Shared flag-call recognition for branches and set-on-condition
/// assignments. Accepts the bare flag call or the decoder's
/// `FLAGCALL(...) cmp 0` wrapping.
pub fn flag_call_to_relational(cond: &Exp, bt: BranchType) -> Option<(Exp, bool)> {
    let call = match cond {
        Exp::FlagCall(_, _) => cond,
        Exp::Binary(op, l, r)
            if op.is_comparison()
                && matches!(l.as_ref(), Exp::FlagCall(_, _))
                && r.int_value() == Some(0) =>
        {
            l.as_ref()
        }
        _ => return None,
    };
    let Exp::FlagCall(name, args) = call else { return None };

    if name.starts_with("SUBFLAGS") && args.len() >= 2 {
        let a = args[0].clone();
        let b = args[1].clone();
        return match bt.comparison() {
            Some(cmp) => Some((Exp::binary(cmp, a, b), false)),
            None => {
                // Sign/overflow kinds test the subtraction result itself.
                let result = args.get(2).cloned()?;
                let cmp = match bt {
                    BranchType::Minus => Operator::Less,
                    BranchType::Positive => Operator::GreaterEq,
                    _ => return None,
                };
                Some((Exp::binary(cmp, result, Exp::int(0)), false))
            }
        };
    }
    if name.starts_with("LOGICALFLAGS") && !args.is_empty() {
        let cmp = bt.comparison()?;
        return Some((Exp::binary(cmp, args[0].clone(), Exp::int(0)), false));
    }
    if name.starts_with("SETFFLAGS") && args.len() >= 2 {
        let cmp = bt.comparison()?;
        return Some((Exp::binary(cmp, args[0].clone(), args[1].clone()), true));
    }
    if name.starts_with("INCDECFLAGS") && !args.is_empty() {
        let cmp = bt.comparison()?;
        return Some((Exp::binary(cmp, args[0].clone(), Exp::int(0)), false));
    }
    None
}

/// Computed N-way jump, usually a switch.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseStatement {
    pub dest: Exp,
    pub switch_info: Option<SwitchInfo>,
}

/// Return from the enclosing procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStatement {
    /// Locations the procedure modifies (preservation-filtered).
    pub modifieds: Vec<Define>,
    /// Value returns `loc := value-at-exit`.
    pub returns: Vec<Assign>,
    /// Definitions reaching the exit.
    pub col: DefCollector,
    /// Address of the return instruction.
    pub ret_addr: Address,
}

impl ReturnStatement {
    pub fn new() -> Self {
        ReturnStatement {
            modifieds: Vec::new(),
            returns: Vec::new(),
            col: DefCollector::new(),
            ret_addr: 0,
        }
    }

    /// The definition reaching the exit for `loc`, if any.
    pub fn find_def_for(&self, loc: &Exp) -> Option<&Exp> {
        self.col.def_for(loc)
    }

    pub fn remove_return(&mut self, loc: &Exp) {
        self.returns.retain(|r| &r.lhs != loc);
    }

    pub fn remove_modified(&mut self, loc: &Exp) {
        self.modifieds.retain(|m| &m.lhs != loc);
    }
}

impl Default for ReturnStatement {
    fn default() -> Self {
        Self::new()
    }
}

/// Unconditional jump; `is_computed` marks register-indirect jumps.
#[derive(Debug, Clone, PartialEq)]
pub struct GotoStatement {
    pub dest: Exp,
    pub is_computed: bool,
}

/// Implicit reference: carries a type for an address expression, nothing else.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpRefStatement {
    pub addr: Exp,
    pub ty: Type,
}

/// The statement sum type.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Assign(Assign),
    Phi(PhiAssign),
    Implicit(ImplicitAssign),
    Bool(BoolAssign),
    Call(CallStatement),
    Branch(BranchStatement),
    Case(CaseStatement),
    Ret(ReturnStatement),
    Goto(GotoStatement),
    ImpRef(ImpRefStatement),
}

/// A statement with its arena identity and enclosing block.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub id: StmtId,
    pub bb: BlockId,
    pub kind: StatementKind,
}

impl Statement {
    pub fn is_assign(&self) -> bool {
        matches!(self.kind, StatementKind::Assign(_))
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, StatementKind::Phi(_))
    }

    pub fn is_implicit(&self) -> bool {
        matches!(self.kind, StatementKind::Implicit(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, StatementKind::Call(_))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, StatementKind::Branch(_))
    }

    pub fn is_return(&self) -> bool {
        matches!(self.kind, StatementKind::Ret(_))
    }

    /// Assignment-shaped: defines exactly one location with a type.
    pub fn is_assignment(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Assign(_)
                | StatementKind::Phi(_)
                | StatementKind::Implicit(_)
                | StatementKind::Bool(_)
        )
    }

    pub fn as_assign(&self) -> Option<&Assign> {
        match &self.kind {
            StatementKind::Assign(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_assign_mut(&mut self) -> Option<&mut Assign> {
        match &mut self.kind {
            StatementKind::Assign(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_phi(&self) -> Option<&PhiAssign> {
        match &self.kind {
            StatementKind::Phi(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_phi_mut(&mut self) -> Option<&mut PhiAssign> {
        match &mut self.kind {
            StatementKind::Phi(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&CallStatement> {
        match &self.kind {
            StatementKind::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_call_mut(&mut self) -> Option<&mut CallStatement> {
        match &mut self.kind {
            StatementKind::Call(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_return(&self) -> Option<&ReturnStatement> {
        match &self.kind {
            StatementKind::Ret(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_return_mut(&mut self) -> Option<&mut ReturnStatement> {
        match &mut self.kind {
            StatementKind::Ret(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_branch(&self) -> Option<&BranchStatement> {
        match &self.kind {
            StatementKind::Branch(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut BranchStatement> {
        match &mut self.kind {
            StatementKind::Branch(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_case_mut(&mut self) -> Option<&mut CaseStatement> {
        match &mut self.kind {
            StatementKind::Case(c) => Some(c),
            _ => None,
        }
    }

    /// The single location defined, for assignment-shaped statements.
    pub fn lhs(&self) -> Option<&Exp> {
        match &self.kind {
            StatementKind::Assign(a) => Some(&a.lhs),
            StatementKind::Phi(p) => Some(&p.lhs),
            StatementKind::Implicit(i) => Some(&i.lhs),
            StatementKind::Bool(b) => Some(&b.lhs),
            _ => None,
        }
    }

    /// `x := x` after simplification.
    pub fn is_null_statement(&self) -> bool {
        match &self.kind {
            StatementKind::Assign(a) => {
                if a.lhs == a.rhs {
                    return true;
                }
                // Also null when the rhs is just a ref of the lhs.
                matches!(&a.rhs, Exp::Ref(base, _) if **base == a.lhs)
            }
            _ => false,
        }
    }

    /// Add every location this statement defines.
    pub fn get_definitions(&self, set: &mut ExpSet) {
        match &self.kind {
            StatementKind::Assign(a) => {
                set.insert(a.lhs.clone());
            }
            StatementKind::Phi(p) => {
                set.insert(p.lhs.clone());
            }
            StatementKind::Implicit(i) => {
                set.insert(i.lhs.clone());
            }
            StatementKind::Bool(b) => {
                set.insert(b.lhs.clone());
            }
            StatementKind::Call(c) => {
                for d in &c.defines {
                    set.insert(d.lhs.clone());
                }
            }
            StatementKind::Ret(r) => {
                for m in &r.modifieds {
                    set.insert(m.lhs.clone());
                }
            }
            _ => {}
        }
    }

    /// True when this statement defines `loc`.
    pub fn defines_loc(&self, loc: &Exp) -> bool {
        let mut defs = ExpSet::new();
        self.get_definitions(&mut defs);
        defs.contains(loc) || defs.contains_match(loc)
    }

    /// The recorded type for a defined location.
    pub fn get_type_for(&self, loc: &Exp) -> Option<&Type> {
        match &self.kind {
            StatementKind::Assign(a) if &a.lhs == loc => Some(&a.ty),
            StatementKind::Phi(p) if &p.lhs == loc => Some(&p.ty),
            StatementKind::Implicit(i) if &i.lhs == loc => Some(&i.ty),
            StatementKind::Bool(b) if &b.lhs == loc => Some(&b.ty),
            StatementKind::Call(c) => {
                c.defines.iter().find(|d| &d.lhs == loc).map(|d| &d.ty)
            }
            StatementKind::Ret(r) => {
                r.modifieds.iter().find(|m| &m.lhs == loc).map(|m| &m.ty)
            }
            StatementKind::ImpRef(i) if &i.addr == loc => Some(&i.ty),
            _ => None,
        }
    }

    /// Set the recorded type for a defined location.
    pub fn set_type_for(&mut self, loc: &Exp, ty: Type) {
        match &mut self.kind {
            StatementKind::Assign(a) if &a.lhs == loc => a.ty = ty,
            StatementKind::Phi(p) if &p.lhs == loc => p.ty = ty,
            StatementKind::Implicit(i) if &i.lhs == loc => i.ty = ty,
            StatementKind::Bool(b) if &b.lhs == loc => b.ty = ty,
            StatementKind::Call(c) => {
                if let Some(d) = c.defines.iter_mut().find(|d| &d.lhs == loc) {
                    d.ty = ty;
                }
            }
            StatementKind::Ret(r) => {
                if let Some(m) = r.modifieds.iter_mut().find(|m| &m.lhs == loc) {
                    m.ty = ty;
                }
            }
            StatementKind::ImpRef(i) if &i.addr == loc => i.ty = ty,
            _ => {}
        }
    }

    /// Meet a pushed-down type into the recorded type for `loc`. The new
    /// type is always stored; `changed` flags only observable movement, so
    /// accumulating evidence cannot keep a fixpoint loop spinning.
    pub fn meet_with_for(&mut self, ty: &Type, loc: &Exp, changed: &mut bool) {
        if let Some(old) = self.get_type_for(loc).cloned() {
            let mut ch = false;
            let new = old.meet_with(ty, &mut ch, false);
            if new != old {
                self.set_type_for(loc, new);
            }
            if ch {
                *changed = true;
            }
        }
    }

    /// Every subscripted or bare location this statement consumes. With
    /// `collectors_too`, calls and returns also report what their collectors
    /// carry.
    pub fn add_used_locs(&self, set: &mut ExpSet, collectors_too: bool) {
        match &self.kind {
            StatementKind::Assign(a) => {
                a.rhs.add_used_locs(set);
                // Writing m[x] reads x.
                if let Exp::Unary(Operator::MemOf, addr) = &a.lhs {
                    addr.add_used_locs(set);
                }
            }
            StatementKind::Phi(p) => {
                for op in p.filled() {
                    set.insert(op.as_ref_exp());
                }
                if let Exp::Unary(Operator::MemOf, addr) = &p.lhs {
                    addr.add_used_locs(set);
                }
            }
            StatementKind::Implicit(_) => {}
            StatementKind::Bool(b) => {
                b.cond.add_used_locs(set);
                if let Exp::Unary(Operator::MemOf, addr) = &b.lhs {
                    addr.add_used_locs(set);
                }
            }
            StatementKind::Call(c) => {
                c.dest.add_used_locs(set);
                for a in &c.arguments {
                    a.rhs.add_used_locs(set);
                }
                if collectors_too {
                    for u in c.use_col.iter() {
                        set.insert(u.clone());
                    }
                }
            }
            StatementKind::Branch(b) => {
                b.cond.add_used_locs(set);
            }
            StatementKind::Case(cs) => {
                cs.dest.add_used_locs(set);
                if let Some(si) = &cs.switch_info {
                    si.scrutinee.add_used_locs(set);
                }
            }
            StatementKind::Ret(r) => {
                for ret in &r.returns {
                    ret.rhs.add_used_locs(set);
                }
                if collectors_too {
                    for d in r.col.iter() {
                        d.rhs.add_used_locs(set);
                    }
                }
            }
            StatementKind::Goto(g) => {
                if g.is_computed {
                    g.dest.add_used_locs(set);
                }
            }
            StatementKind::ImpRef(i) => {
                i.addr.add_used_locs(set);
            }
        }
    }

    /// True when `e` is used (syntactically) by this statement.
    pub fn uses_exp(&self, e: &Exp) -> bool {
        let mut used = ExpSet::new();
        self.add_used_locs(&mut used, false);
        let found = used.iter().any(|u| u == e || u.contains(e));
        found
    }

    /// Apply `f` to every contained expression in use or definition
    /// position. Phi operands and collector contents are excluded; they are
    /// managed by the SSA engine directly.
    pub fn map_exps(&mut self, f: &mut impl FnMut(Exp) -> Exp) {
        fn take(e: &mut Exp, f: &mut impl FnMut(Exp) -> Exp) {
            let owned = std::mem::replace(e, Exp::terminal(Operator::Nil));
            *e = f(owned);
        }
        match &mut self.kind {
            StatementKind::Assign(a) => {
                take(&mut a.lhs, f);
                take(&mut a.rhs, f);
            }
            StatementKind::Phi(p) => take(&mut p.lhs, f),
            StatementKind::Implicit(i) => take(&mut i.lhs, f),
            StatementKind::Bool(b) => {
                take(&mut b.lhs, f);
                take(&mut b.cond, f);
            }
            StatementKind::Call(c) => {
                take(&mut c.dest, f);
                for a in &mut c.arguments {
                    take(&mut a.rhs, f);
                }
            }
            StatementKind::Branch(b) => {
                take(&mut b.cond, f);
            }
            StatementKind::Case(cs) => {
                take(&mut cs.dest, f);
                if let Some(si) = &mut cs.switch_info {
                    take(&mut si.scrutinee, f);
                }
            }
            StatementKind::Ret(r) => {
                for ret in &mut r.returns {
                    take(&mut ret.rhs, f);
                }
            }
            StatementKind::Goto(g) => take(&mut g.dest, f),
            StatementKind::ImpRef(i) => take(&mut i.addr, f),
        }
    }

    /// Apply `f` only to use positions (the left side of an ordinary assign
    /// is a definition, but the address inside a memof left side is a use).
    pub fn map_use_exps(&mut self, f: &mut impl FnMut(Exp) -> Exp) {
        fn take(e: &mut Exp, f: &mut impl FnMut(Exp) -> Exp) {
            let owned = std::mem::replace(e, Exp::terminal(Operator::Nil));
            *e = f(owned);
        }
        fn take_lhs_addr(lhs: &mut Exp, f: &mut impl FnMut(Exp) -> Exp) {
            if let Exp::Unary(Operator::MemOf, addr) = lhs {
                let owned = std::mem::replace(addr.as_mut(), Exp::terminal(Operator::Nil));
                *addr.as_mut() = f(owned);
            }
        }
        match &mut self.kind {
            StatementKind::Assign(a) => {
                take(&mut a.rhs, f);
                take_lhs_addr(&mut a.lhs, f);
            }
            StatementKind::Phi(p) => take_lhs_addr(&mut p.lhs, f),
            StatementKind::Implicit(_) => {}
            StatementKind::Bool(b) => {
                take(&mut b.cond, f);
                take_lhs_addr(&mut b.lhs, f);
            }
            StatementKind::Call(c) => {
                take(&mut c.dest, f);
                for a in &mut c.arguments {
                    take(&mut a.rhs, f);
                }
            }
            StatementKind::Branch(b) => take(&mut b.cond, f),
            StatementKind::Case(cs) => {
                take(&mut cs.dest, f);
                if let Some(si) = &mut cs.switch_info {
                    take(&mut si.scrutinee, f);
                }
            }
            StatementKind::Ret(r) => {
                for ret in &mut r.returns {
                    take(&mut ret.rhs, f);
                }
            }
            StatementKind::Goto(g) => {
                if g.is_computed {
                    take(&mut g.dest, f);
                }
            }
            StatementKind::ImpRef(i) => take(&mut i.addr, f),
        }
    }

    /// Visit every contained expression (same positions as [`map_exps`]).
    pub fn for_each_exp(&self, f: &mut impl FnMut(&Exp)) {
        match &self.kind {
            StatementKind::Assign(a) => {
                f(&a.lhs);
                f(&a.rhs);
            }
            StatementKind::Phi(p) => f(&p.lhs),
            StatementKind::Implicit(i) => f(&i.lhs),
            StatementKind::Bool(b) => {
                f(&b.lhs);
                f(&b.cond);
            }
            StatementKind::Call(c) => {
                f(&c.dest);
                for a in &c.arguments {
                    f(&a.rhs);
                }
            }
            StatementKind::Branch(b) => f(&b.cond),
            StatementKind::Case(cs) => {
                f(&cs.dest);
                if let Some(si) = &cs.switch_info {
                    f(&si.scrutinee);
                }
            }
            StatementKind::Ret(r) => {
                for ret in &r.returns {
                    f(&ret.rhs);
                }
            }
            StatementKind::Goto(g) => f(&g.dest),
            StatementKind::ImpRef(i) => f(&i.addr),
        }
    }

    /// Subscript every use of `loc` with `def` (SSA renaming step).
    pub fn subscript_uses(&mut self, loc: &Exp, def: Option<StmtId>) {
        self.map_use_exps(&mut |e| e.subscript_var(loc, def));
    }

    /// First subtree matching `pattern` in any contained expression.
    pub fn search(&self, pattern: &Exp) -> Option<Exp> {
        let mut found = None;
        self.for_each_exp(&mut |e| {
            if found.is_none() {
                if let Some(hit) = e.search(pattern) {
                    found = Some(hit.clone());
                }
            }
        });
        found
    }

    /// All subtrees matching `pattern` across contained expressions.
    pub fn search_all(&self, pattern: &Exp) -> Vec<Exp> {
        let mut found = Vec::new();
        self.for_each_exp(&mut |e| {
            let mut hits = Vec::new();
            e.search_all(pattern, &mut hits);
            found.extend(hits.into_iter().cloned());
        });
        found
    }

    /// Replace every match of `pattern` with `replacement`; true if changed.
    pub fn search_and_replace(&mut self, pattern: &Exp, replacement: &Exp) -> bool {
        let mut changed = false;
        self.map_exps(&mut |e| {
            let (out, ch) = e.search_replace_all(pattern, replacement);
            changed |= ch;
            out
        });
        changed
    }

    /// Simplify all contained expressions; branch conditions additionally
    /// collapse substituted flag calls into relational tests.
    pub fn simplify(&mut self) {
        self.map_exps(&mut |e| e.simplify());
        if let StatementKind::Branch(b) = &mut self.kind {
            b.cond_to_relational();
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:4} ", self.id.0)?;
        match &self.kind {
            StatementKind::Assign(a) => write!(f, "{a}"),
            StatementKind::Phi(p) => {
                write!(f, "*{}* {} := phi{{", p.ty, p.lhs)?;
                for (i, (_, op)) in p.operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match op {
                        Some(PhiOperand { def: Some(d), .. }) => write!(f, "{d}")?,
                        Some(PhiOperand { def: None, .. }) => write!(f, "-")?,
                        None => write!(f, "⊥")?,
                    }
                }
                write!(f, "}}")
            }
            StatementKind::Implicit(i) => write!(f, "*{}* {} := -", i.ty, i.lhs),
            StatementKind::Bool(b) => write!(f, "BOOL {} := {}", b.lhs, b.cond),
            StatementKind::Call(c) => {
                write!(f, "CALL {}(", c.dest)?;
                for (i, a) in c.arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} := {}", a.lhs, a.rhs)?;
                }
                write!(f, ")")?;
                if !c.defines.is_empty() {
                    write!(f, " {{ defines ")?;
                    for (i, d) in c.defines.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", d.lhs)?;
                    }
                    write!(f, " }}")?;
                }
                Ok(())
            }
            StatementKind::Branch(b) => {
                write!(f, "BRANCH {}, condition {}", b.dest, b.cond)
            }
            StatementKind::Case(c) => write!(f, "CASE [{}]", c.dest),
            StatementKind::Ret(r) => {
                write!(f, "RET")?;
                for (i, ret) in r.returns.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {ret}")?;
                }
                Ok(())
            }
            StatementKind::Goto(g) => {
                if g.is_computed {
                    write!(f, "GOTO [{}]", g.dest)
                } else {
                    write!(f, "GOTO {}", g.dest)
                }
            }
            StatementKind::ImpRef(i) => write!(f, "IMPREF *{}* {}", i.ty, i.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(kind: StatementKind) -> Statement {
        Statement { id: StmtId(0), bb: BlockId(0), kind }
    }

    #[test]
    fn test_assign_use_def_round_trip() {
        let s = stmt(StatementKind::Assign(Assign::new(
            Exp::reg(28),
            Exp::binary(
                Operator::Plus,
                Exp::subscript(Exp::reg(28), StmtId(1)),
                Exp::subscript(Exp::reg(24), StmtId(2)),
            ),
        )));
        let mut used = ExpSet::new();
        s.add_used_locs(&mut used, false);
        assert!(used.contains(&Exp::subscript(Exp::reg(28), StmtId(1))));
        assert!(used.contains(&Exp::subscript(Exp::reg(24), StmtId(2))));
        assert_eq!(used.len(), 2);

        let mut defs = ExpSet::new();
        s.get_definitions(&mut defs);
        assert!(defs.contains(&Exp::reg(28)));
        assert_eq!(defs.len(), 1);
    }

    #[test]
    fn test_memof_lhs_address_is_a_use() {
        let s = stmt(StatementKind::Assign(Assign::new(
            Exp::mem(Exp::subscript(Exp::reg(28), StmtId(3))),
            Exp::int(0),
        )));
        let mut used = ExpSet::new();
        s.add_used_locs(&mut used, false);
        assert!(used.contains(&Exp::subscript(Exp::reg(28), StmtId(3))));
    }

    #[test]
    fn test_phi_operands_are_uses() {
        let mut phi = PhiAssign::new(Exp::reg(24), &[BlockId(0), BlockId(1)]);
        phi.set_operand(BlockId(0), Exp::reg(24), Some(StmtId(1)));
        phi.set_operand(BlockId(1), Exp::reg(24), Some(StmtId(5)));
        let s = stmt(StatementKind::Phi(phi));

        let mut used = ExpSet::new();
        s.add_used_locs(&mut used, false);
        assert!(used.contains(&Exp::subscript(Exp::reg(24), StmtId(1))));
        assert!(used.contains(&Exp::subscript(Exp::reg(24), StmtId(5))));
    }

    #[test]
    fn test_subscript_uses_leaves_def_position() {
        let mut s = stmt(StatementKind::Assign(Assign::new(
            Exp::reg(24),
            Exp::binary(Operator::Plus, Exp::reg(24), Exp::int(1)),
        )));
        s.subscript_uses(&Exp::reg(24), Some(StmtId(9)));
        let a = s.as_assign().unwrap();
        assert_eq!(a.lhs, Exp::reg(24));
        assert_eq!(
            a.rhs,
            Exp::binary(
                Operator::Plus,
                Exp::subscript(Exp::reg(24), StmtId(9)),
                Exp::int(1)
            )
        );
    }

    #[test]
    fn test_clone_independence() {
        let s = stmt(StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(5))));
        let mut c = s.clone();
        c.search_and_replace(&Exp::int(5), &Exp::int(6));
        assert_eq!(s.as_assign().unwrap().rhs, Exp::int(5));
        assert_eq!(c.as_assign().unwrap().rhs, Exp::int(6));
    }

    #[test]
    fn test_null_statement_detection() {
        let s = stmt(StatementKind::Assign(Assign::new(
            Exp::reg(24),
            Exp::subscript(Exp::reg(24), StmtId(2)),
        )));
        assert!(s.is_null_statement());

        let s2 = stmt(StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(5))));
        assert!(!s2.is_null_statement());
    }

    #[test]
    fn test_display_forms() {
        let s = stmt(StatementKind::Assign(Assign::new(Exp::reg(24), Exp::int(5))));
        assert_eq!(s.to_string(), "   0 *v* r24 := 5");

        let mut r = ReturnStatement::new();
        r.returns.push(Assign::new(Exp::reg(24), Exp::int(5)));
        let s = stmt(StatementKind::Ret(r));
        assert_eq!(s.to_string(), "   0 RET *v* r24 := 5");
    }

    #[test]
    fn test_flag_call_becomes_relational_condition() {
        let mut b = BranchStatement::new(0x2000);
        b.branch_type = BranchType::SignedLess;
        b.cond = Exp::FlagCall(
            "SUBFLAGS32".into(),
            vec![Exp::reg(24), Exp::reg(25), Exp::reg(26)],
        );
        b.cond_to_relational();
        assert_eq!(b.cond, Exp::binary(Operator::Less, Exp::reg(24), Exp::reg(25)));
        assert!(!b.is_float);

        // The decoder's "flagcall compared against zero" wrapping.
        let mut b2 = BranchStatement::new(0x2000);
        b2.branch_type = BranchType::Equal;
        b2.cond = Exp::binary(
            Operator::Equals,
            Exp::FlagCall("LOGICALFLAGS32".into(), vec![Exp::reg(24)]),
            Exp::int(0),
        );
        b2.cond_to_relational();
        assert_eq!(b2.cond, Exp::binary(Operator::Equals, Exp::reg(24), Exp::int(0)));

        let mut b3 = BranchStatement::new(0x2000);
        b3.branch_type = BranchType::SignedGreater;
        b3.cond = Exp::FlagCall("SETFFLAGS".into(), vec![Exp::reg(32), Exp::reg(33)]);
        b3.cond_to_relational();
        assert!(b3.is_float);
        assert_eq!(
            b3.cond,
            Exp::binary(Operator::Greater, Exp::reg(32), Exp::reg(33))
        );
    }

    #[test]
    fn test_localise_exp_substitutes_reaching_defs() {
        let mut call = CallStatement::new(Exp::func_addr(0x2000));
        call.def_col
            .insert(Assign::new(Exp::reg(28), Exp::subscript(Exp::reg(28), StmtId(4))));
        let localised = call.localise_exp(Exp::binary(
            Operator::Plus,
            Exp::reg(28),
            Exp::int(4),
        ));
        assert_eq!(
            localised,
            Exp::binary(
                Operator::Plus,
                Exp::subscript(Exp::reg(28), StmtId(4)),
                Exp::int(4)
            )
        );
        // Unknown locations become implicit refs.
        let l2 = call.localise_exp(Exp::reg(24));
        assert_eq!(l2, Exp::subscript_implicit(Exp::reg(24)));
    }
}
