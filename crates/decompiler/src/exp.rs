//! Expression algebra.
//!
//! Expressions are immutable tagged trees. Statements hold them by value;
//! sharing is by cloning, and every rewrite (simplification, substitution,
//! subscripting) consumes the old tree and returns a new one. Equality,
//! ordering and hashing are strict and structural; wildcard-tolerant
//! comparison is a separate operation ([`Exp::matches`]) used by the search
//! family.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::operators::Operator;
use crate::stmt::StmtId;
use crate::types::Type;
use crate::Address;

/// Payload of a constant expression.
#[derive(Debug, Clone)]
pub enum ConstKind {
    /// Machine integer; width and signedness live in the type annotations.
    Int(i64),
    /// 64-bit integer that must not be narrowed.
    Long(u64),
    /// Floating-point literal.
    Flt(f64),
    /// String literal (e.g. recovered from a read-only section).
    Str(String),
    /// Reference to a function by its native address.
    FuncAddr(Address),
}

/// A constant with an optional conscript tag.
///
/// The conscript distinguishes otherwise-equal constants during type
/// analysis: `5` at one site may be a length while `5` at another is a
/// character. Conscripted constants never compare equal to anything, which
/// is exactly what keeps them distinct.
#[derive(Debug, Clone)]
pub struct Const {
    pub kind: ConstKind,
    pub conscript: u32,
}

impl Const {
    pub fn int(i: i64) -> Self {
        Const { kind: ConstKind::Int(i), conscript: 0 }
    }

    pub fn flt(f: f64) -> Self {
        Const { kind: ConstKind::Flt(f), conscript: 0 }
    }

    pub fn str(s: impl Into<String>) -> Self {
        Const { kind: ConstKind::Str(s.into()), conscript: 0 }
    }

    pub fn func_addr(a: Address) -> Self {
        Const { kind: ConstKind::FuncAddr(a), conscript: 0 }
    }

    fn kind_rank(&self) -> u8 {
        match self.kind {
            ConstKind::Int(_) => 0,
            ConstKind::Long(_) => 1,
            ConstKind::Flt(_) => 2,
            ConstKind::Str(_) => 3,
            ConstKind::FuncAddr(_) => 4,
        }
    }
}

/// An expression tree node.
#[derive(Debug, Clone)]
pub enum Exp {
    /// Integer/float/string/function constant.
    Const(Const),
    /// 0-ary symbol: `%pc`, `%flags`, `%CF`, wildcards, `nil`, `<all>`, ...
    Terminal(Operator),
    /// One-child operator, including the location formers `r[.]`, `m[.]`.
    Unary(Operator, Box<Exp>),
    /// Two-child operator.
    Binary(Operator, Box<Exp>, Box<Exp>),
    /// Three-child operator: conversions carrying from/to sizes.
    Ternary(Operator, Box<Exp>, Box<Exp>, Box<Exp>),
    /// Explicit cast wrapper.
    Typed(Type, Box<Exp>),
    /// SSA subscript: the value of `base` as defined by the given statement,
    /// or by "implicit at procedure entry" when `None`.
    Ref(Box<Exp>, Option<StmtId>),
    /// Flag-setting pseudo operation with the expressions whose flags it sets.
    FlagCall(String, Vec<Exp>),
}

impl Exp {
    // ---- constructors -----------------------------------------------------

    pub fn int(i: i64) -> Exp {
        Exp::Const(Const::int(i))
    }

    pub fn flt(f: f64) -> Exp {
        Exp::Const(Const::flt(f))
    }

    pub fn str(s: impl Into<String>) -> Exp {
        Exp::Const(Const::str(s))
    }

    pub fn func_addr(a: Address) -> Exp {
        Exp::Const(Const::func_addr(a))
    }

    pub fn terminal(op: Operator) -> Exp {
        Exp::Terminal(op)
    }

    pub fn unary(op: Operator, e: Exp) -> Exp {
        Exp::Unary(op, Box::new(e))
    }

    pub fn binary(op: Operator, a: Exp, b: Exp) -> Exp {
        Exp::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn ternary(op: Operator, a: Exp, b: Exp, c: Exp) -> Exp {
        Exp::Ternary(op, Box::new(a), Box::new(b), Box::new(c))
    }

    /// `r<n>` register location.
    pub fn reg(n: i64) -> Exp {
        Exp::unary(Operator::RegOf, Exp::int(n))
    }

    /// `m[addr]` memory location.
    pub fn mem(addr: Exp) -> Exp {
        Exp::unary(Operator::MemOf, addr)
    }

    pub fn addr_of(e: Exp) -> Exp {
        Exp::unary(Operator::AddrOf, e)
    }

    pub fn global(name: impl Into<String>) -> Exp {
        Exp::unary(Operator::Global, Exp::str(name))
    }

    pub fn local(name: impl Into<String>) -> Exp {
        Exp::unary(Operator::Local, Exp::str(name))
    }

    pub fn param(name: impl Into<String>) -> Exp {
        Exp::unary(Operator::Param, Exp::str(name))
    }

    pub fn temp(name: impl Into<String>) -> Exp {
        Exp::unary(Operator::Temp, Exp::str(name))
    }

    /// Subscript `base` with a defining statement.
    pub fn subscript(base: Exp, def: StmtId) -> Exp {
        Exp::Ref(Box::new(base), Some(def))
    }

    /// Subscript `base` with the implicit entry definition.
    pub fn subscript_implicit(base: Exp) -> Exp {
        Exp::Ref(Box::new(base), None)
    }

    pub fn typed(ty: Type, e: Exp) -> Exp {
        Exp::Typed(ty, Box::new(e))
    }

    // ---- predicates and accessors ----------------------------------------

    pub fn is_int_const(&self) -> bool {
        matches!(self, Exp::Const(Const { kind: ConstKind::Int(_), .. }))
    }

    pub fn is_str_const(&self) -> bool {
        matches!(self, Exp::Const(Const { kind: ConstKind::Str(_), .. }))
    }

    pub fn is_flt_const(&self) -> bool {
        matches!(self, Exp::Const(Const { kind: ConstKind::Flt(_), .. }))
    }

    pub fn is_func_const(&self) -> bool {
        matches!(self, Exp::Const(Const { kind: ConstKind::FuncAddr(_), .. }))
    }

    /// The integer payload, if this is an integer constant.
    pub fn int_value(&self) -> Option<i64> {
        match self {
            Exp::Const(Const { kind: ConstKind::Int(i), .. }) => Some(*i),
            _ => None,
        }
    }

}

impl Exp {
    /// The function address payload, if this is a function constant.
    pub fn func_value(&self) -> Option<Address> {
        match self {
            Exp::Const(Const { kind: ConstKind::FuncAddr(a), .. }) => Some(*a),
            _ => None,
        }
    }

    /// The string payload, if this is a string constant.
    pub fn str_value(&self) -> Option<&str> {
        match self {
            Exp::Const(Const { kind: ConstKind::Str(s), .. }) => Some(s),
            _ => None,
        }
    }

    pub fn is_reg_of(&self) -> bool {
        matches!(self, Exp::Unary(Operator::RegOf, _))
    }

    /// True if this is the register location `r<n>`.
    pub fn is_reg_n(&self, n: i64) -> bool {
        match self {
            Exp::Unary(Operator::RegOf, e) => e.int_value() == Some(n),
            _ => false,
        }
    }

    /// Register number if this is `r<const>`.
    pub fn reg_num(&self) -> Option<i64> {
        match self {
            Exp::Unary(Operator::RegOf, e) => e.int_value(),
            _ => None,
        }
    }

    pub fn is_mem_of(&self) -> bool {
        matches!(self, Exp::Unary(Operator::MemOf, _))
    }

    pub fn is_subscript(&self) -> bool {
        matches!(self, Exp::Ref(_, _))
    }

    /// True for a ref whose definition is the implicit entry state.
    pub fn is_implicit_ref(&self) -> bool {
        matches!(self, Exp::Ref(_, None))
    }

    /// Base and definition of a ref.
    pub fn as_ref_parts(&self) -> Option<(&Exp, Option<StmtId>)> {
        match self {
            Exp::Ref(base, def) => Some((base, *def)),
            _ => None,
        }
    }

    pub fn is_equality(&self) -> bool {
        matches!(self, Exp::Binary(Operator::Equals, _, _))
    }

    pub fn is_terminal(&self, op: Operator) -> bool {
        matches!(self, Exp::Terminal(o) if *o == op)
    }

    /// True for expressions that denote a storage location: registers,
    /// memory, globals, locals, parameters, temps and the machine flags.
    pub fn is_location(&self) -> bool {
        match self {
            Exp::Unary(op, _) => op.is_location(),
            Exp::Terminal(op) => matches!(
                op,
                Operator::Pc
                    | Operator::Flags
                    | Operator::FFlags
                    | Operator::CarryFlag
                    | Operator::ZeroFlag
            ),
            _ => false,
        }
    }

    /// First child, for unary-like nodes.
    pub fn sub1(&self) -> Option<&Exp> {
        match self {
            Exp::Unary(_, a) | Exp::Typed(_, a) | Exp::Ref(a, _) => Some(a),
            Exp::Binary(_, a, _) => Some(a),
            Exp::Ternary(_, a, _, _) => Some(a),
            _ => None,
        }
    }

    /// Second child, for binary/ternary nodes.
    pub fn sub2(&self) -> Option<&Exp> {
        match self {
            Exp::Binary(_, _, b) => Some(b),
            Exp::Ternary(_, _, b, _) => Some(b),
            _ => None,
        }
    }

    /// Number of direct children.
    pub fn arity(&self) -> usize {
        match self {
            Exp::Const(_) | Exp::Terminal(_) => 0,
            Exp::Unary(_, _) | Exp::Typed(_, _) | Exp::Ref(_, _) => 1,
            Exp::Binary(_, _, _) => 2,
            Exp::Ternary(_, _, _, _) => 3,
            Exp::FlagCall(_, args) => args.len(),
        }
    }

    // ---- traversal --------------------------------------------------------

    /// Pre-order walk. The callback returns `false` to skip the children of
    /// the node it was called on.
    pub fn visit(&self, f: &mut impl FnMut(&Exp) -> bool) {
        if !f(self) {
            return;
        }
        match self {
            Exp::Const(_) | Exp::Terminal(_) => {}
            Exp::Unary(_, a) | Exp::Typed(_, a) | Exp::Ref(a, _) => a.visit(f),
            Exp::Binary(_, a, b) => {
                a.visit(f);
                b.visit(f);
            }
            Exp::Ternary(_, a, b, c) => {
                a.visit(f);
                b.visit(f);
                c.visit(f);
            }
            Exp::FlagCall(_, args) => {
                for a in args {
                    a.visit(f);
                }
            }
        }
    }

    /// Rebuild the tree bottom-up, applying `f` to every node after its
    /// children have been rebuilt.
    pub fn map_bottom_up(self, f: &mut impl FnMut(Exp) -> Exp) -> Exp {
        let rebuilt = match self {
            Exp::Const(_) | Exp::Terminal(_) => self,
            Exp::Unary(op, a) => Exp::Unary(op, Box::new(a.map_bottom_up(f))),
            Exp::Binary(op, a, b) => Exp::Binary(
                op,
                Box::new(a.map_bottom_up(f)),
                Box::new(b.map_bottom_up(f)),
            ),
            Exp::Ternary(op, a, b, c) => Exp::Ternary(
                op,
                Box::new(a.map_bottom_up(f)),
                Box::new(b.map_bottom_up(f)),
                Box::new(c.map_bottom_up(f)),
            ),
            Exp::Typed(ty, a) => Exp::Typed(ty, Box::new(a.map_bottom_up(f))),
            Exp::Ref(a, def) => Exp::Ref(Box::new(a.map_bottom_up(f)), def),
            Exp::FlagCall(name, args) => Exp::FlagCall(
                name,
                args.into_iter().map(|a| a.map_bottom_up(f)).collect(),
            ),
        };
        f(rebuilt)
    }

    /// Rebuild top-down: `f` sees each node before its children; returning
    /// `(exp, false)` stops descent into that node.
    pub fn map_top_down(self, f: &mut impl FnMut(Exp) -> (Exp, bool)) -> Exp {
        let (e, descend) = f(self);
        if !descend {
            return e;
        }
        match e {
            Exp::Const(_) | Exp::Terminal(_) => e,
            Exp::Unary(op, a) => Exp::Unary(op, Box::new(a.map_top_down(f))),
            Exp::Binary(op, a, b) => Exp::Binary(
                op,
                Box::new(a.map_top_down(f)),
                Box::new(b.map_top_down(f)),
            ),
            Exp::Ternary(op, a, b, c) => Exp::Ternary(
                op,
                Box::new(a.map_top_down(f)),
                Box::new(b.map_top_down(f)),
                Box::new(c.map_top_down(f)),
            ),
            Exp::Typed(ty, a) => Exp::Typed(ty, Box::new(a.map_top_down(f))),
            Exp::Ref(a, def) => Exp::Ref(Box::new(a.map_top_down(f)), def),
            Exp::FlagCall(name, args) => Exp::FlagCall(
                name,
                args.into_iter().map(|a| a.map_top_down(f)).collect(),
            ),
        }
    }

    // ---- matching and search ---------------------------------------------

    /// Structural comparison modulo wildcards: a wildcard on either side
    /// matches any subtree, a wildcard integer/string constant matches only
    /// the corresponding constant kind.
    pub fn matches(&self, other: &Exp) -> bool {
        if self.is_terminal(Operator::Wild) || other.is_terminal(Operator::Wild) {
            return true;
        }
        if self.is_terminal(Operator::WildIntConst) {
            return other.is_int_const();
        }
        if other.is_terminal(Operator::WildIntConst) {
            return self.is_int_const();
        }
        if self.is_terminal(Operator::WildStrConst) {
            return other.is_str_const();
        }
        if other.is_terminal(Operator::WildStrConst) {
            return self.is_str_const();
        }
        match (self, other) {
            (Exp::Const(a), Exp::Const(b)) => {
                // Conscripted constants stay distinct from everything.
                if (a.conscript != 0 && a.conscript != b.conscript) || b.conscript != 0 {
                    return false;
                }
                const_value_eq(a, b)
            }
            (Exp::Terminal(a), Exp::Terminal(b)) => a == b,
            (Exp::Unary(op1, a1), Exp::Unary(op2, a2)) => op1 == op2 && a1.matches(a2),
            (Exp::Binary(op1, a1, b1), Exp::Binary(op2, a2, b2)) => {
                op1 == op2 && a1.matches(a2) && b1.matches(b2)
            }
            (Exp::Ternary(op1, a1, b1, c1), Exp::Ternary(op2, a2, b2, c2)) => {
                op1 == op2 && a1.matches(a2) && b1.matches(b2) && c1.matches(c2)
            }
            (Exp::Typed(t1, a1), Exp::Typed(t2, a2)) => t1 == t2 && a1.matches(a2),
            (Exp::Ref(a1, d1), Exp::Ref(a2, d2)) => d1 == d2 && a1.matches(a2),
            (Exp::FlagCall(n1, a1), Exp::FlagCall(n2, a2)) => {
                n1 == n2 && a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| x.matches(y))
            }
            _ => false,
        }
    }

    /// Find the first subtree matching `pattern` (pre-order).
    pub fn search(&self, pattern: &Exp) -> Option<&Exp> {
        if self.matches(pattern) {
            return Some(self);
        }
        match self {
            Exp::Const(_) | Exp::Terminal(_) => None,
            Exp::Unary(_, a) | Exp::Typed(_, a) | Exp::Ref(a, _) => a.search(pattern),
            Exp::Binary(_, a, b) => a.search(pattern).or_else(|| b.search(pattern)),
            Exp::Ternary(_, a, b, c) => a
                .search(pattern)
                .or_else(|| b.search(pattern))
                .or_else(|| c.search(pattern)),
            Exp::FlagCall(_, args) => args.iter().find_map(|a| a.search(pattern)),
        }
    }

    /// Collect every subtree matching `pattern`.
    pub fn search_all<'a>(&'a self, pattern: &Exp, results: &mut Vec<&'a Exp>) {
        if self.matches(pattern) {
            results.push(self);
        }
        match self {
            Exp::Const(_) | Exp::Terminal(_) => {}
            Exp::Unary(_, a) | Exp::Typed(_, a) | Exp::Ref(a, _) => a.search_all(pattern, results),
            Exp::Binary(_, a, b) => {
                a.search_all(pattern, results);
                b.search_all(pattern, results);
            }
            Exp::Ternary(_, a, b, c) => {
                a.search_all(pattern, results);
                b.search_all(pattern, results);
                c.search_all(pattern, results);
            }
            Exp::FlagCall(_, args) => {
                for a in args {
                    a.search_all(pattern, results);
                }
            }
        }
    }

    /// Replace every subtree matching `pattern` with `replacement`. Matched
    /// subtrees are not descended into. Returns the new tree and whether
    /// anything changed.
    pub fn search_replace_all(self, pattern: &Exp, replacement: &Exp) -> (Exp, bool) {
        let mut changed = false;
        let out = self.map_top_down(&mut |e| {
            if e.matches(pattern) {
                changed = true;
                (replacement.clone(), false)
            } else {
                (e, true)
            }
        });
        (out, changed)
    }

    // ---- SSA subscripting -------------------------------------------------

    /// Replace every occurrence of `loc` with a ref of it to `def`, skipping
    /// occurrences that are already subscripted.
    pub fn subscript_var(self, loc: &Exp, def: Option<StmtId>) -> Exp {
        self.map_top_down(&mut |e| match e {
            // An existing subscript fixes its contents.
            Exp::Ref(_, _) => (e, false),
            e if e.matches(loc) => (Exp::Ref(Box::new(e), def), false),
            e => (e, true),
        })
    }

    /// Strip all subscripts. The flag is true when every removed subscript
    /// referred to the implicit entry definition.
    pub fn remove_subscripts(self) -> (Exp, bool) {
        let mut all_implicit = true;
        let out = self.map_bottom_up(&mut |e| match e {
            Exp::Ref(base, def) => {
                if def.is_some() {
                    all_implicit = false;
                }
                *base
            }
            e => e,
        });
        (out, all_implicit)
    }

    // ---- used locations ---------------------------------------------------

    /// Add to `set` every location this expression reads: subscripted refs
    /// in whole, bare locations, and the locations used by memory address
    /// computations inside them.
    pub fn add_used_locs(&self, set: &mut ExpSet) {
        match self {
            Exp::Ref(base, _) => {
                set.insert(self.clone());
                // Address expressions inside a subscripted m[...] still use
                // their own refs.
                if let Exp::Unary(Operator::MemOf, addr) = base.as_ref() {
                    addr.add_used_locs(set);
                }
            }
            Exp::Unary(op, child) if op.is_location() => {
                set.insert(self.clone());
                if *op == Operator::MemOf {
                    child.add_used_locs(set);
                }
            }
            Exp::Terminal(op)
                if matches!(
                    op,
                    Operator::Pc
                        | Operator::Flags
                        | Operator::FFlags
                        | Operator::CarryFlag
                        | Operator::ZeroFlag
                ) =>
            {
                set.insert(self.clone());
            }
            Exp::Const(_) | Exp::Terminal(_) => {}
            Exp::Unary(_, a) | Exp::Typed(_, a) => a.add_used_locs(set),
            Exp::Binary(_, a, b) => {
                a.add_used_locs(set);
                b.add_used_locs(set);
            }
            Exp::Ternary(_, a, b, c) => {
                a.add_used_locs(set);
                b.add_used_locs(set);
                c.add_used_locs(set);
            }
            Exp::FlagCall(_, args) => {
                for a in args {
                    a.add_used_locs(set);
                }
            }
        }
    }

    /// Registers appearing anywhere in the tree (used by signature promotion
    /// and parameter filters).
    pub fn contains_flags(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(
                e,
                Exp::Terminal(Operator::Flags)
                    | Exp::Terminal(Operator::FFlags)
                    | Exp::Terminal(Operator::CarryFlag)
                    | Exp::Terminal(Operator::ZeroFlag)
            ) {
                found = true;
            }
            !found
        });
        found
    }

    /// True when `other` occurs anywhere in this tree (strict equality).
    pub fn contains(&self, other: &Exp) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if e == other {
                found = true;
            }
            !found
        });
        found
    }
}

fn const_value_eq(a: &Const, b: &Const) -> bool {
    match (&a.kind, &b.kind) {
        (ConstKind::Int(x), ConstKind::Int(y)) => x == y,
        (ConstKind::Long(x), ConstKind::Long(y)) => x == y,
        (ConstKind::Flt(x), ConstKind::Flt(y)) => x.to_bits() == y.to_bits(),
        (ConstKind::Str(x), ConstKind::Str(y)) => x == y,
        (ConstKind::FuncAddr(x), ConstKind::FuncAddr(y)) => x == y,
        _ => false,
    }
}

// ---- strict equality, ordering, hashing ----------------------------------

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        self.conscript == other.conscript && const_value_eq(self, other)
    }
}

impl Eq for Const {}

impl PartialOrd for Const {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Const {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.kind_rank().cmp(&other.kind_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        let values = match (&self.kind, &other.kind) {
            (ConstKind::Int(x), ConstKind::Int(y)) => x.cmp(y),
            (ConstKind::Long(x), ConstKind::Long(y)) => x.cmp(y),
            (ConstKind::Flt(x), ConstKind::Flt(y)) => x.total_cmp(y),
            (ConstKind::Str(x), ConstKind::Str(y)) => x.cmp(y),
            (ConstKind::FuncAddr(x), ConstKind::FuncAddr(y)) => x.cmp(y),
            _ => unreachable!("ranks matched"),
        };
        values.then(self.conscript.cmp(&other.conscript))
    }
}

impl Hash for Const {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind_rank().hash(state);
        match &self.kind {
            ConstKind::Int(x) => x.hash(state),
            ConstKind::Long(x) => x.hash(state),
            ConstKind::Flt(x) => x.to_bits().hash(state),
            ConstKind::Str(x) => x.hash(state),
            ConstKind::FuncAddr(x) => x.hash(state),
        }
        self.conscript.hash(state);
    }
}

impl Exp {
    fn variant_rank(&self) -> u8 {
        match self {
            Exp::Const(_) => 0,
            Exp::Terminal(_) => 1,
            Exp::Unary(_, _) => 2,
            Exp::Binary(_, _, _) => 3,
            Exp::Ternary(_, _, _, _) => 4,
            Exp::Typed(_, _) => 5,
            Exp::Ref(_, _) => 6,
            Exp::FlagCall(_, _) => 7,
        }
    }
}

impl PartialEq for Exp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Exp::Const(a), Exp::Const(b)) => a == b,
            (Exp::Terminal(a), Exp::Terminal(b)) => a == b,
            (Exp::Unary(o1, a1), Exp::Unary(o2, a2)) => o1 == o2 && a1 == a2,
            (Exp::Binary(o1, a1, b1), Exp::Binary(o2, a2, b2)) => {
                o1 == o2 && a1 == a2 && b1 == b2
            }
            (Exp::Ternary(o1, a1, b1, c1), Exp::Ternary(o2, a2, b2, c2)) => {
                o1 == o2 && a1 == a2 && b1 == b2 && c1 == c2
            }
            (Exp::Typed(t1, a1), Exp::Typed(t2, a2)) => t1 == t2 && a1 == a2,
            (Exp::Ref(a1, d1), Exp::Ref(a2, d2)) => d1 == d2 && a1 == a2,
            (Exp::FlagCall(n1, a1), Exp::FlagCall(n2, a2)) => n1 == n2 && a1 == a2,
            _ => false,
        }
    }
}

impl Eq for Exp {}

impl PartialOrd for Exp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Exp {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.variant_rank().cmp(&other.variant_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Exp::Const(a), Exp::Const(b)) => a.cmp(b),
            (Exp::Terminal(a), Exp::Terminal(b)) => a.cmp(b),
            (Exp::Unary(o1, a1), Exp::Unary(o2, a2)) => o1.cmp(o2).then_with(|| a1.cmp(a2)),
            (Exp::Binary(o1, a1, b1), Exp::Binary(o2, a2, b2)) => {
                o1.cmp(o2).then_with(|| a1.cmp(a2)).then_with(|| b1.cmp(b2))
            }
            (Exp::Ternary(o1, a1, b1, c1), Exp::Ternary(o2, a2, b2, c2)) => o1
                .cmp(o2)
                .then_with(|| a1.cmp(a2))
                .then_with(|| b1.cmp(b2))
                .then_with(|| c1.cmp(c2)),
            (Exp::Typed(t1, a1), Exp::Typed(t2, a2)) => {
                t1.cmp(t2).then_with(|| a1.cmp(a2))
            }
            (Exp::Ref(a1, d1), Exp::Ref(a2, d2)) => {
                a1.cmp(a2).then_with(|| d1.cmp(d2))
            }
            (Exp::FlagCall(n1, a1), Exp::FlagCall(n2, a2)) => {
                n1.cmp(n2).then_with(|| a1.cmp(a2))
            }
            _ => unreachable!("ranks matched"),
        }
    }
}

impl Hash for Exp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_rank().hash(state);
        match self {
            Exp::Const(c) => c.hash(state),
            Exp::Terminal(op) => op.hash(state),
            Exp::Unary(op, a) => {
                op.hash(state);
                a.hash(state);
            }
            Exp::Binary(op, a, b) => {
                op.hash(state);
                a.hash(state);
                b.hash(state);
            }
            Exp::Ternary(op, a, b, c) => {
                op.hash(state);
                a.hash(state);
                b.hash(state);
                c.hash(state);
            }
            Exp::Typed(ty, a) => {
                ty.hash(state);
                a.hash(state);
            }
            Exp::Ref(a, d) => {
                a.hash(state);
                d.hash(state);
            }
            Exp::FlagCall(n, args) => {
                n.hash(state);
                args.hash(state);
            }
        }
    }
}

// ---- display --------------------------------------------------------------

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConstKind::Int(i) => write!(f, "{i}")?,
            ConstKind::Long(l) => write!(f, "{l}LL")?,
            ConstKind::Flt(x) => write!(f, "{x}")?,
            ConstKind::Str(s) => write!(f, "\"{s}\"")?,
            ConstKind::FuncAddr(a) => write!(f, "0x{a:x}")?,
        }
        if self.conscript != 0 {
            write!(f, "\\{}\\", self.conscript)?;
        }
        Ok(())
    }
}

/// True if the child needs parentheses inside an infix print.
fn needs_parens(e: &Exp) -> bool {
    matches!(e, Exp::Binary(_, _, _) | Exp::Ternary(_, _, _, _))
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &Exp) -> fmt::Result {
    if needs_parens(e) {
        write!(f, "({e})")
    } else {
        write!(f, "{e}")
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Const(c) => write!(f, "{c}"),
            Exp::Terminal(op) => write!(f, "{}", op.name()),
            Exp::Unary(op, a) => match op {
                Operator::RegOf => {
                    if let Some(n) = a.int_value() {
                        write!(f, "r{n}")
                    } else {
                        write!(f, "r[{a}]")
                    }
                }
                Operator::MemOf => write!(f, "m[{a}]"),
                Operator::AddrOf => write!(f, "a[{a}]"),
                Operator::TypeOf => write!(f, "T[{a}]"),
                Operator::Global | Operator::Local | Operator::Param => {
                    if let Some(name) = a.str_value() {
                        write!(f, "{name}")
                    } else {
                        write!(f, "{}({a})", op.name())
                    }
                }
                Operator::Temp => {
                    if let Some(name) = a.str_value() {
                        write!(f, "{name}")
                    } else {
                        write!(f, "tmp({a})")
                    }
                }
                Operator::Neg | Operator::FNeg => {
                    write!(f, "-")?;
                    write_operand(f, a)
                }
                Operator::Not => {
                    write!(f, "~")?;
                    write_operand(f, a)
                }
                Operator::LNot => {
                    write!(f, "!")?;
                    write_operand(f, a)
                }
                Operator::InitValueOf => write!(f, "{a}'"),
                _ => write!(f, "{}({a})", op.name()),
            },
            Exp::Binary(op, a, b) => {
                if *op == Operator::List {
                    // Flattened cons chain
                    write!(f, "{a}")?;
                    let mut rest: &Exp = b;
                    while let Exp::Binary(Operator::List, x, y) = rest {
                        write!(f, ", {x}")?;
                        rest = y;
                    }
                    if !rest.is_terminal(Operator::Nil) {
                        write!(f, ", {rest}")?;
                    }
                    Ok(())
                } else {
                    write_operand(f, a)?;
                    write!(f, " {} ", op.name())?;
                    write_operand(f, b)
                }
            }
            Exp::Ternary(op, a, b, c) => write!(f, "{}({a}, {b}, {c})", op.name()),
            Exp::Typed(ty, a) => write!(f, "*{ty}* {a}"),
            Exp::Ref(a, def) => match def {
                Some(id) => write!(f, "{a}{{{id}}}"),
                None => write!(f, "{a}{{-}}"),
            },
            Exp::FlagCall(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// ---- expression sets -------------------------------------------------------

/// An ordered set of expressions. Iteration order is the structural order,
/// which keeps printouts and pass results deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpSet {
    items: BTreeSet<Exp>,
}

impl ExpSet {
    pub fn new() -> Self {
        ExpSet::default()
    }

    pub fn insert(&mut self, e: Exp) -> bool {
        self.items.insert(e)
    }

    pub fn remove(&mut self, e: &Exp) -> bool {
        self.items.remove(e)
    }

    pub fn contains(&self, e: &Exp) -> bool {
        self.items.contains(e)
    }

    /// Membership modulo wildcards, for pattern sets.
    pub fn contains_match(&self, pattern: &Exp) -> bool {
        self.items.iter().any(|e| e.matches(pattern))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exp> {
        self.items.iter()
    }

    pub fn extend_from(&mut self, other: &ExpSet) {
        for e in other.iter() {
            self.items.insert(e.clone());
        }
    }

    pub fn clear(&mut self) {
        self.items.clear()
    }
}

impl FromIterator<Exp> for ExpSet {
    fn from_iter<T: IntoIterator<Item = Exp>>(iter: T) -> Self {
        ExpSet { items: iter.into_iter().collect() }
    }
}

impl IntoIterator for ExpSet {
    type Item = Exp;
    type IntoIter = std::collections::btree_set::IntoIter<Exp>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl fmt::Display for ExpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::StmtId;

    #[test]
    fn test_clone_is_structural_copy() {
        let e = Exp::binary(
            Operator::Plus,
            Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4))),
            Exp::int(1),
        );
        let c = e.clone();
        assert_eq!(e, c);
        // Mutating the clone must not affect the original.
        let (c2, changed) = c.search_replace_all(&Exp::int(4), &Exp::int(8));
        assert!(changed);
        assert_ne!(e, c2);
        assert_eq!(e.search(&Exp::int(4)).cloned(), Some(Exp::int(4)));
    }

    #[test]
    fn test_wildcard_matches_any_subtree() {
        let pat = Exp::mem(Exp::terminal(Operator::Wild));
        let e = Exp::mem(Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(8)));
        assert!(e.matches(&pat));
        assert!(e.search(&pat).is_some());
        // But strict equality sees through none of it.
        assert_ne!(e, pat);
    }

    #[test]
    fn test_wild_int_const_matches_only_int_consts() {
        let pat = Exp::terminal(Operator::WildIntConst);
        assert!(Exp::int(99).matches(&pat));
        assert!(!Exp::str("s").matches(&pat));
        assert!(!Exp::reg(8).matches(&pat));
    }

    #[test]
    fn test_conscripted_consts_stay_distinct() {
        let plain = Exp::int(5);
        let mut tagged = Const::int(5);
        tagged.conscript = 1;
        let tagged = Exp::Const(tagged);
        assert!(!plain.matches(&tagged));
        assert!(!tagged.matches(&tagged.clone()));
        // Strict equality still identifies identical trees.
        assert_eq!(tagged, tagged.clone());
    }

    #[test]
    fn test_search_all_finds_every_occurrence() {
        let e = Exp::binary(
            Operator::Plus,
            Exp::binary(Operator::Mult, Exp::reg(24), Exp::int(2)),
            Exp::reg(24),
        );
        let mut found = Vec::new();
        e.search_all(&Exp::reg(24), &mut found);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_subscript_var_skips_existing_refs() {
        let def = StmtId(7);
        let e = Exp::binary(
            Operator::Plus,
            Exp::reg(24),
            Exp::subscript(Exp::reg(24), StmtId(3)),
        );
        let out = e.subscript_var(&Exp::reg(24), Some(def));
        let expected = Exp::binary(
            Operator::Plus,
            Exp::subscript(Exp::reg(24), def),
            Exp::subscript(Exp::reg(24), StmtId(3)),
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn test_remove_subscripts_reports_implicit_only() {
        let e = Exp::binary(
            Operator::Plus,
            Exp::subscript_implicit(Exp::reg(28)),
            Exp::int(4),
        );
        let (clean, all_implicit) = e.remove_subscripts();
        assert!(all_implicit);
        assert_eq!(clean, Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)));

        let e2 = Exp::subscript(Exp::reg(24), StmtId(5));
        let (_, all_implicit2) = e2.remove_subscripts();
        assert!(!all_implicit2);
    }

    #[test]
    fn test_add_used_locs_sees_through_memofs() {
        let e = Exp::mem(Exp::binary(
            Operator::Minus,
            Exp::subscript(Exp::reg(28), StmtId(1)),
            Exp::int(12),
        ));
        let mut used = ExpSet::new();
        e.add_used_locs(&mut used);
        assert!(used.contains(&e));
        assert!(used.contains(&Exp::subscript(Exp::reg(28), StmtId(1))));
        assert_eq!(used.len(), 2);
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Exp::reg(24).to_string(), "r24");
        assert_eq!(Exp::mem(Exp::reg(28)).to_string(), "m[r28]");
        assert_eq!(
            Exp::subscript(Exp::reg(24), StmtId(5)).to_string(),
            "r24{5}"
        );
        assert_eq!(Exp::subscript_implicit(Exp::reg(24)).to_string(), "r24{-}");
        assert_eq!(
            Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)).to_string(),
            "r28 + 4"
        );
        assert_eq!(Exp::local("local0").to_string(), "local0");
        assert_eq!(Exp::terminal(Operator::Pc).to_string(), "%pc");
    }

    #[test]
    fn test_set_iteration_is_ordered() {
        let mut s = ExpSet::new();
        s.insert(Exp::reg(28));
        s.insert(Exp::reg(24));
        let regs: Vec<i64> = s.iter().filter_map(|e| e.reg_num()).collect();
        assert_eq!(regs, vec![24, 28]);
    }
}
