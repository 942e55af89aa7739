//! Operator vocabulary for the expression algebra.
//!
//! Every non-constant expression node carries one of these tags. The set is
//! flat on purpose: simplification and pattern matching switch on operators
//! constantly, and a single enum keeps those matches exhaustive.

use std::fmt;

/// Operator tags for terminal, unary, binary and ternary expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    // Binary: integer arithmetic
    Plus,
    Minus,
    Mult,
    MultS,
    Div,
    DivS,
    Mod,
    ModS,

    // Binary: float arithmetic
    FPlus,
    FMinus,
    FMult,
    FDiv,

    // Binary: comparison (signed unless suffixed Uns)
    Equals,
    NotEqual,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    LessUns,
    GreaterUns,
    LessEqUns,
    GreaterEqUns,

    // Binary: bit and logic
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Sar,
    RotL,
    RotR,
    And,
    Or,

    // Binary: list constructor (cons); Nil terminates
    List,

    // Unary
    Neg,
    FNeg,
    Not,
    LNot,
    AddrOf,
    MemOf,
    RegOf,
    Global,
    Local,
    Param,
    Temp,
    TypeOf,
    InitValueOf,

    // Ternary: conversions carry (from-size, to-size, value)
    FSize,
    ZFill,
    SgnEx,
    TruncS,
    TruncU,
    IToF,
    FToI,

    // Terminals
    Pc,
    Flags,
    FFlags,
    CarryFlag,
    ZeroFlag,
    Nil,
    True,
    False,
    DefineAll,

    // Pattern wildcards
    Wild,
    WildIntConst,
    WildStrConst,
}

impl Operator {
    /// Name used in dumps and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Mult => "*",
            Operator::MultS => "*!",
            Operator::Div => "/",
            Operator::DivS => "/!",
            Operator::Mod => "%",
            Operator::ModS => "%!",
            Operator::FPlus => "+f",
            Operator::FMinus => "-f",
            Operator::FMult => "*f",
            Operator::FDiv => "/f",
            Operator::Equals => "=",
            Operator::NotEqual => "~=",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::LessEq => "<=",
            Operator::GreaterEq => ">=",
            Operator::LessUns => "<u",
            Operator::GreaterUns => ">u",
            Operator::LessEqUns => "<=u",
            Operator::GreaterEqUns => ">=u",
            Operator::BitAnd => "&",
            Operator::BitOr => "|",
            Operator::BitXor => "^",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::Sar => ">>A",
            Operator::RotL => "rl",
            Operator::RotR => "rr",
            Operator::And => "and",
            Operator::Or => "or",
            Operator::List => "list",
            Operator::Neg => "-",
            Operator::FNeg => "-f",
            Operator::Not => "~",
            Operator::LNot => "not",
            Operator::AddrOf => "a[",
            Operator::MemOf => "m[",
            Operator::RegOf => "r[",
            Operator::Global => "global",
            Operator::Local => "local",
            Operator::Param => "param",
            Operator::Temp => "tmp",
            Operator::TypeOf => "T[",
            Operator::InitValueOf => "init",
            Operator::FSize => "fsize",
            Operator::ZFill => "zfill",
            Operator::SgnEx => "sgnex",
            Operator::TruncS => "truncs",
            Operator::TruncU => "truncu",
            Operator::IToF => "itof",
            Operator::FToI => "ftoi",
            Operator::Pc => "%pc",
            Operator::Flags => "%flags",
            Operator::FFlags => "%fflags",
            Operator::CarryFlag => "%CF",
            Operator::ZeroFlag => "%ZF",
            Operator::Nil => "nil",
            Operator::True => "true",
            Operator::False => "false",
            Operator::DefineAll => "<all>",
            Operator::Wild => "WILD",
            Operator::WildIntConst => "WILDINT",
            Operator::WildStrConst => "WILDSTR",
        }
    }

    /// True for the comparison operators, which always yield a boolean.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Equals
                | Operator::NotEqual
                | Operator::Less
                | Operator::Greater
                | Operator::LessEq
                | Operator::GreaterEq
                | Operator::LessUns
                | Operator::GreaterUns
                | Operator::LessEqUns
                | Operator::GreaterEqUns
        )
    }

    /// True when `a op b == b op a` on machine integers.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Operator::Plus
                | Operator::Mult
                | Operator::MultS
                | Operator::FPlus
                | Operator::FMult
                | Operator::BitAnd
                | Operator::BitOr
                | Operator::BitXor
                | Operator::And
                | Operator::Or
                | Operator::Equals
                | Operator::NotEqual
        )
    }

    /// True for operators that read or name a storage location.
    pub fn is_location(self) -> bool {
        matches!(
            self,
            Operator::MemOf
                | Operator::RegOf
                | Operator::Global
                | Operator::Local
                | Operator::Param
                | Operator::Temp
        )
    }

    /// True for the wildcard family used only inside search patterns.
    pub fn is_wild(self) -> bool {
        matches!(
            self,
            Operator::Wild | Operator::WildIntConst | Operator::WildStrConst
        )
    }

    /// The comparison with both sides exchanged, e.g. `<` becomes `>`.
    pub fn swapped_comparison(self) -> Operator {
        match self {
            Operator::Less => Operator::Greater,
            Operator::Greater => Operator::Less,
            Operator::LessEq => Operator::GreaterEq,
            Operator::GreaterEq => Operator::LessEq,
            Operator::LessUns => Operator::GreaterUns,
            Operator::GreaterUns => Operator::LessUns,
            Operator::LessEqUns => Operator::GreaterEqUns,
            Operator::GreaterEqUns => Operator::LessEqUns,
            other => other,
        }
    }

    /// The logical negation of a comparison, e.g. `<` becomes `>=`.
    pub fn negated_comparison(self) -> Operator {
        match self {
            Operator::Equals => Operator::NotEqual,
            Operator::NotEqual => Operator::Equals,
            Operator::Less => Operator::GreaterEq,
            Operator::Greater => Operator::LessEq,
            Operator::LessEq => Operator::Greater,
            Operator::GreaterEq => Operator::Less,
            Operator::LessUns => Operator::GreaterEqUns,
            Operator::GreaterUns => Operator::LessEqUns,
            Operator::LessEqUns => Operator::GreaterUns,
            Operator::GreaterEqUns => Operator::LessUns,
            other => other,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_classification() {
        assert!(Operator::Equals.is_comparison());
        assert!(Operator::LessUns.is_comparison());
        assert!(!Operator::Plus.is_comparison());
        assert!(!Operator::MemOf.is_comparison());
    }

    #[test]
    fn test_negated_comparison_involution() {
        let cmps = [
            Operator::Equals,
            Operator::NotEqual,
            Operator::Less,
            Operator::Greater,
            Operator::LessEq,
            Operator::GreaterEq,
            Operator::LessUns,
            Operator::GreaterUns,
            Operator::LessEqUns,
            Operator::GreaterEqUns,
        ];
        for op in cmps {
            assert_eq!(op.negated_comparison().negated_comparison(), op);
        }
    }

    #[test]
    fn test_location_operators() {
        assert!(Operator::RegOf.is_location());
        assert!(Operator::MemOf.is_location());
        assert!(!Operator::Plus.is_location());
    }
}
