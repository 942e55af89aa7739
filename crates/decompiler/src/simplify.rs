//! Expression simplification: constant folding, identity elimination, and
//! sign-carrying normalisation of add/subtract chains.
//!
//! `simplify` repeats a bottom-up rewrite until a fixpoint; `simplify_arith`
//! is the chain-normalisation step on its own, used where only additive
//! shapes matter (stack-pointer proofs, local-pattern matching).

use crate::exp::{Const, ConstKind, Exp};
use crate::operators::Operator;

/// Rewrite passes stop after this many rounds; simplification is expected to
/// reach a fixpoint in a handful.
const SIMPLIFY_ROUNDS: usize = 100;

impl Exp {
    /// Simplify to a fixpoint. Never fails; at worst returns the input.
    pub fn simplify(self) -> Exp {
        let mut e = self;
        for _ in 0..SIMPLIFY_ROUNDS {
            let before = e.clone();
            e = e.simplify_arith();
            e = e.map_bottom_up(&mut simplify_node);
            if e == before {
                break;
            }
        }
        e
    }

    /// Normalise additive chains: flatten `+`/`-` trees, cancel equal terms
    /// of opposite sign, and fold all constants into one tail constant.
    pub fn simplify_arith(self) -> Exp {
        self.map_bottom_up(&mut |e| match e {
            Exp::Binary(Operator::Plus, _, _) | Exp::Binary(Operator::Minus, _, _) => {
                normalise_chain(e)
            }
            e => e,
        })
    }
}

fn normalise_chain(e: Exp) -> Exp {
    let mut positives = Vec::new();
    let mut negatives = Vec::new();
    let mut konst: i64 = 0;
    collect_terms(e, true, &mut positives, &mut negatives, &mut konst);

    // Cancel pairs that appear on both sides.
    let mut i = 0;
    while i < positives.len() {
        if let Some(j) = negatives.iter().position(|n| *n == positives[i]) {
            negatives.remove(j);
            positives.remove(i);
        } else {
            i += 1;
        }
    }

    if positives.is_empty() {
        // Only negative terms and/or a constant remain.
        if negatives.is_empty() {
            return Exp::int(konst);
        }
        let mut neg_iter = negatives.into_iter();
        let mut acc = Exp::unary(Operator::Neg, neg_iter.next().expect("nonempty"));
        for n in neg_iter {
            acc = Exp::binary(Operator::Minus, acc, n);
        }
        if konst != 0 {
            acc = append_const(acc, konst);
        }
        return acc;
    }

    let mut iter = positives.into_iter();
    let mut acc = iter.next().expect("nonempty");
    for p in iter {
        acc = Exp::binary(Operator::Plus, acc, p);
    }
    for n in negatives {
        acc = Exp::binary(Operator::Minus, acc, n);
    }
    if konst != 0 {
        acc = append_const(acc, konst);
    }
    acc
}

fn append_const(acc: Exp, konst: i64) -> Exp {
    if konst >= 0 {
        Exp::binary(Operator::Plus, acc, Exp::int(konst))
    } else {
        Exp::binary(Operator::Minus, acc, Exp::int(-konst))
    }
}

fn collect_terms(
    e: Exp,
    positive: bool,
    positives: &mut Vec<Exp>,
    negatives: &mut Vec<Exp>,
    konst: &mut i64,
) {
    match e {
        Exp::Binary(Operator::Plus, a, b) => {
            collect_terms(*a, positive, positives, negatives, konst);
            collect_terms(*b, positive, positives, negatives, konst);
        }
        Exp::Binary(Operator::Minus, a, b) => {
            collect_terms(*a, positive, positives, negatives, konst);
            collect_terms(*b, !positive, positives, negatives, konst);
        }
        Exp::Unary(Operator::Neg, a) => {
            collect_terms(*a, !positive, positives, negatives, konst);
        }
        Exp::Const(Const { kind: ConstKind::Int(i), conscript: 0 }) => {
            if positive {
                *konst = konst.wrapping_add(i);
            } else {
                *konst = konst.wrapping_sub(i);
            }
        }
        term => {
            if positive {
                positives.push(term);
            } else {
                negatives.push(term);
            }
        }
    }
}

fn fold_int_binary(op: Operator, a: i64, b: i64) -> Option<Exp> {
    let val = match op {
        Operator::Plus => a.wrapping_add(b),
        Operator::Minus => a.wrapping_sub(b),
        Operator::Mult | Operator::MultS => a.wrapping_mul(b),
        Operator::Div => {
            if b == 0 {
                return None;
            }
            ((a as u32) / (b as u32)) as i64
        }
        Operator::DivS => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        Operator::Mod => {
            if b == 0 {
                return None;
            }
            ((a as u32) % (b as u32)) as i64
        }
        Operator::ModS => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        Operator::BitAnd => a & b,
        Operator::BitOr => a | b,
        Operator::BitXor => a ^ b,
        Operator::Shl => ((a as u64).wrapping_shl(b as u32)) as i64,
        Operator::Shr => ((a as u32 as u64) >> (b as u32 & 31)) as i64,
        Operator::Sar => ((a as i32) >> (b as u32 & 31)) as i64,
        Operator::Equals => return Some(bool_exp(a == b)),
        Operator::NotEqual => return Some(bool_exp(a != b)),
        Operator::Less => return Some(bool_exp((a as i32) < (b as i32))),
        Operator::Greater => return Some(bool_exp((a as i32) > (b as i32))),
        Operator::LessEq => return Some(bool_exp((a as i32) <= (b as i32))),
        Operator::GreaterEq => return Some(bool_exp((a as i32) >= (b as i32))),
        Operator::LessUns => return Some(bool_exp((a as u32) < (b as u32))),
        Operator::GreaterUns => return Some(bool_exp((a as u32) > (b as u32))),
        Operator::LessEqUns => return Some(bool_exp((a as u32) <= (b as u32))),
        Operator::GreaterEqUns => return Some(bool_exp((a as u32) >= (b as u32))),
        _ => return None,
    };
    Some(Exp::int(val))
}

fn bool_exp(b: bool) -> Exp {
    Exp::terminal(if b { Operator::True } else { Operator::False })
}

/// One local rewrite, applied bottom-up.
fn simplify_node(e: Exp) -> Exp {
    match e {
        Exp::Unary(op, a) => simplify_unary(op, *a),
        Exp::Binary(op, a, b) => simplify_binary(op, *a, *b),
        Exp::Ternary(op, a, b, c) => simplify_ternary(op, *a, *b, *c),
        Exp::Typed(ty, a) => match *a {
            // Collapse nested casts to the outer one.
            Exp::Typed(_, inner) => Exp::Typed(ty, inner),
            a => Exp::Typed(ty, Box::new(a)),
        },
        e => e,
    }
}

fn simplify_unary(op: Operator, a: Exp) -> Exp {
    match (op, a) {
        (Operator::Neg, Exp::Const(Const { kind: ConstKind::Int(i), conscript: 0 })) => {
            Exp::int(i.wrapping_neg())
        }
        (Operator::Not, Exp::Const(Const { kind: ConstKind::Int(i), conscript: 0 })) => {
            Exp::int(!i)
        }
        (Operator::Neg, Exp::Unary(Operator::Neg, inner)) => *inner,
        // -(a - b) reads as b - a.
        (Operator::Neg, Exp::Binary(Operator::Minus, a, b)) => {
            Exp::Binary(Operator::Minus, b, a)
        }
        (Operator::Not, Exp::Unary(Operator::Not, inner)) => *inner,
        (Operator::LNot, Exp::Terminal(Operator::True)) => Exp::terminal(Operator::False),
        (Operator::LNot, Exp::Terminal(Operator::False)) => Exp::terminal(Operator::True),
        (Operator::LNot, Exp::Unary(Operator::LNot, inner)) => *inner,
        // !(a cmp b) becomes the inverted comparison.
        (Operator::LNot, Exp::Binary(cmp, l, r)) if cmp.is_comparison() => {
            Exp::Binary(cmp.negated_comparison(), l, r)
        }
        // m[a[x]] and a[m[x]] cancel.
        (Operator::MemOf, Exp::Unary(Operator::AddrOf, inner)) => *inner,
        (Operator::AddrOf, Exp::Unary(Operator::MemOf, inner)) => *inner,
        (op, a) => Exp::Unary(op, Box::new(a)),
    }
}

fn simplify_binary(op: Operator, a: Exp, b: Exp) -> Exp {
    // Constant folding first.
    if let (Some(x), Some(y)) = (a.int_value(), b.int_value()) {
        if let Some(folded) = fold_int_binary(op, x, y) {
            return folded;
        }
    }

    // Move a lone constant to the right of commutative operators.
    let (a, b) = if op.is_commutative() && a.is_int_const() && !b.is_int_const() {
        (b, a)
    } else {
        (a, b)
    };

    match op {
        Operator::Plus | Operator::BitOr | Operator::BitXor
            if b.int_value() == Some(0) =>
        {
            return a;
        }
        Operator::Minus if b.int_value() == Some(0) => return a,
        Operator::Minus if a == b => return Exp::int(0),
        Operator::Mult | Operator::MultS => {
            if b.int_value() == Some(1) {
                return a;
            }
            if b.int_value() == Some(0) {
                return Exp::int(0);
            }
        }
        Operator::Div | Operator::DivS if b.int_value() == Some(1) => return a,
        Operator::BitAnd => {
            if b.int_value() == Some(0) {
                return Exp::int(0);
            }
            if b.int_value() == Some(-1) {
                return a;
            }
            if a == b {
                return a;
            }
        }
        Operator::BitOr if a == b => return a,
        Operator::BitXor if a == b => return Exp::int(0),
        Operator::Shl | Operator::Shr | Operator::Sar if b.int_value() == Some(0) => {
            return a;
        }
        Operator::And => {
            if a.is_terminal(Operator::True) {
                return b;
            }
            if b.is_terminal(Operator::True) {
                return a;
            }
            if a.is_terminal(Operator::False) || b.is_terminal(Operator::False) {
                return Exp::terminal(Operator::False);
            }
        }
        Operator::Or => {
            if a.is_terminal(Operator::False) {
                return b;
            }
            if b.is_terminal(Operator::False) {
                return a;
            }
            if a.is_terminal(Operator::True) || b.is_terminal(Operator::True) {
                return Exp::terminal(Operator::True);
            }
        }
        Operator::Equals if a == b => return Exp::terminal(Operator::True),
        Operator::NotEqual if a == b => return Exp::terminal(Operator::False),
        // A left shift by a constant is a multiplication; the multiplied
        // form is what the address-pattern matchers look for.
        Operator::Shl => {
            if let Some(k) = b.int_value() {
                if (1..=10).contains(&k) {
                    return Exp::binary(Operator::Mult, a, Exp::int(1 << k));
                }
            }
        }
        _ => {}
    }

    // Only equality and signed orderings survive moving terms across the
    // comparison; unsigned orderings change meaning under subtraction.
    let signed_cmp = matches!(
        op,
        Operator::Equals
            | Operator::NotEqual
            | Operator::Less
            | Operator::Greater
            | Operator::LessEq
            | Operator::GreaterEq
    );
    if signed_cmp {
        // (x - y) cmp 0 is x cmp y.
        if b.int_value() == Some(0) {
            if let Exp::Binary(Operator::Minus, x, y) = &a {
                return Exp::binary(op, (**x).clone(), (**y).clone());
            }
        }
        // (x + k1) cmp k2 folds the constants to the right.
        if let (Exp::Binary(inner, x, k1), Some(k2)) = (&a, b.int_value()) {
            if let Some(k1v) = k1.int_value() {
                match inner {
                    Operator::Plus => {
                        return Exp::binary(op, (**x).clone(), Exp::int(k2.wrapping_sub(k1v)));
                    }
                    Operator::Minus => {
                        return Exp::binary(op, (**x).clone(), Exp::int(k2.wrapping_add(k1v)));
                    }
                    _ => {}
                }
            }
        }
    }
    Exp::Binary(op, Box::new(a), Box::new(b))
}

fn simplify_ternary(op: Operator, a: Exp, b: Exp, c: Exp) -> Exp {
    // Conversions of integer constants fold away.
    if let (Some(from), Some(to), Some(v)) = (a.int_value(), b.int_value(), c.int_value()) {
        match op {
            Operator::ZFill => {
                let mask = if from >= 64 { -1i64 } else { (1i64 << from) - 1 };
                return Exp::int(v & mask);
            }
            Operator::SgnEx => {
                let shift = 64 - from.clamp(1, 64);
                return Exp::int((v << shift) >> shift);
            }
            Operator::TruncU | Operator::TruncS => {
                let mask = if to >= 64 { -1i64 } else { (1i64 << to) - 1 };
                return Exp::int(v & mask);
            }
            _ => {}
        }
    }
    // Identity-width conversions vanish.
    if matches!(
        op,
        Operator::ZFill | Operator::SgnEx | Operator::TruncS | Operator::TruncU | Operator::FSize
    ) && a.int_value().is_some()
        && a.int_value() == b.int_value()
    {
        return c;
    }
    Exp::Ternary(op, Box::new(a), Box::new(b), Box::new(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_folding() {
        let e = Exp::binary(Operator::Plus, Exp::int(3), Exp::int(4)).simplify();
        assert_eq!(e, Exp::int(7));

        let e = Exp::binary(Operator::Mult, Exp::int(6), Exp::int(7)).simplify();
        assert_eq!(e, Exp::int(42));
    }

    #[test]
    fn test_identity_elimination() {
        let e = Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(0)).simplify();
        assert_eq!(e, Exp::reg(28));

        let e = Exp::binary(Operator::Mult, Exp::reg(24), Exp::int(1)).simplify();
        assert_eq!(e, Exp::reg(24));

        let e = Exp::binary(Operator::Mult, Exp::reg(24), Exp::int(0)).simplify();
        assert_eq!(e, Exp::int(0));
    }

    #[test]
    fn test_chain_normalisation_cancels_terms() {
        // (r28 + 4) - 4 collapses to r28
        let e = Exp::binary(
            Operator::Minus,
            Exp::binary(Operator::Plus, Exp::reg(28), Exp::int(4)),
            Exp::int(4),
        )
        .simplify();
        assert_eq!(e, Exp::reg(28));

        // (r28 - r29) + r29 collapses to r28
        let e = Exp::binary(
            Operator::Plus,
            Exp::binary(Operator::Minus, Exp::reg(28), Exp::reg(29)),
            Exp::reg(29),
        )
        .simplify();
        assert_eq!(e, Exp::reg(28));
    }

    #[test]
    fn test_negative_constant_prints_as_minus() {
        let e = Exp::binary(
            Operator::Plus,
            Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(8)),
            Exp::int(4),
        )
        .simplify();
        assert_eq!(e, Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4)));
    }

    #[test]
    fn test_idempotent_at_fixpoint() {
        let e = Exp::binary(
            Operator::Plus,
            Exp::mem(Exp::binary(Operator::Minus, Exp::reg(28), Exp::int(4))),
            Exp::int(0),
        );
        let once = e.simplify();
        let twice = once.clone().simplify();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_comparison_folding() {
        let e = Exp::binary(Operator::Less, Exp::int(3), Exp::int(4)).simplify();
        assert_eq!(e, Exp::terminal(Operator::True));

        let e = Exp::binary(Operator::Equals, Exp::reg(28), Exp::reg(28)).simplify();
        assert_eq!(e, Exp::terminal(Operator::True));
    }

    #[test]
    fn test_mem_addr_cancellation() {
        let e = Exp::mem(Exp::addr_of(Exp::local("x"))).simplify();
        assert_eq!(e, Exp::local("x"));
    }

    #[test]
    fn test_not_of_comparison_inverts() {
        let e = Exp::unary(
            Operator::LNot,
            Exp::binary(Operator::GreaterEq, Exp::reg(24), Exp::int(0)),
        )
        .simplify();
        assert_eq!(e, Exp::binary(Operator::Less, Exp::reg(24), Exp::int(0)));
    }

    #[test]
    fn test_subtraction_against_zero_becomes_comparison() {
        let e = Exp::binary(
            Operator::Less,
            Exp::binary(Operator::Minus, Exp::reg(24), Exp::reg(25)),
            Exp::int(0),
        )
        .simplify();
        assert_eq!(e, Exp::binary(Operator::Less, Exp::reg(24), Exp::reg(25)));

        // Unsigned orderings must not move terms across the comparison.
        let e = Exp::binary(
            Operator::LessUns,
            Exp::binary(Operator::Minus, Exp::reg(24), Exp::reg(25)),
            Exp::int(0),
        )
        .simplify();
        assert_eq!(
            e,
            Exp::binary(
                Operator::LessUns,
                Exp::binary(Operator::Minus, Exp::reg(24), Exp::reg(25)),
                Exp::int(0)
            )
        );
    }

    #[test]
    fn test_comparison_constant_folding_across_plus() {
        let e = Exp::binary(
            Operator::Equals,
            Exp::binary(Operator::Plus, Exp::reg(24), Exp::int(3)),
            Exp::int(10),
        )
        .simplify();
        assert_eq!(e, Exp::binary(Operator::Equals, Exp::reg(24), Exp::int(7)));
    }

    #[test]
    fn test_shift_left_becomes_multiply() {
        let e = Exp::binary(Operator::Shl, Exp::reg(24), Exp::int(2)).simplify();
        assert_eq!(e, Exp::binary(Operator::Mult, Exp::reg(24), Exp::int(4)));
    }

    #[test]
    fn test_sign_extension_folds() {
        let e = Exp::ternary(Operator::SgnEx, Exp::int(8), Exp::int(32), Exp::int(-1i64 & 0xff))
            .simplify();
        assert_eq!(e, Exp::int(-1));
    }
}
