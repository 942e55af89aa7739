//! The type lattice used by data-flow type analysis.
//!
//! `Void` is the lattice bottom ("no information yet"); `meet_with` moves
//! types up the lattice as evidence accumulates. Integer signedness is an
//! evidence counter rather than a boolean: positive counts say signed,
//! negative say unsigned, zero says nobody has voted yet.

use std::fmt;

/// Recovered high-level type of a location or expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    /// Bottom: nothing known.
    Void,
    /// Known width in bits, unknown interpretation.
    Size(u16),
    Boolean,
    Char,
    /// Integer of a given width; `signedness` is the signed-evidence counter.
    Integer { size: u16, signedness: i16 },
    /// IEEE float of a given width.
    Float(u16),
    Pointer(Box<Type>),
    /// Array; `length` 0 means unbounded.
    Array { base: Box<Type>, length: u32 },
    /// Reference to a named (compound or opaque) type.
    Named(String),
    /// Function (signatures are held by procedures, not types).
    Func,
    /// Two incompatible candidates met; kept for diagnosis and splitting.
    Union(Vec<Type>),
}

impl Type {
    /// Integer with no signedness evidence.
    pub fn int(size: u16) -> Type {
        Type::Integer { size, signedness: 0 }
    }

    pub fn signed_int(size: u16) -> Type {
        Type::Integer { size, signedness: 1 }
    }

    pub fn unsigned_int(size: u16) -> Type {
        Type::Integer { size, signedness: -1 }
    }

    pub fn pointer(to: Type) -> Type {
        Type::Pointer(Box::new(to))
    }

    pub fn array(base: Type, length: u32) -> Type {
        Type::Array { base: Box::new(base), length }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Integer { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float(_))
    }

    pub fn resolves_to_pointer(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    /// Pointed-to type, if this is a pointer.
    pub fn points_to(&self) -> Option<&Type> {
        match self {
            Type::Pointer(inner) => Some(inner),
            _ => None,
        }
    }

    /// Width in bits; 0 when unknown.
    pub fn size_bits(&self) -> u16 {
        match self {
            Type::Void => 0,
            Type::Size(s) => *s,
            Type::Boolean => 1,
            Type::Char => 8,
            Type::Integer { size, .. } => *size,
            Type::Float(s) => *s,
            Type::Pointer(_) | Type::Func => 32,
            Type::Array { .. } | Type::Named(_) | Type::Union(_) => 0,
        }
    }

    /// The lattice meet. `changed` is set when the result is observably
    /// different from `self`: signedness evidence accumulating in the same
    /// direction does not count, or the analysis fixpoint would never
    /// settle. `use_highest_ptr` keeps the more general of two pointed-to
    /// types instead of meeting them (an assignment's left side may hold a
    /// supertype of its right side).
    pub fn meet_with(&self, other: &Type, changed: &mut bool, use_highest_ptr: bool) -> Type {
        let result = self.meet_inner(other, use_highest_ptr);
        if !result.same_shape(self) {
            *changed = true;
        }
        result
    }

    /// Observable equality: integers compare by width and the sign of their
    /// evidence counter, everything else exactly.
    fn same_shape(&self, other: &Type) -> bool {
        match (self, other) {
            (
                Type::Integer { size: s1, signedness: g1 },
                Type::Integer { size: s2, signedness: g2 },
            ) => s1 == s2 && g1.signum() == g2.signum(),
            _ => self == other,
        }
    }

    fn meet_inner(&self, other: &Type, use_highest_ptr: bool) -> Type {
        if self == other {
            return self.clone();
        }
        match (self, other) {
            (Type::Void, t) => t.clone(),
            (t, Type::Void) => t.clone(),

            // Size gives its width to whatever it meets.
            (Type::Size(s), Type::Size(t)) => Type::Size((*s).max(*t)),
            (Type::Size(s), Type::Integer { size, signedness }) => Type::Integer {
                size: (*s).max(*size),
                signedness: *signedness,
            },
            (Type::Integer { size, signedness }, Type::Size(s)) => Type::Integer {
                size: (*s).max(*size),
                signedness: *signedness,
            },
            (Type::Size(s), Type::Float(t)) | (Type::Float(t), Type::Size(s)) => {
                Type::Float((*s).max(*t))
            }
            (Type::Size(_), t) => t.clone(),
            (t, Type::Size(_)) => t.clone(),

            (
                Type::Integer { size: s1, signedness: g1 },
                Type::Integer { size: s2, signedness: g2 },
            ) => Type::Integer {
                size: (*s1).max(*s2),
                signedness: g1.saturating_add(*g2),
            },

            (Type::Float(s1), Type::Float(s2)) => Type::Float((*s1).max(*s2)),

            (Type::Char, Type::Integer { size: 8, .. })
            | (Type::Integer { size: 8, .. }, Type::Char) => Type::Char,

            (Type::Boolean, Type::Integer { size, .. })
            | (Type::Integer { size, .. }, Type::Boolean) => Type::int(*size),

            // Pointer absorbs a same-width integer: addresses look like ints
            // until something dereferences them.
            (Type::Pointer(inner), Type::Integer { .. }) => Type::Pointer(inner.clone()),
            (Type::Integer { .. }, Type::Pointer(inner)) => Type::Pointer(inner.clone()),

            (Type::Pointer(a), Type::Pointer(b)) => {
                if use_highest_ptr {
                    // Keep the less specific side.
                    if a.is_void() {
                        Type::Pointer(a.clone())
                    } else if b.is_void() {
                        Type::Pointer(b.clone())
                    } else {
                        let mut ch = false;
                        Type::pointer(a.meet_with(b, &mut ch, false))
                    }
                } else {
                    let mut ch = false;
                    Type::pointer(a.meet_with(b, &mut ch, false))
                }
            }

            (Type::Array { base: b1, length: l1 }, Type::Array { base: b2, length: l2 }) => {
                let mut ch = false;
                Type::array(b1.meet_with(b2, &mut ch, false), (*l1).max(*l2))
            }
            (Type::Array { base, length }, t) if t == base.as_ref() => {
                Type::array((**base).clone(), *length)
            }
            (t, Type::Array { base, length }) if t == base.as_ref() => {
                Type::array((**base).clone(), *length)
            }

            (Type::Union(items), t) => {
                let mut items = items.clone();
                if !items.contains(t) {
                    items.push(t.clone());
                }
                Type::Union(items)
            }
            (t, Type::Union(items)) => {
                let mut items = items.clone();
                if !items.contains(t) {
                    items.insert(0, t.clone());
                }
                Type::Union(items)
            }

            // No common ancestor: remember both candidates.
            (a, b) => Type::Union(vec![a.clone(), b.clone()]),
        }
    }

    /// Whether two types can share one live range without a split.
    pub fn is_compatible_with(&self, other: &Type) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Type::Void, _) | (_, Type::Void) => true,
            (Type::Size(s), t) | (t, Type::Size(s)) => {
                t.size_bits() == 0 || t.size_bits() == *s
            }
            (Type::Integer { size: s1, .. }, Type::Integer { size: s2, .. }) => s1 == s2,
            (Type::Integer { size, .. }, Type::Pointer(_))
            | (Type::Pointer(_), Type::Integer { size, .. }) => *size == 32,
            (Type::Char, Type::Integer { size: 8, .. })
            | (Type::Integer { size: 8, .. }, Type::Char) => true,
            (Type::Float(s1), Type::Float(s2)) => s1 == s2,
            (Type::Pointer(a), Type::Pointer(b)) => a.is_compatible_with(b),
            (Type::Array { base: a, .. }, Type::Array { base: b, .. }) => {
                a.is_compatible_with(b)
            }
            (Type::Union(items), t) | (t, Type::Union(items)) => {
                items.iter().any(|i| i.is_compatible_with(t))
            }
            _ => false,
        }
    }
}

impl Default for Type {
    fn default() -> Self {
        Type::Void
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "v"),
            Type::Size(s) => write!(f, "s{s}"),
            Type::Boolean => write!(f, "b"),
            Type::Char => write!(f, "c"),
            Type::Integer { size, signedness } => {
                let letter = if *signedness > 0 {
                    'i'
                } else if *signedness < 0 {
                    'u'
                } else {
                    'j'
                };
                write!(f, "{letter}{size}")
            }
            Type::Float(s) => write!(f, "f{s}"),
            Type::Pointer(inner) => write!(f, "p[{inner}]"),
            Type::Array { base, length } => {
                if *length == 0 {
                    write!(f, "a[{base}]")
                } else {
                    write!(f, "a[{base}, {length}]")
                }
            }
            Type::Named(name) => write!(f, "{name}"),
            Type::Func => write!(f, "func"),
            Type::Union(items) => {
                write!(f, "union{{")?;
                for (i, t) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_is_identity_for_meet() {
        let mut ch = false;
        assert_eq!(
            Type::Void.meet_with(&Type::signed_int(32), &mut ch, false),
            Type::signed_int(32)
        );
        assert!(ch);

        ch = false;
        assert_eq!(
            Type::signed_int(32).meet_with(&Type::Void, &mut ch, false),
            Type::signed_int(32)
        );
        assert!(!ch);
    }

    #[test]
    fn test_signedness_accumulates() {
        let mut ch = false;
        let t = Type::signed_int(32).meet_with(&Type::signed_int(32), &mut ch, false);
        assert_eq!(t, Type::Integer { size: 32, signedness: 2 });

        let t2 = t.meet_with(&Type::unsigned_int(32), &mut ch, false);
        assert_eq!(t2, Type::Integer { size: 32, signedness: 1 });
    }

    #[test]
    fn test_pointer_absorbs_integer() {
        let mut ch = false;
        let p = Type::pointer(Type::signed_int(32));
        assert_eq!(p.meet_with(&Type::int(32), &mut ch, false), p);
        assert!(!ch);

        ch = false;
        let up = Type::int(32).meet_with(&p, &mut ch, false);
        assert_eq!(up, p);
        assert!(ch);
    }

    #[test]
    fn test_incompatible_meet_forms_union() {
        let mut ch = false;
        let t = Type::Float(32).meet_with(&Type::signed_int(32), &mut ch, false);
        assert!(matches!(t, Type::Union(_)));
        assert!(ch);
        assert!(!Type::Float(32).is_compatible_with(&Type::signed_int(32)));
    }

    #[test]
    fn test_size_meets_into_width() {
        let mut ch = false;
        let t = Type::Size(32).meet_with(&Type::signed_int(16), &mut ch, false);
        assert_eq!(t, Type::Integer { size: 32, signedness: 1 });
    }

    #[test]
    fn test_display_short_forms() {
        assert_eq!(Type::Void.to_string(), "v");
        assert_eq!(Type::signed_int(32).to_string(), "i32");
        assert_eq!(Type::unsigned_int(16).to_string(), "u16");
        assert_eq!(Type::int(32).to_string(), "j32");
        assert_eq!(Type::pointer(Type::Char).to_string(), "p[c]");
    }
}
