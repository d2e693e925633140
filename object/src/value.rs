use core::fmt;

/// Smallest SmallInteger (61-bit two's complement).
pub const SMALL_INT_MIN: i64 = -0x1000_0000_0000_0000;
/// Largest SmallInteger.
pub const SMALL_INT_MAX: i64 = 0x0fff_ffff_ffff_ffff;

/// A stable handle to an object in the [`ObjectMemory`](crate::ObjectMemory)
/// arena.
///
/// Handles never move. `become:` rewrites what a handle refers to (two-way)
/// or which handle a field holds (one-way), never the handle itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oop(u32);

impl Oop {
    #[inline(always)]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// An object field: either an immediate SmallInteger or a reference.
///
/// `Int` must stay within [`SMALL_INT_MIN`]..=[`SMALL_INT_MAX`]; anything
/// wider lives in a large integer object. Use [`Value::small_int`] when the
/// range is not already known.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i64),
    Ref(Oop),
}

impl Value {
    #[inline(always)]
    pub const fn fits_small_int(n: i64) -> bool {
        n >= SMALL_INT_MIN && n <= SMALL_INT_MAX
    }

    /// `Some(Value::Int(n))` if `n` fits the SmallInteger range.
    #[inline(always)]
    pub const fn small_int(n: i64) -> Option<Self> {
        if Self::fits_small_int(n) {
            Some(Self::Int(n))
        } else {
            None
        }
    }

    #[inline(always)]
    pub const fn is_int(self) -> bool {
        matches!(self, Self::Int(_))
    }

    #[inline(always)]
    pub const fn is_ref(self) -> bool {
        matches!(self, Self::Ref(_))
    }

    #[inline(always)]
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(n),
            Self::Ref(_) => None,
        }
    }

    #[inline(always)]
    pub const fn as_oop(self) -> Option<Oop> {
        match self {
            Self::Ref(oop) => Some(oop),
            Self::Int(_) => None,
        }
    }
}

impl From<Oop> for Value {
    #[inline(always)]
    fn from(oop: Oop) -> Self {
        Self::Ref(oop)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "Int({n})"),
            Self::Ref(oop) => write!(f, "Ref({oop:?})"),
        }
    }
}

/// Run `visitor` over an [`Oop`] field as if it were a [`Value`].
///
/// A visitor that answers an immediate leaves the field unchanged; only
/// references can stand in for a handle.
pub fn visit_oop(oop: &mut Oop, visitor: &mut dyn FnMut(&mut Value)) {
    let mut value = Value::Ref(*oop);
    visitor(&mut value);
    if let Value::Ref(new) = value {
        *oop = new;
    }
}
