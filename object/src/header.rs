use crate::Oop;

bitflags::bitflags! {
    /// Bookkeeping bits kept next to the class pointer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u8 {
        /// Reached during the current collection's mark phase.
        const MARKED = 1 << 0;
        /// Stores through `at:put:` / `instVarAt:put:` fail.
        const IMMUTABLE = 1 << 1;
    }
}

/// Identity data every heap object carries.
///
/// The identity hash is assigned once at allocation and moves with the
/// object's contents on a two-way `become:`.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub class: Oop,
    pub hash: u32,
    pub flags: HeaderFlags,
}

impl Header {
    pub const fn new(class: Oop, hash: u32) -> Self {
        Self {
            class,
            hash,
            flags: HeaderFlags::empty(),
        }
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.flags.contains(HeaderFlags::MARKED)
    }

    #[inline(always)]
    pub fn is_immutable(&self) -> bool {
        self.flags.contains(HeaderFlags::IMMUTABLE)
    }
}
