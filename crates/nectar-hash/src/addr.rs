//! Packed block addresses.
//!
//! An address names a location in the host filesystem plus a handful of flag
//! bits the scanner packs into the top of the word. The index treats the
//! value as opaque except for two things: values below
//! [`BlockAddr::MAGIC_LIMIT`] are reserved sentinels (zero means "empty
//! cell"), and the *toxic* flag is set on the synthetic result returned for
//! blacklisted fingerprints.

use std::fmt;

/// A 64-bit filesystem address with flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BlockAddr(u64);

impl BlockAddr {
    const COMPRESSED: u64 = 1 << 63;
    const COMPRESSED_OFFSET: u64 = 1 << 62;
    const TOXIC: u64 = 1 << 61;
    const UNALIGNED_EOF: u64 = 1 << 60;

    /// Addresses below this value are reserved sentinels, never real
    /// filesystem locations.
    pub const MAGIC_LIMIT: u64 = 0x1000;

    /// The empty-cell sentinel.
    pub const ZERO: BlockAddr = BlockAddr(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// True for any reserved sentinel value, including zero.
    #[inline]
    pub const fn is_magic(self) -> bool {
        self.0 < Self::MAGIC_LIMIT
    }

    /// True for an address that may be returned from a lookup.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= Self::MAGIC_LIMIT
    }

    #[inline]
    pub const fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Compressed entries written by newer scanners carry the offset of the
    /// block inside its compressed extent; older entries do not.
    #[inline]
    pub const fn has_compressed_offset(self) -> bool {
        self.is_compressed() && self.0 & Self::COMPRESSED_OFFSET != 0
    }

    #[inline]
    pub const fn is_toxic(self) -> bool {
        self.0 & Self::TOXIC != 0
    }

    #[inline]
    pub const fn is_unaligned_eof(self) -> bool {
        self.0 & Self::UNALIGNED_EOF != 0
    }

    #[inline]
    pub fn set_toxic(&mut self) {
        self.0 |= Self::TOXIC;
    }
}

impl From<u64> for BlockAddr {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockAddr({:#x})", self.0)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
