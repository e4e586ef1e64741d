//! Shadow marker values and the bit tricks used to classify them.
//!
//! Every marker with the high bit set describes an inaccessible granule.
//! Values below 8 describe a granule whose first `n` bytes are accessible
//! (0 meaning the whole granule). Block start markers carry two extra fields:
//! a nested flag and the body size modulo the granule size, which lets the
//! block geometry be recovered from the shadow alone.

use std::fmt;

/// Bit set on every redzone marker.
const REDZONE_BIT: u8 = 0x80;

/// Bits shared by all block start markers.
const BLOCK_START_PREFIX: u8 = 0xE0;
const BLOCK_START_PREFIX_MASK: u8 = 0xF0;

/// Nested flag of a block start marker.
const BLOCK_START_NESTED_BIT: u8 = 0x08;

/// Data bits of a block start marker.
const BLOCK_START_DATA_MASK: u8 = 0x07;

/// Nested flag of a block end marker.
const BLOCK_END_NESTED_BIT: u8 = 0x01;

/// One shadow byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShadowMarker(u8);

impl ShadowMarker {
    /// The whole granule is accessible.
    pub const ADDRESSABLE: Self = Self(0x00);
    /// Memory owned by the detector itself.
    pub const INTERNAL_MEMORY: Self = Self(0xF1);
    /// Outside the monitored range, or a guard region.
    pub const INVALID_ADDRESS: Self = Self(0xF2);
    /// A range poisoned explicitly by the user.
    pub const USER_REDZONE: Self = Self(0xF3);
    /// Last granule of a top-level block.
    pub const BLOCK_END: Self = Self(0xF4);
    /// Last granule of a nested block.
    pub const NESTED_BLOCK_END: Self = Self(0xF5);
    /// Header tail and header padding.
    pub const LEFT_REDZONE: Self = Self(0xFA);
    /// Trailer padding and trailer.
    pub const RIGHT_REDZONE: Self = Self(0xFB);
    /// Arena memory that was never handed out.
    pub const RESERVED: Self = Self(0xFC);
    /// Memory of a quarantined block.
    pub const FREED: Self = Self(0xFD);

    /// Wrap a raw shadow byte.
    #[inline]
    pub const fn from_raw(value: u8) -> Self {
        Self(value)
    }

    /// The raw shadow byte.
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// A granule whose first `accessible` bytes may be touched.
    ///
    /// `accessible` of 0 or 8 both mean the whole granule.
    #[inline]
    pub const fn partial(accessible: usize) -> Self {
        Self((accessible % 8) as u8)
    }

    /// Build a block start marker.
    #[inline]
    pub const fn block_start(nested: bool, data: u8) -> Self {
        let nested_bit = if nested { BLOCK_START_NESTED_BIT } else { 0 };
        Self(BLOCK_START_PREFIX | nested_bit | (data & BLOCK_START_DATA_MASK))
    }

    /// Build a block end marker.
    #[inline]
    pub const fn block_end(nested: bool) -> Self {
        if nested {
            Self::NESTED_BLOCK_END
        } else {
            Self::BLOCK_END
        }
    }

    /// True for markers describing inaccessible granules.
    #[inline]
    pub const fn is_redzone(self) -> bool {
        self.0 & REDZONE_BIT != 0
    }

    /// True for ADDRESSABLE and partially addressable granules.
    #[inline]
    pub const fn is_addressable(self) -> bool {
        self.0 < 8
    }

    /// True for the first granule of a block.
    #[inline]
    pub const fn is_block_start(self) -> bool {
        self.0 & BLOCK_START_PREFIX_MASK == BLOCK_START_PREFIX
    }

    /// True for the first granule of a nested block.
    #[inline]
    pub const fn is_nested_block_start(self) -> bool {
        self.is_block_start() && self.0 & BLOCK_START_NESTED_BIT != 0
    }

    /// The body size modulo 8 stored in a block start marker.
    #[inline]
    pub const fn block_start_data(self) -> u8 {
        self.0 & BLOCK_START_DATA_MASK
    }

    /// True for the last granule of a block.
    #[inline]
    pub const fn is_block_end(self) -> bool {
        self.0 == Self::BLOCK_END.0 || self.0 == Self::NESTED_BLOCK_END.0
    }

    /// True for the last granule of a nested block.
    #[inline]
    pub const fn is_nested_block_end(self) -> bool {
        self.is_block_end() && self.0 & BLOCK_END_NESTED_BIT != 0
    }

    /// True for block boundaries and the redzones inside a block.
    #[inline]
    pub const fn is_block(self) -> bool {
        self.is_block_start()
            || self.is_block_end()
            || self.0 == Self::LEFT_REDZONE.0
            || self.0 == Self::RIGHT_REDZONE.0
            || self.0 == Self::FREED.0
    }

    /// True for granules that belong to the left redzone of a block.
    #[inline]
    pub const fn is_left_redzone(self) -> bool {
        self.0 == Self::LEFT_REDZONE.0 || self.is_block_start()
    }

    /// True for granules that belong to the right redzone of a block.
    #[inline]
    pub const fn is_right_redzone(self) -> bool {
        self.0 == Self::RIGHT_REDZONE.0 || self.is_block_end()
    }

    /// Human readable name, used by the shadow legend and debug output.
    pub fn name(self) -> &'static str {
        match self {
            m if m == Self::ADDRESSABLE => "addressable",
            m if m.is_addressable() => "partially addressable",
            m if m.is_nested_block_start() => "nested block start",
            m if m.is_block_start() => "block start",
            Self::INTERNAL_MEMORY => "internal memory",
            Self::INVALID_ADDRESS => "invalid address",
            Self::USER_REDZONE => "user redzone",
            Self::BLOCK_END => "block end",
            Self::NESTED_BLOCK_END => "nested block end",
            Self::LEFT_REDZONE => "left redzone",
            Self::RIGHT_REDZONE => "right redzone",
            Self::RESERVED => "reserved",
            Self::FREED => "freed",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for ShadowMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShadowMarker({:#04x}, {})", self.0, self.name())
    }
}

impl fmt::LowerHex for ShadowMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_start_encoding() {
        let start = ShadowMarker::block_start(false, 5);
        assert!(start.is_block_start());
        assert!(!start.is_nested_block_start());
        assert_eq!(start.block_start_data(), 5);
        assert!(start.is_redzone());

        let nested = ShadowMarker::block_start(true, 7);
        assert!(nested.is_nested_block_start());
        assert_eq!(nested.block_start_data(), 7);
        assert_eq!(nested.raw(), 0xEF);
    }

    #[test]
    fn test_block_end_encoding() {
        assert!(ShadowMarker::block_end(false).is_block_end());
        assert!(!ShadowMarker::block_end(false).is_nested_block_end());
        assert!(ShadowMarker::block_end(true).is_nested_block_end());
    }

    #[test]
    fn test_redzone_classification() {
        assert!(!ShadowMarker::ADDRESSABLE.is_redzone());
        assert!(!ShadowMarker::partial(3).is_redzone());
        assert!(ShadowMarker::partial(3).is_addressable());
        for marker in [
            ShadowMarker::INTERNAL_MEMORY,
            ShadowMarker::INVALID_ADDRESS,
            ShadowMarker::USER_REDZONE,
            ShadowMarker::LEFT_REDZONE,
            ShadowMarker::RIGHT_REDZONE,
            ShadowMarker::RESERVED,
            ShadowMarker::FREED,
        ] {
            assert!(marker.is_redzone(), "{:?}", marker);
            assert!(!marker.is_block_start(), "{:?}", marker);
        }
    }

    #[test]
    fn test_partial_wraps_full_granule() {
        assert_eq!(ShadowMarker::partial(8), ShadowMarker::ADDRESSABLE);
        assert_eq!(ShadowMarker::partial(13).raw(), 5);
    }

    #[test]
    fn test_names() {
        assert_eq!(ShadowMarker::FREED.name(), "freed");
        assert_eq!(ShadowMarker::partial(2).name(), "partially addressable");
        assert_eq!(ShadowMarker::block_start(true, 0).name(), "nested block start");
    }
}
