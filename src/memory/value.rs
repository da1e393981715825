//! VM value representation
//!
//! Every value the scripts can see is an [`Address`]: a `segment:offset` pair.
//! Segment 0 is not a real segment, so an address with segment 0 carries a raw
//! 16-bit number in its offset. This lets the same 32-bit slot hold either an
//! integer or a heap reference, exactly as the compiled bytecode expects.
//!
//! # Null
//!
//! `0:0` is both the integer zero and the null reference.

use std::fmt;

/// Identifier of a heap segment
pub type SegmentId = u16;

/// A `segment:offset` heap location, or a raw number when `segment == 0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address {
    pub segment: SegmentId,
    pub offset: u16,
}

impl Address {
    /// The null address (also the number zero)
    pub const NULL: Address = Address {
        segment: 0,
        offset: 0,
    };

    pub const fn new(segment: SegmentId, offset: u16) -> Self {
        Address { segment, offset }
    }

    /// Wrap a raw 16-bit number
    pub const fn from_u16(value: u16) -> Self {
        Address {
            segment: 0,
            offset: value,
        }
    }

    /// Wrap a signed number (stored two's complement)
    pub const fn from_i16(value: i16) -> Self {
        Address::from_u16(value as u16)
    }

    /// Boolean results are the numbers 0 and 1
    pub const fn from_bool(value: bool) -> Self {
        Address::from_u16(value as u16)
    }

    pub fn is_null(&self) -> bool {
        self.segment == 0 && self.offset == 0
    }

    /// True when this value is a raw number rather than a heap reference
    pub fn is_number(&self) -> bool {
        self.segment == 0
    }

    pub fn is_pointer(&self) -> bool {
        self.segment != 0
    }

    /// Truthiness as tested by `bt`/`bnt`: anything but `0:0`
    pub fn is_truthy(&self) -> bool {
        !self.is_null()
    }

    /// Numeric value, or `None` for a heap reference
    pub fn as_u16(&self) -> Option<u16> {
        self.is_number().then_some(self.offset)
    }

    pub fn as_i16(&self) -> Option<i16> {
        self.as_u16().map(|v| v as i16)
    }

    /// Same segment, offset moved by `delta` bytes (wrapping)
    pub fn with_offset_delta(self, delta: i32) -> Self {
        Address {
            segment: self.segment,
            offset: (self.offset as i32).wrapping_add(delta) as u16,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.segment, self.offset)
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Address::from_u16(value)
    }
}

impl From<i16> for Address {
    fn from(value: i16) -> Self {
        Address::from_i16(value)
    }
}
