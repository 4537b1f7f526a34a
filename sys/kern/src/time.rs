// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// This is measured in microseconds since the hardware timer started, which
/// on this part is at reset. 64 bits of microseconds will not wrap in the
/// lifetime of the hardware.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_us(us: u64) -> Self {
        Self(us)
    }

    pub const fn as_us(self) -> u64 {
        self.0
    }

    /// Microseconds from `earlier` to `self`, or zero if `earlier` is
    /// actually later.
    pub fn since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus_ms(self, ms: u32) -> Self {
        Self(self.0.saturating_add(u64::from(ms) * 1000))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

/// Assembles a timestamp from a timer's low and high words, in that order.
impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_assemble_low_first() {
        let t = Timestamp::from([0x9abc_def0, 0x1234_5678]);
        assert_eq!(t.as_us(), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn since_saturates() {
        let a = Timestamp::from_us(1000);
        let b = Timestamp::from_us(1300);
        assert_eq!(b.since(a), 300);
        assert_eq!(a.since(b), 0);
        assert_eq!(a.plus_ms(2), Timestamp::from_us(3000));
    }
}
