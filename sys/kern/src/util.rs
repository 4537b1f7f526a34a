// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common utility types used in various places in the kernel.

use core::fmt;

/// A short, fixed-capacity, `Copy` string used for task, lock-owner and
/// secure-function names.
///
/// Unlike `heapless::String` this truncates instead of failing when handed
/// something too long, because names are labels for humans and the kernel
/// shouldn't reject a task over one. Truncation never splits a character.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FixedName<const MAX: usize> {
    buf: [u8; MAX],
    len: u8,
}

impl<const MAX: usize> FixedName<MAX> {
    pub const EMPTY: Self = Self {
        buf: [0; MAX],
        len: 0,
    };

    pub fn new(s: &str) -> Self {
        let mut len = s.len().min(MAX);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        let mut buf = [0; MAX];
        buf[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from a `&str` cut at a character boundary.
        core::str::from_utf8(&self.buf[..usize::from(self.len)])
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies into a NUL-padded buffer of any size, as used by the `abi`
    /// records.
    pub fn to_padded<const N: usize>(&self) -> [u8; N] {
        abi::pack_name(self.as_str())
    }
}

impl<const MAX: usize> fmt::Debug for FixedName<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const MAX: usize> fmt::Display for FixedName<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const MAX: usize> PartialEq<str> for FixedName<MAX> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_names() {
        let n = FixedName::<15>::new("a-name-that-is-far-too-long");
        assert_eq!(n.as_str(), "a-name-that-is-");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; the cut would land in its middle.
        let n = FixedName::<4>::new("abcé");
        assert_eq!(n.as_str(), "abc");
    }

    #[test]
    fn pads_for_abi() {
        let n = FixedName::<15>::new("idle");
        let padded: [u8; 16] = n.to_padded();
        assert_eq!(&padded[..5], b"idle\0");
        assert_eq!(abi::unpack_name(&padded), "idle");
    }
}
