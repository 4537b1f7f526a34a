// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! On the target this module defines the following binary interface to
//! debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is set to one (true) if
//!   the kernel reaches the `die` function (either explicitly or as a result
//!   of a `panic!`).
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   possible, truncating if the buffer fills. For printing, trim off any
//!   trailing NUL bytes.
//!
//! Either core may fail, so unlike a single-core kernel the "first failure
//! wins" decision is made with an atomic swap; the loser parks.
//!
//! On the host, kernel failures are ordinary panics so that tests can observe
//! them.

/// Checks a kernel invariant. Failing one is a kernel bug, not a caller error,
/// and brings the kernel down.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel invariant violated: {}", stringify!($cond));
        }
    };
}

/// Like `uassert!` for an equality, reporting both sides.
#[allow(unused_macros)]
macro_rules! uassert_eq {
    ($a:expr, $b:expr) => {{
        let (a, b) = (&$a, &$b);
        if a != b {
            panic!("kernel invariant violated: {:?} != {:?}", a, b);
        }
    }};
}

#[cfg(all(target_os = "none", not(test)))]
mod target {
    use core::fmt::{Display, Write};
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Flag that gets set to `true` by all failure reporting functions, giving
    /// tools a one-stop-shop for doing kernel triage.
    #[used]
    #[no_mangle]
    static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

    const EPITAPH_LEN: usize = 128;

    /// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description
    /// of the event that caused the kernel to fail, padded with NULs.
    #[used]
    #[no_mangle]
    static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

    fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
        if KERNEL_HAS_FAILED.swap(true, Ordering::AcqRel) {
            // The other core got here first, or this is a recursive panic.
            // Either way there's nothing useful left to say.
            loop {
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }

        // Safety: only the single caller that won the swap above reaches this
        // point, so this is the only reference ever produced.
        unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
    }

    #[inline(always)]
    pub fn die(msg: impl Display) -> ! {
        die_impl(&msg)
    }

    #[inline(never)]
    fn die_impl(msg: &dyn Display) -> ! {
        cortex_m::interrupt::disable();
        let buf = begin_epitaph();
        let mut writer = Eulogist { dest: buf };
        write!(writer, "{msg}").ok();

        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    struct Eulogist {
        dest: &'static mut [u8],
    }

    impl Write for Eulogist {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let s = s.as_bytes();
            let n = s.len().min(self.dest.len());
            let (dest, leftovers) = {
                let taken = core::mem::take(&mut self.dest);
                taken.split_at_mut(n)
            };
            dest.copy_from_slice(&s[..n]);
            self.dest = leftovers;
            Ok(())
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
        die(info)
    }
}

#[cfg(all(target_os = "none", not(test)))]
pub use target::die;

/// Reports an unrecoverable kernel failure.
#[cfg(not(all(target_os = "none", not(test))))]
pub fn die(msg: impl core::fmt::Display) -> ! {
    panic!("kernel died: {msg}")
}
