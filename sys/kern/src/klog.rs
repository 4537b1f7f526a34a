// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel diagnostic output.
//!
//! `klog!` takes `format!`-style arguments. Where the text goes depends on the
//! build:
//!
//! - with the `klog-semihosting` feature on an ARM target, to the debugger's
//!   stdout over semihosting;
//! - in the kernel's own unit tests, to stderr;
//! - otherwise nowhere, although the arguments are still type-checked.
//!
//! Semihosting halts the core until a debugger services the request, so leave
//! the feature off unless a probe is attached.

#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::klog::write(format_args!($($arg)*))
    };
}

/// Sends one formatted line to the configured sink. Use `klog!` instead.
#[doc(hidden)]
pub fn write(args: core::fmt::Arguments<'_>) {
    cfg_if::cfg_if! {
        if #[cfg(test)] {
            std::eprintln!("kern: {args}");
        } else if #[cfg(all(feature = "klog-semihosting", target_arch = "arm"))] {
            use core::fmt::Write;

            if let Ok(mut out) = cortex_m_semihosting::hio::hstdout() {
                writeln!(out, "kern: {args}").ok();
            }
        } else {
            let _ = args;
        }
    }
}
