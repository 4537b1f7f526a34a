// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Tick period used when `KERN_TICK_PERIOD_MS` is not set.
const FALLBACK_TICK_PERIOD_MS: u32 = 10;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    expose_m_profile()?;
    generate_consts()?;

    Ok(())
}

/// Exposes `cfg(armv8m)` when building for an ARMv8-M target. Host builds
/// get no profile cfg and pick up the simulated hardware instead.
fn expose_m_profile() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rustc-check-cfg=cfg(armv8m)");

    let target = env::var("TARGET")?;
    if target.starts_with("thumbv8m") {
        println!("cargo:rustc-cfg=armv8m");
    } else if target.starts_with("thumb") {
        println!("cargo:warning=kern only supports ARMv8-M, not {target}");
    }
    Ok(())
}

fn generate_consts() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_TICK_PERIOD_MS");
    let tick_ms = match env::var("KERN_TICK_PERIOD_MS") {
        Ok(v) => v.parse::<u32>()?,
        Err(_) => FALLBACK_TICK_PERIOD_MS,
    };
    if tick_ms == 0 {
        return Err("KERN_TICK_PERIOD_MS must be nonzero".into());
    }

    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("no OUT_DIR")?);
    let mut const_file = File::create(out.join("consts.rs"))?;

    writeln!(const_file, "// See build.rs for details")?;
    writeln!(
        const_file,
        "pub const DEFAULT_TICK_PERIOD_MS: u32 = {tick_ms};"
    )?;
    Ok(())
}
