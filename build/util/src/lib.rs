// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use serde::de::DeserializeOwned;
use std::env;

/// Exposes the CPU's architecture profile. This isn't available in rustc's
/// standard environment.
///
/// Sets `cfg(armv7a)` when `TARGET` names an `armv7a-*` triple. Any other
/// target leaves the cfg unset rather than aborting the build, so that
/// `cargo test` against the host triple falls through to the `arch::sim`
/// backend (see DESIGN.md).
pub fn expose_arch_profile() {
    let target = env::var("TARGET").unwrap();

    if target.starts_with("armv7a-") {
        println!("cargo:rustc-cfg=armv7a");
    }
    println!("cargo:rerun-if-env-changed=TARGET");
}

/// Exposes the board type from the `KERN_BOARD` envvar into
/// `cfg(target_board="...")`.
pub fn expose_target_board() {
    if let Ok(board) = env::var("KERN_BOARD") {
        println!("cargo:rustc-cfg=target_board=\"{}\"", board);
    }
    println!("cargo:rerun-if-env-changed=KERN_BOARD");
}

///
/// Pulls the app-wide configuration for purposes of a build task.  This
/// will fail if the app-wide configuration doesn't exist or can't parse.
/// Note that -- thanks to the magic of Serde -- `T` need not (and indeed,
/// should not) contain the entire app-wide configuration, but rather only
/// those parts that a particular build task cares about.  (It should go
/// without saying that `deny_unknown_fields` should *not* be set on this
/// type -- but it may well be set within the task-specific types that
/// this type contains.)  If the configuration field is optional, `T` should
/// reflect that by having its member (or members) be an `Option` type.
///
pub fn config<T: DeserializeOwned>() -> Result<T> {
    toml_from_env("KERN_APP_CONFIG")
}

/// Pulls the task configuration. See `config` for more details.
pub fn task_config<T: DeserializeOwned>() -> Result<T> {
    toml_from_env("KERN_TASK_CONFIG")
}

fn toml_from_env<T: DeserializeOwned>(var: &str) -> Result<T> {
    let config = env::var(var)?;
    println!("--- toml for ${} ---", var);
    println!("{}", config);
    let rval = toml::from_str(&config)?;
    println!("cargo:rerun-if-env-changed={}", var);
    Ok(rval)
}
