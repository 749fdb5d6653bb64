#![forbid(unsafe_code)]

//! Process-level safety checks shared by the tubefetch binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start when running as root, unless `TUBEFETCH_ALLOW_ROOT=1` is
/// set (containers that only ship a root user). Downloads land wherever the
/// download root points, so an unprivileged user keeps mistakes contained.
pub fn ensure_not_root(process: &str) -> Result<()> {
    let allow_root = std::env::var("TUBEFETCH_ALLOW_ROOT")
        .map(|value| value.trim() == "1")
        .unwrap_or(false);
    ensure_not_root_for(Uid::current(), allow_root, process)
}

fn ensure_not_root_for(uid: Uid, allow_root: bool, process: &str) -> Result<()> {
    if uid.is_root() && !allow_root {
        bail!(
            "{process} must not run as root; use a regular user or set TUBEFETCH_ALLOW_ROOT=1 in a container"
        );
    }
    Ok(())
}
