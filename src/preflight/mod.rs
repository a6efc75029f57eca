//! Host tool checks run before an image backend is used.
//!
//! ```rust,ignore
//! use tftpi::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("kpartx") {
//!     println!("multipath-tools not installed");
//! }
//! check_required_tools(&[("xz", "xz-utils")])?;
//! ```

use anyhow::{bail, Result};
use std::path::PathBuf;

/// Whether `cmd` resolves on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the native backend shells out to, as (command, package).
pub const NATIVE_TOOLS: &[(&str, &str)] = &[
    ("xz", "xz-utils"),
    ("kpartx", "kpartx"),
    ("losetup", "util-linux"),
    ("mount", "mount"),
    ("umount", "mount"),
];

/// Container runtimes in order of preference.
pub const CONTAINER_RUNTIMES: &[&str] = &["docker", "podman"];

/// Fail with every missing tool and the package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

pub fn check_native_tools() -> Result<()> {
    check_required_tools(NATIVE_TOOLS)
}

/// First container runtime found on `PATH`.
pub fn find_container_runtime() -> Result<PathBuf> {
    for name in CONTAINER_RUNTIMES {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    bail!(
        "Missing container runtime: install one of {}",
        CONTAINER_RUNTIMES.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_common_commands() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn reports_all_missing_tools() {
        let err = check_required_tools(&[
            ("sh", "dash"),
            ("nonexistent_tool_a", "pkg-a"),
            ("nonexistent_tool_b", "pkg-b"),
        ])
        .unwrap_err()
        .to_string();
        assert!(err.contains("nonexistent_tool_a (install: pkg-a)"));
        assert!(err.contains("nonexistent_tool_b (install: pkg-b)"));
        assert!(!err.contains("dash"));
    }
}
