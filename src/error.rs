//! Error kinds shared by every component.
//!
//! Component APIs return `anyhow::Result` so each layer can attach context,
//! but the root cause of an expected failure is always one of the variants
//! below. Use [`kind`] to branch on it after context has been added.

use std::time::Duration;

/// Typed failure classes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or out-of-range input, surfaced before any work is done.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Absent cache key or state record. Callers branch on this.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote IO failed in a way that is worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The BMC's local vendor API refused connections mid-flash.
    #[error(
        "BMC appears wedged ({detail}); power cycle the board and retry the installation"
    )]
    BmcWedged { detail: String },

    /// The phase is already marked running in the state file.
    #[error("{phase} is already running for node {node}; clear it with `status {node} --clear {phase}`")]
    AlreadyRunning { node: u8, phase: String },

    /// The execution context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The execution context deadline expired.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A command (host or remote) exited non-zero.
    #[error("command `{command}` failed with status {status}: {}", .stderr.trim())]
    CommandFailed {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },
}

/// Find the typed error kind anywhere in an error's context chain.
pub fn kind(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

/// True if the error is the cache/state not-found sentinel.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(kind(err), Some(Error::NotFound(_)))
}

/// True if the error is a cancellation or deadline expiry.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(kind(err), Some(Error::Cancelled) | Some(Error::Timeout(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context() {
        let err: anyhow::Result<()> = Err(Error::NotFound("abc".into()).into());
        let err = err.context("stat cache entry").unwrap_err();
        assert!(is_not_found(&err));
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn command_failure_includes_stderr() {
        let err = Error::CommandFailed {
            command: "ls /nope".into(),
            status: 2,
            stdout: String::new(),
            stderr: "ls: /nope: No such file\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 2"));
        assert!(msg.ends_with("No such file"));
    }
}
