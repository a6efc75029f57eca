//! Tracing subscriber setup for the command-line front end.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::NodeId;

/// Log file directory under the cache directory.
pub const LOG_DIR: &str = "logs";

/// `RUST_LOG` when set, else `info`, or `debug` when verbose.
pub fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// `<cache_dir>/logs/<operation>-node<N>-<unix>.log`, or without the
/// node part when there is none.
pub fn log_file_path(cache_dir: &Path, operation: &str, node: Option<NodeId>) -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let name = match node {
        Some(node) => format!("{operation}-node{node}-{secs}.log"),
        None => format!("{operation}-{secs}.log"),
    };
    cache_dir.join(LOG_DIR).join(name)
}

/// Install the global subscriber: human output on stderr, plus a plain
/// copy in `log_file` when given.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory '{}'", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file '{}'", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .context("installing the log subscriber")
}
