//! Boot detection from the BMC's UART readout.

use anyhow::{bail, Result};
use std::time::{Duration, Instant};

use crate::config::NodeId;
use crate::context::ExecContext;
use crate::error;
use crate::ssh::Bmc;

/// Init has started.
pub const INIT_MARKER: &str = "systemd[1]:";
/// Any of these means the network came up.
pub const NETWORK_MARKERS: &[&str] = &["Reached target Network", "Link is Up"];
/// The console login prompt.
pub const LOGIN_MARKER: &str = "login:";

/// Markers seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootProgress {
    pub init: bool,
    pub network: bool,
    pub login: bool,
}

impl BootProgress {
    /// Record markers found in `text`; returns the ones seen for the
    /// first time.
    pub fn observe(&mut self, text: &str) -> Vec<&'static str> {
        let mut fresh = Vec::new();
        if !self.init && text.contains(INIT_MARKER) {
            self.init = true;
            fresh.push("init started");
        }
        if !self.network && NETWORK_MARKERS.iter().any(|m| text.contains(m)) {
            self.network = true;
            fresh.push("network up");
        }
        if !self.login && text.contains(LOGIN_MARKER) {
            self.login = true;
            fresh.push("login prompt");
        }
        fresh
    }
}

/// Polling parameters for [`wait_for_boot`].
#[derive(Debug, Clone)]
pub struct UartWatch {
    pub interval: Duration,
    pub window: Duration,
    /// More consecutive failed reads than this is fatal.
    pub max_failures: u32,
}

impl Default for UartWatch {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            window: Duration::from_secs(180),
            max_failures: 5,
        }
    }
}

/// Poll the UART of `node` until the login prompt shows or the window
/// closes. Returns what was seen; a closed window without a login prompt
/// is logged, not fatal.
pub fn wait_for_boot(
    ctx: &ExecContext,
    bmc: &Bmc,
    node: NodeId,
    watch: &UartWatch,
) -> Result<BootProgress> {
    let deadline = Instant::now() + watch.window;
    let mut progress = BootProgress::default();
    let mut failures = 0u32;
    tracing::info!(node = %node, "watching UART for boot");

    loop {
        ctx.check()?;
        match bmc.uart_read(ctx, node) {
            Ok(text) => {
                failures = 0;
                for marker in progress.observe(&text) {
                    tracing::info!(node = %node, marker, "boot progress");
                }
                if progress.login {
                    return Ok(progress);
                }
            }
            Err(e) if error::is_cancelled(&e) => return Err(e),
            Err(e) => {
                failures += 1;
                tracing::warn!(node = %node, failures, "UART read failed: {e:#}");
                if failures > watch.max_failures {
                    bail!("UART of node {node} failed {failures} times in a row: {e:#}");
                }
            }
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(node = %node, ?progress, "no login prompt on UART within {:?}", watch.window);
            return Ok(progress);
        }
        ctx.sleep(watch.interval.min(deadline - now))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{self, FakeShell};
    use std::sync::Arc;

    fn fast() -> UartWatch {
        UartWatch {
            interval: Duration::from_millis(1),
            window: Duration::from_secs(5),
            max_failures: 5,
        }
    }

    fn node() -> NodeId {
        NodeId::new(2).unwrap()
    }

    #[test]
    fn markers_are_reported_once() {
        let mut p = BootProgress::default();
        assert_eq!(p.observe("[    3.1] systemd[1]: Started Journal"), vec!["init started"]);
        assert!(p.observe("systemd[1]: again").is_empty());
        assert_eq!(
            p.observe("eth0: Link is Up - 1Gbps\nubuntu login: "),
            vec!["network up", "login prompt"]
        );
        assert!(p.init && p.network && p.login);
    }

    #[test]
    fn stops_at_login() {
        let shell = Arc::new(FakeShell::new());
        shell
            .on("tpi uart", fake::ok("U-Boot 2023.10\n"))
            .on("tpi uart", fake::ok("systemd[1]: Reached target Network.\n"))
            .on("tpi uart", fake::ok("rk1-node2 login: "));
        let bmc = Bmc::new(shell.clone());
        let progress = wait_for_boot(&ExecContext::background(), &bmc, node(), &fast()).unwrap();
        assert!(progress.login && progress.network && progress.init);
        assert_eq!(shell.log().len(), 3);
        assert!(shell.log().iter().all(|c| c == "tpi uart --node 2 get"));
    }

    #[test]
    fn too_many_read_failures() {
        let shell = Arc::new(FakeShell::new());
        shell.on("tpi uart", fake::status(1, "uart busy"));
        let bmc = Bmc::new(shell.clone());
        let err = wait_for_boot(&ExecContext::background(), &bmc, node(), &fast()).unwrap_err();
        assert!(err.to_string().contains("6 times"));
        assert_eq!(shell.log().len(), 6);
    }

    #[test]
    fn failures_reset_after_good_read() {
        let shell = Arc::new(FakeShell::new());
        for _ in 0..4 {
            shell.on("tpi uart", fake::status(1, "busy"));
        }
        shell.on("tpi uart", fake::ok("noise"));
        for _ in 0..4 {
            shell.on("tpi uart", fake::status(1, "busy"));
        }
        shell.on("tpi uart", fake::ok("login: "));
        let bmc = Bmc::new(shell);
        let progress = wait_for_boot(&ExecContext::background(), &bmc, node(), &fast()).unwrap();
        assert!(progress.login);
    }

    #[test]
    fn window_closes_without_login() {
        let shell = Arc::new(FakeShell::new());
        shell.on("tpi uart", fake::ok("systemd[1]: Starting"));
        let bmc = Bmc::new(shell);
        let watch = UartWatch {
            interval: Duration::from_millis(5),
            window: Duration::from_millis(30),
            max_failures: 5,
        };
        let progress = wait_for_boot(&ExecContext::background(), &bmc, node(), &watch).unwrap();
        assert!(progress.init);
        assert!(!progress.login);
    }

    #[test]
    fn cancellation_stops_polling() {
        let shell = Arc::new(FakeShell::new());
        shell.on("tpi uart", fake::ok(""));
        let bmc = Bmc::new(shell);
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(20));
        let err = wait_for_boot(&ctx, &bmc, node(), &fast()).unwrap_err();
        assert!(error::is_cancelled(&err));
    }
}
