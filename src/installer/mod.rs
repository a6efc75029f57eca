//! Flashing a prepared image onto a node through the BMC.
//!
//! The image is staged under `/root/imgs/<node>/` on the BMC (copied from
//! the BMC cache when it came from there, uploaded otherwise) and
//! decompressed, then flashed with the vendor tool. The node is power
//! cycled, its UART is watched until the login prompt appears, and the
//! mandatory first-boot password change is driven over SSH.

pub mod uart;

pub use uart::{BootProgress, UartWatch};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use crate::builder::ImageResult;
use crate::config::{BoardType, NodeId};
use crate::context::ExecContext;
use crate::error::Error;
use crate::process::shell_quote;
use crate::ssh::{Bmc, ExpectStep, RemoteShell, SshTarget, Transcript};
use crate::state::StateStore;

/// Directory on the BMC holding per-node images.
pub const REMOTE_IMAGE_ROOT: &str = "/root/imgs";

/// Required in the transcript of a successful password change.
pub const PASSWORD_UPDATED: &str = "passwd: password updated successfully";

/// Opens a shell on a freshly installed node.
pub type NodeConnector<'a> = dyn Fn(SshTarget) -> Result<Arc<dyn RemoteShell>> + 'a;

/// Delays of one installation.
#[derive(Debug, Clone)]
pub struct InstallTiming {
    /// Between power-off and power-on.
    pub power_cycle_pause: Duration,
    pub uart: UartWatch,
    /// After the login prompt, before the first SSH connection.
    pub ssh_settle: Duration,
    pub dialog_timeout: Duration,
}

impl Default for InstallTiming {
    fn default() -> Self {
        Self {
            power_cycle_pause: Duration::from_secs(2),
            uart: UartWatch::default(),
            ssh_settle: Duration::from_secs(10),
            dialog_timeout: Duration::from_secs(60),
        }
    }
}

/// Node and credentials for one installation.
#[derive(Clone)]
pub struct InstallRequest {
    pub node: NodeId,
    pub node_ip: Ipv4Addr,
    pub user: String,
    pub old_password: String,
    pub new_password: String,
}

impl std::fmt::Debug for InstallRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallRequest")
            .field("node", &self.node)
            .field("node_ip", &self.node_ip)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// What an installation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Uncompressed image path on the BMC.
    pub remote_image: String,
    pub boot: BootProgress,
    pub transcript: Transcript,
}

/// `/root/imgs/<node>/<filename>` and the same path without `.xz`.
pub fn remote_image_paths(node: NodeId, filename: &str) -> (String, String) {
    let compressed = format!("{REMOTE_IMAGE_ROOT}/{node}/{filename}");
    let raw = compressed
        .strip_suffix(".xz")
        .unwrap_or(&compressed)
        .to_string();
    (compressed, raw)
}

/// Flashes images and completes first boot.
pub struct OsInstaller<'a> {
    bmc: &'a Bmc,
    state: &'a StateStore,
    connect: &'a NodeConnector<'a>,
    timing: InstallTiming,
}

impl<'a> OsInstaller<'a> {
    pub fn new(bmc: &'a Bmc, state: &'a StateStore, connect: &'a NodeConnector<'a>) -> Self {
        Self {
            bmc,
            state,
            connect,
            timing: InstallTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: InstallTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn install(
        &self,
        ctx: &ExecContext,
        image: &ImageResult,
        req: &InstallRequest,
    ) -> Result<InstallReport> {
        match &image.board {
            BoardType::Rk1 => {}
            other => {
                return Err(Error::Validation(format!(
                    "no flashing strategy for board '{other}'"
                ))
                .into())
            }
        }
        let node = req.node;
        if node.is_prepare_only() {
            return Err(Error::Validation("cannot install to the prepare-only node".into()).into());
        }

        let remote_image = self.stage_image(ctx, image, node)?;

        ctx.check()?;
        tracing::info!(node = %node, image = %remote_image, "flashing");
        self.bmc.flash(ctx, node, &remote_image)?;
        self.progress(
            node,
            json!({
                "lastImageHash": image.content_hash.as_deref().unwrap_or(&image.input_hash),
                "boardType": image.board.as_str(),
                "passwordChanged": false,
            }),
        )?;

        tracing::info!(node = %node, "power cycling");
        self.bmc.power_off(ctx, node)?;
        ctx.sleep(self.timing.power_cycle_pause)?;
        self.bmc.power_on(ctx, node)?;

        let boot = uart::wait_for_boot(ctx, self.bmc, node, &self.timing.uart)?;
        ctx.sleep(self.timing.ssh_settle)?;

        let transcript = self.change_password(ctx, req)?;
        self.progress(
            node,
            json!({
                "passwordChanged": true,
                "lastInstallTime": now(),
            }),
        )?;
        tracing::info!(node = %node, "installation finished");
        Ok(InstallReport {
            remote_image,
            boot,
            transcript,
        })
    }

    /// Put the uncompressed image on the BMC unless the same build is
    /// already there. `<raw>.build` names the build a staged image came from.
    fn stage_image(&self, ctx: &ExecContext, image: &ImageResult, node: NodeId) -> Result<String> {
        let shell = self.bmc.shell();
        let (compressed, raw) = remote_image_paths(node, &image.filename);
        let stamp = format!("{raw}.build");
        let build = image.content_hash.as_deref().unwrap_or(&image.input_hash);
        if shell.exists(ctx, &raw)? {
            let staged = shell.run_raw(ctx, &format!("cat {}", shell_quote(&stamp)))?;
            if staged.success() && staged.stdout.trim() == build {
                tracing::info!(node = %node, image = %raw, "image already on BMC");
                return Ok(raw);
            }
            tracing::info!(node = %node, image = %raw, "staged image is from another build, replacing");
        }
        shell.run(ctx, &format!("rm -f {}", shell_quote(&stamp)))?;
        if image.is_remote_cache {
            tracing::info!(node = %node, key = %image.cache_key, "copying image from BMC cache");
            let dir = format!("{REMOTE_IMAGE_ROOT}/{node}");
            shell.run(
                ctx,
                &format!(
                    "mkdir -p {} && cp {} {}",
                    shell_quote(&dir),
                    shell_quote(&image.image_path),
                    shell_quote(&compressed)
                ),
            )?;
        } else {
            tracing::info!(node = %node, size = image.size, "uploading image to BMC");
            shell.upload(ctx, Path::new(&image.image_path), &compressed)?;
        }
        shell
            .run(ctx, &format!("unxz -f {}", shell_quote(&compressed)))
            .context("decompressing image on BMC")?;
        shell.run(
            ctx,
            &format!("printf '%s\\n' {} > {}", shell_quote(build), shell_quote(&stamp)),
        )?;
        Ok(raw)
    }

    /// First-boot password change; a failure tries a login with the new
    /// password to enrich the error, then fails.
    fn change_password(&self, ctx: &ExecContext, req: &InstallRequest) -> Result<Transcript> {
        let steps = [
            ExpectStep::new("Current password:", req.old_password.as_str()),
            ExpectStep::new("New password:", req.new_password.as_str()),
            ExpectStep::new("Retype new password:", req.new_password.as_str()),
        ];
        let shell = (self.connect)(SshTarget::node(req.node_ip, &req.user, &req.old_password))?;
        let dialog = shell.expect(ctx, &steps, self.timing.dialog_timeout);
        let _ = shell.close();
        let cause = match dialog {
            Ok(t) if t.text.contains(PASSWORD_UPDATED) => {
                tracing::info!(node = %req.node, "first-boot password changed");
                return Ok(t);
            }
            Ok(t) => anyhow!("password change not confirmed; transcript: {:?}", t.text.trim()),
            Err(e) => e,
        };

        let retry_login = (self.connect)(SshTarget::node(req.node_ip, &req.user, &req.new_password))
            .and_then(|s| {
                let out = s.run(ctx, "true");
                let _ = s.close();
                out
            });
        let detail = match retry_login {
            Ok(_) => "the node accepts the new password",
            Err(_) => "the node does not accept the new password",
        };
        Err(cause).with_context(|| {
            format!("first-boot password change on node {} failed ({detail})", req.node)
        })
    }

    fn progress(&self, node: NodeId, props: Value) -> Result<()> {
        let props: Map<String, Value> = match props {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.update_node_properties(node, &props)
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use crate::ssh::fake::{self, FakeShell};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        bmc_shell: Arc<FakeShell>,
        bmc: Bmc,
        state: StateStore,
        node_shells: Mutex<Vec<(String, Arc<FakeShell>)>>,
        dialog: Result<&'static str, &'static str>,
    }

    impl Fixture {
        fn new(dialog: Result<&'static str, &'static str>) -> Self {
            let tmp = TempDir::new().unwrap();
            let bmc_shell = Arc::new(FakeShell::new());
            bmc_shell.on("tpi uart", fake::ok("systemd[1]: Reached target Network\nlogin: "));
            let bmc = Bmc::new(bmc_shell.clone());
            let state = StateStore::open(tmp.path()).unwrap();
            Self {
                tmp,
                bmc_shell,
                bmc,
                state,
                node_shells: Mutex::new(Vec::new()),
                dialog,
            }
        }

        fn connect(&self, target: SshTarget) -> Result<Arc<dyn RemoteShell>> {
            let shell = Arc::new(FakeShell::new());
            shell.dialog(self.dialog);
            self.node_shells
                .lock()
                .unwrap()
                .push((target.password.clone(), shell.clone()));
            Ok(shell)
        }

        fn image(&self, remote: bool) -> ImageResult {
            let path = if remote {
                "/root/tftpi-cache/ubuntu-2204-rk1-base-net.data".to_string()
            } else {
                let p = self.tmp.path().join("ubuntu-rk1-node1.img.xz");
                fs::write(&p, b"xz bytes").unwrap();
                p.display().to_string()
            };
            ImageResult {
                image_path: path,
                filename: "ubuntu-rk1-node1.img.xz".into(),
                cache_key: "ubuntu-2204-rk1-base-net".into(),
                input_hash: "abc".into(),
                board: BoardType::Rk1,
                is_remote_cache: remote,
                size: 8,
                content_hash: Some("def".into()),
            }
        }

        fn install(&self, image: &ImageResult) -> Result<InstallReport> {
            let connect = |t: SshTarget| self.connect(t);
            let installer = OsInstaller::new(&self.bmc, &self.state, &connect).with_timing(InstallTiming {
                power_cycle_pause: Duration::ZERO,
                uart: UartWatch {
                    interval: Duration::from_millis(1),
                    window: Duration::from_secs(2),
                    max_failures: 5,
                },
                ssh_settle: Duration::ZERO,
                dialog_timeout: Duration::from_secs(1),
            });
            installer.install(&ExecContext::background(), image, &request())
        }
    }

    fn request() -> InstallRequest {
        InstallRequest {
            node: NodeId::new(1).unwrap(),
            node_ip: "192.168.1.101".parse().unwrap(),
            user: "ubuntu".into(),
            old_password: "ubuntu".into(),
            new_password: "s3cret".into(),
        }
    }

    #[test]
    fn remote_paths() {
        let (xz, raw) = remote_image_paths(NodeId::new(3).unwrap(), "a.img.xz");
        assert_eq!(xz, "/root/imgs/3/a.img.xz");
        assert_eq!(raw, "/root/imgs/3/a.img");
    }

    #[test]
    fn uploads_flashes_and_changes_password() {
        let fx = Fixture::new(Ok("Current password: \r\nNew password: \r\nRetype new password: \r\npasswd: password updated successfully\r\n"));
        let report = fx.install(&fx.image(false)).unwrap();
        assert_eq!(report.remote_image, "/root/imgs/1/ubuntu-rk1-node1.img");
        assert!(report.boot.login);

        let log = fx.bmc_shell.log();
        let pos = |prefix: &str| log.iter().position(|l| l.starts_with(prefix)).unwrap();
        assert!(pos("upload ") < pos("unxz -f /root/imgs/1/ubuntu-rk1-node1.img.xz"));
        assert!(pos("unxz") < pos("tpi flash --local --image-path /root/imgs/1/ubuntu-rk1-node1.img --node 1"));
        assert!(pos("tpi flash") < pos("tpi power off --node 1"));
        assert!(pos("tpi power off") < pos("tpi power on --node 1"));
        assert!(pos("tpi power on") < pos("tpi uart"));

        let shells = fx.node_shells.lock().unwrap();
        assert_eq!(shells.len(), 1);
        let steps = &shells[0].1.expects()[0];
        assert_eq!(steps[0], ExpectStep::new("Current password:", "ubuntu"));
        assert_eq!(steps[2], ExpectStep::new("Retype new password:", "s3cret"));
        assert!(shells[0].1.is_closed());

        let st = fx.state.get_node_state(NodeId::new(1).unwrap()).unwrap();
        assert!(st.password_changed);
        assert_eq!(st.last_image_hash.as_deref(), Some("def"));
        assert_eq!(st.board_type, Some(BoardType::Rk1));
        assert!(st.last_install_time.is_some());
    }

    #[test]
    fn cached_image_is_copied_on_bmc() {
        let fx = Fixture::new(Ok(PASSWORD_UPDATED));
        fx.install(&fx.image(true)).unwrap();
        assert!(fx.bmc_shell.ran(
            "mkdir -p /root/imgs/1 && cp /root/tftpi-cache/ubuntu-2204-rk1-base-net.data /root/imgs/1/ubuntu-rk1-node1.img.xz"
        ));
        assert!(!fx.bmc_shell.ran("upload "));
    }

    #[test]
    fn staged_image_is_reused() {
        let fx = Fixture::new(Ok(PASSWORD_UPDATED));
        fx.bmc_shell.put_file("/root/imgs/1/ubuntu-rk1-node1.img", b"raw");
        fx.bmc_shell.put_file("/root/imgs/1/ubuntu-rk1-node1.img.build", b"def\n");
        fx.install(&fx.image(false)).unwrap();
        assert!(!fx.bmc_shell.ran("upload "));
        assert!(!fx.bmc_shell.ran("unxz"));
        assert!(fx.bmc_shell.ran("tpi flash"));
    }

    #[test]
    fn staged_image_from_other_build_is_replaced() {
        let fx = Fixture::new(Ok(PASSWORD_UPDATED));
        fx.bmc_shell.put_file("/root/imgs/1/ubuntu-rk1-node1.img", b"raw");
        fx.bmc_shell.put_file("/root/imgs/1/ubuntu-rk1-node1.img.build", b"older\n");
        fx.install(&fx.image(false)).unwrap();

        let log = fx.bmc_shell.log();
        let pos = |prefix: &str| log.iter().position(|l| l.starts_with(prefix)).unwrap();
        assert!(pos("rm -f /root/imgs/1/ubuntu-rk1-node1.img.build") < pos("upload "));
        assert!(pos("upload ") < pos("unxz -f"));
        assert!(pos("unxz -f") < pos("printf '%s\\n' def > /root/imgs/1/ubuntu-rk1-node1.img.build"));
        assert!(pos("printf") < pos("tpi flash"));
    }

    #[test]
    fn staged_image_without_marker_is_replaced() {
        let fx = Fixture::new(Ok(PASSWORD_UPDATED));
        fx.bmc_shell.put_file("/root/imgs/1/ubuntu-rk1-node1.img", b"raw");
        fx.install(&fx.image(false)).unwrap();
        assert!(fx.bmc_shell.ran("upload "));
        assert!(fx.bmc_shell.ran("unxz -f /root/imgs/1/ubuntu-rk1-node1.img.xz"));
    }

    #[test]
    fn wedged_bmc_aborts_before_power_cycle() {
        let fx = Fixture::new(Ok(PASSWORD_UPDATED));
        fx.bmc_shell.on(
            "tpi flash",
            fake::status(1, "error sending request for url (http://127.0.0.1/api/bmc): Connection refused"),
        );
        let err = fx.install(&fx.image(false)).unwrap_err();
        assert!(matches!(error::kind(&err), Some(Error::BmcWedged { .. })));
        assert!(!fx.bmc_shell.ran("tpi power"));
    }

    #[test]
    fn unsupported_board_is_terminal() {
        let fx = Fixture::new(Ok(PASSWORD_UPDATED));
        let mut image = fx.image(false);
        image.board = BoardType::Cm4;
        let err = fx.install(&image).unwrap_err();
        assert!(matches!(error::kind(&err), Some(Error::Validation(_))));
        assert!(fx.bmc_shell.log().is_empty());
    }

    #[test]
    fn unconfirmed_password_change_tries_new_password() {
        let fx = Fixture::new(Ok("passwd: Authentication token manipulation error\r\n"));
        let err = fx.install(&fx.image(false)).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("password change on node 1 failed"));
        assert!(msg.contains("not confirmed"));

        let shells = fx.node_shells.lock().unwrap();
        assert_eq!(shells.len(), 2);
        assert_eq!(shells[1].0, "s3cret");
        assert!(shells[1].1.ran("true"));
        let st = fx.state.get_node_state(NodeId::new(1).unwrap()).unwrap();
        assert!(!st.password_changed);
    }
}
