//! Running a configuration action against an installed node.
//!
//! An action receives two handles: [`LocalRuntime`] for files and commands
//! on this host, and [`RemoteRuntime`] for commands and transfers on the
//! node. The node shell is opened with the credentials set during
//! installation and closed when the action returns.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::config::{NodeId, PostInstallSettings};
use crate::context::ExecContext;
use crate::installer::NodeConnector;
use crate::process::{shell_quote, Cmd, CmdOutput};
use crate::ssh::{RemoteOutput, RemoteShell, SshTarget};
use crate::state::StateStore;

/// Host-side handle. Relative paths resolve against `base_dir`.
#[derive(Debug, Clone)]
pub struct LocalRuntime {
    base_dir: PathBuf,
}

impl LocalRuntime {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let path = self.resolve(path);
        fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))
    }

    /// `sh -c script` in `base_dir`; non-zero exit is an error.
    pub fn run(&self, ctx: &ExecContext, script: &str) -> Result<CmdOutput> {
        let script = format!("cd {} && {script}", shell_quote(&self.base_dir.to_string_lossy()));
        Cmd::new("sh").args(["-c", &script]).run_ctx(ctx)
    }
}

/// Node-side handle.
pub struct RemoteRuntime<'a> {
    shell: &'a dyn RemoteShell,
    user: String,
}

impl<'a> RemoteRuntime<'a> {
    pub fn new(shell: &'a dyn RemoteShell, user: &str) -> Self {
        Self {
            shell,
            user: user.to_string(),
        }
    }

    /// Home directory of the login user.
    pub fn home(&self) -> String {
        match self.user.as_str() {
            "root" => "/root".to_string(),
            user => format!("/home/{user}"),
        }
    }

    pub fn run(&self, ctx: &ExecContext, command: &str) -> Result<RemoteOutput> {
        self.shell.run(ctx, command)
    }

    pub fn upload(&self, ctx: &ExecContext, local: &Path, remote: &str) -> Result<()> {
        self.shell.upload(ctx, local, remote)
    }

    pub fn download(&self, ctx: &ExecContext, remote: &str, local: &Path) -> Result<()> {
        self.shell.download(ctx, remote, local)
    }

    pub fn exists(&self, ctx: &ExecContext, remote: &str) -> Result<bool> {
        self.shell.exists(ctx, remote)
    }
}

/// User-supplied configuration step.
pub trait PostInstallAction {
    /// Stable identity; changes when the action would do something
    /// different.
    fn identity(&self) -> String;

    fn run(&self, ctx: &ExecContext, local: &LocalRuntime, remote: &RemoteRuntime<'_>) -> Result<()>;
}

/// An action from a closure.
pub struct FnAction<F> {
    id: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&ExecContext, &LocalRuntime, &RemoteRuntime<'_>) -> Result<()>,
{
    pub fn new(id: impl Into<String>, f: F) -> Self {
        Self { id: id.into(), f }
    }
}

impl<F> PostInstallAction for FnAction<F>
where
    F: Fn(&ExecContext, &LocalRuntime, &RemoteRuntime<'_>) -> Result<()>,
{
    fn identity(&self) -> String {
        self.id.clone()
    }

    fn run(&self, ctx: &ExecContext, local: &LocalRuntime, remote: &RemoteRuntime<'_>) -> Result<()> {
        (self.f)(ctx, local, remote)
    }
}

/// The `[post_install]` section: optionally upload a report file to the
/// home directory, then run each command in order.
#[derive(Debug, Clone)]
pub struct CommandAction {
    settings: PostInstallSettings,
}

impl CommandAction {
    pub fn new(settings: PostInstallSettings) -> Self {
        Self { settings }
    }
}

impl PostInstallAction for CommandAction {
    fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        if let Some(report) = &self.settings.report_file {
            hasher.update(b"report\0");
            hasher.update(report.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        }
        for command in &self.settings.commands {
            hasher.update(b"cmd\0");
            hasher.update(command.as_bytes());
            hasher.update(b"\0");
        }
        format!("{:x}", hasher.finalize())
    }

    fn run(&self, ctx: &ExecContext, local: &LocalRuntime, remote: &RemoteRuntime<'_>) -> Result<()> {
        if let Some(report) = &self.settings.report_file {
            let path = local.resolve(report);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .with_context(|| format!("report file '{}' has no file name", path.display()))?;
            let dest = format!("{}/{name}", remote.home());
            remote.upload(ctx, &path, &dest)?;
            tracing::info!(file = %dest, "uploaded report");
        }
        for command in &self.settings.commands {
            ctx.check()?;
            let out = remote
                .run(ctx, command)
                .with_context(|| format!("post-install command '{command}'"))?;
            tracing::info!(command = %command, "done");
            for line in out.stdout.lines() {
                tracing::debug!("| {line}");
            }
        }
        Ok(())
    }
}

/// Where and as whom to connect.
#[derive(Clone)]
pub struct NodeLogin {
    pub node: NodeId,
    pub ip: Ipv4Addr,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for NodeLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLogin")
            .field("node", &self.node)
            .field("ip", &self.ip)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

pub struct PostInstaller<'a> {
    state: &'a StateStore,
    connect: &'a NodeConnector<'a>,
    local: LocalRuntime,
}

impl<'a> PostInstaller<'a> {
    pub fn new(state: &'a StateStore, connect: &'a NodeConnector<'a>, local: LocalRuntime) -> Self {
        Self {
            state,
            connect,
            local,
        }
    }

    /// Run `action` against the node. `lastConfigureTime` is recorded on
    /// success only.
    pub fn run(&self, ctx: &ExecContext, login: &NodeLogin, action: &dyn PostInstallAction) -> Result<()> {
        ctx.check()?;
        tracing::info!(node = %login.node, host = %login.ip, user = %login.user, "connecting for post-install");
        let shell = (self.connect)(SshTarget::node(login.ip, &login.user, &login.password))
            .with_context(|| format!("connecting to node {}", login.node))?;
        let remote = RemoteRuntime::new(shell.as_ref(), &login.user);
        let result = action.run(ctx, &self.local, &remote);
        if let Err(e) = shell.close() {
            tracing::warn!(node = %login.node, "closing node shell: {e:#}");
        }
        result.with_context(|| format!("post-install on node {}", login.node))?;

        let props: Map<String, Value> = match json!({
            "lastConfigureTime": OffsetDateTime::now_utc().unix_timestamp(),
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state.update_node_properties(login.node, &props)?;
        tracing::info!(node = %login.node, "post-install finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fake::{self, FakeShell};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        state: StateStore,
        shell: Arc<FakeShell>,
        targets: Mutex<Vec<SshTarget>>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let state = StateStore::open(&tmp.path().join("cache")).unwrap();
            Self {
                tmp,
                state,
                shell: Arc::new(FakeShell::new()),
                targets: Mutex::new(Vec::new()),
            }
        }

        fn run(&self, action: &dyn PostInstallAction) -> Result<()> {
            let connect = |t: SshTarget| -> Result<Arc<dyn RemoteShell>> {
                self.targets.lock().unwrap().push(t);
                Ok(self.shell.clone())
            };
            let installer = PostInstaller::new(&self.state, &connect, LocalRuntime::new(self.tmp.path()));
            installer.run(&ExecContext::background(), &login(), action)
        }
    }

    fn login() -> NodeLogin {
        NodeLogin {
            node: NodeId::new(1).unwrap(),
            ip: "192.168.1.101".parse().unwrap(),
            user: "ubuntu".into(),
            password: "s3cret".into(),
        }
    }

    #[test]
    fn action_uses_both_runtimes() {
        let fx = Fixture::new();
        fs::write(fx.tmp.path().join("install_report.txt"), b"node1 ok\n").unwrap();
        fx.shell.on("uname -a", fake::ok("Linux rk1-node1 6.1.0 aarch64 GNU/Linux\n"));
        let seen = Mutex::new(String::new());
        let action = FnAction::new("report", |ctx: &ExecContext, local: &LocalRuntime, remote: &RemoteRuntime<'_>| {
            let report = local.read_file(Path::new("install_report.txt"))?;
            assert_eq!(report, b"node1 ok\n");
            remote.upload(ctx, &local.resolve(Path::new("install_report.txt")), "/home/ubuntu/install_report.txt")?;
            *seen.lock().unwrap() = remote.run(ctx, "uname -a")?.stdout;
            Ok(())
        });
        fx.run(&action).unwrap();

        assert!(seen.lock().unwrap().contains("Linux"));
        assert_eq!(fx.shell.file("/home/ubuntu/install_report.txt").unwrap(), b"node1 ok\n");
        assert!(fx.shell.is_closed());
        let target = &fx.targets.lock().unwrap()[0];
        assert_eq!(target.user, "ubuntu");
        assert_eq!(target.password, "s3cret");
        let st = fx.state.get_node_state(NodeId::new(1).unwrap()).unwrap();
        assert!(st.last_configure_time.is_some());
    }

    #[test]
    fn failed_action_records_nothing_and_closes() {
        let fx = Fixture::new();
        fx.shell.on("false", fake::status(1, "nope"));
        let action = FnAction::new("fail", |ctx: &ExecContext, _: &LocalRuntime, remote: &RemoteRuntime<'_>| {
            remote.run(ctx, "false").map(|_| ())
        });
        let err = fx.run(&action).unwrap_err();
        assert!(format!("{err:#}").contains("post-install on node 1"));
        assert!(fx.shell.is_closed());
        assert!(fx.state.get_node_state(NodeId::new(1).unwrap()).is_none());
    }

    #[test]
    fn command_action_uploads_report_then_runs_commands() {
        let fx = Fixture::new();
        fs::write(fx.tmp.path().join("report.txt"), b"hello").unwrap();
        let action = CommandAction::new(PostInstallSettings {
            commands: vec!["sudo apt-get update".into(), "hostname".into()],
            report_file: Some(PathBuf::from("report.txt")),
        });
        fx.run(&action).unwrap();
        assert_eq!(fx.shell.file("/home/ubuntu/report.txt").unwrap(), b"hello");
        let log = fx.shell.log();
        assert!(log[0].starts_with("upload "));
        assert_eq!(log[1], "sudo apt-get update");
        assert_eq!(log[2], "hostname");
    }

    #[test]
    fn command_action_stops_at_first_failure() {
        let fx = Fixture::new();
        fx.shell.on("exit 3", fake::status(3, "boom"));
        let action = CommandAction::new(PostInstallSettings {
            commands: vec!["exit 3".into(), "hostname".into()],
            report_file: None,
        });
        let err = fx.run(&action).unwrap_err();
        assert!(format!("{err:#}").contains("post-install command 'exit 3'"));
        assert!(!fx.shell.ran("hostname"));
    }

    #[test]
    fn command_identity_tracks_commands() {
        let a = CommandAction::new(PostInstallSettings {
            commands: vec!["a".into(), "b".into()],
            report_file: None,
        });
        let b = CommandAction::new(PostInstallSettings {
            commands: vec!["b".into(), "a".into()],
            report_file: None,
        });
        assert_eq!(a.identity(), a.clone().identity());
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn local_runtime_runs_in_base_dir() {
        let tmp = TempDir::new().unwrap();
        let local = LocalRuntime::new(tmp.path());
        local.write_file(Path::new("sub/x.txt"), b"x").unwrap();
        let out = local.run(&ExecContext::background(), "cat sub/x.txt").unwrap();
        assert_eq!(out.stdout, "x");
    }
}
