//! Remote shell channel to the BMC and to installed nodes.
//!
//! [`SshEndpoint`] is a synchronous facade over a russh client driven by a
//! private tokio runtime. Every client, session and SFTP subclient it opens
//! is tracked and torn down by [`RemoteShell::close`]; operations after
//! `close` fail. Dial, session-open and transfer errors are retried with the
//! configured [`RetryPolicy`], once per public operation; the helpers under
//! it make a single attempt. Command execution itself is never retried.

pub mod bmc;
pub mod expect;
pub mod sftp;

pub use bmc::{Bmc, BmcInfo, PowerStatus};
pub use expect::{ExpectStep, Transcript};
pub use sftp::{SftpClient, SftpReader};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use std::fmt;
use std::fs;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::config::{BmcConfig, SshSettings};
use crate::context::ExecContext;
use crate::error::Error;
use crate::process::shell_quote;
use crate::retry::RetryPolicy;
use expect::{DialogIo, Recv};

/// Where and as whom to log in.
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn bmc(config: &BmcConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    pub fn node(ip: Ipv4Addr, user: &str, password: &str) -> Self {
        Self::new(ip.to_string(), user, password)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, or `-1` if the server sent none.
    pub status: i32,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Convert a non-zero exit into [`Error::CommandFailed`].
    pub fn check(self, command: &str) -> Result<Self, Error> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::CommandFailed {
            command: command.to_string(),
            status: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Operations shared by the BMC and node endpoints.
pub trait RemoteShell: Send + Sync {
    /// `user@host:port` for logs.
    fn describe(&self) -> String;

    /// Run a command and capture its output whatever the exit status.
    fn run_raw(&self, ctx: &ExecContext, command: &str) -> Result<RemoteOutput>;

    /// Stream a local file to `remote`, creating remote parents. A partial
    /// remote file is removed on failure.
    fn upload(&self, ctx: &ExecContext, local: &Path, remote: &str) -> Result<()>;

    fn download(&self, ctx: &ExecContext, remote: &str, local: &Path) -> Result<()>;

    /// Run an expect/send dialog on a pseudo-terminal shell.
    fn expect(&self, ctx: &ExecContext, steps: &[ExpectStep], timeout: Duration)
        -> Result<Transcript>;

    /// Terminate every client, session and subclient.
    fn close(&self) -> Result<()>;

    /// Run a command; non-zero exit is an error carrying stderr.
    fn run(&self, ctx: &ExecContext, command: &str) -> Result<RemoteOutput> {
        let out = self.run_raw(ctx, command)?;
        out.check(command)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("on {}", self.describe()))
    }

    /// `ls` probe: exit 1 or 2 means absent.
    fn exists(&self, ctx: &ExecContext, remote: &str) -> Result<bool> {
        let command = format!("ls {}", shell_quote(remote));
        let out = self.run_raw(ctx, &command)?;
        match out.status {
            0 => Ok(true),
            1 | 2 => Ok(false),
            status => Err(Error::CommandFailed {
                command,
                status,
                stdout: out.stdout,
                stderr: out.stderr,
            }
            .into()),
        }
    }
}

/// Accepts any host key; BMC and fresh nodes have no stable identity.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

type Client = Arc<Handle<AcceptAnyHostKey>>;

/// Password-authenticated SSH endpoint.
pub struct SshEndpoint {
    target: SshTarget,
    connect_timeout: Duration,
    command_timeout: Duration,
    retry: RetryPolicy,
    runtime: Arc<Runtime>,
    current: Mutex<Option<Client>>,
    clients: Mutex<Vec<Client>>,
    sftp: Mutex<Option<SftpClient>>,
    subclients: Mutex<Vec<SftpClient>>,
    closed: AtomicBool,
}

impl fmt::Debug for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshEndpoint")
            .field("target", &self.target)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SshEndpoint {
    pub fn new(target: SshTarget, settings: &SshSettings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tftpi-ssh")
            .enable_all()
            .build()
            .context("starting ssh runtime")?;
        Ok(Self {
            target,
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
            retry: settings.retry,
            runtime: Arc::new(runtime),
            current: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            sftp: Mutex::new(None),
            subclients: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("ssh endpoint {} is closed", self.target);
        }
        Ok(())
    }

    /// Drive `fut` on the private runtime, bounded by `limit`, the context
    /// deadline and cancellation.
    fn block_on<T>(
        &self,
        ctx: &ExecContext,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        ctx.check()?;
        let limit = ctx.bounded(limit);
        let token = ctx.token().clone();
        self.runtime.block_on(async move {
            tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled.into()),
                res = tokio::time::timeout(limit, fut) => match res {
                    Ok(v) => v,
                    Err(_) => Err(Error::Timeout(limit).into()),
                },
            }
        })
    }

    /// Live client, dialing a new one if needed.
    fn client(&self, ctx: &ExecContext) -> Result<Client> {
        self.ensure_open()?;
        let mut current = lock(&self.current);
        if let Some(client) = current.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }
        let target = self.target.clone();
        let connect_timeout = self.connect_timeout;
        let handle = self.block_on(ctx, connect_timeout + Duration::from_secs(1), async move {
            dial(&target, connect_timeout).await
        })?;
        let client = Arc::new(handle);
        lock(&self.clients).push(client.clone());
        *current = Some(client.clone());
        tracing::debug!(host = %self.target.host, "ssh connected");
        Ok(client)
    }

    fn forget_client(&self) {
        *lock(&self.current) = None;
    }

    /// Open a session channel, redialing on transient failure.
    fn open_channel(&self, ctx: &ExecContext) -> Result<Channel<Msg>> {
        self.retry.run(ctx, &format!("ssh session to {}", self.target), || {
            self.open_channel_once(ctx)
        })
    }

    /// One dial-and-open attempt. A failed open drops the client so the
    /// next attempt redials.
    fn open_channel_once(&self, ctx: &ExecContext) -> Result<Channel<Msg>> {
        let client = self.client(ctx)?;
        let label = self.target.to_string();
        let opened = self.block_on(ctx, self.connect_timeout, async move {
            client.channel_open_session().await.map_err(|e| {
                anyhow!(Error::Transient(format!("opening session on {label}: {e}")))
            })
        });
        if opened.is_err() {
            self.forget_client();
        }
        opened
    }

    /// Shared SFTP subclient, opened on first use.
    pub fn sftp(&self, ctx: &ExecContext) -> Result<SftpClient> {
        self.retry.run(ctx, &format!("sftp to {}", self.target), || {
            self.sftp_once(ctx)
        })
    }

    /// The cached subclient, or one attempt at opening it.
    fn sftp_once(&self, ctx: &ExecContext) -> Result<SftpClient> {
        self.ensure_open()?;
        if let Some(client) = lock(&self.sftp).as_ref() {
            return Ok(client.clone());
        }
        let channel = self.open_channel_once(ctx)?;
        let label = self.target.to_string();
        let session = self.block_on(ctx, self.connect_timeout, async move {
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| anyhow!(Error::Transient(format!("sftp subsystem on {label}: {e}"))))?;
            SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| anyhow!(Error::Transient(format!("sftp handshake on {label}: {e}"))))
        })?;
        let client = SftpClient::new(
            self.runtime.clone(),
            session,
            self.command_timeout,
            self.target.to_string(),
        );
        lock(&self.subclients).push(client.clone());
        *lock(&self.sftp) = Some(client.clone());
        Ok(client)
    }

    fn upload_once(&self, ctx: &ExecContext, local: &Path, remote: &str) -> Result<()> {
        let sftp = self.sftp_once(ctx)?;
        if let Some(parent) = sftp::posix_parent(remote) {
            sftp.mkdir_all(parent)?;
        }
        let file = fs::File::open(local)
            .with_context(|| format!("opening {}", local.display()))?;
        let mut reader = std::io::BufReader::new(file);
        let n = sftp.write_from(remote, &mut reader).map_err(|e| {
            // A dropped subclient must be reopened on the next attempt.
            *lock(&self.sftp) = None;
            e
        })?;
        tracing::debug!(host = %self.target.host, remote = %remote, bytes = n, "uploaded");
        Ok(())
    }

    fn shutdown(&self) {
        for sftp in lock(&self.subclients).drain(..) {
            if let Err(e) = sftp.close() {
                tracing::debug!("closing sftp subclient: {e:#}");
            }
        }
        *lock(&self.sftp) = None;
        *lock(&self.current) = None;
        let clients: Vec<Client> = lock(&self.clients).drain(..).collect();
        for client in clients {
            let result = self.runtime.block_on(async {
                tokio::time::timeout(
                    Duration::from_secs(5),
                    client.disconnect(Disconnect::ByApplication, "", "en"),
                )
                .await
            });
            if let Ok(Err(e)) = result {
                tracing::debug!("ssh disconnect: {e}");
            }
        }
    }
}

/// `<local>.part`, next to the destination.
fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

async fn dial(target: &SshTarget, connect_timeout: Duration) -> Result<Handle<AcceptAnyHostKey>> {
    let config = Arc::new(client::Config {
        keepalive_interval: Some(Duration::from_secs(15)),
        ..Default::default()
    });
    let addr = (target.host.clone(), target.port);
    let mut handle =
        match tokio::time::timeout(connect_timeout, client::connect(config, addr, AcceptAnyHostKey))
            .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(anyhow::Error::new(e).context(format!("connecting to {target}")))
            }
            Err(_) => bail!(Error::Transient(format!(
                "connecting to {target} timed out after {connect_timeout:?}"
            ))),
        };
    let accepted = handle
        .authenticate_password(target.user.clone(), target.password.clone())
        .await
        .with_context(|| format!("authenticating to {target}"))?;
    if !accepted {
        bail!("authentication failed for {target}");
    }
    Ok(handle)
}

async fn exec(mut channel: Channel<Msg>, command: String) -> Result<RemoteOutput> {
    channel
        .exec(true, command.as_bytes())
        .await
        .context("starting remote command")?;
    let (mut stdout, mut stderr, mut status) = (Vec::new(), Vec::new(), None);
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok(RemoteOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        status: status.map_or(-1, |s| s as i32),
    })
}

impl RemoteShell for SshEndpoint {
    fn describe(&self) -> String {
        self.target.to_string()
    }

    fn run_raw(&self, ctx: &ExecContext, command: &str) -> Result<RemoteOutput> {
        let channel = self.open_channel(ctx)?;
        tracing::debug!(host = %self.target.host, command = %command, "remote exec");
        let owned = command.to_string();
        self.block_on(ctx, self.command_timeout, exec(channel, owned))
            .with_context(|| format!("running `{command}` on {}", self.target))
    }

    fn upload(&self, ctx: &ExecContext, local: &Path, remote: &str) -> Result<()> {
        sftp::require_absolute(remote)?;
        self.retry
            .run(ctx, &format!("upload to {}", self.target), || {
                self.upload_once(ctx, local, remote)
            })
            .with_context(|| format!("uploading {} to {}:{remote}", local.display(), self.target))
    }

    fn download(&self, ctx: &ExecContext, remote: &str, local: &Path) -> Result<()> {
        sftp::require_absolute(remote)?;
        let sftp = self.sftp(ctx)?;
        let mut reader = sftp
            .open(remote)?
            .ok_or_else(|| Error::NotFound(format!("{}:{remote}", self.target)))?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = partial_path(local);
        let mut out =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        if let Err(e) = std::io::copy(&mut reader, &mut out) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("downloading {}:{remote}", self.target));
        }
        fs::rename(&tmp, local)
            .with_context(|| format!("renaming {} to {}", tmp.display(), local.display()))
    }

    fn expect(
        &self,
        ctx: &ExecContext,
        steps: &[ExpectStep],
        timeout: Duration,
    ) -> Result<Transcript> {
        let ctx = ctx.with_timeout(timeout);
        let channel = self.open_channel(&ctx)?;
        let label = self.target.to_string();
        let channel = self.block_on(&ctx, timeout, async move {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .with_context(|| format!("requesting pty on {label}"))?;
            channel
                .request_shell(false)
                .await
                .with_context(|| format!("starting shell on {label}"))?;
            Ok(channel)
        })?;
        let mut pty = PtyIo {
            runtime: self.runtime.clone(),
            channel,
            exit_status: None,
        };
        let transcript = expect::run_dialog(&mut pty, &ctx, steps, expect::DRAIN_GRACE)?;
        match transcript.exit_status {
            Some(0) | None => {
                tracing::debug!(host = %self.target.host, "interactive session finished")
            }
            Some(status) => tracing::info!(
                host = %self.target.host,
                status,
                "interactive session exited non-zero"
            ),
        }
        let _ = self
            .runtime
            .block_on(async { tokio::time::timeout(Duration::from_secs(2), pty.channel.close()).await });
        Ok(transcript)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown();
        tracing::debug!(host = %self.target.host, "ssh endpoint closed");
        Ok(())
    }
}

impl Drop for SshEndpoint {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

/// Pseudo-terminal channel driven by the dialog engine.
struct PtyIo {
    runtime: Arc<Runtime>,
    channel: Channel<Msg>,
    exit_status: Option<u32>,
}

impl DialogIo for PtyIo {
    fn send(&mut self, ctx: &ExecContext, bytes: &[u8]) -> Result<()> {
        ctx.check()?;
        let Self {
            runtime, channel, ..
        } = self;
        runtime
            .block_on(async {
                tokio::time::timeout(Duration::from_secs(10), channel.data(bytes)).await
            })
            .map_err(|_| anyhow!(Error::Transient("pty write timed out".into())))?
            .context("writing to pty")
    }

    fn recv(&mut self, ctx: &ExecContext, wait: Duration) -> Result<Recv> {
        ctx.check()?;
        let Self {
            runtime,
            channel,
            exit_status,
        } = self;
        let msg = runtime.block_on(async { tokio::time::timeout(wait, channel.wait()).await });
        Ok(match msg {
            Err(_) => Recv::Idle,
            Ok(None) | Ok(Some(ChannelMsg::Close)) => Recv::Closed(*exit_status),
            Ok(Some(ChannelMsg::Data { data })) => Recv::Data(data.to_vec()),
            Ok(Some(ChannelMsg::ExtendedData { data, .. })) => Recv::Data(data.to_vec()),
            Ok(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                *exit_status = Some(status);
                Recv::Idle
            }
            Ok(Some(_)) => Recv::Idle,
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process [`RemoteShell`] for component tests.

    use super::*;
    use std::collections::{BTreeMap, BTreeSet, VecDeque};

    type Handler = Box<dyn FnMut(&str) -> RemoteOutput + Send>;

    #[derive(Default)]
    struct Inner {
        log: Vec<String>,
        files: BTreeMap<String, Vec<u8>>,
        scripted: Vec<(String, VecDeque<RemoteOutput>)>,
        handler: Option<Handler>,
        dialogs: VecDeque<Result<String, String>>,
        expects: Vec<Vec<ExpectStep>>,
        fail_uploads: usize,
        closed: bool,
    }

    /// Records every command and answers from scripts, keyed by prefix.
    #[derive(Default)]
    pub(crate) struct FakeShell {
        inner: Mutex<Inner>,
    }

    pub(crate) fn ok(stdout: &str) -> RemoteOutput {
        RemoteOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            status: 0,
        }
    }

    pub(crate) fn status(code: i32, stderr: &str) -> RemoteOutput {
        RemoteOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status: code,
        }
    }

    impl FakeShell {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Queue an answer for commands starting with `prefix`. The last
        /// queued answer repeats.
        pub(crate) fn on(&self, prefix: &str, out: RemoteOutput) -> &Self {
            let mut inner = lock(&self.inner);
            match inner.scripted.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, q)) => q.push_back(out),
                None => inner
                    .scripted
                    .push((prefix.to_string(), VecDeque::from([out]))),
            }
            self
        }

        pub(crate) fn handler(&self, f: impl FnMut(&str) -> RemoteOutput + Send + 'static) {
            lock(&self.inner).handler = Some(Box::new(f));
        }

        pub(crate) fn dialog(&self, transcript: Result<&str, &str>) {
            lock(&self.inner)
                .dialogs
                .push_back(transcript.map(str::to_string).map_err(str::to_string));
        }

        pub(crate) fn put_file(&self, path: &str, bytes: &[u8]) {
            lock(&self.inner).files.insert(path.to_string(), bytes.to_vec());
        }

        pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
            lock(&self.inner).files.get(path).cloned()
        }

        pub(crate) fn fail_next_uploads(&self, n: usize) {
            lock(&self.inner).fail_uploads = n;
        }

        pub(crate) fn log(&self) -> Vec<String> {
            lock(&self.inner).log.clone()
        }

        pub(crate) fn expects(&self) -> Vec<Vec<ExpectStep>> {
            lock(&self.inner).expects.clone()
        }

        pub(crate) fn ran(&self, prefix: &str) -> bool {
            self.log().iter().any(|c| c.starts_with(prefix))
        }

        pub(crate) fn is_closed(&self) -> bool {
            lock(&self.inner).closed
        }

        pub(crate) fn paths(&self) -> BTreeSet<String> {
            lock(&self.inner).files.keys().cloned().collect()
        }
    }

    impl RemoteShell for FakeShell {
        fn describe(&self) -> String {
            "fake".into()
        }

        fn run_raw(&self, ctx: &ExecContext, command: &str) -> Result<RemoteOutput> {
            ctx.check()?;
            let mut inner = lock(&self.inner);
            if inner.closed {
                bail!("fake shell is closed");
            }
            inner.log.push(command.to_string());
            if let Some(rest) = command.strip_prefix("ls ") {
                let path = rest.trim_matches('\'');
                if inner.files.contains_key(path) {
                    return Ok(ok(path));
                }
            }
            if let Some(rest) = command.strip_prefix("cat ") {
                let path = rest.trim_matches('\'');
                if let Some(bytes) = inner.files.get(path) {
                    return Ok(ok(&String::from_utf8_lossy(bytes)));
                }
            }
            let scripted = inner
                .scripted
                .iter_mut()
                .find(|(p, _)| command.starts_with(p.as_str()))
                .map(|(_, q)| {
                    if q.len() > 1 {
                        q.pop_front().unwrap_or_default()
                    } else {
                        q.front().cloned().unwrap_or_default()
                    }
                });
            if let Some(out) = scripted {
                return Ok(out);
            }
            if let Some(handler) = inner.handler.as_mut() {
                return Ok(handler(command));
            }
            if command.starts_with("ls ") {
                return Ok(status(2, "No such file or directory"));
            }
            if command.starts_with("cat ") {
                return Ok(status(1, "No such file or directory"));
            }
            Ok(ok(""))
        }

        fn upload(&self, ctx: &ExecContext, local: &Path, remote: &str) -> Result<()> {
            ctx.check()?;
            let mut inner = lock(&self.inner);
            inner.log.push(format!("upload {} {remote}", local.display()));
            if inner.fail_uploads > 0 {
                inner.fail_uploads -= 1;
                bail!(Error::Transient("connection reset by peer".into()));
            }
            let bytes = fs::read(local)?;
            inner.files.insert(remote.to_string(), bytes);
            Ok(())
        }

        fn download(&self, ctx: &ExecContext, remote: &str, local: &Path) -> Result<()> {
            ctx.check()?;
            let inner = lock(&self.inner);
            let bytes = inner
                .files
                .get(remote)
                .ok_or_else(|| Error::NotFound(remote.to_string()))?;
            fs::write(local, bytes)?;
            Ok(())
        }

        fn expect(
            &self,
            ctx: &ExecContext,
            steps: &[ExpectStep],
            _timeout: Duration,
        ) -> Result<Transcript> {
            ctx.check()?;
            let mut inner = lock(&self.inner);
            inner.expects.push(steps.to_vec());
            match inner.dialogs.pop_front() {
                Some(Ok(text)) => Ok(Transcript {
                    text,
                    exit_status: Some(0),
                    closed: true,
                }),
                Some(Err(e)) => Err(anyhow!(e)),
                None => Ok(Transcript {
                    text: String::new(),
                    exit_status: None,
                    closed: true,
                }),
            }
        }

        fn close(&self) -> Result<()> {
            lock(&self.inner).closed = true;
            Ok(())
        }
    }
}
