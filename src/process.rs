//! Host command builder.
//!
//! Every host-side tool invocation (xz, kpartx, mount, the container
//! runtime) goes through [`Cmd`], so failures carry the command line and
//! its trimmed stderr.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::context::ExecContext;
use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Builder for a host command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prefixed to the error when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the output even when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Bytes written to the child's stdin, which is then closed.
    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Printable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion without a deadline.
    pub fn run(self) -> Result<CmdOutput> {
        self.run_ctx(&ExecContext::background())
    }

    /// Run, killing the child if the context is cancelled or expires.
    pub fn run_ctx(self, ctx: &ExecContext) -> Result<CmdOutput> {
        ctx.check()?;
        let line = self.display();
        tracing::debug!(command = %line, "exec");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", line))?;

        if let (Some(bytes), Some(mut stdin)) = (self.stdin, child.stdin.take()) {
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
        }

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            if let Err(e) = ctx.check() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).with_context(|| format!("while running {}", line));
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let output = CmdOutput {
            status: status.code().unwrap_or(-1),
            stdout: stdout.map(join).unwrap_or_default(),
            stderr: stderr.map(join).unwrap_or_default(),
        };

        if !output.success() && !self.allow_fail {
            let err = Error::CommandFailed {
                command: line,
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            };
            return match self.error_msg {
                Some(msg) => Err(anyhow::Error::new(err).context(msg)),
                None => Err(err.into()),
            };
        }
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
