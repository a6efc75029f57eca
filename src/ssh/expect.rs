//! Expect/send dialogs over an interactive session.
//!
//! The dialog engine only needs something that can send bytes and hand
//! back output chunks, so it runs the same against a real pseudo-terminal
//! channel and against scripted fakes.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::context::ExecContext;

/// How long a single receive waits before the loop re-checks the context.
pub const POLL: Duration = Duration::from_millis(200);

/// Output collected after the final send, until the session closes.
pub const DRAIN_GRACE: Duration = Duration::from_secs(3);

/// Wait for `expect` to appear, then write `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectStep {
    pub expect: String,
    pub send: String,
}

impl ExpectStep {
    pub fn new(expect: impl Into<String>, send: impl Into<String>) -> Self {
        Self {
            expect: expect.into(),
            send: send.into(),
        }
    }
}

/// One receive result from a dialog session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Idle,
    /// The session ended, with the exit status if the server sent one.
    Closed(Option<u32>),
}

/// Transport under a dialog.
pub trait DialogIo {
    fn send(&mut self, ctx: &ExecContext, bytes: &[u8]) -> Result<()>;
    fn recv(&mut self, ctx: &ExecContext, wait: Duration) -> Result<Recv>;
}

/// Result of a finished dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub exit_status: Option<u32>,
    pub closed: bool,
}

/// Run `steps` in order. Each step waits for its `expect` text to appear
/// after the previous match, then writes its `send` line (a trailing
/// newline is added if missing). After the final send, output is drained
/// until the session closes or `grace` elapses. The context deadline
/// bounds the whole dialog.
pub fn run_dialog(
    io: &mut dyn DialogIo,
    ctx: &ExecContext,
    steps: &[ExpectStep],
    grace: Duration,
) -> Result<Transcript> {
    let mut raw: Vec<u8> = Vec::new();
    let mut cursor = 0usize;
    let mut exit_status = None;

    for (i, step) in steps.iter().enumerate() {
        loop {
            if let Some(pos) = find_bytes(&raw[cursor..], step.expect.as_bytes()) {
                cursor += pos + step.expect.len();
                break;
            }
            ctx.check().with_context(|| {
                format!(
                    "waiting for {:?} (step {} of {}); transcript tail: {:?}",
                    step.expect,
                    i + 1,
                    steps.len(),
                    tail(&raw)
                )
            })?;
            match io.recv(ctx, ctx.bounded(POLL))? {
                Recv::Data(bytes) => raw.extend_from_slice(&bytes),
                Recv::Idle => {}
                Recv::Closed(status) => bail!(
                    "session closed (exit status {status:?}) while waiting for {:?}; transcript tail: {:?}",
                    step.expect,
                    tail(&raw)
                ),
            }
        }
        let mut line = step.send.clone();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        io.send(ctx, line.as_bytes())
            .with_context(|| format!("sending response to {:?}", step.expect))?;
    }

    let stop = Instant::now() + ctx.bounded(grace);
    let mut closed = false;
    while !ctx.is_done() {
        let now = Instant::now();
        if now >= stop {
            break;
        }
        match io.recv(ctx, POLL.min(stop - now)) {
            Ok(Recv::Data(bytes)) => raw.extend_from_slice(&bytes),
            Ok(Recv::Idle) => {}
            Ok(Recv::Closed(status)) => {
                exit_status = status;
                closed = true;
                break;
            }
            Err(e) => {
                tracing::debug!("dialog drain stopped: {e:#}");
                break;
            }
        }
    }

    Ok(Transcript {
        text: String::from_utf8_lossy(&raw).into_owned(),
        exit_status,
        closed,
    })
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let chars: Vec<char> = text.chars().collect();
    chars[chars.len().saturating_sub(200)..].iter().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error;
    use std::collections::VecDeque;

    /// Scripted shell: each time a line is sent, the reply registered for
    /// it is queued as output.
    pub(crate) struct ScriptedShell {
        pub(crate) pending: VecDeque<Recv>,
        pub(crate) replies: Vec<(String, Vec<Recv>)>,
        pub(crate) sent: Vec<String>,
    }

    impl ScriptedShell {
        pub(crate) fn new(banner: &str) -> Self {
            Self {
                pending: VecDeque::from([Recv::Data(banner.as_bytes().to_vec())]),
                replies: Vec::new(),
                sent: Vec::new(),
            }
        }

        pub(crate) fn reply(mut self, line: &str, output: Vec<Recv>) -> Self {
            self.replies.push((line.to_string(), output));
            self
        }
    }

    impl DialogIo for ScriptedShell {
        fn send(&mut self, _ctx: &ExecContext, bytes: &[u8]) -> Result<()> {
            let line = String::from_utf8_lossy(bytes).trim_end().to_string();
            if let Some(pos) = self.replies.iter().position(|(l, _)| *l == line) {
                let (_, out) = self.replies.remove(pos);
                self.pending.extend(out);
            }
            self.sent.push(line);
            Ok(())
        }

        fn recv(&mut self, _ctx: &ExecContext, wait: Duration) -> Result<Recv> {
            match self.pending.pop_front() {
                Some(r) => Ok(r),
                None => {
                    std::thread::sleep(wait.min(Duration::from_millis(5)));
                    Ok(Recv::Idle)
                }
            }
        }
    }

    fn data(s: &str) -> Recv {
        Recv::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn echo_then_exit() {
        let mut shell = ScriptedShell::new("Welcome\r\n# ")
            .reply("echo done", vec![data("echo done\r\ndone\r\n# ")])
            .reply("exit", vec![data("logout\r\n"), Recv::Closed(Some(0))]);
        let steps = [ExpectStep::new("#", "echo done"), ExpectStep::new("done", "exit")];
        let out = run_dialog(
            &mut shell,
            &ExecContext::background(),
            &steps,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(out.text.contains("done"));
        assert!(out.closed);
        assert_eq!(out.exit_status, Some(0));
        assert_eq!(shell.sent, vec!["echo done", "exit"]);
    }

    #[test]
    fn password_change_transcript() {
        let mut shell = ScriptedShell::new("You are required to change your password immediately\r\nCurrent password: ")
            .reply("ubuntu", vec![data("\r\nNew password: ")])
            .reply("s3cret", vec![data("\r\nRetype new password: ")])
            .reply(
                "s3cret",
                vec![
                    data("\r\npasswd: password updated successfully\r\n"),
                    Recv::Closed(Some(1)),
                ],
            );
        let steps = [
            ExpectStep::new("Current password:", "ubuntu"),
            ExpectStep::new("New password:", "s3cret"),
            ExpectStep::new("Retype new password:", "s3cret"),
        ];
        let out = run_dialog(
            &mut shell,
            &ExecContext::background(),
            &steps,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(out.text.contains("passwd: password updated successfully"));
        assert_eq!(out.exit_status, Some(1));
    }

    #[test]
    fn missing_prompt_times_out() {
        let mut shell = ScriptedShell::new("$ ");
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(150));
        let err = run_dialog(
            &mut shell,
            &ctx,
            &[ExpectStep::new("login:", "root")],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(error::is_cancelled(&err));
        assert!(format!("{err:#}").contains("login:"));
    }

    #[test]
    fn closed_session_fails_pending_step() {
        let mut shell = ScriptedShell::new("bye");
        shell.pending.push_back(Recv::Closed(None));
        let err = run_dialog(
            &mut shell,
            &ExecContext::background(),
            &[ExpectStep::new("#", "true")],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.to_string().contains("session closed"));
    }

    #[test]
    fn match_must_follow_previous_match() {
        let mut shell = ScriptedShell::new("prompt> ").reply("first", vec![data("ok\r\n")]);
        let ctx = ExecContext::background().with_timeout(Duration::from_millis(150));
        let result = run_dialog(
            &mut shell,
            &ctx,
            &[ExpectStep::new("prompt>", "first"), ExpectStep::new("prompt>", "second")],
            Duration::from_millis(10),
        );
        assert!(result.is_err());
        assert_eq!(shell.sent, vec!["first"]);
    }
}
