// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod encode;
pub mod ssh;

use std::cell::Cell;
use std::io;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, info, warn};

pub use ssh::SshTransport;

const LOG: &str = "ssh";

/// The outcome of running one remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The command ran and exited 0.
    Success,
    /// The command ran and exited with the given nonzero code.
    Failure(i32),
    /// No result is available: the host could not be reached or the command timed out.
    Unreachable,
}

/// The text output and the exit status of one remote command.
///
/// The output is stdout followed by stderr, trimmed. Callers interpret it with substring checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub output: String,
    pub status: ExitStatus,
}

impl Execution {
    pub fn new(output: impl Into<String>, status: ExitStatus) -> Self {
        Execution {
            output: output.into(),
            status,
        }
    }

    pub fn success(output: impl Into<String>) -> Self {
        Self::new(output, ExitStatus::Success)
    }

    pub fn failure(output: impl Into<String>, code: i32) -> Self {
        Self::new(output, ExitStatus::Failure(code))
    }

    pub fn unreachable() -> Self {
        Self::new("", ExitStatus::Unreachable)
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExitStatus::Success
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.output.contains(needle)
    }

    /// The last `n` characters of the output, for error reports.
    pub fn tail(&self, n: usize) -> &str {
        let count = self.output.chars().count();
        if count <= n {
            return &self.output;
        }
        match self.output.char_indices().nth(count - n) {
            Some((idx, _)) => &self.output[idx..],
            None => &self.output,
        }
    }
}

/// Anything that can run a shell command and report an `Execution`.
///
/// Implemented by the control-host session and by shells that run inside a compute unit, so that
/// package management and actions can target either one.
pub trait Executor {
    /// Run `command`, giving up after `timeout` (or the executor's default when `None`). When
    /// `escalate` is set the command runs as root.
    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Option<Duration>,
        escalate: bool,
    ) -> LocalBoxFuture<'a, Execution>;

    fn run<'a>(&'a self, command: &'a str) -> LocalBoxFuture<'a, Execution> {
        self.execute(command, None, false)
    }

    fn run_for<'a>(&'a self, command: &'a str, timeout: Duration) -> LocalBoxFuture<'a, Execution> {
        self.execute(command, Some(timeout), false)
    }
}

/// The raw result of a command run by a `Transport`.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl RawOutput {
    fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (_, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }

    fn status(&self) -> ExitStatus {
        match self.code {
            Some(0) => ExitStatus::Success,
            Some(code) => ExitStatus::Failure(code),
            None => ExitStatus::Failure(-1),
        }
    }
}

/// The connection mechanics underneath a `RemoteSession`.
pub trait Transport {
    /// A human readable name for the remote end, used in logs.
    fn destination(&self) -> &str;

    /// Establish the connection.
    fn open(&self) -> LocalBoxFuture<'_, io::Result<()>>;

    /// Cheap liveness check of an established connection.
    fn probe(&self) -> LocalBoxFuture<'_, bool>;

    /// Tear the connection down. Must be safe to call on a connection that is already gone.
    fn close(&self) -> LocalBoxFuture<'_, ()>;

    fn run<'a>(&'a self, command: &'a str) -> LocalBoxFuture<'a, io::Result<RawOutput>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One persistent connection to a host.
///
/// The session reconnects lazily: when the liveness probe fails it tears the connection down, and
/// the next `execute()` establishes a fresh one. Callers only ever see `Execution` values; a
/// connection failure is reported as `ExitStatus::Unreachable`.
///
/// A session is not meant to be shared between concurrent flows.
pub struct RemoteSession<T: Transport = SshTransport> {
    transport: T,
    state: Cell<SessionState>,
    default_timeout: Duration,
}

impl<T: Transport> RemoteSession<T> {
    pub fn new(transport: T, default_timeout: Duration) -> Self {
        RemoteSession {
            transport,
            state: Cell::new(SessionState::Disconnected),
            default_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn connect(&self) -> bool {
        self.state.set(SessionState::Connecting);
        match self.transport.open().await {
            Ok(()) => {
                info!(target: LOG, "Connected to {}", self.transport.destination());
                self.state.set(SessionState::Connected);
                true
            }
            Err(e) => {
                warn!(target: LOG, "Failed to connect to {}: {e}", self.transport.destination());
                self.state.set(SessionState::Disconnected);
                false
            }
        }
    }

    pub async fn disconnect(&self) {
        if self.state.get() != SessionState::Disconnected {
            self.transport.close().await;
            self.state.set(SessionState::Disconnected);
            debug!(target: LOG, "Disconnected from {}", self.transport.destination());
        }
    }

    /// Probe the connection. A failed probe tears the connection down.
    pub async fn is_connected(&self) -> bool {
        if self.state.get() != SessionState::Connected {
            return false;
        }
        if self.transport.probe().await {
            return true;
        }
        debug!(target: LOG, "Liveness probe to {} failed", self.transport.destination());
        self.transport.close().await;
        self.state.set(SessionState::Disconnected);
        false
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
        escalate: bool,
    ) -> Execution {
        if !self.is_connected().await && !self.connect().await {
            return Execution::unreachable();
        }

        let command = if escalate {
            encode::escalate(command)
        } else {
            command.to_string()
        };
        let timeout = timeout.unwrap_or(self.default_timeout);
        debug!(target: LOG, "Running on {}: {command}", self.transport.destination());

        match tokio::time::timeout(timeout, self.transport.run(&command)).await {
            Ok(Ok(raw)) => Execution::new(raw.combined(), raw.status()),
            Ok(Err(e)) => {
                warn!(target: LOG, "Command on {} failed to run: {e}", self.transport.destination());
                self.disconnect().await;
                Execution::unreachable()
            }
            Err(_) => {
                warn!(
                    target: LOG,
                    "Command on {} timed out after {}s",
                    self.transport.destination(),
                    timeout.as_secs()
                );
                self.disconnect().await;
                Execution::unreachable()
            }
        }
    }
}

impl<T: Transport> Executor for RemoteSession<T> {
    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Option<Duration>,
        escalate: bool,
    ) -> LocalBoxFuture<'a, Execution> {
        self.execute_command(command, timeout, escalate).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_respects_char_boundaries() {
        let exec = Execution::failure("ééééé", 1);
        assert_eq!(exec.tail(2), "éé");
        assert_eq!(exec.tail(10), "ééééé");
    }

    #[test]
    fn stderr_follows_stdout() {
        let raw = RawOutput {
            stdout: "out\n".to_string(),
            stderr: " err".to_string(),
            code: Some(2),
        };
        assert_eq!(raw.combined(), "out\nerr");
        assert_eq!(raw.status(), ExitStatus::Failure(2));
    }
}
