// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Provisioning actions: the `Action` trait, the parameters every action is built from, and the
//! catalog of concrete actions.

pub mod apt_cache;
pub mod create_container;
pub mod dns;
pub mod kubernetes;
pub mod registry;
pub mod services;
pub mod system;
pub mod workloads;

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{error, warn};

use crate::apt::Apt;
use crate::config::{Container, Topology};
use crate::container::Pct;
use crate::remote::{encode, ExitStatus, Execution, Executor};

pub use registry::{Registry, UnknownAction};

/// One provisioning operation.
///
/// `execute()` reports failure by returning false, after logging whatever diagnostics it has; it
/// never panics. Implementations check before they change where they can, since a resumed plan
/// may run the same action against the same unit more than once.
pub trait Action {
    fn execute(&self) -> LocalBoxFuture<'_, bool>;

    /// A short human readable label, used in plans and logs.
    fn describe(&self) -> String;
}

/// Everything an action may be built from.
///
/// Actions bound to a compute unit get a `shell` and `apt` that run inside that unit. Cluster
/// level actions get the shell of the cluster control unit.
#[derive(Clone, Copy)]
pub struct ActionParams<'a> {
    pub shell: Option<&'a dyn Executor>,
    pub apt: Option<&'a Apt<'a>>,
    pub pct: Option<&'a Pct<'a>>,
    pub unit_id: Option<u32>,
    pub topology: &'a Topology,
    pub unit: Option<&'a Container>,
}

impl<'a> ActionParams<'a> {
    /// Parameters with no unit, no session, and no adapter.
    pub fn bare(topology: &'a Topology) -> Self {
        ActionParams {
            shell: None,
            apt: None,
            pct: None,
            unit_id: None,
            topology,
            unit: None,
        }
    }
}

/// Log that `what` was not provided to the action `target`, and return `None` so the caller can
/// bail out with `?`-like brevity.
pub fn missing<T>(target: &str, what: &str) -> Option<T> {
    error!(target: target, "{what} not available");
    None
}

/// Log a failed command with the tail of its output.
pub fn log_failure(target: &str, what: &str, exec: &Execution) {
    match exec.status {
        ExitStatus::Unreachable => error!(target: target, "{what} got no result (timeout or connection failure)"),
        ExitStatus::Failure(code) => {
            error!(target: target, "{what} failed with exit code {code}");
            if !exec.output.is_empty() {
                error!(target: target, "{what} output: {}", exec.tail(500));
            }
        }
        ExitStatus::Success => {}
    }
}

/// Build a command that writes `content` to `path`, creating the parent directory.
///
/// The content travels base64 encoded so that it may hold any characters.
pub fn write_file(path: &str, content: &str) -> String {
    let parent = match path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent,
        _ => "/",
    };
    format!(
        "mkdir -p {parent} && echo {} | base64 -d > {path}",
        encode::encode(content)
    )
}

/// `systemctl is-active` printed `active`.
pub fn is_active(output: &str) -> bool {
    output.lines().any(|line| line.trim() == "active")
}

/// Poll `check` every `interval` until it returns true or `limit` has elapsed.
pub async fn poll<F, Fut>(limit: Duration, interval: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut waited = Duration::ZERO;
    loop {
        if check().await {
            return true;
        }
        if waited >= limit {
            return false;
        }
        tokio::time::sleep(interval).await;
        waited += interval;
    }
}

/// One command of a `Script`.
pub struct ScriptStep {
    pub description: String,
    pub command: String,
    /// A failure of this step is logged and the script continues.
    pub tolerant: bool,
}

impl ScriptStep {
    pub fn new(description: impl Into<String>, command: impl Into<String>) -> Self {
        ScriptStep {
            description: description.into(),
            command: command.into(),
            tolerant: false,
        }
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }
}

/// An action that runs a fixed sequence of commands on one executor and fails on the first
/// failing command.
pub struct Script<'a> {
    label: &'static str,
    target: &'static str,
    shell: Option<&'a dyn Executor>,
    steps: Vec<ScriptStep>,
    timeout: Option<Duration>,
}

impl<'a> Script<'a> {
    pub fn new(
        label: &'static str,
        target: &'static str,
        shell: Option<&'a dyn Executor>,
        steps: Vec<ScriptStep>,
    ) -> Self {
        Script {
            label,
            target,
            shell,
            steps,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(self.target, "Shell")) else {
            return false;
        };
        for step in self.steps.iter() {
            let exec = shell.execute(&step.command, self.timeout, true).await;
            if exec.succeeded() {
                continue;
            }
            if step.tolerant {
                warn!(target: self.target, "{} had issues: {}", step.description, exec.tail(200));
                continue;
            }
            log_failure(self.target, &step.description, &exec);
            return false;
        }
        true
    }
}

impl Action for Script<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::ScriptedExecutor;

    #[test]
    fn write_file_carries_content_encoded() {
        let command = write_file("/etc/apt/apt.conf.d/01proxy", "Acquire::http::Proxy \"x\";\n");
        assert!(command.starts_with("mkdir -p /etc/apt/apt.conf.d && echo "));
        assert!(command.ends_with(" | base64 -d > /etc/apt/apt.conf.d/01proxy"));
        assert!(!command.contains('"'));
    }

    #[test]
    fn active_means_exactly_active() {
        assert!(is_active("active"));
        assert!(!is_active("inactive"));
        assert!(!is_active("activating"));
    }

    #[tokio::test(start_paused = true)]
    async fn script_stops_at_first_failure() {
        let shell = ScriptedExecutor::new().on("second", Execution::failure("nope", 1));
        let script = Script::new(
            "demo",
            "demo",
            Some(&shell),
            vec![
                ScriptStep::new("first", "echo first"),
                ScriptStep::new("second", "echo second"),
                ScriptStep::new("third", "echo third"),
            ],
        );
        assert!(!script.execute().await);
        assert!(!shell.ran("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gives_up_after_limit() {
        let mut calls = 0;
        let ok = poll(Duration::from_secs(10), Duration::from_secs(2), || {
            calls += 1;
            async { false }
        })
        .await;
        assert!(!ok);
        assert_eq!(calls, 6);
    }
}
