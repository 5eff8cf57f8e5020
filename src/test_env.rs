// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Scripted stand-ins for the control host, used by unit and integration tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::config::Topology;
use crate::remote::{encode, Execution, Executor, RawOutput, Transport};

/// Given a relative `path` in the test directory, prepend the full path to the test directory.
pub fn test_path(path: &str) -> String {
    std::env::var("CARGO_MANIFEST_DIR").unwrap() + "/tests/" + path
}

/// Load the topology fixture `name` from the test directory, resolved for `environment`.
pub fn topology(name: &str, environment: &str) -> Topology {
    Topology::load(&test_path(name), environment).unwrap()
}

/// Rewrite `pct exec <id> -- bash -c "echo <b64> | base64 -d | bash"` as `ct:<id> <command>` so
/// tests can match and inspect the command that actually runs inside the unit.
pub fn unwrap_exec(command: &str) -> String {
    let Some(rest) = command.strip_prefix("pct exec ") else {
        return command.to_string();
    };
    let Some((id, wrapped)) = rest.split_once(" -- bash -c \"echo ") else {
        return command.to_string();
    };
    let Some(encoded) = wrapped.strip_suffix(" | base64 -d | bash\"") else {
        return command.to_string();
    };
    match encode::decode(encoded) {
        Some(inner) => format!("ct:{id} {inner}"),
        None => command.to_string(),
    }
}

type Responder = Box<dyn Fn(&str) -> Execution>;

struct Rule {
    pattern: String,
    respond: Responder,
    remaining: Option<usize>,
}

/// An `Executor` that answers from an ordered list of rules and records every command.
///
/// The first rule whose pattern is a substring of the command wins. Commands wrapped for
/// `pct exec` are unwrapped first (see `unwrap_exec`). A command that matches no rule succeeds
/// with empty output.
pub struct ScriptedExecutor {
    rules: RefCell<Vec<Rule>>,
    commands: RefCell<Vec<String>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        ScriptedExecutor {
            rules: RefCell::new(Vec::new()),
            commands: RefCell::new(Vec::new()),
        }
    }

    fn push(self, pattern: &str, respond: Responder, remaining: Option<usize>) -> Self {
        self.rules.borrow_mut().push(Rule {
            pattern: pattern.to_string(),
            respond,
            remaining,
        });
        self
    }

    /// Answer every command containing `pattern` with `result`.
    pub fn on(self, pattern: &str, result: Execution) -> Self {
        self.push(pattern, Box::new(move |_| result.clone()), None)
    }

    /// Answer the next command containing `pattern` with `result`, then stop matching.
    pub fn once(self, pattern: &str, result: Execution) -> Self {
        self.times(pattern, 1, result)
    }

    pub fn times(self, pattern: &str, n: usize, result: Execution) -> Self {
        self.push(pattern, Box::new(move |_| result.clone()), Some(n))
    }

    /// Answer every command containing `pattern` by calling `respond` with the command.
    pub fn on_with(self, pattern: &str, respond: impl Fn(&str) -> Execution + 'static) -> Self {
        self.push(pattern, Box::new(respond), None)
    }

    /// Every command run so far, in order, with `pct exec` wrappers removed.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    /// How many commands run so far contain `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.count(pattern) > 0
    }

    fn answer(&self, command: &str) -> Execution {
        let command = unwrap_exec(command);
        self.commands.borrow_mut().push(command.clone());
        let mut rules = self.rules.borrow_mut();
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) || !command.contains(&rule.pattern) {
                continue;
            }
            if let Some(n) = rule.remaining.as_mut() {
                *n -= 1;
            }
            return (rule.respond)(&command);
        }
        Execution::success("")
    }
}

impl Executor for ScriptedExecutor {
    fn execute<'a>(
        &'a self,
        command: &'a str,
        _timeout: Option<Duration>,
        _escalate: bool,
    ) -> LocalBoxFuture<'a, Execution> {
        let result = self.answer(command);
        async move { result }.boxed_local()
    }
}

/// A `Transport` whose connection behavior is scripted: probes and opens succeed or fail in the
/// order given, and commands can be made to hang to exercise timeouts.
pub struct ScriptedTransport {
    probes: RefCell<VecDeque<bool>>,
    opens: RefCell<VecDeque<bool>>,
    run_delay: Option<Duration>,
    output: String,
    connects: Cell<u32>,
    closes: Cell<u32>,
    runs: RefCell<Vec<String>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            probes: RefCell::new(VecDeque::new()),
            opens: RefCell::new(VecDeque::new()),
            run_delay: None,
            output: "ok".to_string(),
            connects: Cell::new(0),
            closes: Cell::new(0),
            runs: RefCell::new(Vec::new()),
        }
    }

    /// Results of the next probes, in order. Once exhausted, probes succeed.
    pub fn probes(self, results: &[bool]) -> Self {
        self.probes.borrow_mut().extend(results.iter().copied());
        self
    }

    /// Results of the next connection attempts, in order. Once exhausted, opens succeed.
    pub fn opens(self, results: &[bool]) -> Self {
        self.opens.borrow_mut().extend(results.iter().copied());
        self
    }

    /// Make every command take `delay` before it completes.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.run_delay = Some(delay);
        self
    }

    pub fn output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    pub fn connects(&self) -> u32 {
        self.connects.get()
    }

    pub fn closes(&self) -> u32 {
        self.closes.get()
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.borrow().clone()
    }
}

impl Transport for ScriptedTransport {
    fn destination(&self) -> &str {
        "root@scripted"
    }

    fn open(&self) -> LocalBoxFuture<'_, io::Result<()>> {
        self.connects.set(self.connects.get() + 1);
        let ok = self.opens.borrow_mut().pop_front().unwrap_or(true);
        async move {
            if ok {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }
        .boxed_local()
    }

    fn probe(&self) -> LocalBoxFuture<'_, bool> {
        let ok = self.probes.borrow_mut().pop_front().unwrap_or(true);
        async move { ok }.boxed_local()
    }

    fn close(&self) -> LocalBoxFuture<'_, ()> {
        self.closes.set(self.closes.get() + 1);
        async {}.boxed_local()
    }

    fn run<'a>(&'a self, command: &'a str) -> LocalBoxFuture<'a, io::Result<RawOutput>> {
        self.runs.borrow_mut().push(command.to_string());
        async move {
            if let Some(delay) = self.run_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(RawOutput {
                stdout: self.output.clone(),
                stderr: String::new(),
                code: Some(0),
            })
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Pct;

    #[test]
    fn exec_wrappers_are_unwrapped() {
        let wrapped = Pct::exec_command(3012, "systemctl is-active k3s-agent");
        assert_eq!(unwrap_exec(&wrapped), "ct:3012 systemctl is-active k3s-agent");
        assert_eq!(unwrap_exec("pct list"), "pct list");
    }
}
