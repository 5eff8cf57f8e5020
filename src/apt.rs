// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use log::{debug, warn};

use crate::remote::{Execution, Executor};

const LOG: &str = "apt";

const LONG_TIMEOUT: Duration = Duration::from_secs(600);
const LOCK_WAIT: Duration = Duration::from_secs(600);
const LOCK_POLL: Duration = Duration::from_secs(5);

/// Package management on whatever an `Executor` targets: the control host or a compute unit.
///
/// Every command runs non-interactively, escalated, and with a long timeout. Operations that
/// change packages refresh the package lists first.
pub struct Apt<'a> {
    shell: &'a dyn Executor,
}

impl<'a> Apt<'a> {
    pub fn new(shell: &'a dyn Executor) -> Self {
        Apt { shell }
    }

    async fn apt_get(&self, args: &str) -> Execution {
        let command = format!("DEBIAN_FRONTEND=noninteractive apt-get {args}");
        self.shell.execute(&command, Some(LONG_TIMEOUT), true).await
    }

    pub async fn update(&self) -> Execution {
        self.apt_get("update").await
    }

    /// Run `update`, and when it fails return its result so callers see why.
    async fn refreshed(&self) -> Option<Execution> {
        let update = self.update().await;
        if update.succeeded() {
            None
        } else {
            warn!(target: LOG, "apt-get update failed: {}", update.tail(500));
            Some(update)
        }
    }

    pub async fn install(&self, packages: &[&str]) -> Execution {
        if let Some(failed) = self.refreshed().await {
            return failed;
        }
        debug!(target: LOG, "Installing {}", packages.join(" "));
        self.apt_get(&format!("install -y {}", packages.join(" ")))
            .await
    }

    pub async fn upgrade(&self) -> Execution {
        if let Some(failed) = self.refreshed().await {
            return failed;
        }
        self.apt_get("upgrade -y").await
    }

    pub async fn dist_upgrade(&self) -> Execution {
        if let Some(failed) = self.refreshed().await {
            return failed;
        }
        self.apt_get("dist-upgrade -y").await
    }

    /// Wait for any other dpkg/apt process to release its locks. Returns false if the locks are
    /// still held after ten minutes.
    pub async fn wait_for_lock(&self) -> bool {
        let attempts = LOCK_WAIT.as_secs() / LOCK_POLL.as_secs();
        for _ in 0..attempts {
            let exec = self
                .shell
                .execute(
                    "lsof /var/lib/dpkg/lock-frontend /var/lib/dpkg/lock /var/cache/apt/archives/lock 2>&1 || echo no_lock",
                    None,
                    true,
                )
                .await;
            if exec.contains("no_lock") {
                return true;
            }
            debug!(target: LOG, "Package manager is locked, waiting...");
            tokio::time::sleep(LOCK_POLL).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExitStatus;
    use crate::test_env::ScriptedExecutor;

    #[tokio::test(start_paused = true)]
    async fn install_refreshes_first() {
        let shell = ScriptedExecutor::new();
        let apt = Apt::new(&shell);
        assert!(apt.install(&["curl", "jq"]).await.succeeded());
        let commands = shell.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].ends_with("apt-get update"));
        assert!(commands[1].ends_with("apt-get install -y curl jq"));
        assert!(commands[1].starts_with("DEBIAN_FRONTEND=noninteractive"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_stops_install() {
        let shell = ScriptedExecutor::new().on("apt-get update", Execution::failure("E: boom", 100));
        let apt = Apt::new(&shell);
        let result = apt.install(&["curl"]).await;
        assert_eq!(result.status, ExitStatus::Failure(100));
        assert_eq!(shell.commands().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_wait_polls_until_free() {
        let shell = ScriptedExecutor::new()
            .once("lsof", Execution::success("dpkg 123 root"))
            .on("lsof", Execution::success("no_lock"));
        let apt = Apt::new(&shell);
        assert!(apt.wait_for_lock().await);
        assert_eq!(shell.count("lsof"), 2);
    }
}
