// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::Path;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, error, info, warn};

use super::{log_failure, write_file, Action};
use crate::config::{Container, Topology};
use crate::container::{is_running, is_unprivileged, Pct};
use crate::remote::Executor;

const LOG: &str = "create_container";

/// Read the operator's public key from `~/.ssh`, preferring ed25519 over RSA.
pub fn operator_public_key() -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    ["id_ed25519.pub", "id_rsa.pub"]
        .iter()
        .map(|name| Path::new(&home).join(".ssh").join(name))
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

/// The home directory of `user` inside a unit.
fn home_of(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{user}")
    }
}

/// Append `key` to the authorized keys of `user` unless it is already there.
pub fn authorize_key(user: &str, key: &str) -> String {
    let dir = format!("{}/.ssh", home_of(user));
    let file = format!("{dir}/authorized_keys");
    format!(
        "mkdir -p {dir} && touch {file} && (grep -qxF '{key}' {file} || echo '{key}' >> {file}) \
         && chmod 700 {dir} && chmod 600 {file} && chown -R {user}:{user} {dir}"
    )
}

/// The create step of one unit: make sure the unit exists, runs, and is reachable over SSH.
///
/// A unit that already exists with the right privilege mode is only started if needed, so
/// running the step against a converged unit changes nothing.
pub struct CreateContainer<'a> {
    pct: &'a Pct<'a>,
    unit: &'a Container,
    topology: &'a Topology,
    public_key: Option<String>,
}

impl<'a> CreateContainer<'a> {
    pub fn new(pct: &'a Pct<'a>, unit: &'a Container, topology: &'a Topology) -> Self {
        CreateContainer {
            pct,
            unit,
            topology,
            public_key: operator_public_key(),
        }
    }

    /// Install `key` instead of the operator's own key.
    pub fn public_key(mut self, key: Option<String>) -> Self {
        self.public_key = key;
        self
    }

    async fn already_satisfied(&self) -> bool {
        let id = self.unit.id;
        if !self.pct.exists(id).await {
            return false;
        }
        let config = self.pct.config(id).await;
        if !config.succeeded() {
            warn!(target: LOG, "Could not read configuration of container {id}, recreating");
            return false;
        }
        if is_unprivileged(&config.output) == self.unit.privileged {
            info!(target: LOG, "Container {id} exists with the wrong privilege mode, recreating");
            return false;
        }

        info!(target: LOG, "Container {id} already exists with the expected configuration");
        if !is_running(&self.pct.status(id).await.output) {
            info!(target: LOG, "Starting container {id}...");
            let start = self.pct.start(id).await;
            if !start.succeeded() {
                log_failure(LOG, &format!("start of container {id}"), &start);
                return false;
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        true
    }

    async fn create(&self) -> bool {
        let unit = self.unit;
        let id = unit.id;
        if !self.pct.destroy_container(id).await {
            error!(target: LOG, "Container {id} could not be removed before recreation");
            return false;
        }
        let Some(template) = self.pct.resolve_template(unit, self.topology).await else {
            error!(target: LOG, "No template available for container {id}");
            return false;
        };
        let valid = self
            .pct
            .host()
            .run(&format!(
                "test -f {template} && test -r {template} && echo valid || echo invalid"
            ))
            .await;
        if valid.output.trim() != "valid" {
            error!(target: LOG, "Template {template} is missing or unreadable");
            return false;
        }

        info!(target: LOG, "Creating container {id} ({}) from {template}...", unit.name);
        let create = self.pct.create(unit, &template, self.topology).await;
        if !create.succeeded() {
            log_failure(LOG, &format!("creation of container {id}"), &create);
            return false;
        }
        let features = self.pct.set_features(id, unit.nested).await;
        if !features.succeeded() {
            warn!(target: LOG, "Failed to set features on container {id}: {}", features.tail(200));
        }
        let onboot = self.pct.set_onboot(id, unit.autostart).await;
        if !onboot.succeeded() {
            log_failure(LOG, &format!("autostart of container {id}"), &onboot);
            return false;
        }
        let start = self.pct.start(id).await;
        if !start.succeeded() {
            log_failure(LOG, &format!("start of container {id}"), &start);
            return false;
        }

        let ping = self
            .pct
            .exec(id, "ping -c 1 8.8.8.8", Some(Duration::from_secs(10)))
            .await;
        if !ping.succeeded() {
            warn!(target: LOG, "Container {id} has no outside connectivity yet");
        }
        true
    }

    async fn setup_users(&self, shell: &dyn Executor) -> bool {
        for user in self.topology.users.iter() {
            let name = &user.name;
            let add = shell
                .run(&format!(
                    "id -u {name} >/dev/null 2>&1 || useradd -m -s /bin/bash -G {} {name}",
                    user.sudo_group
                ))
                .await;
            if !add.succeeded() {
                log_failure(LOG, &format!("creation of user {name}"), &add);
                return false;
            }
            if let Some(password) = &user.password {
                let chpasswd = shell
                    .run(&format!("echo '{name}:{password}' | chpasswd"))
                    .await;
                if !chpasswd.succeeded() {
                    log_failure(LOG, &format!("password of user {name}"), &chpasswd);
                    return false;
                }
            }
            let sudoers = format!("/etc/sudoers.d/{name}");
            let drop_in = shell
                .run(&format!(
                    "{} && chmod 440 {sudoers}",
                    write_file(&sudoers, &format!("{name} ALL=(ALL) NOPASSWD: ALL\n"))
                ))
                .await;
            if !drop_in.succeeded() {
                log_failure(LOG, &format!("sudoers entry of user {name}"), &drop_in);
                return false;
            }
        }
        true
    }

    async fn setup_ssh(&self, shell: &dyn Executor) -> bool {
        match &self.public_key {
            Some(key) => {
                let mut users = vec![self.topology.default_user()];
                if !users.contains(&"root") {
                    users.push("root");
                }
                for user in users {
                    let exec = shell.run(&authorize_key(user, key)).await;
                    if !exec.succeeded() {
                        log_failure(LOG, &format!("SSH key for {user}"), &exec);
                        return false;
                    }
                }
            }
            None => warn!(target: LOG, "No public key found in ~/.ssh, skipping key installation"),
        }

        let installed = shell
            .run("dpkg -l | grep -q '^ii.*openssh-server' || echo not_installed")
            .await;
        if installed.contains("not_installed") {
            info!(target: LOG, "Installing openssh-server in container {}...", self.unit.id);
            let install = shell
                .run_for(
                    "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq openssh-server",
                    Duration::from_secs(300),
                )
                .await;
            if !install.succeeded() {
                log_failure(LOG, "openssh-server installation", &install);
                return false;
            }
        }
        let enable = shell.run("systemctl enable ssh && systemctl start ssh").await;
        if !enable.succeeded() {
            log_failure(LOG, "SSH service start", &enable);
            return false;
        }
        true
    }

    async fn wait_ready(&self, shell: &dyn Executor) -> bool {
        let id = self.unit.id;
        let ip = self.unit.ip_address;
        let attempts = self.topology.waits.container_ready_max_attempts;
        let sleep = self.topology.container_ready_sleep();
        for attempt in 1..=attempts {
            let running = is_running(&self.pct.status(id).await.output);
            let ping = running
                && self
                    .pct
                    .host()
                    .run(&format!("ping -c 1 -W 2 {ip}"))
                    .await
                    .contains("1 received");
            let echo = ping && shell.run("echo ready").await.output.trim() == "ready";
            if echo {
                info!(target: LOG, "Container {id} is ready");
                return true;
            }
            debug!(
                target: LOG,
                "Container {id} not ready (running: {running}, ping: {ping}), attempt {attempt}/{attempts}"
            );
            if attempt < attempts {
                tokio::time::sleep(sleep).await;
            }
        }
        error!(target: LOG, "Container {id} did not become ready after {attempts} attempts");
        false
    }

    async fn run(&self) -> bool {
        if self.already_satisfied().await {
            return true;
        }
        if !self.create().await {
            return false;
        }
        let shell = self.pct.unit(self.unit.id);
        self.setup_users(&shell).await
            && self.setup_ssh(&shell).await
            && self.wait_ready(&shell).await
    }
}

impl Action for CreateContainer<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "create container".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_appended_once() {
        let command = authorize_key("jaime", "ssh-ed25519 AAAA op@laptop");
        assert!(command.starts_with("mkdir -p /home/jaime/.ssh && "));
        assert!(command.contains(
            "(grep -qxF 'ssh-ed25519 AAAA op@laptop' /home/jaime/.ssh/authorized_keys || echo"
        ));
        assert!(authorize_key("root", "k").contains("/root/.ssh/authorized_keys"));
    }
}
