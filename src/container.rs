// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, info, warn};

use crate::config::{Container, Topology};
use crate::remote::{encode, Execution, Executor};

const LOG: &str = "pct";

/// The `pct` command line on the control host: lifecycle of compute units, and running commands
/// inside them.
///
/// Every command destined for the inside of a unit is transport encoded and wrapped as
/// `pct exec <id> -- bash -c "echo <encoded> | base64 -d | bash"`, so whatever quoting the inner
/// command carries never reaches the host shell.
pub struct Pct<'a> {
    host: &'a dyn Executor,
}

/// `pct status` reports a running unit.
pub fn is_running(status: &str) -> bool {
    status.contains("status: running")
}

/// `pct config` reports an unprivileged unit.
pub fn is_unprivileged(config: &str) -> bool {
    config.contains("unprivileged: 1")
}

/// `pct list | grep '^<id> '` found the unit.
fn listed(output: &str, id: u32) -> bool {
    output
        .lines()
        .any(|line| line.split_whitespace().next() == Some(id.to_string().as_str()))
}

/// Extract the unit ids from the output of `pct list`.
pub fn parse_list(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|first| first.parse().ok())
        .collect()
}

impl<'a> Pct<'a> {
    pub fn new(host: &'a dyn Executor) -> Self {
        Pct { host }
    }

    /// The control-host executor this adapter runs `pct` through.
    pub fn host(&self) -> &'a dyn Executor {
        self.host
    }

    pub fn exec_command(id: u32, command: &str) -> String {
        format!(
            "pct exec {id} -- bash -c \"{}\"",
            encode::decode_pipeline(command)
        )
    }

    /// Run `command` inside unit `id`.
    pub async fn exec(&self, id: u32, command: &str, timeout: Option<Duration>) -> Execution {
        debug!(target: LOG, "Running in container {id}: {command}");
        let wrapped = Self::exec_command(id, command);
        self.host.execute(&wrapped, timeout, false).await
    }

    /// An `Executor` whose commands run inside unit `id`.
    pub fn unit(&self, id: u32) -> UnitShell<'_> {
        UnitShell { pct: self, id }
    }

    pub async fn create(
        &self,
        unit: &Container,
        template_path: &str,
        topology: &Topology,
    ) -> Execution {
        let command = format!(
            "pct create {} {} --hostname {} --memory {} --swap {} --cores {} \
             --net0 name=eth0,bridge={},ip={}/{},gw={} --rootfs {}:{} --unprivileged {} \
             --ostype ubuntu --arch amd64",
            unit.id,
            template_path,
            unit.hostname,
            unit.resources.memory,
            unit.resources.swap,
            unit.resources.cores,
            topology.lxc.bridge,
            unit.ip_address,
            topology.prefix_length(),
            topology.gateway,
            topology.lxc.storage,
            unit.resources.rootfs_size,
            if unit.privileged { 0 } else { 1 },
        );
        self.host.execute(&command, None, false).await
    }

    pub async fn set_features(&self, id: u32, nesting: bool) -> Execution {
        let command = format!(
            "pct set {id} --features nesting={},keyctl=1,fuse=1",
            u8::from(nesting)
        );
        self.host.run(&command).await
    }

    pub async fn set_onboot(&self, id: u32, onboot: bool) -> Execution {
        self.host
            .run(&format!("pct set {id} --onboot {}", u8::from(onboot)))
            .await
    }

    pub async fn start(&self, id: u32) -> Execution {
        self.host.run(&format!("pct start {id}")).await
    }

    pub async fn stop(&self, id: u32, force: bool) -> Execution {
        let command = if force {
            format!("pct stop {id} --force")
        } else {
            format!("pct stop {id}")
        };
        self.host.run(&command).await
    }

    pub async fn status(&self, id: u32) -> Execution {
        self.host.run(&format!("pct status {id}")).await
    }

    pub async fn list(&self) -> Execution {
        self.host.run("pct list").await
    }

    pub async fn destroy(&self, id: u32, force: bool) -> Execution {
        let command = if force {
            format!("pct destroy {id} --force")
        } else {
            format!("pct destroy {id}")
        };
        self.host.run(&command).await
    }

    pub async fn config(&self, id: u32) -> Execution {
        self.host.run(&format!("pct config {id}")).await
    }

    /// Copy `src` on the host into unit `id` at `dst`.
    pub async fn push(&self, id: u32, src: &str, dst: &str) -> Execution {
        self.host
            .run(&format!("pct push {id} {src} {dst}"))
            .await
    }

    /// Copy `src` inside unit `id` to `dst` on the host.
    pub async fn pull(&self, id: u32, src: &str, dst: &str) -> Execution {
        self.host
            .run(&format!("pct pull {id} {src} {dst}"))
            .await
    }

    pub async fn exists(&self, id: u32) -> bool {
        let exec = self
            .host
            .run(&format!("pct list | grep '^{id} ' || echo not_found"))
            .await;
        listed(&exec.output, id)
    }

    /// Stop and destroy unit `id`, falling back to a forced destroy. Returns whether the unit is
    /// gone afterwards; a unit that never existed counts as destroyed.
    pub async fn destroy_container(&self, id: u32) -> bool {
        if !self.exists(id).await {
            debug!(target: LOG, "Container {id} does not exist, skipping");
            return true;
        }

        info!(target: LOG, "Stopping and destroying container {id}...");
        self.host
            .run(&format!("pct stop {id} 2>/dev/null || true"))
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        if !self.destroy(id, false).await.succeeded() {
            warn!(target: LOG, "Destroy of container {id} failed, trying force destroy...");
            self.destroy(id, true).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if self.exists(id).await {
            warn!(target: LOG, "Container {id} still exists after destruction attempt");
            false
        } else {
            info!(target: LOG, "Container {id} destroyed");
            true
        }
    }

    async fn file_exists(&self, path: &str) -> bool {
        self.host
            .run(&format!("test -f {path} && echo exists || echo missing"))
            .await
            .output
            .trim()
            == "exists"
    }

    /// Find a base template archive on the host, downloading the last configured one when none
    /// is present. Returns the archive name.
    pub async fn base_template(&self, topology: &Topology) -> Option<String> {
        let dir = &topology.lxc.template_dir;
        let bases = &topology.template_config.base;
        for name in bases.iter() {
            if self.file_exists(&format!("{dir}/{name}")).await {
                return Some(name.clone());
            }
        }

        let name = bases.last()?;
        info!(target: "template", "Base template not found. Downloading {name}...");
        let download = self
            .host
            .run_for(
                &format!("pveam download local {name}"),
                Duration::from_secs(300),
            )
            .await;
        if !self.file_exists(&format!("{dir}/{name}")).await {
            warn!(
                target: "template",
                "Template {name} download failed ({:?}): {}",
                download.status,
                download.tail(500)
            );
            return None;
        }
        info!(target: "template", "Template {name} downloaded successfully");
        Some(name.clone())
    }

    /// Resolve the template archive path a unit is created from.
    ///
    /// An explicit archive name is used as is, the name of a template unit resolves to the newest
    /// archive that unit produced, and anything else falls back to a base template.
    pub async fn resolve_template(&self, unit: &Container, topology: &Topology) -> Option<String> {
        let dir = &topology.lxc.template_dir;
        if let Some(template) = &unit.template {
            if template.contains(".tar") {
                return Some(format!("{dir}/{template}"));
            }
            if topology.templates.iter().any(|t| &t.name == template) {
                let found = self
                    .host
                    .run(&format!(
                        "ls -t {dir}/{template}*.tar.zst 2>/dev/null | head -1 | xargs basename 2>/dev/null"
                    ))
                    .await;
                let file = found.output.trim();
                if found.succeeded() && !file.is_empty() {
                    return Some(format!("{dir}/{file}"));
                }
                warn!(
                    target: "template",
                    "No archive found for template '{template}', using base template"
                );
            }
        }
        let base = self.base_template(topology).await?;
        Some(format!("{dir}/{base}"))
    }
}

/// Commands run inside one compute unit, through `pct exec` on the control host.
///
/// Commands inside a unit already run as root, so escalation is a no-op.
pub struct UnitShell<'p> {
    pct: &'p Pct<'p>,
    id: u32,
}

impl UnitShell<'_> {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Executor for UnitShell<'_> {
    fn execute<'a>(
        &'a self,
        command: &'a str,
        timeout: Option<Duration>,
        _escalate: bool,
    ) -> LocalBoxFuture<'a, Execution> {
        self.pct.exec(self.id, command, timeout).boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_wraps_the_encoded_command() {
        let wrapped = Pct::exec_command(3001, "echo 'a' && echo \"b\"");
        assert!(wrapped.starts_with("pct exec 3001 -- bash -c \"echo "));
        assert!(wrapped.ends_with(" | base64 -d | bash\""));
        assert!(!wrapped.contains("'a'"));
    }

    #[test]
    fn list_parsing_skips_the_header() {
        let output = "VMID       Status     Lock         Name\n\
                      3001       running                 apt-cache\n\
                      3011       stopped                 k3s-control";
        assert_eq!(parse_list(output), vec![3001, 3011]);
        assert!(listed("3001       running   apt-cache", 3001));
        assert!(!listed("30011      running   other", 3001));
        assert!(!listed("not_found", 3001));
    }

    #[test]
    fn status_predicates() {
        assert!(is_running("status: running"));
        assert!(!is_running("status: stopped"));
        assert!(is_unprivileged("arch: amd64\nunprivileged: 1"));
        assert!(!is_unprivileged("arch: amd64"));
    }
}
