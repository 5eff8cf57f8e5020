// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{error, info, warn};

use super::{log_failure, missing, poll, write_file, Action, ActionParams};
use crate::apt::Apt;
use crate::cluster::{self, kmsg_unit_fix, kubeconfig_fix, verify, watcher, KMSG_LINK};
use crate::config::{Container, Topology};
use crate::container::Pct;
use crate::remote::Executor;

const INSTALL_K3S: &str = "install_k3s";

/// The k3s server configuration of a control unit.
pub fn server_config(unit: &Container) -> String {
    format!(
        "tls-san:\n  - {ip}\n  - {host}\nbind-address: 0.0.0.0\nadvertise-address: {ip}\n",
        ip = unit.ip_address,
        host = unit.hostname
    )
}

/// Install the k3s server on the cluster control unit. Workers are skipped here: they get their
/// agent when the cluster is converged, since they need the control unit's token.
struct InstallK3s<'a> {
    shell: Option<&'a dyn Executor>,
    apt: Option<&'a Apt<'a>>,
    unit: Option<&'a Container>,
    topology: &'a Topology,
}

impl InstallK3s<'_> {
    async fn installed(shell: &dyn Executor) -> bool {
        let version = shell.run("command -v k3s >/dev/null 2>&1 && k3s --version").await;
        version.succeeded() && version.output.to_lowercase().contains("k3s")
    }

    async fn ensure_kmsg(shell: &dyn Executor) -> bool {
        let link = shell
            .execute(
                &format!("{KMSG_LINK} && test -L /dev/kmsg && echo symlink_ok || echo symlink_failed"),
                None,
                true,
            )
            .await;
        if !link.contains("symlink_ok") {
            error!(target: INSTALL_K3S, "/dev/kmsg symlink creation failed: {}", link.tail(200));
            return false;
        }
        true
    }

    async fn run(&self) -> bool {
        let Some(unit) = self.unit.or_else(|| missing(INSTALL_K3S, "Container configuration"))
        else {
            return false;
        };
        if !self.topology.is_cluster_control(unit.id) {
            info!(target: INSTALL_K3S, "Skipping k3s on worker {}, the agent is installed when the cluster is set up", unit.hostname);
            return true;
        }
        let Some(shell) = self.shell.or_else(|| missing(INSTALL_K3S, "Shell")) else {
            return false;
        };

        if Self::installed(shell).await {
            info!(target: INSTALL_K3S, "k3s already installed on {}", unit.hostname);
            return Self::ensure_kmsg(shell).await;
        }

        let curl = shell.run("command -v curl").await;
        if !curl.succeeded() {
            let Some(apt) = self.apt.or_else(|| missing(INSTALL_K3S, "APT session")) else {
                return false;
            };
            info!(target: INSTALL_K3S, "curl not found, installing...");
            let exec = apt.install(&["curl"]).await;
            if !exec.succeeded() {
                log_failure(INSTALL_K3S, "curl installation", &exec);
                return false;
            }
        }

        if !Self::ensure_kmsg(shell).await {
            return false;
        }

        info!(target: INSTALL_K3S, "Installing k3s server on {}...", unit.hostname);
        let config = shell
            .execute(
                &write_file("/etc/rancher/k3s/config.yaml", &server_config(unit)),
                None,
                true,
            )
            .await;
        if !config.succeeded() {
            log_failure(INSTALL_K3S, "k3s config file creation", &config);
            return false;
        }
        let install = shell
            .run_for("curl -sfL https://get.k3s.io | sh - 2>&1", Duration::from_secs(300))
            .await;
        if !install.succeeded() {
            log_failure(INSTALL_K3S, "k3s installation", &install);
            return false;
        }
        if !Self::installed(shell).await {
            error!(target: INSTALL_K3S, "k3s installation failed, k3s command not found");
            return false;
        }

        let fix = shell
            .execute(&kmsg_unit_fix("/etc/systemd/system/k3s.service"), None, true)
            .await;
        if !fix.succeeded() {
            log_failure(INSTALL_K3S, "k3s.service /dev/kmsg fix", &fix);
            return false;
        }
        let reload = shell.execute("systemctl daemon-reload", None, true).await;
        if !reload.succeeded() {
            log_failure(INSTALL_K3S, "systemd daemon-reload", &reload);
            return false;
        }

        shell
            .execute("ln -sf /usr/local/bin/kubectl /usr/bin/kubectl || true", None, true)
            .await;
        let kubeconfig = poll(Duration::from_secs(60), Duration::from_secs(2), move || async move {
            shell
                .run("test -f /etc/rancher/k3s/k3s.yaml && echo exists || echo missing")
                .await
                .output
                .trim()
                == "exists"
        })
        .await;
        if !kubeconfig {
            error!(target: INSTALL_K3S, "k3s kubeconfig was not created");
            return false;
        }
        let copy = shell
            .execute(
                &format!(
                    "{} && mkdir -p /root/.kube && cp /etc/rancher/k3s/k3s.yaml /root/.kube/config && chmod 600 /root/.kube/config",
                    kubeconfig_fix(&unit.ip_address.to_string())
                ),
                None,
                true,
            )
            .await;
        if !copy.succeeded() {
            log_failure(INSTALL_K3S, "kubeconfig setup", &copy);
            return false;
        }
        info!(target: INSTALL_K3S, "k3s server installed on {}", unit.hostname);
        true
    }
}

impl Action for InstallK3s<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "k3s installation".to_string()
    }
}

pub fn install_k3s<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(InstallK3s {
        shell: p.shell,
        apt: p.apt,
        unit: p.unit,
        topology: p.topology,
    })
}

/// Install the periodic node repair job. As a unit action it only applies to the control unit;
/// as a cluster action it is handed the control unit's shell.
struct InstallNodeWatcher<'a> {
    shell: Option<&'a dyn Executor>,
    unit: Option<&'a Container>,
    topology: &'a Topology,
}

impl InstallNodeWatcher<'_> {
    async fn run(&self) -> bool {
        if let Some(unit) = self.unit {
            if !self.topology.is_cluster_control(unit.id) {
                info!(target: "k3s-watcher", "{} is not a control node, skipping node watcher", unit.hostname);
                return true;
            }
        }
        let Some(shell) = self.shell.or_else(|| missing("k3s-watcher", "Shell")) else {
            return false;
        };
        watcher::install_watcher(shell).await
    }
}

impl Action for InstallNodeWatcher<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "k3s node watcher installation".to_string()
    }
}

pub fn install_node_watcher<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(InstallNodeWatcher {
        shell: p.shell,
        unit: p.unit,
        topology: p.topology,
    })
}

/// Converge the whole cluster, then give it a moment and verify it once more.
struct SetupKubernetes<'a> {
    pct: Option<&'a Pct<'a>>,
    topology: &'a Topology,
}

impl SetupKubernetes<'_> {
    async fn run(&self) -> bool {
        let Some(pct) = self.pct.or_else(|| missing("kubernetes", "PCT adapter")) else {
            return false;
        };
        if !cluster::deploy_kubernetes(pct, self.topology).await {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        if !verify::verify_cluster(pct, self.topology).await {
            warn!(target: "kubernetes", "Cluster verification reported issues");
        }
        true
    }
}

impl Action for SetupKubernetes<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "setup kubernetes".to_string()
    }
}

pub fn setup_kubernetes<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(SetupKubernetes {
        pct: p.pct,
        topology: p.topology,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Execution;
    use crate::test_env::{topology, ScriptedExecutor};

    #[test]
    fn server_config_names_the_control_unit() {
        let topology = topology("cluster.toml", "dev");
        let control = topology.cluster_control().unwrap();
        let config = server_config(control);
        assert!(config.contains("  - 10.20.0.11\n"));
        assert!(config.contains("  - k3s-control\n"));
        assert!(config.ends_with("advertise-address: 10.20.0.11\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn workers_are_left_for_cluster_setup() {
        let topology = topology("cluster.toml", "dev");
        let worker = topology.cluster_workers()[0];
        let shell = ScriptedExecutor::new();
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        params.unit = Some(worker);
        assert!(install_k3s(params).execute().await);
        assert!(shell.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn installed_server_is_not_reinstalled() {
        let topology = topology("cluster.toml", "dev");
        let control = topology.cluster_control().unwrap();
        let shell = ScriptedExecutor::new()
            .on("k3s --version", Execution::success("k3s version v1.30.4+k3s1"))
            .on("symlink_ok", Execution::success("symlink_ok"));
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        params.unit = Some(control);
        assert!(install_k3s(params).execute().await);
        assert!(!shell.ran("get.k3s.io"));
    }
}
