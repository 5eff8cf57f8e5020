// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The apt-cacher-ng package cache that every other unit installs packages through.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, error, info, warn};

use super::{is_active, log_failure, missing, write_file, Action, ActionParams};
use crate::apt::Apt;
use crate::config::{Container, Topology};
use crate::remote::Executor;

const CONFIG_FILE: &str = "/etc/apt-cacher-ng/acng.conf";

/// Cache settings that keep downloads alive over slow upstream mirrors.
const TUNING: [(&str, &str); 3] = [
    ("DlMaxRetries", "5"),
    ("NetworkTimeout", "120"),
    ("DisconnectTimeout", "30"),
];

/// The port the cache listens on: the unit's own `port` parameter, else the service setting.
fn cache_port(unit: Option<&Container>, topology: &Topology) -> u16 {
    unit.and_then(|u| u.param_u16("port"))
        .unwrap_or_else(|| topology.apt_cache_port())
}

struct Install<'a> {
    shell: Option<&'a dyn Executor>,
    apt: Option<&'a Apt<'a>>,
}

const INSTALL: &str = "install_apt_cacher";

impl Install<'_> {
    async fn run(&self) -> bool {
        let (Some(shell), Some(apt)) = (self.shell, self.apt) else {
            error!(target: INSTALL, "Shell or APT session not available");
            return false;
        };

        let update = apt.update().await;
        if !update.succeeded() {
            log_failure(INSTALL, "apt update", &update);
            return false;
        }

        let preseed = shell
            .run(
                "echo 'apt-cacher-ng apt-cacher-ng/tunnelenable boolean false' | debconf-set-selections && \
                 echo 'apt-cacher-ng apt-cacher-ng/bindaddress string 0.0.0.0' | debconf-set-selections",
            )
            .await;
        if !preseed.succeeded() {
            warn!(target: INSTALL, "debconf preseed had issues: {}", preseed.tail(200));
        }

        info!(target: INSTALL, "Installing apt-cacher-ng...");
        let install = shell
            .run_for(
                "DEBIAN_PRIORITY=critical DEBIAN_FRONTEND=noninteractive apt-get install -y \
                 -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold apt-cacher-ng < /dev/null",
                Duration::from_secs(600),
            )
            .await;
        if !install.succeeded() {
            log_failure(INSTALL, "apt-cacher-ng installation", &install);
            return false;
        }

        let check = shell
            .run(
                "systemctl list-unit-files apt-cacher-ng.service | grep -q apt-cacher-ng.service && echo exists || echo missing",
            )
            .await;
        if !check.contains("exists") {
            error!(target: INSTALL, "apt-cacher-ng service unit not found after installation");
            return false;
        }
        true
    }
}

impl Action for Install<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "apt-cacher-ng installation".to_string()
    }
}

pub fn install<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Install {
        shell: p.shell,
        apt: p.apt,
    })
}

struct ConfigurePort<'a> {
    shell: Option<&'a dyn Executor>,
    port: u16,
}

const PORT: &str = "config_apt_cacher_port";

/// Command that sets `key: value` in the cache config, uncommenting or appending as needed.
fn set_setting(key: &str, value: &str) -> String {
    format!(
        "if grep -qE '^#?\\s*{key}:' {CONFIG_FILE}; then \
         sed -i -E 's|^#?\\s*{key}:.*|{key}: {value}|' {CONFIG_FILE}; \
         else echo '{key}: {value}' >> {CONFIG_FILE}; fi"
    )
}

impl ConfigurePort<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(PORT, "Shell")) else {
            return false;
        };
        let port = self.port;

        shell.run("mkdir -p /etc/apt-cacher-ng").await;
        let set_port = shell
            .run(&format!("touch {CONFIG_FILE} && {}", set_setting("Port", &port.to_string())))
            .await;
        if !set_port.succeeded() {
            log_failure(PORT, "port configuration", &set_port);
            return false;
        }
        for (key, value) in TUNING {
            let exec = shell.run(&set_setting(key, value)).await;
            if !exec.succeeded() {
                warn!(target: PORT, "Setting {key} had issues: {}", exec.tail(200));
            }
        }

        if port < 1024 {
            let cap = shell
                .run("setcap 'cap_net_bind_service=+ep' /usr/sbin/apt-cacher-ng")
                .await;
            if !cap.succeeded() {
                warn!(target: PORT, "setcap for privileged port {port} had issues: {}", cap.tail(200));
            }
        }

        let restart = shell.run("systemctl restart apt-cacher-ng").await;
        if !restart.succeeded() {
            log_failure(PORT, "apt-cacher-ng restart", &restart);
            return false;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let active = shell.run("systemctl is-active apt-cacher-ng").await;
        if !is_active(&active.output) {
            let journal = shell
                .run("journalctl -u apt-cacher-ng --no-pager -n 20 2>&1")
                .await;
            error!(target: PORT, "apt-cacher-ng is not active after restart: {}", journal.output);
            return false;
        }

        let listening = shell.run(&format!("ss -tlnp | grep -q ':{port} '")).await;
        if !listening.succeeded() {
            error!(target: PORT, "apt-cacher-ng is not listening on port {port}");
            return false;
        }
        info!(target: PORT, "apt-cacher-ng listening on port {port}");
        true
    }
}

impl Action for ConfigurePort<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "apt-cacher-ng port configuration".to_string()
    }
}

pub fn configure_port<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(ConfigurePort {
        shell: p.shell,
        port: cache_port(p.unit, p.topology),
    })
}

struct EnableService<'a> {
    shell: Option<&'a dyn Executor>,
}

const ENABLE: &str = "enable_apt_cacher_service";

impl EnableService<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(ENABLE, "Shell")) else {
            return false;
        };
        let enable = shell.run("systemctl enable apt-cacher-ng").await;
        if !enable.succeeded() {
            log_failure(ENABLE, "enable apt-cacher-ng", &enable);
            return false;
        }
        let restart = shell.run("systemctl restart apt-cacher-ng").await;
        if !restart.succeeded() {
            log_failure(ENABLE, "restart apt-cacher-ng", &restart);
            return false;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            let active = shell.run("systemctl is-active apt-cacher-ng").await;
            if is_active(&active.output) {
                return true;
            }
        }
        let status = shell
            .run("systemctl status apt-cacher-ng --no-pager -l 2>&1 | head -20")
            .await;
        error!(target: ENABLE, "apt-cacher-ng is not active: {}", status.output);
        false
    }
}

impl Action for EnableService<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "apt-cacher-ng service enablement".to_string()
    }
}

pub fn enable_service<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(EnableService { shell: p.shell })
}

struct WaitReady<'a> {
    shell: Option<&'a dyn Executor>,
    port: u16,
}

const READY: &str = "wait_apt_cache_ready";
const READY_ATTEMPTS: u32 = 20;

impl WaitReady<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(READY, "Shell")) else {
            return false;
        };
        let port = self.port;
        let port_check = format!("nc -z localhost {port} && echo port_open || echo port_closed");
        let report_check = format!(
            "timeout 10 wget -qO- 'http://127.0.0.1:{port}/acng-report.html' 2>&1 | grep -q 'Apt-Cacher NG' && echo working || echo not_working"
        );

        for attempt in 1..=READY_ATTEMPTS {
            let active = shell
                .run("systemctl is-active apt-cacher-ng 2>/dev/null || echo inactive")
                .await;
            if is_active(&active.output) {
                let open = shell.run(&port_check).await;
                if open.contains("port_open") {
                    let report = shell.run(&report_check).await;
                    if report.output.trim().ends_with("working")
                        && !report.contains("not_working")
                    {
                        info!(target: READY, "apt-cacher-ng is ready on port {port}");
                        return true;
                    }
                    debug!(target: READY, "apt-cacher-ng report page not answering yet");
                }
            } else if attempt == 1 {
                info!(target: READY, "apt-cacher-ng is not active, starting it");
                shell.run("systemctl start apt-cacher-ng").await;
            }
            if attempt < READY_ATTEMPTS {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }

        let status = shell
            .run("systemctl status apt-cacher-ng --no-pager -l 2>&1 | head -20")
            .await;
        let journal = shell
            .run("journalctl -u apt-cacher-ng --no-pager -n 30 2>&1")
            .await;
        error!(
            target: READY,
            "apt-cacher-ng not ready after {READY_ATTEMPTS} attempts\nstatus: {}\njournal: {}",
            status.output,
            journal.output
        );
        false
    }
}

impl Action for WaitReady<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "wait apt-cache ready".to_string()
    }
}

pub fn wait_ready<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(WaitReady {
        shell: p.shell,
        port: cache_port(p.unit, p.topology),
    })
}

struct ConfigureProxy<'a> {
    shell: Option<&'a dyn Executor>,
    topology: &'a Topology,
}

const PROXY: &str = "configure_apt_proxy";

impl ConfigureProxy<'_> {
    async fn run(&self) -> bool {
        let Some(cache) = self.topology.apt_cache() else {
            debug!(target: PROXY, "No apt-cache unit declared, skipping proxy configuration");
            return true;
        };
        let Some(shell) = self.shell.or_else(|| missing(PROXY, "Shell")) else {
            return false;
        };
        let proxy = format!(
            "Acquire::http::Proxy \"http://{}:{}\";\n",
            cache.ip_address,
            cache_port(Some(cache), self.topology)
        );
        let exec = shell
            .run(&write_file("/etc/apt/apt.conf.d/01proxy", &proxy))
            .await;
        if !exec.succeeded() {
            log_failure(PROXY, "apt proxy configuration", &exec);
            return false;
        }
        true
    }
}

impl Action for ConfigureProxy<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "apt cache proxy configuration".to_string()
    }
}

pub fn configure_proxy<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(ConfigureProxy {
        shell: p.shell,
        topology: p.topology,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{encode, Execution};
    use crate::test_env::{topology, ScriptedExecutor};

    #[test]
    fn settings_uncomment_or_append() {
        let command = set_setting("Port", "3142");
        assert!(command.contains("s|^#?\\s*Port:.*|Port: 3142|"));
        assert!(command.contains("echo 'Port: 3142' >> /etc/apt-cacher-ng/acng.conf"));
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_points_at_the_cache_unit() {
        let topology = topology("scenario_a.toml", "dev");
        let shell = ScriptedExecutor::new();
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        assert!(configure_proxy(params).execute().await);

        let commands = shell.commands();
        assert_eq!(commands.len(), 1);
        let encoded = commands[0]
            .split_whitespace()
            .nth(5)
            .unwrap_or_default()
            .to_string();
        let content = encode::decode(&encoded).unwrap();
        assert_eq!(content, "Acquire::http::Proxy \"http://10.20.0.10:3142\";\n");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_starts_an_inactive_service_once() {
        let topology = topology("scenario_a.toml", "dev");
        let shell = ScriptedExecutor::new()
            .once("is-active", Execution::success("inactive"))
            .on("is-active", Execution::success("active"))
            .on("nc -z", Execution::success("port_open"))
            .on("acng-report", Execution::success("working"));
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        assert!(wait_ready(params).execute().await);
        assert_eq!(shell.count("systemctl start apt-cacher-ng"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_gives_up() {
        let topology = topology("scenario_a.toml", "dev");
        let shell = ScriptedExecutor::new()
            .on("is-active", Execution::success("active"))
            .on("nc -z", Execution::success("port_closed"));
        let mut params = ActionParams::bare(&topology);
        params.shell = Some(&shell);
        assert!(!wait_ready(params).execute().await);
        assert_eq!(shell.count("nc -z"), READY_ATTEMPTS as usize);
        assert!(shell.ran("journalctl -u apt-cacher-ng"));
    }
}
