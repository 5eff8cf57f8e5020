// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Base system preparation of a compute unit, and turning a unit into a template archive.

use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, error, info, warn};

use super::{log_failure, missing, write_file, Action, ActionParams, Script, ScriptStep};
use crate::apt::Apt;
use crate::config::{Container, Topology};
use crate::container::Pct;
use crate::remote::Executor;

/// Install a fixed package list through the unit's package manager.
pub struct AptInstall<'a> {
    label: &'static str,
    target: &'static str,
    apt: Option<&'a Apt<'a>>,
    packages: Vec<String>,
}

impl<'a> AptInstall<'a> {
    pub fn new(
        label: &'static str,
        target: &'static str,
        apt: Option<&'a Apt<'a>>,
        packages: Vec<String>,
    ) -> Self {
        AptInstall {
            label,
            target,
            apt,
            packages,
        }
    }

    async fn run(&self) -> bool {
        let Some(apt) = self.apt.or_else(|| missing(self.target, "APT session")) else {
            return false;
        };
        info!(target: self.target, "Installing {}...", self.packages.join(" "));
        let packages: Vec<&str> = self.packages.iter().map(String::as_str).collect();
        let exec = apt.install(&packages).await;
        if !exec.succeeded() {
            log_failure(self.target, &format!("{} installation", self.packages.join(" ")), &exec);
            return false;
        }
        true
    }
}

impl Action for AptInstall<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        self.label.to_string()
    }
}

pub fn base_tools<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(AptInstall::new(
        "base tools installation",
        "install_base_tools",
        p.apt,
        vec!["ca-certificates".to_string(), "curl".to_string()],
    ))
}

pub fn openssh_server<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(AptInstall::new(
        "openssh-server installation",
        "install_openssh_server",
        p.apt,
        vec!["openssh-server".to_string()],
    ))
}

pub fn ssh_service<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Script::new(
        "SSH service enablement",
        "enable_ssh_service",
        p.shell,
        vec![
            ScriptStep::new("enable ssh service", "systemctl enable ssh"),
            ScriptStep::new("start ssh service", "systemctl start ssh"),
        ],
    ))
}

const APPARMOR_STUB: &str = r#"APPARMOR_BIN=/usr/sbin/apparmor_parser
if command -v dpkg-divert && [ -f "$APPARMOR_BIN" ]; then
  dpkg-divert --quiet --local --rename --add "$APPARMOR_BIN" || true
  if [ -f "$APPARMOR_BIN.distrib" ]; then
    cat <<'APPARMOR_STUB' > "$APPARMOR_BIN"
#!/bin/sh
if [ "$1" = "--version" ] || [ "$1" = "-V" ]; then
  exec /usr/sbin/apparmor_parser.distrib "$@"
fi
exit 0
APPARMOR_STUB
    chmod +x "$APPARMOR_BIN" || true
  fi
fi
echo apparmor_stub_done"#;

/// Replace `apparmor_parser` with a stub that accepts every profile, since units cannot load
/// AppArmor profiles.
pub fn apparmor_parser_stub<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(
        Script::new(
            "AppArmor parser stub",
            "apparmor_parser_stub",
            p.shell,
            vec![ScriptStep::new("AppArmor parser stub", APPARMOR_STUB)],
        )
        .timeout(Duration::from_secs(60)),
    )
}

pub fn disable_apt_units<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Script::new(
        "disable automatic apt units",
        "disable_apt_units",
        p.shell,
        vec![ScriptStep::new(
            "disable automatic apt units",
            "for unit in apt-daily.service apt-daily.timer apt-daily-upgrade.service apt-daily-upgrade.timer; \
             do systemctl stop \"$unit\" || true; systemctl disable \"$unit\" || true; systemctl mask \"$unit\" || true; done",
        )],
    ))
}

pub fn sysctl_override<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Script::new(
        "systemd sysctl override",
        "sysctl_override",
        p.shell,
        vec![
            ScriptStep::new(
                "write sysctl override",
                write_file(
                    "/etc/systemd/system/systemd-sysctl.service.d/override.conf",
                    "[Service]\nImportCredential=\n",
                ),
            ),
            ScriptStep::new(
                "reload systemd-sysctl",
                "systemctl daemon-reload && systemctl stop systemd-sysctl.service || true && systemctl start systemd-sysctl.service || true",
            ),
        ],
    ))
}

pub fn disable_resolved<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(Script::new(
        "disable systemd resolved",
        "disable_systemd_resolved",
        p.shell,
        vec![
            ScriptStep::new("stop systemd-resolved", "systemctl stop systemd-resolved").tolerant(),
            ScriptStep::new("disable systemd-resolved", "systemctl disable systemd-resolved")
                .tolerant(),
            ScriptStep::new("remove resolv.conf link", "rm -f /etc/resolv.conf").tolerant(),
            ScriptStep::new(
                "write resolv.conf",
                write_file(
                    "/etc/resolv.conf",
                    "nameserver 8.8.8.8\nnameserver 1.1.1.1\nnameserver 8.8.4.4\n",
                ),
            ),
        ],
    ))
}

struct CloudInitWait<'a> {
    shell: Option<&'a dyn Executor>,
}

const CLOUD_INIT: &str = "cloud_init_wait";

impl CloudInitWait<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(CLOUD_INIT, "Shell")) else {
            return false;
        };
        let found = shell
            .run_for("command -v cloud-init", Duration::from_secs(10))
            .await;
        if !found.succeeded() {
            info!(target: CLOUD_INIT, "cloud-init not found, skipping");
            return true;
        }

        let wait = shell
            .run_for(
                "cloud-init status --wait >/tmp/cloud-init-wait.log 2>&1",
                Duration::from_secs(180),
            )
            .await;
        if !wait.succeeded() {
            log_failure(CLOUD_INIT, "cloud-init wait", &wait);
        }
        let clean = shell
            .run_for("cloud-init clean --logs >/dev/null 2>&1", Duration::from_secs(30))
            .await;
        if !clean.succeeded() {
            log_failure(CLOUD_INIT, "cloud-init clean", &clean);
        }
        true
    }
}

impl Action for CloudInitWait<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "cloud-init wait".to_string()
    }
}

pub fn cloud_init_wait<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(CloudInitWait { shell: p.shell })
}

struct SystemUpgrade<'a> {
    apt: Option<&'a Apt<'a>>,
}

const UPGRADE: &str = "system_upgrade";

/// A dist-upgrade that exits nonzero can still have upgraded everything, typically when a
/// maintainer script complains inside a unit. Output that shows completed work counts as success.
fn upgrade_made_progress(output: &str) -> bool {
    let output = output.to_lowercase();
    [
        "setting up",
        "processing triggers",
        "created symlink",
        "0 upgraded",
        "0 newly installed",
    ]
    .iter()
    .any(|marker| output.contains(marker))
}

impl SystemUpgrade<'_> {
    async fn run(&self) -> bool {
        let Some(apt) = self.apt.or_else(|| missing(UPGRADE, "APT session")) else {
            return false;
        };
        let upgrade = apt.dist_upgrade().await;
        if upgrade.succeeded() || upgrade_made_progress(&upgrade.output) {
            return true;
        }
        log_failure(UPGRADE, "distribution upgrade", &upgrade);
        false
    }
}

impl Action for SystemUpgrade<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "system upgrade".to_string()
    }
}

pub fn system_upgrade<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(SystemUpgrade { apt: p.apt })
}

struct FixAptSources<'a> {
    shell: Option<&'a dyn Executor>,
}

const SOURCES: &str = "fix_apt_sources";

impl FixAptSources<'_> {
    async fn run(&self) -> bool {
        let Some(shell) = self.shell.or_else(|| missing(SOURCES, "Shell")) else {
            return false;
        };
        let fixes = [
            "sed -i 's/oracular/plucky/g' /etc/apt/sources.list",
            "sed -i 's/old-releases.ubuntu.com/archive.ubuntu.com/g' /etc/apt/sources.list",
        ];
        let mut ok = true;
        for fix in fixes {
            let exec = shell.run(fix).await;
            if exec.succeeded() {
                continue;
            }
            if exec.contains("No such file or directory") || exec.contains("can't read") {
                info!(target: SOURCES, "sources.list not found (may use sources.list.d), skipping fix");
                continue;
            }
            log_failure(SOURCES, "apt sources fix", &exec);
            ok = false;
        }
        ok
    }
}

impl Action for FixAptSources<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "apt sources fix".to_string()
    }
}

pub fn fix_apt_sources<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(FixAptSources { shell: p.shell })
}

const LXC_SYSCTL: &str = "configure_lxc_sysctl_access";

/// Settings a unit needs in its host-side LXC config to run k3s.
const LXC_REQUIREMENTS: [(&str, &str); 4] = [
    ("lxc.apparmor.profile", "lxc.apparmor.profile: unconfined"),
    ("lxc.cap.drop:", "lxc.cap.drop:"),
    ("lxc.mount.auto", "lxc.mount.auto: proc:rw sys:rw"),
    ("lxc.cgroup2.devices.allow", "lxc.cgroup2.devices.allow: c 1:11 rwm"),
];

struct LxcSysctlAccess<'a> {
    pct: Option<&'a Pct<'a>>,
    unit_id: Option<u32>,
}

impl LxcSysctlAccess<'_> {
    async fn run(&self) -> bool {
        let (Some(pct), Some(id)) = (self.pct, self.unit_id) else {
            error!(target: LXC_SYSCTL, "PCT adapter or container id not available");
            return false;
        };
        let host = pct.host();
        let config_file = format!("/etc/pve/lxc/{id}.conf");

        let present = host
            .run(&format!(
                "grep -E '^lxc.(mount.auto|apparmor.profile|cap.drop|cgroup2.devices.allow)' {config_file} 2>/dev/null || echo not_found"
            ))
            .await;
        let missing_lines: Vec<&str> = LXC_REQUIREMENTS
            .iter()
            .filter(|(key, _)| !present.contains(key))
            .map(|(_, line)| *line)
            .collect();

        if missing_lines.is_empty() {
            info!(target: LXC_SYSCTL, "All k3s LXC configuration requirements already present");
        }
        for line in missing_lines {
            let exec = host
                .run(&format!("echo '{line}' >> {config_file}"))
                .await;
            if !exec.succeeded() {
                log_failure(LXC_SYSCTL, &format!("add '{line}'"), &exec);
                return false;
            }
            info!(target: LXC_SYSCTL, "Added: {line}");
        }

        let kmsg = pct
            .exec(id, "rm -f /dev/kmsg && ln -sf /dev/console /dev/kmsg", None)
            .await;
        if kmsg.succeeded() {
            info!(target: LXC_SYSCTL, "/dev/kmsg symlink configured");
        } else {
            warn!(target: LXC_SYSCTL, "Failed to create /dev/kmsg symlink: {}", kmsg.tail(200));
        }
        true
    }
}

impl Action for LxcSysctlAccess<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "lxc sysctl access configuration".to_string()
    }
}

pub fn lxc_sysctl_access<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(LxcSysctlAccess {
        pct: p.pct,
        unit_id: p.unit_id,
    })
}

/// Strip per-instance state from a unit before it is archived as a template.
pub fn template_cleanup<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    let user = p.topology.default_user();
    let steps = vec![
        ScriptStep::new("remove apt proxy configuration", "rm -f /etc/apt/apt.conf.d/01proxy"),
        ScriptStep::new("remove SSH host keys", "rm -f /etc/ssh/ssh_host_*"),
        ScriptStep::new("truncate machine-id", "truncate -s 0 /etc/machine-id"),
        ScriptStep::new("remove DBus machine-id", "rm -f /var/lib/dbus/machine-id"),
        ScriptStep::new(
            "recreate DBus machine-id symlink",
            "ln -s /etc/machine-id /var/lib/dbus/machine-id",
        ),
        ScriptStep::new("remove apt lists", "rm -rf /var/lib/apt/lists/*"),
        ScriptStep::new(
            "remove log files",
            "find /var/log -type f -name '*.log' -delete 2>/dev/null",
        ),
        ScriptStep::new(
            "remove compressed logs",
            "find /var/log -type f -name '*.gz' -delete 2>/dev/null",
        ),
        ScriptStep::new("clear root history", "truncate -s 0 /root/.bash_history 2>/dev/null"),
        ScriptStep::new(
            format!("clear {user} history"),
            format!("truncate -s 0 /home/{user}/.bash_history 2>/dev/null"),
        ),
        ScriptStep::new("clean apt cache", "apt-get clean 2>&1"),
    ]
    .into_iter()
    .map(ScriptStep::tolerant)
    .collect();
    Box::new(Script::new("template cleanup", "template_cleanup", p.shell, steps))
}

const ARCHIVE: &str = "create_template_archive";
const MIN_ARCHIVE_SIZE: u64 = 10 * 1024 * 1024;

struct TemplateArchive<'a> {
    pct: Option<&'a Pct<'a>>,
    unit: Option<&'a Container>,
    topology: &'a Topology,
}

fn parse_size(output: &str) -> Option<u64> {
    output.lines().next_back()?.trim().parse().ok()
}

impl TemplateArchive<'_> {
    async fn archive_size(host: &dyn Executor, path: &str) -> Option<u64> {
        let exec = host.run(&format!("stat -c%s '{path}' || echo 0")).await;
        parse_size(&exec.output)
    }

    /// Wait for vzdump's archive to appear and for its size to hold steady across three polls.
    async fn wait_for_archive(host: &dyn Executor, dir: &str, id: u32) -> Option<String> {
        let mut last_size = 0;
        let mut stable = 0;
        let mut archive = None;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let found = host
                .run(&format!("ls -t {dir}/vzdump-lxc-{id}-*.tar.zst 2>/dev/null | head -1"))
                .await;
            let path = found.output.trim();
            if path.is_empty() {
                continue;
            }
            archive = Some(path.to_string());
            match Self::archive_size(host, path).await {
                Some(size) if size > 0 && size == last_size => {
                    stable += 1;
                    if stable >= 3 {
                        break;
                    }
                }
                Some(size) if size > 0 => {
                    stable = 0;
                    last_size = size;
                }
                _ => {}
            }
        }
        archive
    }

    async fn run(&self) -> bool {
        let (Some(pct), Some(unit)) = (self.pct, self.unit) else {
            error!(target: ARCHIVE, "PCT adapter or container config not available");
            return false;
        };
        let host = pct.host();
        let dir = &self.topology.lxc.template_dir;
        let id = unit.id;

        info!(target: ARCHIVE, "Stopping container {id}...");
        if !pct.stop(id, false).await.succeeded() {
            warn!(target: ARCHIVE, "Stop had issues, trying force stop");
            pct.stop(id, true).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        info!(target: ARCHIVE, "Creating template archive for container {id} in {dir}");
        let dump = host
            .run_for(
                &format!("vzdump {id} --dumpdir {dir} --compress zstd --mode stop"),
                Duration::from_secs(600),
            )
            .await;
        if !dump.succeeded() {
            log_failure(ARCHIVE, "vzdump", &dump);
            return false;
        }

        let Some(archive) = Self::wait_for_archive(host, dir, id).await else {
            let listing = host
                .run(&format!("ls -la {dir}/*vzdump* 2>&1 | head -10"))
                .await;
            error!(target: ARCHIVE, "Template archive not found after vzdump. Files: {}", listing.output);
            return false;
        };
        match Self::archive_size(host, &archive).await {
            Some(size) if size >= MIN_ARCHIVE_SIZE => {
                info!(target: ARCHIVE, "Template archive size: {:.2} MB", size as f64 / 1048576.0)
            }
            size => {
                error!(target: ARCHIVE, "Template archive is too small ({size:?} bytes), likely corrupted");
                return false;
            }
        }

        let date = chrono::Local::now().format("%Y%m%d");
        let final_name = format!("{}_{date}_amd64.tar.zst", unit.name);
        let final_path = format!("{dir}/{final_name}");
        let moved = host
            .run(&format!("mv '{archive}' {final_path} 2>&1"))
            .await;
        if !moved.succeeded() {
            log_failure(ARCHIVE, "move template archive", &moved);
            return false;
        }
        info!(target: ARCHIVE, "Template stored at {final_path}");

        if !host.run("pveam update 2>&1").await.succeeded() {
            debug!(target: ARCHIVE, "pveam update had issues");
        }

        let preserve: String = self
            .topology
            .template_config
            .preserve
            .iter()
            .chain(self.topology.template_config.base.iter())
            .map(|name| format!(" ! -name '{name}'"))
            .collect();
        host.run(&format!(
            "find {dir} -maxdepth 1 -type f -name '{}*.tar.zst' ! -name '{final_name}'{preserve} -delete 2>&1",
            unit.name
        ))
        .await;

        pct.destroy_container(id).await;
        true
    }
}

impl Action for TemplateArchive<'_> {
    fn execute(&self) -> LocalBoxFuture<'_, bool> {
        self.run().boxed_local()
    }

    fn describe(&self) -> String {
        "template archive creation".to_string()
    }
}

pub fn template_archive<'a>(p: ActionParams<'a>) -> Box<dyn Action + 'a> {
    Box::new(TemplateArchive {
        pct: p.pct,
        unit: p.unit,
        topology: p.topology,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_progress_markers() {
        assert!(upgrade_made_progress("Setting up libc6 ..."));
        assert!(upgrade_made_progress("0 upgraded, 0 newly installed"));
        assert!(!upgrade_made_progress("E: Could not get lock"));
    }

    #[test]
    fn archive_size_is_last_line() {
        assert_eq!(parse_size("12345"), Some(12345));
        assert_eq!(parse_size("stat: cannot stat\n0"), Some(0));
        assert_eq!(parse_size(""), None);
    }
}
