// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A systemd timer on the control unit that keeps repairing nodes after the deployment is over:
//! it lifts the unreachable taint that a restart leaves behind and recreates the kernel log link.

use log::{error, info};

use crate::actions::{log_failure, write_file};
use crate::remote::Executor;

const LOG: &str = "k3s-watcher";

pub const SCRIPT_PATH: &str = "/usr/local/bin/k3s-node-watcher.sh";
pub const SERVICE_PATH: &str = "/etc/systemd/system/k3s-node-watcher.service";
pub const TIMER_PATH: &str = "/etc/systemd/system/k3s-node-watcher.timer";

const SCRIPT: &str = r#"#!/bin/bash
export PATH=/usr/local/bin:$PATH
export KUBECONFIG=/etc/rancher/k3s/k3s.yaml

LOG_FILE=/var/log/k3s-node-watcher.log
MAX_LOG_SIZE=10485760

if [ -f "$LOG_FILE" ] && [ "$(stat -c%s "$LOG_FILE" 2>/dev/null || echo 0)" -gt "$MAX_LOG_SIZE" ]; then
    mv "$LOG_FILE" "$LOG_FILE.old" 2>/dev/null || true
fi

log() {
    echo "[$(date '+%Y-%m-%d %H:%M:%S')] $1" >> "$LOG_FILE"
}

if [ ! -e /dev/kmsg ]; then
    rm -f /dev/kmsg && ln -sf /dev/console /dev/kmsg
    log "recreated /dev/kmsg"
fi

TAINTED=$(k3s kubectl get nodes -o jsonpath='{range .items[*]}{.metadata.name}{"\t"}{.spec.taints}{"\n"}{end}' 2>/dev/null | grep node.kubernetes.io/unreachable | cut -f1)
for node in $TAINTED; do
    log "removing unreachable taint from $node"
    k3s kubectl taint nodes "$node" node.kubernetes.io/unreachable:NoSchedule- >> "$LOG_FILE" 2>&1 || true
    k3s kubectl taint nodes "$node" node.kubernetes.io/unreachable:NoExecute- >> "$LOG_FILE" 2>&1 || true
done

NOT_READY=$(k3s kubectl get nodes --no-headers 2>/dev/null | awk '$2 != "Ready" {print $1}')
if [ -n "$NOT_READY" ]; then
    log "nodes not ready: $NOT_READY"
fi
"#;

const SERVICE: &str = "\
[Unit]
Description=k3s node watcher
After=k3s.service
Requires=k3s.service

[Service]
Type=oneshot
ExecStart=/usr/local/bin/k3s-node-watcher.sh
StandardOutput=journal
StandardError=journal

[Install]
WantedBy=multi-user.target
";

const TIMER: &str = "\
[Unit]
Description=Run the k3s node watcher every 2 minutes
Requires=k3s-node-watcher.service

[Timer]
OnBootSec=2min
OnUnitActiveSec=2min
AccuracySec=1s

[Install]
WantedBy=timers.target
";

/// The commands that install and arm the watcher, with a description of each.
pub fn install_steps() -> Vec<(&'static str, String)> {
    vec![
        ("Write watcher script", write_file(SCRIPT_PATH, SCRIPT)),
        ("Make watcher script executable", format!("chmod +x {SCRIPT_PATH}")),
        ("Write watcher service", write_file(SERVICE_PATH, SERVICE)),
        ("Write watcher timer", write_file(TIMER_PATH, TIMER)),
        ("Reload systemd", "systemctl daemon-reload 2>&1".to_string()),
        (
            "Enable watcher timer",
            "systemctl enable --now k3s-node-watcher.timer 2>&1".to_string(),
        ),
    ]
}

/// Install the watcher through `shell`, which must run on the control unit.
pub async fn install_watcher(shell: &dyn Executor) -> bool {
    info!(target: LOG, "Installing k3s node watcher...");
    for (what, command) in install_steps() {
        let exec = shell.execute(&command, None, true).await;
        if !exec.succeeded() {
            log_failure(LOG, what, &exec);
            error!(target: LOG, "k3s node watcher installation failed");
            return false;
        }
    }
    info!(target: LOG, "k3s node watcher installed and enabled (runs every 2 minutes)");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Execution;
    use crate::test_env::ScriptedExecutor;

    #[test]
    fn timer_fires_every_two_minutes() {
        assert!(TIMER.contains("OnBootSec=2min"));
        assert!(TIMER.contains("OnUnitActiveSec=2min"));
        assert!(SERVICE.contains(&format!("ExecStart={SCRIPT_PATH}")));
    }

    #[tokio::test]
    async fn stops_when_a_unit_file_cannot_be_written() {
        let shell = ScriptedExecutor::new().on(
            "base64 -d > /etc/systemd/system/k3s-node-watcher.service",
            Execution::failure("read-only file system", 1),
        );
        assert!(!install_watcher(&shell).await);
        assert!(shell.ran("chmod +x /usr/local/bin/k3s-node-watcher.sh"));
        assert!(!shell.ran("enable --now"));
    }
}
