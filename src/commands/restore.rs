// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::time::Duration;

use clap::Args;
use log::{error, info, warn};

use crate::actions::poll;
use crate::cluster::kubectl;
use crate::commands::backup::{member_name, restart_members};
use crate::commands::{connect, load_topology, Cli, Handle, HandledResult};
use crate::config::{Backup, BackupItem, Topology};
use crate::container::Pct;
use crate::logging;
use crate::remote::Executor;

const LOG: &str = "restore";

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    pub environment: String,

    /// Name of the backup to restore, as printed by `backup`.
    #[arg(long)]
    pub backup_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreError {
    NotConfigured,
    NotFound(String),
    Extract(String),
    Transfer(String),
    Unpack(String),
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreError::NotConfigured => write!(f, "No backup section configured"),
            RestoreError::NotFound(name) => write!(f, "Backup not found: {name}"),
            RestoreError::Extract(name) => write!(f, "Failed to extract backup {name}"),
            RestoreError::Transfer(item) => write!(f, "Failed to move {item} to its container"),
            RestoreError::Unpack(item) => write!(f, "Failed to unpack {item}"),
        }
    }
}

impl std::error::Error for RestoreError {}

/// The command that puts the file `staged` back in place inside the item's source unit. Whatever
/// is at the destination is moved aside first.
pub fn unpack_command(item: &BackupItem, staged: &str) -> String {
    let aside = format!(
        "mv {path} {path}.backup.$(date +%s) 2>/dev/null || true",
        path = item.source_path
    );
    match &item.archive_base {
        Some(base) if item.archive_path.is_some() => {
            format!("{aside} && mkdir -p {base} && tar -xzf {staged} -C {base}")
        }
        _ => format!("{aside} && cp {staged} {}", item.source_path),
    }
}

/// Stop the k3s services so restored state is not overwritten while it is unpacked.
async fn stop_cluster(pct: &Pct<'_>, topology: &Topology) {
    if let Some(control) = topology.cluster_control() {
        info!(target: LOG, "Stopping k3s on control node {}...", control.id);
        let exec = pct.exec(control.id, "systemctl stop k3s", None).await;
        if !exec.succeeded() {
            warn!(target: LOG, "Failed to stop k3s (may not be running): {}", exec.tail(3));
        }
    }
    for worker in topology.cluster_workers() {
        info!(target: LOG, "Stopping k3s-agent on worker {}...", worker.id);
        let exec = pct.exec(worker.id, "systemctl stop k3s-agent", None).await;
        if !exec.succeeded() {
            warn!(target: LOG, "Failed to stop k3s-agent (may not be running): {}", exec.tail(3));
        }
    }
}

async fn restore_item(
    pct: &Pct<'_>,
    backup: &Backup,
    extracted: &str,
    name: &str,
    item: &BackupItem,
) -> Result<(), RestoreError> {
    info!(target: LOG, "Restoring {} to container {}", item.name, item.source_container_id);
    let file = format!("{name}-{}", member_name(item));
    let stored = format!("{extracted}/{file}");

    let check = pct
        .exec(
            backup.container_id,
            &format!("test -f {stored} && echo exists || echo missing"),
            None,
        )
        .await;
    if !check.contains("exists") {
        error!(target: LOG, "Backup file not found for {}, skipping", item.name);
        return Ok(());
    }

    let host = pct.host();
    let host_tmp = format!("/tmp/{file}");
    let pull = host
        .run_for(
            &format!("pct pull {} {stored} {host_tmp}", backup.container_id),
            TRANSFER_TIMEOUT,
        )
        .await;
    if !pull.succeeded() {
        error!(target: LOG, "pct pull failed: {}", pull.tail(5));
        return Err(RestoreError::Transfer(item.name.clone()));
    }
    let push = host
        .run_for(
            &format!("pct push {} {host_tmp} {host_tmp}", item.source_container_id),
            TRANSFER_TIMEOUT,
        )
        .await;
    host.run(&format!("rm -f {host_tmp}")).await;
    if !push.succeeded() {
        error!(target: LOG, "pct push failed: {}", push.tail(5));
        return Err(RestoreError::Transfer(item.name.clone()));
    }

    let unpack = pct
        .exec(
            item.source_container_id,
            &unpack_command(item, &host_tmp),
            Some(TRANSFER_TIMEOUT),
        )
        .await;
    pct.exec(item.source_container_id, &format!("rm -f {host_tmp}"), None)
        .await;
    if !unpack.succeeded() {
        error!(target: LOG, "{}", unpack.tail(5));
        return Err(RestoreError::Unpack(item.name.clone()));
    }
    Ok(())
}

/// Restore the backup `name` into the units it was taken from.
pub async fn restore_backup(
    pct: &Pct<'_>,
    topology: &Topology,
    name: &str,
) -> Result<(), RestoreError> {
    let backup = topology
        .backup
        .as_ref()
        .ok_or(RestoreError::NotConfigured)?;
    let bundle = format!("{}/{name}.tar.gz", backup.backup_dir);
    let extracted = format!("{}/{name}", backup.backup_dir);

    info!(target: LOG, "Verifying {bundle} exists...");
    let check = pct
        .exec(
            backup.container_id,
            &format!("test -f {bundle} && echo exists || echo missing"),
            None,
        )
        .await;
    if !check.contains("exists") {
        return Err(RestoreError::NotFound(name.to_string()));
    }

    let extract = pct
        .exec(
            backup.container_id,
            &format!("mkdir -p {extracted} && tar -xzf {bundle} -C {extracted}"),
            Some(TRANSFER_TIMEOUT),
        )
        .await;
    if !extract.succeeded() {
        error!(target: LOG, "{}", extract.tail(5));
        return Err(RestoreError::Extract(name.to_string()));
    }

    let clustered = topology.kubernetes.is_some();
    if clustered {
        stop_cluster(pct, topology).await;
    }

    for item in backup.items.iter() {
        restore_item(pct, backup, &extracted, name, item).await?;
    }

    pct.exec(backup.container_id, &format!("rm -rf {extracted}"), None)
        .await;

    if clustered {
        info!(target: LOG, "Restarting cluster containers...");
        restart_members(pct, topology).await;
        if let Some(control) = topology.cluster_control() {
            let id = control.id;
            let listed = poll(Duration::from_secs(300), Duration::from_secs(10), || async move {
                pct.exec(id, &kubectl("get nodes --no-headers"), None)
                    .await
                    .succeeded()
            })
            .await;
            if !listed {
                warn!(target: LOG, "Cluster nodes did not list within 300s");
            }
        }
    }
    Ok(())
}

pub async fn restore(cli: &Cli, args: &RestoreArgs) -> HandledResult<()> {
    let topology = load_topology(cli, &args.environment)?;

    logging::banner(LOG, &format!("Restoring backup {}", args.backup_name));
    let session = connect(&topology).await?;
    let pct = Pct::new(&session);
    let result = restore_backup(&pct, &topology, &args.backup_name).await;
    session.disconnect().await;

    result.handle_err(|e| error!(target: LOG, "{e}"))?;
    info!(target: LOG, "Restore of {} completed", args.backup_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archives_unpack_under_their_base() {
        let item = BackupItem {
            name: "k3s-data".to_string(),
            source_container_id: 4011,
            source_path: "/var/lib/rancher/k3s/server/db".to_string(),
            archive_base: Some("/var/lib/rancher/k3s/server".to_string()),
            archive_path: Some("db".to_string()),
        };
        let cmd = unpack_command(&item, "/tmp/b-k3s-data.tar.gz");
        assert!(cmd.starts_with("mv /var/lib/rancher/k3s/server/db /var/lib/rancher/k3s/server/db.backup."));
        assert!(cmd.ends_with(
            "mkdir -p /var/lib/rancher/k3s/server && tar -xzf /tmp/b-k3s-data.tar.gz -C /var/lib/rancher/k3s/server"
        ));
    }
}
