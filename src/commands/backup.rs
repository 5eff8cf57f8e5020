// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::Args;
use log::{error, info, warn};

use crate::actions::{is_active, poll};
use crate::cluster::{kubectl, line_is_ready};
use crate::commands::{connect, load_topology, Cli, Handle, HandledResult};
use crate::config::{Backup, BackupItem, Topology};
use crate::container::Pct;
use crate::logging;
use crate::remote::Executor;

const LOG: &str = "backup";

const DEFAULT_ARCHIVE_TIMEOUT: u64 = 300;
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    pub environment: String,

    /// Timeout in seconds for creating each archive and the final bundle.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Path to leave out of directory archives. May be given more than once.
    #[arg(long)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackupError {
    NotConfigured,
    Archive(String),
    Pull { item: String, id: u32 },
    Push(String),
    Bundle(String),
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupError::NotConfigured => write!(f, "No backup section configured"),
            BackupError::Archive(item) => write!(f, "Failed to create archive for {item}"),
            BackupError::Pull { item, id } => {
                write!(f, "Failed to pull {item} from container {id}")
            }
            BackupError::Push(item) => write!(f, "Failed to push {item} to the backup container"),
            BackupError::Bundle(name) => write!(f, "Failed to create backup bundle {name}"),
        }
    }
}

impl std::error::Error for BackupError {}

/// The name of a backup taken at `when`.
pub fn bundle_name(prefix: &str, when: DateTime<Local>) -> String {
    format!("{prefix}-{}", when.format("%Y%m%d_%H%M%S"))
}

/// Where `item` is staged inside its source unit while it is being archived.
fn staging_path(name: &str, item: &BackupItem) -> String {
    format!("/tmp/{name}-{}", item.name)
}

/// The file name `item` carries inside the bundle.
pub fn member_name(item: &BackupItem) -> String {
    if item.archive_base.is_some() && item.archive_path.is_some() {
        format!("{}.tar.gz", item.name)
    } else {
        item.name.clone()
    }
}

/// The command that stages `item` at `staged` inside its source unit: a gzip archive of
/// `archive_path` relative to `archive_base` when both are set, otherwise a copy of
/// `source_path`.
pub fn stage_command(item: &BackupItem, staged: &str, exclude: &[String]) -> String {
    match (&item.archive_base, &item.archive_path) {
        (Some(base), Some(path)) => {
            let excludes: String = exclude
                .iter()
                .map(|p| format!(" --exclude='{p}'"))
                .collect();
            format!(
                "tar --warning=no-file-changed -czf {staged}.tar.gz{excludes} -C {base} {path}"
            )
        }
        _ => format!("cp {} {staged}", item.source_path),
    }
}

/// Stop and start every cluster member, control units first, and wait until each answers again.
pub(crate) async fn restart_members(pct: &Pct<'_>, topology: &Topology) {
    let members: Vec<u32> = topology
        .cluster_control()
        .into_iter()
        .chain(topology.cluster_workers())
        .map(|c| c.id)
        .collect();

    for id in members {
        info!(target: LOG, "Restarting container {id}...");
        pct.stop(id, false).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        if !pct.start(id).await.succeeded() {
            warn!(target: LOG, "Failed to start container {id}");
            continue;
        }
        let up = poll(Duration::from_secs(120), Duration::from_secs(5), || async move {
            pct.exec(id, "echo test", Some(Duration::from_secs(10)))
                .await
                .contains("test")
        })
        .await;
        if !up {
            warn!(target: LOG, "Container {id} did not come back within 120s");
        }
    }
}

/// Wait for k3s to come back on the control unit and for every node to report Ready.
pub(crate) async fn wait_for_nodes(pct: &Pct<'_>, topology: &Topology) -> bool {
    let Some(control) = topology.cluster_control() else {
        return true;
    };
    let id = control.id;

    let active = poll(Duration::from_secs(120), Duration::from_secs(5), || async move {
        is_active(&pct.exec(id, "systemctl is-active k3s", None).await.output)
    })
    .await;
    if !active {
        warn!(target: LOG, "k3s service is not active on container {id}");
        return false;
    }

    let expected = 1 + topology.cluster_workers().len();
    poll(Duration::from_secs(300), Duration::from_secs(10), || async move {
        let nodes = pct
            .exec(id, &kubectl("get nodes --no-headers"), None)
            .await;
        let ready = nodes.output.lines().filter(|l| line_is_ready(l)).count();
        ready >= expected
    })
    .await
}

struct Staged {
    source: u32,
    path: String,
    member: String,
}

async fn stage_item(
    pct: &Pct<'_>,
    name: &str,
    item: &BackupItem,
    args: &BackupArgs,
) -> Result<Staged, BackupError> {
    let staging = staging_path(name, item);
    let member = member_name(item);
    let archived = item.archive_base.is_some() && item.archive_path.is_some();
    let timeout = if archived {
        args.timeout.unwrap_or(DEFAULT_ARCHIVE_TIMEOUT)
    } else {
        60
    };

    info!(target: LOG, "Backing up {} from container {}", item.name, item.source_container_id);
    let command = stage_command(item, &staging, &args.exclude);
    let exec = pct
        .exec(item.source_container_id, &command, Some(Duration::from_secs(timeout)))
        .await;

    let path = if archived {
        format!("{staging}.tar.gz")
    } else {
        staging
    };

    if !exec.succeeded() {
        if !archived {
            error!(target: LOG, "Failed to copy {}: {}", item.source_path, exec.tail(5));
            return Err(BackupError::Archive(item.name.clone()));
        }
        // tar exits non-zero when files change under it, which live databases do; the archive
        // still counts when it was written.
        let check = pct
            .exec(
                item.source_container_id,
                &format!("test -f {path} && echo exists || echo missing"),
                None,
            )
            .await;
        if !check.contains("exists") {
            error!(target: LOG, "Archive verification failed for {}: {}", item.name, exec.tail(5));
            return Err(BackupError::Archive(item.name.clone()));
        }
        info!(target: LOG, "Archive for {} created with warnings", item.name);
    }

    Ok(Staged {
        source: item.source_container_id,
        path,
        member,
    })
}

/// Move a staged file from its source unit into the backup directory of the backup unit, by way
/// of the control host.
async fn transfer(
    pct: &Pct<'_>,
    backup: &Backup,
    name: &str,
    staged: &Staged,
) -> Result<String, BackupError> {
    let host = pct.host();
    let file = format!("{name}-{}", staged.member);
    let host_tmp = format!("/tmp/{file}");

    let pull = host
        .run_for(
            &format!("pct pull {} {} {host_tmp}", staged.source, staged.path),
            TRANSFER_TIMEOUT,
        )
        .await;
    if !pull.succeeded() {
        error!(target: LOG, "pct pull failed: {}", pull.tail(5));
        return Err(BackupError::Pull {
            item: staged.member.clone(),
            id: staged.source,
        });
    }

    let push = host
        .run_for(
            &format!(
                "pct push {} {host_tmp} {}/{file}",
                backup.container_id, backup.backup_dir
            ),
            TRANSFER_TIMEOUT,
        )
        .await;
    host.run(&format!("rm -f {host_tmp}")).await;
    pct.exec(staged.source, &format!("rm -f {} || true", staged.path), None)
        .await;
    if !push.succeeded() {
        error!(target: LOG, "pct push failed: {}", push.tail(5));
        return Err(BackupError::Push(staged.member.clone()));
    }
    Ok(file)
}

/// Take a backup named `name` of every configured item. Returns the path of the bundle inside
/// the backup unit.
pub async fn take_backup(
    pct: &Pct<'_>,
    topology: &Topology,
    name: &str,
    args: &BackupArgs,
) -> Result<String, BackupError> {
    let backup = topology.backup.as_ref().ok_or(BackupError::NotConfigured)?;

    if topology.kubernetes.is_some() {
        info!(target: LOG, "Restarting cluster containers for a clean state...");
        restart_members(pct, topology).await;
        if !wait_for_nodes(pct, topology).await {
            warn!(target: LOG, "Not every node reported Ready, continuing with the backup");
        }
    }

    pct.exec(
        backup.container_id,
        &format!("mkdir -p {}", backup.backup_dir),
        None,
    )
    .await;

    let mut files = Vec::new();
    for item in backup.items.iter() {
        let staged = stage_item(pct, name, item, args).await?;
        files.push(transfer(pct, backup, name, &staged).await?);
    }

    info!(target: LOG, "Creating backup bundle {name}.tar.gz...");
    let listed = files.join(" ");
    let bundle = pct
        .exec(
            backup.container_id,
            &format!("cd {} && tar -czf {name}.tar.gz {listed}", backup.backup_dir),
            Some(Duration::from_secs(args.timeout.unwrap_or(DEFAULT_ARCHIVE_TIMEOUT))),
        )
        .await;
    if !bundle.succeeded() {
        error!(target: LOG, "{}", bundle.tail(5));
        return Err(BackupError::Bundle(name.to_string()));
    }
    pct.exec(
        backup.container_id,
        &format!("cd {} && rm -f {listed} || true", backup.backup_dir),
        None,
    )
    .await;

    Ok(format!("{}/{name}.tar.gz", backup.backup_dir))
}

pub async fn backup(cli: &Cli, args: &BackupArgs) -> HandledResult<()> {
    let topology = load_topology(cli, &args.environment)?;
    let Some(config) = &topology.backup else {
        return Err(BackupError::NotConfigured).handle_err(|e| error!(target: LOG, "{e}"));
    };
    let name = bundle_name(&config.name_prefix, Local::now());

    logging::banner(LOG, &format!("Creating backup {name}"));
    let session = connect(&topology).await?;
    let pct = Pct::new(&session);
    let result = take_backup(&pct, &topology, &name, args).await;
    session.disconnect().await;

    let path = result.handle_err(|e| error!(target: LOG, "{e}"))?;
    info!(target: LOG, "Backup {name} stored at {path} on container {}", config.container_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn item(archive: bool) -> BackupItem {
        BackupItem {
            name: "pgdata".to_string(),
            source_container_id: 4002,
            source_path: "/var/lib/postgresql/16/main".to_string(),
            archive_base: archive.then(|| "/var/lib/postgresql/16".to_string()),
            archive_path: archive.then(|| "main".to_string()),
        }
    }

    #[test]
    fn bundle_is_stamped_to_the_second() {
        let when = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(bundle_name("lab", when), "lab-20250307_090502");
    }

    #[test]
    fn directories_are_archived_with_excludes() {
        let cmd = stage_command(&item(true), "/tmp/b-pgdata", &["main/pg_wal".to_string()]);
        assert_eq!(
            cmd,
            "tar --warning=no-file-changed -czf /tmp/b-pgdata.tar.gz --exclude='main/pg_wal' \
             -C /var/lib/postgresql/16 main"
        );
        assert_eq!(member_name(&item(true)), "pgdata.tar.gz");
    }

    #[test]
    fn single_files_are_copied() {
        let cmd = stage_command(&item(false), "/tmp/b-pgdata", &["ignored".to_string()]);
        assert_eq!(cmd, "cp /var/lib/postgresql/16/main /tmp/b-pgdata");
        assert_eq!(member_name(&item(false)), "pgdata");
    }
}
