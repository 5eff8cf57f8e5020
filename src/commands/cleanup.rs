// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

use clap::Args;
use log::{error, info};

use crate::commands::{connect, load_topology, Cli, Handle, HandledResult};
use crate::config::Topology;
use crate::container::{parse_list, Pct};
use crate::logging;
use crate::remote::Executor;

const LOG: &str = "cleanup";

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CleanupError {
    Remaining(Vec<u32>),
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupError::Remaining(ids) => {
                let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
                write!(f, "{} containers still exist: {}", ids.len(), ids.join(", "))
            }
        }
    }
}

impl std::error::Error for CleanupError {}

/// Destroy every unit on the host, then every template archive.
pub async fn clean_host(pct: &Pct<'_>, topology: &Topology) -> Result<(), CleanupError> {
    info!(target: LOG, "Stopping and destroying containers...");
    let ids = parse_list(&pct.list().await.output);
    if ids.is_empty() {
        info!(target: LOG, "No containers found");
    }
    let total = ids.len();
    for (idx, id) in ids.iter().enumerate() {
        info!(target: LOG, "[{}/{total}] Processing container {id}...", idx + 1);
        pct.destroy_container(*id).await;
    }

    info!(target: LOG, "Verifying all containers are destroyed...");
    let remaining = parse_list(&pct.list().await.output);
    if !remaining.is_empty() {
        return Err(CleanupError::Remaining(remaining));
    }
    info!(target: LOG, "All containers destroyed");

    let dir = &topology.lxc.template_dir;
    let host = pct.host();
    let count = host
        .run(&format!("find {dir} -maxdepth 1 -type f -name '*.tar.zst' | wc -l"))
        .await;
    info!(target: LOG, "Removing {} template files from {dir}...", count.output.trim());
    host.run(&format!("find {dir} -maxdepth 1 -type f -name '*.tar.zst' -delete"))
        .await;
    info!(target: LOG, "Templates removed");
    Ok(())
}

pub async fn run_cleanup(topology: &Topology) -> HandledResult<()> {
    logging::banner(LOG, "Cleaning Up Lab Environment");
    let session = connect(topology).await?;
    let pct = Pct::new(&session);
    let result = clean_host(&pct, topology).await;
    session.disconnect().await;
    result.handle_err(|e| error!(target: LOG, "{e}"))
}

pub async fn cleanup(cli: &Cli, args: &CleanupArgs) -> HandledResult<()> {
    let topology = load_topology(cli, &args.environment)?;
    run_cleanup(&topology).await
}
