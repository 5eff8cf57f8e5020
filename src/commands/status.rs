// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;
use log::info;

use crate::commands::{connect, load_topology, Cli, HandledResult};
use crate::config::Topology;
use crate::container::Pct;
use crate::logging;
use crate::remote::Executor;

const LOG: &str = "status";

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    pub environment: String,
}

/// Gather the unit listing and the template archives of the host, as log lines.
pub async fn host_status(pct: &Pct<'_>, topology: &Topology) -> Vec<String> {
    let mut lines = vec!["Containers:".to_string()];
    let list = pct.list().await;
    if list.output.trim().is_empty() {
        lines.push("  No containers found".to_string());
    } else {
        lines.extend(list.output.lines().map(str::to_string));
    }

    lines.push("Templates:".to_string());
    let templates = pct
        .host()
        .run(&format!(
            "ls -lh {}/*.tar.zst 2>/dev/null || echo 'No templates'",
            topology.lxc.template_dir
        ))
        .await;
    if templates.output.trim().is_empty() {
        lines.push("  No templates found".to_string());
    } else {
        lines.extend(templates.output.lines().map(str::to_string));
    }
    lines
}

pub async fn status(cli: &Cli, args: &StatusArgs) -> HandledResult<()> {
    let topology = load_topology(cli, &args.environment)?;
    let session = connect(&topology).await?;
    let pct = Pct::new(&session);

    logging::banner(LOG, "Lab Status");
    for line in host_status(&pct, &topology).await {
        info!(target: LOG, "{line}");
    }
    session.disconnect().await;
    Ok(())
}
