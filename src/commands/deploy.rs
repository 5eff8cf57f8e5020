// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;
use log::{error, info, warn};

use crate::actions::Registry;
use crate::commands::{cleanup, connect, load_topology, Cli, Handle, HandledResult};
use crate::config::Topology;
use crate::container::Pct;
use crate::logging;
use crate::plan::{DeploymentPlan, PlanState};

const LOG: &str = "deploy";

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Name of the environment to deploy.
    pub environment: String,

    /// First step to execute; earlier steps are counted but skipped.
    #[arg(long)]
    pub start_step: Option<usize>,

    /// Last step to execute.
    #[arg(long)]
    pub end_step: Option<usize>,

    /// Print the numbered plan without executing anything.
    #[arg(long)]
    pub planonly: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RedeployArgs {
    pub environment: String,

    #[arg(long)]
    pub start_step: Option<usize>,

    #[arg(long)]
    pub end_step: Option<usize>,
}

/// Build the plan and run it. Plan-only runs never touch the control host.
pub async fn run_deploy(topology: &Topology, args: &DeployArgs) -> HandledResult<PlanState> {
    let registry = Registry::builtin();
    let mut plan = DeploymentPlan::build(
        topology,
        &registry,
        args.start_step,
        args.end_step,
        args.planonly,
    )
    .handle_err(|e| error!(target: LOG, "{e}"))?;

    if plan.plan_only() {
        print!("{}", plan.render());
        return Ok(plan.state());
    }

    logging::banner(LOG, &format!("Deploying environment '{}'", topology.environment));
    let session = connect(topology).await?;
    let pct = Pct::new(&session);
    let result = plan.run(&pct, topology, &registry).await;
    session.disconnect().await;
    result.handle_err(|e| error!(target: LOG, "{e}"))
}

pub async fn deploy(cli: &Cli, args: &DeployArgs) -> HandledResult<()> {
    let topology = load_topology(cli, &args.environment)?;
    match run_deploy(&topology, args).await? {
        PlanState::Completed => info!(target: LOG, "Deployment completed"),
        PlanState::Halted(step) => info!(target: LOG, "Deployment halted after step {step}"),
        _ => {}
    }
    Ok(())
}

/// Tear the environment down, then deploy it again. Cleanup problems are logged and do not stop
/// the deployment.
pub async fn redeploy(cli: &Cli, args: &RedeployArgs) -> HandledResult<()> {
    let topology = load_topology(cli, &args.environment)?;
    logging::banner(LOG, &format!("Redeploying environment '{}'", topology.environment));
    if cleanup::run_cleanup(&topology).await.is_err() {
        warn!(target: LOG, "Cleanup had errors, continuing with deployment");
    }
    let deploy = DeployArgs {
        environment: args.environment.clone(),
        start_step: args.start_step,
        end_step: args.end_step,
        planonly: false,
    };
    run_deploy(&topology, &deploy).await?;
    Ok(())
}
