// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The deployment plan: every step of a deployment numbered up front, then executed in order
//! within an optional `[start, end]` window.
//!
//! Numbering never depends on the window. Steps before `start` are counted and skipped, and the
//! run halts as soon as step `end` has executed, so a plan-only rendering, a full run and a
//! resumed run all agree on what step `n` is.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::actions::{
    create_container::CreateContainer, Action, ActionParams, Registry, UnknownAction,
};
use crate::apt::Apt;
use crate::cluster::gluster;
use crate::config::{Container, Topology};
use crate::container::Pct;
use crate::logging;
use crate::remote::Executor;

const LOG: &str = "deploy";

const SETUP_KUBERNETES: &str = "setup kubernetes";

/// The phases of a deployment, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AptCache,
    Template,
    Unit,
    ClusterMember,
    ClusterSetup,
    Storage,
    ClusterAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Create, or confirm, the unit with this id.
    Create(u32),
    /// Run the named action against the unit with this id.
    UnitAction(u32, String),
    /// Converge the container orchestration cluster.
    ClusterSetup,
    /// Set up the distributed storage volume.
    StorageSetup,
    /// Run the named action against the cluster, through the control unit.
    ClusterAction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub number: usize,
    pub phase: Phase,
    pub kind: StepKind,
    pub label: String,
    /// Set on the last step of a template unit's group; the template unit is destroyed once
    /// that step has run.
    pub closes_template: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Planned,
    Running,
    Completed,
    /// The run stopped after the requested end step.
    Halted(usize),
    Failed(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanError {
    MissingAptCache(String),
    MissingClusterControl,
    InvalidRange {
        start: usize,
        end: usize,
        total: usize,
    },
    UnknownAction(UnknownAction),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::MissingAptCache(name) => {
                write!(f, "apt-cache container '{name}' not found in configuration")
            }
            PlanError::MissingClusterControl => {
                write!(f, "kubernetes actions are configured but no control node is")
            }
            PlanError::InvalidRange { start, end, total } => write!(
                f,
                "invalid step range {start}-{end}: steps must satisfy 1 <= start <= end <= {total}"
            ),
            PlanError::UnknownAction(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PlanError {}

/// A port that should answer once everything is deployed.
#[derive(Debug, Clone, PartialEq)]
pub struct PortTarget {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub udp: bool,
}

impl fmt::Display for PortTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}:{}", self.name, self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeployError {
    Plan(PlanError),
    StepFailed {
        step: usize,
        total: usize,
        label: String,
    },
    UnknownAction(UnknownAction),
    PortsNotResponding(Vec<PortTarget>),
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployError::Plan(e) => write!(f, "{e}"),
            DeployError::StepFailed { step, total, label } => {
                write!(f, "step {step}/{total} failed: {label}")
            }
            DeployError::UnknownAction(e) => write!(f, "{e}"),
            DeployError::PortsNotResponding(targets) => {
                writeln!(f, "Deploy failed: The following ports are not responding:")?;
                for target in targets.iter() {
                    writeln!(f, "  - {target}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DeployError {}

impl From<PlanError> for DeployError {
    fn from(e: PlanError) -> Self {
        DeployError::Plan(e)
    }
}

/// The numbered steps of one deployment, and the window of them to execute.
#[derive(Debug)]
pub struct DeploymentPlan {
    steps: Vec<Step>,
    start_step: usize,
    end_step: usize,
    current_step: usize,
    plan_only: bool,
    state: PlanState,
}

struct PlanBuilder {
    steps: Vec<Step>,
}

impl PlanBuilder {
    fn push(&mut self, phase: Phase, kind: StepKind, label: String) {
        let number = self.steps.len() + 1;
        self.steps.push(Step {
            number,
            phase,
            kind,
            label,
            closes_template: None,
        });
    }

    fn unit(&mut self, phase: Phase, unit: &Container) {
        let create = match phase {
            Phase::Template => "create template",
            _ => "create container",
        };
        self.push(
            phase,
            StepKind::Create(unit.id),
            format!("{}: {create}", unit.name),
        );
        for action in unit.actions.iter() {
            self.push(
                phase,
                StepKind::UnitAction(unit.id, action.clone()),
                format!("{}: {action}", unit.name),
            );
        }
        if phase == Phase::Template {
            if let Some(last) = self.steps.last_mut() {
                last.closes_template = Some(unit.id);
            }
        }
    }
}

impl DeploymentPlan {
    /// Number every step the topology calls for, and check the requested window against the
    /// total. A missing bound defaults to the first or last step.
    pub fn build(
        topology: &Topology,
        registry: &Registry,
        start_step: Option<usize>,
        end_step: Option<usize>,
        plan_only: bool,
    ) -> Result<Self, PlanError> {
        let apt_cache = topology
            .apt_cache()
            .ok_or_else(|| PlanError::MissingAptCache(topology.apt_cache_ct.clone()))?;

        let mut builder = PlanBuilder { steps: Vec::new() };
        builder.unit(Phase::AptCache, apt_cache);
        for template in topology.templates.iter() {
            builder.unit(Phase::Template, template);
        }
        for unit in topology.containers.iter() {
            if unit.id != apt_cache.id && !topology.is_cluster_member(unit.id) {
                builder.unit(Phase::Unit, unit);
            }
        }
        let members = topology.cluster_members();
        for unit in members.iter() {
            if unit.id != apt_cache.id {
                builder.unit(Phase::ClusterMember, unit);
            }
        }
        if !members.is_empty() {
            builder.push(
                Phase::ClusterSetup,
                StepKind::ClusterSetup,
                format!("kubernetes: {SETUP_KUBERNETES}"),
            );
        }
        if topology.glusterfs.is_some() {
            builder.push(
                Phase::Storage,
                StepKind::StorageSetup,
                "glusterfs: setup glusterfs".to_string(),
            );
        }
        let cluster_actions = topology.cluster_actions();
        if !cluster_actions.is_empty() && topology.cluster_control().is_none() {
            return Err(PlanError::MissingClusterControl);
        }
        for action in cluster_actions.iter() {
            builder.push(
                Phase::ClusterAction,
                StepKind::ClusterAction(action.clone()),
                format!("kubernetes: {action}"),
            );
        }

        for step in builder.steps.iter() {
            let name = match &step.kind {
                StepKind::UnitAction(_, name) | StepKind::ClusterAction(name) => name.as_str(),
                StepKind::ClusterSetup => SETUP_KUBERNETES,
                _ => continue,
            };
            if !registry.contains(name) {
                return Err(PlanError::UnknownAction(UnknownAction {
                    name: name.to_string(),
                    available: registry.names(),
                }));
            }
        }

        let total = builder.steps.len();
        let start = start_step.unwrap_or(1);
        let end = end_step.unwrap_or(total);
        if start < 1 || start > end || end > total {
            return Err(PlanError::InvalidRange { start, end, total });
        }

        Ok(DeploymentPlan {
            steps: builder.steps,
            start_step: start,
            end_step: end,
            current_step: 0,
            plan_only,
            state: PlanState::Planned,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn start_step(&self) -> usize {
        self.start_step
    }

    pub fn end_step(&self) -> usize {
        self.end_step
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    pub fn plan_only(&self) -> bool {
        self.plan_only
    }

    /// Whether step `number` falls inside the window to execute.
    pub fn runs(&self, number: usize) -> bool {
        number >= self.start_step && number <= self.end_step
    }

    /// The step table: every step with its number and whether this run executes it.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Deploy plan (total {} steps, running {}-{}):\n",
            self.total_steps(),
            self.start_step,
            self.end_step
        );
        for step in self.steps.iter() {
            let marker = if self.runs(step.number) { "RUN" } else { "skip" };
            out.push_str(&format!("  [{:2}] {:<4} {}\n", step.number, marker, step.label));
        }
        out
    }

    fn progress(&self) -> usize {
        self.current_step * 100 / self.total_steps().max(1)
    }

    /// Execute the window of steps. In plan-only mode only the step table is logged and
    /// nothing runs.
    ///
    /// Returns the final state: `Completed` when the window reached the last step (after the
    /// port sweep passed), `Halted` when it ended earlier.
    pub async fn run(
        &mut self,
        pct: &Pct<'_>,
        topology: &Topology,
        registry: &Registry,
    ) -> Result<PlanState, DeployError> {
        for line in self.render().lines() {
            info!(target: LOG, "{line}");
        }
        if self.plan_only {
            return Ok(self.state);
        }

        self.state = PlanState::Running;
        let mut template_touched: Option<u32> = None;
        let steps = self.steps.clone();
        for step in steps.iter() {
            self.current_step = step.number;
            if step.number < self.start_step {
                debug!(target: LOG, "Skipping step {}: {}", step.number, step.label);
                continue;
            }

            logging::banner(
                LOG,
                &format!(
                    "[Overall: {}%] [Step: {}/{}] Executing: {}",
                    self.progress(),
                    step.number,
                    self.total_steps(),
                    step.label
                ),
            );
            if step.phase == Phase::Template {
                if let StepKind::Create(id) | StepKind::UnitAction(id, _) = step.kind {
                    template_touched = Some(id);
                }
            }

            let ok = match execute_step(step, pct, topology, registry).await {
                Ok(ok) => ok,
                Err(e) => {
                    self.state = PlanState::Failed(step.number);
                    return Err(e);
                }
            };

            let closes = step.closes_template.is_some() || !ok;
            if closes {
                if let Some(id) = template_touched.take() {
                    info!(target: LOG, "Destroying template container {id}...");
                    if !pct.destroy_container(id).await {
                        warn!(target: LOG, "Template container {id} could not be destroyed");
                    }
                }
            }

            if !ok {
                self.state = PlanState::Failed(step.number);
                error!(target: LOG, "Step {} failed: {}", step.number, step.label);
                return Err(DeployError::StepFailed {
                    step: step.number,
                    total: self.total_steps(),
                    label: step.label.clone(),
                });
            }
            if step.number >= self.end_step {
                break;
            }
        }

        if self.end_step < self.total_steps() {
            info!(
                target: LOG,
                "Stopped after step {} of {} as requested",
                self.end_step,
                self.total_steps()
            );
            self.state = PlanState::Halted(self.end_step);
            return Ok(self.state);
        }

        tokio::time::sleep(Duration::from_secs(topology.waits.port_sweep_settle)).await;
        let failed = sweep_ports(pct.host(), &port_targets(topology)).await;
        log_summary(topology, &failed);
        if !failed.is_empty() {
            self.state = PlanState::Failed(self.end_step);
            return Err(DeployError::PortsNotResponding(failed));
        }
        self.state = PlanState::Completed;
        Ok(self.state)
    }
}

async fn run_action(action: Box<dyn Action + '_>) -> bool {
    debug!(target: LOG, "Running action: {}", action.describe());
    action.execute().await
}

/// Run one step. An `Err` is a step that could not even be constructed.
async fn execute_step(
    step: &Step,
    pct: &Pct<'_>,
    topology: &Topology,
    registry: &Registry,
) -> Result<bool, DeployError> {
    match &step.kind {
        StepKind::Create(id) => {
            let Some(unit) = topology.unit(*id) else {
                error!(target: LOG, "Container {id} not found in configuration");
                return Ok(false);
            };
            Ok(CreateContainer::new(pct, unit, topology).execute().await)
        }
        StepKind::UnitAction(id, name) => {
            let Some(unit) = topology.unit(*id) else {
                error!(target: LOG, "Container {id} not found in configuration");
                return Ok(false);
            };
            let unit_shell = pct.unit(*id);
            let apt = Apt::new(&unit_shell);
            let params = ActionParams {
                shell: Some(&unit_shell),
                apt: Some(&apt),
                pct: Some(pct),
                unit_id: Some(*id),
                topology,
                unit: Some(unit),
            };
            let action = registry
                .resolve(name, params)
                .map_err(DeployError::UnknownAction)?;
            Ok(run_action(action).await)
        }
        StepKind::ClusterSetup | StepKind::ClusterAction(_) => {
            let name = match &step.kind {
                StepKind::ClusterAction(name) => name.as_str(),
                _ => SETUP_KUBERNETES,
            };
            let Some(control) = topology.cluster_control() else {
                error!(target: LOG, "Kubernetes control node not found in configuration");
                return Ok(false);
            };
            let control_shell = pct.unit(control.id);
            let apt = Apt::new(&control_shell);
            let params = ActionParams {
                shell: Some(&control_shell),
                apt: Some(&apt),
                pct: Some(pct),
                unit_id: Some(control.id),
                topology,
                unit: None,
            };
            let action = registry
                .resolve(name, params)
                .map_err(DeployError::UnknownAction)?;
            Ok(run_action(action).await)
        }
        StepKind::StorageSetup => Ok(gluster::setup_glusterfs(pct, topology).await),
    }
}

/// The service ports checked at the end of a full deployment.
pub fn port_targets(topology: &Topology) -> Vec<PortTarget> {
    let mut targets = Vec::new();
    let mut add = |name: &str, unit: &Container, port: u16, udp: bool| {
        targets.push(PortTarget {
            name: name.to_string(),
            ip: unit.ip_address,
            port,
            udp,
        })
    };
    if let Some(cache) = topology.apt_cache() {
        add("apt-cache", cache, topology.apt_cache_port(), false);
    }
    if let (Some(pg), Some(unit)) = (
        topology.services.postgresql.as_ref(),
        topology.container_named("pgsql"),
    ) {
        add("PostgreSQL", unit, pg.port, false);
    }
    if let (Some(haproxy), Some(unit)) = (
        topology.services.haproxy.as_ref(),
        topology.container_named("haproxy"),
    ) {
        add("HAProxy HTTP", unit, haproxy.http_port, false);
        add("HAProxy Stats", unit, haproxy.stats_port, false);
    }
    if let Some(unit) = topology.container_named("dns") {
        add("DNS", unit, topology.services.dns.port, true);
    }
    if let Some(gluster) = topology.glusterfs.as_ref() {
        if let Some(unit) = gluster
            .cluster_nodes
            .first()
            .and_then(|id| topology.container(*id))
        {
            add("GlusterFS", unit, 24007, false);
        }
    }
    targets
}

/// `nc -v` reported the port as open.
pub fn port_open(output: &str) -> bool {
    let output = output.to_lowercase();
    output.contains("open") || output.contains("succeeded")
}

/// Probe each target from the control host. Returns the targets that did not answer.
pub async fn sweep_ports(host: &dyn Executor, targets: &[PortTarget]) -> Vec<PortTarget> {
    info!(target: LOG, "Checking service ports...");
    let mut failed = Vec::new();
    for target in targets.iter() {
        let flags = if target.udp { "-zuv" } else { "-zv" };
        let probe = host
            .run_for(
                &format!("nc {flags} -w 3 {} {} 2>&1", target.ip, target.port),
                Duration::from_secs(10),
            )
            .await;
        if port_open(&probe.output) {
            info!(target: LOG, "  ✓ {target}");
        } else {
            warn!(target: LOG, "  ✗ {target}");
            failed.push(target.clone());
        }
    }
    failed
}

/// The deployment summary: where everything ended up and how to reach it.
pub fn summary(topology: &Topology, failed: &[PortTarget]) -> Vec<String> {
    let mut lines = vec!["Containers:".to_string()];
    for unit in topology.containers.iter() {
        lines.push(format!("  - {}: {} ({})", unit.id, unit.name, unit.ip_address));
    }
    if let (Some(pg), Some(unit)) = (
        topology.services.postgresql.as_ref(),
        topology.container_named("pgsql"),
    ) {
        lines.push(format!(
            "PostgreSQL: postgresql://{}:{}@{}:{}/{}",
            pg.username, pg.password, unit.ip_address, pg.port, pg.database
        ));
    }
    if let Some(unit) = topology.container_named("dns") {
        lines.push(format!("DNS: {}:{} (TCP/UDP)", unit.ip_address, topology.services.dns.port));
    }
    if let (Some(haproxy), Some(unit)) = (
        topology.services.haproxy.as_ref(),
        topology.container_named("haproxy"),
    ) {
        lines.push(format!(
            "HAProxy: http://{ip}:{} (stats http://{ip}:{})",
            haproxy.http_port,
            haproxy.stats_port,
            ip = unit.ip_address
        ));
    }
    if let Some(gluster) = topology.glusterfs.as_ref() {
        lines.push(format!(
            "GlusterFS: volume {} mounted at {}",
            gluster.volume_name, gluster.mount_point
        ));
    }
    if let (Some(rancher), Some(control)) = (
        topology.services.rancher.as_ref(),
        topology.cluster_control(),
    ) {
        lines.push(format!("Rancher: https://{}:{}", control.ip_address, rancher.port));
    }
    if failed.is_empty() {
        lines.push("All service ports are responding".to_string());
    } else {
        lines.push("Ports not responding:".to_string());
        for target in failed.iter() {
            lines.push(format!("  - {target}"));
        }
    }
    lines
}

fn log_summary(topology: &Topology, failed: &[PortTarget]) {
    logging::banner(LOG, "Deployment Summary");
    for line in summary(topology, failed) {
        info!(target: LOG, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nc_reports_open_ports_in_two_ways() {
        assert!(port_open("Connection to 10.20.0.10 3142 port [tcp/*] succeeded!"));
        assert!(port_open("10.20.0.20 (10.20.0.20:5432) open"));
        assert!(!port_open("nc: connect to 10.20.0.20 port 5432 (tcp) failed: Connection refused"));
    }

    #[test]
    fn port_failure_lists_every_endpoint() {
        let err = DeployError::PortsNotResponding(vec![PortTarget {
            name: "PostgreSQL".to_string(),
            ip: Ipv4Addr::new(10, 20, 0, 20),
            port: 5432,
            udp: false,
        }]);
        assert_eq!(
            err.to_string(),
            "Deploy failed: The following ports are not responding:\n  - PostgreSQL: 10.20.0.20:5432\n"
        );
    }
}
