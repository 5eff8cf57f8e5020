// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use enva_lib::{
        actions::Registry,
        commands::deploy::{run_deploy, DeployArgs},
        container::Pct,
        plan::{DeployError, DeploymentPlan, PlanError, PlanState, PortTarget},
        remote::Execution,
        test_env::*,
    };

    /// A host on which every unit of scenario_a.toml already exists, runs, and answers.
    fn converged_host() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .on(
                "pct list",
                Execution::success(
                    "VMID       Status     Lock         Name\n\
                     4010       running                 apt-cache\n\
                     4020       running                 alpha\n\
                     4021       running                 beta",
                ),
            )
            .on("pct config", Execution::success("arch: amd64\nunprivileged: 1"))
            .on("pct status", Execution::success("status: running"))
            .on("nc -zv", Execution::success("Connection to 10.20.0.10 3142 port [tcp/*] succeeded!"))
    }

    /// A host on which the units of templates.toml already exist and run.
    fn template_host() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .on(
                "pct list",
                Execution::success("4010 running apt-cache\n4050 running base-template\n4020 running alpha"),
            )
            .on("pct config", Execution::success("unprivileged: 1"))
            .on("pct status", Execution::success("status: running"))
            .on("nc -zv", Execution::success("succeeded"))
    }

    fn position(host: &ScriptedExecutor, pattern: &str) -> usize {
        host.commands()
            .iter()
            .position(|c| c.contains(pattern))
            .unwrap_or_else(|| panic!("no command contains {pattern}"))
    }

    #[test]
    fn steps_are_counted_per_unit_and_action() {
        let topology = topology("scenario_a.toml", "dev");
        let plan = DeploymentPlan::build(&topology, &Registry::builtin(), None, None, false).unwrap();
        assert_eq!(plan.total_steps(), 11);
        assert_eq!(plan.start_step(), 1);
        assert_eq!(plan.end_step(), 11);

        let labels: Vec<&str> = plan.steps().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels[0], "apt-cache: create container");
        assert_eq!(labels[3], "alpha: create container");
        assert_eq!(labels[10], "beta: apt cache proxy configuration");
    }

    #[test]
    fn cluster_steps_follow_the_units() {
        let topology = topology("cluster.toml", "dev");
        let plan = DeploymentPlan::build(&topology, &Registry::builtin(), None, None, false).unwrap();
        let labels: Vec<&str> = plan.steps().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(plan.total_steps(), 13);
        assert_eq!(labels[11], "kubernetes: setup kubernetes");
        assert_eq!(labels[12], "kubernetes: install k3s node watcher");
    }

    #[tokio::test(start_paused = true)]
    async fn plan_only_marks_the_window_and_touches_nothing() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, Some(5), Some(8), true).unwrap();

        let rendered = plan.render();
        let rows: Vec<&str> = rendered.lines().skip(1).collect();
        assert_eq!(rows.len(), 11);
        for (idx, row) in rows.iter().enumerate() {
            let number = idx + 1;
            let expected = if (5..=8).contains(&number) { "RUN " } else { "skip" };
            assert!(row.contains(expected), "step {number}: {row}");
        }

        let host = ScriptedExecutor::new();
        let pct = Pct::new(&host);
        let state = plan.run(&pct, &topology, &registry).await.unwrap();
        assert_eq!(state, PlanState::Planned);
        assert!(host.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn plan_only_deploy_needs_no_connection() {
        let topology = topology("scenario_a.toml", "dev");
        let args = DeployArgs {
            environment: "dev".to_string(),
            start_step: Some(5),
            end_step: Some(8),
            planonly: true,
        };
        assert_eq!(run_deploy(&topology, &args).await, Ok(PlanState::Planned));
    }

    #[test]
    fn window_outside_the_plan_is_rejected() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        for (start, end) in [(0, 3), (6, 5), (1, 12)] {
            let err = DeploymentPlan::build(&topology, &registry, Some(start), Some(end), false)
                .err()
                .unwrap();
            assert_eq!(err, PlanError::InvalidRange { start, end, total: 11 });
        }
    }

    #[test]
    fn unknown_actions_are_rejected_before_anything_runs() {
        let mut topology = topology("scenario_a.toml", "dev");
        topology.containers[1].actions.push("frobnicate".to_string());
        let err = DeploymentPlan::build(&topology, &Registry::builtin(), None, None, false)
            .err()
            .unwrap();
        match err {
            PlanError::UnknownAction(unknown) => assert_eq!(unknown.name, "frobnicate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn converged_rerun_recreates_nothing() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, None, None, false).unwrap();
        let host = converged_host();
        let pct = Pct::new(&host);

        assert_eq!(plan.run(&pct, &topology, &registry).await, Ok(PlanState::Completed));
        assert!(!host.ran("pct create"));
        assert!(!host.ran("pct destroy"));
        assert!(!host.ran("pct start"));
        assert_eq!(host.count("nc -zv -w 3 10.20.0.10 3142"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_window_runs_only_its_steps() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, Some(4), Some(5), false).unwrap();
        let host = converged_host();
        let pct = Pct::new(&host);

        assert_eq!(plan.run(&pct, &topology, &registry).await, Ok(PlanState::Halted(5)));
        assert_eq!(plan.current_step(), 5);
        assert!(host.ran("pct config 4020"));
        assert!(host.ran("ct:4020 "));
        assert!(!host.commands().iter().any(|c| c.contains("4010") || c.contains("4021")));
        assert!(!host.ran("nc -zv"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_stops_the_run() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, None, None, false).unwrap();
        let host = ScriptedExecutor::new()
            .on("ct:4020 for unit in apt-daily", Execution::failure("mask failed", 1))
            .on(
                "pct list",
                Execution::success("4010 running apt-cache\n4020 running alpha\n4021 running beta"),
            )
            .on("pct config", Execution::success("unprivileged: 1"))
            .on("pct status", Execution::success("status: running"));
        let pct = Pct::new(&host);

        let err = plan.run(&pct, &topology, &registry).await.err().unwrap();
        assert_eq!(
            err,
            DeployError::StepFailed {
                step: 5,
                total: 11,
                label: "alpha: disable automatic apt units".to_string(),
            }
        );
        assert_eq!(plan.state(), PlanState::Failed(5));
        assert!(!host.ran("ct:4021"));
    }

    #[tokio::test(start_paused = true)]
    async fn template_is_destroyed_after_its_last_action() {
        let topology = topology("templates.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, None, Some(6), false).unwrap();
        let labels: Vec<&str> = plan.steps().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels[3], "base-template: create template");
        assert_eq!(labels[5], "base-template: disable automatic apt units");
        let host = template_host();
        let pct = Pct::new(&host);

        assert_eq!(plan.run(&pct, &topology, &registry).await, Ok(PlanState::Halted(6)));
        assert_eq!(host.count("pct destroy 4050"), 1);
        assert!(position(&host, "pct destroy 4050") > position(&host, "ct:4050 for unit in apt-daily"));
        assert!(!host.ran("4020"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_template_action_destroys_the_template() {
        let topology = topology("templates.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, None, None, false).unwrap();
        let host = ScriptedExecutor::new()
            .on("ct:4050 for unit in apt-daily", Execution::failure("mask failed", 1))
            .on(
                "pct list",
                Execution::success("4010 running apt-cache\n4050 running base-template\n4020 running alpha"),
            )
            .on("pct config", Execution::success("unprivileged: 1"))
            .on("pct status", Execution::success("status: running"));
        let pct = Pct::new(&host);

        let err = plan.run(&pct, &topology, &registry).await.err().unwrap();
        assert_eq!(
            err,
            DeployError::StepFailed {
                step: 6,
                total: plan.total_steps(),
                label: "base-template: disable automatic apt units".to_string(),
            }
        );
        assert_eq!(plan.state(), PlanState::Failed(6));
        assert!(position(&host, "pct destroy 4050") > position(&host, "ct:4050 for unit in apt-daily"));
        assert!(!host.ran("4020"));
    }

    #[tokio::test(start_paused = true)]
    async fn halted_run_resumes_at_the_next_unit() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();

        let mut first = DeploymentPlan::build(&topology, &registry, None, Some(7), false).unwrap();
        let host = converged_host();
        let pct = Pct::new(&host);
        assert_eq!(first.run(&pct, &topology, &registry).await, Ok(PlanState::Halted(7)));
        assert!(host.ran("ct:4020 "));
        assert!(!host.ran("4021"));

        let mut second = DeploymentPlan::build(&topology, &registry, Some(8), None, false).unwrap();
        let host = converged_host();
        let pct = Pct::new(&host);
        assert_eq!(second.run(&pct, &topology, &registry).await, Ok(PlanState::Completed));
        assert!(host.ran("ct:4021 "));
        assert!(!host.commands().iter().any(|c| c.contains("4010") || c.contains("ct:4020")));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_port_is_reported() {
        let topology = topology("scenario_a.toml", "dev");
        let registry = Registry::builtin();
        let mut plan = DeploymentPlan::build(&topology, &registry, None, None, false).unwrap();
        let host = ScriptedExecutor::new()
            .on(
                "nc -zv -w 3 10.20.0.10 3142",
                Execution::failure("nc: connect to 10.20.0.10 port 3142 (tcp) failed: Connection refused", 1),
            )
            .on(
                "pct list",
                Execution::success("4010 running apt-cache\n4020 running alpha\n4021 running beta"),
            )
            .on("pct config", Execution::success("unprivileged: 1"))
            .on("pct status", Execution::success("status: running"));
        let pct = Pct::new(&host);

        let err = plan.run(&pct, &topology, &registry).await.err().unwrap();
        assert_eq!(
            err,
            DeployError::PortsNotResponding(vec![PortTarget {
                name: "apt-cache".to_string(),
                ip: "10.20.0.10".parse().unwrap(),
                port: 3142,
                udp: false,
            }])
        );
        assert_eq!(plan.state(), PlanState::Failed(11));
    }
}
