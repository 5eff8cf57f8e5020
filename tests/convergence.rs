// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use enva_lib::{
        cluster::{verify::verify_cluster, ClusterContext, JoinFailure},
        container::Pct,
        remote::Execution,
        test_env::*,
    };

    const NODES_WORKER_NOT_READY: &str =
        "k3s-control    Ready      control-plane,master   10m   v1.30.4+k3s1   10.20.0.11\n\
         k3s-worker-1   NotReady   <none>                 2m    v1.30.4+k3s1   10.20.0.12";

    const NODES_READY: &str =
        "k3s-control    Ready   control-plane,master   10m   v1.30.4+k3s1   10.20.0.11\n\
         k3s-worker-1   Ready   <none>                 2m    v1.30.4+k3s1   10.20.0.12";

    #[tokio::test(start_paused = true)]
    async fn active_agent_that_never_turns_ready_fails_the_join() {
        let topology = topology("cluster.toml", "dev");
        let host = ScriptedExecutor::new()
            .on("ct:4012 systemctl is-active k3s-agent", Execution::success("active"))
            .on("ct:4011 export PATH", Execution::success(NODES_WORKER_NOT_READY))
            .on("list-unit-files", Execution::success("exists"))
            .on(
                "systemctl status k3s-agent",
                Execution::success("k3s-agent.service - Lightweight Kubernetes\n   Active: active (running)"),
            )
            .on(
                "journalctl -u k3s-agent",
                Execution::success("level=error msg=\"failed to get CA certs\""),
            );
        let pct = Pct::new(&host);
        let mut ctx = ClusterContext::new(&pct, &topology)
            .unwrap()
            .join_timeout(Duration::from_secs(10));
        ctx.set_token("K10abc::server:def");

        let worker = ctx.workers()[0];
        let err = ctx.join_worker(worker).await.err().unwrap();
        assert_eq!(err.failure, JoinFailure::NotReady { active: true });
        assert_eq!(err.id, 4012);
        assert!(err.status.contains("active (running)"));
        assert!(err.journal.contains("failed to get CA certs"));
        assert!(err.to_string().contains("never became Ready"));
        assert!(host.ran("K3S_URL=https://10.20.0.11:6443 K3S_TOKEN=K10abc::server:def"));
    }

    #[tokio::test(start_paused = true)]
    async fn joined_worker_is_left_alone() {
        let topology = topology("cluster.toml", "dev");
        let host = ScriptedExecutor::new()
            .on("ct:4012 systemctl is-active k3s-agent", Execution::success("active"))
            .on("ct:4011 export PATH", Execution::success(NODES_READY));
        let pct = Pct::new(&host);
        let ctx = ClusterContext::new(&pct, &topology).unwrap();

        assert!(ctx.join_workers().await);
        assert!(!host.ran("get.k3s.io"));
        assert!(!host.ran("k3s-agent-uninstall.sh"));
    }

    #[tokio::test(start_paused = true)]
    async fn join_without_a_token_fails_early() {
        let topology = topology("cluster.toml", "dev");
        let host = ScriptedExecutor::new().on(
            "ct:4012 systemctl is-active k3s-agent",
            Execution::failure("inactive", 3),
        );
        let pct = Pct::new(&host);
        let ctx = ClusterContext::new(&pct, &topology).unwrap();

        let err = ctx.join_worker(ctx.workers()[0]).await.err().unwrap();
        assert_eq!(err.failure, JoinFailure::NoToken);
        assert!(!host.ran("get.k3s.io"));
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_read_once_the_server_is_active() {
        let topology = topology("cluster.toml", "dev");
        let host = ScriptedExecutor::new()
            .once("systemctl is-active k3s", Execution::success("activating"))
            .on("systemctl is-active k3s", Execution::success("active"))
            .on("node-token", Execution::success("K10abc::server:def\n"));
        let pct = Pct::new(&host);
        let mut ctx = ClusterContext::new(&pct, &topology).unwrap();

        assert!(ctx.fetch_token().await);
        assert_eq!(ctx.token(), Some("K10abc::server:def"));
        assert_eq!(host.count("systemctl is-active k3s"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_cluster_is_not_touched() {
        let topology = topology("cluster.toml", "dev");
        let host = ScriptedExecutor::new()
            .on("get nodes --no-headers", Execution::success(NODES_READY))
            .on("spec.taints", Execution::success("k3s-control\t\nk3s-worker-1\t"))
            .on("test -e /dev/kmsg", Execution::success("exists"));
        let pct = Pct::new(&host);

        assert!(verify_cluster(&pct, &topology).await);
        assert!(verify_cluster(&pct, &topology).await);
        assert!(!host.ran("taint nodes"));
        assert!(!host.ran("restart"));
        assert!(!host.ran("ln -sf"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_worker_is_untainted_and_restarted() {
        let topology = topology("cluster.toml", "dev");
        let host = ScriptedExecutor::new()
            .on("get nodes --no-headers", Execution::success(NODES_READY))
            .once(
                "spec.taints",
                Execution::success(
                    "k3s-control\t\nk3s-worker-1\t[{\"effect\":\"NoExecute\",\"key\":\"node.kubernetes.io/unreachable\"}]",
                ),
            )
            .on("test -e /dev/kmsg", Execution::success("exists"));
        let pct = Pct::new(&host);

        assert!(verify_cluster(&pct, &topology).await);
        assert!(host.ran("taint nodes k3s-worker-1 node.kubernetes.io/unreachable:NoSchedule-"));
        assert!(host.ran("taint nodes k3s-worker-1 node.kubernetes.io/unreachable:NoExecute-"));
        assert!(host.ran("ct:4012 rm -f /dev/kmsg && ln -sf /dev/console /dev/kmsg && systemctl restart k3s-agent"));
        assert!(!host.ran("ct:4011 rm -f /dev/kmsg"));
    }
}
