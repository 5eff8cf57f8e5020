// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use enva_lib::{
        commands::{
            backup::{take_backup, BackupArgs, BackupError},
            restore::{restore_backup, RestoreError},
        },
        container::Pct,
        remote::Execution,
        test_env::*,
    };

    const NODES_READY: &str = "k3s-control    Ready   control-plane,master   10m   v1.30.4+k3s1\n\
                               k3s-worker-1   Ready   <none>                 2m    v1.30.4+k3s1";

    fn args() -> BackupArgs {
        BackupArgs {
            environment: "dev".to_string(),
            timeout: None,
            exclude: vec!["main/pg_wal".to_string()],
        }
    }

    fn cluster_host() -> ScriptedExecutor {
        ScriptedExecutor::new()
            .on("echo test", Execution::success("test"))
            .on("systemctl is-active k3s", Execution::success("active"))
            .on("get nodes --no-headers", Execution::success(NODES_READY))
    }

    fn position(commands: &[String], pattern: &str) -> usize {
        commands
            .iter()
            .position(|c| c.contains(pattern))
            .unwrap_or_else(|| panic!("no command contains {pattern}"))
    }

    #[tokio::test(start_paused = true)]
    async fn backup_archives_moves_and_bundles_every_item() {
        let topology = topology("cluster.toml", "dev");
        let host = cluster_host();
        let pct = Pct::new(&host);

        let path = take_backup(&pct, &topology, "lab-1", &args()).await.unwrap();
        assert_eq!(path, "/backup/lab-1.tar.gz");

        let commands = host.commands();
        assert!(position(&commands, "pct stop 4011") < position(&commands, "pct stop 4012"));
        assert!(host.ran("ct:4011 cp /var/lib/rancher/k3s/server/token /tmp/lab-1-k3s-token"));
        assert!(host.ran(
            "ct:4016 tar --warning=no-file-changed -czf /tmp/lab-1-pgdata.tar.gz --exclude='main/pg_wal' -C /var/lib/postgresql/16 main"
        ));
        assert!(host.ran("pct pull 4016 /tmp/lab-1-pgdata.tar.gz /tmp/lab-1-pgdata.tar.gz"));
        assert!(host.ran("pct push 4016 /tmp/lab-1-pgdata.tar.gz /backup/lab-1-pgdata.tar.gz"));
        assert!(host.ran("pct push 4016 /tmp/lab-1-k3s-token /backup/lab-1-k3s-token"));
        assert!(host.ran("ct:4016 cd /backup && tar -czf lab-1.tar.gz lab-1-k3s-token lab-1-pgdata.tar.gz"));
        assert!(
            position(&commands, "tar -czf lab-1.tar.gz") < position(&commands, "rm -f lab-1-k3s-token")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn archive_written_despite_warnings_counts() {
        let topology = topology("cluster.toml", "dev");
        let host = cluster_host()
            .on("tar --warning", Execution::failure("tar: main: file changed as we read it", 1))
            .on("test -f", Execution::success("exists"));
        let pct = Pct::new(&host);

        assert!(take_backup(&pct, &topology, "lab-1", &args()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_archive_stops_the_backup() {
        let topology = topology("cluster.toml", "dev");
        let host = cluster_host()
            .on("tar --warning", Execution::failure("tar: main: Cannot open", 2))
            .on("test -f", Execution::success("missing"));
        let pct = Pct::new(&host);

        let err = take_backup(&pct, &topology, "lab-1", &args()).await.err().unwrap();
        assert_eq!(err, BackupError::Archive("pgdata".to_string()));
        assert!(!host.ran("tar -czf lab-1.tar.gz"));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_puts_items_back_and_restarts_the_cluster() {
        let topology = topology("cluster.toml", "dev");
        let host = cluster_host().on("test -f", Execution::success("exists"));
        let pct = Pct::new(&host);

        restore_backup(&pct, &topology, "lab-1").await.unwrap();

        let commands = host.commands();
        assert!(host.ran("ct:4016 mkdir -p /backup/lab-1 && tar -xzf /backup/lab-1.tar.gz -C /backup/lab-1"));
        assert!(host.ran("ct:4011 systemctl stop k3s"));
        assert!(host.ran("ct:4012 systemctl stop k3s-agent"));
        assert!(host.ran("pct pull 4016 /backup/lab-1/lab-1-pgdata.tar.gz /tmp/lab-1-pgdata.tar.gz"));
        assert!(host.ran("pct push 4016 /tmp/lab-1-pgdata.tar.gz /tmp/lab-1-pgdata.tar.gz"));
        assert!(host.ran("tar -xzf /tmp/lab-1-pgdata.tar.gz -C /var/lib/postgresql/16"));
        assert!(host.ran("cp /tmp/lab-1-k3s-token /var/lib/rancher/k3s/server/token"));
        assert!(
            position(&commands, "systemctl stop k3s-agent") < position(&commands, "pct pull 4016")
        );
        assert!(position(&commands, "pct pull 4016") < position(&commands, "pct stop 4011"));
    }

    #[tokio::test(start_paused = true)]
    async fn restore_of_a_missing_backup_changes_nothing() {
        let topology = topology("cluster.toml", "dev");
        let host = cluster_host().on("test -f", Execution::success("missing"));
        let pct = Pct::new(&host);

        let err = restore_backup(&pct, &topology, "lab-0").await.err().unwrap();
        assert_eq!(err, RestoreError::NotFound("lab-0".to_string()));
        assert!(!host.ran("systemctl stop"));
        assert!(!host.ran("pct pull"));
    }
}
