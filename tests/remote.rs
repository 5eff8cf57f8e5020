// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use enva_lib::{
        container::Pct,
        remote::{encode, Execution, ExitStatus, Executor, RemoteSession, SessionState},
        test_env::*,
    };

    fn session(transport: ScriptedTransport) -> RemoteSession<ScriptedTransport> {
        RemoteSession::new(transport, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reconnects_transparently() {
        let session = session(ScriptedTransport::new().probes(&[false]));
        assert!(session.connect().await);

        let exec = session.run("hostname").await;
        assert_eq!(exec.status, ExitStatus::Success);
        assert_eq!(exec.output, "ok");
        assert_eq!(session.transport().connects(), 2);
        assert_eq!(session.transport().closes(), 1);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_is_unreachable() {
        let session = session(ScriptedTransport::new().probes(&[false]).opens(&[true, false]));
        assert!(session.connect().await);

        let exec = session.run("hostname").await;
        assert_eq!(exec.status, ExitStatus::Unreachable);
        assert!(!exec.succeeded());
        assert!(session.transport().runs().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_command_drops_the_connection() {
        let session = session(ScriptedTransport::new().slow(Duration::from_secs(60)));
        let exec = session
            .execute("sleep 60", Some(Duration::from_secs(2)), false)
            .await;
        assert_eq!(exec.status, ExitStatus::Unreachable);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.transport().closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn escalated_commands_keep_their_quotes() {
        let session = session(ScriptedTransport::new());
        let command = "echo 'a b' > /etc/motd";
        session.execute(command, None, true).await;

        let sent = &session.transport().runs()[0];
        let encoded = sent
            .strip_prefix("sudo -n bash -c 'echo ")
            .and_then(|s| s.strip_suffix(" | base64 -d | bash'"))
            .unwrap();
        assert_eq!(encode::decode(encoded).unwrap(), command);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_commands_travel_encoded() {
        let host = ScriptedExecutor::new().on("ct:4020 cat", Execution::success("quoted \"text\""));
        let pct = Pct::new(&host);
        let exec = pct.exec(4020, "cat '/etc/$HOME'", None).await;
        assert_eq!(exec.output, "quoted \"text\"");
        assert_eq!(host.commands(), vec!["ct:4020 cat '/etc/$HOME'".to_string()]);
    }
}
