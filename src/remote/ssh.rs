// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use tokio::process::Command;

use super::{RawOutput, RemoteSession, Transport};
use crate::config::Topology;

/// A `Transport` built on the system `ssh` client and an OpenSSH control master.
///
/// `open()` starts a backgrounded master connection bound to a socket private to this process;
/// every command then multiplexes over that socket, so only the first connection authenticates.
pub struct SshTransport {
    destination: String,
    control_path: PathBuf,
    connect_timeout: u64,
    batch_mode: bool,
}

impl SshTransport {
    pub fn new(destination: String, connect_timeout: u64, batch_mode: bool) -> Self {
        let control_path = std::env::temp_dir().join(format!(
            "enva-{}-{}.sock",
            std::process::id(),
            destination.replace(['@', '.', ':'], "_")
        ));
        SshTransport {
            destination,
            control_path,
            connect_timeout,
            batch_mode,
        }
    }

    fn options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-o".to_string(),
            format!("BatchMode={}", if self.batch_mode { "yes" } else { "no" }),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ]
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn open_master(&self) -> io::Result<()> {
        // The backgrounded master keeps any inherited pipes open, so its output is discarded and
        // only the exit status of the foreground process is used.
        let status = self
            .command()
            .args(["-M", "-N", "-f", "-o", "ControlPersist=yes"])
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "ssh master to {} exited with {status}",
                self.destination
            )))
        }
    }

    async fn control(&self, operation: &str) -> bool {
        let result = self
            .command()
            .args(["-O", operation])
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(result, Ok(status) if status.success())
    }

    async fn run_command(&self, command: &str) -> io::Result<RawOutput> {
        let output = self
            .command()
            .arg(&self.destination)
            .arg("--")
            .arg(command)
            .output()
            .await?;
        Ok(RawOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }
}

impl Transport for SshTransport {
    fn destination(&self) -> &str {
        &self.destination
    }

    fn open(&self) -> LocalBoxFuture<'_, io::Result<()>> {
        self.open_master().boxed_local()
    }

    fn probe(&self) -> LocalBoxFuture<'_, bool> {
        self.control("check").boxed_local()
    }

    fn close(&self) -> LocalBoxFuture<'_, ()> {
        async move {
            self.control("exit").await;
        }
        .boxed_local()
    }

    fn run<'a>(&'a self, command: &'a str) -> LocalBoxFuture<'a, io::Result<RawOutput>> {
        self.run_command(command).boxed_local()
    }
}

impl RemoteSession<SshTransport> {
    /// Create a session to the control host of `topology`. No connection is made until first use.
    pub fn control_host(topology: &Topology) -> Self {
        let transport = SshTransport::new(
            topology.lxc_destination(),
            topology.ssh.connect_timeout,
            topology.ssh.batch_mode,
        );
        RemoteSession::new(
            transport,
            Duration::from_secs(topology.ssh.default_exec_timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_path_is_private_to_the_destination() {
        let a = SshTransport::new("root@10.0.0.1".to_string(), 10, true);
        let b = SshTransport::new("root@10.0.0.2".to_string(), 10, true);
        assert_ne!(a.control_path, b.control_path);
        assert!(a
            .options()
            .contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(a.options().contains(&"BatchMode=yes".to_string()));
    }
}
