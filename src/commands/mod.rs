// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod backup;
pub mod cleanup;
pub mod deploy;
pub mod restore;
pub mod status;

use {
    backup::BackupArgs, cleanup::CleanupArgs, deploy::DeployArgs, deploy::RedeployArgs,
    restore::RestoreArgs, status::StatusArgs,
};

use clap::{Parser, Subcommand};
use log::error;

use crate::config::Topology;
use crate::remote::RemoteSession;

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally log the error.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the topology file.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Deploy(DeployArgs),
    Redeploy(RedeployArgs),
    Cleanup(CleanupArgs),
    Status(StatusArgs),
    Backup(BackupArgs),
    Restore(RestoreArgs),
}

/// Load the topology for `environment` from the configured file.
pub fn load_topology(cli: &Cli, environment: &str) -> HandledResult<Topology> {
    let path = cli.config.clone().unwrap_or_else(crate::default_config_path);
    Topology::load(&path, environment).handle_err(|e| error!(target: "enva", "{e}"))
}

/// Open the session to the control host. The session connects up front so that an unreachable
/// host is reported once, before any work starts.
pub async fn connect(topology: &Topology) -> HandledResult<RemoteSession> {
    let session = RemoteSession::control_host(topology);
    if !session.connect().await {
        error!(target: "enva", "Failed to connect to LXC host {}", topology.lxc_destination());
        handled_error()?;
    }
    Ok(session)
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        match &cli.command {
            Commands::Deploy(args) => deploy::deploy(cli, args).await,
            Commands::Redeploy(args) => deploy::redeploy(cli, args).await,
            Commands::Cleanup(args) => cleanup::cleanup(cli, args).await,
            Commands::Status(args) => status::status(cli, args).await,
            Commands::Backup(args) => backup::backup(cli, args).await,
            Commands::Restore(args) => restore::restore(cli, args).await,
        }
    })
}
