// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod actions;
pub mod apt;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod container;
pub mod logging;
pub mod plan;
pub mod remote;
pub mod test_env;

/// Gets the path of the topology file used when `--config` is not given.
pub fn default_config_path() -> String {
    match std::env::var("ENVA_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "enva.toml".to_string(),
    }
}

/// Gets the directory that receives the timestamped log file of each run.
pub fn default_log_dir() -> String {
    match std::env::var("ENVA_LOG_DIR") {
        Ok(dir) => dir,
        Err(_) => "logs".to_string(),
    }
}

/// Gets the log filter applied when `ENVA_LOG` is unset.
pub fn default_log_filter(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}
