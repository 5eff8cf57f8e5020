// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use enva_lib::{
    self,
    commands::{self, Cli},
    logging,
};

/// The enva binary deploys, inspects, tears down, backs up and restores lab environments.
fn main() {
    let args = Cli::parse();

    logging::init(&enva_lib::default_log_dir(), args.verbose);

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
