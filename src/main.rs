// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::path::Path;
use tracing::error;

mod cmds;
mod json;
mod web;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// tpsview: playback server for TPS DVR recordings.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    Export(#[bpaf(external(cmds::export::args))] cmds::export::Args),
    Ls(#[bpaf(external(cmds::ls::args))] cmds::ls::Args),
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Export(a) => cmds::export::run(a),
            Args::Ls(a) => cmds::ls::run(a),
            Args::Run(a) => cmds::run::run(a),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    // Usage and error output should carry whatever name the binary was
    // invoked under (a rename or symlink), not the crate name.
    let argv0 = std::env::args_os().next();
    let progname = argv0
        .as_ref()
        .map(Path::new)
        .and_then(|p| p.file_name()?.to_str())
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!(?args, "parsed command line");

    let status = match args.run() {
        Ok(status) => status,
        Err(err) => {
            error!(err = %err.chain(), "fatal");
            1
        }
    };
    std::process::exit(status);
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
