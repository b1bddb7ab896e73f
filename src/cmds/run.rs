// This file is part of tpsview, a playback engine for TPS DVR recordings.
// Copyright (C) 2025 The tpsview Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The `run` subcommand: load a storage directory and serve clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base::{err, Error, ErrorKind, ResultExt};
use bpaf::Bpaf;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tps::Storage;

const DEFAULT_CONFIG_PATH: &str = "/etc/tpsview.toml";

/// Serve playback over WebSocket.
#[derive(Bpaf, Clone, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(argument("PATH"), fallback(DEFAULT_CONFIG_PATH.into()), debug_fallback)]
    config: PathBuf,
}

fn default_bind() -> std::net::SocketAddr {
    "0.0.0.0:8152".parse().expect("hardcoded addr should parse")
}

fn default_cache_dir() -> PathBuf {
    "/var/cache/tpsview".into()
}

fn default_prebuild() -> bool {
    true
}

/// Runtime configuration file (`/etc/tpsview.toml`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Directory holding `TIndex00.tps` and the `TRec*.tps` recordings.
    pub dvr_dir: PathBuf,

    /// The address to serve WebSocket clients on.
    #[serde(default = "default_bind")]
    pub bind: std::net::SocketAddr,

    /// Directory for persistent frame-index cache artifacts.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Scan every catalogued recording at startup rather than on first
    /// seek. First playback of a cold recording costs a whole-file scan,
    /// so leave this on unless startup time matters more.
    #[serde(default = "default_prebuild")]
    pub prebuild: bool,

    /// The number of worker threads used by the asynchronous runtime.
    ///
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let config = std::fs::read_to_string(path)
        .map_err(|e| err!(PathUnreadable, msg("unable to read {}", path.display()), source(e)))?;
    toml::from_str(&config)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse {}", path.display()), source(e)))
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(worker_threads) = config.worker_threads {
        builder.worker_threads(worker_threads);
    }
    let rt = builder.build().err_kind(ErrorKind::Internal)?;
    let r = rt.block_on(async_run(&config));

    // In the graceful shutdown path we don't want to wait for lingering
    // stream pumps; they notice their dropped receivers on the next send.
    rt.shutdown_background();
    r
}

async fn async_run(config: &ConfigFile) -> Result<i32, Error> {
    let storage = Arc::new(Storage::open(&config.dvr_dir, &config.cache_dir)?);

    if config.prebuild {
        let storage = storage.clone();
        tokio::task::spawn_blocking(move || {
            storage.build_cache();
        });
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|e| err!(Internal, msg("unable to bind {}", config.bind), source(e)))?;
    info!(bind = %config.bind, "serving");

    let mut int = signal(SignalKind::interrupt()).err_kind(ErrorKind::Internal)?;
    let mut term = signal(SignalKind::terminate()).err_kind(ErrorKind::Internal)?;
    tokio::select! {
        _ = int.recv() => info!("received SIGINT; shutting down"),
        _ = term.recv() => info!("received SIGTERM; shutting down"),
        _ = crate::web::serve(listener, storage) => {},
    }
    Ok(0)
}
