// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod clip;
mod config;
mod hub;
mod ingest;
mod json;
mod media;
mod metrics;
mod retention;
mod storage;
mod transcode;
mod web;

use clip::ClipService;
use config::{Config, StorageConfig};
use hub::Hub;
use ingest::IngestionController;
use media::MediaPipeline;
use metrics::Metrics;
use storage::ObjectStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/transcript-hub.yaml")
}

fn parse_config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .short('c')
        .help("Path to the YAML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(default_config_path())
        .debug_fallback()
}

#[derive(Bpaf, Debug)]
#[bpaf(command("run"), adjacent)]
struct RunArgs {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,
}

/// Scans the durable store for orphaned transcript rows (lines whose stream
/// no longer exists) and deletes them.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"), adjacent)]
struct CheckArgs {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,
}

#[derive(Bpaf, Debug)]
#[bpaf(command("migrate"), adjacent)]
struct MigrateArgs {
    #[bpaf(long, argument::<PathBuf>("PATH"))]
    db_path: PathBuf,
}

/// Prints the operator-facing worker heartbeat view (spec §4.D.5), or clears
/// a single channel's stale entry with `--reset`.
#[derive(Bpaf, Debug)]
#[bpaf(command("status"), adjacent)]
struct StatusArgs {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,
    #[bpaf(long, argument::<String>("CHANNEL"))]
    reset: Option<String>,
}

/// Validates a configuration file without starting the server.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"), adjacent)]
struct ConfigCheckArgs {
    #[bpaf(external(parse_config_path))]
    config: PathBuf,
}

#[derive(Bpaf, Debug)]
enum ConfigCommand {
    Check(#[bpaf(external(config_check_args))] ConfigCheckArgs),
}

/// Configuration-related subcommands.
#[derive(Bpaf, Debug)]
#[bpaf(command("config"), adjacent)]
struct ConfigArgs {
    #[bpaf(external(config_command))]
    command: ConfigCommand,
}

/// transcript-hub: multi-tenant live-transcript distribution server.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    Run(#[bpaf(external(run_args))] RunArgs),
    Check(#[bpaf(external(check_args))] CheckArgs),
    Migrate(#[bpaf(external(migrate_args))] MigrateArgs),
    Status(#[bpaf(external(status_args))] StatusArgs),
    Config(#[bpaf(external(config_args))] ConfigArgs),
}

fn main() {
    base::tracing_setup::install();

    let args = match args().fallback_to_usage().run_inner(bpaf::Args::current_args()) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building tokio runtime");

    let result = match args {
        Args::Run(a) => rt.block_on(run(a)),
        Args::Check(a) => rt.block_on(check(a)),
        Args::Migrate(a) => migrate(a),
        Args::Status(a) => rt.block_on(status(a)),
        Args::Config(ConfigArgs { command: ConfigCommand::Check(a) }) => config_check(a),
    };

    match result {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(code) => {
            debug!(code, "exiting");
            std::process::exit(code);
        }
    }
}

fn config_check(args: ConfigCheckArgs) -> Result<i32, Error> {
    Config::load(&args.config)?;
    println!("config at {} is valid", args.config.display());
    Ok(0)
}

async fn check(args: CheckArgs) -> Result<i32, Error> {
    let cfg = Config::load(&args.config)?;
    let db = db::Database::open(&cfg.db_path, &cfg.database.to_tunables())?;
    let removed = db.cleanup_orphaned_transcripts().await?;
    println!("removed {removed} orphaned transcript line(s) from {}", cfg.db_path.display());
    Ok(0)
}

async fn status(args: StatusArgs) -> Result<i32, Error> {
    let cfg = Config::load(&args.config)?;
    let db = db::Database::open(&cfg.db_path, &cfg.database.to_tunables())?;
    if let Some(channel) = args.reset {
        db.reset_worker_status(&channel).await?;
        println!("cleared worker status for channel {channel:?}");
        return Ok(0);
    }
    let statuses = db.list_worker_status().await?;
    if statuses.is_empty() {
        println!("no workers have reported in");
        return Ok(0);
    }
    println!("{:<20} {:<12} {:<24} last_seen", "channel", "version", "build_time");
    for s in statuses {
        println!("{:<20} {:<12} {:<24} {}", s.channel_key, s.version, s.build_time, s.last_seen);
    }
    Ok(0)
}

fn migrate(args: MigrateArgs) -> Result<i32, Error> {
    let mut conn = rusqlite::Connection::open(&args.db_path)?;
    let migrated = db::upgrade::migrate_legacy_schema(&mut conn)?;
    if migrated {
        println!("migrated legacy schema at {}", args.db_path.display());
    } else {
        println!("no legacy schema found at {}; nothing to do", args.db_path.display());
    }
    Ok(0)
}

async fn build_store(storage: &StorageConfig) -> Arc<dyn ObjectStore> {
    match storage {
        StorageConfig::Local(c) => Arc::new(storage::LocalStore::new(c.base_dir.clone(), c.public_url_base.clone())),
        StorageConfig::R2(c) => Arc::new(
            storage::RemoteStore::new(
                c.bucket.clone(),
                c.region.clone(),
                c.endpoint_url.clone(),
                c.access_key_id.clone(),
                c.secret_access_key.clone(),
                c.public_url_base.clone(),
            )
            .await,
        ),
    }
}

async fn run(args: RunArgs) -> Result<i32, Error> {
    let cfg = Config::load(&args.config)?;

    {
        let mut legacy_conn = rusqlite::Connection::open(&cfg.db_path)?;
        db::upgrade::migrate_legacy_schema(&mut legacy_conn)?;
    }

    let db = db::Database::open(&cfg.db_path, &cfg.database.to_tunables())?;
    for channel in &cfg.channels {
        db.ensure_channel(&channel.name, &channel.name, channel.num_past_streams).await?;
    }

    let store = build_store(&cfg.storage).await;
    let clocks = base::clock::real();
    let metrics = Arc::new(Metrics::new());
    let hub = Arc::new(Hub::new(cfg.max_connections_per_channel, 256));
    for channel in &cfg.channels {
        hub.register_channel(&channel.name);
        metrics.register_channel(&channel.name);
    }

    let channel_tuples = cfg
        .channels
        .iter()
        .map(|c| (c.name.clone(), c.name.clone(), c.num_past_streams))
        .collect::<Vec<_>>();
    let ingest = Arc::new(IngestionController::new(
        db.clone(),
        store.clone(),
        hub.clone(),
        clocks.clone(),
        metrics.clone(),
        channel_tuples,
    ));

    let temp_dir = std::env::temp_dir().join("transcript-hub");
    tokio::fs::create_dir_all(&temp_dir).await.map_err(|e| {
        base::err!(e, base::msg!("creating temp dir {}", temp_dir.display()))
    })?;

    let media = Arc::new(MediaPipeline::new(
        db.clone(),
        store.clone(),
        hub.clone(),
        clocks.clone(),
        temp_dir.clone(),
    ));
    let clips = Arc::new(ClipService::new(db.clone(), store.clone(), temp_dir.clone(), cfg.max_clip_size as i32));

    let (shutdown, shutdown_rx) = base::shutdown::Shutdown::new();

    let reconciliation_channels: Vec<(String, String)> = cfg
        .channels
        .iter()
        .map(|c| (c.name.clone(), store.get_url(&c.name)))
        .collect();
    let reconciliation_task = tokio::spawn(retention::reconciliation_loop(
        db.clone(),
        store.clone(),
        hub.clone(),
        reconciliation_channels,
        std::time::Duration::from_secs(cfg.reconciliation_interval_secs),
        shutdown_rx.clone(),
    ));

    let state = Arc::new(web::AppState {
        db: db.clone(),
        store: store.clone(),
        hub: hub.clone(),
        ingest,
        clips,
        media,
        metrics,
        api_key: cfg.credentials.api_key.clone(),
        version: VERSION.to_string(),
        build_time: String::new(),
    });

    let listener = tokio::net::TcpListener::bind(cfg.http_addr).await.map_err(|e| {
        base::err!(e, base::msg!("binding {}", cfg.http_addr))
    })?;
    info!(addr = %cfg.http_addr, "listening");

    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let mut shutdown_signal = shutdown_rx.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            shutdown.trigger();
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = hyper_util::rt::TokioIo::new(stream);
                let state = state.clone();
                let conn = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, hyper::service::service_fn(move |req| {
                        let state = state.clone();
                        async move { web::serve(state, req).await }
                    }))
                    .with_upgrades();
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown_signal.cancelled() => {
                info!("listener closing, draining in-flight connections");
                break;
            }
        }
    }

    let deadline = std::time::Duration::from_secs(30);
    tokio::select! {
        () = graceful.shutdown() => {}
        () = tokio::time::sleep(deadline) => {
            warn!("graceful shutdown deadline exceeded, abandoning remaining connections");
        }
    }

    reconciliation_task.abort();
    info!("shutdown complete");
    Ok(0)
}
