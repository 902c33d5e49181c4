// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent binary: loads the config, builds the journal and sink, and runs
//! the relay pipeline until SIGINT/SIGTERM.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use journal_relay::config::Config;
use journal_relay::errors::PipelineError;
use journal_relay::runner;

const EXIT_MISSING_CONFIG_PATH: i32 = 2;
const EXIT_BAD_CONFIG: i32 = 3;
const EXIT_JOURNAL_OPEN: i32 = 4;
const EXIT_POSITIONING: i32 = 5;

#[derive(Parser)]
#[command(
    name = "journal-relay-agent",
    about = "Relays journal entries to CloudWatch Logs"
)]
struct Cli {
    /// Path to the agent configuration file
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let Some(config_path) = cli.config else {
        eprintln!("a config file path must be set");
        eprintln!("usage: journal-relay-agent <config-file>");
        std::process::exit(EXIT_MISSING_CONFIG_PATH);
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("unable to load config: {err}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    init_logging(&config);
    info!(config = %config_path.display(), "starting journal-relay-agent");

    let journal = match runner::build_journal(&config) {
        Ok(journal) => journal,
        Err(err) => {
            error!("unable to open journal: {err}");
            std::process::exit(EXIT_JOURNAL_OPEN);
        }
    };

    let sink = match runner::build_sink(&config) {
        Ok(sink) => sink,
        Err(err) => {
            error!("unable to build log sink: {err}");
            std::process::exit(EXIT_BAD_CONFIG);
        }
    };

    let shutdown = CancellationToken::new();
    if let Err(err) = spawn_signal_handler(shutdown.clone()) {
        error!("unable to register signal handlers: {err}");
        std::process::exit(1);
    }

    match runner::run_pipeline(Arc::new(config), journal, sink, shutdown).await {
        Ok(()) => info!("journal-relay-agent stopped"),
        Err(err @ PipelineError::Positioning(_)) => {
            error!("{err}");
            std::process::exit(EXIT_POSITIONING);
        }
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}

fn init_logging(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hyper=off,reqwest=off,{default_level}")));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging subsystem was already initialized");
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}
