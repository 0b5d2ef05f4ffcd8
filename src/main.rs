// src/main.rs

mod agent;
mod cli;
mod config;
mod errors;
mod event;
mod input;
mod management;
mod role;
mod vault;

use std::fs::create_dir_all;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Registry,
};
use xdg::BaseDirectories;

use cli::Cli;
use config::APP_NAME;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = Cli::parse();

    // Load the environment file before anything reads REFLEX_* variables.
    match &cli_args.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                warn!("Could not load env file {:?}: {}", path, e);
            }
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // Log directory lives in the XDG cache home.
    let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
    let log_path = xdg_dirs.get_cache_home();
    create_dir_all(&log_path)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The guard must stay alive for the life of the process so buffered
    // file-log lines are flushed.
    let file_appender = rolling::daily(&log_path, format!("{}.log", APP_NAME));
    let (non_blocking_writer, _file_worker_guard): (_, WorkerGuard) =
        tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .json();

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);

    Registry::default()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    info!("reflexsoar-agent initializing...");
    debug!("Parsed CLI arguments: {:?}", cli_args);

    let exit_code = cli::handle_command(cli_args).await?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    info!("reflexsoar-agent shutting down.");
    Ok(())
}
