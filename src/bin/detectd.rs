//! detectd - concurrent detection dispatch daemon
//!
//! 1. Loads configuration (JSON file, `DETECTD_*` env, command line)
//! 2. Starts the worker pool, process monitor, optional stream listener and heartbeat
//! 3. Serves the HTTP API until Ctrl-C or `POST /api/shutdown`
//! 4. Shuts down in stages: intake, sessions, detectors, queue, background loops

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use detect_dispatch::config::DetectdConfig;
use detect_dispatch::server::DetectionServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Concurrent detection dispatch daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "DETECTD_CONFIG")]
    config: Option<PathBuf>,

    /// Number of shared-queue workers (overrides the file and DETECTD_WORKERS).
    #[arg(long)]
    workers: Option<i64>,

    /// HTTP API port.
    #[arg(long)]
    api_port: Option<u16>,

    /// Inference backend: stub, or tract when built with `backend-tract`.
    #[arg(long)]
    backend: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = DetectdConfig::load_from(args.config.as_deref()).context("load config")?;
    if let Some(workers) = args.workers {
        config.set_workers(workers);
    }
    if let Some(port) = args.api_port {
        config.api_port = port;
    }
    if let Some(backend) = args.backend {
        config.inference_backend = backend;
    }

    let server = DetectionServer::new(config).start()?;
    log::info!(
        "detectd ready: api http://{}, metrics http://{}/metrics",
        server.api_addr(),
        server.metrics_addr()
    );
    if let Some(addr) = server.stream_addr() {
        log::info!("stream sessions on tcp://{}", addr);
    }

    let signal = server.shutdown_signal();
    let ctrlc_signal = signal.clone();
    ctrlc::set_handler(move || {
        ctrlc_signal.cancel();
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("waiting for shutdown signal (Ctrl-C or POST /api/shutdown)...");
    while !signal.wait(Duration::from_secs(1)) {}
    log::info!("shutdown signal received");
    server.shutdown()
}
