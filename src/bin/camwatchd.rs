//! camwatchd - multi-camera detection dashboard daemon
//!
//! This daemon:
//! 1. Loads config (file named by CAMWATCH_CONFIG, then env overrides)
//! 2. Loads the detector once, plus the optional alert sound and overlay font
//! 3. Starts the configured startup cameras
//! 4. Serves the dashboard, control plane and MJPEG streams
//! 5. On Ctrl-C stops the server, then every camera with a bounded wait

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use camwatch::{
    api::{ApiConfig, ApiServer},
    build_session_context, CameraRegistry, CamwatchConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera person detection dashboard")]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:5000.
    #[arg(long, env = "CAMWATCH_ADDR")]
    addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    // flags feed the same variables the config loader reads
    if let Some(path) = &args.config {
        std::env::set_var("CAMWATCH_CONFIG", path);
    }
    if let Some(addr) = &args.addr {
        std::env::set_var("CAMWATCH_ADDR", addr);
    }
    let config = CamwatchConfig::load()?;

    let ctx = build_session_context(&config)?;
    let registry = Arc::new(CameraRegistry::new(
        ctx,
        config.capture.clone(),
        config.shutdown_timeout,
    ));

    for camera in &config.cameras {
        match registry.add(&camera.id, &camera.source) {
            Ok(()) => log::info!("startup camera {} added ({})", camera.id, camera.source),
            Err(err) => log::warn!("startup camera {} skipped: {}", camera.id, err),
        }
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, registry.clone()).spawn()?;
    log::info!("camwatchd running. dashboard at http://{}/", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    let stragglers = registry.shutdown(config.shutdown_timeout);
    if stragglers.is_empty() {
        log::info!("all cameras stopped");
    } else {
        log::warn!("abandoning cameras still running: {}", stragglers.join(", "));
    }
    Ok(())
}
