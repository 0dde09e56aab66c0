mod daemon;

use anyhow::{Context, Result};
use log::{error, info, warn};
use spi_handshake_stream::config::Config;
use std::fs;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger();

    // Parse command line arguments
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/spi-stream-bridge/config.yaml".to_string());

    info!("SPI stream bridge starting...");
    info!("Loading configuration from: {}", config_path);

    let config = load_config(&config_path)?;
    info!("Configuration loaded successfully");

    // Validate SPI device
    let spi_device_path = &config.spi.device;
    if !PathBuf::from(spi_device_path).exists() {
        error!("SPI device not found: {}", spi_device_path);
        return Err(anyhow::anyhow!("SPI device not found: {}", spi_device_path));
    }

    // stdin is read on its own task so a quiet input never holds up polling.
    let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if input_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });

    let mut daemon = daemon::Daemon::new(config, input_rx)?;

    // Setup signal handling via tokio
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?;

    info!("Bridge started successfully");

    loop {
        tokio::select! {
            result = daemon.poll() => {
                if let Err(e) = result {
                    error!("Bridge poll error: {}", e);
                    return Err(e);
                }
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match load_config(&config_path) {
                    Ok(new_config) => daemon.reload_config(new_config)?,
                    Err(e) => warn!("Keeping current configuration: {:#}", e),
                }
            }
        }
    }

    info!("SPI stream bridge shutdown complete");
    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
    serde_yaml::from_str(&content).context("Failed to parse configuration file")
}

fn init_logger() {
    // Log to stderr; stdout carries the bridged byte stream.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .init();
}
