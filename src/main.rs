//! SiteProxy - Main entry point
//!
//! A URL-rewriting HTTP/HTTPS reverse proxy

use anyhow::{Context, Result};
use clap::Parser;
use siteproxy::{HttpTransport, ProxyConfig, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// SiteProxy - A URL-rewriting HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "siteproxy")]
#[command(author = "SiteProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A URL-rewriting HTTP/HTTPS reverse proxy with per-site injection")]
struct Args {
    /// Configuration file (JSON); the built-in default is used when omitted
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting SiteProxy v1.0.0");

    let config = match &args.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            info!("No config file given, using built-in defaults");
            ProxyConfig::default()
        }
    };

    info!("HTTP port: {}", config.plain_port);
    info!("HTTPS port: {}", config.secure_port);
    info!("Proxy hostname: {}", config.hostname);

    let transport = HttpTransport::new().context("Failed to create upstream client")?;

    let server = Arc::new(ProxyServer::new(config, Arc::new(transport)));
    server.run().await?;

    Ok(())
}
