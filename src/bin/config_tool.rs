//! CLI tool for inspecting proxy configuration files
//!
//! Usage:
//!   siteproxy-config check <config>
//!   siteproxy-config assets <config> [--json]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use siteproxy::{AssetRegistry, ProxyConfig};
use std::path::{Path, PathBuf};

/// CLI tool for validating SiteProxy configuration
#[derive(Parser, Debug)]
#[command(name = "siteproxy-config")]
#[command(author = "SiteProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Validate SiteProxy configuration files")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load a configuration and report what it proxies
    Check {
        /// Configuration file (JSON)
        config: PathBuf,
    },

    /// List every injected asset with its static URL
    Assets {
        /// Configuration file (JSON)
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load(path: &Path) -> Result<ProxyConfig> {
    ProxyConfig::load(path).with_context(|| format!("Invalid config {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Check { config } => {
            let proxy = load(&config)?;
            let registry = AssetRegistry::new(&proxy);

            println!("Config OK: {}", config.display());
            println!("  Hostname:     {}", proxy.hostname);
            println!("  Ports:        {} (http), {} (https)", proxy.plain_port, proxy.secure_port);
            println!(
                "  Certificate:  {}",
                if proxy.tls.is_some() { "configured" } else { "self-signed" }
            );
            println!(
                "  Access gate:  {}",
                match &proxy.auth {
                    Some(credential) => format!("enabled for {}", credential.username()),
                    None => "disabled".to_string(),
                }
            );
            println!("  Sites:        {}", proxy.sites.len());
            println!("  Assets:       {}", registry.len());

            for (index, site) in proxy.sites.iter().enumerate() {
                for inject in site.injects.iter().filter(|i| !i.absolute_path.is_file()) {
                    eprintln!(
                        "warning: sites[{}] injects missing file {}",
                        index,
                        inject.absolute_path.display()
                    );
                }
            }
        }

        Commands::Assets { config, json } => {
            let proxy = load(&config)?;

            let assets: Vec<_> = proxy
                .sites
                .iter()
                .enumerate()
                .flat_map(|(index, site)| site.injects.iter().map(move |inject| (index, inject)))
                .collect();

            if assets.is_empty() {
                println!("No injected assets");
                return Ok(());
            }

            if json {
                let json_output: Vec<serde_json::Value> = assets
                    .iter()
                    .map(|(index, inject)| {
                        serde_json::json!({
                            "site": index,
                            "hash": inject.content_hash,
                            "file_name": inject.file_name,
                            "path": inject.absolute_path.display().to_string(),
                            "url": inject.static_url(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            } else {
                println!("{:<6} {:<30} {:<80}", "SITE", "FILE", "URL");
                println!("{}", "-".repeat(118));

                for (index, inject) in &assets {
                    println!("{:<6} {:<30} {:<80}", index, inject.file_name, inject.static_url());
                }

                println!("\nTotal: {} asset(s)", assets.len());
            }
        }
    }

    Ok(())
}
