//! Command-line probe for SMTP servers
//!
//! Connects to a mail server and reports:
//! - whether a test message to the configured mailbox is accepted
//! - optionally, whether the server accepts an envelope from a sender it
//!   should refuse (`--spoof`)

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use check_smtp_common::{
    config::{ProbeConfig, ServerConfig},
    logging,
};
use check_smtp_probe::{SMTP_PORT, TestEmail, TransportServer, check_delivery, check_spoofing};
use clap::Parser;
use tracing::info;

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "CHECK_SMTP_CONFIG";

/// Configuration file looked up in the working directory.
const DEFAULT_CONFIG: &str = "./check-smtp.config.ron";

/// Probe an SMTP server for delivery and sender spoofing
#[derive(Parser, Debug)]
#[command(name = "check-smtp")]
#[command(about = "Probe an SMTP server for delivery and sender spoofing", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a RON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mail server to probe (overrides the configuration)
    #[arg(short, long)]
    server: Option<String>,

    /// Port to connect to
    #[arg(short, long)]
    port: Option<u16>,

    /// Mailbox on the server that receives the test message
    #[arg(short, long)]
    recipient: Option<String>,

    /// Envelope sender for the delivery probe
    #[arg(short, long)]
    from: Option<String>,

    /// Also check whether the server accepts mail from this sender
    #[arg(long, value_name = "ADDRESS")]
    spoof: Option<String>,

    /// Name announced in EHLO
    #[arg(short, long)]
    local_name: Option<String>,
}

impl Cli {
    /// Overlays command-line values on the loaded configuration.
    fn apply(&self, mut config: ProbeConfig) -> ProbeConfig {
        if let Some(local_name) = &self.local_name {
            config.local_name.clone_from(local_name);
        }
        if let Some(from) = &self.from {
            config.from = Some(from.clone());
        }
        config
    }

    fn transport(&self, server: Option<&ServerConfig>) -> anyhow::Result<TransportServer> {
        let host = self
            .server
            .clone()
            .or_else(|| server.map(|s| s.host.clone()))
            .context("No server to probe: pass --server or set `server` in the configuration")?;
        let test_email = self
            .recipient
            .clone()
            .or_else(|| server.map(|s| s.test_email.clone()))
            .context("No test mailbox: pass --recipient or set `server.test_email` in the configuration")?;
        let port = self
            .port
            .or_else(|| server.map(|s| s.port))
            .unwrap_or(SMTP_PORT);

        Ok(TransportServer::new(host, test_email).with_port(port))
    }
}

/// Find the configuration file using the following precedence:
/// 1. `--config`
/// 2. `CHECK_SMTP_CONFIG` environment variable
/// 3. ./check-smtp.config.ron (current working directory)
///
/// Running without a configuration file is allowed.
fn find_config_file(
    explicit: Option<&Path>,
    from_env: Option<String>,
) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "Config file does not exist: {}", path.display());
        return Ok(Some(path.to_path_buf()));
    }

    if let Some(env_path) = from_env {
        let path = PathBuf::from(env_path);
        anyhow::ensure!(
            path.exists(),
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
        return Ok(Some(path));
    }

    let default = PathBuf::from(DEFAULT_CONFIG);
    Ok(default.exists().then_some(default))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    logging::init();

    let cli = Cli::parse();
    let config = match find_config_file(cli.config.as_deref(), std::env::var(CONFIG_ENV).ok())? {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ProbeConfig::load(&path)?
        }
        None => ProbeConfig::default(),
    };
    let config = cli.apply(config);
    let server = cli.transport(config.server.as_ref())?;

    let mut healthy = true;

    let mut email = TestEmail::new(config.sender(), &server.test_email);
    match check_delivery(&server, &config.local_name, &config.timeouts, &mut email).await {
        Ok(()) => println!("delivery: {} accepted the test message", server.server),
        Err(e) => {
            healthy = false;
            println!("delivery: failed at {}: {}", e.step(), e.cause());
        }
    }

    if let Some(spoofed) = &cli.spoof {
        match check_spoofing(&server, &config.local_name, &config.timeouts, spoofed).await {
            Ok(()) => {
                healthy = false;
                println!("spoofing: {} accepted mail from {spoofed}", server.server);
            }
            Err(e) => println!("spoofing: refused at {}: {}", e.step(), e.cause()),
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
