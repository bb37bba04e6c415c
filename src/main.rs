//! vhostproxy - Main entry point
//!
//! A TLS-terminating, name-based virtual-hosting reverse proxy

use anyhow::{Context, Result};
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vhostproxy::{load_targets_file, ProxyConfig, ProxyServer, TargetFlag, TargetFlags};

/// vhostproxy - Serve many TLS domains from one socket
///
/// Each target set is one --host, --targeturl, --certfile and --keyfile,
/// given together in any order; a set ends when one of its flags repeats.
#[derive(Parser, Debug)]
#[command(name = "vhostproxy")]
#[command(version)]
#[command(about = "A TLS-terminating, name-based virtual-hosting reverse proxy")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:443")]
    listen: SocketAddr,

    /// Domain served by a target set, port included if clients send one
    #[arg(long = "host", value_name = "DOMAIN")]
    hosts: Vec<String>,

    /// Backend URL of a target set (http:// or https://)
    #[arg(long = "targeturl", value_name = "URL")]
    target_urls: Vec<String>,

    /// PEM certificate chain of a target set
    #[arg(long = "certfile", value_name = "PATH")]
    cert_files: Vec<String>,

    /// PEM private key of a target set
    #[arg(long = "keyfile", value_name = "PATH")]
    key_files: Vec<String>,

    /// JSON file with additional target sets, loaded after the flags
    #[arg(long, env = "TARGETS_FILE")]
    targets: Option<PathBuf>,

    /// Seconds allowed for a client TLS handshake
    #[arg(long, env = "HANDSHAKE_TIMEOUT", default_value = "10")]
    handshake_timeout: u64,

    /// Seconds allowed for reading an HTTP/1 request head
    #[arg(long, env = "HEADER_READ_TIMEOUT", default_value = "30")]
    header_read_timeout: u64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting vhostproxy v{}", env!("CARGO_PKG_VERSION"));

    let mut specs = target_flags(&args, &matches).into_specs()?;

    if let Some(path) = &args.targets {
        specs.extend(load_targets_file(path)?);
        info!("Loaded target sets from {}", path.display());
    }

    let config = ProxyConfig {
        listen_addr: args.listen,
        handshake_timeout: Duration::from_secs(args.handshake_timeout),
        header_read_timeout: Duration::from_secs(args.header_read_timeout),
    };

    let server = ProxyServer::from_specs(config, &specs).context("refusing to start")?;

    server.run().await
}

/// Pair each target-set flag value with its command-line position.
fn target_flags(args: &Args, matches: &ArgMatches) -> TargetFlags {
    let mut flags = TargetFlags::default();
    let columns = [
        (TargetFlag::Host, "hosts", &args.hosts),
        (TargetFlag::TargetUrl, "target_urls", &args.target_urls),
        (TargetFlag::CertFile, "cert_files", &args.cert_files),
        (TargetFlag::KeyFile, "key_files", &args.key_files),
    ];

    for (flag, id, values) in columns {
        let positions = matches.indices_of(id).into_iter().flatten();
        for (position, value) in positions.zip(values) {
            flags.push(position, flag, value.clone());
        }
    }

    flags
}
