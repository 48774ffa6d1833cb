//! sshtunnel - expose a local port through a public reverse SSH tunnel
//!
//! Run with:
//!   cargo run -- --port 8000

use anyhow::{Context, Result};
use clap::Parser;
use smol::io::{AsyncBufReadExt, BufReader};
use sshtunnel::ssh::{ServiceRegistry, TunnelEngine, TunnelOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Expose a local port on the internet without installing anything but ssh
#[derive(Parser, Debug)]
#[command(name = "sshtunnel")]
#[command(about = "Expose a local port through a reverse SSH tunnel", long_about = None)]
#[command(version)]
struct Cli {
    /// Local port to expose
    #[arg(
        short,
        long,
        required_unless_present = "list_services",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: Option<u16>,

    /// Service to use. Disables retrying with other services
    #[arg(short, long)]
    service: Option<String>,

    /// Service to leave out of the random selection (repeatable)
    #[arg(short = 'x', long)]
    exclude: Vec<String>,

    /// Seconds to wait for a service to print its URL (0 waits forever)
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Service table merged over the built-in services
    #[arg(long, env = "SSHTUNNEL_SERVICES")]
    services_file: Option<PathBuf>,

    /// ssh client binary
    #[arg(long, default_value = "ssh")]
    ssh: String,

    /// Close the tunnel after this many seconds instead of waiting for Enter
    #[arg(long)]
    duration: Option<u64>,

    /// List the known services and exit
    #[arg(long)]
    list_services: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("sshtunnel={},warn", cli.log_level)))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    smol::block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let registry = match &cli.services_file {
        Some(path) => ServiceRegistry::load(path).await?,
        None => ServiceRegistry::load_default().await?,
    };

    if cli.list_services {
        for (name, service) in registry.iter() {
            println!(
                "{:<16} {} (remote port {}, url {})",
                name,
                service.ssh_url(),
                service.port,
                service.url_pattern.as_str()
            );
        }
        return Ok(());
    }

    let port = cli.port.context("--port is required")?;
    let timeout = match cli.timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let mut options = TunnelOptions::new(port).with_url_timeout(timeout);
    if let Some(service) = cli.service {
        options = options.with_service(service);
    }
    for name in cli.exclude {
        options = options.excluding(name);
    }

    let engine = TunnelEngine::new()
        .with_registry(registry)
        .with_program(cli.ssh);

    println!("Opening tunnel for port {}...", port);
    let mut tunnel = engine
        .open(options)
        .await
        .context("Failed to open tunnel")?;

    println!("Local port: {}", tunnel.local_port());
    println!("Public URL: {}", tunnel.url());
    if let Some(pid) = tunnel.pid() {
        println!("Process ID: {}", pid);
    }

    match cli.duration {
        Some(secs) => {
            println!("Tunnel will stay open for {} seconds.", secs);
            smol::Timer::after(Duration::from_secs(secs)).await;
        }
        None => {
            println!("Press Enter to close the tunnel.");
            let mut stdin = BufReader::new(smol::Unblock::new(std::io::stdin()));
            let mut line = String::new();
            stdin
                .read_line(&mut line)
                .await
                .context("Failed to read stdin")?;
        }
    }

    tunnel.close().await;
    println!("Tunnel closed.");
    Ok(())
}
