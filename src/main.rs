#![warn(clippy::all)]

mod domain_filter;
mod error;
mod fragment;
mod handler;
mod listener;
mod relay;
mod request;
mod stats;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::domain_filter::DomainFilter;
use crate::handler::{ProxyConfig, TcpDialer};
use crate::stats::Stats;

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Hosts whose ClientHello gets fragmented (substring match).
    #[arg(long, default_value = "list.txt")]
    filter_list: PathBuf,

    /// Hosts refused on port 443 (substring match).
    #[arg(long, default_value = "block.txt")]
    block_list: PathBuf,

    /// Upstream connect timeout in seconds, 0 waits forever.
    #[arg(long, default_value_t = 0)]
    connect_timeout: u64,

    /// Only fragment the first read when it is a TLS ClientHello.
    #[arg(long)]
    verify_client_hello: bool,

    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        args.log_level.as_str()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let filter = DomainFilter::load(&args.filter_list, &args.block_list)
        .context("failed to load domain lists")?;

    let stats = Arc::new(Stats::new());

    if args.stats_interval > 0 {
        let stats_clone = stats.clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                stats_clone.print();
            }
        });
    }

    let config = ProxyConfig {
        filter: Arc::new(filter),
        stats,
        verify_client_hello: args.verify_client_hello,
    };

    let dialer = TcpDialer {
        connect_timeout: (args.connect_timeout > 0)
            .then(|| Duration::from_secs(args.connect_timeout)),
    };

    let addr = listen_addr(&args.host, args.port)?;

    let listener = listener::bind(addr).with_context(|| format!("failed to bind {}", addr))?;

    info!("Proxy listening on {}", addr);
    if config.verify_client_hello {
        info!("Fragmenting only reads that look like a ClientHello");
    }

    listener::serve(
        listener,
        config,
        Arc::new(dialer),
        shutdown_signal(tokio::signal::ctrl_c()),
    )
    .await;

    info!("Proxy stopped");

    Ok(())
}

fn listen_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("invalid listen address {}", host))?;
    Ok(SocketAddr::new(ip, port))
}

// Without a working Ctrl-C handler the proxy runs until it is killed.
async fn shutdown_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
