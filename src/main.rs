#![warn(clippy::all)]

use cacheproxy::console::{self, ConsoleExit};
use cacheproxy::{ProxyConfig, ProxyError, ProxyServer};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{info, warn};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = cacheproxy::config::DEFAULT_PORT)]
    port: u16,

    /// File with one blocked host per line
    #[arg(long)]
    blocklist: Option<PathBuf>,

    #[arg(long, default_value = cacheproxy::config::DEFAULT_REPORT_PATH)]
    report: PathBuf,

    /// Seconds to wait for outbound connects, 0 waits forever
    #[arg(long, default_value_t = 0)]
    connect_timeout: u64,

    /// Seconds between stats lines, 0 disables them
    #[arg(long, default_value_t = 0)]
    stats_interval: u64,

    /// Wait for the `start` console command instead of listening at launch
    #[arg(long)]
    no_start: bool,

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
        .worker_threads(num_cpus::get() * 2)
        .enable_all()
        .build()?;

    let result = runtime.block_on(run(args));
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;

    let connect_timeout = if args.connect_timeout > 0 {
        Some(Duration::from_secs(args.connect_timeout))
    } else {
        None
    };

    let config = ProxyConfig::default()
        .with_listen_addr(addr)
        .with_report_path(args.report.clone())
        .with_connect_timeout(connect_timeout);

    let server = Arc::new(ProxyServer::new(config));

    if let Some(ref path) = args.blocklist {
        server.context().blocklist.load(path)?;
    }

    if args.stats_interval > 0 {
        let ctx = server.context().clone();
        let interval = args.stats_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(interval));
            loop {
                timer.tick().await;
                ctx.stats.print();
            }
        });
    }

    if !args.no_start {
        match server.start().await {
            Ok(_) => {}
            Err(ProxyError::Bind { source, .. }) if source.kind() == ErrorKind::AddrInUse => {
                anyhow::bail!(
                    "port {} already in use, run with a different port: --port {}",
                    args.port,
                    args.port.wrapping_add(1)
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    let exit_rx = spawn_console(Arc::clone(&server));

    tokio::select! {
        exit = exit_rx => {
            if !matches!(exit, Ok(ConsoleExit::Quit)) {
                info!("Console input closed, press Ctrl-C to exit");
                tokio::signal::ctrl_c().await?;
            }
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    server.stop();
    Ok(())
}

// ============================================================================
// CONSOLE
// ============================================================================

fn spawn_console(server: Arc<ProxyServer>) -> oneshot::Receiver<ConsoleExit> {
    let (exit_tx, exit_rx) = oneshot::channel();
    let handle = tokio::runtime::Handle::current();

    // stdout is not locked for the session; the log subscriber writes there too.
    let spawned = std::thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let exit = match console::run(&server, &handle, stdin.lock(), std::io::stdout()) {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(error = %e, "Console failed");
                    ConsoleExit::EndOfInput
                }
            };
            let _ = exit_tx.send(exit);
        });

    if let Err(e) = spawned {
        warn!(error = %e, "Could not start console");
    }

    exit_rx
}
