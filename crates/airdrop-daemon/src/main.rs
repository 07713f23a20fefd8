//! airdrop-daemon - serves airdrop claims over HTTP.
//!
//! Startup order:
//!
//! 1. parse arguments and load `airdrop.toml`
//! 2. build the Tokio runtime and initialize logging
//! 3. open the ledger and report claims left `Reserved` by a previous run
//! 4. connect the chain client and serve until SIGINT or SIGTERM
//!
//! In-flight claims are allowed to finish during graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use airdrop_core::claim::ClaimCoordinator;
use airdrop_core::config::AirdropConfig;
use airdrop_core::ledger::{ClaimLedger, ClaimState, SqliteClaimLedger};
use airdrop_core::status::StatusReader;
use airdrop_core::transfer::rpc::RpcChainClient;
use airdrop_core::transfer::{ChainClient, TransferExecutor};
use airdrop_daemon::{AppState, router};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "airdrop-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "airdrop.toml")]
    config: PathBuf,

    /// Path to the ledger database file (`SQLite`), overriding
    /// `storage.database_path`
    #[arg(long)]
    ledger_db: Option<PathBuf>,

    /// Address to listen on, overriding `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AIRDROP_LOG")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("failed to open log file {}", log_file.display()))?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let mut config = AirdropConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    if let Some(path) = args.ledger_db {
        config.storage.database_path = path;
    }
    if let Some(addr) = args.listen {
        config.server.listen_addr = addr;
    }

    info!(
        config = %args.config.display(),
        max_participants = config.distribution.max_participants,
        airdrop_amount = %config.distribution.airdrop_amount,
        token_contract = %config.chain.token_contract,
        sender = %config.chain.sender_address,
        "Starting airdrop daemon"
    );

    let ledger = SqliteClaimLedger::open(&config.storage.database_path, config.ledger_options())
        .with_context(|| {
            format!(
                "failed to open ledger at {}",
                config.storage.database_path.display()
            )
        })?;
    info!(path = %config.storage.database_path.display(), "Ledger opened");
    report_unreconciled(&ledger)?;
    let ledger: Arc<dyn ClaimLedger> = Arc::new(ledger);

    let rpc_settings = config.rpc_settings()?;
    let client = RpcChainClient::new(rpc_settings).context("failed to build chain client")?;
    let executor = TransferExecutor::new(
        Arc::new(client) as Arc<dyn ChainClient>,
        config.transfer_timeouts(),
    );

    let state = AppState {
        coordinator: ClaimCoordinator::new(
            Arc::clone(&ledger),
            Arc::new(executor),
            config.distribution.airdrop_amount,
        ),
        reader: StatusReader::new(Arc::clone(&ledger)),
    };

    let addr = config.server.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Airdrop daemon stopped");
    Ok(())
}

/// Logs every claim a previous run left `Reserved`.
///
/// Their transfers may or may not have happened, so they are never retried
/// automatically.
fn report_unreconciled(ledger: &SqliteClaimLedger) -> Result<()> {
    let stale = ledger
        .list_in_state(ClaimState::Reserved)
        .context("failed to scan ledger for unreconciled claims")?;
    if stale.is_empty() {
        return Ok(());
    }

    warn!(
        count = stale.len(),
        "Found claims left reserved by a previous run; verify their transfers on chain"
    );
    for record in &stale {
        warn!(
            participant_id = %record.participant_id,
            wallet_address = %record.wallet_address,
            reserved_at = %record.created_at(),
            "Unreconciled claim"
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {e}");
                return std::future::pending().await;
            },
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        },
    }
}
