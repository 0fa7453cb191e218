// ===============================
// src/main.rs
// ===============================
/*
 # demo against the in-process peer
 cargo run -- --mock --db /tmp/dtc_monitor.sqlite3

 # connection / breaker / drift counters
 curl -s localhost:9899/metrics | egrep '^(dtc_connection_state|dtc_reconnects_scheduled_total|mode_drift_total|circuit_breaker_state)'
*/
/*
=============================================================================
Project : dtc_monitor — resilient DTC connection & trade-state core in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a DTC session alive (logon, heartbeat, watchdog, backoff
          reconnect behind a circuit breaker), normalizes and routes account,
          balance, position and order messages, caches per-mode balances,
          persists open positions and the closed-trade ledger in SQLite,
          exposes Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::{select, sync::mpsc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dtc_monitor::{
    bus::{self, EventBus},
    circuit_breaker::BreakerRegistry,
    config::{self, Overrides, PeerMode},
    connection::{DtcClient, DtcRequester},
    domain::Event,
    metrics,
    mock_peer::{MockPeer, MockPeerConfig},
    positions::PositionTracker,
    recorder,
    recovery::PositionRecoveryService,
    repository::{PositionRepository, SqlitePositionRepository},
    risk::TradingGuard,
    router::{self, MessageRouter},
    state::StateManager,
    trade_close::TradeCloseService,
};

#[derive(Parser, Debug)]
#[command(name = "dtc_monitor", version, about = "DTC trading monitor core")]
struct Cli {
    /// Read environment overrides from this file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Run against the in-process simulated peer
    #[arg(long)]
    mock: bool,
    /// SQLite repository path (overrides DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let cli = Cli::parse();
    let mut args = config::load(&Overrides { env_file: cli.env_file, mock: cli.mock, db: cli.db });

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    // ---- Simulated peer (optional) ----
    let _peer = match args.peer_mode {
        PeerMode::Mock => {
            let cfg = MockPeerConfig { walk: Some(Duration::from_secs(3)), ..MockPeerConfig::default() };
            match MockPeer::start("127.0.0.1:0", cfg).await {
                Ok(p) => {
                    args.conn.host = "127.0.0.1".into();
                    args.conn.port = p.port();
                    Some(p)
                }
                Err(e) => {
                    error!(error = %e, "mock peer failed to start");
                    return ExitCode::FAILURE;
                }
            }
        }
        PeerMode::Live => None,
    };

    info!(
        peer = ?args.peer_mode,
        addr = %args.conn.addr(),
        db = %args.db_path.display(),
        record = ?args.record_file,
        heartbeat = ?args.conn.heartbeat,
        watchdog = ?args.conn.watchdog,
        "startup config"
    );

    // ---- Repository ----
    let repo: Arc<dyn PositionRepository> = match SqlitePositionRepository::open(&args.db_path) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, path = %args.db_path.display(), "repository open failed");
            return ExitCode::FAILURE;
        }
    };

    // ---- Core ----
    let cancel = CancellationToken::new();
    let bus = EventBus::new(4096);
    let state = Arc::new(StateManager::new(args.trading.starting, bus.clone()));
    let breakers = BreakerRegistry::new();
    let breaker = breakers.get_or_create("dtc", args.conn.breaker.clone());
    let client = Arc::new(DtcClient::new(args.conn.clone(), breaker));
    let guard = Arc::new(TradingGuard::new(bus.clone()));
    let closer = Arc::new(TradeCloseService::new(repo.clone(), state.clone(), bus.clone(), args.trading.clone()));
    let tracker = Arc::new(PositionTracker::new(repo.clone(), state.clone(), closer.clone(), bus.clone()));

    // ---- Recorder (optional) ----
    let mut router = MessageRouter::new(args.router.clone(), state.clone(), repo.clone(), tracker, guard, bus.clone());
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(async move {
            if let Err(e) = recorder::run(rec_rx, path).await {
                error!(error = %e, "recorder stopped");
            }
        });
        tokio::spawn(recorder::forward_ui(bus.subscribe(), rec_tx.clone()));
        router = router.with_journal(rec_tx);
    }
    let router = Arc::new(router);

    tokio::spawn(bus::run_log_sink(bus.subscribe()));

    // ---- Recovery from the repository (before any peer traffic) ----
    let recovery = PositionRecoveryService::new(repo.clone(), state.clone(), bus.clone(), args.trading.recovery_max_age_hours);
    if let Err(e) = recovery.recover() {
        error!(error = %e, "position recovery failed");
    }

    // ---- Connection + router + commands ----
    let requester: Arc<dyn DtcRequester> = client.clone();
    tokio::spawn(router::run(router.clone(), client.subscribe(), requester.clone(), cancel.clone()));
    let (_cmd_tx, cmd_rx) = bus::command_channel(256);
    tokio::spawn(router::run_commands(cmd_rx, closer, router.clone(), requester));
    let conn_task = tokio::spawn(client.clone().run(cancel.clone()));

    // ---- Status heartbeat ----
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                let scope = state.current_scope();
                let b = client.breaker_stats();
                info!(
                    conn = ?client.state(),
                    mode = %scope.mode,
                    account = %scope.account,
                    balance = state.get_balance_for_mode(scope.mode, &scope.account),
                    open_positions = state.positions().len(),
                    pending_requests = client.tracker().pending_count(),
                    breaker = ?b.state,
                    "heartbeat"
                );
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), conn_task).await;
    ExitCode::SUCCESS
}
