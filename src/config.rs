// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : dtc_monitor — resilient DTC connection & trade-state core in Rust
Module  : config.rs
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
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

use crate::circuit_breaker::BreakerConfig;
use crate::dtc::LogonParams;
use crate::state::StartingBalances;

/// Where the remote DTC peer comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerMode {
    Live,
    Mock,
}

impl PeerMode {
    pub fn from_env(key: &str, default_mode: PeerMode) -> PeerMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" | "sim_peer" => PeerMode::Mock,
            "live" | "tcp" => PeerMode::Live,
            _ => default_mode,
        }
    }
}

/// `DTC_TRADE_MODE` -> TradeModeEnum carried in the logon request.
pub fn trade_mode_code(s: &str) -> i64 {
    match s.trim().to_ascii_lowercase().as_str() {
        "live" => 3,
        "sim" | "simulated" => 2,
        "debug" | "demo" => 1,
        _ => 0,
    }
}

#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Cap on the attempt counter itself.
    pub max_attempt: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_millis(1_000), cap: Duration::from_millis(60_000), max_attempt: 16 }
    }
}

#[derive(Clone, Debug)]
pub struct ConnConfig {
    pub host: String,
    pub port: u16,
    pub logon: LogonParams,
    pub heartbeat: Duration,
    pub watchdog: Duration,
    pub logon_grace: Duration,
    pub backoff: BackoffConfig,
    pub seed_stagger: Duration,
    pub request_timeout: Duration,
    pub timeout_scan: Duration,
    pub breaker: BreakerConfig,
}

impl ConnConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Localhost defaults, used by tests and the mock peer.
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port,
            logon: LogonParams {
                username: String::new(),
                password: String::new(),
                client_name: "dtc_monitor".into(),
                heartbeat_interval_secs: 5,
                trade_mode: 2,
            },
            heartbeat: Duration::from_secs(5),
            watchdog: Duration::from_secs(15),
            logon_grace: Duration::from_millis(2_000),
            backoff: BackoffConfig::default(),
            seed_stagger: Duration::from_millis(150),
            request_timeout: Duration::from_secs(10),
            timeout_scan: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Consecutive observations before a candidate scope is adopted.
    pub mode_switch_confirmations: u32,
    pub refresh_window: Duration,
    pub fills_lookback: Duration,
    /// Wait after the order/fill requests before rebuilding brackets.
    pub bracket_settle: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode_switch_confirmations: 2,
            refresh_window: Duration::from_millis(100),
            fills_lookback: Duration::from_secs(7 * 24 * 3600),
            bracket_settle: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TradingCfg {
    pub starting: StartingBalances,
    pub recovery_max_age_hours: u32,
    /// Round-trip commission per contract.
    pub commission_per_contract: f64,
    /// Dollars per point by symbol root, longest root wins.
    pub point_values: Vec<(String, f64)>,
}

impl Default for TradingCfg {
    fn default() -> Self {
        Self {
            starting: StartingBalances::default(),
            recovery_max_age_hours: 24,
            commission_per_contract: 0.0,
            point_values: parse_point_values("ES=50,MES=5,NQ=20,MNQ=2"),
        }
    }
}

impl TradingCfg {
    pub fn point_value_for(&self, symbol: &str) -> f64 {
        let sym = symbol.trim().to_ascii_uppercase();
        self.point_values
            .iter()
            .filter(|(root, _)| sym.starts_with(root.as_str()))
            .max_by_key(|(root, _)| root.len())
            .map(|(_, v)| *v)
            .unwrap_or(1.0)
    }

    pub fn commissions_for(&self, qty: f64) -> f64 {
        self.commission_per_contract * qty.abs()
    }
}

/// `ES=50,MES=5` -> [("ES", 50.0), ("MES", 5.0)]; bad pairs are skipped.
pub fn parse_point_values(s: &str) -> Vec<(String, f64)> {
    s.split(',')
        .filter_map(|pair| {
            let (root, v) = pair.split_once('=')?;
            let root = root.trim().to_ascii_uppercase();
            let v: f64 = v.trim().parse().ok()?;
            (!root.is_empty() && v > 0.0).then_some((root, v))
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct Args {
    pub peer_mode: PeerMode,
    pub conn: ConnConfig,
    pub router: RouterConfig,
    pub trading: TradingCfg,

    // files/metrics
    pub db_path: PathBuf,
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

/// Command-line overrides applied on top of the environment.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub env_file: Option<PathBuf>,
    pub mock: bool,
    pub db: Option<PathBuf>,
}

fn num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 3600))
}

pub fn load(ov: &Overrides) -> Args {
    // Make sure .env is read (explicit file first, then the working dir)
    match &ov.env_file {
        Some(path) => {
            let _ = dotenvy::from_path(path);
        }
        None => {
            let _ = dotenv();
        }
    }

    // ===== Peer =====
    let peer_mode = if ov.mock { PeerMode::Mock } else { PeerMode::from_env("PEER_MODE", PeerMode::Live) };
    let host = env::var("DTC_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = num("DTC_PORT", 11099u16);

    let heartbeat_secs = num("HEARTBEAT_SECS", 5u64).max(1);
    // Watchdog must outlast at least one heartbeat round trip
    let watchdog_secs = num("WATCHDOG_SECS", 15u64).max(heartbeat_secs.saturating_add(1));

    let logon = LogonParams {
        username: env::var("DTC_USERNAME").unwrap_or_default(),
        password: env::var("DTC_PASSWORD").unwrap_or_default(),
        client_name: env::var("DTC_CLIENT_NAME").unwrap_or_else(|_| "dtc_monitor".to_string()),
        heartbeat_interval_secs: heartbeat_secs,
        trade_mode: trade_mode_code(&env::var("DTC_TRADE_MODE").unwrap_or_else(|_| "sim".to_string())),
    };

    let conn = ConnConfig {
        host,
        port,
        logon,
        heartbeat: Duration::from_secs(heartbeat_secs),
        watchdog: Duration::from_secs(watchdog_secs),
        logon_grace: Duration::from_millis(num("LOGON_GRACE_MS", 2_000)),
        backoff: BackoffConfig {
            base: Duration::from_millis(num("RECONNECT_BASE_MS", 1_000u64).max(1)),
            cap: Duration::from_millis(num("RECONNECT_CAP_MS", 60_000)),
            max_attempt: num("RECONNECT_MAX_ATTEMPT", 16u32).min(32),
        },
        seed_stagger: Duration::from_millis(num("SEED_STAGGER_MS", 150)),
        request_timeout: Duration::from_secs(num("REQUEST_TIMEOUT_SECS", 10)),
        timeout_scan: Duration::from_secs(num("TIMEOUT_SCAN_SECS", 5u64).max(1)),
        breaker: BreakerConfig {
            failure_threshold: num("CB_FAILURE_THRESHOLD", 5u32).max(1),
            recovery_timeout: Duration::from_secs(num("CB_RECOVERY_SECS", 30)),
        },
    };

    // ===== Router =====
    let router = RouterConfig {
        mode_switch_confirmations: num("MODE_SWITCH_CONFIRMATIONS", 2u32).max(1),
        refresh_window: Duration::from_millis(num("REFRESH_WINDOW_MS", 100)),
        fills_lookback: days(num("FILLS_LOOKBACK_DAYS", 7u64)),
        ..RouterConfig::default()
    };

    // ===== Trading =====
    let trading = TradingCfg {
        starting: StartingBalances {
            sim: num("SIM_STARTING_BALANCE", 10_000.0),
            debug: num("DEBUG_STARTING_BALANCE", 10_000.0),
        },
        recovery_max_age_hours: num("RECOVERY_MAX_AGE_HOURS", 24),
        commission_per_contract: num("COMMISSION_PER_CONTRACT", 0.0),
        point_values: env::var("POINT_VALUES")
            .ok()
            .map(|s| parse_point_values(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| TradingCfg::default().point_values),
    };

    // ===== Files / metrics =====
    let db_path = ov
        .db
        .clone()
        .or_else(|| env::var("DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("dtc_monitor.sqlite3"));
    let record_file = env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty());
    let metrics_port = num("METRICS_PORT", 9899u16);

    Args { peer_mode, conn, router, trading, db_path, record_file, metrics_port }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_value_prefers_longest_root() {
        let t = TradingCfg::default();
        assert_eq!(t.point_value_for("ESZ5"), 50.0);
        assert_eq!(t.point_value_for("MESZ5"), 5.0);
        assert_eq!(t.point_value_for("mnqh6"), 2.0);
        assert_eq!(t.point_value_for("CLZ5"), 1.0);
    }

    #[test]
    fn malformed_point_values_are_skipped() {
        let v = parse_point_values("ES=50, junk, NQ=abc, =3, CL=1000");
        assert_eq!(v, vec![("ES".to_string(), 50.0), ("CL".to_string(), 1000.0)]);
    }

    #[test]
    fn huge_lookback_saturates() {
        assert_eq!(days(7), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(days(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn trade_mode_codes() {
        assert_eq!(trade_mode_code("LIVE"), 3);
        assert_eq!(trade_mode_code("sim"), 2);
        assert_eq!(trade_mode_code("debug"), 1);
        assert_eq!(trade_mode_code("?"), 0);
    }
}
