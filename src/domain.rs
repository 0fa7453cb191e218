// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::UiEvent;

/// Trading mode, derived from the account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Debug,
    Sim,
    Live,
}

impl Mode {
    /// `account -> mode`. Pure and total: empty / `debug*` is DEBUG,
    /// `sim*` is SIM, anything else is a real-funds account.
    pub fn from_account(account: &str) -> Mode {
        let a = account.trim().to_ascii_lowercase();
        if a.is_empty() || a.starts_with("debug") {
            Mode::Debug
        } else if a.starts_with("sim") {
            Mode::Sim
        } else {
            Mode::Live
        }
    }

    /// LIVE outranks SIM outranks DEBUG.
    pub fn precedence(&self) -> u8 {
        match self {
            Mode::Debug => 0,
            Mode::Sim => 1,
            Mode::Live => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Debug => "DEBUG",
            Mode::Sim => "SIM",
            Mode::Live => "LIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Mode::Debug),
            "SIM" => Some(Mode::Sim),
            "LIVE" => Some(Mode::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single "currently displayed" `(mode, account)` context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub mode: Mode,
    pub account: String,
}

impl Scope {
    pub fn new(mode: Mode, account: impl Into<String>) -> Self {
        Self { mode, account: account.into() }
    }

    pub fn for_account(account: &str) -> Self {
        Self::new(Mode::from_account(account), account)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new(Mode::Debug, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side { pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } } }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide { Long, Short }

impl PositionSide {
    pub fn from_qty(qty: f64) -> Option<Self> {
        if qty > 0.0 {
            Some(PositionSide::Long)
        } else if qty < 0.0 {
            Some(PositionSide::Short)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> PositionSide {
        if s.eq_ignore_ascii_case("SHORT") { PositionSide::Short } else { PositionSide::Long }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Sent,
    PendingOpen,
    PendingChild,
    Open,
    PendingCancelReplace,
    PendingCancel,
    Filled,
    Canceled,
    Rejected,
    PartiallyFilled,
    Unknown,
}

impl OrderStatus {
    /// DTC `OrderStatusEnum` codes.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => OrderStatus::Sent,
            2 => OrderStatus::PendingOpen,
            3 => OrderStatus::PendingChild,
            4 => OrderStatus::Open,
            5 => OrderStatus::PendingCancelReplace,
            6 => OrderStatus::PendingCancel,
            7 => OrderStatus::Filled,
            8 => OrderStatus::Canceled,
            9 => OrderStatus::Rejected,
            10 => OrderStatus::PartiallyFilled,
            _ => OrderStatus::Unknown,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(
            self,
            OrderStatus::Sent
                | OrderStatus::PendingOpen
                | OrderStatus::PendingChild
                | OrderStatus::Open
                | OrderStatus::PendingCancelReplace
                | OrderStatus::PendingCancel
                | OrderStatus::PartiallyFilled
        )
    }
}

/// Typed application events. Each one is derived from exactly one raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NormalizedEvent {
    TradeAccount {
        account: String,
    },
    BalanceUpdate {
        balance: f64,
        account: String,
        extras: serde_json::Map<String, serde_json::Value>,
    },
    PositionUpdate {
        symbol: String,
        qty: f64,
        avg_entry: f64,
        account: String,
        timestamp: Option<DateTime<Utc>>,
    },
    OrderUpdate(OrderUpdate),
}

impl NormalizedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedEvent::TradeAccount { .. } => "trade_account",
            NormalizedEvent::BalanceUpdate { .. } => "balance",
            NormalizedEvent::PositionUpdate { .. } => "position",
            NormalizedEvent::OrderUpdate(_) => "order",
        }
    }

    pub fn account(&self) -> &str {
        match self {
            NormalizedEvent::TradeAccount { account }
            | NormalizedEvent::BalanceUpdate { account, .. }
            | NormalizedEvent::PositionUpdate { account, .. } => account,
            NormalizedEvent::OrderUpdate(o) => &o.account,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub side: Option<Side>,
    pub status: OrderStatus,
    pub price: Option<f64>,
    pub filled_qty: f64,
    pub account: String,
    pub server_order_id: Option<String>,
    pub parent_server_order_id: Option<String>,
    pub oco_linked_order_id: Option<String>,
    pub fill_time: Option<DateTime<Utc>>,
    /// True when the record came from a historical-fill response.
    pub historical: bool,
}

/// Market context captured when a position opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub vwap: Option<f64>,
    pub cum_delta: Option<f64>,
    pub poc: Option<f64>,
}

/// One per `(mode, account)`; persisted by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub mode: Mode,
    pub account: String,
    pub symbol: String,
    pub qty: f64,
    pub side: PositionSide,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_snapshot: EntrySnapshot,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trade_min_price: f64,
    pub trade_max_price: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OpenPosition {
    pub fn scope(&self) -> Scope {
        Scope::new(self.mode, self.account.clone())
    }
}

/// Fields supplied when opening or scaling a position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_snapshot: EntrySnapshot,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
}

impl NewPosition {
    pub fn new(symbol: impl Into<String>, qty: f64, entry_price: f64, entry_time: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            entry_price,
            entry_time,
            entry_snapshot: EntrySnapshot::default(),
            target_price: None,
            stop_price: None,
        }
    }
}

/// Immutable ledger row, written exactly once per close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: i64,
    pub mode: Mode,
    pub account: String,
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub realized_pnl: f64,
    pub commissions: f64,
    pub mae: f64,
    pub mfe: f64,
    pub efficiency: Option<f64>,
    pub r_multiple: Option<f64>,
    pub trade_min_price: f64,
    pub trade_max_price: f64,
}

/// Parameters for the open -> closed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseParams {
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub point_value: f64,
    pub commissions: f64,
    /// Caller-observed excursions override the stored extremes when present.
    pub mae: Option<f64>,
    pub mfe: Option<f64>,
}

/// "Close requested" intent, as produced by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub exit_price: Option<f64>,
    pub symbol: Option<String>,
    pub account: Option<String>,
    pub exit_time: Option<DateTime<Utc>>,
    pub mae: Option<f64>,
    pub mfe: Option<f64>,
    pub commissions: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Excursions {
    pub mae: f64,
    pub mfe: f64,
    pub efficiency: Option<f64>,
    pub r_multiple: Option<f64>,
}

/// Signed qty: positive long, negative short.
pub fn realized_pnl(entry: f64, exit: f64, qty: f64, point_value: f64, commissions: f64) -> f64 {
    (exit - entry) * qty * point_value - commissions
}

/// MAE/MFE in dollars from the stored price extremes; both non-negative.
pub fn excursions(
    side: PositionSide,
    entry: f64,
    trade_min: f64,
    trade_max: f64,
    qty: f64,
    point_value: f64,
) -> (f64, f64) {
    let size = qty.abs() * point_value;
    let (adverse, favorable) = match side {
        PositionSide::Long => (entry - trade_min, trade_max - entry),
        PositionSide::Short => (trade_max - entry, entry - trade_min),
    };
    ((adverse * size).max(0.0), (favorable * size).max(0.0))
}

pub fn trade_metrics(
    pos: &OpenPosition,
    params: &CloseParams,
    pnl: f64,
) -> Excursions {
    let (mae, mfe) = excursions(
        pos.side,
        pos.entry_price,
        pos.trade_min_price.min(params.exit_price),
        pos.trade_max_price.max(params.exit_price),
        pos.qty,
        params.point_value,
    );
    let mae = params.mae.unwrap_or(mae);
    let mfe = params.mfe.unwrap_or(mfe);
    let efficiency = if mfe > 0.0 { Some((pnl / mfe).clamp(0.0, 1.0)) } else { None };
    let r_multiple = pos.stop_price.and_then(|stop| {
        let risk = (pos.entry_price - stop).abs() * pos.qty.abs() * params.point_value;
        if risk > 0.0 { Some(pnl / risk) } else { None }
    });
    Excursions { mae, mfe, efficiency, r_multiple }
}

/// Journal record (see recorder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Normalized(NormalizedEvent), Ui(UiEvent), Note(String) }
