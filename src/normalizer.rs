// ===============================
// src/normalizer.rs
// ===============================
//
// Raw DTC record -> NormalizedEvent.
//
// Field names differ between peer versions, so every field is read through a
// fixed alias list tried in order (first present, non-empty value wins).
// Prices of 0 are treated as "not provided" (the peer zero-fills unset prices).
//
// normalize() is total: any malformed / unknown input yields None.
//
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::domain::{NormalizedEvent, OrderStatus, OrderUpdate, Side};
use crate::dtc::{self, MessageClass};
use crate::metrics::{NORMALIZED_EVENTS, UNKNOWN_MESSAGES};

pub const ACCOUNT_FIELDS: &[&str] = &["TradeAccount", "Account", "AccountID", "TradeAccountName"];
pub const SYMBOL_FIELDS: &[&str] = &["Symbol", "SymbolName", "Instrument"];
pub const BALANCE_FIELDS: &[&str] = &[
    "CashBalance",
    "BalanceAvailableForNewPositions",
    "AccountValue",
    "NetLiquidatingValue",
    "Balance",
];
pub const POSITION_QTY_FIELDS: &[&str] = &["Quantity", "PositionQuantity", "Qty", "NetPosition"];
pub const POSITION_PRICE_FIELDS: &[&str] = &["AveragePrice", "AvgPrice", "AveragePositionPrice", "Price"];
pub const ORDER_PRICE_FIELDS: &[&str] = &["AverageFillPrice", "LastFillPrice", "Price1", "Price"];
pub const FILL_PRICE_FIELDS: &[&str] = &["Price", "FillPrice", "AverageFillPrice", "LastFillPrice"];
pub const FILLED_QTY_FIELDS: &[&str] = &["FilledQuantity", "CumulativeFillQuantity", "LastFillQuantity"];
pub const FILL_QTY_FIELDS: &[&str] = &["Quantity", "FilledQuantity", "LastFillQuantity"];
pub const SIDE_FIELDS: &[&str] = &["BuySell", "Side"];
pub const STATUS_FIELDS: &[&str] = &["OrderStatus", "Status"];
pub const ORDER_ID_FIELDS: &[&str] = &["ServerOrderID", "OrderID"];
pub const PARENT_ID_FIELDS: &[&str] = &["ParentServerOrderID", "ParentOrderID"];
pub const OCO_FIELDS: &[&str] = &["OCOLinkedOrderServerOrderID", "OCOLinkedOrderID"];
pub const FILL_TIME_FIELDS: &[&str] = &["LastFillDateTime", "DateTime", "FillDateTime", "OrderReceivedDateTime"];
pub const POSITION_TIME_FIELDS: &[&str] = &["DateTime", "LastUpdateDateTime"];

fn first<'a>(v: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|k| match v.get(*k) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(x) => Some(x),
    })
}

fn as_f64(x: &Value) -> Option<f64> {
    let f = match x {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

fn num(v: &Value, aliases: &[&str]) -> Option<f64> {
    aliases.iter().find_map(|k| v.get(*k).and_then(as_f64))
}

/// Like `num` but 0 means "unset" and falls through to the next alias.
fn price(v: &Value, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .find_map(|k| v.get(*k).and_then(as_f64).filter(|p| *p != 0.0))
}

fn text(v: &Value, aliases: &[&str]) -> Option<String> {
    match first(v, aliases)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// DTC timestamps are unix seconds (possibly fractional); values that only
/// make sense as milliseconds are accepted too.
fn timestamp(v: &Value, aliases: &[&str]) -> Option<DateTime<Utc>> {
    let raw = num(v, aliases)?;
    if raw <= 0.0 {
        return None;
    }
    let millis = if raw > 1.0e12 { raw } else { raw * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn side(v: &Value) -> Option<Side> {
    match first(v, SIDE_FIELDS)? {
        Value::Number(n) => match n.as_i64()? {
            1 => Some(Side::Buy),
            2 => Some(Side::Sell),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
            "1" | "BUY" | "B" => Some(Side::Buy),
            "2" | "SELL" | "S" => Some(Side::Sell),
            _ => None,
        },
        _ => None,
    }
}

fn status(v: &Value) -> OrderStatus {
    match first(v, STATUS_FIELDS) {
        Some(x) => as_f64(x).map(|c| OrderStatus::from_code(c as i64)).unwrap_or(OrderStatus::Unknown),
        None => OrderStatus::Unknown,
    }
}

fn account(v: &Value) -> String {
    text(v, ACCOUNT_FIELDS).unwrap_or_default()
}

/// Pure mapping; never panics, same input -> same output.
pub fn normalize(v: &Value) -> Option<NormalizedEvent> {
    if !v.is_object() {
        return None;
    }
    let ty = dtc::type_of(v)?;
    match dtc::classify(ty) {
        MessageClass::Control | MessageClass::Reject | MessageClass::Unknown => None,
        MessageClass::TradeAccount => {
            let account = text(v, ACCOUNT_FIELDS)?;
            Some(NormalizedEvent::TradeAccount { account })
        }
        MessageClass::Balance => {
            let balance = num(v, BALANCE_FIELDS)?;
            let mut extras = v.as_object().cloned().unwrap_or_default();
            extras.remove("Type");
            Some(NormalizedEvent::BalanceUpdate { balance, account: account(v), extras })
        }
        MessageClass::Position => {
            if num(v, &["NoPositions"]).unwrap_or(0.0) != 0.0 {
                return None;
            }
            let symbol = text(v, SYMBOL_FIELDS)?;
            let qty = num(v, POSITION_QTY_FIELDS).unwrap_or(0.0);
            let avg_entry = price(v, POSITION_PRICE_FIELDS).unwrap_or(0.0);
            Some(NormalizedEvent::PositionUpdate {
                symbol,
                qty,
                avg_entry,
                account: account(v),
                timestamp: timestamp(v, POSITION_TIME_FIELDS),
            })
        }
        MessageClass::Order => {
            let symbol = text(v, SYMBOL_FIELDS)?;
            Some(NormalizedEvent::OrderUpdate(OrderUpdate {
                symbol,
                side: side(v),
                status: status(v),
                price: price(v, ORDER_PRICE_FIELDS),
                filled_qty: num(v, FILLED_QTY_FIELDS).unwrap_or(0.0),
                account: account(v),
                server_order_id: text(v, ORDER_ID_FIELDS),
                parent_server_order_id: text(v, PARENT_ID_FIELDS),
                oco_linked_order_id: text(v, OCO_FIELDS),
                fill_time: timestamp(v, FILL_TIME_FIELDS),
                historical: false,
            }))
        }
        MessageClass::HistoricalFill => {
            if num(v, &["NoOrderFills"]).unwrap_or(0.0) != 0.0 {
                return None;
            }
            let symbol = text(v, SYMBOL_FIELDS)?;
            Some(NormalizedEvent::OrderUpdate(OrderUpdate {
                symbol,
                side: side(v),
                status: OrderStatus::Filled,
                price: price(v, FILL_PRICE_FIELDS),
                filled_qty: num(v, FILL_QTY_FIELDS).unwrap_or(0.0),
                account: account(v),
                server_order_id: text(v, ORDER_ID_FIELDS),
                parent_server_order_id: None,
                oco_linked_order_id: None,
                fill_time: timestamp(v, FILL_TIME_FIELDS),
                historical: true,
            }))
        }
    }
}

/// `normalize` plus per-type counters for records that produced nothing.
#[derive(Debug, Default)]
pub struct Normalizer {
    unknown: Mutex<HashMap<i64, u64>>,
    dropped: AtomicU64,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&self, v: &Value) -> Option<NormalizedEvent> {
        let out = normalize(v);
        match (&out, dtc::type_of(v)) {
            (Some(ev), _) => {
                NORMALIZED_EVENTS.with_label_values(&[ev.kind()]).inc();
            }
            (None, Some(ty)) if dtc::classify(ty) == MessageClass::Unknown => {
                *self.unknown.lock().entry(ty).or_insert(0) += 1;
                UNKNOWN_MESSAGES.with_label_values(&[&ty.to_string()]).inc();
            }
            (None, Some(ty)) if dtc::classify(ty) == MessageClass::Control => {}
            (None, _) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        out
    }

    pub fn unknown_counts(&self) -> Vec<(i64, u64)> {
        let mut v: Vec<(i64, u64)> = self.unknown.lock().iter().map(|(k, n)| (*k, *n)).collect();
        v.sort();
        v
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
