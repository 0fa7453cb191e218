// ===============================
// src/dtc.rs
// ===============================
//
// DTC JSON codec (pure functions, no I/O):
// - NUL-terminated framing (FrameBuffer)
// - message type codes + classification
// - logon / heartbeat / request payload builders
// - binary-encoding mismatch heuristic
// - ordered, staggered seed request plan
//
use std::time::Duration;

use serde_json::{json, Value};

/// Frame terminator. Never part of a payload.
pub const TERMINATOR: u8 = 0x00;
pub const PROTOCOL_VERSION: i64 = 8;

// ---- Message type codes ----
pub const LOGON_REQUEST: i64 = 1;
pub const LOGON_RESPONSE: i64 = 2;
pub const HEARTBEAT: i64 = 3;
pub const LOGOFF: i64 = 5;
pub const ENCODING_REQUEST: i64 = 6;
pub const ENCODING_RESPONSE: i64 = 7;
pub const OPEN_ORDERS_REQUEST: i64 = 300;
pub const ORDER_UPDATE: i64 = 301;
pub const OPEN_ORDERS_REJECT: i64 = 302;
pub const HISTORICAL_ORDER_FILLS_REQUEST: i64 = 303;
pub const HISTORICAL_ORDER_FILL_RESPONSE: i64 = 304;
pub const CURRENT_POSITIONS_REQUEST: i64 = 305;
pub const POSITION_UPDATE: i64 = 306;
pub const CURRENT_POSITIONS_REJECT: i64 = 307;
pub const TRADE_ACCOUNTS_REQUEST: i64 = 400;
pub const TRADE_ACCOUNT_RESPONSE: i64 = 401;
pub const ACCOUNT_BALANCE_UPDATE: i64 = 600;
pub const ACCOUNT_BALANCE_REQUEST: i64 = 601;

/// `LogonStatusEnum::LOGON_SUCCESS`
pub const LOGON_SUCCESS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Heartbeat, encoding ack, logon response: never become events.
    Control,
    TradeAccount,
    Balance,
    Position,
    Order,
    HistoricalFill,
    /// Request rejects and other known-but-unrouted records.
    Reject,
    Unknown,
}

pub fn classify(type_code: i64) -> MessageClass {
    match type_code {
        LOGON_RESPONSE | HEARTBEAT | LOGOFF | ENCODING_RESPONSE => MessageClass::Control,
        TRADE_ACCOUNT_RESPONSE => MessageClass::TradeAccount,
        ACCOUNT_BALANCE_UPDATE => MessageClass::Balance,
        POSITION_UPDATE => MessageClass::Position,
        ORDER_UPDATE => MessageClass::Order,
        HISTORICAL_ORDER_FILL_RESPONSE => MessageClass::HistoricalFill,
        OPEN_ORDERS_REJECT | CURRENT_POSITIONS_REJECT => MessageClass::Reject,
        _ => MessageClass::Unknown,
    }
}

pub fn is_known_type(type_code: i64) -> bool {
    matches!(
        type_code,
        LOGON_REQUEST
            | LOGON_RESPONSE
            | HEARTBEAT
            | LOGOFF
            | ENCODING_REQUEST
            | ENCODING_RESPONSE
            | OPEN_ORDERS_REQUEST
            | ORDER_UPDATE
            | OPEN_ORDERS_REJECT
            | HISTORICAL_ORDER_FILLS_REQUEST
            | HISTORICAL_ORDER_FILL_RESPONSE
            | CURRENT_POSITIONS_REQUEST
            | POSITION_UPDATE
            | CURRENT_POSITIONS_REJECT
            | TRADE_ACCOUNTS_REQUEST
            | TRADE_ACCOUNT_RESPONSE
            | ACCOUNT_BALANCE_UPDATE
            | ACCOUNT_BALANCE_REQUEST
    )
}

/// `Type` field of a record; accepts numbers and numeric strings.
pub fn type_of(v: &Value) -> Option<i64> {
    match v.get("Type")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn request_id_of(v: &Value) -> Option<u32> {
    v.get("RequestID").and_then(|x| x.as_u64()).and_then(|x| u32::try_from(x).ok())
}

pub fn is_logon_success(v: &Value) -> bool {
    type_of(v) == Some(LOGON_RESPONSE)
        && v.get("Result").and_then(|r| r.as_i64()) == Some(LOGON_SUCCESS)
}

pub fn is_logon_response(v: &Value) -> bool {
    type_of(v) == Some(LOGON_RESPONSE)
}

// ---- Framing ----

/// Bytes that could not be decoded as a JSON record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Looks like the binary DTC encoding rather than JSON.
    #[error("binary-encoded frame ({len} bytes)")]
    EncodingMismatch { len: usize },
    #[error("malformed frame ({len} bytes): {reason}")]
    Malformed { len: usize, reason: String },
}

/// Longest unterminated record the buffer will hold.
pub const MAX_FRAME: usize = 1024 * 1024;

/// Inbound buffer: accumulate bytes, pop complete records.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { buf: Vec::with_capacity(8 * 1024), max_frame }
    }

    /// Appends `bytes`. An unterminated tail longer than the frame limit is
    /// discarded and reported; complete frames before it stay queued.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.buf.extend_from_slice(bytes);
        let tail_start = self.buf.iter().rposition(|b| *b == TERMINATOR).map_or(0, |p| p + 1);
        let len = self.buf.len() - tail_start;
        if len <= self.max_frame {
            return Ok(());
        }
        let head = &self.buf[tail_start..tail_start + len.min(64)];
        let err = if looks_binary(head) {
            FrameError::EncodingMismatch { len }
        } else {
            FrameError::Malformed { len, reason: format!("no terminator within {} bytes", self.max_frame) }
        };
        self.buf.truncate(tail_start);
        Err(err)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame (terminator stripped), or None if incomplete.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|b| *b == TERMINATOR)?;
        let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
        frame.pop();
        Some(frame)
    }

    /// Drain every complete record in receipt order. Empty frames are skipped.
    pub fn drain_records(&mut self) -> Vec<Result<Value, FrameError>> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame() {
            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            out.push(decode_record(&frame));
        }
        out
    }
}

pub fn decode_record(frame: &[u8]) -> Result<Value, FrameError> {
    match serde_json::from_slice::<Value>(frame) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err(FrameError::Malformed { len: frame.len(), reason: "not an object".into() }),
        Err(e) => {
            if looks_binary(frame) {
                Err(FrameError::EncodingMismatch { len: frame.len() })
            } else {
                Err(FrameError::Malformed { len: frame.len(), reason: e.to_string() })
            }
        }
    }
}

/// Binary DTC records start with a little-endian u16 size followed by a
/// u16 type code; JSON records start with `{`.
pub fn looks_binary(frame: &[u8]) -> bool {
    if frame.first() == Some(&b'{') {
        return false;
    }
    if frame.len() >= 4 {
        let ty = u16::from_le_bytes([frame[2], frame[3]]) as i64;
        if is_known_type(ty) {
            return true;
        }
    }
    if frame.is_empty() {
        return false;
    }
    let non_printable = frame
        .iter()
        .filter(|b| !(b.is_ascii_graphic() || b.is_ascii_whitespace()))
        .count();
    non_printable * 10 >= frame.len() * 3
}

/// Serialize one record + terminator.
pub fn encode(v: &Value) -> Vec<u8> {
    let mut out = serde_json::to_vec(v).unwrap_or_else(|_| b"{}".to_vec());
    out.retain(|b| *b != TERMINATOR);
    out.push(TERMINATOR);
    out
}

// ---- Payload builders ----

#[derive(Debug, Clone)]
pub struct LogonParams {
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub heartbeat_interval_secs: u64,
    /// DTC TradeModeEnum: 0 = unset, 1 = demo, 2 = simulated, 3 = live
    pub trade_mode: i64,
}

pub fn logon_request(p: &LogonParams) -> Value {
    json!({
        "Type": LOGON_REQUEST,
        "ProtocolVersion": PROTOCOL_VERSION,
        "Username": p.username,
        "Password": p.password,
        "GeneralTextData": "",
        "Integer_1": 0,
        "Integer_2": 0,
        "HeartbeatIntervalInSeconds": p.heartbeat_interval_secs,
        "TradeMode": p.trade_mode,
        "TradeAccount": "",
        "HardwareIdentifier": "",
        "ClientName": p.client_name,
    })
}

pub fn heartbeat(num_drops: u32) -> Value {
    json!({ "Type": HEARTBEAT, "NumDroppedMessages": num_drops, "CurrentDateTime": chrono::Utc::now().timestamp() })
}

pub fn trade_accounts_request(request_id: u32) -> Value {
    json!({ "Type": TRADE_ACCOUNTS_REQUEST, "RequestID": request_id })
}

pub fn open_orders_request(request_id: u32, account: Option<&str>) -> Value {
    json!({
        "Type": OPEN_ORDERS_REQUEST,
        "RequestID": request_id,
        "RequestAllOrders": 1,
        "ServerOrderID": "",
        "TradeAccount": account.unwrap_or(""),
    })
}

pub fn historical_fills_request(request_id: u32, since_unix: i64, account: Option<&str>) -> Value {
    json!({
        "Type": HISTORICAL_ORDER_FILLS_REQUEST,
        "RequestID": request_id,
        "ServerOrderID": "",
        "NumberOfDays": 0,
        "TradeAccount": account.unwrap_or(""),
        "StartDateTime": since_unix,
    })
}

pub fn current_positions_request(request_id: u32, account: Option<&str>) -> Value {
    json!({ "Type": CURRENT_POSITIONS_REQUEST, "RequestID": request_id, "TradeAccount": account.unwrap_or("") })
}

pub fn account_balance_request(request_id: u32, account: Option<&str>) -> Value {
    json!({ "Type": ACCOUNT_BALANCE_REQUEST, "RequestID": request_id, "TradeAccount": account.unwrap_or("") })
}

// ---- Seed burst ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    TradeAccounts,
    OpenOrders,
    HistoricalFills,
    CurrentPositions,
    AccountBalance,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::TradeAccounts => "trade_accounts",
            RequestKind::OpenOrders => "open_orders",
            RequestKind::HistoricalFills => "historical_fills",
            RequestKind::CurrentPositions => "current_positions",
            RequestKind::AccountBalance => "account_balance",
        }
    }
}

/// Seed requests issued on SESSION_READY, with non-decreasing offsets from
/// the moment the session became ready.
pub fn seed_plan(stagger: Duration) -> Vec<(RequestKind, Duration)> {
    [
        RequestKind::TradeAccounts,
        RequestKind::OpenOrders,
        RequestKind::HistoricalFills,
        RequestKind::AccountBalance,
    ]
    .into_iter()
    .enumerate()
    .map(|(i, k)| (k, stagger * i as u32))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminator_across_reads() {
        let mut fb = FrameBuffer::new();
        fb.extend(b"{\"Type\":3}\0{\"Type\":").unwrap();
        let first = fb.drain_records();
        assert_eq!(first.len(), 1);
        assert_eq!(type_of(first[0].as_ref().unwrap()), Some(HEARTBEAT));
        assert!(fb.pending() > 0);
        fb.extend(b"2,\"Result\":1}\0").unwrap();
        let second = fb.drain_records();
        assert!(is_logon_success(second[0].as_ref().unwrap()));
        assert_eq!(fb.pending(), 0);
    }

    #[test]
    fn unterminated_tail_is_bounded() {
        let mut fb = FrameBuffer::with_max_frame(1024);
        fb.extend(b"{\"Type\":3}\0").unwrap();
        let mut rejected = 0;
        for _ in 0..64 {
            if let Err(e) = fb.extend(&[b'a'; 512]) {
                assert!(matches!(e, FrameError::Malformed { .. }), "{e:?}");
                rejected += 1;
            }
            assert!(fb.pending() <= 1024 + 16);
        }
        assert!(rejected > 0);
        // The heartbeat queued before the junk is still delivered
        let recs = fb.drain_records();
        assert_eq!(recs.len(), 1);
        assert_eq!(type_of(recs[0].as_ref().unwrap()), Some(HEARTBEAT));
    }

    #[test]
    fn oversized_binary_tail_reports_encoding_mismatch() {
        let mut fb = FrameBuffer::new();
        let mut junk = vec![16u8, 0, 3, 0];
        junk.resize(MAX_FRAME + 1, 0xff);
        assert!(matches!(fb.extend(&junk), Err(FrameError::EncodingMismatch { .. })));
        assert_eq!(fb.pending(), 0);
        fb.extend(b"{\"Type\":3}\0").unwrap();
        assert_eq!(fb.drain_records().len(), 1);
    }

    #[test]
    fn encode_appends_single_terminator() {
        let bytes = encode(&heartbeat(0));
        assert_eq!(bytes.iter().filter(|b| **b == TERMINATOR).count(), 1);
        assert_eq!(*bytes.last().unwrap(), TERMINATOR);
    }

    #[test]
    fn detects_binary_encoding() {
        // size=16, type=3 (heartbeat), little-endian
        let frame = [16u8, 0, 3, 0, 0, 0, 0, 0];
        assert_eq!(decode_record(&frame), Err(FrameError::EncodingMismatch { len: 8 }));
        assert!(matches!(decode_record(b"{oops"), Err(FrameError::Malformed { .. })));
        assert!(matches!(decode_record(b"[1,2]"), Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn classify_control_frames() {
        assert_eq!(classify(HEARTBEAT), MessageClass::Control);
        assert_eq!(classify(ENCODING_RESPONSE), MessageClass::Control);
        assert_eq!(classify(LOGON_RESPONSE), MessageClass::Control);
        assert_eq!(classify(POSITION_UPDATE), MessageClass::Position);
        assert_eq!(classify(9999), MessageClass::Unknown);
    }

    #[test]
    fn type_accepts_numeric_strings() {
        assert_eq!(type_of(&json!({"Type": "306"})), Some(POSITION_UPDATE));
        assert_eq!(type_of(&json!({"Type": [1]})), None);
    }

    #[test]
    fn seed_plan_is_ordered_and_staggered() {
        let plan = seed_plan(Duration::from_millis(150));
        let kinds: Vec<_> = plan.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                RequestKind::TradeAccounts,
                RequestKind::OpenOrders,
                RequestKind::HistoricalFills,
                RequestKind::AccountBalance
            ]
        );
        assert!(plan.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn logon_carries_heartbeat_and_client() {
        let v = logon_request(&LogonParams {
            username: "u".into(),
            password: "p".into(),
            client_name: "dtc_monitor".into(),
            heartbeat_interval_secs: 5,
            trade_mode: 2,
        });
        assert_eq!(type_of(&v), Some(LOGON_REQUEST));
        assert_eq!(v["HeartbeatIntervalInSeconds"], 5);
        assert_eq!(v["ClientName"], "dtc_monitor");
    }
}
