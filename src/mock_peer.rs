// ===============================
// src/mock_peer.rs (in-process DTC peer)
// ===============================
//
// Localhost TCP server speaking NUL-framed JSON DTC:
// - answers logon, heartbeats, encoding, accounts, balance, orders,
//   historical fills and positions requests
// - optional random-walk trade cycle: open -> fill prices -> flat
// - push() / push_raw() inject records or raw bytes into every live session
// - mute() stops all outbound traffic while still reading (silent peer)
// - received() lists every record clients sent, in arrival order
//
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dtc::{self, FrameBuffer};

#[derive(Clone, Debug)]
pub struct MockPeerConfig {
    pub account: String,
    pub balance: f64,
    pub symbol: String,
    pub start_price: f64,
    pub heartbeat: Duration,
    /// When false, logon requests go unanswered (grace-promotion path).
    pub answer_logon: bool,
    /// Interval of the synthetic trade cycle; None disables it.
    pub walk: Option<Duration>,
    /// Request types that are read but never answered.
    pub unanswered: Vec<i64>,
}

impl Default for MockPeerConfig {
    fn default() -> Self {
        Self {
            account: "Sim1".into(),
            balance: 10_000.0,
            symbol: "ESZ5".into(),
            start_price: 6_000.0,
            heartbeat: Duration::from_secs(5),
            answer_logon: true,
            walk: None,
            unanswered: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    price: f64,
    qty: f64,
    avg: f64,
    next_order_id: u64,
}

struct Shared {
    cfg: MockPeerConfig,
    book: Mutex<Book>,
    received: Mutex<Vec<Value>>,
    connections: AtomicU64,
    muted: AtomicBool,
    push: broadcast::Sender<Vec<u8>>,
    kick: Notify,
}

pub struct MockPeer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl MockPeer {
    /// Binds `bind_addr` (use port 0 for an ephemeral port) and starts accepting.
    pub async fn start(bind_addr: &str, cfg: MockPeerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        let (push, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            book: Mutex::new(Book { price: cfg.start_price, next_order_id: 1, ..Book::default() }),
            cfg,
            received: Mutex::new(Vec::new()),
            connections: AtomicU64::new(0),
            muted: AtomicBool::new(false),
            push,
            kick: Notify::new(),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, shared.clone(), cancel.clone()));
        info!(%addr, "mock peer listening");
        Ok(Self { addr, shared, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Sends `v` to every connected client. Returns how many sessions got it.
    pub fn push(&self, v: Value) -> usize {
        self.push_raw(dtc::encode(&v))
    }

    /// Sends bytes as-is, terminators included.
    pub fn push_raw(&self, bytes: Vec<u8>) -> usize {
        self.shared.push.send(bytes).unwrap_or(0)
    }

    /// While muted, sessions keep reading but send nothing at all.
    pub fn mute(&self, on: bool) {
        self.shared.muted.store(on, Ordering::Relaxed);
    }

    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().clone()
    }

    pub fn received_types(&self) -> Vec<i64> {
        self.shared.received.lock().iter().filter_map(dtc::type_of).collect()
    }

    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Drops every open session; the listener keeps accepting.
    pub fn drop_clients(&self) {
        self.shared.kick.notify_waiters();
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            acc = listener.accept() => match acc {
                Ok((stream, peer)) => {
                    shared.connections.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, "mock peer: client connected");
                    let s = shared.clone();
                    let c = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, s, c).await {
                            debug!(error = %e, "mock peer: session ended");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "mock peer: accept failed"),
            }
        }
    }
    debug!("mock peer stopped");
}

async fn send(shared: &Shared, wr: &mut OwnedWriteHalf, v: &Value) -> io::Result<()> {
    send_raw(shared, wr, &dtc::encode(v)).await
}

async fn send_raw(shared: &Shared, wr: &mut OwnedWriteHalf, bytes: &[u8]) -> io::Result<()> {
    if shared.muted.load(Ordering::Relaxed) {
        return Ok(());
    }
    wr.write_all(bytes).await
}

async fn serve(stream: TcpStream, shared: Arc<Shared>, cancel: CancellationToken) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();
    let mut push_rx = shared.push.subscribe();
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 16 * 1024];

    let hb = shared.cfg.heartbeat;
    let mut heartbeat = interval_at(Instant::now() + hb, hb);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let walk_every = shared.cfg.walk.unwrap_or(Duration::from_secs(3600));
    let mut walk = interval_at(Instant::now() + walk_every, walk_every);
    walk.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = shared.kick.notified() => return Ok(()),
            read = rd.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                if let Err(e) = frames.extend(&buf[..n]) {
                    debug!(error = %e, "mock peer: oversized frame dropped");
                }
                for rec in frames.drain_records() {
                    let Ok(v) = rec else { continue };
                    shared.received.lock().push(v.clone());
                    if dtc::type_of(&v) == Some(dtc::LOGOFF) {
                        return Ok(());
                    }
                    for reply in replies(&shared, &v) {
                        send(&shared, &mut wr, &reply).await?;
                    }
                }
            }
            pushed = push_rx.recv() => match pushed {
                Ok(bytes) => send_raw(&shared, &mut wr, &bytes).await?,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = heartbeat.tick() => send(&shared, &mut wr, &dtc::heartbeat(0)).await?,
            _ = walk.tick(), if shared.cfg.walk.is_some() => {
                for v in walk_step(&shared) {
                    send(&shared, &mut wr, &v).await?;
                }
            }
        }
    }
}

/// Response records for one client request.
fn replies(shared: &Shared, req: &Value) -> Vec<Value> {
    let cfg = &shared.cfg;
    let rid = dtc::request_id_of(req).unwrap_or(0);
    let ty = dtc::type_of(req);
    if ty.is_some_and(|t| cfg.unanswered.contains(&t)) {
        return Vec::new();
    }
    match ty {
        Some(dtc::LOGON_REQUEST) if cfg.answer_logon => vec![json!({
            "Type": dtc::LOGON_RESPONSE,
            "ProtocolVersion": dtc::PROTOCOL_VERSION,
            "Result": dtc::LOGON_SUCCESS,
            "ResultText": "logon ok",
            "ServerName": "mock_peer",
            "TradingIsSupported": 1,
            "OrderCancelReplaceSupported": 1,
        })],
        Some(dtc::HEARTBEAT) => vec![dtc::heartbeat(0)],
        Some(dtc::ENCODING_REQUEST) => vec![json!({ "Type": dtc::ENCODING_RESPONSE, "ProtocolVersion": dtc::PROTOCOL_VERSION, "Encoding": 2, "ProtocolType": "DTC" })],
        Some(dtc::TRADE_ACCOUNTS_REQUEST) => vec![json!({
            "Type": dtc::TRADE_ACCOUNT_RESPONSE,
            "RequestID": rid,
            "TotalNumberMessages": 1,
            "MessageNumber": 1,
            "TradeAccount": cfg.account,
        })],
        Some(dtc::ACCOUNT_BALANCE_REQUEST) => vec![json!({
            "Type": dtc::ACCOUNT_BALANCE_UPDATE,
            "RequestID": rid,
            "CashBalance": cfg.balance,
            "TradeAccount": cfg.account,
            "AccountCurrency": "USD",
            "TotalNumberMessages": 1,
            "MessageNumber": 1,
        })],
        Some(dtc::OPEN_ORDERS_REQUEST) => vec![json!({
            "Type": dtc::ORDER_UPDATE,
            "RequestID": rid,
            "TotalNumMessages": 1,
            "MessageNumber": 1,
            "NoOrders": 1,
            "TradeAccount": cfg.account,
        })],
        Some(dtc::HISTORICAL_ORDER_FILLS_REQUEST) => vec![json!({
            "Type": dtc::HISTORICAL_ORDER_FILL_RESPONSE,
            "RequestID": rid,
            "TotalNumberMessages": 1,
            "MessageNumber": 1,
            "NoOrderFills": 1,
            "TradeAccount": cfg.account,
        })],
        Some(dtc::CURRENT_POSITIONS_REQUEST) => {
            let book = shared.book.lock();
            if book.qty == 0.0 {
                vec![json!({ "Type": dtc::POSITION_UPDATE, "RequestID": rid, "NoPositions": 1, "TradeAccount": cfg.account })]
            } else {
                let mut p = position_record(cfg, book.qty, book.avg);
                p["RequestID"] = json!(rid);
                vec![p]
            }
        }
        Some(ty) => {
            debug!(ty, "mock peer: no reply");
            Vec::new()
        }
        None => Vec::new(),
    }
}

fn position_record(cfg: &MockPeerConfig, qty: f64, avg: f64) -> Value {
    json!({
        "Type": dtc::POSITION_UPDATE,
        "TotalNumberMessages": 1,
        "MessageNumber": 1,
        "Symbol": cfg.symbol,
        "Exchange": "CME",
        "Quantity": qty,
        "AveragePrice": avg,
        "TradeAccount": cfg.account,
        "DateTime": Utc::now().timestamp(),
    })
}

fn fill_record(cfg: &MockPeerConfig, order_id: u64, buy: bool, qty: f64, price: f64) -> Value {
    json!({
        "Type": dtc::ORDER_UPDATE,
        "Symbol": cfg.symbol,
        "ServerOrderID": order_id.to_string(),
        "BuySell": if buy { 1 } else { 2 },
        "OrderStatus": 7,
        "OrderQuantity": qty,
        "FilledQuantity": qty,
        "AverageFillPrice": price,
        "LastFillPrice": price,
        "LastFillDateTime": Utc::now().timestamp(),
        "TradeAccount": cfg.account,
    })
}

/// One tick of the synthetic cycle: random-walk the price, then either open
/// a 1-2 lot position or flatten the current one.
fn walk_step(shared: &Shared) -> Vec<Value> {
    let cfg = &shared.cfg;
    let mut rng = rand::thread_rng();
    let mut book = shared.book.lock();
    let ticks: i32 = rng.gen_range(-8..=8);
    book.price = (book.price + f64::from(ticks) * 0.25).max(1.0);
    let order_id = book.next_order_id;
    book.next_order_id += 1;

    if book.qty == 0.0 {
        let lots = f64::from(rng.gen_range(1..=2));
        let buy = rng.gen_bool(0.5);
        book.qty = if buy { lots } else { -lots };
        book.avg = book.price;
        debug!(qty = book.qty, price = book.price, "mock peer: open");
        vec![fill_record(cfg, order_id, buy, lots, book.price), position_record(cfg, book.qty, book.avg)]
    } else {
        let buy = book.qty < 0.0;
        let lots = book.qty.abs();
        book.qty = 0.0;
        book.avg = 0.0;
        debug!(price = book.price, "mock peer: flatten");
        vec![fill_record(cfg, order_id, buy, lots, book.price), position_record(cfg, 0.0, 0.0)]
    }
}
