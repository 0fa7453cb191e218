// ===============================
// src/connection.rs
// ===============================
//
// DTC client: one TCP session at a time.
//
//   DISCONNECTED -> CONNECTING -> CONNECTED (logon sent) -> SESSION_READY
//        ^                                                       |
//        +---------------- backoff delay <------ disconnect -----+
//
// - connect attempts go through the circuit breaker
// - logon is written immediately on connect; SESSION_READY on a successful
//   logon response, or after the grace period if none arrives
// - heartbeat every `heartbeat`; watchdog aborts after `watchdog` of silence
// - reconnect is scheduled only from the disconnect transition
//
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{interval, interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{BreakerError, BreakerStats, CircuitBreaker};
use crate::config::{BackoffConfig, ConnConfig};
use crate::dtc::{self, FrameBuffer, FrameError, RequestKind};
use crate::metrics::{CONN_STATE, ENCODING_MISMATCH, FRAMES_RX, FRAMES_TX, HEARTBEATS_SENT, RECONNECTS};
use crate::timeouts::RequestTimeoutTracker;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUF: usize = 64 * 1024;
const SEED_FILLS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    SessionReady,
}

impl ConnState {
    fn gauge(&self) -> i64 {
        match self {
            ConnState::Disconnected => 0,
            ConnState::Connecting => 1,
            ConnState::Connected => 2,
            ConnState::SessionReady => 3,
        }
    }
}

/// Lifecycle and traffic, in receipt order.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    StateChanged(ConnState),
    SessionReady { via_grace: bool },
    Message(Value),
    Error(String),
    /// Binary frames seen; latched once per session.
    EncodingMismatch,
    Disconnected { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration, breaker: BreakerStats },
    RequestTimedOut { request_id: u32, kind: RequestKind },
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("no data for {0:?}")]
    Stale(Duration),
    #[error("disconnect requested")]
    Requested,
    #[error("shutting down")]
    Cancelled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request not supported: {0}")]
    Unsupported(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
}

/// Typed capability surface for anything that can issue DTC requests.
/// Each method returns the RequestID on success.
pub trait DtcRequester: Send + Sync {
    fn request_trade_accounts(&self) -> Result<u32, RequestError> {
        Err(RequestError::Unsupported("trade_accounts"))
    }

    fn request_positions(&self, _account: Option<&str>) -> Result<u32, RequestError> {
        Err(RequestError::Unsupported("current_positions"))
    }

    fn request_open_orders(&self, _account: Option<&str>) -> Result<u32, RequestError> {
        Err(RequestError::Unsupported("open_orders"))
    }

    fn request_fills_since(&self, _since: DateTime<Utc>, _account: Option<&str>) -> Result<u32, RequestError> {
        Err(RequestError::Unsupported("historical_fills"))
    }

    fn request_balance(&self, _account: Option<&str>) -> Result<u32, RequestError> {
        Err(RequestError::Unsupported("account_balance"))
    }
}

/// `delay = min(base * 2^attempt, cap)`; the attempt counter is capped too.
#[derive(Debug, Clone)]
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.cfg.base.checked_mul(factor).unwrap_or(self.cfg.cap).min(self.cfg.cap)
    }

    /// Returns the attempt number used and its delay, then advances.
    pub fn next_delay(&mut self) -> (u32, Duration) {
        let attempt = self.attempt;
        let delay = self.delay_for(attempt);
        self.attempt = self.attempt.saturating_add(1).min(self.cfg.max_attempt);
        (attempt, delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct DtcClient {
    cfg: ConnConfig,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<RequestTimeoutTracker>,
    events: broadcast::Sender<ConnEvent>,
    state: Mutex<ConnState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    backoff: Mutex<Backoff>,
    next_request_id: AtomicU32,
    kick: Notify,
}

impl DtcClient {
    pub fn new(cfg: ConnConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let (events, _) = broadcast::channel(4096);
        let tracker = Arc::new(RequestTimeoutTracker::new(cfg.request_timeout));
        let backoff = Mutex::new(Backoff::new(cfg.backoff.clone()));
        Self {
            cfg,
            breaker,
            tracker,
            events,
            state: Mutex::new(ConnState::Disconnected),
            outbound: Mutex::new(None),
            backoff,
            next_request_id: AtomicU32::new(1),
            kick: Notify::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn tracker(&self) -> &Arc<RequestTimeoutTracker> {
        &self.tracker
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    pub fn backoff_attempt(&self) -> u32 {
        self.backoff.lock().attempt()
    }

    /// Ends the current session; the run loop then schedules a reconnect.
    pub fn disconnect(&self) {
        self.kick.notify_waiters();
    }

    fn emit(&self, ev: ConnEvent) {
        let _ = self.events.send(ev);
    }

    fn set_state(&self, next: ConnState) {
        let changed = {
            let mut g = self.state.lock();
            let changed = *g != next;
            *g = next;
            changed
        };
        if changed {
            CONN_STATE.set(next.gauge());
            debug!(state = ?next, "connection state");
            self.emit(ConnEvent::StateChanged(next));
        }
    }

    /// Queue one record for the writer. Fails when no session is up.
    pub fn send(&self, v: &Value) -> Result<(), RequestError> {
        let tx = self.outbound.lock().clone().ok_or(RequestError::NotConnected)?;
        tx.send(dtc::encode(v)).map_err(|e| RequestError::Send(e.to_string()))
    }

    fn issue(&self, kind: RequestKind, build: impl FnOnce(u32) -> Value) -> Result<u32, RequestError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        // Registered first so a fast response always finds its entry
        self.tracker.register(id, kind, None);
        if let Err(e) = self.send(&build(id)) {
            self.tracker.mark_completed(id);
            return Err(e);
        }
        debug!(request_id = id, kind = kind.as_str(), "request sent");
        Ok(id)
    }

    fn issue_seed(&self, kind: RequestKind) -> Result<u32, RequestError> {
        match kind {
            RequestKind::TradeAccounts => self.request_trade_accounts(),
            RequestKind::OpenOrders => self.request_open_orders(None),
            RequestKind::HistoricalFills => self
                .request_fills_since(Utc::now() - chrono::Duration::hours(SEED_FILLS_WINDOW_HOURS), None),
            RequestKind::CurrentPositions => self.request_positions(None),
            RequestKind::AccountBalance => self.request_balance(None),
        }
    }

    /// Connect / session / backoff loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let addr = self.cfg.addr();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnState::Connecting);
            info!(%addr, "connecting");

            let connect = async {
                match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                    Ok(res) => res.map_err(ConnError::from),
                    Err(_) => Err(ConnError::ConnectTimeout(CONNECT_TIMEOUT)),
                }
            };
            let mut retry_floor = Duration::ZERO;
            let reason = match self.breaker.call_async(connect).await {
                Ok(stream) => {
                    info!(%addr, "connected");
                    self.backoff.lock().reset();
                    let _ = stream.set_nodelay(true);
                    self.session(stream, &cancel).await.to_string()
                }
                Err(BreakerError::Open { retry_in, .. }) => {
                    retry_floor = retry_in;
                    let msg = format!("circuit open, retry in {retry_in:?}");
                    warn!(%addr, "{msg}");
                    self.emit(ConnEvent::Error(msg.clone()));
                    msg
                }
                Err(BreakerError::Inner(e)) => {
                    error!(%addr, error = %e, "connect failed");
                    self.emit(ConnEvent::Error(e.to_string()));
                    e.to_string()
                }
            };

            self.on_disconnect(&reason);
            if cancel.is_cancelled() {
                break;
            }

            let (attempt, delay) = self.backoff.lock().next_delay();
            let delay = delay.max(retry_floor);
            RECONNECTS.inc();
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.emit(ConnEvent::ReconnectScheduled { attempt, delay, breaker: self.breaker.stats() });
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_state(ConnState::Disconnected);
        info!("connection loop stopped");
    }

    fn on_disconnect(&self, reason: &str) {
        let was = self.state();
        *self.outbound.lock() = None;
        self.tracker.reset();
        self.set_state(ConnState::Disconnected);
        if was != ConnState::Connecting {
            warn!(%reason, "disconnected");
        }
        self.emit(ConnEvent::Disconnected { reason: reason.to_string() });
    }

    fn promote(self: &Arc<Self>, via_grace: bool, session: &CancellationToken) {
        self.set_state(ConnState::SessionReady);
        if via_grace {
            info!("no logon response within grace period; assuming session ready");
        } else {
            info!("logon accepted");
        }
        self.emit(ConnEvent::SessionReady { via_grace });

        // Staggered seed burst, abandoned if the session ends first
        let me = self.clone();
        let token = session.clone();
        let plan = dtc::seed_plan(self.cfg.seed_stagger);
        tokio::spawn(async move {
            let start = Instant::now();
            for (kind, offset) in plan {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep_until(start + offset) => {}
                }
                if let Err(e) = me.issue_seed(kind) {
                    warn!(kind = kind.as_str(), error = %e, "seed request failed");
                }
            }
        });
    }

    /// Binary frames surface once per session; malformed ones every time.
    fn on_frame_error(&self, e: FrameError, mismatch_latched: &mut bool) {
        match e {
            FrameError::EncodingMismatch { len } => {
                if !*mismatch_latched {
                    *mismatch_latched = true;
                    ENCODING_MISMATCH.inc();
                    error!(len, "peer is sending binary DTC; JSON encoding expected");
                    self.emit(ConnEvent::EncodingMismatch);
                }
            }
            e @ FrameError::Malformed { .. } => {
                warn!(error = %e, "malformed frame dropped");
                self.emit(ConnEvent::Error(e.to_string()));
            }
        }
    }

    async fn write_frame(wr: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), ConnError> {
        wr.write_all(bytes).await?;
        FRAMES_TX.inc();
        Ok(())
    }

    async fn session(self: &Arc<Self>, stream: TcpStream, cancel: &CancellationToken) -> ConnError {
        let session = cancel.child_token();
        let err = self.session_inner(stream, cancel, &session).await;
        session.cancel();
        err
    }

    async fn session_inner(
        self: &Arc<Self>,
        stream: TcpStream,
        cancel: &CancellationToken,
        session: &CancellationToken,
    ) -> ConnError {
        let (mut rd, mut wr) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.outbound.lock() = Some(tx);
        self.set_state(ConnState::Connected);

        let logon = dtc::encode(&dtc::logon_request(&self.cfg.logon));
        if let Err(e) = Self::write_frame(&mut wr, &logon).await {
            return e;
        }
        debug!(client = %self.cfg.logon.client_name, "logon sent");

        let mut frames = FrameBuffer::new();
        let mut buf = vec![0u8; READ_BUF];
        let mut ready = false;
        let mut logon_rejected = false;
        let mut mismatch_latched = false;

        let hb = self.cfg.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + hb, hb);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scan = interval(self.cfg.timeout_scan);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watchdog = sleep(self.cfg.watchdog);
        tokio::pin!(watchdog);
        let grace = sleep(self.cfg.logon_grace);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = Self::write_frame(&mut wr, &dtc::encode(&serde_json::json!({ "Type": dtc::LOGOFF, "Reason": "client shutdown" }))).await;
                    return ConnError::Cancelled;
                }
                _ = self.kick.notified() => return ConnError::Requested,

                read = rd.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => return ConnError::PeerClosed,
                        Ok(n) => n,
                        Err(e) => {
                            self.emit(ConnEvent::Error(e.to_string()));
                            return ConnError::Io(e);
                        }
                    };
                    watchdog.as_mut().reset(Instant::now() + self.cfg.watchdog);
                    if let Err(e) = frames.extend(&buf[..n]) {
                        self.on_frame_error(e, &mut mismatch_latched);
                    }
                    for rec in frames.drain_records() {
                        match rec {
                            Ok(v) => {
                                FRAMES_RX.inc();
                                if let Some(id) = dtc::request_id_of(&v) {
                                    if let Some(req) = self.tracker.mark_completed(id) {
                                        debug!(request_id = id, kind = req.request_type.as_str(), "request answered");
                                    }
                                }
                                if !ready && !logon_rejected && dtc::is_logon_response(&v) {
                                    if dtc::is_logon_success(&v) {
                                        ready = true;
                                        self.promote(false, session);
                                    } else {
                                        logon_rejected = true;
                                        let text = v.get("ResultText").and_then(Value::as_str).unwrap_or("").to_string();
                                        error!(result_text = %text, "logon rejected");
                                        self.emit(ConnEvent::Error(format!("logon rejected: {text}")));
                                    }
                                }
                                self.emit(ConnEvent::Message(v));
                            }
                            Err(e) => self.on_frame_error(e, &mut mismatch_latched),
                        }
                    }
                }

                Some(bytes) = rx.recv() => {
                    if let Err(e) = Self::write_frame(&mut wr, &bytes).await {
                        self.emit(ConnEvent::Error(e.to_string()));
                        return e;
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = Self::write_frame(&mut wr, &dtc::encode(&dtc::heartbeat(0))).await {
                        self.emit(ConnEvent::Error(e.to_string()));
                        return e;
                    }
                    HEARTBEATS_SENT.inc();
                }

                _ = &mut watchdog => {
                    warn!(window = ?self.cfg.watchdog, "heartbeat watchdog expired; aborting socket");
                    return ConnError::Stale(self.cfg.watchdog);
                }

                _ = &mut grace, if !ready && !logon_rejected => {
                    ready = true;
                    self.promote(true, session);
                }

                _ = scan.tick() => {
                    for req in self.tracker.check() {
                        self.emit(ConnEvent::RequestTimedOut { request_id: req.request_id, kind: req.request_type });
                    }
                }
            }
        }
    }
}

impl DtcRequester for DtcClient {
    fn request_trade_accounts(&self) -> Result<u32, RequestError> {
        self.issue(RequestKind::TradeAccounts, dtc::trade_accounts_request)
    }

    fn request_positions(&self, account: Option<&str>) -> Result<u32, RequestError> {
        self.issue(RequestKind::CurrentPositions, |id| dtc::current_positions_request(id, account))
    }

    fn request_open_orders(&self, account: Option<&str>) -> Result<u32, RequestError> {
        self.issue(RequestKind::OpenOrders, |id| dtc::open_orders_request(id, account))
    }

    fn request_fills_since(&self, since: DateTime<Utc>, account: Option<&str>) -> Result<u32, RequestError> {
        self.issue(RequestKind::HistoricalFills, |id| dtc::historical_fills_request(id, since.timestamp(), account))
    }

    fn request_balance(&self, account: Option<&str>) -> Result<u32, RequestError> {
        self.issue(RequestKind::AccountBalance, |id| dtc::account_balance_request(id, account))
    }
}
