// ===============================
// src/router.rs (normalized events -> state / positions / presentation)
// ===============================
//
// - mode drift: any position/order whose account implies a scope other than
//   the remembered one is logged, counted, and disarms live trading
// - mode switch: a candidate scope is adopted only after N consecutive
//   observations, and never while a higher-precedence mode holds a position
// - balances: LIVE pushes are authoritative; SIM/DEBUG pushes are ignored
// - refresh: bursts of state changes collapse into one UiEvent::Refresh
// - recovery: positions -> orders -> fills since last fill -> brackets
//
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{CommandReceiver, CoreCommand, EventBus, UiEvent};
use crate::config::RouterConfig;
use crate::connection::{ConnEvent, DtcRequester, RequestError};
use crate::domain::{Event, Mode, NormalizedEvent, OrderStatus, OrderUpdate, Scope};
use crate::metrics::MODE_DRIFT;
use crate::normalizer::Normalizer;
use crate::positions::PositionTracker;
use crate::recovery::derive_sim_balance;
use crate::repository::PositionRepository;
use crate::risk::TradingGuard;
use crate::state::StateManager;
use crate::trade_close::TradeCloseService;

/// Debounced "state changed" notifier: a pending flag plus one scheduled flush.
pub struct RefreshCoalescer {
    pending: Arc<AtomicBool>,
    flushes: Arc<AtomicU64>,
    window: Duration,
    bus: EventBus,
}

impl RefreshCoalescer {
    pub fn new(window: Duration, bus: EventBus) -> Self {
        Self { pending: Arc::new(AtomicBool::new(false)), flushes: Arc::new(AtomicU64::new(0)), window, bus }
    }

    pub fn request(&self) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.clone();
        let flushes = self.flushes.clone();
        let bus = self.bus.clone();
        let window = self.window;
        let flush = move || {
            pending.store(false, Ordering::Release);
            flushes.fetch_add(1, Ordering::Relaxed);
            bus.publish(UiEvent::Refresh);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(h) => {
                h.spawn(async move {
                    sleep(window).await;
                    flush();
                });
            }
            // Outside a runtime there is nothing to batch against
            Err(_) => flush(),
        }
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BracketGroup {
    pub parent: String,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Brackets {
    pub groups: Vec<BracketGroup>,
    pub oco_pairs: Vec<(String, String)>,
}

/// Outcome of each recovery step; a step that was not attempted is `Err`.
#[derive(Debug)]
pub struct RecoverySteps {
    pub positions: Result<u32, RequestError>,
    pub orders: Result<u32, RequestError>,
    pub fills: Result<u32, RequestError>,
    pub brackets: Brackets,
}

#[derive(Debug, Default)]
struct RouterInner {
    remembered: Option<Scope>,
    candidate: Option<(Scope, u32)>,
    // server order id -> latest update, working orders only
    orders: HashMap<String, OrderUpdate>,
}

pub struct MessageRouter {
    cfg: RouterConfig,
    state: Arc<StateManager>,
    repo: Arc<dyn PositionRepository>,
    positions: Arc<PositionTracker>,
    guard: Arc<TradingGuard>,
    bus: EventBus,
    normalizer: Normalizer,
    refresh: RefreshCoalescer,
    journal: Option<mpsc::Sender<Event>>,
    inner: Mutex<RouterInner>,
}

impl MessageRouter {
    pub fn new(
        cfg: RouterConfig,
        state: Arc<StateManager>,
        repo: Arc<dyn PositionRepository>,
        positions: Arc<PositionTracker>,
        guard: Arc<TradingGuard>,
        bus: EventBus,
    ) -> Self {
        let refresh = RefreshCoalescer::new(cfg.refresh_window, bus.clone());
        Self {
            cfg,
            state,
            repo,
            positions,
            guard,
            bus,
            normalizer: Normalizer::new(),
            refresh,
            journal: None,
            inner: Mutex::new(RouterInner::default()),
        }
    }

    pub fn with_journal(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.journal = Some(tx);
        self
    }

    pub fn remembered_scope(&self) -> Option<Scope> {
        self.inner.lock().remembered.clone()
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn refresh_flushes(&self) -> u64 {
        self.refresh.flushes()
    }

    pub fn handle_value(&self, v: &Value) {
        if let Some(ev) = self.normalizer.normalize(v) {
            self.handle_event(ev);
        }
    }

    pub fn handle_event(&self, ev: NormalizedEvent) {
        if let Some(tx) = &self.journal {
            let _ = tx.try_send(Event::Normalized(ev.clone()));
        }
        match ev {
            NormalizedEvent::TradeAccount { account } => self.on_trade_account(&account),
            NormalizedEvent::BalanceUpdate { balance, account, .. } => self.on_balance(balance, &account),
            NormalizedEvent::PositionUpdate { symbol, qty, avg_entry, account, timestamp } => {
                self.observe_scope(&account, "position");
                if let Err(e) = self.positions.on_position_update(&symbol, qty, avg_entry, &account, timestamp) {
                    warn!(error = %e, %symbol, %account, "position update not persisted");
                }
            }
            NormalizedEvent::OrderUpdate(o) => {
                if !o.historical {
                    self.observe_scope(&o.account, "order");
                }
                self.record_order(&o);
                self.positions.on_fill(&o);
            }
        }
        self.refresh.request();
    }

    fn on_trade_account(&self, account: &str) {
        let fresh = self.state.add_known_account(account);
        if fresh {
            info!(%account, mode = %Mode::from_account(account), "trade account discovered");
            if Mode::from_account(account) == Mode::Sim {
                if let Err(e) = derive_sim_balance(self.repo.as_ref(), &self.state, account) {
                    warn!(error = %e, %account, "sim balance derivation failed");
                }
            }
        }
        let first = {
            let mut g = self.inner.lock();
            if g.remembered.is_none() {
                g.remembered = Some(Scope::for_account(account));
                true
            } else {
                false
            }
        };
        if first {
            self.state.set_mode(account);
        }
    }

    fn on_balance(&self, balance: f64, account: &str) {
        match Mode::from_account(account) {
            Mode::Live => self.state.set_balance_for_mode(Mode::Live, account, balance),
            m => debug!(mode = %m, %account, balance, "synthetic-mode balance push ignored"),
        }
    }

    /// Drift check plus debounced scope switch for one incoming account.
    fn observe_scope(&self, account: &str, kind: &str) {
        if account.is_empty() {
            return;
        }
        let incoming = Scope::for_account(account);
        let (drift_from, candidate_ready) = {
            let mut g = self.inner.lock();
            match g.remembered.clone() {
                None => {
                    g.remembered = Some(incoming.clone());
                    drop(g);
                    self.state.set_mode(account);
                    return;
                }
                Some(r) if r == incoming => {
                    g.candidate = None;
                    return;
                }
                Some(r) => {
                    let seen = match &mut g.candidate {
                        Some((s, n)) if *s == incoming => {
                            *n += 1;
                            *n
                        }
                        _ => {
                            g.candidate = Some((incoming.clone(), 1));
                            1
                        }
                    };
                    (r, seen >= self.cfg.mode_switch_confirmations)
                }
            }
        };

        // Disarm regardless of what the debounce decides
        warn!(
            expected_mode = %drift_from.mode,
            expected_account = %drift_from.account,
            incoming_mode = %incoming.mode,
            incoming_account = %incoming.account,
            kind,
            "mode drift"
        );
        MODE_DRIFT.with_label_values(&[kind]).inc();
        self.guard.disarm(&format!(
            "mode drift: {}/{} -> {}/{}",
            drift_from.mode, drift_from.account, incoming.mode, incoming.account
        ));
        self.bus.publish(UiEvent::ModeDrift {
            expected: drift_from.clone(),
            incoming: incoming.clone(),
            kind: kind.to_string(),
        });

        if candidate_ready {
            self.try_switch(incoming);
        }
    }

    fn blocking_mode(&self, target: &Scope) -> Option<Mode> {
        self.state
            .open_position_modes(Some(target))
            .into_iter()
            .filter(|m| *m != target.mode && m.precedence() > target.mode.precedence())
            .max_by_key(|m| m.precedence())
    }

    fn try_switch(&self, target: Scope) {
        if let Some(blocking_mode) = self.blocking_mode(&target) {
            self.inner.lock().candidate = None;
            warn!(target_mode = %target.mode, target_account = %target.account, blocking = %blocking_mode, "mode switch blocked by open position");
            self.bus.publish(UiEvent::ModeSwitchBlocked { target, blocking_mode });
            return;
        }
        {
            let mut g = self.inner.lock();
            g.remembered = Some(target.clone());
            g.candidate = None;
        }
        info!(mode = %target.mode, account = %target.account, "mode switch adopted");
        self.state.set_mode(&target.account);
    }

    fn record_order(&self, o: &OrderUpdate) {
        let Some(id) = o.server_order_id.clone() else { return };
        let mut g = self.inner.lock();
        if o.status.is_working() {
            g.orders.insert(id, o.clone());
        } else if matches!(o.status, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected) {
            g.orders.remove(&id);
        }
    }

    pub fn working_orders(&self) -> Vec<OrderUpdate> {
        self.inner.lock().orders.values().cloned().collect()
    }

    /// Parent/child groups and OCO pairs among the working orders.
    pub fn rebuild_brackets(&self) -> Brackets {
        let orders: Vec<OrderUpdate> = self.working_orders();
        let mut by_parent: HashMap<String, Vec<String>> = HashMap::new();
        let mut oco_pairs = Vec::new();
        for o in &orders {
            let Some(id) = &o.server_order_id else { continue };
            if let Some(parent) = &o.parent_server_order_id {
                by_parent.entry(parent.clone()).or_default().push(id.clone());
            }
            if let Some(linked) = &o.oco_linked_order_id {
                let pair = if id < linked { (id.clone(), linked.clone()) } else { (linked.clone(), id.clone()) };
                if !oco_pairs.contains(&pair) {
                    oco_pairs.push(pair);
                }
            }
        }
        let mut groups: Vec<BracketGroup> = by_parent
            .into_iter()
            .map(|(parent, mut children)| {
                children.sort();
                BracketGroup { parent, children }
            })
            .collect();
        groups.sort_by(|a, b| a.parent.cmp(&b.parent));
        oco_pairs.sort();
        Brackets { groups, oco_pairs }
    }

    fn step(name: &str, res: Result<u32, RequestError>) -> Result<u32, RequestError> {
        match &res {
            Ok(id) => info!(step = name, request_id = *id, "recovery step issued"),
            Err(RequestError::Unsupported(what)) => info!(step = name, capability = *what, "recovery step skipped"),
            Err(e) => warn!(step = name, error = %e, "recovery step failed"),
        }
        res
    }

    /// Best-effort 4-step resync after (re)connect.
    pub async fn run_recovery(&self, requester: &dyn DtcRequester) -> RecoverySteps {
        let positions = Self::step("positions", requester.request_positions(None));
        let orders = Self::step("orders", requester.request_open_orders(None));

        let lookback = chrono::Duration::from_std(self.cfg.fills_lookback).unwrap_or_else(|_| chrono::Duration::days(7));
        let floor = || Utc::now().checked_sub_signed(lookback).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let since = match self.repo.last_fill_time() {
            Ok(Some(t)) => t,
            Ok(None) => floor(),
            Err(e) => {
                warn!(error = %e, "last fill time unavailable; using lookback");
                floor()
            }
        };
        let fills = Self::step("fills", requester.request_fills_since(since, None));

        sleep(self.cfg.bracket_settle).await;
        let brackets = self.rebuild_brackets();
        info!(groups = brackets.groups.len(), oco = brackets.oco_pairs.len(), "brackets rebuilt");
        RecoverySteps { positions, orders, fills, brackets }
    }

    /// LIVE: ask the peer. SIM: re-derive from the ledger. DEBUG: re-publish.
    pub fn refresh_balance(&self, account: Option<&str>, requester: &dyn DtcRequester) {
        let account = account.map(str::to_string).unwrap_or_else(|| self.state.current_scope().account);
        match Mode::from_account(&account) {
            Mode::Live => {
                if let Err(e) = requester.request_balance(Some(&account)) {
                    warn!(error = %e, %account, "balance refresh not sent");
                }
            }
            Mode::Sim => {
                if let Err(e) = derive_sim_balance(self.repo.as_ref(), &self.state, &account) {
                    warn!(error = %e, %account, "sim balance refresh failed");
                }
            }
            Mode::Debug => {
                let b = self.state.get_balance_for_mode(Mode::Debug, &account);
                self.state.set_balance_for_mode(Mode::Debug, &account, b);
            }
        }
    }
}

/// Connection events -> router / presentation.
pub async fn run(
    router: Arc<MessageRouter>,
    mut rx: broadcast::Receiver<ConnEvent>,
    requester: Arc<dyn DtcRequester>,
    cancel: CancellationToken,
) {
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = rx.recv() => ev,
        };
        match ev {
            Ok(ConnEvent::Message(v)) => {
                // SQLite work stays off the async workers; awaiting keeps receipt order
                let r = router.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || r.handle_value(&v)).await {
                    warn!(error = %e, "message handler panicked");
                }
            }
            Ok(ConnEvent::SessionReady { via_grace }) => {
                debug!(via_grace, "session ready; starting recovery");
                router.bus.publish(UiEvent::ConnectionHealthy);
                let r = router.clone();
                let q = requester.clone();
                tokio::spawn(async move {
                    r.run_recovery(q.as_ref()).await;
                });
            }
            Ok(ConnEvent::Disconnected { reason }) => {
                router.bus.publish(UiEvent::ConnectionDegraded { reason });
            }
            Ok(ConnEvent::ReconnectScheduled { attempt, delay, breaker }) => {
                router.bus.publish(UiEvent::ReconnectScheduled { attempt, delay_ms: delay.as_millis() as u64 });
                router.bus.publish(UiEvent::CircuitBreakerStats(breaker));
            }
            Ok(ConnEvent::RequestTimedOut { request_id, kind }) => {
                router.bus.publish(UiEvent::RequestTimedOut { request_id, request_type: kind.as_str().to_string() });
            }
            Ok(ConnEvent::EncodingMismatch) => {
                router.bus.publish(UiEvent::ConnectionDegraded {
                    reason: "peer is sending binary-encoded records".into(),
                });
            }
            Ok(ConnEvent::Error(e)) => debug!(error = %e, "connection error"),
            Ok(ConnEvent::StateChanged(_)) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "router lagged behind connection"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("router stopped");
}

/// Presentation -> core commands.
pub async fn run_commands(
    mut rx: CommandReceiver,
    closer: Arc<TradeCloseService>,
    router: Arc<MessageRouter>,
    requester: Arc<dyn DtcRequester>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            CoreCommand::CloseTrade(req) => {
                let c = closer.clone();
                // Repository work stays off the async workers
                if let Err(e) = tokio::task::spawn_blocking(move || c.close(req)).await {
                    warn!(error = %e, "close task panicked");
                }
            }
            CoreCommand::RefreshBalance { account } => router.refresh_balance(account.as_deref(), requester.as_ref()),
        }
    }
    debug!("command channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingCfg;
    use crate::domain::Side;
    use crate::repository::SqlitePositionRepository;
    use crate::state::StartingBalances;
    use serde_json::json;

    struct Harness {
        router: Arc<MessageRouter>,
        repo: Arc<dyn PositionRepository>,
        state: Arc<StateManager>,
        guard: Arc<TradingGuard>,
        bus: EventBus,
    }

    fn harness(confirmations: u32) -> Harness {
        let bus = EventBus::new(1024);
        let repo: Arc<dyn PositionRepository> = Arc::new(SqlitePositionRepository::in_memory().unwrap());
        let state = Arc::new(StateManager::new(StartingBalances::default(), bus.clone()));
        let closer = Arc::new(TradeCloseService::new(repo.clone(), state.clone(), bus.clone(), TradingCfg::default()));
        let positions = Arc::new(PositionTracker::new(repo.clone(), state.clone(), closer, bus.clone()));
        let guard = Arc::new(TradingGuard::new(bus.clone()));
        let cfg = RouterConfig {
            mode_switch_confirmations: confirmations,
            refresh_window: Duration::from_millis(100),
            fills_lookback: Duration::from_secs(3600),
            bracket_settle: Duration::ZERO,
        };
        let router = Arc::new(MessageRouter::new(cfg, state.clone(), repo.clone(), positions, guard.clone(), bus.clone()));
        Harness { router, repo, state, guard, bus }
    }

    fn position(account: &str, qty: f64) -> Value {
        json!({"Type": 306, "Symbol": "ESZ5", "Quantity": qty, "AveragePrice": 6000.0, "TradeAccount": account})
    }

    fn order(id: &str, parent: Option<&str>, oco: Option<&str>) -> OrderUpdate {
        OrderUpdate {
            symbol: "ESZ5".into(),
            side: Some(Side::Buy),
            status: OrderStatus::Open,
            price: Some(6000.0),
            filled_qty: 0.0,
            account: "Sim1".into(),
            server_order_id: Some(id.into()),
            parent_server_order_id: parent.map(Into::into),
            oco_linked_order_id: oco.map(Into::into),
            fill_time: None,
            historical: false,
        }
    }

    #[tokio::test]
    async fn drift_disarms_even_before_switch() {
        let h = harness(3);
        h.router.handle_value(&position("120005", 0.0));
        assert_eq!(h.router.remembered_scope(), Some(Scope::new(Mode::Live, "120005")));
        h.guard.arm(Mode::Live).unwrap();

        h.router.handle_value(&position("Sim1", 0.0));
        assert!(!h.guard.is_armed());
        assert_eq!(h.router.remembered_scope(), Some(Scope::new(Mode::Live, "120005")));
    }

    #[tokio::test]
    async fn switch_after_consecutive_confirmations() {
        let h = harness(2);
        let mut rx = h.bus.subscribe();
        h.router.handle_value(&position("Sim1", 0.0));
        h.router.handle_value(&position("Sim2", 0.0));
        assert_eq!(h.state.current_scope(), Scope::new(Mode::Sim, "Sim1"));
        h.router.handle_value(&position("Sim2", 0.0));
        assert_eq!(h.state.current_scope(), Scope::new(Mode::Sim, "Sim2"));
        let drifts = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, UiEvent::ModeDrift { .. }))
            .count();
        assert_eq!(drifts, 2);
    }

    #[tokio::test]
    async fn interleaved_noise_resets_the_candidate() {
        let h = harness(2);
        h.router.handle_value(&position("Sim1", 0.0));
        h.router.handle_value(&position("Sim2", 0.0));
        h.router.handle_value(&position("Sim1", 0.0));
        h.router.handle_value(&position("Sim2", 0.0));
        assert_eq!(h.state.current_scope(), Scope::new(Mode::Sim, "Sim1"));
    }

    #[tokio::test]
    async fn live_position_blocks_switch_to_sim() {
        let h = harness(1);
        let mut rx = h.bus.subscribe();
        h.router.handle_value(&position("120005", 2.0));
        assert!(h.state.position(&Scope::new(Mode::Live, "120005")).is_some());
        h.router.handle_value(&position("Sim1", 0.0));
        assert_eq!(h.state.current_scope(), Scope::new(Mode::Live, "120005"));
        let blocked = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| matches!(e, UiEvent::ModeSwitchBlocked { blocking_mode: Mode::Live, .. }));
        assert!(blocked);
    }

    #[tokio::test]
    async fn only_live_balance_pushes_are_applied() {
        let h = harness(2);
        h.router.handle_value(&json!({"Type": 600, "CashBalance": 5.0, "TradeAccount": "Sim1"}));
        h.router.handle_value(&json!({"Type": 600, "CashBalance": 42_000.0, "TradeAccount": "120005"}));
        assert_eq!(h.state.get_balance_for_mode(Mode::Sim, "Sim1"), 10_000.0);
        assert_eq!(h.state.get_balance_for_mode(Mode::Live, "120005"), 42_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_coalesce_within_window() {
        let h = harness(2);
        for _ in 0..25 {
            h.router.handle_value(&json!({"Type": 600, "CashBalance": 1.0, "TradeAccount": "120005"}));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.router.refresh_flushes(), 1);
        h.router.handle_value(&json!({"Type": 600, "CashBalance": 2.0, "TradeAccount": "120005"}));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.router.refresh_flushes(), 2);
    }

    #[test]
    fn brackets_group_children_and_pair_ocos() {
        let h = harness(2);
        for o in [
            order("10", None, None),
            order("11", Some("10"), Some("12")),
            order("12", Some("10"), Some("11")),
            order("20", None, None),
        ] {
            h.router.record_order(&o);
        }
        let b = h.router.rebuild_brackets();
        assert_eq!(b.groups, vec![BracketGroup { parent: "10".into(), children: vec!["11".into(), "12".into()] }]);
        assert_eq!(b.oco_pairs, vec![("11".to_string(), "12".to_string())]);
    }

    struct PositionsOnly;
    impl DtcRequester for PositionsOnly {
        fn request_positions(&self, _account: Option<&str>) -> Result<u32, RequestError> {
            Ok(7)
        }
    }

    #[tokio::test]
    async fn recovery_tolerates_missing_capabilities() {
        let h = harness(2);
        let steps = h.router.run_recovery(&PositionsOnly).await;
        assert_eq!(steps.positions, Ok(7));
        assert!(matches!(steps.orders, Err(RequestError::Unsupported(_))));
        assert!(matches!(steps.fills, Err(RequestError::Unsupported(_))));
        assert_eq!(steps.brackets, Brackets::default());
    }

    struct NoRequests;
    impl DtcRequester for NoRequests {}

    #[tokio::test]
    async fn run_applies_messages_in_receipt_order() {
        let h = harness(2);
        let (tx, rx) = broadcast::channel(16);
        let task = tokio::spawn(run(h.router.clone(), rx, Arc::new(NoRequests), CancellationToken::new()));

        tx.send(ConnEvent::Message(position("Sim1", 2.0))).unwrap();
        tx.send(ConnEvent::Message(json!({
            "Type": 301, "Symbol": "ESZ5", "ServerOrderID": "9", "BuySell": 2, "OrderStatus": 7,
            "AverageFillPrice": 6004.0, "FilledQuantity": 2, "TradeAccount": "Sim1"
        })))
        .unwrap();
        tx.send(ConnEvent::Message(position("Sim1", 0.0))).unwrap();
        drop(tx);
        task.await.unwrap();

        let scope = Scope::new(Mode::Sim, "Sim1");
        assert_eq!(h.repo.trade_count().unwrap(), 1);
        assert_eq!(h.repo.recent_trades(&scope, 1).unwrap()[0].exit_price, 6004.0);
        assert!(h.state.position(&scope).is_none());
    }
}
