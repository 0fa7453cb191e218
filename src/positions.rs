// ===============================
// src/positions.rs (position lifecycle tracker)
// ===============================
//
// Turns position quantity transitions into repository/state changes:
//   0 -> N   open         N -> M   scale (same sign)
//   N -> 0   close        N -> -M  close, then open the other side
// Live fill prices widen the stored trade extremes.
// Updates for a symbol other than the held one never touch the stored row.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, UiEvent};
use crate::domain::{CloseRequest, NewPosition, OrderStatus, OrderUpdate, Scope};
use crate::metrics::OPEN_POSITIONS;
use crate::repository::{PositionRepository, RepoResult};
use crate::state::StateManager;
use crate::trade_close::{CloseOutcome, TradeCloseService};

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Unchanged,
    Opened,
    Scaled,
    Closed(CloseOutcome),
    /// Close of the old side; the new side is opened only if the close went through.
    Flipped(CloseOutcome),
    /// Update for another instrument while `held` is open on the same account.
    ForeignSymbol { held: String },
}

pub struct PositionTracker {
    repo: Arc<dyn PositionRepository>,
    state: Arc<StateManager>,
    closer: Arc<TradeCloseService>,
    bus: EventBus,
    // symbol -> last live fill price
    last_prices: Mutex<HashMap<String, f64>>,
}

impl PositionTracker {
    pub fn new(
        repo: Arc<dyn PositionRepository>,
        state: Arc<StateManager>,
        closer: Arc<TradeCloseService>,
        bus: EventBus,
    ) -> Self {
        Self { repo, state, closer, bus, last_prices: Mutex::new(HashMap::new()) }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.lock().get(symbol).copied()
    }

    fn current(&self, scope: &Scope) -> RepoResult<Option<crate::domain::OpenPosition>> {
        if let Some(p) = self.state.position(scope) {
            return Ok(Some(p));
        }
        self.repo.load_open_position(scope)
    }

    fn open(&self, scope: &Scope, pos: NewPosition, scaled: bool) -> RepoResult<()> {
        let saved = self.repo.save_open_position(scope, &pos)?;
        self.state.open_position(saved.clone());
        OPEN_POSITIONS.set(self.state.positions().len() as i64);
        if scaled {
            debug!(account = %scope.account, qty = saved.qty, "position scaled");
            self.bus.publish(UiEvent::PositionUpdated(saved));
        } else {
            info!(mode = %scope.mode, account = %scope.account, symbol = %saved.symbol, qty = saved.qty, entry = saved.entry_price, "position opened");
            self.bus.publish(UiEvent::PositionOpened(saved));
        }
        Ok(())
    }

    fn close(&self, scope: &Scope, symbol: &str, exit_price: f64, at: DateTime<Utc>) -> CloseOutcome {
        self.closer.close(CloseRequest {
            exit_price: Some(exit_price),
            symbol: Some(symbol.to_string()),
            account: Some(scope.account.clone()),
            exit_time: Some(at),
            ..CloseRequest::default()
        })
    }

    pub fn on_position_update(
        &self,
        symbol: &str,
        qty: f64,
        avg_entry: f64,
        account: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> RepoResult<Transition> {
        let scope = Scope::for_account(account);
        let at = timestamp.unwrap_or_else(Utc::now);
        let prev = self.current(&scope)?;
        let entry_or_last = |fallback: f64| {
            if avg_entry > 0.0 {
                avg_entry
            } else {
                self.last_price(symbol).unwrap_or(fallback)
            }
        };

        match prev {
            Some(p) if p.symbol != symbol => {
                warn!(%account, held = %p.symbol, incoming = %symbol, qty, "position update for another symbol ignored");
                Ok(Transition::ForeignSymbol { held: p.symbol })
            }
            None if qty == 0.0 => Ok(Transition::Unchanged),
            None => {
                let price = entry_or_last(0.0);
                if price <= 0.0 {
                    warn!(%symbol, %account, qty, "position without a usable entry price; ignored");
                    return Ok(Transition::Unchanged);
                }
                self.open(&scope, NewPosition::new(symbol, qty, price, at), false)?;
                Ok(Transition::Opened)
            }
            Some(p) if qty == 0.0 => {
                let exit = self.last_price(&p.symbol).unwrap_or(p.entry_price);
                Ok(Transition::Closed(self.close(&scope, &p.symbol, exit, at)))
            }
            Some(p) if qty.signum() != p.qty.signum() => {
                let price = entry_or_last(p.entry_price);
                let outcome = self.close(&scope, &p.symbol, price, at);
                match &outcome {
                    CloseOutcome::Closed(_) | CloseOutcome::NoOp(_) => {
                        self.open(&scope, NewPosition::new(symbol, qty, price, at), false)?;
                    }
                    CloseOutcome::Failed(e) => {
                        warn!(%account, %symbol, error = %e, "flip close failed; held side left in place");
                    }
                }
                Ok(Transition::Flipped(outcome))
            }
            Some(p) => {
                let price = if avg_entry > 0.0 { avg_entry } else { p.entry_price };
                if p.qty == qty && p.entry_price == price {
                    self.state.open_position(p);
                    return Ok(Transition::Unchanged);
                }
                let mut next = NewPosition::new(symbol, qty, price, p.entry_time);
                next.entry_snapshot = p.entry_snapshot.clone();
                next.target_price = p.target_price;
                next.stop_price = p.stop_price;
                self.open(&scope, next, true)?;
                Ok(Transition::Scaled)
            }
        }
    }

    /// Live fills feed the exit price used when a position goes flat.
    pub fn on_fill(&self, order: &OrderUpdate) {
        if order.historical || !matches!(order.status, OrderStatus::Filled | OrderStatus::PartiallyFilled) {
            return;
        }
        let Some(price) = order.price.filter(|p| *p > 0.0) else { return };
        self.last_prices.lock().insert(order.symbol.clone(), price);
        self.widen(&Scope::for_account(&order.account), &order.symbol, price);
    }

    fn widen(&self, scope: &Scope, symbol: &str, price: f64) {
        match self.repo.update_trade_extremes(scope, price) {
            Ok(true) => {
                if let Ok(Some(p)) = self.repo.load_open_position(scope) {
                    if p.symbol == symbol {
                        self.state.open_position(p);
                    }
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, account = %scope.account, "extreme update failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingCfg;
    use crate::domain::{CloseParams, ClosedTrade, Mode, OpenPosition, PositionSide, Side};
    use crate::repository::{RepoError, SqlitePositionRepository};
    use crate::state::StartingBalances;

    fn tracker() -> (PositionTracker, Arc<SqlitePositionRepository>, Arc<StateManager>) {
        let bus = EventBus::new(256);
        let repo = Arc::new(SqlitePositionRepository::in_memory().unwrap());
        let state = Arc::new(StateManager::new(StartingBalances::default(), bus.clone()));
        let closer = Arc::new(TradeCloseService::new(repo.clone(), state.clone(), bus.clone(), TradingCfg::default()));
        (PositionTracker::new(repo.clone(), state.clone(), closer, bus), repo, state)
    }

    fn fill(symbol: &str, account: &str, price: f64) -> OrderUpdate {
        OrderUpdate {
            symbol: symbol.into(),
            side: Some(Side::Sell),
            status: OrderStatus::Filled,
            price: Some(price),
            filled_qty: 2.0,
            account: account.into(),
            server_order_id: Some("1".into()),
            parent_server_order_id: None,
            oco_linked_order_id: None,
            fill_time: None,
            historical: false,
        }
    }

    #[test]
    fn open_scale_close_cycle() {
        let (t, repo, state) = tracker();
        let scope = Scope::new(Mode::Sim, "Sim1");
        assert_eq!(t.on_position_update("ESZ5", 2.0, 6000.0, "Sim1", None).unwrap(), Transition::Opened);
        assert!(state.position(&scope).is_some());
        assert_eq!(t.on_position_update("ESZ5", 2.0, 6000.0, "Sim1", None).unwrap(), Transition::Unchanged);
        assert_eq!(t.on_position_update("ESZ5", 3.0, 6001.0, "Sim1", None).unwrap(), Transition::Scaled);

        t.on_fill(&fill("ESZ5", "Sim1", 6005.0));
        let tr = t.on_position_update("ESZ5", 0.0, 0.0, "Sim1", None).unwrap();
        let Transition::Closed(CloseOutcome::Closed(trade)) = tr else { panic!("expected close, got {tr:?}") };
        assert_eq!(trade.exit_price, 6005.0);
        assert_eq!(trade.trade_max_price, 6005.0);
        assert_eq!(repo.trade_count().unwrap(), 1);
        assert!(repo.load_open_position(&scope).unwrap().is_none());
        assert!(state.position(&scope).is_none());
    }

    #[test]
    fn sign_flip_closes_then_reopens() {
        let (t, repo, _state) = tracker();
        t.on_position_update("NQZ5", 1.0, 21000.0, "Sim1", None).unwrap();
        let tr = t.on_position_update("NQZ5", -2.0, 21010.0, "Sim1", None).unwrap();
        assert!(matches!(tr, Transition::Flipped(CloseOutcome::Closed(_))));
        let p = repo.load_open_position(&Scope::new(Mode::Sim, "Sim1")).unwrap().unwrap();
        assert_eq!((p.qty, p.entry_price), (-2.0, 21010.0));
    }

    #[test]
    fn flat_update_without_position_is_ignored() {
        let (t, repo, _state) = tracker();
        assert_eq!(t.on_position_update("ESZ5", 0.0, 0.0, "Sim1", None).unwrap(), Transition::Unchanged);
        assert_eq!(repo.trade_count().unwrap(), 0);
    }

    #[test]
    fn live_fills_widen_extremes() {
        let (t, repo, state) = tracker();
        t.on_position_update("ESZ5", 1.0, 6000.0, "Sim1", None).unwrap();
        t.on_fill(&fill("ESZ5", "Sim1", 5990.0));
        t.on_fill(&fill("ESZ5", "Sim1", 6012.0));
        let mut old = fill("ESZ5", "Sim1", 5000.0);
        old.historical = true;
        t.on_fill(&old);
        let p = repo.load_open_position(&Scope::new(Mode::Sim, "Sim1")).unwrap().unwrap();
        assert_eq!((p.trade_min_price, p.trade_max_price), (5990.0, 6012.0));
        assert_eq!(state.position(&p.scope()).unwrap().trade_max_price, 6012.0);
    }

    #[test]
    fn other_symbol_never_touches_held_position() {
        let (t, repo, _state) = tracker();
        let scope = Scope::new(Mode::Sim, "Sim1");
        t.on_position_update("ESZ5", 1.0, 6000.0, "Sim1", None).unwrap();

        let flat = t.on_position_update("NQZ5", 0.0, 0.0, "Sim1", None).unwrap();
        assert_eq!(flat, Transition::ForeignSymbol { held: "ESZ5".into() });
        assert_eq!(repo.trade_count().unwrap(), 0);

        let sized = t.on_position_update("NQZ5", 1.0, 21000.0, "Sim1", None).unwrap();
        assert!(matches!(sized, Transition::ForeignSymbol { .. }));
        let p = repo.load_open_position(&scope).unwrap().unwrap();
        assert_eq!((p.symbol.as_str(), p.qty, p.entry_price), ("ESZ5", 1.0, 6000.0));
        assert_eq!((p.trade_min_price, p.trade_max_price), (6000.0, 6000.0));
    }

    /// Sqlite repository whose closes always fail.
    struct FailingClose(SqlitePositionRepository);

    impl PositionRepository for FailingClose {
        fn save_open_position(&self, scope: &Scope, pos: &NewPosition) -> RepoResult<OpenPosition> {
            self.0.save_open_position(scope, pos)
        }
        fn update_trade_extremes(&self, scope: &Scope, price: f64) -> RepoResult<bool> {
            self.0.update_trade_extremes(scope, price)
        }
        fn close_position(&self, _scope: &Scope, _params: &CloseParams) -> RepoResult<Option<ClosedTrade>> {
            Err(RepoError::InvalidInput("disk full".into()))
        }
        fn load_open_position(&self, scope: &Scope) -> RepoResult<Option<OpenPosition>> {
            self.0.load_open_position(scope)
        }
        fn recover_all_open_positions(&self) -> RepoResult<Vec<OpenPosition>> {
            self.0.recover_all_open_positions()
        }
        fn realized_pnl_total(&self, scope: &Scope) -> RepoResult<f64> {
            self.0.realized_pnl_total(scope)
        }
        fn recent_trades(&self, scope: &Scope, limit: usize) -> RepoResult<Vec<ClosedTrade>> {
            self.0.recent_trades(scope, limit)
        }
        fn trade_count(&self) -> RepoResult<u64> {
            self.0.trade_count()
        }
        fn last_fill_time(&self) -> RepoResult<Option<DateTime<Utc>>> {
            self.0.last_fill_time()
        }
    }

    #[test]
    fn failed_flip_close_keeps_the_held_side() {
        let bus = EventBus::new(256);
        let repo = Arc::new(FailingClose(SqlitePositionRepository::in_memory().unwrap()));
        let state = Arc::new(StateManager::new(StartingBalances::default(), bus.clone()));
        let closer = Arc::new(TradeCloseService::new(repo.clone(), state.clone(), bus.clone(), TradingCfg::default()));
        let t = PositionTracker::new(repo.clone(), state.clone(), closer, bus);
        let scope = Scope::new(Mode::Sim, "Sim1");

        t.on_position_update("ESZ5", 1.0, 6000.0, "Sim1", None).unwrap();
        t.on_fill(&fill("ESZ5", "Sim1", 5950.0));
        let tr = t.on_position_update("ESZ5", -2.0, 6010.0, "Sim1", None).unwrap();
        assert!(matches!(tr, Transition::Flipped(CloseOutcome::Failed(_))), "{tr:?}");

        let p = repo.load_open_position(&scope).unwrap().unwrap();
        assert_eq!((p.qty, p.side, p.entry_price), (1.0, PositionSide::Long, 6000.0));
        assert_eq!(p.trade_min_price, 5950.0);
        assert_eq!(state.position(&scope).unwrap().qty, 1.0);
    }

    #[test]
    fn flip_starts_fresh_extremes_for_new_side() {
        let (t, repo, _state) = tracker();
        t.on_position_update("ESZ5", 1.0, 6000.0, "Sim1", None).unwrap();
        t.on_fill(&fill("ESZ5", "Sim1", 5950.0));
        t.on_position_update("ESZ5", -2.0, 6010.0, "Sim1", None).unwrap();
        let p = repo.load_open_position(&Scope::new(Mode::Sim, "Sim1")).unwrap().unwrap();
        assert_eq!((p.trade_min_price, p.trade_max_price), (6010.0, 6010.0));
        assert_eq!(repo.trade_count().unwrap(), 1);
    }
}
