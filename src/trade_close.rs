// ===============================
// src/trade_close.rs
// ===============================
//
// Close intent -> validate -> repository commit -> balance/state -> outcome.
// The repository transaction is the commit point: nothing before it mutates,
// and everything after it is infallible.
//
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{EventBus, UiEvent};
use crate::config::TradingCfg;
use crate::domain::{CloseParams, CloseRequest, ClosedTrade, Mode, Scope};
use crate::metrics::{OPEN_POSITIONS, TRADES_CLOSED};
use crate::repository::{PositionRepository, RepoError};
use crate::state::StateManager;

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("close request is missing {0}")]
    MissingField(&'static str),
    #[error("invalid exit price {0}")]
    InvalidPrice(f64),
    #[error("repository: {0}")]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(ClosedTrade),
    /// No open position for the scope; somebody else already closed it.
    NoOp(Scope),
    Failed(String),
}

pub struct TradeCloseService {
    repo: Arc<dyn PositionRepository>,
    state: Arc<StateManager>,
    bus: EventBus,
    trading: TradingCfg,
}

impl TradeCloseService {
    pub fn new(
        repo: Arc<dyn PositionRepository>,
        state: Arc<StateManager>,
        bus: EventBus,
        trading: TradingCfg,
    ) -> Self {
        Self { repo, state, bus, trading }
    }

    /// The account is authoritative for the mode; the active scope is only
    /// a hint that may lag behind.
    pub fn resolve_scope(&self, account: &str) -> Scope {
        let current = self.state.current_scope();
        let derived = Mode::from_account(account);
        if current.account == account && current.mode == derived {
            return current;
        }
        if current.account == account {
            warn!(state_mode = %current.mode, derived = %derived, %account, "state mode disagrees with account; trusting account");
        }
        Scope::new(derived, account)
    }

    fn validate(req: &CloseRequest) -> Result<(f64, String), CloseError> {
        let exit = req.exit_price.ok_or(CloseError::MissingField("exit_price"))?;
        if !exit.is_finite() || exit <= 0.0 {
            return Err(CloseError::InvalidPrice(exit));
        }
        let account = req
            .account
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or(CloseError::MissingField("account"))?;
        Ok((exit, account.to_string()))
    }

    fn try_close(&self, req: &CloseRequest) -> Result<Option<ClosedTrade>, CloseError> {
        let (exit_price, account) = Self::validate(req)?;
        let scope = self.resolve_scope(&account);

        // Read-only peek for symbol/qty; the close below re-reads inside its transaction
        let open = self.repo.load_open_position(&scope)?;
        let symbol = req
            .symbol
            .clone()
            .or_else(|| open.as_ref().map(|p| p.symbol.clone()))
            .unwrap_or_default();
        let qty = open.as_ref().map(|p| p.qty).unwrap_or(0.0);
        let params = CloseParams {
            exit_price,
            exit_time: req.exit_time.unwrap_or_else(Utc::now),
            point_value: self.trading.point_value_for(&symbol),
            commissions: req.commissions.unwrap_or_else(|| self.trading.commissions_for(qty)),
            mae: req.mae,
            mfe: req.mfe,
        };

        let Some(trade) = self.repo.close_position(&scope, &params)? else {
            return Ok(None);
        };

        // Committed. LIVE balances only ever come from the peer.
        if trade.mode == Mode::Sim {
            self.state.adjust_balance_for_mode(Mode::Sim, &trade.account, trade.realized_pnl);
        }
        self.state.close_position(&scope);
        OPEN_POSITIONS.set(self.state.positions().len() as i64);
        TRADES_CLOSED.with_label_values(&[trade.mode.as_str()]).inc();
        Ok(Some(trade))
    }

    pub fn close(&self, req: CloseRequest) -> CloseOutcome {
        match self.try_close(&req) {
            Ok(Some(trade)) => {
                info!(
                    id = trade.id,
                    mode = %trade.mode,
                    account = %trade.account,
                    symbol = %trade.symbol,
                    pnl = trade.realized_pnl,
                    "trade closed"
                );
                self.bus.publish(UiEvent::PositionClosed(trade.clone()));
                self.bus.publish(UiEvent::TradeClosedForAnalytics(trade.clone()));
                CloseOutcome::Closed(trade)
            }
            Ok(None) => {
                let account = req.account.unwrap_or_default();
                let scope = Scope::for_account(&account);
                warn!(mode = %scope.mode, %account, "close requested with no open position");
                self.bus.publish(UiEvent::CloseNoOp { mode: scope.mode, account });
                CloseOutcome::NoOp(scope)
            }
            Err(e) => {
                warn!(error = %e, "trade close failed");
                self.bus.publish(UiEvent::TradeCloseFailed { reason: e.to_string() });
                CloseOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewPosition;
    use crate::repository::SqlitePositionRepository;
    use crate::state::StartingBalances;

    fn setup() -> (TradeCloseService, Arc<SqlitePositionRepository>, Arc<StateManager>, EventBus) {
        let bus = EventBus::new(256);
        let repo = Arc::new(SqlitePositionRepository::in_memory().unwrap());
        let state = Arc::new(StateManager::new(StartingBalances::default(), bus.clone()));
        let svc = TradeCloseService::new(repo.clone(), state.clone(), bus.clone(), TradingCfg::default());
        (svc, repo, state, bus)
    }

    fn req(account: &str, exit: f64) -> CloseRequest {
        CloseRequest {
            exit_price: Some(exit),
            account: Some(account.into()),
            ..CloseRequest::default()
        }
    }

    #[test]
    fn sim_close_adjusts_balance_and_emits_both_outcomes() {
        let (svc, repo, state, bus) = setup();
        let mut rx = bus.subscribe();
        let scope = Scope::new(Mode::Sim, "Sim1");
        let p = repo.save_open_position(&scope, &NewPosition::new("ESZ5", 2.0, 6000.0, Utc::now())).unwrap();
        state.open_position(p);

        let out = svc.close(req("Sim1", 6004.0));
        let CloseOutcome::Closed(trade) = out else { panic!("expected a closed trade") };
        assert_eq!(trade.realized_pnl, 400.0);
        assert_eq!(state.get_balance_for_mode(Mode::Sim, "Sim1"), 10_400.0);
        assert!(state.position(&scope).is_none());

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            kinds.push(ev);
        }
        assert!(kinds.iter().any(|e| matches!(e, UiEvent::PositionClosed(_))));
        assert!(kinds.iter().any(|e| matches!(e, UiEvent::TradeClosedForAnalytics(_))));
    }

    #[test]
    fn live_close_leaves_balance_alone() {
        let (svc, repo, state, _bus) = setup();
        state.set_balance_for_mode(Mode::Live, "120005", 50_000.0);
        let scope = Scope::new(Mode::Live, "120005");
        repo.save_open_position(&scope, &NewPosition::new("NQZ5", -1.0, 21000.0, Utc::now())).unwrap();
        assert!(matches!(svc.close(req("120005", 20990.0)), CloseOutcome::Closed(_)));
        assert_eq!(state.get_balance_for_mode(Mode::Live, "120005"), 50_000.0);
    }

    #[test]
    fn second_close_is_a_noop() {
        let (svc, repo, _state, bus) = setup();
        let mut rx = bus.subscribe();
        repo.save_open_position(&Scope::new(Mode::Sim, "Sim1"), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))
            .unwrap();
        assert!(matches!(svc.close(req("Sim1", 6001.0)), CloseOutcome::Closed(_)));
        assert_eq!(svc.close(req("Sim1", 6001.0)), CloseOutcome::NoOp(Scope::new(Mode::Sim, "Sim1")));
        assert_eq!(repo.trade_count().unwrap(), 1);
        let saw_noop = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| matches!(e, UiEvent::CloseNoOp { .. }));
        assert!(saw_noop);
    }

    #[test]
    fn invalid_requests_fail_before_persistence() {
        let (svc, repo, state, _bus) = setup();
        repo.save_open_position(&Scope::new(Mode::Sim, "Sim1"), &NewPosition::new("ESZ5", 1.0, 6000.0, Utc::now()))
            .unwrap();
        let missing_price = CloseRequest { account: Some("Sim1".into()), ..CloseRequest::default() };
        assert!(matches!(svc.close(missing_price), CloseOutcome::Failed(_)));
        let missing_account = CloseRequest { exit_price: Some(6001.0), ..CloseRequest::default() };
        assert!(matches!(svc.close(missing_account), CloseOutcome::Failed(_)));
        assert!(matches!(svc.close(req("Sim1", -1.0)), CloseOutcome::Failed(_)));
        assert_eq!(repo.trade_count().unwrap(), 0);
        assert_eq!(state.get_balance_for_mode(Mode::Sim, "Sim1"), 10_000.0);
    }

    #[test]
    fn stale_state_mode_is_overridden_by_account() {
        let (svc, _repo, state, _bus) = setup();
        state.set_mode("Sim1");
        assert_eq!(svc.resolve_scope("120005"), Scope::new(Mode::Live, "120005"));
        assert_eq!(svc.resolve_scope("Sim1"), Scope::new(Mode::Sim, "Sim1"));
    }
}
