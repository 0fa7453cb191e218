// ===============================
// src/recovery.rs
// ===============================
//
// Startup reconciliation: repository -> state manager.
// Fresh positions are restored; stale ones are only reported, since the
// broker may have flattened them while we were down.
//
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::bus::{EventBus, UiEvent};
use crate::domain::{Mode, OpenPosition, Scope};
use crate::metrics::OPEN_POSITIONS;
use crate::repository::{PositionRepository, RepoResult};
use crate::state::StateManager;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub restored: Vec<OpenPosition>,
    pub stale: Vec<OpenPosition>,
}

/// SIM balance = starting balance + realized PnL in the ledger.
pub fn derive_sim_balance(repo: &dyn PositionRepository, state: &StateManager, account: &str) -> RepoResult<f64> {
    let pnl = repo.realized_pnl_total(&Scope::new(Mode::Sim, account))?;
    let balance = state.starting_balances().sim + pnl;
    state.set_balance_for_mode(Mode::Sim, account, balance);
    Ok(balance)
}

pub struct PositionRecoveryService {
    repo: Arc<dyn PositionRepository>,
    state: Arc<StateManager>,
    bus: EventBus,
    max_age: ChronoDuration,
}

impl PositionRecoveryService {
    pub fn new(
        repo: Arc<dyn PositionRepository>,
        state: Arc<StateManager>,
        bus: EventBus,
        max_age_hours: u32,
    ) -> Self {
        Self { repo, state, bus, max_age: ChronoDuration::hours(i64::from(max_age_hours)) }
    }

    pub fn recover(&self) -> RepoResult<RecoveryReport> {
        self.recover_at(Utc::now())
    }

    pub fn recover_at(&self, now: DateTime<Utc>) -> RepoResult<RecoveryReport> {
        let all = self.repo.recover_all_open_positions()?;
        let (restored, stale): (Vec<_>, Vec<_>) =
            all.into_iter().partition(|p| now.signed_duration_since(p.updated_at) <= self.max_age);

        let active = self.state.current_scope();
        for p in &restored {
            self.state.open_position(p.clone());
            if p.scope() == active {
                self.bus.publish(UiEvent::PositionOpened(p.clone()));
            }
        }
        OPEN_POSITIONS.set(self.state.positions().len() as i64);

        let mut sim_accounts: Vec<&str> = restored
            .iter()
            .chain(stale.iter())
            .filter(|p| p.mode == Mode::Sim)
            .map(|p| p.account.as_str())
            .collect();
        sim_accounts.sort_unstable();
        sim_accounts.dedup();
        for account in sim_accounts {
            derive_sim_balance(self.repo.as_ref(), &self.state, account)?;
        }

        if !stale.is_empty() {
            for p in &stale {
                warn!(
                    mode = %p.mode,
                    account = %p.account,
                    symbol = %p.symbol,
                    qty = p.qty,
                    updated_at = %p.updated_at,
                    "stale open position not restored"
                );
            }
            warn!(count = stale.len(), max_age_h = self.max_age.num_hours(), "stale positions need manual review");
            self.bus.publish(UiEvent::StalePositions { positions: stale.clone() });
        }
        info!(restored = restored.len(), stale = stale.len(), "position recovery finished");
        Ok(RecoveryReport { restored, stale })
    }
}
