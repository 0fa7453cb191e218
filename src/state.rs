// ===============================
// src/state.rs
// ===============================
//
// In-process cache of the active scope, per-(mode, account) balances, open
// positions and a bounded mode-change history.
//
// One mutex guards everything. Helpers that run while the lock is held take
// `&mut StateInner` instead of locking again. Notifications are published
// only after the guard is dropped, so a subscriber may call back in freely.
//
use std::collections::VecDeque;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bus::{EventBus, UiEvent};
use crate::domain::{Mode, OpenPosition, Scope};
use crate::metrics::BALANCE;

pub const MODE_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct StartingBalances {
    pub sim: f64,
    pub debug: f64,
}

impl Default for StartingBalances {
    fn default() -> Self {
        Self { sim: 10_000.0, debug: 10_000.0 }
    }
}

impl StartingBalances {
    pub fn for_mode(&self, mode: Mode) -> f64 {
        match mode {
            Mode::Sim => self.sim,
            Mode::Debug => self.debug,
            Mode::Live => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeChange {
    pub at: DateTime<Utc>,
    pub from: Scope,
    pub to: Scope,
}

#[derive(Debug, Default)]
struct StateInner {
    scope: Scope,
    balances: HashMap<(Mode, String), f64>,
    positions: HashMap<Scope, OpenPosition>,
    mode_history: VecDeque<ModeChange>,
    known_accounts: Vec<String>,
}

impl StateInner {
    fn push_history(&mut self, change: ModeChange) {
        if self.mode_history.len() == MODE_HISTORY_CAP {
            self.mode_history.pop_front();
        }
        self.mode_history.push_back(change);
    }

    fn balance(&self, starting: &StartingBalances, mode: Mode, account: &str) -> f64 {
        self.balances
            .get(&(mode, account.to_string()))
            .copied()
            .unwrap_or_else(|| starting.for_mode(mode))
    }
}

pub struct StateManager {
    inner: Mutex<StateInner>,
    starting: StartingBalances,
    bus: EventBus,
}

impl StateManager {
    pub fn new(starting: StartingBalances, bus: EventBus) -> Self {
        Self { inner: Mutex::new(StateInner::default()), starting, bus }
    }

    pub fn starting_balances(&self) -> StartingBalances {
        self.starting
    }

    pub fn current_scope(&self) -> Scope {
        self.inner.lock().scope.clone()
    }

    pub fn current_mode(&self) -> Mode {
        self.inner.lock().scope.mode
    }

    /// Derive the mode from `account` and make it the active scope.
    /// Returns the change, or None if the scope was already active.
    pub fn set_mode(&self, account: &str) -> Option<ModeChange> {
        let to = Scope::for_account(account);
        let (change, balance) = {
            let mut g = self.inner.lock();
            if g.scope == to {
                return None;
            }
            let change = ModeChange { at: Utc::now(), from: g.scope.clone(), to: to.clone() };
            g.scope = to.clone();
            g.push_history(change.clone());
            let balance = g.balance(&self.starting, to.mode, &to.account);
            (change, balance)
        };
        info!(from = ?change.from, to = ?change.to, "active scope changed");
        self.bus.publish(UiEvent::ModeChanged { mode: to.mode, account: to.account.clone() });
        self.bus.publish(UiEvent::BalanceChanged { balance, account: to.account, mode: to.mode });
        Some(change)
    }

    pub fn mode_history(&self) -> Vec<ModeChange> {
        self.inner.lock().mode_history.iter().cloned().collect()
    }

    pub fn get_balance_for_mode(&self, mode: Mode, account: &str) -> f64 {
        self.inner.lock().balance(&self.starting, mode, account)
    }

    /// Absolute set; only the `(mode, account)` entry is touched.
    pub fn set_balance_for_mode(&self, mode: Mode, account: &str, value: f64) {
        {
            let mut g = self.inner.lock();
            g.balances.insert((mode, account.to_string()), value);
        }
        self.after_balance_change(mode, account, value);
    }

    /// Atomic read-modify-write; returns the new balance.
    pub fn adjust_balance_for_mode(&self, mode: Mode, account: &str, delta: f64) -> f64 {
        let value = {
            let mut g = self.inner.lock();
            let current = g.balance(&self.starting, mode, account);
            let next = current + delta;
            g.balances.insert((mode, account.to_string()), next);
            next
        };
        self.after_balance_change(mode, account, value);
        value
    }

    fn after_balance_change(&self, mode: Mode, account: &str, value: f64) {
        BALANCE.with_label_values(&[mode.as_str(), account]).set(value);
        debug!(%mode, %account, balance = value, "balance updated");
        self.bus.publish(UiEvent::BalanceChanged { balance: value, account: account.to_string(), mode });
    }

    pub fn balances(&self) -> Vec<(Mode, String, f64)> {
        let g = self.inner.lock();
        let mut v: Vec<(Mode, String, f64)> =
            g.balances.iter().map(|((m, a), b)| (*m, a.clone(), *b)).collect();
        v.sort_by(|a, b| (a.0.precedence(), &a.1).cmp(&(b.0.precedence(), &b.1)));
        v
    }

    /// Cache an open (or scaled) position for its scope.
    pub fn open_position(&self, pos: OpenPosition) {
        let mut g = self.inner.lock();
        g.positions.insert(pos.scope(), pos);
    }

    pub fn close_position(&self, scope: &Scope) -> Option<OpenPosition> {
        self.inner.lock().positions.remove(scope)
    }

    pub fn position(&self, scope: &Scope) -> Option<OpenPosition> {
        self.inner.lock().positions.get(scope).cloned()
    }

    pub fn active_position(&self) -> Option<OpenPosition> {
        let g = self.inner.lock();
        g.positions.get(&g.scope).cloned()
    }

    pub fn positions(&self) -> Vec<OpenPosition> {
        self.inner.lock().positions.values().cloned().collect()
    }

    /// Modes that currently hold an open position, other than `except`.
    pub fn open_position_modes(&self, except: Option<&Scope>) -> Vec<Mode> {
        let g = self.inner.lock();
        let mut modes: Vec<Mode> = g
            .positions
            .keys()
            .filter(|s| Some(*s) != except)
            .map(|s| s.mode)
            .collect();
        modes.sort_by_key(|m| m.precedence());
        modes.dedup();
        modes
    }

    pub fn add_known_account(&self, account: &str) -> bool {
        let mut g = self.inner.lock();
        if g.known_accounts.iter().any(|a| a == account) {
            return false;
        }
        g.known_accounts.push(account.to_string());
        true
    }

    pub fn known_accounts(&self) -> Vec<String> {
        self.inner.lock().known_accounts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntrySnapshot, PositionSide};
    use std::sync::Arc;

    fn manager() -> StateManager {
        StateManager::new(StartingBalances { sim: 10_000.0, debug: 500.0 }, EventBus::new(1024))
    }

    fn position(account: &str) -> OpenPosition {
        let now = Utc::now();
        OpenPosition {
            mode: Mode::from_account(account),
            account: account.into(),
            symbol: "ESZ5".into(),
            qty: 1.0,
            side: PositionSide::Long,
            entry_price: 6000.0,
            entry_time: now,
            entry_snapshot: EntrySnapshot::default(),
            target_price: None,
            stop_price: None,
            trade_min_price: 6000.0,
            trade_max_price: 6000.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn concurrent_adjustments_lose_nothing() {
        let sm = Arc::new(manager());
        sm.set_balance_for_mode(Mode::Sim, "Sim1", 2_500.0);
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let sm = sm.clone();
                std::thread::spawn(move || {
                    sm.adjust_balance_for_mode(Mode::Sim, "Sim1", 10.0);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sm.get_balance_for_mode(Mode::Sim, "Sim1"), 3_500.0);
    }

    #[test]
    fn balance_updates_are_mode_isolated() {
        let sm = manager();
        let modes = [Mode::Debug, Mode::Sim, Mode::Live];
        for a in modes {
            for b in modes {
                if a == b {
                    continue;
                }
                let before = sm.get_balance_for_mode(b, "acct");
                sm.set_balance_for_mode(a, "acct", 123.0);
                sm.adjust_balance_for_mode(a, "acct", 7.0);
                assert_eq!(sm.get_balance_for_mode(b, "acct"), before, "{a} touched {b}");
            }
        }
    }

    #[test]
    fn defaults_come_from_starting_balances() {
        let sm = manager();
        assert_eq!(sm.get_balance_for_mode(Mode::Sim, "Sim9"), 10_000.0);
        assert_eq!(sm.get_balance_for_mode(Mode::Debug, ""), 500.0);
        assert_eq!(sm.get_balance_for_mode(Mode::Live, "120005"), 0.0);
    }

    #[test]
    fn set_mode_records_history_and_notifies() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let sm = StateManager::new(StartingBalances::default(), bus);
        let change = sm.set_mode("Sim1").unwrap();
        assert_eq!(change.to, Scope::new(Mode::Sim, "Sim1"));
        assert!(sm.set_mode("Sim1").is_none());
        assert_eq!(
            rx.try_recv().ok(),
            Some(UiEvent::ModeChanged { mode: Mode::Sim, account: "Sim1".into() })
        );
        assert!(matches!(rx.try_recv(), Ok(UiEvent::BalanceChanged { mode: Mode::Sim, .. })));
        assert_eq!(sm.mode_history().len(), 1);
    }

    #[test]
    fn mode_history_is_capped() {
        let sm = manager();
        for i in 0..(MODE_HISTORY_CAP + 20) {
            sm.set_mode(&format!("Sim{i}"));
        }
        let h = sm.mode_history();
        assert_eq!(h.len(), MODE_HISTORY_CAP);
        assert_eq!(h.last().unwrap().to.account, format!("Sim{}", MODE_HISTORY_CAP + 19));
    }

    #[test]
    fn subscriber_can_reenter_on_notification() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let sm = Arc::new(StateManager::new(StartingBalances::default(), bus));
        sm.adjust_balance_for_mode(Mode::Sim, "Sim1", 1.0);
        // Reading back while handling the notification must not deadlock.
        if let Ok(UiEvent::BalanceChanged { mode, account, .. }) = rx.try_recv() {
            assert_eq!(sm.get_balance_for_mode(mode, &account), 10_001.0);
        } else {
            panic!("no notification");
        }
    }

    #[test]
    fn positions_cached_per_scope() {
        let sm = manager();
        sm.set_mode("Sim1");
        sm.open_position(position("Sim1"));
        sm.open_position(position("120005"));
        assert_eq!(sm.active_position().map(|p| p.account), Some("Sim1".to_string()));
        assert_eq!(sm.open_position_modes(Some(&Scope::new(Mode::Sim, "Sim1"))), vec![Mode::Live]);
        assert!(sm.close_position(&Scope::new(Mode::Sim, "Sim1")).is_some());
        assert!(sm.active_position().is_none());
        assert!(sm.close_position(&Scope::new(Mode::Sim, "Sim1")).is_none());
    }
}
