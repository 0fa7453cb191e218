// ===============================
// src/bus.rs
// ===============================
//
// Typed publish/subscribe between the core and the presentation layer.
// - UiEvent    : core -> presentation (broadcast, one receiver per subscriber)
// - CoreCommand: presentation -> core (mpsc)
//
// A subscription lives exactly as long as its Receiver; dropping it unsubscribes.
//
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::circuit_breaker::BreakerStats;
use crate::domain::{ClosedTrade, CloseRequest, Mode, OpenPosition, Scope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UiEvent {
    BalanceChanged { balance: f64, account: String, mode: Mode },
    ModeChanged { mode: Mode, account: String },
    ModeDrift { expected: Scope, incoming: Scope, kind: String },
    ModeSwitchBlocked { target: Scope, blocking_mode: Mode },
    TradingDisarmed { reason: String },
    PositionOpened(OpenPosition),
    PositionUpdated(OpenPosition),
    PositionClosed(ClosedTrade),
    TradeClosedForAnalytics(ClosedTrade),
    CloseNoOp { mode: Mode, account: String },
    TradeCloseFailed { reason: String },
    StalePositions { positions: Vec<OpenPosition> },
    ConnectionHealthy,
    ConnectionDegraded { reason: String },
    CircuitBreakerStats(BreakerStats),
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    RequestTimedOut { request_id: u32, request_type: String },
    /// Coalesced "state changed, redraw" notification.
    Refresh,
}

/// Commands flowing from the presentation layer into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    CloseTrade(CloseRequest),
    RefreshBalance { account: Option<String> },
}

pub type CommandSender = mpsc::Sender<CoreCommand>;
pub type CommandReceiver = mpsc::Receiver<CoreCommand>;

pub fn command_channel(cap: usize) -> (CommandSender, CommandReceiver) {
    mpsc::channel(cap)
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<UiEvent>,
}

impl EventBus {
    pub fn new(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn publish(&self, ev: UiEvent) {
        let _ = self.tx.send(ev);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Logs every outcome; stands in for the presentation layer in headless runs.
pub async fn run_log_sink(mut rx: broadcast::Receiver<UiEvent>) {
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "log sink lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match &ev {
            UiEvent::BalanceChanged { balance, account, mode } => {
                info!(%account, %mode, balance = *balance, "BALANCE")
            }
            UiEvent::ModeChanged { mode, account } => info!(%account, %mode, "MODE"),
            UiEvent::PositionOpened(p) | UiEvent::PositionUpdated(p) => {
                info!(symbol = %p.symbol, qty = p.qty, entry = p.entry_price, account = %p.account, "POSITION")
            }
            UiEvent::PositionClosed(t) => {
                info!(id = t.id, symbol = %t.symbol, pnl = t.realized_pnl, mae = t.mae, mfe = t.mfe, "CLOSED")
            }
            UiEvent::TradeCloseFailed { reason } => warn!(%reason, "CLOSE FAILED"),
            UiEvent::CloseNoOp { mode, account } => warn!(%mode, %account, "CLOSE NO-OP"),
            UiEvent::ConnectionDegraded { reason } => warn!(%reason, "DEGRADED"),
            UiEvent::StalePositions { positions } => warn!(count = positions.len(), "STALE POSITIONS"),
            UiEvent::Refresh => {}
            other => debug!(?other, "ui event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_receiver_unsubscribes() {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(UiEvent::Refresh);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(UiEvent::ConnectionHealthy);
        assert_eq!(a.recv().await.ok(), Some(UiEvent::ConnectionHealthy));
        assert_eq!(b.recv().await.ok(), Some(UiEvent::ConnectionHealthy));
    }
}
