// ===============================
// src/risk.rs
// ===============================
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{EventBus, UiEvent};
use crate::domain::Mode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RiskError {
    #[error("live trading can only be armed in LIVE mode (active: {0})")]
    NotLive(Mode),
    #[error("live order submission is disarmed")]
    Disarmed,
}

/// The "live order submission armed" flag. Fails closed: starts disarmed
/// and any mode drift disarms it.
pub struct TradingGuard {
    armed: AtomicBool,
    disarm_count: AtomicU64,
    last_reason: Mutex<Option<String>>,
    bus: EventBus,
}

impl TradingGuard {
    pub fn new(bus: EventBus) -> Self {
        Self {
            armed: AtomicBool::new(false),
            disarm_count: AtomicU64::new(0),
            last_reason: Mutex::new(None),
            bus,
        }
    }

    pub fn arm(&self, active: Mode) -> Result<(), RiskError> {
        if active != Mode::Live {
            warn!(mode = %active, "refusing to arm outside LIVE");
            return Err(RiskError::NotLive(active));
        }
        if !self.armed.swap(true, Ordering::SeqCst) {
            info!("live order submission armed");
        }
        Ok(())
    }

    /// Returns true if the guard was armed.
    pub fn disarm(&self, reason: &str) -> bool {
        let was_armed = self.armed.swap(false, Ordering::SeqCst);
        self.disarm_count.fetch_add(1, Ordering::Relaxed);
        *self.last_reason.lock() = Some(reason.to_string());
        if was_armed {
            warn!(%reason, "live order submission disarmed");
            self.bus.publish(UiEvent::TradingDisarmed { reason: reason.to_string() });
        }
        was_armed
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Gate for any live order path.
    pub fn check_submission(&self) -> Result<(), RiskError> {
        if self.is_armed() { Ok(()) } else { Err(RiskError::Disarmed) }
    }

    pub fn disarm_count(&self) -> u64 {
        self.disarm_count.load(Ordering::Relaxed)
    }

    pub fn last_disarm_reason(&self) -> Option<String> {
        self.last_reason.lock().clone()
    }
}
