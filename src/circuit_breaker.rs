// ===============================
// src/circuit_breaker.rs
// ===============================
//
// Generic CLOSED / OPEN / HALF_OPEN breaker around any fallible call.
// - All state reads/writes go through one mutex; the wrapped call runs outside it.
// - Health transitions are broadcast after the lock is released.
// - BreakerRegistry enumerates breakers by name for diagnostics.
//
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::BREAKER_STATE;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn gauge(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerHealth {
    Healthy,
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Milliseconds until an OPEN breaker admits its probe.
    pub retry_eta_ms: Option<u64>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_trips: u64,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    total_failures: u64,
    total_successes: u64,
    total_trips: u64,
}

pub struct CircuitBreaker {
    name: String,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
    health_tx: broadcast::Sender<BreakerHealth>,
}

enum Outcome {
    Success,
    Failure(String),
    Ignored,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: BreakerConfig) -> Self {
        let (health_tx, _) = broadcast::channel(64);
        let name = name.into();
        BREAKER_STATE.with_label_values(&[&name]).set(BreakerState::Closed.gauge());
        Self {
            name,
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                total_failures: 0,
                total_successes: 0,
                total_trips: 0,
            }),
            health_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerHealth> {
        self.health_tx.subscribe()
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Every `Err` counts as a failure.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, BreakerError<E>> {
        self.call_filtered(f, |_| true)
    }

    /// Only errors for which `is_failure` returns true are counted.
    pub fn call_filtered<T, E>(
        &self,
        f: impl FnOnce() -> Result<T, E>,
        is_failure: impl Fn(&E) -> bool,
    ) -> Result<T, BreakerError<E>> {
        self.admit()?;
        let res = f();
        self.settle(&res, is_failure);
        res.map_err(BreakerError::Inner)
    }

    /// A half-open probe whose future is dropped before completing counts as a
    /// failed probe, so the breaker reopens instead of staying half-open.
    pub async fn call_async<T, E, Fut>(&self, fut: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = self.admit()?;
        let mut guard = ProbeGuard { breaker: self, armed: probe };
        let res = fut.await;
        guard.armed = false;
        self.settle(&res, |_| true);
        res.map_err(BreakerError::Inner)
    }

    /// Ok(true) when the admitted call is the single half-open probe.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let now = Instant::now();
        let mut g = self.inner.lock();
        let state = g.state;
        match state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let opened_at = g.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cfg.recovery_timeout {
                    g.state = BreakerState::HalfOpen;
                    g.opened_at = None;
                    g.probe_in_flight = true;
                    drop(g);
                    BREAKER_STATE.with_label_values(&[&self.name]).set(BreakerState::HalfOpen.gauge());
                    info!(breaker = %self.name, "half-open, admitting probe");
                    Ok(true)
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                        retry_in: self.cfg.recovery_timeout - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if g.probe_in_flight {
                    Err(BreakerError::Open { name: self.name.clone(), retry_in: Duration::ZERO })
                } else {
                    g.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn settle<T, E>(&self, res: &Result<T, E>, is_failure: impl Fn(&E) -> bool) {
        let outcome = match res {
            Ok(_) => Outcome::Success,
            Err(e) if is_failure(e) => Outcome::Failure("call failed".to_string()),
            Err(_) => Outcome::Ignored,
        };
        self.record(outcome);
    }

    pub fn record_success(&self) {
        self.record(Outcome::Success);
    }

    pub fn record_failure(&self, reason: &str) {
        self.record(Outcome::Failure(reason.to_string()));
    }

    fn record(&self, outcome: Outcome) {
        let mut notice = None;
        let new_state;
        {
            let mut g = self.inner.lock();
            let was_half_open = g.state == BreakerState::HalfOpen;
            g.probe_in_flight = false;
            match outcome {
                Outcome::Success => {
                    g.total_successes += 1;
                    g.consecutive_failures = 0;
                    if g.state != BreakerState::Closed {
                        g.state = BreakerState::Closed;
                        g.opened_at = None;
                        notice = Some(BreakerHealth::Healthy);
                    }
                }
                Outcome::Failure(reason) => {
                    g.total_failures += 1;
                    g.consecutive_failures = g.consecutive_failures.saturating_add(1);
                    let trip = was_half_open
                        || (g.state == BreakerState::Closed
                            && g.consecutive_failures >= self.cfg.failure_threshold);
                    if trip {
                        g.state = BreakerState::Open;
                        g.opened_at = Some(Instant::now());
                        g.total_trips += 1;
                        let why = if was_half_open {
                            format!("probe failed: {reason}")
                        } else {
                            format!("{} consecutive failures: {reason}", g.consecutive_failures)
                        };
                        notice = Some(BreakerHealth::Degraded(why));
                    }
                }
                Outcome::Ignored => {}
            }
            new_state = g.state;
        }
        BREAKER_STATE.with_label_values(&[&self.name]).set(new_state.gauge());
        if let Some(n) = notice {
            match &n {
                BreakerHealth::Healthy => info!(breaker = %self.name, "closed (healthy)"),
                BreakerHealth::Degraded(r) => warn!(breaker = %self.name, reason = %r, "opened"),
            }
            let _ = self.health_tx.send(n);
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let g = self.inner.lock();
        let retry_eta_ms = g.opened_at.map(|at| {
            self.cfg
                .recovery_timeout
                .saturating_sub(now.saturating_duration_since(at))
                .as_millis() as u64
        });
        BreakerStats {
            name: self.name.clone(),
            state: g.state,
            consecutive_failures: g.consecutive_failures,
            failure_threshold: self.cfg.failure_threshold,
            retry_eta_ms,
            total_failures: g.total_failures,
            total_successes: g.total_successes,
            total_trips: g.total_trips,
        }
    }

    pub fn reset(&self) {
        let was_closed;
        {
            let mut g = self.inner.lock();
            was_closed = g.state == BreakerState::Closed;
            g.state = BreakerState::Closed;
            g.consecutive_failures = 0;
            g.opened_at = None;
            g.probe_in_flight = false;
        }
        BREAKER_STATE.with_label_values(&[&self.name]).set(BreakerState::Closed.gauge());
        if !was_closed {
            let _ = self.health_tx.send(BreakerHealth::Healthy);
        }
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.record(Outcome::Failure("probe abandoned".to_string()));
        }
    }
}

/// Name -> breaker map, constructed once at startup and passed by reference.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, cfg: BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, cfg)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    pub fn get_stats(&self) -> Vec<BreakerStats> {
        let all: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut stats: Vec<BreakerStats> = all.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn reset_all(&self) {
        let all: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        for b in all {
            b.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| Err::<(), _>("boom"))
    }

    #[test]
    fn exactly_threshold_failures_open() {
        for n in 1..=6u32 {
            let b = breaker(n, 60_000);
            for _ in 0..n - 1 {
                let _ = fail(&b);
                assert_eq!(b.state(), BreakerState::Closed);
            }
            let _ = fail(&b);
            assert_eq!(b.state(), BreakerState::Open, "threshold {n}");
            assert!(b.stats().retry_eta_ms.is_some());
        }
    }

    #[test]
    fn success_resets_counter() {
        let b = breaker(3, 60_000);
        let _ = fail(&b);
        let _ = fail(&b);
        assert_eq!(b.call(|| Ok::<_, &str>(7)).ok(), Some(7));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.stats().consecutive_failures, 0);
        let _ = fail(&b);
        let _ = fail(&b);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn open_rejects_without_invoking() {
        let b = breaker(1, 60_000);
        let _ = fail(&b);
        let calls = Cell::new(0);
        for _ in 0..10 {
            let r = b.call(|| {
                calls.set(calls.get() + 1);
                Ok::<_, &str>(())
            });
            assert!(r.unwrap_err().is_open());
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn probe_after_recovery_timeout() {
        let b = breaker(1, 30);
        let _ = fail(&b);
        for _ in 0..5 {
            assert!(b.call(|| Ok::<_, &str>(())).is_err());
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.call(|| Ok::<_, &str>(())).is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.stats().retry_eta_ms.is_none());
    }

    #[test]
    fn failed_probe_reopens() {
        let b = breaker(1, 30);
        let _ = fail(&b);
        std::thread::sleep(Duration::from_millis(40));
        let _ = fail(&b);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.stats().total_trips, 2);
        assert!(fail(&b).unwrap_err().is_open());
    }

    #[tokio::test]
    async fn abandoned_probe_reopens_then_recovers() {
        let b = breaker(1, 30);
        let _ = fail(&b);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let stalled = b.call_async(std::future::pending::<Result<(), &str>>());
        assert!(tokio::time::timeout(Duration::from_millis(5), stalled).await.is_err());
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.stats().total_trips, 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(b.call_async(async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn dropped_closed_call_is_not_a_failure() {
        let b = breaker(1, 60_000);
        let stalled = b.call_async(std::future::pending::<Result<(), &str>>());
        assert!(tokio::time::timeout(Duration::from_millis(5), stalled).await.is_err());
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.stats().total_failures, 0);
    }

    #[test]
    fn filtered_errors_do_not_count() {
        let b = breaker(1, 60_000);
        let r = b.call_filtered(|| Err::<(), _>("benign"), |e| *e != "benign");
        assert!(matches!(r, Err(BreakerError::Inner("benign"))));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn health_notifications_follow_transitions() {
        let b = breaker(1, 0);
        let mut rx = b.subscribe();
        let _ = fail(&b);
        assert!(matches!(rx.try_recv(), Ok(BreakerHealth::Degraded(_))));
        assert!(b.call(|| Ok::<_, &str>(())).is_ok());
        assert_eq!(rx.try_recv().ok(), Some(BreakerHealth::Healthy));
    }

    #[test]
    fn registry_stats_and_reset() {
        let reg = BreakerRegistry::new();
        let a = reg.get_or_create("dtc", BreakerConfig { failure_threshold: 1, ..Default::default() });
        let same = reg.get_or_create("dtc", BreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &same));
        reg.get_or_create("db", BreakerConfig::default());
        let _ = a.call(|| Err::<(), _>("x"));
        let stats = reg.get_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].name, "dtc");
        assert_eq!(stats[1].state, BreakerState::Open);
        reg.reset_all();
        assert_eq!(a.state(), BreakerState::Closed);
    }
}
