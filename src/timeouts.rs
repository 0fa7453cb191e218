// ===============================
// src/timeouts.rs
// ===============================
//
// Outstanding DTC requests with per-type timeouts.
// - register on send, mark_completed on matching response
// - check() reports overdue requests once and moves them to a bounded history
// - reset() on disconnect: nothing in flight can complete on a dead socket
//
use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dtc::RequestKind;
use crate::metrics::REQUEST_TIMEOUTS;

const HISTORY_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub request_id: u32,
    pub request_type: RequestKind,
    pub sent_at: Instant,
    pub timeout: Duration,
}

impl PendingRequest {
    fn is_overdue(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) > self.timeout
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    pending: HashMap<u32, PendingRequest>,
    history: VecDeque<PendingRequest>,
}

#[derive(Debug)]
pub struct RequestTimeoutTracker {
    default_timeout: Duration,
    inner: Mutex<TrackerInner>,
}

impl RequestTimeoutTracker {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout, inner: Mutex::new(TrackerInner::default()) }
    }

    /// Historical fills can span days of data; everything else uses the default.
    pub fn default_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::HistoricalFills => self.default_timeout * 3,
            _ => self.default_timeout,
        }
    }

    /// Returns true if an entry with the same id was replaced.
    pub fn register(&self, request_id: u32, kind: RequestKind, timeout: Option<Duration>) -> bool {
        let req = PendingRequest {
            request_id,
            request_type: kind,
            sent_at: Instant::now(),
            timeout: timeout.unwrap_or_else(|| self.default_for(kind)),
        };
        let replaced = self.inner.lock().pending.insert(request_id, req).is_some();
        if replaced {
            debug!(request_id, kind = kind.as_str(), "request re-registered");
        }
        replaced
    }

    pub fn mark_completed(&self, request_id: u32) -> Option<PendingRequest> {
        self.inner.lock().pending.remove(&request_id)
    }

    pub fn check(&self) -> Vec<PendingRequest> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Vec<PendingRequest> {
        let mut overdue = Vec::new();
        {
            let mut g = self.inner.lock();
            let ids: Vec<u32> = g
                .pending
                .values()
                .filter(|r| r.is_overdue(now))
                .map(|r| r.request_id)
                .collect();
            for id in ids {
                if let Some(req) = g.pending.remove(&id) {
                    if g.history.len() == HISTORY_CAP {
                        g.history.pop_front();
                    }
                    g.history.push_back(req.clone());
                    overdue.push(req);
                }
            }
        }
        overdue.sort_by_key(|r| r.request_id);
        for r in &overdue {
            REQUEST_TIMEOUTS.with_label_values(&[r.request_type.as_str()]).inc();
            warn!(request_id = r.request_id, kind = r.request_type.as_str(), timeout = ?r.timeout, "request timed out");
        }
        overdue
    }

    pub fn reset(&self) {
        let mut g = self.inner.lock();
        if !g.pending.is_empty() {
            debug!(dropped = g.pending.len(), "pending requests cleared");
        }
        g.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_pending(&self, request_id: u32) -> bool {
        self.inner.lock().pending.contains_key(&request_id)
    }

    pub fn history(&self) -> Vec<PendingRequest> {
        self.inner.lock().history.iter().cloned().collect()
    }
}
