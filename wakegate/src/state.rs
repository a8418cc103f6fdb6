//! Per-service mutable runtime state (spec §3 `ServiceState`).
//!
//! Per the design notes, composite transitions (status plus the fields that
//! change alongside it) are guarded by a small `Mutex`-wrapped struct, while
//! the two fields touched on every single request — `activeConnections` and
//! `lastAccessTime` — are plain atomics so the hot path never blocks on a
//! lock held by the idle reaper or a concurrent start.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Reference instant all `last_access`/`total_uptime` atomics are offset
/// from, since `Instant` itself has no atomic representation.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Offline,
    Starting,
    Online,
    Stopping,
}

struct Inner {
    status: ServiceStatus,
    start_time: Option<Instant>,
    /// Set when a start attempt fails, so followers who were waiting on
    /// `Starting` can surface the same failure instead of guessing.
    last_start_error: Option<String>,
}

pub struct ServiceState {
    inner: Mutex<Inner>,
    /// Woken on every status transition so waiters parked on `Starting` or
    /// `Stopping` can re-check without polling tightly.
    notify: Notify,
    active_connections: AtomicI64,
    last_access_nanos: AtomicU64,
    start_count: AtomicU32,
    total_uptime_nanos: AtomicU64,
}

impl ServiceState {
    pub fn new(proxy_only: bool) -> Self {
        let status = if proxy_only {
            ServiceStatus::Online
        } else {
            ServiceStatus::Offline
        };
        Self {
            inner: Mutex::new(Inner {
                status,
                start_time: if proxy_only { Some(Instant::now()) } else { None },
                last_start_error: None,
            }),
            notify: Notify::new(),
            active_connections: AtomicI64::new(0),
            last_access_nanos: AtomicU64::new(now_nanos()),
            start_count: AtomicU32::new(if proxy_only { 1 } else { 0 }),
            total_uptime_nanos: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.lock().unwrap().status
    }

    /// Record that a request/frame arrived "before any blocking work" (§4.5).
    pub fn touch(&self) {
        self.last_access_nanos.store(now_nanos(), Ordering::Relaxed);
    }

    pub fn last_access(&self) -> Instant {
        epoch() + Duration::from_nanos(self.last_access_nanos.load(Ordering::Relaxed))
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_active(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "active_connections underflow");
    }

    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::Relaxed)
    }

    pub fn total_uptime(&self) -> Duration {
        Duration::from_nanos(self.total_uptime_nanos.load(Ordering::Relaxed))
    }

    pub fn uptime_now(&self) -> Duration {
        let base = self.total_uptime();
        let inner = self.inner.lock().unwrap();
        match inner.start_time {
            Some(t) if inner.status == ServiceStatus::Online => base + t.elapsed(),
            _ => base,
        }
    }

    /// `offline -> starting`. The only legal path into `starting`.
    pub fn begin_starting(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != ServiceStatus::Offline {
            return false;
        }
        inner.status = ServiceStatus::Starting;
        inner.last_start_error = None;
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    /// `starting -> online`, recording a fresh start interval.
    pub fn mark_online(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = ServiceStatus::Online;
        inner.start_time = Some(Instant::now());
        inner.last_start_error = None;
        drop(inner);
        self.start_count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Failed start/health: back to `offline`, recording the failure for
    /// any followers that were waiting on `starting`.
    pub fn mark_start_failed(&self, detail: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = ServiceStatus::Offline;
        inner.start_time = None;
        inner.last_start_error = Some(detail.into());
        drop(inner);
        self.notify.notify_waiters();
    }

    /// `online -> stopping`, folding the completed interval into
    /// `total_uptime`.
    pub fn begin_stopping(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status != ServiceStatus::Online {
            return false;
        }
        inner.status = ServiceStatus::Stopping;
        if let Some(start) = inner.start_time.take() {
            self.total_uptime_nanos
                .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }
        drop(inner);
        self.notify.notify_waiters();
        true
    }

    /// `stopping -> offline`.
    pub fn mark_offline(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.status = ServiceStatus::Offline;
        inner.start_time = None;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait for `status` to leave `Starting`. Returns the terminal status.
    pub async fn wait_while_starting(&self) -> ServiceStatus {
        loop {
            let notified = self.notify.notified();
            if self.status() != ServiceStatus::Starting {
                return self.status();
            }
            notified.await;
        }
    }

    /// Wait up to `cap` for `status` to become `Offline` from `Stopping`.
    /// Returns `true` if it transitioned in time.
    pub async fn wait_for_offline(&self, cap: Duration) -> bool {
        let deadline = Instant::now() + cap;
        loop {
            if self.status() == ServiceStatus::Offline {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.status() == ServiceStatus::Offline;
            }
            let notified = self.notify.notified();
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    pub fn last_start_error(&self) -> Option<String> {
        self.inner.lock().unwrap().last_start_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_only_services_start_online_and_stay_there() {
        let state = ServiceState::new(true);
        assert_eq!(state.status(), ServiceStatus::Online);
        assert!(!state.begin_stopping());
    }

    #[test]
    fn transitions_follow_the_legal_graph() {
        let state = ServiceState::new(false);
        assert_eq!(state.status(), ServiceStatus::Offline);
        assert!(!state.begin_stopping()); // online -> stopping only
        assert!(state.begin_starting());
        assert!(!state.begin_starting()); // no double-start
        state.mark_online();
        assert_eq!(state.status(), ServiceStatus::Online);
        assert_eq!(state.start_count(), 1);
        assert!(state.begin_stopping());
        state.mark_offline();
        assert_eq!(state.status(), ServiceStatus::Offline);
    }
}
