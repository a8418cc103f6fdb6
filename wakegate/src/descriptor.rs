//! `ServiceDescriptor`: immutable configuration plus the mutable
//! `ServiceState` runtime handle (spec §3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::health::HealthCheck;
use crate::state::ServiceState;

#[derive(Debug, Clone)]
pub struct Commands {
    pub start: String,
    pub stop: String,
    pub check: String,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// One ingress surface for a service: either a hostname or a bound port,
/// each with its own target URL (which may differ from the service's
/// canonical `upstream`).
#[derive(Debug, Clone)]
pub enum Route {
    Host { hostname: String, target: Url },
    Port { port: u16, target: Url },
}

pub struct ServiceDescriptor {
    pub name: String,
    pub upstream: Url,
    pub commands: Commands,
    pub health_check: HealthCheck,
    pub idle_timeout: Duration,
    pub start_timeout: Duration,
    pub proxy_only: bool,
    pub routes: Vec<Route>,
    pub state: ServiceState,
}

impl ServiceDescriptor {
    pub fn is_stale(&self, now: std::time::Instant) -> bool {
        now.saturating_duration_since(self.state.last_access()) > self.idle_timeout
    }
}

/// RAII guard decrementing `activeConnections` exactly once, regardless of
/// which terminal path (success, error, client-abort, task cancellation)
/// drops it. Owns the `Arc<ServiceDescriptor>` rather than borrowing it, so
/// it can be moved into a long-lived value — e.g. embedded alongside a
/// streamed response body — and outlive the stack frame that created it.
pub struct ActiveGuard {
    service: Arc<ServiceDescriptor>,
}

impl ActiveGuard {
    pub fn new(service: Arc<ServiceDescriptor>) -> Self {
        service.state.inc_active();
        Self { service }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.service.state.dec_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheck;

    fn descriptor() -> Arc<ServiceDescriptor> {
        Arc::new(ServiceDescriptor {
            name: "svc".into(),
            upstream: Url::parse("http://127.0.0.1:9").unwrap(),
            commands: Commands {
                start: "true".into(),
                stop: "true".into(),
                check: "true".into(),
                cwd: None,
                env: None,
            },
            health_check: HealthCheck::None,
            idle_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(30),
            proxy_only: false,
            routes: vec![],
            state: ServiceState::new(false),
        })
    }

    #[test]
    fn active_guard_decrements_exactly_once() {
        let service = descriptor();
        assert_eq!(service.state.active_connections(), 0);
        {
            let _g = ActiveGuard::new(service.clone());
            assert_eq!(service.state.active_connections(), 1);
        }
        assert_eq!(service.state.active_connections(), 0);
    }

    #[test]
    fn active_guard_can_outlive_its_creating_scope() {
        let service = descriptor();
        let guard = {
            // Mimics a guard handed off into a longer-lived stream wrapper
            // rather than held as a scope-local binding.
            ActiveGuard::new(service.clone())
        };
        assert_eq!(service.state.active_connections(), 1);
        drop(guard);
        assert_eq!(service.state.active_connections(), 0);
    }
}
