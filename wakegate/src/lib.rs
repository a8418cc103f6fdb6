//! wakegate - lazy-start HTTP/WebSocket reverse-proxy gateway.
//!
//! Fronts a set of configured services that are normally offline. The first
//! request to an offline service triggers its start command, waits for its
//! health check to pass, then streams the request through; an idle reaper
//! stops services again once traffic dries up. See `wakegate-common` for the
//! config/error/logging layer this crate builds on.

pub mod admin;
pub mod context;
pub mod descriptor;
pub mod executor;
pub mod health;
pub mod listeners;
pub mod manager;
pub mod proxy;
pub mod reaper;
pub mod routing;
pub mod state;
pub mod state_machine;

use std::sync::Arc;

use wakegate_common::config::Config;
use wakegate_common::error::Result;

use crate::context::GatewayContext;
use crate::manager::ServiceManager;

/// Build the shared gateway context from a validated config: the routing
/// table, the service manager, and a pooled upstream HTTP client.
///
/// TLS verification is disabled on the upstream client since the typical
/// deployment target is a loopback backend the operator already trusts
/// (spec §4.6 rule 3); this is a fixed choice rather than a config toggle.
pub fn build_context(config: Config) -> Result<Arc<GatewayContext>> {
    let (routing, _descriptors) = routing::build(&config)?;
    let http_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(32)
        .build()
        .map_err(|e| wakegate_common::error::Error::Config(format!("failed to build upstream client: {e}")))?;

    Ok(Arc::new(GatewayContext {
        config,
        routing,
        manager: Arc::new(ServiceManager::new()),
        http_client,
    }))
}

/// Stop every non-`proxyOnly` service that is `online` or `starting`,
/// concurrently and best-effort (spec §3 "Lifecycle", graceful shutdown).
pub async fn shutdown_all(ctx: &GatewayContext) {
    use crate::state::ServiceStatus;

    let services = ctx.routing.all_services();
    let stops = services.into_iter().filter_map(|service| {
        if service.proxy_only {
            return None;
        }
        match service.state.status() {
            ServiceStatus::Online | ServiceStatus::Starting => Some(service),
            _ => None,
        }
    });

    let ctx_manager = ctx.manager.clone();
    let tasks = stops.map(|service| {
        let manager = ctx_manager.clone();
        async move {
            tracing::info!(service = %service.name, "stopping on shutdown");
            service.state.begin_stopping(); // no-op (false) if it was only `starting`
            manager.stop(&service).await;
            service.state.mark_offline();
        }
    });
    futures_util::future::join_all(tasks).await;
}
