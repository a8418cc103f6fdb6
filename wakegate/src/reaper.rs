//! Idle Reaper (spec §4.8): periodic sweep that stops services with no
//! active connections and a stale last-access time.

use std::time::{Duration, Instant};

use crate::context::SharedContext;
use crate::state::ServiceStatus;

const TICK_INTERVAL: Duration = Duration::from_secs(3);

/// Runs forever (intended to be `tokio::spawn`ed). Every tick, every
/// eligible service is swept concurrently — one stuck `stop` command does
/// not hold up another service's reap.
pub async fn run(ctx: SharedContext) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let services = ctx.routing.all_services();
        let sweeps = services.into_iter().filter(|s| !s.proxy_only).map(|service| {
            let ctx = ctx.clone();
            async move { sweep_one(&ctx, &service, now).await }
        });
        futures_util::future::join_all(sweeps).await;
    }
}

async fn sweep_one(ctx: &SharedContext, service: &crate::descriptor::ServiceDescriptor, now: Instant) {
    if service.state.status() != ServiceStatus::Online {
        return;
    }
    if service.state.active_connections() != 0 {
        return;
    }
    if !service.is_stale(now) {
        return;
    }
    if !service.state.begin_stopping() {
        return; // lost a race (e.g. a request just pulled it back up)
    }

    tracing::info!(service = %service.name, "idle timeout elapsed, stopping");
    ctx.manager.stop(service).await;
    service.state.mark_offline();
}
