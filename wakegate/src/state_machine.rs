//! Service State Machine (spec §4.5): the pull-up logic shared by the HTTP
//! and WebSocket paths.

use std::time::Duration;

use wakegate_common::error::{Error, Result};

use crate::context::GatewayContext;
use crate::descriptor::ServiceDescriptor;
use crate::health;
use crate::state::ServiceStatus;

/// Hard cap on waiting for a `stopping -> offline` transition, independent
/// of any configured timeout (spec §9 Open Question 2 — preserved as-is,
/// flagged as a candidate for configurability).
const STOPPING_WAIT_CAP: Duration = Duration::from_secs(30);

/// Ensure `service` is `online`, driving offline -> starting -> online when
/// necessary, joining an in-flight start when the service is already
/// `starting`, and waiting out a `stopping` handoff before retrying.
/// `proxy_only` services are always online and never reach this function's
/// blocking paths.
pub async fn ensure_online(ctx: &GatewayContext, service: &ServiceDescriptor) -> Result<()> {
    if service.proxy_only {
        return Ok(());
    }

    loop {
        match service.state.status() {
            ServiceStatus::Online => return Ok(()),

            ServiceStatus::Offline => {
                if !service.state.begin_starting() {
                    // Lost a race with another offline->starting caller;
                    // go around and join them instead.
                    continue;
                }
                return drive_start(ctx, service).await;
            }

            ServiceStatus::Starting => {
                // Join the in-flight start+health sequence by waiting
                // directly on `ServiceState`'s notify, not by calling
                // `ctx.manager.start` again: the manager's single-flight
                // entry is removed as soon as the start *command* exits
                // (manager.rs), well before the health check that follows
                // also finishes (`drive_start` below). Re-calling it here
                // would make this caller a second leader and re-run
                // `commands.start` once the command-only single-flight
                // window has closed but the service is still `starting`
                // (spec §3: "a service in starting has exactly one
                // in-flight start operation"). The leader records the
                // terminal status once the whole start+health sequence
                // finishes, so waiting on that covers exactly this window.
                let status = service.state.wait_while_starting().await;
                return finish_from_starting(service, status);
            }

            ServiceStatus::Stopping => {
                if !service.state.wait_for_offline(STOPPING_WAIT_CAP).await {
                    return Err(Error::StopTimeout(service.name.clone()));
                }
                // Proceed as from offline.
            }
        }
    }
}

fn finish_from_starting(service: &ServiceDescriptor, status: ServiceStatus) -> Result<()> {
    match status {
        ServiceStatus::Online => Ok(()),
        _ => Err(service
            .state
            .last_start_error()
            .map(|detail| Error::StartFailed {
                service: service.name.clone(),
                detail,
            })
            .unwrap_or_else(|| Error::HealthTimeout(service.name.clone()))),
    }
}

/// Run `commands.start` + health wait for a service already moved to
/// `starting` by the caller, recording the outcome on `service.state`. Used
/// both by the request pull-up path above and by the admin plane's explicit
/// `POST .../start` (spec §6), which manages its own `begin_starting` call.
pub(crate) async fn drive_start(ctx: &GatewayContext, service: &ServiceDescriptor) -> Result<()> {
    if let Err(e) = ctx.manager.start(service).await {
        let detail = match &e {
            Error::StartFailed { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        service.state.mark_start_failed(detail);
        return Err(e);
    }

    match health::wait_healthy(service).await {
        Ok(()) => {
            service.state.mark_online();
            Ok(())
        }
        Err(e) => {
            service
                .state
                .mark_start_failed("startup timeout waiting for health check".to_string());
            Err(e)
        }
    }
}
