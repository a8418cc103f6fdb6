//! Admin plane (spec §6 "Admin plane (optional)"): a small REST surface
//! exposing service state, mounted on its own listener. Intentionally
//! minimal and NOT part of the core request path.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::{self, Stream};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use wakegate_common::config::AdminApiConfig;
use wakegate_common::error::{Error, Result};

use crate::context::SharedContext;
use crate::state::ServiceStatus;

#[derive(Clone)]
struct AdminState {
    ctx: SharedContext,
}

/// Build the admin router, wired up with the IP allowlist and bearer-token
/// middleware from `adminApi` config (spec §6 "Admin access control").
pub fn build_router(ctx: SharedContext) -> Router {
    let state = AdminState { ctx: ctx.clone() };

    // Permissive CORS so a browser-hosted admin UI (spec §1's "static UI",
    // out of scope here) can call this API cross-origin, following the
    // teacher's `zero-gateway::build_router` CORS convention.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/_dynapm/api/services", get(list_services))
        .route("/_dynapm/api/services/:name", get(get_service))
        .route("/_dynapm/api/services/:name/stop", post(stop_service))
        .route("/_dynapm/api/services/:name/start", post(start_service))
        .route("/_dynapm/api/events", get(events))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(cors)
        .with_state(state)
}

/// Single gate covering both the IP allowlist and the bearer token, in that
/// order (spec: "403 on IP rejection, 401 on missing/bad token").
async fn auth_gate(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let admin = &state.ctx.config.admin_api;

    if let Some(reason) = check_ip_allowlist(admin, &request) {
        return Error::Forbidden(reason).into_response();
    }
    if let Some(err) = check_bearer_token(admin, &request) {
        return err.into_response();
    }

    next.run(request).await
}

fn check_ip_allowlist(admin: &AdminApiConfig, request: &Request) -> Option<String> {
    if admin.allowed_ips.is_empty() {
        return None;
    }
    let peer_ip = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip());

    match peer_ip {
        Some(ip) if admin.allowed_ips.iter().any(|rule| cidr_contains(rule, ip)) => None,
        Some(ip) => Some(format!("{ip} is not in the admin allowlist")),
        // No ConnectInfo available (e.g. unit tests driving the router
        // directly with `tower::ServiceExt::oneshot`): fail closed only when
        // an allowlist was actually configured and we truly cannot check it.
        None => Some("client address unavailable for allowlist check".to_string()),
    }
}

/// Hand-rolled CIDR/exact-IP matcher: no third-party CIDR crate appears
/// anywhere in the retrieval pack, so this is plain prefix comparison over
/// `IpAddr` octets/segments.
fn cidr_contains(rule: &str, ip: IpAddr) -> bool {
    let (network_str, prefix_len) = match rule.split_once('/') {
        Some((net, len)) => (net, len.parse::<u32>().ok()),
        None => (rule, None),
    };
    let Ok(network) = network_str.parse::<IpAddr>() else {
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let bits = prefix_len.unwrap_or(32).min(32);
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let bits = prefix_len.unwrap_or(128).min(128);
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

fn check_bearer_token(admin: &AdminApiConfig, request: &Request) -> Option<Error> {
    let Some(expected) = &admin.auth_token else {
        return None;
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => None,
        _ => Some(Error::Unauthorized),
    }
}

#[derive(Serialize)]
struct ServiceSummary {
    name: String,
    base: String,
    status: &'static str,
    uptime: u64,
    #[serde(rename = "lastAccessTime")]
    last_access_time: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "activeConnections")]
    active_connections: i64,
    #[serde(rename = "idleTimeout")]
    idle_timeout: u64,
    #[serde(rename = "proxyOnly")]
    proxy_only: bool,
    pid: Option<u32>,
}

#[derive(Serialize)]
struct ServiceDetail {
    #[serde(flatten)]
    summary: ServiceSummary,
    #[serde(rename = "startTimeout")]
    start_timeout: u64,
    #[serde(rename = "healthCheck")]
    health_check: String,
    #[serde(rename = "startCount")]
    start_count: u32,
    #[serde(rename = "totalUptime")]
    total_uptime: u64,
}

fn status_label(status: ServiceStatus) -> &'static str {
    match status {
        ServiceStatus::Offline => "offline",
        ServiceStatus::Starting => "starting",
        ServiceStatus::Online => "online",
        ServiceStatus::Stopping => "stopping",
    }
}

/// Convert `ServiceState`'s monotonic `last_access` instant to a wall-clock
/// timestamp for the admin API, by measuring its offset from "now" in both
/// clocks and applying that offset to `SystemTime::now()`.
fn last_access_as_datetime(service: &crate::descriptor::ServiceDescriptor) -> chrono::DateTime<chrono::Utc> {
    let elapsed = std::time::Instant::now().saturating_duration_since(service.state.last_access());
    let wall = std::time::SystemTime::now() - elapsed;
    chrono::DateTime::<chrono::Utc>::from(wall)
}

fn summarize(service: &crate::descriptor::ServiceDescriptor) -> ServiceSummary {
    ServiceSummary {
        name: service.name.clone(),
        base: service.upstream.to_string(),
        status: status_label(service.state.status()),
        uptime: service.state.uptime_now().as_secs(),
        last_access_time: last_access_as_datetime(service),
        active_connections: service.state.active_connections(),
        idle_timeout: service.idle_timeout.as_secs(),
        proxy_only: service.proxy_only,
        // wakegate never holds a PID handle: start commands typically
        // background the real process (`nohup ... &`, `docker run -d`).
        pid: None,
    }
}

#[derive(Serialize)]
struct ServicesResponse {
    services: Vec<ServiceSummary>,
}

async fn list_services(State(state): State<AdminState>) -> axum::Json<ServicesResponse> {
    let services = state
        .ctx
        .routing
        .all_services()
        .iter()
        .map(|s| summarize(s))
        .collect();
    axum::Json(ServicesResponse { services })
}

fn find_service(ctx: &SharedContext, name: &str) -> Result<Arc<crate::descriptor::ServiceDescriptor>> {
    ctx.routing
        .find_service(name)
        .ok_or_else(|| Error::UnknownService(name.to_string()))
}

async fn get_service(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let service = match find_service(&state.ctx, &name) {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    let detail = ServiceDetail {
        summary: summarize(&service),
        start_timeout: service.start_timeout.as_secs(),
        health_check: format!("{:?}", service.health_check),
        start_count: service.state.start_count(),
        total_uptime: service.state.total_uptime().as_secs(),
    };
    axum::Json(detail).into_response()
}

async fn stop_service(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let service = match find_service(&state.ctx, &name) {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    if service.state.status() != ServiceStatus::Online {
        return Error::InvalidTransition(format!(
            "service {name} is not online (admin stop requires online -> stopping)"
        ))
        .into_response();
    }

    if !service.state.begin_stopping() {
        return Error::InvalidTransition(format!("service {name} changed state concurrently")).into_response();
    }
    state.ctx.manager.stop(&service).await;
    service.state.mark_offline();
    StatusCode::OK.into_response()
}

async fn start_service(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    let service = match find_service(&state.ctx, &name) {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    match service.state.status() {
        ServiceStatus::Online | ServiceStatus::Starting => {
            return Error::InvalidTransition(format!("service {name} is already online or starting")).into_response();
        }
        ServiceStatus::Stopping => {
            if !service.state.wait_for_offline(std::time::Duration::from_secs(30)).await {
                return Error::StopTimeout(name).into_response();
            }
        }
        ServiceStatus::Offline => {}
    }

    if !service.state.begin_starting() {
        return Error::InvalidTransition(format!("service {name} is already starting")).into_response();
    }

    match crate::state_machine::drive_start(&state.ctx, &service).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Reserved for server-sent state-change events; the initial implementation
/// emits only a `connected` event (spec §6).
async fn events(
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let stream = stream::once(async { Ok(Event::default().event("connected").data("{}")) });
    Sse::new(stream)
}
