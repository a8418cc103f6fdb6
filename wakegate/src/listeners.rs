//! Listener Set (spec §4.9): the main hostname-routed listener, one
//! dedicated listener per port-bound route, and the optional admin listener.
//! Each installs the same HTTP/WebSocket dispatch over the shared routing
//! table and service state machine; no coordination beyond that shared state.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;

use wakegate_common::error::Error;

use crate::context::SharedContext;
use crate::proxy;
use crate::routing::RouteTarget;

/// Bind and serve every listener named by the routing table plus the admin
/// listener if enabled. Runs until the first listener fails or the process
/// is asked to shut down (the caller races this against a signal future).
pub async fn run(ctx: SharedContext) -> anyhow::Result<()> {
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(serve_main(ctx.clone()));

    let port_routes: Vec<(u16, RouteTarget)> = ctx
        .routing
        .port_routes()
        .map(|(port, route)| (*port, route.clone()))
        .collect();
    for (port, route) in port_routes {
        tasks.spawn(serve_port(ctx.clone(), port, route));
    }

    if ctx.config.admin_api.enabled {
        tasks.spawn(serve_admin(ctx.clone()));
    }

    while let Some(result) = tasks.join_next().await {
        result??;
    }
    Ok(())
}

/// The hostname-routed router, exposed so integration tests can drive it
/// directly with `tower::ServiceExt::oneshot` instead of binding a real
/// socket (spec §4.13 / the teacher's `zero-gateway::build_router` pattern).
pub fn main_router(ctx: SharedContext) -> Router {
    Router::new().fallback(main_handler).with_state(ctx)
}

async fn serve_main(ctx: SharedContext) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.host, ctx.config.port).parse()?;
    let app = main_router(ctx);

    tracing::info!(%addr, "main listener bound");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn serve_port(ctx: SharedContext, port: u16, route: RouteTarget) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.host, port).parse()?;
    let app = Router::new().fallback(move |req: Request| {
        let ctx = ctx.clone();
        let route = route.clone();
        async move { dispatch(ctx, route, req).await }
    });

    tracing::info!(%addr, "port listener bound");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn serve_admin(ctx: SharedContext) -> anyhow::Result<()> {
    let admin = &ctx.config.admin_api;
    let host = admin.host.clone().unwrap_or_else(|| ctx.config.host.clone());
    let addr: SocketAddr = format!("{}:{}", host, admin.port).parse()?;
    let app = crate::admin::build_router(ctx.clone());

    tracing::info!(%addr, "admin listener bound");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Main-listener entrypoint: resolve by `Host` header (spec §4.4 "For
/// traffic arriving on the main listener, the Host header ... selects a
/// hostnameRoute").
async fn main_handler(State(ctx): State<SharedContext>, req: Request) -> Response {
    let Some(host) = proxy::extract_host(req.headers()) else {
        return Error::RouteNotFound("missing Host header".to_string()).into_response();
    };
    let Some(route) = ctx.routing.resolve_host(&host) else {
        return Error::RouteNotFound(host).into_response();
    };
    dispatch(ctx, route, req).await
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    let has_upgrade_token = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")));
    let wants_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    has_upgrade_token && wants_websocket
}

/// Shared by both the main and port listeners: decide HTTP vs. WebSocket and
/// call into the Proxy Engine (spec §4.6/§4.7).
async fn dispatch(ctx: SharedContext, route: RouteTarget, req: Request) -> Response {
    if is_websocket_upgrade(req.headers()) {
        let (mut parts, body) = req.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &ctx).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return rejection.into_response(),
        };
        let req = Request::from_parts(parts, body);
        proxy::ws::handle(ctx, route, upgrade, req).await
    } else {
        proxy::http::handle(ctx, route, req).await
    }
}

/// Re-exported so the admin plane's IP allowlist can read the peer address
/// attached by `into_make_service_with_connect_info`.
pub type PeerAddr = ConnectInfo<SocketAddr>;
