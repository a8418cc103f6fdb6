//! WebSocket bridging (spec §4.7): accept the client upgrade immediately,
//! defer the upstream connection to the open phase, then bridge frames in
//! both directions with natural backpressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Request;
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as TtMessage;

use crate::context::SharedContext;
use crate::descriptor::ActiveGuard;
use crate::routing::RouteTarget;
use crate::state_machine;

/// Everything the upgrade handler needs to remember for the open phase,
/// captured before the request is consumed.
struct PendingUpgrade {
    target: url::Url,
    path_and_query: String,
    headers: HeaderMap,
}

pub async fn handle(
    ctx: SharedContext,
    route: RouteTarget,
    ws: WebSocketUpgrade,
    req: Request,
) -> Response {
    route.service.state.touch();

    let pending = PendingUpgrade {
        target: route.target.clone(),
        path_and_query: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: req.headers().clone(),
    };

    ws.on_upgrade(move |socket| async move {
        open_phase(ctx, route, pending, socket).await;
    })
}

async fn open_phase(ctx: SharedContext, route: RouteTarget, pending: PendingUpgrade, client: WebSocket) {
    let ws_log = ctx.config.logging.enable_web_socket_log;
    let started = std::time::Instant::now();

    if let Err(e) = state_machine::ensure_online(&ctx, &route.service).await {
        tracing::debug!(service = %route.service.name, error = %e, "websocket open phase: service failed to come online");
        return;
    }

    let _guard = ActiveGuard::new(route.service.clone());

    let upstream_url = match build_upstream_ws_url(&pending.target, &pending.path_and_query) {
        Ok(url) => url,
        Err(_) => return,
    };

    let mut request = match tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(upstream_url.as_str()) {
        Ok(req) => req,
        Err(_) => return,
    };
    copy_ws_headers(&pending.headers, request.headers_mut());

    let upstream = match tokio_tungstenite::connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            tracing::debug!(service = %route.service.name, error = %e, "failed to connect to upstream websocket");
            return;
        }
    };

    if ws_log {
        tracing::info!(service = %route.service.name, path = %pending.path_and_query, "websocket open");
    }

    bridge(client, upstream).await;

    if ws_log {
        tracing::info!(
            service = %route.service.name,
            duration_ms = started.elapsed().as_millis() as u64,
            "websocket closed"
        );
    }
}

fn build_upstream_ws_url(target: &url::Url, path_and_query: &str) -> Result<String, ()> {
    let scheme = match target.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let host = target.host_str().ok_or(())?;
    let authority = match target.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    };
    Ok(format!("{scheme}://{authority}{path_and_query}"))
}

/// Forward all client headers except the ones the WebSocket client library
/// regenerates (spec §4.7 open phase).
fn copy_ws_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "host" | "connection" | "upgrade" | "sec-websocket-key" | "sec-websocket-version"
        ) {
            continue;
        }
        if let Some(clean) = super::sanitize_header_value(value) {
            dst.append(name.clone(), clean);
        }
    }
}

fn to_tungstenite(msg: AxMessage) -> Option<TtMessage> {
    Some(match msg {
        AxMessage::Text(t) => TtMessage::Text(t),
        AxMessage::Binary(b) => TtMessage::Binary(b),
        AxMessage::Ping(p) => TtMessage::Ping(p),
        AxMessage::Pong(p) => TtMessage::Pong(p),
        AxMessage::Close(_) => return None,
    })
}

fn to_axum(msg: TtMessage) -> Option<AxMessage> {
    Some(match msg {
        TtMessage::Text(t) => AxMessage::Text(t),
        TtMessage::Binary(b) => AxMessage::Binary(b),
        TtMessage::Ping(p) => AxMessage::Ping(p),
        TtMessage::Pong(p) => AxMessage::Pong(p),
        TtMessage::Close(_) | TtMessage::Frame(_) => return None,
    })
}

/// Bidirectional bridge. Client frames are funneled through an unbounded
/// queue drained by a forwarder task — the same mechanism handles both
/// "queue while the upstream is still connecting" and steady-state
/// forwarding, satisfying spec §4.7's FIFO-buffering requirement without a
/// separate two-phase flag. Either side closing (or erroring, treated as
/// close) closes the other exactly once, guarded by `closing`.
async fn bridge(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let closing = Arc::new(AtomicBool::new(false));
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<TtMessage>();

    let reader_closing = closing.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = client_rx.next().await {
            match frame {
                Ok(msg) => {
                    if matches!(msg, AxMessage::Close(_)) {
                        break;
                    }
                    if let Some(converted) = to_tungstenite(msg) {
                        if queue_tx.send(converted).is_err() {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        reader_closing.store(true, Ordering::SeqCst);
    });

    let forwarder_closing = closing.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(msg) = queue_rx.recv().await {
            if upstream_tx.send(msg).await.is_err() {
                break;
            }
            if forwarder_closing.load(Ordering::SeqCst) {
                // Drain whatever's already queued, then stop.
                while let Ok(msg) = queue_rx.try_recv() {
                    if upstream_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
        let _ = upstream_tx.close().await;
    });

    let upstream_closing = closing.clone();
    let upstream_to_client = tokio::spawn(async move {
        while let Some(frame) = upstream_rx.next().await {
            match frame {
                Ok(msg) => {
                    if let Some(converted) = to_axum(msg) {
                        if client_tx.send(converted).await.is_err() {
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        upstream_closing.store(true, Ordering::SeqCst);
        let _ = client_tx.close().await;
    });

    let _ = reader.await;
    let _ = forwarder.await;
    let _ = upstream_to_client.await;
}
