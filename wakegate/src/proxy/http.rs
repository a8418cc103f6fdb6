//! HTTP forwarding (spec §4.6): buffer-then-replay the request body onto the
//! upstream, stream the response back with natural async backpressure.

use std::pin::Pin;
use std::task::{Context as PollContext, Poll};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;

use wakegate_common::error::Error;

use crate::context::SharedContext;
use crate::descriptor::ActiveGuard;
use crate::routing::RouteTarget;
use crate::state_machine;

/// Bounded in-memory cap for request-body buffering (spec §4.6 rule 1 /
/// §9 "Body buffering"). The on-demand start gate forces buffering since the
/// gateway may block on service startup before any upstream I/O begins;
/// unbounded buffering is explicitly disallowed.
const MAX_BUFFERED_BODY: usize = 16 * 1024 * 1024;

pub async fn handle(ctx: SharedContext, route: RouteTarget, req: Request) -> Response {
    // Short request id for correlating the access-log and timing lines below
    // across concurrent requests, following the teacher's
    // `uuid::Uuid::new_v4()`-derived correlation id convention.
    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let started = std::time::Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    route.service.state.touch();

    if let Err(e) = state_machine::ensure_online(&ctx, &route.service).await {
        let response = e.into_response();
        log_request(&ctx, &route, &request_id, &method, &path, response.status(), started);
        return response;
    }

    let uri = req.uri().clone();
    let headers = req.headers().clone();

    let body = match axum::body::to_bytes(req.into_body(), MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            let response = Error::PayloadTooLarge.into_response();
            log_request(&ctx, &route, &request_id, &method, &path, response.status(), started);
            return response;
        }
    };

    let guard = ActiveGuard::new(route.service.clone());
    let response = forward(&ctx, &route, method.clone(), uri, headers, body, guard).await;
    log_request(&ctx, &route, &request_id, &method, &path, response.status(), started);
    response
}

/// Per-request access log, gated by `logging.enableRequestLog`; timing is
/// gated separately by `logging.enablePerformanceLog` (spec §6 `logging`).
#[allow(clippy::too_many_arguments)]
fn log_request(
    ctx: &SharedContext,
    route: &RouteTarget,
    request_id: &str,
    method: &Method,
    path: &str,
    status: StatusCode,
    started: std::time::Instant,
) {
    let logging = &ctx.config.logging;
    if logging.enable_request_log {
        tracing::info!(
            request_id,
            service = %route.service.name,
            method = %method,
            path,
            status = status.as_u16(),
            "request"
        );
    }
    if logging.enable_performance_log {
        tracing::info!(
            request_id,
            service = %route.service.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request timing"
        );
    }
}

/// Build `scheme://host[:port]{path+query}` for the upstream request, using
/// the route's target authority with the inbound request's path and query.
fn build_upstream_url(target: &url::Url, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let origin = format!(
        "{}://{}{}",
        target.scheme(),
        target.host_str().unwrap_or("localhost"),
        target.port().map(|p| format!(":{p}")).unwrap_or_default(),
    );
    format!("{origin}{path_and_query}")
}

async fn forward(
    ctx: &SharedContext,
    route: &RouteTarget,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    guard: ActiveGuard,
) -> Response {
    let full_url = build_upstream_url(&route.target, &uri);

    let mut upstream_headers = HeaderMap::new();
    super::copy_forwarded_headers(&headers, &mut upstream_headers);
    if let Some(host) = route.target.host_str() {
        let host_value = match route.target.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.to_string(),
        };
        if let Ok(v) = axum::http::HeaderValue::from_str(&host_value) {
            upstream_headers.insert(axum::http::header::HOST, v);
        }
    }

    let response = match ctx
        .http_client
        .request(method, &full_url)
        .headers(upstream_headers)
        .body(body.to_vec())
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => return Error::UpstreamUnreachable(e.to_string()).into_response(),
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(resp_headers) = builder.headers_mut() {
        for (name, value) in response.headers().iter() {
            if super::is_hop_by_hop(name) {
                continue;
            }
            resp_headers.append(name, value.clone());
        }
    }

    // The guard must stay alive for as long as the client is actually
    // reading the response body, not just until these headers are built:
    // an SSE/long-poll upstream can keep this stream open far longer than
    // `forward` itself runs, and `activeConnections` has to reflect that
    // (spec §4.8, §8 scenario 2). Bundling it into the stream we hand to
    // `Body::from_stream` ties its `Drop` to the body's lifetime instead of
    // this function's.
    let stream = GuardedBodyStream::new(guard, response.bytes_stream());
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Wraps a response body stream together with the `ActiveGuard` that must
/// outlive it, so the guard drops (and `activeConnections` decrements) only
/// when the stream itself is exhausted or dropped — on success, on a
/// mid-stream upstream error, or on client abort.
struct GuardedBodyStream<S> {
    _guard: ActiveGuard,
    inner: Pin<Box<S>>,
}

impl<S> GuardedBodyStream<S> {
    fn new(guard: ActiveGuard, inner: S) -> Self {
        Self {
            _guard: guard,
            inner: Box::pin(inner),
        }
    }
}

impl<S: Stream> Stream for GuardedBodyStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Option<Self::Item>> {
        // `inner` is already heap-pinned (`Pin<Box<S>>` is `Unpin`
        // regardless of `S`), so projecting through `get_mut` is sound even
        // though `S` itself may not be `Unpin`.
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_uses_target_authority_with_request_path() {
        let target = url::Url::parse("http://127.0.0.1:9001").unwrap();
        let uri: Uri = "/foo/bar?x=1".parse().unwrap();
        assert_eq!(
            build_upstream_url(&target, &uri),
            "http://127.0.0.1:9001/foo/bar?x=1"
        );
    }
}
