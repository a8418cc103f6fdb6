//! End-to-end tests covering the gateway's request lifecycle (routing,
//! on-demand start, health-gated forwarding, idle reap, WebSocket bridging)
//! against real upstream listeners, following the teacher's
//! `zero-gateway/tests/integration_test.rs` style of driving a router
//! directly with `tower::ServiceExt::oneshot`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;

use wakegate::listeners::main_router;
use wakegate_common::config::{
    AdminApiConfig, CommandsConfig, Config, HealthCheckConfig, LoggingConfig, RouteConfig,
    ServiceConfig,
};

fn commands(start: &str) -> CommandsConfig {
    CommandsConfig {
        start: start.to_string(),
        stop: "true".to_string(),
        check: "true".to_string(),
        cwd: None,
        env: None,
    }
}

fn base_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        services: HashMap::new(),
        admin_api: AdminApiConfig::default(),
        logging: LoggingConfig::default(),
    }
}

fn insert_service(
    config: &mut Config,
    key: &str,
    base: u16,
    start_cmd: &str,
    idle_secs: u64,
    start_timeout_secs: u64,
    proxy_only: bool,
) {
    config.services.insert(
        key.to_string(),
        ServiceConfig {
            name: String::new(),
            base: format!("http://127.0.0.1:{base}"),
            host: None,
            port: None,
            routes: Some(vec![RouteConfig::Host {
                value: key.to_string(),
                target: None,
            }]),
            idle_timeout: Duration::from_secs(idle_secs),
            start_timeout: Duration::from_secs(start_timeout_secs),
            commands: commands(start_cmd),
            health_check: HealthCheckConfig::Tcp,
            proxy_only,
        },
    );
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Spawn a tiny upstream HTTP server after `delay`, simulating a cold-start
/// service whose start command backgrounds the real process.
async fn spawn_upstream_after_delay(port: u16, delay: Duration, router: Router) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("upstream port should be free");
        axum::serve(listener, router).await.unwrap();
    });
}

fn hello_upstream() -> Router {
    Router::new().route("/", get(|| async { "hello" }))
}

#[tokio::test]
async fn cold_start_then_warm_within_idle_window() {
    let port = free_port().await;
    spawn_upstream_after_delay(port, Duration::from_millis(50), hello_upstream()).await;

    let mut config = base_config();
    insert_service(&mut config, "a.test", port, "true", 10, 5, false);
    let ctx = wakegate::build_context(config).unwrap();
    let app = main_router(ctx);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "a.test")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"hello");

    // Second request within the idle window must not trigger a new start.
    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "a.test")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn concurrent_pull_up_starts_exactly_once() {
    let port = free_port().await;
    spawn_upstream_after_delay(port, Duration::from_millis(100), hello_upstream()).await;

    let mut config = base_config();
    // A start command slow enough that 50 concurrent callers all observe it
    // in-flight before it completes.
    insert_service(&mut config, "b.test", port, "sleep 0.2 && true", 30, 5, false);
    let ctx = wakegate::build_context(config).unwrap();
    let app = main_router(ctx.clone());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let request = Request::builder()
                .uri("/")
                .header(header::HOST, "b.test")
                .body(Body::empty())
                .unwrap();
            app.oneshot(request).await.unwrap().status()
        }));
    }

    for h in handles {
        assert_eq!(h.await.unwrap(), StatusCode::OK);
    }

    let service = ctx.routing.find_service("b.test").unwrap();
    assert_eq!(service.state.start_count(), 1);
}

#[tokio::test]
async fn unknown_host_returns_404() {
    let mut config = base_config();
    insert_service(&mut config, "a.test", free_port().await, "true", 10, 5, false);
    let ctx = wakegate::build_context(config).unwrap();
    let app = main_router(ctx);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "unknown.test")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proxy_only_service_with_dead_upstream_returns_502() {
    let mut config = base_config();
    // Port 1 is privileged and essentially never listening in test environments.
    config.services.insert(
        "c.test".to_string(),
        ServiceConfig {
            name: String::new(),
            base: "http://127.0.0.1:1".to_string(),
            host: None,
            port: None,
            routes: Some(vec![RouteConfig::Host {
                value: "c.test".to_string(),
                target: None,
            }]),
            idle_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(1),
            commands: commands("true"),
            health_check: HealthCheckConfig::None,
            proxy_only: true,
        },
    );
    let ctx = wakegate::build_context(config).unwrap();
    let app = main_router(ctx);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "c.test")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn crlf_in_header_value_is_stripped_before_reaching_upstream() {
    let port = free_port().await;
    let upstream = Router::new().route(
        "/",
        get(|headers: axum::http::HeaderMap| async move {
            headers
                .get("x-test")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        }),
    );
    spawn_upstream_after_delay(port, Duration::from_millis(0), upstream).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut config = base_config();
    insert_service(&mut config, "d.test", port, "true", 10, 5, false);
    let ctx = wakegate::build_context(config).unwrap();
    let app = main_router(ctx);

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "d.test")
        .header("x-test", "foo\r\nEvil: yes")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    // The CR/LF bytes are gone; "Evil" never arrives as a distinct header.
    assert_eq!(&body[..], b"fooEvil: yes");
}

#[tokio::test]
async fn idle_service_with_zero_active_connections_is_reaped() {
    let port = free_port().await;
    spawn_upstream_after_delay(port, Duration::from_millis(0), hello_upstream()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut config = base_config();
    insert_service(&mut config, "e.test", port, "true", 1, 5, false);
    let ctx = wakegate::build_context(config).unwrap();
    let app = main_router(ctx.clone());

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "e.test")
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap();

    let service = ctx.routing.find_service("e.test").unwrap();
    assert_eq!(service.state.status(), wakegate::state::ServiceStatus::Online);

    let reaper_ctx = ctx.clone();
    let reaper = tokio::spawn(async move { wakegate::reaper::run(reaper_ctx).await });

    // idleTimeout (1s) + tick interval (~3s) comfortably bounds the reap.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(service.state.status(), wakegate::state::ServiceStatus::Offline);
    reaper.abort();
}

#[tokio::test]
async fn proxy_only_service_is_never_reaped() {
    let port = free_port().await;
    spawn_upstream_after_delay(port, Duration::from_millis(0), hello_upstream()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut config = base_config();
    insert_service(&mut config, "f.test", port, "true", 1, 5, true);
    let ctx = wakegate::build_context(config).unwrap();

    let service = ctx.routing.find_service("f.test").unwrap();
    assert_eq!(service.state.status(), wakegate::state::ServiceStatus::Online);

    let reaper_ctx = ctx.clone();
    let reaper = tokio::spawn(async move { wakegate::reaper::run(reaper_ctx).await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(service.state.status(), wakegate::state::ServiceStatus::Online);
    reaper.abort();
}

#[tokio::test]
async fn websocket_bridge_echoes_binary_frames_and_tracks_active_connections() {
    use axum::extract::ws::{Message, WebSocketUpgrade};
    use futures_util::{SinkExt, StreamExt};

    let upstream_port = free_port().await;
    let upstream = Router::new().route(
        "/",
        get(|ws: WebSocketUpgrade| async move {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(msg)) = socket.next().await {
                    if matches!(msg, Message::Close(_)) {
                        break;
                    }
                    if socket.send(msg).await.is_err() {
                        break;
                    }
                }
            })
        }),
    );
    let upstream_listener = tokio::net::TcpListener::bind(("127.0.0.1", upstream_port))
        .await
        .unwrap();
    tokio::spawn(async move { axum::serve(upstream_listener, upstream).await.unwrap() });

    let mut config = base_config();
    insert_service(&mut config, "w.test", upstream_port, "true", 30, 5, false);
    let ctx = wakegate::build_context(config).unwrap();

    let gateway_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr: SocketAddr = gateway_listener.local_addr().unwrap();
    let app = main_router(ctx.clone());
    tokio::spawn(async move { axum::serve(gateway_listener, app).await.unwrap() });

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = format!("ws://{gateway_addr}/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(http::header::HOST, http::HeaderValue::from_static("w.test"));

    let (mut client, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("client should connect to gateway");

    let payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    client
        .send(tokio_tungstenite::tungstenite::Message::Binary(payload.clone()))
        .await
        .unwrap();

    let echoed = loop {
        match client.next().await.unwrap().unwrap() {
            tokio_tungstenite::tungstenite::Message::Binary(b) => break b,
            _ => continue,
        }
    };
    assert_eq!(echoed, payload);

    client.close(None).await.ok();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let service = ctx.routing.find_service("w.test").unwrap();
    assert_eq!(service.state.active_connections(), 0);
}

/// Spec §4.8/§8 scenario 2: an open streaming response (SSE, chunked, or
/// otherwise slow-to-drain) must keep `activeConnections` >= 1 for as long as
/// the client is still reading it, not just until the upstream's headers
/// arrive. The upstream here holds its body stream open for well past the
/// time `forward()` itself takes to build the `Response`.
#[tokio::test]
async fn active_connections_stays_elevated_until_the_streamed_body_is_drained() {
    use axum::body::Body as UpstreamBody;
    use axum::response::Response as UpstreamResponse;

    let upstream_port = free_port().await;
    let upstream = Router::new().route(
        "/stream",
        get(|| async {
            let stream = futures_util::stream::unfold(0u8, |i| async move {
                if i >= 3 {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(80)).await;
                Some((Ok::<_, std::io::Error>(vec![b'x'; 4]), i + 1))
            });
            UpstreamResponse::builder()
                .status(StatusCode::OK)
                .body(UpstreamBody::from_stream(stream))
                .unwrap()
        }),
    );
    let upstream_listener = tokio::net::TcpListener::bind(("127.0.0.1", upstream_port))
        .await
        .unwrap();
    tokio::spawn(async move { axum::serve(upstream_listener, upstream).await.unwrap() });

    let mut config = base_config();
    insert_service(&mut config, "s.test", upstream_port, "true", 300, 5, false);
    let ctx = wakegate::build_context(config).unwrap();

    let gateway_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr: SocketAddr = gateway_listener.local_addr().unwrap();
    let app = main_router(ctx.clone());
    tokio::spawn(async move { axum::serve(gateway_listener, app).await.unwrap() });

    let service = ctx.routing.find_service("s.test").unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{gateway_addr}/stream"))
        .header(http::header::HOST, "s.test")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), StatusCode::OK.as_u16());

    // Headers are back, but the body (3 chunks * 80ms) is still streaming:
    // the connection must still be counted as active.
    assert_eq!(service.state.active_connections(), 1);

    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), 12);

    // A moment for the dropped stream/guard to be observed.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(service.state.active_connections(), 0);
}

#[tokio::test]
async fn admin_plane_reports_and_controls_service_state() {
    let port = free_port().await;
    spawn_upstream_after_delay(port, Duration::from_millis(0), hello_upstream()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut config = base_config();
    insert_service(&mut config, "g.test", port, "true", 300, 5, false);
    config.admin_api = AdminApiConfig {
        enabled: true,
        port: 0,
        host: None,
        auth_token: None,
        allowed_ips: Vec::new(),
    };
    let ctx = wakegate::build_context(config).unwrap();

    let admin_app = wakegate::admin::build_router(ctx.clone());

    let request = Request::builder()
        .method(Method::GET)
        .uri("/_dynapm/api/services")
        .body(Body::empty())
        .unwrap();
    let response = admin_app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Not online yet: the admin stop must reject with 400.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/_dynapm/api/services/g.test/stop")
        .body(Body::empty())
        .unwrap();
    let response = admin_app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
