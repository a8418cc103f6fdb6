//! Health Prober (spec §4.2): determines when a just-started service is
//! ready to receive traffic.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use url::Url;

use wakegate_common::error::{Error, Result};

use crate::descriptor::ServiceDescriptor;
use crate::executor;

/// A single probe's own per-attempt timeout; TCP connect attempts are short
/// enough that they pace the polling loop without an extra sleep.
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const BETWEEN_ATTEMPTS_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum HealthCheck {
    Tcp,
    Http {
        url: Option<Url>,
        expected_status: u16,
        timeout: Duration,
    },
    Command {
        command: String,
        timeout: Duration,
    },
    None,
}

impl HealthCheck {
    /// One independent, side-effect-free-on-failure probe attempt.
    async fn probe_once(&self, upstream: &Url) -> bool {
        match self {
            HealthCheck::None => true,
            HealthCheck::Tcp => probe_tcp(upstream).await,
            HealthCheck::Http {
                url,
                expected_status,
                timeout,
            } => probe_http(url.as_ref().unwrap_or(upstream), *expected_status, *timeout).await,
            HealthCheck::Command { command, timeout } => {
                executor::check(command, executor::ExecOptions {
                    timeout: *timeout,
                    ..Default::default()
                })
                .await
            }
        }
    }
}

async fn probe_tcp(upstream: &Url) -> bool {
    let Some(host) = upstream.host_str() else {
        return false;
    };
    let port = upstream.port_or_known_default().unwrap_or(match upstream.scheme() {
        "https" => 443,
        _ => 80,
    });
    match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

async fn probe_http(url: &Url, expected_status: u16, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    matches!(
        client.get(url.clone()).send().await,
        Ok(resp) if resp.status().as_u16() == expected_status
    )
}

/// Poll the configured check until it succeeds or `service.start_timeout`
/// elapses.
pub async fn wait_healthy(service: &ServiceDescriptor) -> Result<()> {
    let deadline = Instant::now() + service.start_timeout;
    loop {
        if service.health_check.probe_once(&service.upstream).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::HealthTimeout(service.name.clone()));
        }
        if !matches!(service.health_check, HealthCheck::Tcp) {
            tokio::time::sleep(BETWEEN_ATTEMPTS_DELAY).await;
        }
    }
}

pub fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}
