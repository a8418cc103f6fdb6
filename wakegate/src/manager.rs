//! Service Manager (spec §4.3): start/stop/check for a single service, with
//! at-most-one concurrent start per service name.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use wakegate_common::error::{Error, Result};

use crate::descriptor::ServiceDescriptor;
use crate::executor::{self, ExecOptions};

type StartOutcome = std::result::Result<(), String>;

/// Process-local single-flight coordinator plus thin wrappers over the
/// executor for the three service-lifecycle commands.
pub struct ServiceManager {
    inflight: DashMap<String, watch::Receiver<Option<StartOutcome>>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    pub async fn is_running(&self, service: &ServiceDescriptor) -> bool {
        executor::check(
            &service.commands.check,
            ExecOptions {
                cwd: service.commands.cwd.clone(),
                env: service.commands.env.clone(),
                timeout: service.start_timeout,
            },
        )
        .await
    }

    /// Run `commands.start`, single-flighted by `service.name`. Concurrent
    /// callers for the same name await the same in-flight attempt and
    /// observe the same outcome; the entry is removed on completion so a
    /// later attempt may retry from scratch.
    pub async fn start(&self, service: &ServiceDescriptor) -> Result<()> {
        loop {
            let existing = self.inflight.get(&service.name).map(|r| r.clone());
            if let Some(mut rx) = existing {
                let outcome = loop {
                    if let Some(outcome) = rx.borrow().clone() {
                        break outcome;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped its sender without sending — retry
                        // the whole start from the top.
                        break Err("start attempt was abandoned".to_string());
                    }
                };
                return outcome.map_err(|detail| Error::StartFailed {
                    service: service.name.clone(),
                    detail,
                });
            }

            let (tx, rx) = watch::channel(None);
            match self.inflight.entry(service.name.clone()) {
                Entry::Occupied(_) => continue, // lost the race, go around and join
                Entry::Vacant(v) => {
                    v.insert(rx);
                }
            }

            let output = executor::run(
                &service.commands.start,
                ExecOptions {
                    cwd: service.commands.cwd.clone(),
                    env: service.commands.env.clone(),
                    timeout: service.start_timeout,
                },
            )
            .await;

            let outcome: StartOutcome = if output.exit_code == 0 {
                Ok(())
            } else {
                Err(if output.stderr.is_empty() {
                    output.stdout
                } else {
                    output.stderr
                })
            };

            let _ = tx.send(Some(outcome.clone()));
            self.inflight.remove(&service.name);

            return outcome.map_err(|detail| Error::StartFailed {
                service: service.name.clone(),
                detail,
            });
        }
    }

    /// Best-effort: logs on non-zero exit but never fails the caller.
    pub async fn stop(&self, service: &ServiceDescriptor) {
        let output = executor::run(
            &service.commands.stop,
            ExecOptions {
                cwd: service.commands.cwd.clone(),
                env: service.commands.env.clone(),
                timeout: service.start_timeout,
            },
        )
        .await;

        if output.exit_code != 0 {
            tracing::error!(
                service = %service.name,
                exit_code = output.exit_code,
                stderr = %output.stderr,
                "stop command failed"
            );
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedServiceManager = Arc<ServiceManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Commands;
    use crate::health::HealthCheck;
    use crate::state::ServiceState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    fn descriptor(start_cmd: String) -> ServiceDescriptor {
        ServiceDescriptor {
            name: "svc".into(),
            upstream: Url::parse("http://127.0.0.1:9").unwrap(),
            commands: Commands {
                start: start_cmd,
                stop: "true".into(),
                check: "true".into(),
                cwd: None,
                env: None,
            },
            health_check: HealthCheck::None,
            idle_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(5),
            proxy_only: false,
            routes: vec![],
            state: ServiceState::new(false),
        }
    }

    #[tokio::test]
    async fn concurrent_starts_execute_the_command_exactly_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        CALLS.store(0, Ordering::SeqCst);

        // A start command that's slow enough for 50 concurrent callers to
        // all observe it in-flight before it completes.
        let descriptor = Arc::new(descriptor("sleep 0.2".to_string()));
        let manager = Arc::new(ServiceManager::new());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            let descriptor = descriptor.clone();
            handles.push(tokio::spawn(async move { manager.start(&descriptor).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // The single-flight map must be empty again for future attempts.
        assert!(manager.inflight.is_empty());
    }

    #[tokio::test]
    async fn failed_start_is_reported_to_all_waiters() {
        let descriptor = descriptor("exit 3".to_string());
        let manager = ServiceManager::new();
        let result = manager.start(&descriptor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stop_never_fails_even_on_nonzero_exit() {
        let mut descriptor = descriptor("true".to_string());
        descriptor.commands.stop = "exit 9".to_string();
        let manager = ServiceManager::new();
        manager.stop(&descriptor).await; // must not panic
    }
}
