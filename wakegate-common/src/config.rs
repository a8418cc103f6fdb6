//! Configuration types and loader for wakegate.
//!
//! The gateway reads a single YAML (or JSON) file describing the services it
//! fronts. Loading is a pure parse-and-validate step; building the routing
//! table from a validated `Config` happens in the `wakegate` crate, which
//! knows about the main/admin listener ports needed to complete the
//! collision checks in spec §4.4.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory wakegate looks in for a config file when none is given on the
/// command line: `~/.config/wakegate/`.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".wakegate"),
        |dirs| dirs.home_dir().join(".config").join("wakegate"),
    )
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_start_timeout() -> Duration {
    Duration::from_secs(30)
}

fn seconds_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn seconds_duration_opt<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs: Option<u64> = Option::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}

/// Top-level gateway configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub services: HashMap<String, ServiceConfig>,

    #[serde(default)]
    pub admin_api: AdminApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load, parse, and validate a config file. `path` overrides the default
    /// search location; `WAKEGATE_HOST`/`WAKEGATE_PORT` env vars override the
    /// file's values, matching the teacher's env-overlay convention.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let mut config: Config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid JSON config: {e}")))?
        } else {
            serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid YAML config: {e}")))?
        };

        config.apply_env_overlay();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overlay(&mut self) {
        if let Ok(host) = env::var("WAKEGATE_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("WAKEGATE_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }

    /// Structural validation that doesn't require knowledge of the routing
    /// table (non-empty services, unique names, each service has a route).
    /// Port/hostname collision checks happen once the routing table is built
    /// (they need the main and admin ports in scope).
    pub fn validate(&mut self) -> Result<()> {
        if self.services.is_empty() {
            return Err(Error::Config("services must be non-empty".into()));
        }

        for (key, service) in self.services.iter_mut() {
            if service.name.is_empty() {
                service.name = key.clone();
            }
            if service.routes.is_none() {
                // Derive route(s) from the explicit `host`/`port` shorthand
                // fields when present, falling back to the map key as a
                // hostname (spec §6 ServiceDescriptor validation).
                let mut derived = Vec::new();
                if let Some(host) = &service.host {
                    derived.push(RouteConfig::Host {
                        value: host.clone(),
                        target: None,
                    });
                }
                if let Some(port) = service.port {
                    derived.push(RouteConfig::Port {
                        value: port,
                        target: None,
                    });
                }
                if derived.is_empty() {
                    derived.push(RouteConfig::Host {
                        value: key.clone(),
                        target: None,
                    });
                }
                service.routes = Some(derived);
            }
        }

        if self.admin_api.enabled {
            let admin_port = self.admin_api.port;
            if admin_port == self.port {
                return Err(Error::Config(
                    "adminApi.port must differ from the main listener port".into(),
                ));
            }
        }

        Ok(())
    }
}

/// A single upstream service and how it's reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,

    /// Canonical upstream base URL.
    pub base: String,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub routes: Option<Vec<RouteConfig>>,

    #[serde(
        default = "default_idle_timeout",
        deserialize_with = "seconds_duration",
        rename = "idleTimeout"
    )]
    pub idle_timeout: Duration,

    #[serde(
        default = "default_start_timeout",
        deserialize_with = "seconds_duration",
        rename = "startTimeout"
    )]
    pub start_timeout: Duration,

    pub commands: CommandsConfig,

    #[serde(default, rename = "healthCheck")]
    pub health_check: HealthCheckConfig,

    #[serde(default, rename = "proxyOnly")]
    pub proxy_only: bool,
}

/// Either a hostname route or a port-bound route; `target` defaults to the
/// owning service's `base` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RouteConfig {
    Host {
        value: String,
        #[serde(default)]
        target: Option<String>,
    },
    Port {
        value: u16,
        #[serde(default)]
        target: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    pub start: String,
    pub stop: String,
    pub check: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

/// Health-check strategy (spec §3/§4.2). Default is a bare TCP connect.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckConfig {
    #[default]
    Tcp,
    Http {
        #[serde(default)]
        url: Option<String>,
        #[serde(default, rename = "expectedStatus")]
        expected_status: Option<u16>,
        #[serde(default, deserialize_with = "seconds_duration_opt")]
        timeout: Option<Duration>,
    },
    Command {
        command: String,
        #[serde(default, deserialize_with = "seconds_duration_opt")]
        timeout: Option<Duration>,
    },
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, rename = "authToken")]
    pub auth_token: Option<String>,
    #[serde(default, rename = "allowedIps")]
    pub allowed_ips: Vec<String>,
}

fn default_admin_port() -> u16 {
    3001
}

impl Default for AdminApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_admin_port(),
            host: None,
            auth_token: None,
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default, rename = "enableRequestLog")]
    pub enable_request_log: bool,
    #[serde(default, rename = "enableWebSocketLog")]
    pub enable_web_socket_log: bool,
    #[serde(default, rename = "enablePerformanceLog")]
    pub enable_performance_log: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
