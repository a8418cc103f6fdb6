//! Routing Table (spec §3, §4.4): the static hostname/port index built once
//! at startup.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;
use wakegate_common::config::{Config, HealthCheckConfig, RouteConfig, ServiceConfig};
use wakegate_common::error::{Error, Result};

use crate::descriptor::{Commands, Route, ServiceDescriptor};
use crate::health::HealthCheck;
use crate::state::ServiceState;

#[derive(Clone)]
pub struct RouteTarget {
    pub service: Arc<ServiceDescriptor>,
    pub target: Url,
}

pub struct RoutingTable {
    hostname_routes: HashMap<String, RouteTarget>,
    port_routes: HashMap<u16, RouteTarget>,
}

impl RoutingTable {
    /// Case-insensitive, port-stripped hostname lookup.
    pub fn resolve_host(&self, host_header: &str) -> Option<RouteTarget> {
        let host = host_header
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(host_header)
            .to_ascii_lowercase();
        self.hostname_routes.get(&host).cloned()
    }

    pub fn resolve_port(&self, port: u16) -> Option<RouteTarget> {
        self.port_routes.get(&port).cloned()
    }

    pub fn port_routes(&self) -> impl Iterator<Item = (&u16, &RouteTarget)> {
        self.port_routes.iter()
    }

    /// All services, deduplicated by name, unioning the hostname and port
    /// tables — the admin plane must be able to find a service regardless of
    /// which kind of route it was bound by (spec §9 Open Question 1).
    pub fn all_services(&self) -> Vec<Arc<ServiceDescriptor>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for route in self.hostname_routes.values().chain(self.port_routes.values()) {
            if seen.insert(route.service.name.clone()) {
                out.push(route.service.clone());
            }
        }
        out
    }

    pub fn find_service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.all_services().into_iter().find(|s| s.name == name)
    }
}

fn resolve_health_check(cfg: &HealthCheckConfig) -> HealthCheck {
    match cfg {
        HealthCheckConfig::Tcp => HealthCheck::Tcp,
        HealthCheckConfig::Http {
            url,
            expected_status,
            timeout,
        } => HealthCheck::Http {
            url: url.as_ref().and_then(|u| Url::parse(u).ok()),
            expected_status: expected_status.unwrap_or(200),
            timeout: timeout.unwrap_or_else(crate::health::default_http_timeout),
        },
        HealthCheckConfig::Command { command, timeout } => HealthCheck::Command {
            command: command.clone(),
            timeout: timeout.unwrap_or(std::time::Duration::from_secs(30)),
        },
        HealthCheckConfig::None => HealthCheck::None,
    }
}

fn build_descriptor(key: &str, cfg: &ServiceConfig) -> Result<Arc<ServiceDescriptor>> {
    let upstream = Url::parse(&cfg.base)
        .map_err(|e| Error::Config(format!("service {key}: invalid base URL: {e}")))?;

    let route_configs = cfg
        .routes
        .clone()
        .unwrap_or_else(|| vec![RouteConfig::Host {
            value: key.to_string(),
            target: None,
        }]);

    let mut routes = Vec::with_capacity(route_configs.len());
    for route in route_configs {
        match route {
            RouteConfig::Host { value, target } => {
                let target = match target {
                    Some(t) => Url::parse(&t)
                        .map_err(|e| Error::Config(format!("service {key}: invalid route target: {e}")))?,
                    None => upstream.clone(),
                };
                routes.push(Route::Host {
                    hostname: value.to_ascii_lowercase(),
                    target,
                });
            }
            RouteConfig::Port { value, target } => {
                let target = match target {
                    Some(t) => Url::parse(&t)
                        .map_err(|e| Error::Config(format!("service {key}: invalid route target: {e}")))?,
                    None => upstream.clone(),
                };
                routes.push(Route::Port { port: value, target });
            }
        }
    }

    if routes.is_empty() {
        return Err(Error::Config(format!(
            "service {key} must supply at least one route"
        )));
    }

    let name = if cfg.name.is_empty() {
        key.to_string()
    } else {
        cfg.name.clone()
    };

    Ok(Arc::new(ServiceDescriptor {
        state: ServiceState::new(cfg.proxy_only),
        name,
        upstream,
        commands: Commands {
            start: cfg.commands.start.clone(),
            stop: cfg.commands.stop.clone(),
            check: cfg.commands.check.clone(),
            cwd: cfg.commands.cwd.clone(),
            env: cfg.commands.env.clone(),
        },
        health_check: resolve_health_check(&cfg.health_check),
        idle_timeout: cfg.idle_timeout,
        start_timeout: cfg.start_timeout,
        proxy_only: cfg.proxy_only,
        routes,
    }))
}

/// Build the routing table from a validated `Config`, rejecting hostname or
/// port collisions (including against the main and admin listener ports).
pub fn build(config: &Config) -> Result<(RoutingTable, Vec<Arc<ServiceDescriptor>>)> {
    let mut hostname_routes = HashMap::new();
    let mut port_routes: HashMap<u16, RouteTarget> = HashMap::new();
    let mut descriptors = Vec::new();

    let reserved_ports: Vec<u16> = std::iter::once(config.port)
        .chain(config.admin_api.enabled.then_some(config.admin_api.port))
        .collect();

    for (key, svc_cfg) in &config.services {
        let descriptor = build_descriptor(key, svc_cfg)?;
        for route in &descriptor.routes {
            match route {
                Route::Host { hostname, target } => {
                    if hostname_routes.contains_key(hostname) {
                        return Err(Error::Config(format!(
                            "hostname {hostname} is routed to more than one service"
                        )));
                    }
                    hostname_routes.insert(
                        hostname.clone(),
                        RouteTarget {
                            service: descriptor.clone(),
                            target: target.clone(),
                        },
                    );
                }
                Route::Port { port, target } => {
                    if reserved_ports.contains(port) {
                        return Err(Error::Config(format!(
                            "port {port} collides with the main or admin listener"
                        )));
                    }
                    if port_routes.contains_key(port) {
                        return Err(Error::Config(format!(
                            "port {port} is routed to more than one service"
                        )));
                    }
                    port_routes.insert(
                        *port,
                        RouteTarget {
                            service: descriptor.clone(),
                            target: target.clone(),
                        },
                    );
                }
            }
        }
        descriptors.push(descriptor);
    }

    Ok((
        RoutingTable {
            hostname_routes,
            port_routes,
        },
        descriptors,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use wakegate_common::config::{AdminApiConfig, CommandsConfig, LoggingConfig};

    fn svc(base: &str) -> ServiceConfig {
        ServiceConfig {
            name: String::new(),
            base: base.to_string(),
            host: None,
            port: None,
            routes: None,
            idle_timeout: std::time::Duration::from_secs(300),
            start_timeout: std::time::Duration::from_secs(30),
            commands: CommandsConfig {
                start: "true".into(),
                stop: "true".into(),
                check: "true".into(),
                cwd: None,
                env: None,
            },
            health_check: HealthCheckConfig::Tcp,
            proxy_only: false,
        }
    }

    #[test]
    fn derives_hostname_route_from_map_key() {
        let mut services = StdHashMap::new();
        services.insert("a.test".to_string(), svc("http://127.0.0.1:9001"));
        let config = Config {
            host: "127.0.0.1".into(),
            port: 3000,
            services,
            admin_api: AdminApiConfig::default(),
            logging: LoggingConfig::default(),
        };
        let (table, descriptors) = build(&config).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert!(table.resolve_host("a.test").is_some());
        assert!(table.resolve_host("a.test:1234").is_some());
        assert!(table.resolve_host("A.TEST").is_some());
        assert!(table.resolve_host("unknown.test").is_none());
    }

    #[test]
    fn rejects_port_collision_with_main_listener() {
        let mut services = StdHashMap::new();
        let mut s = svc("http://127.0.0.1:9001");
        s.routes = Some(vec![RouteConfig::Port {
            value: 3000,
            target: None,
        }]);
        services.insert("b".to_string(), s);
        let config = Config {
            host: "127.0.0.1".into(),
            port: 3000,
            services,
            admin_api: AdminApiConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(build(&config).is_err());
    }

    #[test]
    fn rejects_duplicate_hostnames_across_services() {
        let mut services = StdHashMap::new();
        services.insert("a".to_string(), svc("http://127.0.0.1:9001"));
        let mut dup = svc("http://127.0.0.1:9002");
        dup.routes = Some(vec![RouteConfig::Host {
            value: "a".to_string(),
            target: None,
        }]);
        services.insert("b".to_string(), dup);
        let config = Config {
            host: "127.0.0.1".into(),
            port: 3000,
            services,
            admin_api: AdminApiConfig::default(),
            logging: LoggingConfig::default(),
        };
        assert!(build(&config).is_err());
    }
}
