//! Shared gateway state: the routing table, service manager, and a pooled
//! upstream HTTP client, handed to every listener.

use std::sync::Arc;

use wakegate_common::config::Config;

use crate::manager::SharedServiceManager;
use crate::routing::RoutingTable;

pub struct GatewayContext {
    pub config: Config,
    pub routing: RoutingTable,
    pub manager: SharedServiceManager,
    /// Pooled, keep-alive client reused across every forwarded request
    /// (spec §4.6 rule 3: "Acquire a pooled upstream connection").
    pub http_client: reqwest::Client,
}

pub type SharedContext = Arc<GatewayContext>;
