use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::IpNetwork;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};

use crate::rib::{Route, RouteSource};
use crate::session::MessageCounts;
use crate::utils::format_time_as_elapsed;

#[rpc(client, server)]
pub trait Api {
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<PeerSummary>>;
    #[method(name = "show_rib")]
    async fn show_rib(&self) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_routes_learned")]
    async fn show_routes_learned(&self) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_routes_advertised")]
    async fn show_routes_advertised(&self) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "advertise_route")]
    async fn advertise_route(&self, route: RouteSpec) -> RpcResult<bool>;
    #[method(name = "withdraw_route")]
    async fn withdraw_route(&self, prefix: String) -> RpcResult<bool>;
    #[method(name = "add_peer")]
    async fn add_peer(&self, peer: PeerSpec) -> RpcResult<bool>;
    #[method(name = "remove_peer")]
    async fn remove_peer(&self, key: String) -> RpcResult<bool>;
    #[method(name = "start_peer")]
    async fn start_peer(&self, key: String) -> RpcResult<bool>;
    #[method(name = "stop_peer")]
    async fn stop_peer(&self, key: String) -> RpcResult<bool>;
    #[method(name = "statistics")]
    async fn statistics(&self) -> RpcResult<Statistics>;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PeerSummary {
    pub peer: String,
    pub enabled: bool,
    /// The peer's BGP Identifier, once an OPEN has been seen
    pub router_id: Option<IpAddr>,
    pub remote_asn: u32,
    pub local_asn: u32,
    pub msg_received: Option<u64>,
    pub msg_sent: Option<u64>,
    pub uptime: Option<String>,
    pub state: String,
    pub prefixes_received: Option<u64>,
    pub prefixes_sent: Option<u64>,
    pub last_notification: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LearnedRoute {
    pub source: String,
    pub prefix: String,
    pub next_hop: Option<IpAddr>,
    pub origin: String,
    pub as_path: Vec<u32>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub age: String,
}

impl LearnedRoute {
    pub fn from_route(route: &Arc<Route>) -> Self {
        let source = match &route.source {
            RouteSource::Local => "local".to_string(),
            RouteSource::Peer(info) => info.key.to_string(),
        };
        Self {
            source,
            prefix: route.prefix.to_string(),
            next_hop: route.attributes.next_hop.map(IpAddr::from),
            origin: route.attributes.origin.to_string(),
            as_path: route.attributes.as_path.asns(),
            local_pref: route.attributes.local_pref,
            multi_exit_disc: route.attributes.multi_exit_disc,
            age: format_time_as_elapsed(route.timestamp),
        }
    }
}

/// API input for a route to originate
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RouteSpec {
    /// Prefix to originate (E.g. "10.99.99.0/24")
    pub prefix: String,
    /// Next-hop to reach this prefix; defaults to the router-ID
    pub next_hop: Option<Ipv4Addr>,
    pub origin: Option<String>,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
}

/// API input for a peer added at runtime
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerSpec {
    pub remote_ip: Option<IpNetwork>,
    pub hostname: Option<String>,
    pub remote_as: u32,
    pub local_as: Option<u32>,
    pub local_addr: Option<IpAddr>,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub accept_any_source: bool,
    #[serde(default)]
    pub route_reflector_client: bool,
    #[serde(default = "PeerSpec::default_hold_timer")]
    pub hold_timer: u16,
    #[serde(default = "PeerSpec::default_connect_retry")]
    pub connect_retry: u16,
    #[serde(default = "PeerSpec::default_dest_port")]
    pub dest_port: u16,
}

impl PeerSpec {
    fn default_hold_timer() -> u16 {
        90
    }

    fn default_connect_retry() -> u16 {
        120
    }

    fn default_dest_port() -> u16 {
        179
    }
}

/// Aggregate message counters across all sessions
#[derive(Debug, Deserialize, Serialize)]
pub struct Statistics {
    pub local_as: u32,
    pub router_id: String,
    pub total_peers: usize,
    pub established_peers: usize,
    pub loc_rib_routes: usize,
    pub counts: MessageCounts,
}
