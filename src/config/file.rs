use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnetwork::IpNetwork;
use serde::Deserialize;

struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn listen_addr() -> IpAddr {
        IpAddr::from([0, 0, 0, 0])
    }

    fn port() -> u16 {
        179
    }

    fn decision_interval() -> u16 {
        5
    }

    fn hold_timer() -> u16 {
        90
    }

    fn connect_retry() -> u16 {
        120
    }

    fn dest_port() -> u16 {
        179
    }
}

/// Config (toml) representation of a peer
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    // Peer connection details: an address (or prefix to match inbound
    // sources against), or a hostname resolved at each connect attempt.
    // Mesh peers (accept_any_source) may omit both.
    pub(super) remote_ip: Option<IpNetwork>,
    pub(super) hostname: Option<String>,
    pub(super) remote_as: u32,

    // Local connection details; defer to server config if not provided
    pub(super) local_as: Option<u32>,
    pub(super) local_router_id: Option<Ipv4Addr>,
    // Used for the NEXT_HOP rewrite when the socket address is unknown
    pub(super) local_addr: Option<IpAddr>,

    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,

    // Only accept incoming TCP sessions, never connect out
    #[serde(default)]
    pub(super) passive: bool,

    // Identify inbound connections by the AS in their OPEN instead of
    // by source address (implies passive)
    #[serde(default)]
    pub(super) accept_any_source: bool,

    #[serde(default)]
    pub(super) route_reflector_client: bool,

    // Keepalives are sent every 1/3rd of this value
    #[serde(default = "Defaults::hold_timer")]
    pub(super) hold_timer: u16,

    // Base interval between outbound connect attempts
    #[serde(default = "Defaults::connect_retry")]
    pub(super) connect_retry: u16,

    // Destination port when initiating the connection
    #[serde(default = "Defaults::dest_port")]
    pub(super) dest_port: u16,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global router-ID (can be overridden per-peer)
    pub(super) router_id: Ipv4Addr,
    // Global ASN (can be overridden per-peer)
    pub(super) default_as: u32,
    #[serde(default = "Defaults::listen_addr")]
    pub(super) listen_addr: IpAddr,
    #[serde(default = "Defaults::port")]
    pub(super) port: u16,
    // Control API endpoint; no API server when absent
    pub(super) api_addr: Option<SocketAddr>,
    #[serde(default = "Defaults::decision_interval")]
    pub(super) decision_interval: u16,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Self::from_str(&contents)
    }

    pub(super) fn from_str(contents: &str) -> io::Result<Self> {
        toml::from_str(contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
router_id = "4.4.4.4"
default_as = 65001
port = 1179
api_addr = "127.0.0.1:8179"

[[peers]]
remote_ip = "172.16.0.1"
remote_as = 65000
hold_timer = 30
dest_port = 1179

[[peers]]
hostname = "edge2.example.net"
remote_as = 65002
passive = true

[[peers]]
remote_as = 65003
accept_any_source = true
"#;

    #[test]
    fn test_parse_config() {
        let config = ServerConfigSpec::from_str(CONFIG).unwrap();
        assert_eq!(config.router_id, Ipv4Addr::new(4, 4, 4, 4));
        assert_eq!(config.default_as, 65001);
        assert_eq!(config.port, 1179);
        assert_eq!(config.decision_interval, 5);
        assert_eq!(config.peers.len(), 3);

        let v4_peer = &config.peers[0];
        assert_eq!(v4_peer.remote_as, 65000);
        assert_eq!(v4_peer.hold_timer, 30);
        assert_eq!(v4_peer.dest_port, 1179);
        assert!(!v4_peer.passive);
        assert!(v4_peer.enabled);

        let dns_peer = &config.peers[1];
        assert_eq!(dns_peer.hostname.as_deref(), Some("edge2.example.net"));
        assert!(dns_peer.passive);
        assert_eq!(dns_peer.hold_timer, 90);

        let mesh_peer = &config.peers[2];
        assert!(mesh_peer.accept_any_source);
        assert!(mesh_peer.remote_ip.is_none());
    }
}
