mod file;

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::warn;

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> io::Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    ServerConfig::from_spec(spec)
}

/// Parse a TOML config string (used by tests and the API)
pub fn from_str(contents: &str) -> io::Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_str(contents)?;
    ServerConfig::from_spec(spec)
}

/// How a peer is identified in the agent's owning session map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Address(IpAddr),
    Hostname(String),
    /// Mesh peers are keyed by the AS number their OPEN must carry
    MeshAs(u32),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerKey::Address(addr) => write!(f, "{}", addr),
            PeerKey::Hostname(name) => write!(f, "{}", name),
            PeerKey::MeshAs(asn) => write!(f, "mesh-as{}", asn),
        }
    }
}

/// Where the remote end of a session lives
#[derive(Debug, Clone)]
pub enum RemoteHost {
    /// An address, or a prefix matched against inbound source addresses
    Network(IpNetwork),
    /// Resolved via DNS at each connect attempt
    Hostname(String),
    /// Mesh peers carry no address at all
    Any,
}

impl RemoteHost {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match self {
            RemoteHost::Network(network) => network.contains(addr),
            _ => false,
        }
    }

    /// The single host address, when one is configured
    pub fn host_address(&self) -> Option<IpAddr> {
        match self {
            RemoteHost::Network(network) => {
                let is_host = match network {
                    IpNetwork::V4(n) => n.prefix() == 32,
                    IpNetwork::V6(n) => n.prefix() == 128,
                };
                if is_host {
                    Some(network.ip())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// In-memory representation of a peer config, with missing spec items
/// defaulted to server values
#[derive(Debug)]
pub struct PeerConfig {
    pub remote_host: RemoteHost,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: Ipv4Addr,
    pub local_addr: Option<IpAddr>,
    pub enabled: bool,
    pub passive: bool,
    pub accept_any_source: bool,
    pub route_reflector_client: bool,
    pub hold_timer: u16,
    pub connect_retry: u16,
    pub dest_port: u16,
}

impl PeerConfig {
    /// Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }

    pub fn key(&self) -> PeerKey {
        if self.accept_any_source {
            PeerKey::MeshAs(self.remote_as)
        } else {
            match &self.remote_host {
                RemoteHost::Network(network) => PeerKey::Address(network.ip()),
                RemoteHost::Hostname(name) => PeerKey::Hostname(name.clone()),
                RemoteHost::Any => PeerKey::MeshAs(self.remote_as),
            }
        }
    }

    /// Does an inbound connection from `addr` belong to this peer
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.remote_host.contains(addr)
    }

    /// Can the poller initiate outbound connections for this peer
    pub fn connects_out(&self) -> bool {
        self.enabled && !self.passive && !self.accept_any_source
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    pub listen_addr: IpAddr,
    pub port: u16,
    pub api_addr: Option<SocketAddr>,
    pub decision_interval: u16,
    pub peers: Vec<Arc<PeerConfig>>,
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> io::Result<Self> {
        let mut peers: Vec<Arc<PeerConfig>> = Vec::with_capacity(spec.peers.len());
        for p in &spec.peers {
            let remote_host = match (&p.remote_ip, &p.hostname) {
                (Some(network), _) => RemoteHost::Network(*network),
                (None, Some(name)) => RemoteHost::Hostname(name.clone()),
                (None, None) if p.accept_any_source => RemoteHost::Any,
                (None, None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Peer AS{} has neither remote_ip nor hostname",
                            p.remote_as
                        ),
                    ));
                }
            };
            // Mesh peers never connect out
            let passive = if p.accept_any_source && !p.passive {
                warn!(
                    "Peer AS{} has accept_any_source; forcing passive",
                    p.remote_as
                );
                true
            } else {
                p.passive
            };
            peers.push(Arc::new(PeerConfig {
                remote_host,
                remote_as: p.remote_as,
                local_as: p.local_as.unwrap_or(spec.default_as),
                local_router_id: p.local_router_id.unwrap_or(spec.router_id),
                local_addr: p.local_addr,
                enabled: p.enabled,
                passive,
                accept_any_source: p.accept_any_source,
                route_reflector_client: p.route_reflector_client,
                hold_timer: p.hold_timer,
                connect_retry: p.connect_retry,
                dest_port: p.dest_port,
            }));
        }

        Ok(Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            listen_addr: spec.listen_addr,
            port: spec.port,
            api_addr: spec.api_addr,
            decision_interval: spec.decision_interval,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_peer_forced_passive() {
        let config = from_str(
            r#"
router_id = "4.4.4.4"
default_as = 65001

[[peers]]
remote_as = 65002
accept_any_source = true
"#,
        )
        .unwrap();
        let peer = &config.peers[0];
        assert!(peer.passive);
        assert!(!peer.connects_out());
        assert_eq!(peer.key(), PeerKey::MeshAs(65002));
    }

    #[test]
    fn test_peer_defaults_and_keys() {
        let config = from_str(
            r#"
router_id = "4.4.4.4"
default_as = 65001

[[peers]]
remote_ip = "172.16.0.1"
remote_as = 65000

[[peers]]
hostname = "edge2.example.net"
remote_as = 65001
"#,
        )
        .unwrap();
        let ip_peer = &config.peers[0];
        assert_eq!(ip_peer.local_as, 65001);
        assert!(ip_peer.is_ebgp());
        assert_eq!(
            ip_peer.key(),
            PeerKey::Address("172.16.0.1".parse().unwrap())
        );
        assert!(ip_peer.matches("172.16.0.1".parse().unwrap()));
        assert!(!ip_peer.matches("172.16.0.9".parse().unwrap()));
        assert!(ip_peer.connects_out());

        let dns_peer = &config.peers[1];
        assert!(!dns_peer.is_ebgp());
        assert_eq!(
            dns_peer.key(),
            PeerKey::Hostname("edge2.example.net".into())
        );
    }

    #[test]
    fn test_peer_without_address_rejected() {
        let result = from_str(
            r#"
router_id = "4.4.4.4"
default_as = 65001

[[peers]]
remote_as = 65000
"#,
        );
        assert!(result.is_err());
    }
}
