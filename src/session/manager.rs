use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::{pin_mut, select, FutureExt};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::poller::{Poller, PollerEvent, PollerTx};
use super::{Session, SessionError, SessionUpdate};
use crate::config::{PeerConfig, PeerKey, ServerConfig};
use crate::fsm::State;
use crate::message::{header_error, Header, Message, MessageError, Open, Prefix, HEADER_LENGTH};
use crate::utils::as_u32_be;

/// How long an unidentified inbound connection gets to produce its OPEN
const MESH_OPEN_TIMEOUT_SECS: u64 = 30;
/// Bounded flush for a final NOTIFICATION before the socket closes
const NOTIFICATION_FLUSH_TIMEOUT_SECS: u64 = 2;

/// An inbound connection whose OPEN was pre-read for mesh matching
struct MeshConnection {
    stream: TcpStream,
    open: Open,
    socket: SocketAddr,
}

enum ManagerWake {
    Poller(Option<PollerEvent>),
    Mesh(Option<MeshConnection>),
}

/// Owns every session and the listener/poller feeding them with
/// connections. The agent drives it through `get_update`.
pub struct SessionManager {
    pub(crate) sessions: HashMap<PeerKey, Session>,
    poller: Poller,
    poller_tx: PollerTx,
    mesh_tx: mpsc::UnboundedSender<MeshConnection>,
    mesh_rx: mpsc::UnboundedReceiver<MeshConnection>,
}

impl SessionManager {
    pub fn new(config: &ServerConfig, listener: Option<TcpListener>) -> Self {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let (mesh_tx, mesh_rx) = mpsc::unbounded_channel();
        let mut poller = Poller::new(listener, poller_rx);
        let mut sessions = HashMap::with_capacity(config.peers.len());
        for peer_config in config.peers.iter() {
            let session = Session::new(Arc::clone(peer_config));
            poller.upsert_config(Arc::clone(peer_config));
            sessions.insert(session.key().clone(), session);
        }
        Self {
            sessions,
            poller,
            poller_tx,
            mesh_tx,
            mesh_rx,
        }
    }

    /// ManualStart for every enabled peer
    pub fn start_all(&mut self) {
        for session in self.sessions.values_mut() {
            if session.config().enabled {
                session.start();
            }
        }
    }

    pub fn get_session(&self, key: &PeerKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// Advance every connected session, then wait briefly for new
    /// connections. Returns at most one update for the agent.
    pub async fn get_update(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        let mut ended: Vec<PeerKey> = Vec::new();
        let mut flushed: Vec<Prefix> = Vec::new();
        for (key, session) in self.sessions.iter_mut() {
            if !session.is_connected() {
                continue;
            }
            match session.run().await {
                Ok(Some(update)) => return Ok(Some(update)),
                Ok(None) => (),
                Err(err) => {
                    warn!("{}: {}", key, err);
                    if let Some(notification) = err.notification() {
                        let send = session.send_message(Message::Notification(notification));
                        match timeout(Duration::from_secs(NOTIFICATION_FLUSH_TIMEOUT_SECS), send)
                            .await
                        {
                            Ok(Ok(())) => (),
                            Ok(Err(send_err)) => {
                                debug!("Error sending NOTIFICATION to {}: {}", key, send_err);
                            }
                            Err(_) => debug!("Timed out flushing NOTIFICATION to {}", key),
                        }
                    }
                    flushed.extend(session.detach());
                    ended.push(key.clone());
                }
            }
        }
        if !ended.is_empty() {
            for key in &ended {
                self.reschedule(key);
            }
            return Ok(Some(SessionUpdate::Ended {
                keys: ended,
                flushed,
            }));
        }

        let wake = {
            let poller_fut = self.poller.get_event().fuse();
            let mesh_fut = self.mesh_rx.recv().fuse();
            pin_mut!(poller_fut, mesh_fut);
            select! {
                event = poller_fut => ManagerWake::Poller(event?),
                mesh = mesh_fut => ManagerWake::Mesh(mesh),
            }
        };

        match wake {
            ManagerWake::Poller(Some(PollerEvent::Incoming(stream, socket))) => {
                self.handle_incoming(stream, socket).await
            }
            ManagerWake::Poller(Some(PollerEvent::Outbound(stream, config))) => {
                self.handle_outbound(stream, config).await
            }
            ManagerWake::Poller(Some(PollerEvent::ConnectFailed(config))) => {
                if let Some(session) = self.sessions.get_mut(&config.key()) {
                    session.connect_failed();
                }
                Ok(None)
            }
            ManagerWake::Mesh(Some(connection)) => self.handle_mesh(connection).await,
            ManagerWake::Poller(None) | ManagerWake::Mesh(None) => Ok(None),
        }
    }

    /// A session ended; put its peer back on the connect schedule
    fn reschedule(&mut self, key: &PeerKey) {
        if let Some(session) = self.sessions.get_mut(key) {
            if session.config().enabled {
                session.start();
                if session.config().connects_out() {
                    let _ = self.poller_tx.send(Arc::clone(session.config()));
                }
            }
        }
    }

    async fn handle_outbound(
        &mut self,
        stream: TcpStream,
        config: Arc<PeerConfig>,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        let key = config.key();
        match self.sessions.get_mut(&key) {
            Some(session) => {
                if session.is_connected() {
                    // An incoming connection won the race
                    debug!("Already connected to {}; dropping outbound attempt", key);
                    return Ok(None);
                }
                self.attach_session(key, stream, true, None).await
            }
            None => {
                debug!("Outbound connection for removed peer {}", key);
                Ok(None)
            }
        }
    }

    /// Incoming dispatch: configured peer by source address first,
    /// then mesh identification by pre-reading the OPEN, else close.
    async fn handle_incoming(
        &mut self,
        stream: TcpStream,
        socket: SocketAddr,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        let source = socket.ip();
        let matched = self
            .sessions
            .values()
            .find(|session| session.config().matches(source))
            .map(|session| session.key().clone());
        if let Some(key) = matched {
            return self.resolve_collision(key, stream, socket).await;
        }

        if self
            .sessions
            .values()
            .any(|session| session.config().accept_any_source)
        {
            debug!(
                "No IP match for {}; reading OPEN for mesh identification",
                source
            );
            let mesh_tx = self.mesh_tx.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                match timeout(
                    Duration::from_secs(MESH_OPEN_TIMEOUT_SECS),
                    read_open(&mut stream),
                )
                .await
                {
                    Ok(Ok(open)) => {
                        let _ = mesh_tx.send(MeshConnection {
                            stream,
                            open,
                            socket,
                        });
                    }
                    Ok(Err(err)) => warn!("Failed to read OPEN from {}: {}", source, err),
                    Err(_) => warn!("Timed out waiting for OPEN from {}", source),
                }
            });
            return Ok(None);
        }

        warn!("Unexpected connection from {}: Not a configured peer", source);
        Ok(None)
    }

    /// RFC 4271 section 6.8: at most one connection survives per peer.
    /// In OpenSent/OpenConfirm the connection initiated by the higher
    /// BGP Identifier is retained; when Established the new connection
    /// is rejected unconditionally.
    async fn resolve_collision(
        &mut self,
        key: PeerKey,
        stream: TcpStream,
        socket: SocketAddr,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        let session = self.sessions.get_mut(&key).expect("Matched session exists");
        if !session.config().enabled {
            debug!("Rejecting connection for disabled peer {}", key);
            return Ok(None);
        }
        match session.state() {
            State::Established => {
                warn!(
                    "Session {} already established, rejecting new connection",
                    key
                );
                Ok(None)
            }
            State::OpenSent | State::OpenConfirm => {
                let local_id = as_u32_be(session.config().local_router_id.octets());
                let peer_id = session.remote_identifier().unwrap_or_else(|| {
                    match socket.ip() {
                        IpAddr::V4(v4) => as_u32_be(v4.octets()),
                        IpAddr::V6(_) => 0,
                    }
                });
                if local_id > peer_id {
                    info!(
                        "Connection collision with {}: local identifier higher, rejecting incoming",
                        key
                    );
                    Ok(None)
                } else {
                    info!(
                        "Connection collision with {}: peer identifier higher, keeping incoming",
                        key
                    );
                    let _ = session.detach();
                    self.attach_session(key, stream, false, None).await
                }
            }
            _ => {
                info!("Accepting incoming connection from {}", socket.ip());
                self.attach_session(key, stream, false, None).await
            }
        }
    }

    async fn handle_mesh(
        &mut self,
        connection: MeshConnection,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        let asn = connection.open.asn();
        let key = PeerKey::MeshAs(asn);
        match self.sessions.get_mut(&key) {
            Some(session) if session.is_established() => {
                warn!("Mesh session {} already established, rejecting", key);
                Ok(None)
            }
            Some(session) => {
                info!(
                    "Mesh peer matched: AS{} router-id {} from {}",
                    asn,
                    connection.open.router_id(),
                    connection.socket
                );
                if session.is_connected() {
                    let _ = session.detach();
                }
                self.attach_session(key, connection.stream, false, Some(connection.open))
                    .await
            }
            None => {
                warn!(
                    "No mesh peer configured for AS{} from {}, rejecting",
                    asn, connection.socket
                );
                Ok(None)
            }
        }
    }

    async fn attach_session(
        &mut self,
        key: PeerKey,
        stream: TcpStream,
        locally_initiated: bool,
        primed_open: Option<Open>,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        self.poller.suspend(&key);
        let session = self.sessions.get_mut(&key).expect("Session exists");
        info!("New session started: {}", key);
        if let Err(err) = session.attach(stream, locally_initiated, primed_open).await {
            warn!("Failed to start session with {}: {}", key, err);
            session.detach();
            self.reschedule(&key);
        }
        Ok(None)
    }

    /// Register a new peer and schedule its session
    pub fn add_peer(&mut self, config: Arc<PeerConfig>) -> bool {
        let key = config.key();
        if self.sessions.contains_key(&key) {
            warn!("Peer {} already exists", key);
            return false;
        }
        let mut session = Session::new(Arc::clone(&config));
        if config.enabled {
            session.start();
        }
        info!("Added peer {} (AS{})", key, config.remote_as);
        self.sessions.insert(key, session);
        self.poller.upsert_config(config);
        true
    }

    /// De-configure a peer: Cease, close, drop all of its state.
    /// Returns the flushed Adj-RIB-In prefixes.
    pub async fn remove_peer(&mut self, key: &PeerKey) -> Option<Vec<Prefix>> {
        let mut session = self.sessions.remove(key)?;
        self.poller.suspend(key);
        if let Some(notification) = session.manual_stop() {
            let send = session.send_message(Message::Notification(notification));
            let _ = timeout(Duration::from_secs(NOTIFICATION_FLUSH_TIMEOUT_SECS), send).await;
        }
        info!("Removed peer {}", key);
        Some(session.detach())
    }

    pub fn start_peer(&mut self, key: &PeerKey) -> bool {
        match self.sessions.get_mut(key) {
            Some(session) => {
                session.start();
                if session.config().connects_out() {
                    let _ = self.poller_tx.send(Arc::clone(session.config()));
                }
                true
            }
            None => false,
        }
    }

    /// ManualStop: Cease, close, back to Idle; the session object stays
    pub async fn stop_peer(&mut self, key: &PeerKey) -> Option<Vec<Prefix>> {
        self.poller.suspend(key);
        let session = self.sessions.get_mut(key)?;
        if let Some(notification) = session.manual_stop() {
            let send = session.send_message(Message::Notification(notification));
            let _ = timeout(Duration::from_secs(NOTIFICATION_FLUSH_TIMEOUT_SECS), send).await;
        }
        Some(session.detach())
    }

    /// Cease every connected session (agent shutdown)
    pub async fn shutdown(&mut self) {
        let keys: Vec<PeerKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            let _ = self.stop_peer(&key).await;
        }
    }
}

/// Read exactly one OPEN from a raw stream (mesh identification)
async fn read_open(stream: &mut TcpStream) -> Result<Open, MessageError> {
    let mut header_buf = [0u8; HEADER_LENGTH];
    stream
        .read_exact(&mut header_buf)
        .await
        .map_err(MessageError::Io)?;
    let header = Header::decode(&header_buf)?;
    if header.message_type != 1 {
        return Err(MessageError::header(
            header_error::BAD_MESSAGE_TYPE,
            vec![header.message_type],
        ));
    }
    let mut body = vec![0u8; header.length as usize - HEADER_LENGTH];
    stream.read_exact(&mut body).await.map_err(MessageError::Io)?;
    Open::decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteHost;
    use crate::message::{Capability, OpenParameter};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;

    fn mesh_server_config(mesh_as: u32) -> ServerConfig {
        ServerConfig {
            router_id: "4.4.4.4".parse().unwrap(),
            default_as: 65001,
            listen_addr: "127.0.0.1".parse().unwrap(),
            port: 0,
            api_addr: None,
            decision_interval: 5,
            peers: vec![Arc::new(PeerConfig {
                remote_host: RemoteHost::Any,
                remote_as: mesh_as,
                local_as: 65001,
                local_router_id: "4.4.4.4".parse().unwrap(),
                local_addr: None,
                enabled: true,
                passive: true,
                accept_any_source: true,
                route_reflector_client: false,
                hold_timer: 90,
                connect_retry: 120,
                dest_port: 179,
            })],
        }
    }

    fn open_for(asn: u32) -> Open {
        Open {
            version: 4,
            my_as: asn as u16,
            hold_time: 90,
            identifier: as_u32_be(Ipv4Addr::new(9, 9, 9, 9).octets()),
            parameters: vec![OpenParameter::Capabilities(vec![Capability::FourByteAsn(
                asn,
            )])],
        }
    }

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_read_open_from_raw_stream() {
        let (mut client, mut server) = stream_pair().await;
        let mut buf: Vec<u8> = Vec::new();
        Message::Open(open_for(65002)).encode(&mut buf, true).unwrap();
        client.write_all(&buf).await.unwrap();

        let open = read_open(&mut server).await.unwrap();
        assert_eq!(open.asn(), 65002);
        assert_eq!(open.router_id(), Ipv4Addr::new(9, 9, 9, 9));
    }

    #[tokio::test]
    async fn test_read_open_rejects_other_message_types() {
        let (mut client, mut server) = stream_pair().await;
        let mut buf: Vec<u8> = Vec::new();
        Message::KeepAlive.encode(&mut buf, true).unwrap();
        client.write_all(&buf).await.unwrap();

        match read_open(&mut server).await {
            Err(MessageError::Header { subcode, .. }) => {
                assert_eq!(subcode, header_error::BAD_MESSAGE_TYPE);
            }
            other => panic!("Expected header error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mesh_connection_attaches_by_open_asn() {
        let config = mesh_server_config(65002);
        let mut manager = SessionManager::new(&config, None);
        manager.start_all();

        let (_client, server) = stream_pair().await;
        let socket = server.peer_addr().unwrap();
        manager
            .handle_mesh(MeshConnection {
                stream: server,
                open: open_for(65002),
                socket,
            })
            .await
            .unwrap();

        let session = manager.get_session(&PeerKey::MeshAs(65002)).unwrap();
        assert!(session.is_connected());
        assert_eq!(session.state(), State::OpenSent);
    }

    #[tokio::test]
    async fn test_mesh_connection_rejected_for_unknown_asn() {
        let config = mesh_server_config(65002);
        let mut manager = SessionManager::new(&config, None);
        manager.start_all();

        let (_client, server) = stream_pair().await;
        let socket = server.peer_addr().unwrap();
        manager
            .handle_mesh(MeshConnection {
                stream: server,
                open: open_for(65003),
                socket,
            })
            .await
            .unwrap();

        let session = manager.get_session(&PeerKey::MeshAs(65002)).unwrap();
        assert!(!session.is_connected());
        assert_eq!(session.state(), State::Active);
    }
}
