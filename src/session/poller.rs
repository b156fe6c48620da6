use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::Poll;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::{self, FutureExt};
use futures::{pin_mut, select};
use log::{debug, trace, warn};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::time::DelayQueue;

use crate::config::{PeerConfig, PeerKey, RemoteHost};

const TCP_INIT_TIMEOUT_MS: u64 = 1000;
const INITIAL_CONNECT_DELAY_MS: u64 = 1000;

pub type PollerTx = mpsc::UnboundedSender<Arc<PeerConfig>>;
pub type PollerRx = mpsc::UnboundedReceiver<Arc<PeerConfig>>;

#[derive(Debug)]
pub enum PollerEvent {
    /// A connection arrived on the listener
    Incoming(TcpStream, SocketAddr),
    /// An outbound connect succeeded
    Outbound(TcpStream, Arc<PeerConfig>),
    /// An outbound connect failed; a retry is already queued
    ConnectFailed(Arc<PeerConfig>),
}

#[derive(Debug, Clone)]
pub struct IdlePeer(Arc<PeerConfig>);

impl IdlePeer {
    pub fn new(config: Arc<PeerConfig>) -> Self {
        Self(config)
    }

    pub fn get_config(&self) -> Arc<PeerConfig> {
        Arc::clone(&self.0)
    }

    async fn connect(&self, source_addr: Option<IpAddr>) -> io::Result<TcpStream> {
        let config = &self.0;
        let remote_ip = match &config.remote_host {
            RemoteHost::Network(network) => network.ip(),
            RemoteHost::Hostname(name) => {
                // Re-resolve on every attempt; hostname peers are
                // reachable through ephemeral endpoints
                lookup_host((name.as_str(), config.dest_port))
                    .await?
                    .next()
                    .map(|addr| addr.ip())
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("No addresses for '{}'", name),
                        )
                    })?
            }
            RemoteHost::Any => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Mesh peers never connect out",
                ));
            }
        };
        let peer_addr = SocketAddr::new(remote_ip, config.dest_port);
        let socket = match peer_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        if let Some(ip) = source_addr {
            if ip.is_ipv4() == remote_ip.is_ipv4() {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
        }
        timeout(
            Duration::from_millis(TCP_INIT_TIMEOUT_MS),
            socket.connect(peer_addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TCP connect timed out"))?
    }
}

impl fmt::Display for IdlePeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<IdlePeer {}>", self.0.key())
    }
}

enum Wake {
    Incoming(TcpStream, SocketAddr),
    Due(PeerKey),
    Rescheduled(Arc<PeerConfig>),
    Timeout,
}

/// Owns the TCP listener and the not-yet-connected peers; wakes the
/// manager with inbound connections and outbound connect results
pub struct Poller {
    idle_peers: HashMap<PeerKey, IdlePeer>,
    tcp_listener: Option<TcpListener>,
    rx: PollerRx,
    delay_queue: DelayQueue<PeerKey>,
}

impl Poller {
    pub fn new(listener: Option<TcpListener>, rx: PollerRx) -> Self {
        Self {
            idle_peers: HashMap::new(),
            tcp_listener: listener,
            rx,
            delay_queue: DelayQueue::with_capacity(4),
        }
    }

    /// Start (or refresh) outbound connect scheduling for a peer
    pub fn upsert_config(&mut self, config: Arc<PeerConfig>) {
        let key = config.key();
        if !config.connects_out() {
            self.idle_peers.remove(&key);
            return;
        }
        if self
            .idle_peers
            .insert(key.clone(), IdlePeer::new(config))
            .is_some()
        {
            debug!("Peer config for {} updated", key);
        } else {
            self.delay_queue
                .insert(key, Duration::from_millis(INITIAL_CONNECT_DELAY_MS));
        }
    }

    /// A connection is up for this peer; stop initiating until the
    /// manager reschedules it
    pub fn suspend(&mut self, key: &PeerKey) {
        self.idle_peers.remove(key);
    }

    pub async fn get_event(&mut self) -> io::Result<Option<PollerEvent>> {
        let wake = {
            let listener = self.tcp_listener.as_ref();
            let delay_queue = &mut self.delay_queue;
            let rx = &mut self.rx;

            // Bounded so the caller's loop keeps servicing sessions
            // even when nothing arrives here
            let accept = timeout(Duration::from_millis(TCP_INIT_TIMEOUT_MS), async move {
                match listener {
                    Some(listener) => listener.accept().await,
                    None => future::pending().await,
                }
            })
            .fuse();
            // An empty DelayQueue yields Ready(None); park it instead
            // so the accept timeout stays in charge of waking us
            let expired = future::poll_fn(move |cx| match delay_queue.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired),
                _ => Poll::Pending,
            })
            .fuse();
            let rescheduled = rx.recv().fuse();
            pin_mut!(accept, expired, rescheduled);
            select! {
                incoming = accept => match incoming {
                    Ok(Ok((stream, socket))) => Wake::Incoming(stream, socket),
                    Ok(Err(err)) => {
                        warn!("Incoming connection failed: {}", err);
                        Wake::Timeout
                    }
                    Err(_) => Wake::Timeout,
                },
                outgoing = expired => Wake::Due(outgoing.into_inner()),
                peer = rescheduled => match peer {
                    Some(config) => Wake::Rescheduled(config),
                    None => Wake::Timeout,
                },
            }
        };

        match wake {
            Wake::Incoming(stream, socket) => {
                debug!("Incoming new connection from {}", socket);
                Ok(Some(PollerEvent::Incoming(stream, socket)))
            }
            Wake::Due(key) => self.connect_due(key).await,
            Wake::Rescheduled(config) => {
                self.upsert_config(config);
                Ok(None)
            }
            Wake::Timeout => Ok(None),
        }
    }

    async fn connect_due(&mut self, key: PeerKey) -> io::Result<Option<PollerEvent>> {
        // Peer may have been suspended or removed since being queued
        let peer = match self.idle_peers.get(&key) {
            Some(peer) => peer.clone(),
            None => return Ok(None),
        };
        let config = peer.get_config();
        if !config.connects_out() {
            return Ok(None);
        }
        trace!("Poller outbound triggered for {}", key);
        let source_addr = self
            .tcp_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.ip());
        match peer.connect(source_addr).await {
            Ok(stream) => {
                self.idle_peers.remove(&key);
                Ok(Some(PollerEvent::Outbound(stream, config)))
            }
            Err(err) => {
                warn!("Error connecting to {}: {}", key, err);
                self.delay_queue
                    .insert(key, jittered_interval(config.connect_retry));
                Ok(Some(PollerEvent::ConnectFailed(config)))
            }
        }
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller peers={}>", self.idle_peers.len())
    }
}

/// Connect retry interval with +/- 25% of clock-derived jitter, so a
/// rebooted fleet doesn't reconnect in lockstep
fn jittered_interval(seconds: u16) -> Duration {
    let base = u64::from(seconds.max(1)) * 1000;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::from(elapsed.subsec_nanos()))
        .unwrap_or(0);
    let spread = (base / 2).max(1);
    Duration::from_millis(base - spread / 2 + nanos % spread)
}
