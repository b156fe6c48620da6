//! The agent owns every session (through the manager), the Loc-RIB,
//! and the decision process; all route advertisement flows through its
//! export pipeline so Adj-RIB-Out always reflects what was sent.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::{pin_mut, select, FutureExt};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

use crate::api::{self, LearnedRoute, PeerSpec, PeerSummary, RouteSpec, Statistics};
use crate::config::{PeerConfig, PeerKey, RemoteHost, ServerConfig};
use crate::hooks::Hooks;
use crate::message::{flags, AsPath, Origin, PathAttribute, Prefix};
use crate::rib::{BestPathSelector, LocRib, PathAttributes, Route, RouteSource};
use crate::session::{
    MessageCounts, OutboundUpdate, Session, SessionManager, SessionUpdate,
};
use crate::utils::{format_time_as_elapsed, prefix_from_str};

/// Control-plane commands, sent by the API server with a oneshot for
/// the reply
#[derive(Debug)]
pub enum ApiRequest {
    ShowPeers(oneshot::Sender<Vec<PeerSummary>>),
    ShowRib(oneshot::Sender<Vec<LearnedRoute>>),
    ShowRoutesLearned(oneshot::Sender<Vec<LearnedRoute>>),
    ShowRoutesAdvertised(oneshot::Sender<Vec<LearnedRoute>>),
    AdvertiseRoute {
        spec: RouteSpec,
        reply: oneshot::Sender<bool>,
    },
    WithdrawRoute {
        prefix: String,
        reply: oneshot::Sender<bool>,
    },
    AddPeer {
        spec: PeerSpec,
        reply: oneshot::Sender<bool>,
    },
    RemovePeer {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    StartPeer {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    StopPeer {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Statistics(oneshot::Sender<Statistics>),
}

pub type ApiTx = mpsc::UnboundedSender<ApiRequest>;
pub type ApiRx = mpsc::UnboundedReceiver<ApiRequest>;

enum AgentWake {
    Session(Result<Option<SessionUpdate>, crate::session::SessionError>),
    Shutdown,
}

pub struct Agent {
    router_id: Ipv4Addr,
    default_as: u32,
    decision_interval: u16,
    manager: SessionManager,
    loc_rib: LocRib,
    /// Locally originated routes; direct Loc-RIB candidates with an
    /// empty AS_PATH
    local_routes: HashMap<Prefix, Arc<Route>>,
    selector: BestPathSelector,
    hooks: Hooks,
    /// Prefixes touched since the last decision cycle
    dirty: HashSet<Prefix>,
    api_rx: ApiRx,
}

impl Agent {
    pub fn new(config: &ServerConfig, listener: Option<TcpListener>, api_rx: ApiRx) -> Self {
        Self {
            router_id: config.router_id,
            default_as: config.default_as,
            decision_interval: config.decision_interval,
            manager: SessionManager::new(config, listener),
            loc_rib: LocRib::new(),
            local_routes: HashMap::new(),
            selector: BestPathSelector::new(config.default_as, config.router_id),
            hooks: Hooks::default(),
            dirty: HashSet::new(),
            api_rx,
        }
    }

    pub fn set_hooks(&mut self, hooks: Hooks) {
        if let Some(igp_cost) = hooks.igp_cost.clone() {
            self.selector.set_igp_cost_lookup(igp_cost);
        }
        self.hooks = hooks;
    }

    pub fn start(&mut self) {
        info!(
            "Starting BGP agent AS{} Router-ID {}",
            self.default_as, self.router_id
        );
        self.manager.start_all();
    }

    /// Main loop: advance sessions, run the periodic decision process,
    /// service control commands, exit on ctrl-c
    pub async fn run(&mut self) -> io::Result<()> {
        let decision_interval = Duration::from_secs(u64::from(self.decision_interval.max(1)));
        let mut last_decision = Instant::now();
        loop {
            // get_update is bounded (it waits at most ~1s for new
            // connections), so control work and the decision cadence
            // are serviced between rounds without cancelling a session
            // mid-message
            let wake = {
                let manager_fut = self.manager.get_update().fuse();
                let shutdown_fut = tokio::signal::ctrl_c().fuse();
                pin_mut!(manager_fut, shutdown_fut);
                select! {
                    update = manager_fut => AgentWake::Session(update),
                    _ = shutdown_fut => AgentWake::Shutdown,
                }
            };
            match wake {
                AgentWake::Session(Ok(Some(update))) => self.handle_session_update(update),
                AgentWake::Session(Ok(None)) => (),
                AgentWake::Session(Err(err)) => warn!("Session manager error: {}", err),
                AgentWake::Shutdown => {
                    info!("Shutting down BGP agent");
                    self.manager.shutdown().await;
                    return Ok(());
                }
            }

            while let Ok(request) = self.api_rx.try_recv() {
                self.handle_api(request).await;
            }
            if last_decision.elapsed() >= decision_interval {
                self.run_decision_process();
                last_decision = Instant::now();
            }
        }
    }

    fn handle_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Learned { key, touched } => {
                debug!("Learned {} prefix change(s) from {}", touched.len(), key);
                self.dirty.extend(touched);
            }
            SessionUpdate::Established(key) => {
                info!("Session with {} established - advertising existing routes", key);
                self.advertise_full_rib(&key);
            }
            SessionUpdate::Ended { keys, flushed } => {
                for key in &keys {
                    debug!("Session ended with {}", key);
                }
                self.dirty.extend(flushed);
            }
        }
    }

    /// One decision cycle over the prefixes touched since the last one
    /// (RFC 4271 section 9.1.2). Loc-RIB changes flow straight into the
    /// per-peer advertisement pipeline.
    fn run_decision_process(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let dirty: Vec<Prefix> = self.dirty.drain().collect();
        let mut changed: Vec<Prefix> = Vec::new();
        for prefix in dirty {
            let mut candidates: Vec<Arc<Route>> = Vec::new();
            if let Some(local) = self.local_routes.get(&prefix) {
                candidates.push(Arc::clone(local));
            }
            for session in self.manager.sessions() {
                if !session.is_established() {
                    continue;
                }
                if let Some(route) = session.rib_in.get(prefix) {
                    if let Some(route) = self.hooks.import(session.key(), Arc::clone(route)) {
                        candidates.push(route);
                    }
                }
            }

            let best = self.selector.select_best(&candidates).cloned();
            let current = self.loc_rib.lookup(prefix).cloned();
            match (current, best) {
                (Some(_), None) => {
                    self.loc_rib.remove(prefix);
                    self.hooks.remove_route(prefix);
                    debug!("Removed {} from Loc-RIB", prefix);
                    changed.push(prefix);
                }
                (None, Some(best)) => {
                    self.hooks.install_route(prefix, best.attributes.next_hop);
                    debug!("Installed new best path for {}: {}", prefix, best);
                    self.loc_rib.install(best);
                    changed.push(prefix);
                }
                (Some(current), Some(best)) => {
                    if current != best {
                        self.hooks.install_route(prefix, best.attributes.next_hop);
                        info!("Best path changed for {}: {}", prefix, best);
                        self.loc_rib.install(best);
                        changed.push(prefix);
                    }
                }
                (None, None) => (),
            }
        }
        if !changed.is_empty() {
            debug!("Decision process: {} prefixes changed", changed.len());
            self.advertise_prefixes(&changed);
        }
    }

    /// Queue the delta for `changed` on every Established session
    fn advertise_prefixes(&mut self, changed: &[Prefix]) {
        let routes: Vec<(Prefix, Option<Arc<Route>>)> = changed
            .iter()
            .map(|prefix| (*prefix, self.loc_rib.lookup(*prefix).cloned()))
            .collect();
        let hooks = self.hooks.clone();
        for session in self.manager.sessions_mut() {
            if !session.is_established() {
                continue;
            }
            enqueue_delta(&hooks, session, &routes);
        }
    }

    /// Dump the full Loc-RIB to a newly-Established peer
    fn advertise_full_rib(&mut self, key: &PeerKey) {
        let routes: Vec<(Prefix, Option<Arc<Route>>)> = self
            .loc_rib
            .routes()
            .map(|route| (route.prefix, Some(Arc::clone(route))))
            .collect();
        let hooks = self.hooks.clone();
        if let Some(session) = self.manager.sessions_mut().find(|s| s.key() == key) {
            enqueue_delta(&hooks, session, &routes);
        }
    }

    /// Inject a locally-originated prefix (network statement
    /// equivalent); picked up as a Loc-RIB candidate next cycle
    pub fn originate(
        &mut self,
        prefix: Prefix,
        next_hop: Option<Ipv4Addr>,
        local_pref: Option<u32>,
        origin: Option<Origin>,
        med: Option<u32>,
    ) -> bool {
        let attributes = PathAttributes {
            origin: origin.unwrap_or(Origin::Igp),
            as_path: AsPath::default(),
            next_hop: Some(next_hop.unwrap_or(self.router_id)),
            local_pref: Some(local_pref.unwrap_or(100)),
            multi_exit_disc: med,
            others: vec![],
        };
        let route = Arc::new(Route {
            prefix,
            attributes: Arc::new(attributes),
            source: RouteSource::Local,
            timestamp: Utc::now(),
        });
        self.local_routes.insert(prefix, route);
        self.dirty.insert(prefix);
        info!("Originated local route: {}", prefix);
        true
    }

    pub fn withdraw(&mut self, prefix: Prefix) -> bool {
        if self.local_routes.remove(&prefix).is_some() {
            self.dirty.insert(prefix);
            info!("Withdrew local route: {}", prefix);
            true
        } else {
            false
        }
    }

    async fn handle_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::ShowPeers(reply) => {
                let _ = reply.send(self.peer_summaries());
            }
            ApiRequest::ShowRib(reply) => {
                let routes = self
                    .loc_rib
                    .routes()
                    .map(|route| LearnedRoute::from_route(route))
                    .collect();
                let _ = reply.send(routes);
            }
            ApiRequest::ShowRoutesLearned(reply) => {
                let routes = self
                    .manager
                    .sessions()
                    .flat_map(|session| session.rib_in.routes())
                    .map(LearnedRoute::from_route)
                    .collect();
                let _ = reply.send(routes);
            }
            ApiRequest::ShowRoutesAdvertised(reply) => {
                let routes = self
                    .manager
                    .sessions()
                    .flat_map(|session| session.rib_out.routes())
                    .map(LearnedRoute::from_route)
                    .collect();
                let _ = reply.send(routes);
            }
            ApiRequest::AdvertiseRoute { spec, reply } => {
                let result = match prefix_from_str(&spec.prefix) {
                    Ok(prefix) => {
                        let origin = spec
                            .origin
                            .as_deref()
                            .map(|o| o.parse().unwrap_or(Origin::Incomplete));
                        self.originate(prefix, spec.next_hop, spec.local_pref, origin, spec.med)
                    }
                    Err(err) => {
                        warn!("Rejected route spec: {}", err);
                        false
                    }
                };
                let _ = reply.send(result);
            }
            ApiRequest::WithdrawRoute { prefix, reply } => {
                let result = match prefix_from_str(&prefix) {
                    Ok(prefix) => self.withdraw(prefix),
                    Err(_) => false,
                };
                let _ = reply.send(result);
            }
            ApiRequest::AddPeer { spec, reply } => {
                let result = match self.peer_config_from_spec(spec) {
                    Ok(config) => self.manager.add_peer(config),
                    Err(err) => {
                        warn!("Rejected peer spec: {}", err);
                        false
                    }
                };
                let _ = reply.send(result);
            }
            ApiRequest::RemovePeer { key, reply } => {
                let key = parse_peer_key(&key);
                let result = match self.manager.remove_peer(&key).await {
                    Some(flushed) => {
                        self.dirty.extend(flushed);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(result);
            }
            ApiRequest::StartPeer { key, reply } => {
                let key = parse_peer_key(&key);
                let _ = reply.send(self.manager.start_peer(&key));
            }
            ApiRequest::StopPeer { key, reply } => {
                let key = parse_peer_key(&key);
                let result = match self.manager.stop_peer(&key).await {
                    Some(flushed) => {
                        self.dirty.extend(flushed);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(result);
            }
            ApiRequest::Statistics(reply) => {
                let _ = reply.send(self.statistics());
            }
        }
    }

    fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.manager
            .sessions()
            .map(|session| {
                let config = session.config();
                PeerSummary {
                    peer: session.key().to_string(),
                    enabled: config.enabled,
                    router_id: session.remote_router_id().map(IpAddr::from),
                    remote_asn: config.remote_as,
                    local_asn: config.local_as,
                    msg_received: Some(session.counts.received()),
                    msg_sent: Some(session.counts.sent()),
                    uptime: session.established_time().map(format_time_as_elapsed),
                    state: session.state().to_string(),
                    prefixes_received: Some(session.rib_in.len() as u64),
                    prefixes_sent: Some(session.rib_out.len() as u64),
                    last_notification: session
                        .last_notification
                        .as_ref()
                        .map(|n| n.to_string()),
                }
            })
            .collect()
    }

    fn statistics(&self) -> Statistics {
        let mut counts = MessageCounts::new();
        let mut established = 0usize;
        for session in self.manager.sessions() {
            counts.merge(&session.counts);
            if session.is_established() {
                established += 1;
            }
        }
        Statistics {
            local_as: self.default_as,
            router_id: self.router_id.to_string(),
            total_peers: self.manager.sessions().count(),
            established_peers: established,
            loc_rib_routes: self.loc_rib.len(),
            counts,
        }
    }

    fn peer_config_from_spec(&self, spec: PeerSpec) -> Result<Arc<PeerConfig>, String> {
        let remote_host = match (&spec.remote_ip, &spec.hostname) {
            (Some(network), _) => RemoteHost::Network(*network),
            (None, Some(name)) => RemoteHost::Hostname(name.clone()),
            (None, None) if spec.accept_any_source => RemoteHost::Any,
            (None, None) => {
                return Err(format!(
                    "Peer AS{} has neither remote_ip nor hostname",
                    spec.remote_as
                ));
            }
        };
        Ok(Arc::new(PeerConfig {
            remote_host,
            remote_as: spec.remote_as,
            local_as: spec.local_as.unwrap_or(self.default_as),
            local_router_id: self.router_id,
            local_addr: spec.local_addr,
            enabled: true,
            passive: spec.passive || spec.accept_any_source,
            accept_any_source: spec.accept_any_source,
            route_reflector_client: spec.route_reflector_client,
            hold_timer: spec.hold_timer,
            connect_retry: spec.connect_retry,
            dest_port: spec.dest_port,
        }))
    }
}

/// "mesh-as65002" / address / hostname
fn parse_peer_key(value: &str) -> PeerKey {
    if let Some(asn) = value
        .strip_prefix("mesh-as")
        .and_then(|asn| asn.parse::<u32>().ok())
    {
        return PeerKey::MeshAs(asn);
    }
    match value.parse::<IpAddr>() {
        Ok(addr) => PeerKey::Address(addr),
        Err(_) => PeerKey::Hostname(value.to_string()),
    }
}

/// Compute and queue the announce/withdraw delta for one session,
/// batching announced prefixes that share an attribute set
fn enqueue_delta(hooks: &Hooks, session: &mut Session, routes: &[(Prefix, Option<Arc<Route>>)]) {
    let mut groups: HashMap<u64, Vec<Arc<Route>>> = HashMap::new();
    let mut withdraw: Vec<Prefix> = Vec::new();
    for (prefix, route) in routes {
        let exported = route
            .as_ref()
            .and_then(|route| prepare_export(hooks, route, session));
        match exported {
            Some(exported) => {
                // Unchanged from what this peer already has
                if let Some(current) = session.rib_out.get(*prefix) {
                    if current.attributes == exported.attributes {
                        continue;
                    }
                }
                groups
                    .entry(exported.attributes.cache_key())
                    .or_insert_with(Vec::new)
                    .push(exported);
            }
            None => {
                if session.rib_out.contains(*prefix) {
                    withdraw.push(*prefix);
                }
            }
        }
    }
    for (_, announce) in groups {
        session.enqueue(OutboundUpdate {
            announce,
            withdraw: Vec::new(),
        });
    }
    if !withdraw.is_empty() {
        session.enqueue(OutboundUpdate {
            announce: Vec::new(),
            withdraw,
        });
    }
}

/// Advertisement policy for one route toward one peer. Returns the
/// route with its outgoing attribute set, or None to suppress.
fn prepare_export(hooks: &Hooks, route: &Arc<Route>, session: &Session) -> Option<Arc<Route>> {
    let config = session.config();
    if let Some(info) = route.learned_from() {
        // Split horizon: never advertise a peer's routes back to it
        if &info.key == session.key() {
            return None;
        }
        // iBGP-learned routes reach iBGP peers only through a reflector
        let route_is_ibgp = info.remote_as == config.local_as;
        if route_is_ibgp
            && !config.is_ebgp()
            && !hooks.should_reflect(route, &info.key, session.key(), !route_is_ibgp)
        {
            return None;
        }
    }
    let route = hooks.export(session.key(), Arc::clone(route))?;

    let mut attributes = (*route.attributes).clone();
    // NEXT_HOP becomes our side of the outgoing session
    let next_hop = session
        .local_addr()
        .and_then(|addr| match addr {
            IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
            _ => None,
        })
        .unwrap_or(config.local_router_id);
    attributes.next_hop = Some(next_hop);

    if config.is_ebgp() {
        attributes.as_path.prepend(config.local_as);
        attributes.local_pref = None;
    } else {
        attributes.local_pref = Some(attributes.local_pref.unwrap_or(100));
    }

    // Redistributed unknown transitive attributes carry the partial bit
    if !route.is_local() {
        for attribute in attributes.others.iter_mut() {
            if let PathAttribute::Unknown {
                flags: attr_flags, ..
            } = attribute
            {
                if *attr_flags & flags::OPTIONAL != 0 && *attr_flags & flags::TRANSITIVE != 0 {
                    *attr_flags |= flags::PARTIAL;
                }
            }
        }
    }

    Some(Arc::new(Route {
        prefix: route.prefix,
        attributes: Arc::new(attributes),
        source: route.source.clone(),
        timestamp: route.timestamp,
    }))
}

/// Bind the listener (active-only mode when the bind fails), start the
/// control API, and run the agent until ctrl-c.
pub async fn serve(config: ServerConfig, hooks: Hooks) -> io::Result<()> {
    let socket = SocketAddr::new(config.listen_addr, config.port);
    let listener = match TcpListener::bind(socket).await {
        Ok(listener) => {
            info!("Listening for BGP connections on {}", socket);
            Some(listener)
        }
        Err(err) => {
            warn!(
                "Failed to bind {}: {}; continuing in active-only mode",
                socket, err
            );
            None
        }
    };

    let (api_tx, api_rx) = mpsc::unbounded_channel();
    // Dropping the handle stops the server; hold it for the lifetime
    // of the agent
    let _api_server = match config.api_addr {
        Some(api_addr) => match api::serve(api_addr, api_tx).await {
            Ok(handle) => {
                info!("Control API listening on {}", api_addr);
                Some(handle)
            }
            Err(err) => {
                warn!("Failed to start control API on {}: {}", api_addr, err);
                None
            }
        },
        None => None,
    };

    let mut agent = Agent::new(&config, listener, api_rx);
    agent.set_hooks(hooks);
    agent.start();
    agent.run().await
}
