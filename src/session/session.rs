use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;

use super::codec::{MessageCodec, MessageProtocol};
use super::{HoldTimer, MessageCounts, SessionError, SessionUpdate};
use crate::config::{PeerConfig, PeerKey};
use crate::fsm::{Action, Event, Fsm, State};
use crate::message::{
    error_code, open_error, update_error, Capability, Message, Notification, Open, OpenParameter,
    Prefix, Update,
};
use crate::rib::{AdjRibIn, AdjRibOut, PathAttributes, PeerInfo, Route, RouteSource};
use crate::utils::{as_u32_be, format_time_as_elapsed};

/// Hold timer to run between connection setup and OPEN negotiation
const INITIAL_HOLD_TIME: u16 = 240;

/// One batch of routes for the wire; all announced routes share a
/// single attribute set
#[derive(Debug)]
pub struct OutboundUpdate {
    pub announce: Vec<Arc<Route>>,
    pub withdraw: Vec<Prefix>,
}

impl OutboundUpdate {
    fn to_message(&self) -> Message {
        let attributes = self
            .announce
            .first()
            .map(|route| route.attributes.to_wire())
            .unwrap_or_default();
        Message::Update(Update {
            withdrawn_routes: self.withdraw.clone(),
            attributes,
            announced_routes: self.announce.iter().map(|route| route.prefix).collect(),
        })
    }
}

/// This is where one configured peer is managed: the TCP connection
/// (when there is one), the FSM instance, the per-peer Adj-RIBs, and
/// the outbound queue filled by the agent's export pipeline.
///
/// The session object lives for as long as the peer is configured;
/// connections come and go underneath it.
pub struct Session {
    pub(crate) key: PeerKey,
    pub(crate) config: Arc<PeerConfig>,
    fsm: Fsm,
    protocol: Option<MessageProtocol>,
    locally_initiated: bool,
    /// A mesh-identified connection arrives with its OPEN already read;
    /// the session consumes it in lieu of reading its own
    primed_open: Option<Open>,
    hold_timer: HoldTimer,
    negotiated_hold_time: u16,
    four_byte_asn: bool,
    remote_router_id: Option<Ipv4Addr>,
    remote_addr: Option<IpAddr>,
    local_addr: Option<IpAddr>,
    connect_time: Option<DateTime<Utc>>,
    established_time: Option<DateTime<Utc>>,
    pub(crate) counts: MessageCounts,
    pub(crate) rib_in: AdjRibIn,
    pub(crate) rib_out: AdjRibOut,
    outbound: VecDeque<OutboundUpdate>,
    pub(crate) last_notification: Option<Notification>,
}

impl Session {
    pub fn new(config: Arc<PeerConfig>) -> Session {
        Session {
            key: config.key(),
            config,
            fsm: Fsm::new(),
            protocol: None,
            locally_initiated: false,
            primed_open: None,
            hold_timer: HoldTimer::new(INITIAL_HOLD_TIME),
            negotiated_hold_time: INITIAL_HOLD_TIME,
            four_byte_asn: false,
            remote_router_id: None,
            remote_addr: None,
            local_addr: None,
            connect_time: None,
            established_time: None,
            counts: MessageCounts::new(),
            rib_in: AdjRibIn::new(),
            rib_out: AdjRibOut::new(),
            outbound: VecDeque::new(),
            last_notification: None,
        }
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn config(&self) -> &Arc<PeerConfig> {
        &self.config
    }

    pub fn state(&self) -> State {
        self.fsm.state()
    }

    pub fn is_established(&self) -> bool {
        self.fsm.state() == State::Established
    }

    pub fn is_connected(&self) -> bool {
        self.protocol.is_some()
    }

    /// Did the local side initiate the current connection
    pub fn is_locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    /// The peer's BGP Identifier, once an OPEN has been seen
    pub fn remote_identifier(&self) -> Option<u32> {
        self.remote_router_id.map(|id| as_u32_be(id.octets()))
    }

    pub fn remote_router_id(&self) -> Option<Ipv4Addr> {
        self.remote_router_id
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    /// Address of our end of the TCP connection; used for the
    /// NEXT_HOP rewrite on export
    pub fn local_addr(&self) -> Option<IpAddr> {
        self.local_addr.or(self.config.local_addr)
    }

    pub fn established_time(&self) -> Option<DateTime<Utc>> {
        self.established_time
    }

    pub fn update_config(&mut self, new_config: Arc<PeerConfig>) {
        debug!("Peer config for {} updated", self.key);
        self.config = new_config;
    }

    /// Kick the FSM out of Idle. The poller drives the actual
    /// outbound connect.
    pub fn start(&mut self) {
        if self.fsm.state() == State::Idle {
            let passive = !self.config.connects_out();
            self.fsm.handle(Event::ManualStart { passive });
            debug!("{} started in state {}", self.key, self.fsm.state());
        }
    }

    /// ManualStop: returns the Cease to send before closing
    pub fn manual_stop(&mut self) -> Option<Notification> {
        let connected = self.is_connected();
        let actions = self.fsm.handle(Event::ManualStop);
        if !connected {
            return None;
        }
        actions.into_iter().find_map(|action| match action {
            Action::SendNotification(code, subcode) => {
                Some(Notification::new(code, subcode, vec![]))
            }
            _ => None,
        })
    }

    /// An outbound connect attempt failed; drops Connect back to Active
    pub fn connect_failed(&mut self) {
        self.fsm.handle(Event::TcpConnectionFails);
    }

    /// Take ownership of a fresh TCP connection and send our OPEN
    pub async fn attach(
        &mut self,
        stream: TcpStream,
        locally_initiated: bool,
        primed_open: Option<Open>,
    ) -> Result<(), SessionError> {
        self.remote_addr = stream.peer_addr().ok().map(|addr| addr.ip());
        self.local_addr = stream.local_addr().ok().map(|addr| addr.ip());
        self.protocol = Some(Framed::new(stream, MessageCodec::new()));
        self.locally_initiated = locally_initiated;
        self.primed_open = primed_open;
        self.connect_time = Some(Utc::now());
        self.negotiated_hold_time = INITIAL_HOLD_TIME;
        if self.fsm.state() == State::Idle {
            self.fsm.handle(Event::ManualStart { passive: true });
        }
        let actions = self.fsm.handle(Event::TcpConnectionConfirmed);
        self.execute(actions).await.map(|_| ())
    }

    /// Drop the connection and all state learned over it; returns the
    /// flushed Adj-RIB-In prefixes for the next decision pass
    pub fn detach(&mut self) -> Vec<Prefix> {
        self.protocol = None;
        self.primed_open = None;
        self.outbound.clear();
        self.rib_out.flush();
        self.remote_router_id = None;
        self.connect_time = None;
        self.established_time = None;
        self.four_byte_asn = false;
        self.fsm.reset();
        self.rib_in.flush()
    }

    /// Walk the FSM to Established without a socket (test harness for
    /// the decision process and export pipeline)
    #[cfg(test)]
    pub(crate) fn force_established(&mut self) {
        self.fsm.handle(Event::ManualStart { passive: true });
        self.fsm.handle(Event::TcpConnectionConfirmed);
        self.fsm.handle(Event::OpenReceived);
        self.fsm.handle(Event::KeepaliveReceived);
    }

    /// Queue routes for the next Established flush
    pub fn enqueue(&mut self, update: OutboundUpdate) {
        if update.announce.is_empty() && update.withdraw.is_empty() {
            return;
        }
        self.outbound.push_back(update);
    }

    /// Main function for making progress with the session.
    /// Waits briefly for an incoming message, then services timers and
    /// the outbound queue.
    pub async fn run(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        if !self.config.enabled {
            return Err(SessionError::Deconfigured);
        }
        if self.protocol.is_none() {
            return Ok(None);
        }

        if let Some(open) = self.primed_open.take() {
            self.counts.record_received(&Message::Open(open.clone()));
            if let Some(event) = self.handle_message(Message::Open(open)).await? {
                return Ok(Some(event));
            }
        }

        let protocol = self.protocol.as_mut().expect("Session has connection");
        match timeout(Duration::from_millis(250), protocol.next()).await {
            // Framed stream is exhausted, remote side closed connection
            Ok(None) => {
                return Err(SessionError::Transport(format!(
                    "Session ended with {}",
                    self.key
                )));
            }
            Ok(Some(Ok(message))) => {
                trace!("[{}] Incoming: {}", self.key, message.kind());
                self.counts.record_received(&message);
                self.hold_timer.received();
                if let Some(event) = self.handle_message(message).await? {
                    return Ok(Some(event));
                }
            }
            // Decode error; the embedded notification goes out before
            // the manager closes the connection
            Ok(Some(Err(err))) => {
                warn!("[{}] Decode error: {}", self.key, err);
                return Err(err.into());
            }
            // Timeout waiting for a message; fall through to timers
            _ => (),
        }

        let state = self.fsm.state();
        if state.is_connected() {
            trace!("Hold time on {}: {}", self.key, self.hold_timer);
            let keepalive_due = self.hold_timer.should_send_keepalive().await?;
            if keepalive_due && matches!(state, State::OpenConfirm | State::Established) {
                self.send_message(Message::KeepAlive).await?;
            }
        }

        if state == State::Established && !self.outbound.is_empty() {
            self.flush_outbound().await?;
        }
        Ok(None)
    }

    async fn handle_message(
        &mut self,
        message: Message,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        match message {
            Message::Open(open) => {
                debug!(
                    "[{}] Received OPEN [AS{} id {} hold {}]",
                    self.key,
                    open.asn(),
                    open.router_id(),
                    open.hold_time
                );
                self.open_received(&open)?;
                let actions = self.fsm.handle(Event::OpenReceived);
                self.execute(actions).await
            }
            Message::KeepAlive => {
                let actions = self.fsm.handle(Event::KeepaliveReceived);
                self.execute(actions).await
            }
            Message::Update(update) => {
                let actions = self.fsm.handle(Event::UpdateReceived);
                for action in &actions {
                    if let Action::SendNotification(code, subcode) = action {
                        return Err(SessionError::Notification(Notification::new(
                            *code,
                            *subcode,
                            vec![],
                        )));
                    }
                }
                self.apply_update(update)
            }
            Message::Notification(notification) => {
                warn!("[{}] NOTIFICATION: {}", self.key, notification);
                self.last_notification = Some(notification.clone());
                self.fsm.handle(Event::NotificationReceived);
                Err(SessionError::PeerNotification(notification))
            }
        }
    }

    async fn execute(
        &mut self,
        actions: Vec<Action>,
    ) -> Result<Option<SessionUpdate>, SessionError> {
        let mut output: Option<SessionUpdate> = None;
        for action in actions {
            match action {
                Action::SendOpen => {
                    let open = self.create_open();
                    self.send_message(Message::Open(open)).await?;
                }
                Action::SendKeepalive => {
                    self.send_message(Message::KeepAlive).await?;
                }
                Action::SendNotification(code, subcode) => {
                    return Err(SessionError::Notification(Notification::new(
                        code,
                        subcode,
                        vec![],
                    )));
                }
                Action::StartHoldTimer => {
                    self.hold_timer = HoldTimer::new(self.negotiated_hold_time);
                }
                Action::SignalEstablished => {
                    self.established_time = Some(Utc::now());
                    output = Some(SessionUpdate::Established(self.key.clone()));
                }
                // The poller owns connects and retries; teardown is
                // driven by the manager when we return Err
                Action::InitiateConnect | Action::ScheduleRetry | Action::TearDown => (),
                Action::ProcessUpdate => (),
            }
        }
        Ok(output)
    }

    /// Validate a received OPEN and negotiate session parameters
    fn open_received(&mut self, open: &Open) -> Result<(), SessionError> {
        let remote_asn = open.asn();
        if remote_asn != self.config.remote_as {
            return Err(SessionError::OpenAsnMismatch(
                remote_asn,
                self.config.remote_as,
            ));
        }
        if open.hold_time != 0 && open.hold_time < 3 {
            return Err(SessionError::Notification(Notification::new(
                error_code::OPEN_MESSAGE,
                open_error::UNACCEPTABLE_HOLD_TIME,
                open.hold_time.to_be_bytes().to_vec(),
            )));
        }
        self.negotiated_hold_time = cmp::min(open.hold_time, self.config.hold_timer);
        self.four_byte_asn = open.supports_four_byte_asn();
        if let Some(protocol) = self.protocol.as_mut() {
            protocol.codec_mut().set_four_byte_asn(self.four_byte_asn);
        }
        self.remote_router_id = Some(open.router_id());
        Ok(())
    }

    pub fn create_open(&self) -> Open {
        let two_byte_asn = if self.config.local_as < 65535 {
            self.config.local_as as u16
        } else {
            // AS-TRANS: RFC 6793 [4.2.3.9]
            23456
        };
        Open {
            version: 4,
            my_as: two_byte_asn,
            hold_time: self.config.hold_timer,
            identifier: as_u32_be(self.config.local_router_id.octets()),
            parameters: vec![OpenParameter::Capabilities(vec![
                Capability::MultiProtocol(1, 1),
                Capability::FourByteAsn(self.config.local_as),
            ])],
        }
    }

    /// Apply a received UPDATE to this peer's Adj-RIB-In
    fn apply_update(&mut self, update: Update) -> Result<Option<SessionUpdate>, SessionError> {
        if let Some(missing) = update.missing_well_known() {
            return Err(SessionError::Notification(Notification::new(
                error_code::UPDATE_MESSAGE,
                update_error::MISSING_WELL_KNOWN_ATTRIBUTE,
                vec![missing],
            )));
        }
        if update.is_end_of_rib() {
            debug!("[{}] End-of-RIB received", self.key);
            return Ok(None);
        }

        let mut touched: Vec<Prefix> = Vec::with_capacity(
            update.withdrawn_routes.len() + update.announced_routes.len(),
        );
        for prefix in &update.withdrawn_routes {
            if self.rib_in.withdraw(*prefix).is_some() {
                touched.push(*prefix);
            }
        }

        if !update.announced_routes.is_empty() {
            let attributes = Arc::new(PathAttributes::from_attributes(update.attributes));
            let info = PeerInfo {
                key: self.key.clone(),
                router_id: self.remote_router_id.unwrap_or(Ipv4Addr::UNSPECIFIED),
                address: self
                    .remote_addr
                    .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0])),
                remote_as: self.config.remote_as,
            };
            for prefix in update.announced_routes {
                self.rib_in.insert(Arc::new(Route {
                    prefix,
                    attributes: attributes.clone(),
                    source: RouteSource::Peer(info.clone()),
                    timestamp: Utc::now(),
                }));
                touched.push(prefix);
            }
        }

        if touched.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionUpdate::Learned {
            key: self.key.clone(),
            touched,
        }))
    }

    // Send a message, and flush the send buffer afterwards
    pub async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        let protocol = self
            .protocol
            .as_mut()
            .ok_or_else(|| SessionError::Transport("No active connection".to_string()))?;
        trace!("[{}] Outgoing: {}", self.key, message.kind());
        let counted = message.clone();
        protocol
            .send(message)
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))?;
        self.counts.record_sent(&counted);
        self.hold_timer.sent();
        Ok(())
    }

    /// Drain the outbound queue, tracking what was actually sent in
    /// Adj-RIB-Out
    async fn flush_outbound(&mut self) -> Result<(), SessionError> {
        while let Some(update) = self.outbound.pop_front() {
            let message = update.to_message();
            self.send_message(message).await?;
            for route in &update.announce {
                self.rib_out.insert(route.clone());
            }
            for prefix in &update.withdraw {
                self.rib_out.withdraw(*prefix);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} state={} uptime={} hold_time={}>",
            self.key,
            self.fsm.state(),
            self.connect_time
                .map(format_time_as_elapsed)
                .unwrap_or_else(|| "--:--:--".to_string()),
            self.hold_timer,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteHost;
    use crate::message::{AsPath, Origin};
    use ipnetwork::IpNetwork;

    fn test_config(remote_as: u32, local_as: u32) -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            remote_host: RemoteHost::Network(
                "172.16.0.1/32".parse::<IpNetwork>().unwrap(),
            ),
            remote_as,
            local_as,
            local_router_id: "4.4.4.4".parse().unwrap(),
            local_addr: Some("172.16.0.2".parse().unwrap()),
            enabled: true,
            passive: false,
            accept_any_source: false,
            route_reflector_client: false,
            hold_timer: 90,
            connect_retry: 120,
            dest_port: 179,
        })
    }

    fn remote_open(asn: u32, hold_time: u16) -> Open {
        Open {
            version: 4,
            my_as: asn as u16,
            hold_time,
            identifier: as_u32_be([9, 9, 9, 9]),
            parameters: vec![OpenParameter::Capabilities(vec![Capability::FourByteAsn(
                asn,
            )])],
        }
    }

    #[tokio::test]
    async fn test_create_open() {
        let session = Session::new(test_config(65000, 65001));
        let open = session.create_open();
        assert_eq!(open.version, 4);
        assert_eq!(open.my_as, 65001);
        assert_eq!(open.hold_time, 90);
        assert_eq!(open.asn(), 65001);
        assert_eq!(open.router_id(), "4.4.4.4".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_create_open_as_trans() {
        let session = Session::new(test_config(65000, 4_200_000_000));
        let open = session.create_open();
        assert_eq!(open.my_as, 23456);
        assert_eq!(open.asn(), 4_200_000_000);
    }

    #[tokio::test]
    async fn test_open_received_negotiates() {
        let mut session = Session::new(test_config(65000, 65001));
        session.open_received(&remote_open(65000, 30)).unwrap();
        assert_eq!(session.negotiated_hold_time, 30);
        assert!(session.four_byte_asn);
        assert_eq!(session.remote_identifier(), Some(as_u32_be([9, 9, 9, 9])));
    }

    #[tokio::test]
    async fn test_open_received_asn_mismatch() {
        let mut session = Session::new(test_config(65000, 65001));
        match session.open_received(&remote_open(65099, 90)) {
            Err(SessionError::OpenAsnMismatch(received, expected)) => {
                assert_eq!(received, 65099);
                assert_eq!(expected, 65000);
            }
            other => panic!("Expected ASN mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_received_unacceptable_hold_time() {
        let mut session = Session::new(test_config(65000, 65001));
        match session.open_received(&remote_open(65000, 2)) {
            Err(SessionError::Notification(notification)) => {
                assert_eq!(notification.code, error_code::OPEN_MESSAGE);
                assert_eq!(notification.subcode, open_error::UNACCEPTABLE_HOLD_TIME);
            }
            other => panic!("Expected notification, got {:?}", other),
        }
        // Hold time 0 disables the timer instead
        session.open_received(&remote_open(65000, 0)).unwrap();
        assert_eq!(session.negotiated_hold_time, 0);
    }

    #[tokio::test]
    async fn test_apply_update_populates_rib_in() {
        let mut session = Session::new(test_config(65000, 65001));
        session.remote_router_id = Some("9.9.9.9".parse().unwrap());
        session.remote_addr = Some("172.16.0.1".parse().unwrap());

        let update = Update {
            withdrawn_routes: vec![],
            attributes: vec![
                crate::message::PathAttribute::Origin(Origin::Igp),
                crate::message::PathAttribute::AsPath(AsPath::from_sequence(vec![65000])),
                crate::message::PathAttribute::NextHop("172.16.0.1".parse().unwrap()),
            ],
            announced_routes: vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)],
        };
        let result = session.apply_update(update).unwrap();
        match result {
            Some(SessionUpdate::Learned { touched, .. }) => {
                assert_eq!(touched, vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)]);
            }
            other => panic!("Expected Learned, got {:?}", other),
        }
        assert_eq!(session.rib_in.len(), 1);

        // Withdraw removes it again
        let withdraw = Update {
            withdrawn_routes: vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)],
            ..Update::default()
        };
        session.apply_update(withdraw).unwrap();
        assert!(session.rib_in.is_empty());
    }

    #[tokio::test]
    async fn test_apply_update_missing_well_known() {
        let mut session = Session::new(test_config(65000, 65001));
        let update = Update {
            withdrawn_routes: vec![],
            attributes: vec![crate::message::PathAttribute::Origin(Origin::Igp)],
            announced_routes: vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)],
        };
        match session.apply_update(update) {
            Err(SessionError::Notification(notification)) => {
                assert_eq!(notification.code, error_code::UPDATE_MESSAGE);
                assert_eq!(
                    notification.subcode,
                    update_error::MISSING_WELL_KNOWN_ATTRIBUTE
                );
                assert_eq!(notification.data, vec![2]); // AS_PATH
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_manual_stop_returns_cease_only_when_connected() {
        let mut session = Session::new(test_config(65000, 65001));
        session.start();
        assert_eq!(session.state(), State::Connect);
        // Not connected: quiet stop
        assert!(session.manual_stop().is_none());
        assert_eq!(session.state(), State::Idle);
    }
}
