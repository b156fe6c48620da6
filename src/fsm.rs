//! Per-peer session state machine (RFC 4271 section 8, subset).
//!
//! The table lives in [`transition`]: a pure function from
//! (state, event) to the actions the session runtime must perform and
//! the next state. The runtime owns sockets and timers; the machine
//! only sequences them.

use std::fmt;

use crate::message::{cease, error_code};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl State {
    /// States in which a TCP connection is attached
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            State::OpenSent | State::OpenConfirm | State::Established
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            State::Idle => "Idle",
            State::Connect => "Connect",
            State::Active => "Active",
            State::OpenSent => "OpenSent",
            State::OpenConfirm => "OpenConfirm",
            State::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    ManualStart { passive: bool },
    ManualStop,
    ConnectRetryExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    TcpConnectionConfirmed,
    TcpConnectionFails,
    /// A validated OPEN was received (validation failures surface as
    /// `OpenMessageError` instead)
    OpenReceived,
    HeaderError(u8),
    OpenMessageError(u8),
    UpdateMessageError(u8),
    NotificationReceived,
    KeepaliveReceived,
    UpdateReceived,
    /// Collision resolution decided against this connection
    OpenCollisionDump,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue an outbound TCP connect (via the idle-peer poller)
    InitiateConnect,
    ScheduleRetry,
    SendOpen,
    SendKeepalive,
    SendNotification(u8, u8),
    /// (Re)arm the hold timer with the negotiated value
    StartHoldTimer,
    /// Close the socket, flush Adj-RIB-In, drop pending output
    TearDown,
    /// Entered Established; the agent dumps the Loc-RIB to this peer
    SignalEstablished,
    ProcessUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: State,
    pub actions: Vec<Action>,
}

impl Transition {
    fn to(next: State) -> Self {
        Self {
            next,
            actions: vec![],
        }
    }

    fn with(next: State, actions: Vec<Action>) -> Self {
        Self { next, actions }
    }
}

/// The transition table. Unexpected message events are FSM errors
/// (NOTIFICATION code 5 with the subcode for the current state).
pub fn transition(state: State, event: Event) -> Transition {
    use Action::*;
    use Event::*;
    use State::*;

    match (state, event) {
        (Idle, ManualStart { passive: false }) => Transition::with(Connect, vec![InitiateConnect]),
        (Idle, ManualStart { passive: true }) => Transition::to(Active),
        (Idle, _) => Transition::to(Idle),

        // An accepted inbound connection also lands here: both ends
        // send OPEN as soon as the transport is up
        (Connect, TcpConnectionConfirmed) | (Active, TcpConnectionConfirmed) => {
            Transition::with(OpenSent, vec![SendOpen, StartHoldTimer])
        }
        (Connect, ConnectRetryExpires) => Transition::with(Connect, vec![InitiateConnect]),
        (Connect, TcpConnectionFails) => Transition::with(Active, vec![ScheduleRetry]),
        (Active, ConnectRetryExpires) => Transition::with(Connect, vec![InitiateConnect]),
        (Active, TcpConnectionFails) => Transition::with(Active, vec![ScheduleRetry]),

        (OpenSent, OpenReceived) => {
            Transition::with(OpenConfirm, vec![SendKeepalive, StartHoldTimer])
        }
        (OpenSent, TcpConnectionFails) => {
            Transition::with(Active, vec![TearDown, ScheduleRetry])
        }

        (OpenConfirm, KeepaliveReceived) => {
            Transition::with(Established, vec![SendKeepalive, SignalEstablished])
        }

        (Established, UpdateReceived) => Transition::with(Established, vec![ProcessUpdate]),
        (Established, KeepaliveReceived) => Transition::to(Established),

        (OpenConfirm, HoldTimerExpires) | (Established, HoldTimerExpires) => Transition::with(
            Idle,
            vec![
                SendNotification(error_code::HOLD_TIMER_EXPIRED, 0),
                TearDown,
            ],
        ),
        (_, HoldTimerExpires) => Transition::with(Idle, vec![TearDown]),

        (OpenConfirm, KeepaliveTimerExpires) | (Established, KeepaliveTimerExpires) => {
            Transition::with(state, vec![SendKeepalive])
        }

        (OpenSent, OpenCollisionDump) | (OpenConfirm, OpenCollisionDump) => Transition::with(
            Idle,
            vec![
                SendNotification(error_code::CEASE, cease::CONNECTION_COLLISION_RESOLUTION),
                TearDown,
            ],
        ),

        (_, ManualStop) => Transition::with(
            Idle,
            vec![
                SendNotification(error_code::CEASE, cease::ADMINISTRATIVE_SHUTDOWN),
                TearDown,
            ],
        ),
        (_, NotificationReceived) => Transition::with(Idle, vec![TearDown]),
        (_, TcpConnectionFails) => Transition::with(Idle, vec![TearDown]),

        (_, HeaderError(subcode)) => Transition::with(
            Idle,
            vec![
                SendNotification(error_code::MESSAGE_HEADER, subcode),
                TearDown,
            ],
        ),
        (_, OpenMessageError(subcode)) => Transition::with(
            Idle,
            vec![SendNotification(error_code::OPEN_MESSAGE, subcode), TearDown],
        ),
        (_, UpdateMessageError(subcode)) => Transition::with(
            Idle,
            vec![
                SendNotification(error_code::UPDATE_MESSAGE, subcode),
                TearDown,
            ],
        ),

        // Stale timer pops outside their states are ignored
        (_, KeepaliveTimerExpires) | (_, ConnectRetryExpires) => Transition::to(state),

        // Anything else is a protocol violation for the current state
        (_, _) => Transition::with(
            Idle,
            vec![
                SendNotification(error_code::FSM, fsm_error_subcode(state)),
                TearDown,
            ],
        ),
    }
}

/// FSM error subcodes per RFC 6608
fn fsm_error_subcode(state: State) -> u8 {
    match state {
        State::OpenSent => 1,
        State::OpenConfirm => 2,
        State::Established => 3,
        _ => 0,
    }
}

/// Holds the current state and applies the table
#[derive(Debug)]
pub struct Fsm {
    state: State,
}

impl Fsm {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let Transition { next, actions } = transition(self.state, event);
        self.state = next;
        actions
    }

    /// Reset to Idle without running any actions (used after the
    /// runtime has already torn the connection down)
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
