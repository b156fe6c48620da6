mod codec;
mod hold_timer;
mod manager;
mod message_counts;
mod poller;
mod session;

use std::error;
use std::fmt;
use std::io;

pub use codec::{MessageCodec, MessageProtocol};
pub use hold_timer::HoldTimer;
pub use manager::SessionManager;
pub use message_counts::MessageCounts;
pub use poller::{Poller, PollerEvent, PollerTx};
pub use session::{OutboundUpdate, Session};

use crate::config::PeerKey;
use crate::message::{cease, error_code, open_error, MessageError, Notification, Prefix};

/// What a session run produced for the agent
#[derive(Debug)]
pub enum SessionUpdate {
    /// A peer's Adj-RIB-In changed; these prefixes need a decision pass
    Learned { key: PeerKey, touched: Vec<Prefix> },
    /// Session reached Established; the agent dumps the Loc-RIB to it
    Established(PeerKey),
    /// Sessions ended; their flushed prefixes need a decision pass
    Ended {
        keys: Vec<PeerKey>,
        flushed: Vec<Prefix>,
    },
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer de-configured or disabled
    Deconfigured,
    /// Received an unexpected ASN. [received, expected]
    OpenAsnMismatch(u32, u32),
    /// Hold time expired. [interval]
    HoldTimeExpired(u16),
    /// Session must send this NOTIFICATION and tear down
    Notification(Notification),
    /// Peer sent us a NOTIFICATION; tear down without replying
    PeerNotification(Notification),
    /// Something happened in transport. [reason]
    Transport(String),
    /// Some other issue happened. [reason]
    Other(String),
}

impl SessionError {
    /// The NOTIFICATION to send (with a bounded flush) before the
    /// manager closes the connection; `None` closes silently
    pub fn notification(&self) -> Option<Notification> {
        match self {
            SessionError::Deconfigured => Some(Notification::new(
                error_code::CEASE,
                cease::PEER_DECONFIGURED,
                vec![],
            )),
            SessionError::OpenAsnMismatch(_, _) => Some(Notification::new(
                error_code::OPEN_MESSAGE,
                open_error::BAD_PEER_AS,
                vec![],
            )),
            SessionError::HoldTimeExpired(_) => Some(Notification::new(
                error_code::HOLD_TIMER_EXPIRED,
                0,
                vec![],
            )),
            SessionError::Notification(notification) => Some(notification.clone()),
            SessionError::PeerNotification(_) => None,
            SessionError::Transport(_) => None,
            SessionError::Other(_) => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer De-configured")?,
            OpenAsnMismatch(r, e) => {
                write!(f, "Open ASN Mismatch (received={}, expected={})", r, e)?;
            }
            HoldTimeExpired(h) => write!(f, "Hold time expired after {} seconds", h)?,
            Notification(n) => write!(f, "{}", n)?,
            PeerNotification(n) => write!(f, "Peer sent {}", n)?,
            Transport(r) => write!(f, "Transport error [{}]", r)?,
            Other(r) => write!(f, "{}", r)?,
        }
        Ok(())
    }
}

impl error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::Transport(error.to_string())
    }
}

impl From<MessageError> for SessionError {
    fn from(error: MessageError) -> Self {
        match error {
            MessageError::Io(err) => SessionError::Transport(err.to_string()),
            other => SessionError::Notification(other.notification()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_notifications() {
        let err = SessionError::OpenAsnMismatch(65002, 65000);
        let notif = err.notification().unwrap();
        assert_eq!((notif.code, notif.subcode), (2, 2));

        let err = SessionError::HoldTimeExpired(30);
        let notif = err.notification().unwrap();
        assert_eq!((notif.code, notif.subcode), (4, 0));

        // Receiving a notification never triggers sending one
        let err = SessionError::PeerNotification(Notification::new(6, 2, vec![]));
        assert!(err.notification().is_none());

        let err = SessionError::Transport("connection reset".into());
        assert!(err.notification().is_none());
    }
}
