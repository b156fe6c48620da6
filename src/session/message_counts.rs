use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Per-kind, per-direction message counters for one session
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct MessageCounts {
    pub open_sent: u64,
    pub open_received: u64,
    pub update_sent: u64,
    pub update_received: u64,
    pub keepalive_sent: u64,
    pub keepalive_received: u64,
    pub notification_sent: u64,
    pub notification_received: u64,
}

impl MessageCounts {
    pub fn new() -> Self {
        MessageCounts::default()
    }

    pub fn record_sent(&mut self, message: &Message) {
        match message {
            Message::Open(_) => self.open_sent += 1,
            Message::Update(_) => self.update_sent += 1,
            Message::KeepAlive => self.keepalive_sent += 1,
            Message::Notification(_) => self.notification_sent += 1,
        }
    }

    pub fn record_received(&mut self, message: &Message) {
        match message {
            Message::Open(_) => self.open_received += 1,
            Message::Update(_) => self.update_received += 1,
            Message::KeepAlive => self.keepalive_received += 1,
            Message::Notification(_) => self.notification_received += 1,
        }
    }

    pub fn sent(&self) -> u64 {
        self.open_sent + self.update_sent + self.keepalive_sent + self.notification_sent
    }

    pub fn received(&self) -> u64 {
        self.open_received + self.update_received + self.keepalive_received
            + self.notification_received
    }

    /// Fold another session's counters into this one (for the
    /// aggregate statistics API)
    pub fn merge(&mut self, other: &MessageCounts) {
        self.open_sent += other.open_sent;
        self.open_received += other.open_received;
        self.update_sent += other.update_sent;
        self.update_received += other.update_received;
        self.keepalive_sent += other.keepalive_sent;
        self.keepalive_received += other.keepalive_received;
        self.notification_sent += other.notification_sent;
        self.notification_received += other.notification_received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut counts = MessageCounts::new();
        counts.record_sent(&Message::KeepAlive);
        counts.record_sent(&Message::KeepAlive);
        counts.record_received(&Message::KeepAlive);
        assert_eq!(counts.keepalive_sent, 2);
        assert_eq!(counts.sent(), 2);
        assert_eq!(counts.received(), 1);

        let mut total = MessageCounts::new();
        total.merge(&counts);
        total.merge(&counts);
        assert_eq!(total.keepalive_sent, 4);
    }
}
