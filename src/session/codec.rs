use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::message::{Header, Message, MessageError, HEADER_LENGTH};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// Framing layer: one BGP message per frame. ASN width is two bytes
/// until the OPEN exchange negotiates the 4-octet capability.
#[derive(Debug, Default)]
pub struct MessageCodec {
    four_byte_asn: bool,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            four_byte_asn: false,
        }
    }

    pub fn set_four_byte_asn(&mut self, enabled: bool) {
        self.four_byte_asn = enabled;
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let header = Header::decode(&buf[..HEADER_LENGTH])?;
        let length = header.length as usize;
        if buf.len() < length {
            // Wait for the rest of the message
            return Ok(None);
        }
        let message = Message::decode(
            header.message_type,
            &buf[HEADER_LENGTH..length],
            self.four_byte_asn,
        )?;
        buf.advance(length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let mut bytes: Vec<u8> = Vec::with_capacity(64);
        message.encode(&mut bytes, self.four_byte_asn)?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{header_error, Notification};

    fn encoded(message: Message) -> BytesMut {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_waits_for_full_message() {
        let mut codec = MessageCodec::new();
        let full = encoded(Message::Notification(Notification::new(6, 2, vec![1, 2])));

        let mut partial = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..HEADER_LENGTH + 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut buf = full.clone();
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message.kind(), "NOTIFICATION");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_messages_back_to_back() {
        let mut codec = MessageCodec::new();
        let mut buf = encoded(Message::KeepAlive);
        buf.extend_from_slice(&encoded(Message::KeepAlive));

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_bad_marker() {
        let mut codec = MessageCodec::new();
        let mut buf = encoded(Message::KeepAlive);
        buf[3] = 0x00;
        match codec.decode(&mut buf) {
            Err(MessageError::Header { subcode, .. }) => {
                assert_eq!(subcode, header_error::CONNECTION_NOT_SYNCHRONIZED);
            }
            other => panic!("Expected header error, got {:?}", other),
        }
    }
}
