mod attributes;
mod update;

pub use attributes::{flags, AsPath, Origin, PathAttribute, Segment};
pub use update::{Prefix, Update};

use std::error;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use crate::utils::transform_u32_to_bytes;

/// All BGP messages start with 16 bytes of all-ones
pub const MARKER: [u8; 16] = [0xff; 16];
/// Marker + length (2) + type (1)
pub const HEADER_LENGTH: usize = 19;
/// Largest legal BGP message, header inclusive
pub const MAX_MESSAGE_LENGTH: usize = 4096;

const TYPE_OPEN: u8 = 1;
const TYPE_UPDATE: u8 = 2;
const TYPE_NOTIFICATION: u8 = 3;
const TYPE_KEEPALIVE: u8 = 4;

/// NOTIFICATION error codes (RFC 4271 section 4.5)
pub mod error_code {
    pub const MESSAGE_HEADER: u8 = 1;
    pub const OPEN_MESSAGE: u8 = 2;
    pub const UPDATE_MESSAGE: u8 = 3;
    pub const HOLD_TIMER_EXPIRED: u8 = 4;
    pub const FSM: u8 = 5;
    pub const CEASE: u8 = 6;
}

/// Message header error subcodes
pub mod header_error {
    pub const CONNECTION_NOT_SYNCHRONIZED: u8 = 1;
    pub const BAD_MESSAGE_LENGTH: u8 = 2;
    pub const BAD_MESSAGE_TYPE: u8 = 3;
}

/// OPEN message error subcodes
pub mod open_error {
    pub const UNSUPPORTED_VERSION_NUMBER: u8 = 1;
    pub const BAD_PEER_AS: u8 = 2;
    pub const BAD_BGP_IDENTIFIER: u8 = 3;
    pub const UNSUPPORTED_OPTIONAL_PARAMETER: u8 = 4;
    pub const UNACCEPTABLE_HOLD_TIME: u8 = 6;
}

/// UPDATE message error subcodes
pub mod update_error {
    pub const MALFORMED_ATTRIBUTE_LIST: u8 = 1;
    pub const UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE: u8 = 2;
    pub const MISSING_WELL_KNOWN_ATTRIBUTE: u8 = 3;
    pub const ATTRIBUTE_FLAGS_ERROR: u8 = 4;
    pub const ATTRIBUTE_LENGTH_ERROR: u8 = 5;
    pub const INVALID_ORIGIN_ATTRIBUTE: u8 = 6;
    pub const INVALID_NEXT_HOP_ATTRIBUTE: u8 = 8;
    pub const OPTIONAL_ATTRIBUTE_ERROR: u8 = 9;
    pub const INVALID_NETWORK_FIELD: u8 = 10;
    pub const MALFORMED_AS_PATH: u8 = 11;
}

/// Cease subcodes (RFC 4486)
pub mod cease {
    pub const ADMINISTRATIVE_SHUTDOWN: u8 = 2;
    pub const PEER_DECONFIGURED: u8 = 3;
    pub const CONNECTION_REJECTED: u8 = 5;
    pub const CONNECTION_COLLISION_RESOLUTION: u8 = 7;
}

/// Decode or validation failure, carrying the NOTIFICATION this
/// error maps onto (if any)
#[derive(Debug)]
pub enum MessageError {
    Header { subcode: u8, data: Vec<u8> },
    Open { subcode: u8, data: Vec<u8> },
    Update { subcode: u8, data: Vec<u8> },
    Io(io::Error),
}

impl MessageError {
    pub(crate) fn header(subcode: u8, data: Vec<u8>) -> Self {
        MessageError::Header { subcode, data }
    }

    pub(crate) fn open(subcode: u8, data: Vec<u8>) -> Self {
        MessageError::Open { subcode, data }
    }

    pub(crate) fn update(subcode: u8, data: Vec<u8>) -> Self {
        MessageError::Update { subcode, data }
    }

    /// The NOTIFICATION to send before tearing the session down
    pub fn notification(&self) -> Notification {
        match self {
            MessageError::Header { subcode, data } => {
                Notification::new(error_code::MESSAGE_HEADER, *subcode, data.clone())
            }
            MessageError::Open { subcode, data } => {
                Notification::new(error_code::OPEN_MESSAGE, *subcode, data.clone())
            }
            MessageError::Update { subcode, data } => {
                Notification::new(error_code::UPDATE_MESSAGE, *subcode, data.clone())
            }
            // Short reads mean the advertised length didn't match the body
            MessageError::Io(_) => Notification::new(
                error_code::MESSAGE_HEADER,
                header_error::BAD_MESSAGE_LENGTH,
                vec![],
            ),
        }
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageError::Header { subcode, .. } => {
                write!(f, "Message header error [subcode {}]", subcode)
            }
            MessageError::Open { subcode, .. } => {
                write!(f, "OPEN message error [subcode {}]", subcode)
            }
            MessageError::Update { subcode, .. } => {
                write!(f, "UPDATE message error [subcode {}]", subcode)
            }
            MessageError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for MessageError {}

impl From<io::Error> for MessageError {
    fn from(error: io::Error) -> Self {
        MessageError::Io(error)
    }
}

/// The fixed 19-byte header in front of every message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub length: u16,
    pub message_type: u8,
}

impl Header {
    pub fn decode(buf: &[u8]) -> Result<Header, MessageError> {
        let mut cur = Cursor::new(buf);
        let mut marker = [0u8; 16];
        cur.read_exact(&mut marker)?;
        if marker != MARKER {
            return Err(MessageError::header(
                header_error::CONNECTION_NOT_SYNCHRONIZED,
                vec![],
            ));
        }
        let length = cur.read_u16::<NetworkEndian>()?;
        if (length as usize) < HEADER_LENGTH || (length as usize) > MAX_MESSAGE_LENGTH {
            return Err(MessageError::header(
                header_error::BAD_MESSAGE_LENGTH,
                length.to_be_bytes().to_vec(),
            ));
        }
        let message_type = cur.read_u8()?;
        if !(TYPE_OPEN..=TYPE_KEEPALIVE).contains(&message_type) {
            return Err(MessageError::header(
                header_error::BAD_MESSAGE_TYPE,
                vec![message_type],
            ));
        }
        Ok(Header {
            length,
            message_type,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_all(&MARKER)?;
        buf.write_u16::<NetworkEndian>(self.length)?;
        buf.write_u8(self.message_type)
    }
}

/// Optional parameter carried in an OPEN
#[derive(Debug, Clone, PartialEq)]
pub enum OpenParameter {
    Capabilities(Vec<Capability>),
    Unknown { param_type: u8, value: Vec<u8> },
}

/// Capability advertised in OPEN optional parameter type 2
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    /// MP-BGP (code 1): AFI + SAFI; parsed but otherwise ignored
    MultiProtocol(u16, u8),
    /// 4-octet AS numbers (code 65)
    FourByteAsn(u32),
    Unknown { code: u8, value: Vec<u8> },
}

const PARAM_CAPABILITIES: u8 = 2;
const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_FOUR_BYTE_ASN: u8 = 65;

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub version: u8,
    pub my_as: u16,
    pub hold_time: u16,
    pub identifier: u32,
    pub parameters: Vec<OpenParameter>,
}

impl Open {
    pub fn decode(body: &[u8]) -> Result<Open, MessageError> {
        let mut cur = Cursor::new(body);
        let version = cur.read_u8()?;
        if version != 4 {
            return Err(MessageError::open(
                open_error::UNSUPPORTED_VERSION_NUMBER,
                vec![0, 4],
            ));
        }
        let my_as = cur.read_u16::<NetworkEndian>()?;
        let hold_time = cur.read_u16::<NetworkEndian>()?;
        let identifier = cur.read_u32::<NetworkEndian>()?;
        let opt_length = cur.read_u8()? as usize;
        let mut params = vec![0u8; opt_length];
        cur.read_exact(&mut params).map_err(|_| {
            MessageError::open(open_error::UNSUPPORTED_OPTIONAL_PARAMETER, vec![])
        })?;

        let mut parameters: Vec<OpenParameter> = Vec::new();
        let mut cur = Cursor::new(params.as_slice());
        while (cur.position() as usize) < params.len() {
            let param_type = cur.read_u8()?;
            let param_length = cur.read_u8()? as usize;
            let mut value = vec![0u8; param_length];
            cur.read_exact(&mut value).map_err(|_| {
                MessageError::open(open_error::UNSUPPORTED_OPTIONAL_PARAMETER, vec![param_type])
            })?;
            if param_type == PARAM_CAPABILITIES {
                parameters.push(OpenParameter::Capabilities(decode_capabilities(&value)?));
            } else {
                parameters.push(OpenParameter::Unknown { param_type, value });
            }
        }
        Ok(Open {
            version,
            my_as,
            hold_time,
            identifier,
            parameters,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u8(self.version)?;
        buf.write_u16::<NetworkEndian>(self.my_as)?;
        buf.write_u16::<NetworkEndian>(self.hold_time)?;
        buf.write_u32::<NetworkEndian>(self.identifier)?;
        let mut params: Vec<u8> = Vec::with_capacity(16);
        for parameter in &self.parameters {
            match parameter {
                OpenParameter::Capabilities(caps) => {
                    let mut value: Vec<u8> = Vec::with_capacity(8);
                    for cap in caps {
                        encode_capability(cap, &mut value)?;
                    }
                    params.write_u8(PARAM_CAPABILITIES)?;
                    params.write_u8(value.len() as u8)?;
                    params.write_all(&value)?;
                }
                OpenParameter::Unknown { param_type, value } => {
                    params.write_u8(*param_type)?;
                    params.write_u8(value.len() as u8)?;
                    params.write_all(value)?;
                }
            }
        }
        buf.write_u8(params.len() as u8)?;
        buf.write_all(&params)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.parameters
            .iter()
            .filter_map(|p| match p {
                OpenParameter::Capabilities(caps) => Some(caps.iter()),
                _ => None,
            })
            .flatten()
    }

    /// Peer ASN; 4-byte capability takes precedence over the 2-byte field
    pub fn asn(&self) -> u32 {
        self.capabilities()
            .find_map(|c| match c {
                Capability::FourByteAsn(asn) => Some(*asn),
                _ => None,
            })
            .unwrap_or_else(|| u32::from(self.my_as))
    }

    pub fn supports_four_byte_asn(&self) -> bool {
        self.capabilities()
            .any(|c| matches!(c, Capability::FourByteAsn(_)))
    }

    pub fn router_id(&self) -> Ipv4Addr {
        Ipv4Addr::from(transform_u32_to_bytes(self.identifier))
    }
}

fn decode_capabilities(value: &[u8]) -> Result<Vec<Capability>, MessageError> {
    let mut capabilities: Vec<Capability> = Vec::new();
    let mut cur = Cursor::new(value);
    while (cur.position() as usize) < value.len() {
        let code = cur.read_u8()?;
        let length = cur.read_u8()? as usize;
        let mut cap_value = vec![0u8; length];
        cur.read_exact(&mut cap_value).map_err(|_| {
            MessageError::open(open_error::UNSUPPORTED_OPTIONAL_PARAMETER, vec![code])
        })?;
        let capability = match (code, length) {
            (CAP_MULTIPROTOCOL, 4) => Capability::MultiProtocol(
                u16::from_be_bytes([cap_value[0], cap_value[1]]),
                cap_value[3],
            ),
            (CAP_FOUR_BYTE_ASN, 4) => Capability::FourByteAsn(u32::from_be_bytes([
                cap_value[0],
                cap_value[1],
                cap_value[2],
                cap_value[3],
            ])),
            _ => Capability::Unknown {
                code,
                value: cap_value,
            },
        };
        capabilities.push(capability);
    }
    Ok(capabilities)
}

fn encode_capability(cap: &Capability, buf: &mut Vec<u8>) -> io::Result<()> {
    match cap {
        Capability::MultiProtocol(afi, safi) => {
            buf.write_u8(CAP_MULTIPROTOCOL)?;
            buf.write_u8(4)?;
            buf.write_u16::<NetworkEndian>(*afi)?;
            buf.write_u8(0)?;
            buf.write_u8(*safi)
        }
        Capability::FourByteAsn(asn) => {
            buf.write_u8(CAP_FOUR_BYTE_ASN)?;
            buf.write_u8(4)?;
            buf.write_u32::<NetworkEndian>(*asn)
        }
        Capability::Unknown { code, value } => {
            buf.write_u8(*code)?;
            buf.write_u8(value.len() as u8)?;
            buf.write_all(value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code,
            subcode,
            data,
        }
    }

    pub fn decode(body: &[u8]) -> Result<Notification, MessageError> {
        let mut cur = Cursor::new(body);
        let code = cur.read_u8()?;
        let subcode = cur.read_u8()?;
        let data = body[cur.position() as usize..].to_vec();
        Ok(Notification {
            code,
            subcode,
            data,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u8(self.code)?;
        buf.write_u8(self.subcode)?;
        buf.write_all(&self.data)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.code {
            error_code::MESSAGE_HEADER => "Message Header Error",
            error_code::OPEN_MESSAGE => "OPEN Message Error",
            error_code::UPDATE_MESSAGE => "UPDATE Message Error",
            error_code::HOLD_TIMER_EXPIRED => "Hold Timer Expired",
            error_code::FSM => "Finite State Machine Error",
            error_code::CEASE => "Cease",
            _ => "Unknown",
        };
        write!(f, "{} [{}/{}]", kind, self.code, self.subcode)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Open(Open),
    Update(Update),
    Notification(Notification),
    KeepAlive,
}

impl Message {
    /// Decode one message body; the header has already been validated
    pub fn decode(
        message_type: u8,
        body: &[u8],
        four_byte_asn: bool,
    ) -> Result<Message, MessageError> {
        match message_type {
            TYPE_OPEN => Ok(Message::Open(Open::decode(body)?)),
            TYPE_UPDATE => Ok(Message::Update(Update::decode(body, four_byte_asn)?)),
            TYPE_NOTIFICATION => Ok(Message::Notification(Notification::decode(body)?)),
            TYPE_KEEPALIVE => {
                if !body.is_empty() {
                    return Err(MessageError::header(
                        header_error::BAD_MESSAGE_LENGTH,
                        ((body.len() + HEADER_LENGTH) as u16).to_be_bytes().to_vec(),
                    ));
                }
                Ok(Message::KeepAlive)
            }
            _ => Err(MessageError::header(
                header_error::BAD_MESSAGE_TYPE,
                vec![message_type],
            )),
        }
    }

    /// Encode header + body into `buf`
    pub fn encode(&self, buf: &mut Vec<u8>, four_byte_asn: bool) -> io::Result<()> {
        let mut body: Vec<u8> = Vec::with_capacity(64);
        let message_type = match self {
            Message::Open(open) => {
                open.encode(&mut body)?;
                TYPE_OPEN
            }
            Message::Update(update) => {
                update.encode(&mut body, four_byte_asn)?;
                TYPE_UPDATE
            }
            Message::Notification(notification) => {
                notification.encode(&mut body)?;
                TYPE_NOTIFICATION
            }
            Message::KeepAlive => TYPE_KEEPALIVE,
        };
        let length = HEADER_LENGTH + body.len();
        if length > MAX_MESSAGE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Message too large: {} bytes", length),
            ));
        }
        let header = Header {
            length: length as u16,
            message_type,
        };
        header.encode(buf)?;
        buf.write_all(&body)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open(_) => "OPEN",
            Message::Update(_) => "UPDATE",
            Message::Notification(_) => "NOTIFICATION",
            Message::KeepAlive => "KEEPALIVE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: &Message) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        message.encode(&mut buf, true).unwrap();
        buf
    }

    fn decode(buf: &[u8]) -> Message {
        let header = Header::decode(&buf[..HEADER_LENGTH]).unwrap();
        assert_eq!(header.length as usize, buf.len());
        Message::decode(header.message_type, &buf[HEADER_LENGTH..], true).unwrap()
    }

    #[test]
    fn test_keepalive_round_trip() {
        let buf = encode(&Message::KeepAlive);
        assert_eq!(buf.len(), HEADER_LENGTH);
        assert_eq!(decode(&buf), Message::KeepAlive);
    }

    #[test]
    fn test_open_round_trip() {
        let open = Open {
            version: 4,
            my_as: 65000,
            hold_time: 90,
            identifier: u32::from_be_bytes([9, 9, 9, 9]),
            parameters: vec![OpenParameter::Capabilities(vec![
                Capability::MultiProtocol(1, 1),
                Capability::FourByteAsn(65000),
            ])],
        };
        let message = Message::Open(open.clone());
        assert_eq!(decode(&encode(&message)), message);
        assert_eq!(open.asn(), 65000);
        assert!(open.supports_four_byte_asn());
        assert_eq!(open.router_id(), "9.9.9.9".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_open_four_byte_asn_precedence() {
        // AS-TRANS in the 2-byte field, real ASN in the capability
        let open = Open {
            version: 4,
            my_as: 23456,
            hold_time: 90,
            identifier: 1,
            parameters: vec![OpenParameter::Capabilities(vec![Capability::FourByteAsn(
                4_200_000_000,
            )])],
        };
        assert_eq!(open.asn(), 4_200_000_000);
    }

    #[test]
    fn test_open_bad_version() {
        let mut body = vec![3u8]; // version 3
        body.extend_from_slice(&[0xfd, 0xe8, 0, 90, 1, 1, 1, 1, 0]);
        match Open::decode(&body) {
            Err(MessageError::Open { subcode, data }) => {
                assert_eq!(subcode, open_error::UNSUPPORTED_VERSION_NUMBER);
                assert_eq!(data, vec![0, 4]);
            }
            other => panic!("Expected OPEN error, got {:?}", other),
        }
    }

    #[test]
    fn test_notification_round_trip() {
        let message = Message::Notification(Notification::new(
            error_code::CEASE,
            cease::ADMINISTRATIVE_SHUTDOWN,
            vec![],
        ));
        assert_eq!(decode(&encode(&message)), message);
    }

    #[test]
    fn test_header_bad_marker() {
        let mut buf = encode(&Message::KeepAlive);
        buf[0] = 0x00;
        match Header::decode(&buf[..HEADER_LENGTH]) {
            Err(MessageError::Header { subcode, .. }) => {
                assert_eq!(subcode, header_error::CONNECTION_NOT_SYNCHRONIZED);
            }
            other => panic!("Expected header error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_bad_length() {
        let mut buf = encode(&Message::KeepAlive);
        buf[16] = 0xff;
        buf[17] = 0xff;
        match Header::decode(&buf[..HEADER_LENGTH]) {
            Err(MessageError::Header { subcode, .. }) => {
                assert_eq!(subcode, header_error::BAD_MESSAGE_LENGTH);
            }
            other => panic!("Expected header error, got {:?}", other),
        }
    }

    #[test]
    fn test_header_bad_type() {
        let mut buf = encode(&Message::KeepAlive);
        buf[18] = 9;
        match Header::decode(&buf[..HEADER_LENGTH]) {
            Err(MessageError::Header { subcode, data }) => {
                assert_eq!(subcode, header_error::BAD_MESSAGE_TYPE);
                assert_eq!(data, vec![9]);
            }
            other => panic!("Expected header error, got {:?}", other),
        }
    }
}
