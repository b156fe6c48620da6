use std::fmt;
use std::io::{self, Cursor, Read, Write};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::{update_error, MessageError};
use std::net::Ipv4Addr;

/// Path attribute flag bits
pub mod flags {
    pub const OPTIONAL: u8 = 0x80;
    pub const TRANSITIVE: u8 = 0x40;
    pub const PARTIAL: u8 = 0x20;
    pub const EXTENDED_LENGTH: u8 = 0x10;
}

const TYPE_ORIGIN: u8 = 1;
const TYPE_AS_PATH: u8 = 2;
const TYPE_NEXT_HOP: u8 = 3;
const TYPE_MULTI_EXIT_DISC: u8 = 4;
const TYPE_LOCAL_PREF: u8 = 5;

const SEGMENT_AS_SET: u8 = 1;
const SEGMENT_AS_SEQUENCE: u8 = 2;

/// AS-TRANS, stands in for >2-byte ASNs on a 2-byte session (RFC 6793)
pub const AS_TRANS: u16 = 23456;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl Origin {
    fn from_u8(value: u8) -> Option<Origin> {
        match value {
            0 => Some(Origin::Igp),
            1 => Some(Origin::Egp),
            2 => Some(Origin::Incomplete),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Origin::Igp => 0,
            Origin::Egp => 1,
            Origin::Incomplete => 2,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            Origin::Igp => "IGP",
            Origin::Egp => "EGP",
            Origin::Incomplete => "Incomplete",
        };
        write!(f, "{}", word)
    }
}

impl std::str::FromStr for Origin {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "igp" => Ok(Origin::Igp),
            "egp" => Ok(Origin::Egp),
            _ => Ok(Origin::Incomplete),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    AsSequence(Vec<u32>),
    AsSet(Vec<u32>),
}

/// Ordered list of AS_PATH segments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsPath {
    pub segments: Vec<Segment>,
}

impl AsPath {
    pub fn from_sequence(asns: Vec<u32>) -> Self {
        if asns.is_empty() {
            return Self::default();
        }
        Self {
            segments: vec![Segment::AsSequence(asns)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Path length for best-path purposes: an AS_SET counts as one hop,
    /// each AS_SEQUENCE element individually
    pub fn length(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::AsSequence(asns) => asns.len(),
                Segment::AsSet(_) => 1,
            })
            .sum()
    }

    /// Leftmost AS, i.e. the neighbor this path was learned from
    pub fn first_asn(&self) -> Option<u32> {
        self.segments.first().and_then(|segment| match segment {
            Segment::AsSequence(asns) | Segment::AsSet(asns) => asns.first().copied(),
        })
    }

    /// Prepend an ASN, extending a leading AS_SEQUENCE if present
    pub fn prepend(&mut self, asn: u32) {
        match self.segments.first_mut() {
            Some(Segment::AsSequence(asns)) => asns.insert(0, asn),
            _ => self.segments.insert(0, Segment::AsSequence(vec![asn])),
        }
    }

    /// Flattened ASN list for display and API export
    pub fn asns(&self) -> Vec<u32> {
        self.segments
            .iter()
            .flat_map(|segment| match segment {
                Segment::AsSequence(asns) | Segment::AsSet(asns) => asns.iter().copied(),
            })
            .collect()
    }
}

impl fmt::Display for AsPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut words: Vec<String> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::AsSequence(asns) => {
                    words.extend(asns.iter().map(|asn| asn.to_string()));
                }
                Segment::AsSet(asns) => {
                    let inner: Vec<String> = asns.iter().map(|asn| asn.to_string()).collect();
                    words.push(format!("{{{}}}", inner.join(",")));
                }
            }
        }
        write!(f, "{}", words.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathAttribute {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    /// Unrecognized attribute, retained opaquely and re-emitted verbatim
    Unknown { flags: u8, code: u8, value: Vec<u8> },
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        match self {
            PathAttribute::Origin(_) => TYPE_ORIGIN,
            PathAttribute::AsPath(_) => TYPE_AS_PATH,
            PathAttribute::NextHop(_) => TYPE_NEXT_HOP,
            PathAttribute::MultiExitDisc(_) => TYPE_MULTI_EXIT_DISC,
            PathAttribute::LocalPref(_) => TYPE_LOCAL_PREF,
            PathAttribute::Unknown { code, .. } => *code,
        }
    }

    /// Decode one attribute. `Ok(None)` means a malformed *optional*
    /// attribute was dropped without resetting the session.
    pub fn decode(
        cur: &mut Cursor<&[u8]>,
        four_byte_asn: bool,
    ) -> Result<Option<PathAttribute>, MessageError> {
        let attr_flags = cur.read_u8()?;
        let code = cur.read_u8()?;
        let length = if attr_flags & flags::EXTENDED_LENGTH != 0 {
            cur.read_u16::<NetworkEndian>()? as usize
        } else {
            cur.read_u8()? as usize
        };
        let mut value = vec![0u8; length];
        cur.read_exact(&mut value).map_err(|_| {
            MessageError::update(update_error::ATTRIBUTE_LENGTH_ERROR, vec![attr_flags, code])
        })?;

        let optional = attr_flags & flags::OPTIONAL != 0;
        let attribute = match code {
            TYPE_ORIGIN => {
                if value.len() != 1 {
                    return Err(MessageError::update(
                        update_error::ATTRIBUTE_LENGTH_ERROR,
                        value,
                    ));
                }
                match Origin::from_u8(value[0]) {
                    Some(origin) => PathAttribute::Origin(origin),
                    None => {
                        return Err(MessageError::update(
                            update_error::INVALID_ORIGIN_ATTRIBUTE,
                            value,
                        ));
                    }
                }
            }
            TYPE_AS_PATH => PathAttribute::AsPath(decode_as_path(&value, four_byte_asn)?),
            TYPE_NEXT_HOP => {
                if value.len() != 4 {
                    return Err(MessageError::update(
                        update_error::INVALID_NEXT_HOP_ATTRIBUTE,
                        value,
                    ));
                }
                PathAttribute::NextHop(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
            }
            TYPE_MULTI_EXIT_DISC | TYPE_LOCAL_PREF => {
                if value.len() != 4 {
                    // Optional attribute with a bogus length: drop the
                    // attribute, keep the session
                    if optional {
                        return Ok(None);
                    }
                    return Err(MessageError::update(
                        update_error::ATTRIBUTE_LENGTH_ERROR,
                        value,
                    ));
                }
                let number = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                if code == TYPE_MULTI_EXIT_DISC {
                    PathAttribute::MultiExitDisc(number)
                } else {
                    PathAttribute::LocalPref(number)
                }
            }
            _ => {
                if !optional {
                    let mut data = vec![attr_flags, code];
                    data.extend_from_slice(&value);
                    return Err(MessageError::update(
                        update_error::UNRECOGNIZED_WELL_KNOWN_ATTRIBUTE,
                        data,
                    ));
                }
                PathAttribute::Unknown {
                    flags: attr_flags,
                    code,
                    value,
                }
            }
        };
        Ok(Some(attribute))
    }

    pub fn encode(&self, buf: &mut Vec<u8>, four_byte_asn: bool) -> io::Result<()> {
        let (attr_flags, value) = match self {
            PathAttribute::Origin(origin) => (flags::TRANSITIVE, vec![origin.as_u8()]),
            PathAttribute::AsPath(as_path) => {
                (flags::TRANSITIVE, encode_as_path(as_path, four_byte_asn)?)
            }
            PathAttribute::NextHop(next_hop) => {
                (flags::TRANSITIVE, next_hop.octets().to_vec())
            }
            PathAttribute::MultiExitDisc(med) => (flags::OPTIONAL, med.to_be_bytes().to_vec()),
            PathAttribute::LocalPref(pref) => (flags::TRANSITIVE, pref.to_be_bytes().to_vec()),
            PathAttribute::Unknown {
                flags: attr_flags,
                value,
                ..
            } => (*attr_flags, value.clone()),
        };
        let extended = value.len() > 255;
        let attr_flags = if extended {
            attr_flags | flags::EXTENDED_LENGTH
        } else {
            attr_flags & !flags::EXTENDED_LENGTH
        };
        buf.write_u8(attr_flags)?;
        buf.write_u8(self.type_code())?;
        if extended {
            buf.write_u16::<NetworkEndian>(value.len() as u16)?;
        } else {
            buf.write_u8(value.len() as u8)?;
        }
        buf.write_all(&value)
    }
}

fn decode_as_path(value: &[u8], four_byte_asn: bool) -> Result<AsPath, MessageError> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut cur = Cursor::new(value);
    while (cur.position() as usize) < value.len() {
        let segment_type = cur.read_u8().map_err(malformed_as_path)?;
        let count = cur.read_u8().map_err(malformed_as_path)? as usize;
        let mut asns: Vec<u32> = Vec::with_capacity(count);
        for _ in 0..count {
            let asn = if four_byte_asn {
                cur.read_u32::<NetworkEndian>().map_err(malformed_as_path)?
            } else {
                u32::from(cur.read_u16::<NetworkEndian>().map_err(malformed_as_path)?)
            };
            asns.push(asn);
        }
        let segment = match segment_type {
            SEGMENT_AS_SET => Segment::AsSet(asns),
            SEGMENT_AS_SEQUENCE => Segment::AsSequence(asns),
            _ => {
                return Err(MessageError::update(
                    update_error::MALFORMED_AS_PATH,
                    vec![segment_type],
                ));
            }
        };
        segments.push(segment);
    }
    Ok(AsPath { segments })
}

fn malformed_as_path(_: io::Error) -> MessageError {
    MessageError::update(update_error::MALFORMED_AS_PATH, vec![])
}

fn encode_as_path(as_path: &AsPath, four_byte_asn: bool) -> io::Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(2 + 4 * as_path.length());
    for segment in &as_path.segments {
        let (segment_type, asns) = match segment {
            Segment::AsSet(asns) => (SEGMENT_AS_SET, asns),
            Segment::AsSequence(asns) => (SEGMENT_AS_SEQUENCE, asns),
        };
        buf.write_u8(segment_type)?;
        buf.write_u8(asns.len() as u8)?;
        for asn in asns {
            if four_byte_asn {
                buf.write_u32::<NetworkEndian>(*asn)?;
            } else if *asn > u32::from(std::u16::MAX) {
                buf.write_u16::<NetworkEndian>(AS_TRANS)?;
            } else {
                buf.write_u16::<NetworkEndian>(*asn as u16)?;
            }
        }
    }
    Ok(buf)
}
