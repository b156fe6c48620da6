use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use super::attributes::PathAttribute;
use super::{update_error, MessageError};

/// An IPv4 prefix: network address + mask length.
/// Wire form is one length byte followed by `ceil(length / 8)` address
/// bytes, high-order first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    pub addr: Ipv4Addr,
    pub length: u8,
}

impl Prefix {
    /// Construct a prefix, masking any host bits in `addr`
    pub fn new(addr: Ipv4Addr, length: u8) -> Self {
        let mask = if length == 0 {
            0
        } else {
            !0u32 << (32 - u32::from(length))
        };
        Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            length,
        }
    }

    fn octets_needed(length: u8) -> usize {
        (usize::from(length) + 7) / 8
    }

    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Prefix, MessageError> {
        let length = cur
            .read_u8()
            .map_err(|_| MessageError::update(update_error::INVALID_NETWORK_FIELD, vec![]))?;
        if length > 32 {
            return Err(MessageError::update(
                update_error::INVALID_NETWORK_FIELD,
                vec![length],
            ));
        }
        let mut octets = [0u8; 4];
        cur.read_exact(&mut octets[..Self::octets_needed(length)])
            .map_err(|_| MessageError::update(update_error::INVALID_NETWORK_FIELD, vec![length]))?;
        Ok(Prefix::new(Ipv4Addr::from(octets), length))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_u8(self.length)?;
        buf.write_all(&self.addr.octets()[..Self::octets_needed(self.length)])
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.length)
    }
}

/// UPDATE body: withdrawn prefixes, path attributes, announced NLRI
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    pub withdrawn_routes: Vec<Prefix>,
    pub attributes: Vec<PathAttribute>,
    pub announced_routes: Vec<Prefix>,
}

impl Update {
    pub fn decode(body: &[u8], four_byte_asn: bool) -> Result<Update, MessageError> {
        let mut cur = Cursor::new(body);
        let withdrawn_length = cur.read_u16::<NetworkEndian>().map_err(|_| {
            MessageError::update(update_error::MALFORMED_ATTRIBUTE_LIST, vec![])
        })? as usize;
        let withdrawn_end = cur.position() as usize + withdrawn_length;
        if withdrawn_end > body.len() {
            return Err(MessageError::update(
                update_error::MALFORMED_ATTRIBUTE_LIST,
                vec![],
            ));
        }
        let mut withdrawn_routes: Vec<Prefix> = Vec::new();
        while (cur.position() as usize) < withdrawn_end {
            withdrawn_routes.push(Prefix::decode(&mut cur)?);
        }
        if cur.position() as usize != withdrawn_end {
            return Err(MessageError::update(
                update_error::MALFORMED_ATTRIBUTE_LIST,
                vec![],
            ));
        }

        let attributes_length = cur.read_u16::<NetworkEndian>().map_err(|_| {
            MessageError::update(update_error::MALFORMED_ATTRIBUTE_LIST, vec![])
        })? as usize;
        let attributes_end = cur.position() as usize + attributes_length;
        if attributes_end > body.len() {
            return Err(MessageError::update(
                update_error::MALFORMED_ATTRIBUTE_LIST,
                vec![],
            ));
        }
        let mut attributes: Vec<PathAttribute> = Vec::new();
        while (cur.position() as usize) < attributes_end {
            if let Some(attribute) = PathAttribute::decode(&mut cur, four_byte_asn)? {
                attributes.push(attribute);
            }
            if cur.position() as usize > attributes_end {
                return Err(MessageError::update(
                    update_error::MALFORMED_ATTRIBUTE_LIST,
                    vec![],
                ));
            }
        }

        let mut announced_routes: Vec<Prefix> = Vec::new();
        while (cur.position() as usize) < body.len() {
            announced_routes.push(Prefix::decode(&mut cur)?);
        }

        Ok(Update {
            withdrawn_routes,
            attributes,
            announced_routes,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>, four_byte_asn: bool) -> io::Result<()> {
        let mut withdrawn: Vec<u8> = Vec::with_capacity(5 * self.withdrawn_routes.len());
        for prefix in &self.withdrawn_routes {
            prefix.encode(&mut withdrawn)?;
        }
        buf.write_u16::<NetworkEndian>(withdrawn.len() as u16)?;
        buf.write_all(&withdrawn)?;

        let mut attributes: Vec<u8> = Vec::with_capacity(32);
        for attribute in &self.attributes {
            attribute.encode(&mut attributes, four_byte_asn)?;
        }
        buf.write_u16::<NetworkEndian>(attributes.len() as u16)?;
        buf.write_all(&attributes)?;

        for prefix in &self.announced_routes {
            prefix.encode(buf)?;
        }
        Ok(())
    }

    pub fn get(&self, type_code: u8) -> Option<&PathAttribute> {
        self.attributes
            .iter()
            .find(|attribute| attribute.type_code() == type_code)
    }

    /// An UPDATE with nothing withdrawn and nothing announced is the
    /// End-of-RIB marker
    pub fn is_end_of_rib(&self) -> bool {
        self.withdrawn_routes.is_empty()
            && self.announced_routes.is_empty()
            && self.attributes.is_empty()
    }

    /// When NLRI is announced, ORIGIN, AS_PATH and NEXT_HOP must all be
    /// present; returns the type code of the first one missing
    pub fn missing_well_known(&self) -> Option<u8> {
        if self.announced_routes.is_empty() {
            return None;
        }
        (1u8..=3).find(|code| self.get(*code).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::super::attributes::{AsPath, Origin};
    use super::*;

    fn round_trip(update: &Update) -> Update {
        let mut buf: Vec<u8> = Vec::new();
        update.encode(&mut buf, true).unwrap();
        Update::decode(&buf, true).unwrap()
    }

    #[test]
    fn test_prefix_wire_size() {
        for (length, expected) in [(0u8, 1usize), (8, 2), (17, 4), (24, 4), (32, 5)] {
            let prefix = Prefix::new(Ipv4Addr::new(10, 1, 2, 3), length);
            let mut buf: Vec<u8> = Vec::new();
            prefix.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), expected, "length {}", length);

            let mut cur = Cursor::new(buf.as_slice());
            assert_eq!(Prefix::decode(&mut cur).unwrap(), prefix);
        }
    }

    #[test]
    fn test_prefix_masks_host_bits() {
        let prefix = Prefix::new("10.99.99.77".parse().unwrap(), 24);
        assert_eq!(prefix.to_string(), "10.99.99.0/24");

        let prefix = Prefix::new("192.168.255.255".parse().unwrap(), 17);
        assert_eq!(prefix.to_string(), "192.168.128.0/17");

        let default = Prefix::new("10.0.0.1".parse().unwrap(), 0);
        assert_eq!(default.to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_prefix_length_out_of_range() {
        let buf: Vec<u8> = vec![33, 10, 0, 0, 0];
        let mut cur = Cursor::new(buf.as_slice());
        match Prefix::decode(&mut cur) {
            Err(MessageError::Update { subcode, .. }) => {
                assert_eq!(subcode, update_error::INVALID_NETWORK_FIELD);
            }
            other => panic!("Expected UPDATE error, got {:?}", other),
        }
    }

    #[test]
    fn test_update_round_trip() {
        let update = Update {
            withdrawn_routes: vec![Prefix::new("10.2.0.0".parse().unwrap(), 16)],
            attributes: vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::AsPath(AsPath::from_sequence(vec![65001, 65000])),
                PathAttribute::NextHop("172.16.0.2".parse().unwrap()),
                PathAttribute::MultiExitDisc(10),
            ],
            announced_routes: vec![
                Prefix::new("10.99.99.0".parse().unwrap(), 24),
                Prefix::new("10.100.0.0".parse().unwrap(), 16),
            ],
        };
        assert_eq!(round_trip(&update), update);
        assert!(!update.is_end_of_rib());
        assert_eq!(update.missing_well_known(), None);
    }

    #[test]
    fn test_end_of_rib() {
        let update = Update::default();
        assert!(update.is_end_of_rib());
        assert_eq!(round_trip(&update), update);
    }

    #[test]
    fn test_missing_well_known() {
        let update = Update {
            withdrawn_routes: vec![],
            attributes: vec![
                PathAttribute::Origin(Origin::Igp),
                PathAttribute::NextHop("172.16.0.2".parse().unwrap()),
            ],
            announced_routes: vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)],
        };
        // AS_PATH (type 2) is the first one missing
        assert_eq!(update.missing_well_known(), Some(2));

        // A pure withdraw needs no attributes
        let withdraw = Update {
            withdrawn_routes: vec![Prefix::new("10.0.0.0".parse().unwrap(), 8)],
            ..Update::default()
        };
        assert_eq!(withdraw.missing_well_known(), None);
    }
}
