use std::error::Error;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::num::ParseIntError;

use crate::message::Prefix;

#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: String) -> Self {
        ParseError { reason }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseError: {}", self.reason)
    }
}

impl Error for ParseError {}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::new(error.to_string())
    }
}

/// Convert a CIDR string (E.g. "192.168.0.0/24") to a Prefix.
/// A bare address is treated as a /32 host route.
pub fn prefix_from_str(value: &str) -> Result<Prefix, ParseError> {
    let (addr, length) = if let Some(i) = value.find('/') {
        let (addr, mask) = value.split_at(i);
        let length: u8 = mask[1..]
            .parse()
            .map_err(|err: ParseIntError| ParseError::new(format!("{} '{}'", err, value)))?;
        (addr, length)
    } else {
        (value, 32)
    };
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| ParseError::new(format!("Not a valid IPv4 prefix: '{}'", value)))?;
    if length > 32 {
        return Err(ParseError::new(format!(
            "Prefix length out of range: '{}'",
            value
        )));
    }
    Ok(Prefix::new(addr, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_from_str() {
        let prefix = prefix_from_str("192.168.10.0/24").unwrap();
        assert_eq!(prefix.length, 24);
        assert_eq!(prefix.to_string(), "192.168.10.0/24");

        let host = prefix_from_str("10.1.1.1").unwrap();
        assert_eq!(host.length, 32);

        assert!(prefix_from_str("10.0.0.0/40").is_err());
        assert!(prefix_from_str("not-a-prefix").is_err());
    }
}
