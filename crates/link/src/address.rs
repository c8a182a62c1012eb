//! Link-layer peer addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::LinkError;

pub const ADDRESS_LEN: usize = 6;

/// 6-byte MAC address of a radio peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress([u8; ADDRESS_LEN]);

impl PeerAddress {
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, LinkError> {
        let raw: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| LinkError::InvalidAddress(format!("expected {} bytes, got {}", ADDRESS_LEN, bytes.len())))?;
        Ok(Self(raw))
    }
}

impl From<[u8; ADDRESS_LEN]> for PeerAddress {
    fn from(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for PeerAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw = [0u8; ADDRESS_LEN];
        let mut parts = s.split(':');
        for byte in raw.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| LinkError::InvalidAddress(format!("too few octets in {:?}", s)))?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(LinkError::InvalidAddress(format!("bad octet {:?} in {:?}", part, s)));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| LinkError::InvalidAddress(format!("bad octet {:?} in {:?}", part, s)))?;
        }
        if parts.next().is_some() {
            return Err(LinkError::InvalidAddress(format!("too many octets in {:?}", s)));
        }
        Ok(Self(raw))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = LinkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_mac_notation() {
        let addr = PeerAddress::new([0xC8, 0xC9, 0xA3, 0xC5, 0xFA, 0x98]);
        assert_eq!(addr.to_string(), "c8:c9:a3:c5:fa:98");
    }

    #[test]
    fn parse_accepts_either_case() {
        let upper: PeerAddress = "C8:C9:A3:C5:FA:98".parse().unwrap();
        let lower: PeerAddress = "c8:c9:a3:c5:fa:98".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_bytes(), &[0xC8, 0xC9, 0xA3, 0xC5, 0xFA, 0x98]);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("c8:c9:a3:c5:fa".parse::<PeerAddress>().is_err());
        assert!("c8:c9:a3:c5:fa:98:00".parse::<PeerAddress>().is_err());
        assert!("c8:c9:a3:c5:fa:9".parse::<PeerAddress>().is_err());
        assert!("zz:c9:a3:c5:fa:98".parse::<PeerAddress>().is_err());
        assert!("+8:c9:a3:c5:fa:98".parse::<PeerAddress>().is_err());
        assert!("c8:c9:a3:c5:fa:-1".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn slice_conversion_checks_length() {
        assert!(PeerAddress::try_from_slice(&[1, 2, 3]).is_err());
        let addr = PeerAddress::try_from_slice(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(addr, PeerAddress::new([1, 2, 3, 4, 5, 6]));
    }
}
