//! Addresses and connection identities.

use std::fmt::{self, Display};

/// An IPv4 address as carried on the wire, most significant octet first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The address `0.0.0.0`.
    pub const UNSPECIFIED: Self = Self([0u8, 0, 0, 0]);

    /// The address `127.0.0.1`.
    pub const LOCALHOST: Self = Self([127u8, 0, 0, 1]);

    /// Creates a new address from its octets in network order.
    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    /// Gets the address as a host-order `u32`.
    pub fn to_u32(self) -> u32 {
        self.into()
    }

    /// Gets the address octets in network order.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n.to_be_bytes())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        u32::from_be_bytes(address.0)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

/// An address and port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Address, port: u16) -> Self {
        Self { address, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The pair of endpoints that uniquely identifies a TCP connection, seen from
/// the engine's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourTuple {
    /// Our endpoint
    pub local: Endpoint,
    /// The peer's endpoint
    pub remote: Endpoint,
}

impl FourTuple {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// The same connection as seen by the peer.
    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

impl Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_byte_order() {
        let address = Ipv4Address::new([10, 0, 0, 1]);
        assert_eq!(address.to_u32(), 0x0a00_0001);
        assert_eq!(Ipv4Address::from(0x0a00_0001), address);
        assert_eq!(address.to_bytes(), [10, 0, 0, 1]);
        assert_eq!(address.to_string(), "10.0.0.1");
    }

    #[test]
    fn reversed_tuple() {
        let tuple = FourTuple::new(
            Endpoint::new(Ipv4Address::LOCALHOST, 80),
            Endpoint::new([10, 0, 0, 2].into(), 40000),
        );
        let reversed = tuple.reverse();
        assert_eq!(reversed.local.port, 40000);
        assert_eq!(reversed.remote, tuple.local);
        assert_eq!(reversed.reverse(), tuple);
    }
}
