use crate::address::Ipv4Address;

/// The IP protocol number of TCP, as carried in the pseudo-header.
pub const PROTOCOL_TCP: u8 = 6;

/// A calculator for the ones-complement checksum used by TCP.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u16);

impl Checksum {
    /// Creates a new checksum calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a checksum with the 12-byte TCP pseudo-header: source address,
    /// destination address, a zero byte, the protocol number and the length
    /// of the TCP header plus payload.
    pub fn with_pseudo_header(src: Ipv4Address, dst: Ipv4Address, tcp_length: u16) -> Self {
        let mut checksum = Self::new();
        checksum.add_u32(src.to_bytes());
        checksum.add_u32(dst.to_bytes());
        checksum.add_u8(0, PROTOCOL_TCP);
        checksum.add_u16(tcp_length);
        checksum
    }

    /// Adds a `u16` to the checksum value with end-around carry.
    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    /// Adds the `u16` formed by two bytes in network order.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds two `u16`s by splitting four network-order bytes in half.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds a byte slice two bytes at a time. An odd trailing byte is padded
    /// with zero.
    pub fn accumulate(&mut self, bytes: &[u8]) {
        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            self.add_u8(pair[0], pair[1]);
        }
        if let [last] = pairs.remainder() {
            self.add_u8(*last, 0);
        }
    }

    /// The value to place in a header whose checksum field was summed as zero.
    pub fn as_u16(&self) -> u16 {
        !self.0
    }

    /// Whether data summed together with its own checksum field verifies.
    pub fn verifies(&self) -> bool {
        self.0 == 0xffff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        // Example from RFC 1071 section 3
        let mut checksum = Checksum::new();
        checksum.accumulate(&[0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7]);
        assert_eq!(checksum.as_u16(), !0xddf2);
    }

    #[test]
    fn odd_length_is_zero_padded() {
        let mut odd = Checksum::new();
        odd.accumulate(&[0x12, 0x34, 0x56]);
        let mut padded = Checksum::new();
        padded.accumulate(&[0x12, 0x34, 0x56, 0x00]);
        assert_eq!(odd, padded);
    }

    #[test]
    fn summing_checksum_verifies() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0x01];
        let mut checksum = Checksum::with_pseudo_header(
            Ipv4Address::new([10, 0, 0, 1]),
            Ipv4Address::new([10, 0, 0, 2]),
            data.len() as u16,
        );
        checksum.accumulate(&data);
        let field = checksum.as_u16();

        let mut verify = Checksum::with_pseudo_header(
            Ipv4Address::new([10, 0, 0, 1]),
            Ipv4Address::new([10, 0, 0, 2]),
            data.len() as u16,
        );
        verify.accumulate(&data);
        verify.add_u16(field);
        assert!(verify.verifies());
    }
}
