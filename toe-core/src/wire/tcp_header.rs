use super::checksum::Checksum;
use crate::address::Ipv4Address;
use thiserror::Error as ThisError;

/// The number of 32-bit words in a TCP header without options
pub const BASE_HEADER_WORDS: u8 = 5;
/// The number of bytes in a TCP header without options
pub const BASE_HEADER_OCTETS: usize = BASE_HEADER_WORDS as usize * 4;

/// The data for a TCP header. Fields hold host-order values; conversion to
/// and from network order happens only in [`TcpHeader::from_segment`] and
/// [`TcpHeader::serialize`].
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct TcpHeader {
    /// The source port number
    pub src_port: u16,
    /// The destination port number
    pub dst_port: u16,
    /// The sequence number of the first data octet in this segment (except when
    /// SYN is present). If SYN is present the sequence number is the initial
    /// sequence number (ISN) and the first data octet is ISN+1.
    pub seq: u32,
    /// If the ACK control bit is set this field contains the value of the next
    /// sequence number the sender of the segment is expecting to receive.
    pub ack: u32,
    /// The number of 32-bit words in the TCP header, options included
    pub data_offset: u8,
    /// Flags that adjust how segments are handled
    pub ctl: Control,
    /// The number of data octets beginning with the one indicated in the
    /// acknowledgment field which the sender of this segment is willing to
    /// accept.
    pub wnd: u16,
    /// Offset from the sequence number of the octet following urgent data.
    pub urg: u16,
    /// The header checksum
    pub checksum: u16,
}

impl TcpHeader {
    /// Parses the header at the start of a full TCP segment and verifies the
    /// checksum over the pseudo-header, header, options and payload.
    pub fn from_segment(
        segment: &[u8],
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        if segment.len() < BASE_HEADER_OCTETS {
            Err(ParseError::HeaderTooShort)?
        }
        let tcp_length: u16 = segment
            .len()
            .try_into()
            .map_err(|_| ParseError::PacketTooLong)?;

        let word = |i: usize| u16::from_be_bytes([segment[i], segment[i + 1]]);
        let long = |i: usize| {
            u32::from_be_bytes([segment[i], segment[i + 1], segment[i + 2], segment[i + 3]])
        };

        let data_offset = segment[12] >> 4;
        if data_offset < BASE_HEADER_WORDS {
            Err(ParseError::DataOffsetTooSmall(data_offset))?
        }
        if data_offset as usize * 4 > segment.len() {
            Err(ParseError::HeaderTooShort)?
        }

        let mut checksum = Checksum::with_pseudo_header(src_address, dst_address, tcp_length);
        checksum.accumulate(segment);
        let expected = word(16);
        if !checksum.verifies() {
            // Recompute with the field zeroed to report what it should be
            let mut actual = Checksum::with_pseudo_header(src_address, dst_address, tcp_length);
            actual.accumulate(&segment[..16]);
            actual.accumulate(&segment[18..]);
            Err(ParseError::Checksum {
                actual: actual.as_u16(),
                expected,
            })?
        }

        Ok(Self {
            src_port: word(0),
            dst_port: word(2),
            seq: long(4),
            ack: long(8),
            data_offset,
            ctl: Control::from(segment[13] & 0b11_1111),
            wnd: word(14),
            checksum: expected,
            urg: word(18),
        })
    }

    /// Size of the header in bytes, options included.
    pub fn bytes(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Convert the header to its serialized format, ready to attach to a
    /// payload and send over the wire. Options are not carried.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BASE_HEADER_OCTETS);
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(self.data_offset << 4);
        out.push(self.ctl.into());
        out.extend_from_slice(&self.wnd.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.urg.to_be_bytes());
        out
    }
}

/// An error that occurred while parsing a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    #[error("Too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("The segment length could not fit into a u16")]
    PacketTooLong,
    #[error("Data offset {0} is smaller than the minimum header")]
    DataOffsetTooSmall(u8),
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
}

/// Used for building a serialized TCP header
#[derive(Debug)]
pub struct TcpHeaderBuilder(TcpHeader);

impl TcpHeaderBuilder {
    /// Initialize the TCP header with defaults and the given values
    pub fn new(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self(TcpHeader {
            src_port,
            dst_port,
            seq,
            wnd: 0,
            ack: 0,
            urg: 0,
            ctl: Control::default(),

            // Filled in by .build()
            data_offset: 0,
            checksum: 0,
        })
    }

    /// Set the window size
    pub fn wnd(mut self, wnd: u16) -> Self {
        self.0.wnd = wnd;
        self
    }

    /// Set the acknowledgement number
    pub fn ack(mut self, ack: u32) -> Self {
        self.0.ack = ack;
        self.0.ctl.set_ack(true);
        self
    }

    /// Set the psh bit up
    pub fn psh(mut self) -> Self {
        self.0.ctl.set_psh(true);
        self
    }

    /// Set the rst bit up
    pub fn rst(mut self) -> Self {
        self.0.ctl.set_rst(true);
        self
    }

    /// Set the syn bit up
    pub fn syn(mut self) -> Self {
        self.0.ctl.set_syn(true);
        self
    }

    /// Set the fin bit up
    pub fn fin(mut self) -> Self {
        self.0.ctl.set_fin(true);
        self
    }

    /// Fill in the data offset and checksum for the given addresses and
    /// payload.
    pub fn build(
        self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        payload: &[u8],
    ) -> Result<TcpHeader, BuildHeaderError> {
        let length: u16 = (payload.len() + BASE_HEADER_OCTETS)
            .try_into()
            .map_err(|_| BuildHeaderError::OverlyLongPayload)?;

        let mut header = self.0;
        header.data_offset = BASE_HEADER_WORDS;
        header.checksum = 0;

        let mut checksum = Checksum::with_pseudo_header(src_address, dst_address, length);
        checksum.accumulate(&header.serialize());
        checksum.accumulate(payload);
        header.checksum = checksum.as_u16();
        Ok(header)
    }

    /// Build the header and return it followed by the payload.
    pub fn segment(
        self,
        src_address: Ipv4Address,
        dst_address: Ipv4Address,
        payload: &[u8],
    ) -> Result<Vec<u8>, BuildHeaderError> {
        let mut segment = self.build(src_address, dst_address, payload)?.serialize();
        segment.extend_from_slice(payload);
        Ok(segment)
    }
}

/// An error that occurred while building a TCP header
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum BuildHeaderError {
    #[error("The TCP payload is longer than can fit into a single segment")]
    OverlyLongPayload,
}

/// The control bits of a TCP header
#[derive(Default, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Control(u8);

impl Control {
    /// Create a new Control with the given bits
    pub const fn new(urg: bool, ack: bool, psh: bool, rst: bool, syn: bool, fin: bool) -> Self {
        Self(
            fin as u8
                | (syn as u8) << 1
                | (rst as u8) << 2
                | (psh as u8) << 3
                | (ack as u8) << 4
                | (urg as u8) << 5,
        )
    }

    /// Get whether the urgent pointer field is significant
    pub const fn urg(self) -> bool {
        self.bit(5)
    }

    /// Get whether the acknowledgment field significant
    pub const fn ack(self) -> bool {
        self.bit(4)
    }

    /// Set whether the acknowledgment field significant
    pub fn set_ack(&mut self, state: bool) {
        self.set_bit(4, state);
    }

    /// Get whether the push function is enabled
    pub const fn psh(self) -> bool {
        self.bit(3)
    }

    /// Set whether the push function is enabled
    pub fn set_psh(&mut self, state: bool) {
        self.set_bit(3, state);
    }

    /// Get whether to reset the connection
    pub const fn rst(self) -> bool {
        self.bit(2)
    }

    /// Set whether to reset the connection
    pub fn set_rst(&mut self, state: bool) {
        self.set_bit(2, state);
    }

    /// Get whether to synchronize sequence numbers
    pub const fn syn(self) -> bool {
        self.bit(1)
    }

    /// Set whether to synchronize sequence numbers
    pub fn set_syn(&mut self, state: bool) {
        self.set_bit(1, state);
    }

    /// Get whether there is no more data to send
    pub const fn fin(self) -> bool {
        self.bit(0)
    }

    /// Set whether there is no more data to send
    pub fn set_fin(&mut self, state: bool) {
        self.set_bit(0, state);
    }

    /// Get the given bit
    const fn bit(self, bit: u8) -> bool {
        (self.0 >> bit) & 0b1 == 1
    }

    /// Set the given bit
    fn set_bit(&mut self, bit: u8, state: bool) {
        self.0 = (self.0 & !(1 << bit)) | ((state as u8) << bit);
    }
}

impl From<u8> for Control {
    fn from(n: u8) -> Self {
        Self(n)
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        control.0
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.urg(), "URG"),
            (self.ack(), "ACK"),
            (self.psh(), "PSH"),
            (self.rst(), "RST"),
            (self.syn(), "SYN"),
            (self.fin(), "FIN"),
        ];
        write!(f, "Control(")?;
        let mut wrote = false;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if wrote {
                write!(f, ", ")?;
            }
            wrote = true;
            write!(f, "{}", name)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"Hello, world!";
    const SRC_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const DST_ADDRESS: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const SRC_PORT: u16 = 0xcafe;
    const DST_PORT: u16 = 0xbabe;
    const SEQUENCE: u32 = 123456789;
    const WINDOW: u16 = 1024;
    const ACKNOWLEDGEMENT: u32 = 10;

    fn build_expected() -> (etherparse::TcpHeader, Vec<u8>) {
        let mut expected = etherparse::TcpHeader::new(SRC_PORT, DST_PORT, SEQUENCE, WINDOW);
        expected.acknowledgment_number = ACKNOWLEDGEMENT;
        expected.ack = true;
        expected.psh = true;
        let ip_header = etherparse::Ipv4Header::new(
            (expected.header_len() as usize + PAYLOAD.len()) as u16,
            30,
            etherparse::IpNumber::Tcp,
            SRC_ADDRESS.into(),
            DST_ADDRESS.into(),
        );
        expected.checksum = expected.calc_checksum_ipv4(&ip_header, PAYLOAD).unwrap();

        let mut serial = vec![];
        expected.write(&mut serial).unwrap();
        serial.extend_from_slice(PAYLOAD);
        (expected, serial)
    }

    #[test]
    fn parses_segment() {
        let (expected, serial) = build_expected();
        let actual = TcpHeader::from_segment(&serial, SRC_ADDRESS, DST_ADDRESS).unwrap();

        assert_eq!(actual.src_port, SRC_PORT);
        assert_eq!(actual.dst_port, DST_PORT);
        assert_eq!(actual.seq, SEQUENCE);
        assert_eq!(actual.ack, ACKNOWLEDGEMENT);
        assert_eq!(actual.ctl, Control::new(false, true, true, false, false, false));
        assert_eq!(actual.wnd, WINDOW);
        assert_eq!(actual.checksum, expected.checksum);
        assert_eq!(actual.bytes(), BASE_HEADER_OCTETS);
    }

    #[test]
    fn builds_segment() {
        let (_, expected) = build_expected();
        let actual = TcpHeaderBuilder::new(SRC_PORT, DST_PORT, SEQUENCE)
            .wnd(WINDOW)
            .psh()
            .ack(ACKNOWLEDGEMENT)
            .segment(SRC_ADDRESS, DST_ADDRESS, PAYLOAD)
            .unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn wire_fields_are_big_endian() {
        let segment = TcpHeaderBuilder::new(0x1234, 0x5678, 0x0102_0304)
            .ack(0x0a0b_0c0d)
            .wnd(0xbeef)
            .segment(SRC_ADDRESS, DST_ADDRESS, &[])
            .unwrap();
        assert_eq!(&segment[0..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&segment[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&segment[8..12], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(&segment[14..16], &[0xbe, 0xef]);

        let header = TcpHeader::from_segment(&segment, SRC_ADDRESS, DST_ADDRESS).unwrap();
        assert_eq!(header.seq, 0x0102_0304);
        assert_eq!(header.ack, 0x0a0b_0c0d);
        assert_ne!(header.seq, u32::from_le_bytes([0x01, 0x02, 0x03, 0x04]));
    }

    #[test]
    fn rejects_corrupted_segment() {
        let (expected, mut serial) = build_expected();
        let last = serial.len() - 1;
        serial[last] ^= 0xff;
        match TcpHeader::from_segment(&serial, SRC_ADDRESS, DST_ADDRESS) {
            Err(ParseError::Checksum { expected: field, .. }) => {
                assert_eq!(field, expected.checksum)
            }
            other => panic!("unexpected parse result {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_pseudo_header() {
        let (_, serial) = build_expected();
        assert!(matches!(
            TcpHeader::from_segment(&serial, SRC_ADDRESS, Ipv4Address::LOCALHOST),
            Err(ParseError::Checksum { .. })
        ));
    }

    #[test]
    fn rejects_short_and_malformed_headers() {
        assert_eq!(
            TcpHeader::from_segment(&[0; 10], SRC_ADDRESS, DST_ADDRESS),
            Err(ParseError::HeaderTooShort)
        );
        let mut segment = vec![0; BASE_HEADER_OCTETS];
        segment[12] = 4 << 4;
        assert_eq!(
            TcpHeader::from_segment(&segment, SRC_ADDRESS, DST_ADDRESS),
            Err(ParseError::DataOffsetTooSmall(4))
        );
        segment[12] = 15 << 4;
        assert_eq!(
            TcpHeader::from_segment(&segment, SRC_ADDRESS, DST_ADDRESS),
            Err(ParseError::HeaderTooShort)
        );
    }

    #[test]
    fn control_works() {
        let control = Control::new(true, false, true, false, true, false);
        assert!(control.urg());
        assert!(!control.ack());
        assert!(control.psh());
        assert!(!control.rst());
        assert!(control.syn());
        assert!(!control.fin());

        let control = {
            let mut control = Control::default();
            control.set_ack(true);
            control.set_rst(true);
            control.set_fin(true);
            control
        };
        assert!(control.ack());
        assert!(control.rst());
        assert!(control.fin());
        assert_eq!(format!("{:?}", control), "Control(ACK, RST, FIN)");
    }
}
