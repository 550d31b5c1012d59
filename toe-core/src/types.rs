//! Messages exchanged between the pipeline stages and with the outside.

use crate::{
    address::{FourTuple, Ipv4Address},
    wire::Control,
};
use std::fmt::{self, Display};

/// A dense handle naming one live connection. Also the index of the
/// connection's slot in every per-session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionId(u16);

impl SessionId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// The table slot for this session.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn into_inner(self) -> u16 {
        self.0
    }
}

impl From<u16> for SessionId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state of one session. LISTEN is not a per-session state here: a port
/// is listening when the port table says so, and a session created for an
/// incoming SYN starts out `Closed`.
///
/// ```text
///                 +---------+  rcv SYN, snd SYN,ACK   +----------+
///                 | CLOSED  |------------------------>| SYN RCVD |
///                 +---------+                         +----------+
///       open, snd SYN  |                  rcv ACK of SYN |
///                      V                                 V
///                 +----------+  rcv SYN,ACK, snd ACK  +-------+
///                 | SYN SENT |----------------------->| ESTAB |
///                 +----------+                        +-------+
///              close, snd FIN |            rcv FIN, snd FIN |
///                             V                             V
///   +-------------+ rcv FIN +-----------+          +----------+
///   |   CLOSING   |<--------| FIN WAIT1 |          | LAST ACK |
///   +-------------+         +-----------+          +----------+
///    rcv ACK |     rcv ACK of FIN |  \ rcv FIN+ACK     | rcv ACK
///            V                    V   \                V
///   +-----------+  rcv FIN  +-----------+         +---------+
///   | TIME WAIT |<----------| FIN WAIT2 |         | CLOSED  |
///   +-----------+           +-----------+         +---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TcpState {
    /// No connection, or a session slot freshly assigned to an incoming SYN.
    #[default]
    Closed,
    /// Waiting for a matching connection request after having sent a connection
    /// request.
    SynSent,
    /// Waiting for a confirming connection request acknowledgment after having
    /// both received and sent a connection request.
    SynReceived,
    /// An open connection, data received can be delivered to the user. The
    /// normal state for the data transfer phase of the connection.
    Established,
    /// Waiting for a connection termination request from the remote TCP, or an
    /// acknowledgment of the connection termination request previously sent.
    FinWait1,
    /// Waiting for a connection termination request from the remote TCP.
    FinWait2,
    /// Waiting for a connection termination request acknowledgment from the
    /// remote TCP.
    Closing,
    /// Waiting for enough time to pass to be sure the remote TCP received the
    /// acknowledgment of its connection termination request.
    TimeWait,
    /// Waiting for an acknowledgment of the connection termination request
    /// previously sent to the remote TCP (which includes an acknowledgment of
    /// its connection termination request).
    LastAck,
}

impl TcpState {
    /// Whether both sides have exchanged initial sequence numbers.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, Self::Closed | Self::SynSent | Self::SynReceived)
    }
}

/// A packet handed to the engine by the IP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Source address from the IP header
    pub src: Ipv4Address,
    /// Destination address from the IP header
    pub dst: Ipv4Address,
    /// The TCP header and payload
    pub segment: Vec<u8>,
}

/// The fields of a validated segment that drive state processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentMeta {
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    /// Payload bytes, control flags excluded
    pub length: u32,
    pub ctl: Control,
}

impl SegmentMeta {
    /// The sequence number that follows this segment.
    pub fn end(&self) -> u32 {
        self.seq
            .wrapping_add(self.length)
            .wrapping_add(self.ctl.syn() as u32 + self.ctl.fin() as u32)
    }
}

/// A validated segment together with the connection it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedMeta {
    pub meta: SegmentMeta,
    pub tuple: FourTuple,
}

/// A segment whose session is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSegment {
    pub session: SessionId,
    pub src_addr: Ipv4Address,
    pub dst_port: u16,
    pub meta: SegmentMeta,
}

/// Whether a stage wants a segment's payload kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

impl Verdict {
    pub fn keep(self) -> bool {
        self == Self::Keep
    }
}

/// The kinds of segment the Tx engine is asked to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Syn,
    SynAck,
    Ack,
    AckNoDelay,
    Rst,
    Fin,
    /// New data is ready in the transmit buffer
    Tx,
    /// Resend from the oldest unacknowledged byte
    Rt,
}

impl EventKind {
    /// Whether a segment of this kind is covered by the retransmission timer.
    pub fn is_retransmitted(self) -> bool {
        matches!(
            self,
            Self::Syn | Self::SynAck | Self::Fin | Self::Tx | Self::Rt
        )
    }
}

/// Where an event's segment goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Session(SessionId),
    /// A peer without a session, used for resets to closed ports
    Tuple(FourTuple),
}

/// A request to the Tx engine to build and send one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub target: EventTarget,
    /// Sequence number to use instead of the session's
    pub seq: Option<u32>,
    /// Acknowledgment number to use instead of the session's
    pub ack: Option<u32>,
    /// Payload bytes for `Tx` events
    pub length: u32,
    /// How many times the segment has been retransmitted
    pub retries: u8,
}

impl Event {
    pub fn new(kind: EventKind, session: SessionId) -> Self {
        Self {
            kind,
            target: EventTarget::Session(session),
            seq: None,
            ack: None,
            length: 0,
            retries: 0,
        }
    }

    /// A reset for a peer that has no session.
    pub fn rst_to(tuple: FourTuple, seq: Option<u32>, ack: u32) -> Self {
        Self {
            kind: EventKind::Rst,
            target: EventTarget::Tuple(tuple),
            seq,
            ack: Some(ack),
            length: 0,
            retries: 0,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }

    /// The session this event belongs to, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self.target {
            EventTarget::Session(session) => Some(session),
            EventTarget::Tuple(_) => None,
        }
    }
}

/// How a notification's session is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationStatus {
    #[default]
    Ok,
    /// The peer reset the connection
    Reset,
    /// The retransmission timer gave up
    TimedOut,
    /// The payload could not be stored
    WriteFailed,
}

/// Tells the application that data or a connection event is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppNotification {
    pub session: SessionId,
    /// Bytes newly readable, zero for pure connection events
    pub length: u32,
    pub src_addr: Ipv4Address,
    pub dst_port: u16,
    /// The connection is closing or closed
    pub closed: bool,
    pub status: NotificationStatus,
}

impl AppNotification {
    pub fn data(session: SessionId, length: u32, src_addr: Ipv4Address, dst_port: u16) -> Self {
        Self {
            session,
            length,
            src_addr,
            dst_port,
            closed: false,
            status: NotificationStatus::Ok,
        }
    }

    /// A zero-length notification.
    pub fn event(session: SessionId, src_addr: Ipv4Address, dst_port: u16) -> Self {
        Self::data(session, 0, src_addr, dst_port)
    }

    pub fn closing(mut self) -> Self {
        self.closed = true;
        self
    }

    pub fn with_status(mut self, status: NotificationStatus) -> Self {
        self.status = status;
        self
    }
}

/// Payload accepted by the state machine, waiting to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub session: SessionId,
    pub src_addr: Ipv4Address,
    pub dst_port: u16,
    pub length: u32,
    /// Physical address of the first byte
    pub address: u64,
    /// Whether the write runs past the end of the session's buffer
    pub split_across_wrap: bool,
}

/// The result of an active open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenStatus {
    pub session: SessionId,
    pub success: bool,
    pub state: TcpState,
}

/// An application request for received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub session: SessionId,
    pub length: u32,
}

/// An application request to send bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub session: SessionId,
    pub length: u32,
}

/// Why a write was accepted or refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,
    NoSpace,
    NoConnection,
}

/// The engine's answer to a [`WriteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReply {
    pub session: SessionId,
    pub status: WriteStatus,
    /// Free transmit buffer bytes after this write
    pub space_left: u32,
}

/// The Tx engine's report that a segment left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSent {
    pub session: SessionId,
    pub kind: EventKind,
    /// The session's next sequence number after this segment
    pub next_byte: u32,
}
