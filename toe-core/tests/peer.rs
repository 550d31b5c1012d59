//! A remote TCP and a segment builder wrapped around an engine, for driving
//! whole connections from tests.

use etherparse::{PacketBuilder, PacketBuilderStep, TcpHeader};
use toe_core::{
    Endpoint, Engine, Event, EventKind, FourTuple, Ipv4Address, RxPacket, SessionId, ToeConfig,
    TxSent,
};

pub const LOCAL: [u8; 4] = [10, 0, 0, 1];
pub const REMOTE: [u8; 4] = [10, 0, 0, 2];
pub const ISS: u32 = 5000;

/// IPv4 header without options
const IPV4_HEADER_BYTES: usize = 20;

pub type Tcp = PacketBuilderStep<TcpHeader>;

pub fn config() -> ToeConfig {
    ToeConfig::default()
        .max_sessions(8)
        .buffer_size(1024)
        .fixed_iss(ISS)
}

/// Builds a segment from `REMOTE:src_port` to `LOCAL:dst_port`.
pub fn packet(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    payload: &[u8],
    flags: impl FnOnce(Tcp) -> Tcp,
) -> RxPacket {
    let builder = flags(PacketBuilder::ipv4(REMOTE, LOCAL, 64).tcp(src_port, dst_port, seq, 1000));
    let mut bytes = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut bytes, payload).unwrap();
    RxPacket {
        src: Ipv4Address::new(REMOTE),
        dst: Ipv4Address::new(LOCAL),
        segment: bytes.split_off(IPV4_HEADER_BYTES),
    }
}

pub fn tuple(local_port: u16, remote_port: u16) -> FourTuple {
    FourTuple::new(
        Endpoint::new(Ipv4Address::new(LOCAL), local_port),
        Endpoint::new(Ipv4Address::new(REMOTE), remote_port),
    )
}

/// An engine plus a segment builder that reports every segment as sent the
/// moment its event comes out.
pub struct Harness {
    pub engine: Engine,
    /// Every event the engine emitted, in order
    pub sent: Vec<Event>,
}

impl Harness {
    pub fn new(config: ToeConfig) -> Self {
        Self {
            engine: Engine::new(config).unwrap(),
            sent: Vec::new(),
        }
    }

    /// Steps until the engine has nothing left to do.
    pub fn settle(&mut self) {
        for _ in 0..10_000 {
            self.step();
            if self.engine.is_idle() {
                return;
            }
        }
        panic!("Engine did not settle");
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    pub fn deliver(&mut self, packet: RxPacket) {
        self.engine.push_packet(packet).unwrap();
        self.settle();
    }

    fn step(&mut self) {
        self.engine.step();
        while let Some(event) = self.engine.pop_event() {
            self.transmit(event);
        }
    }

    fn transmit(&mut self, event: Event) {
        self.sent.push(event);
        let Some(session) = event.session() else {
            return;
        };
        if !event.kind.is_retransmitted() {
            return;
        }
        // A SYN's window may not be written yet when its event comes out
        let next_byte = match (event.kind, event.seq) {
            (EventKind::Syn | EventKind::SynAck, Some(iss)) => iss.wrapping_add(1),
            (kind, _) => {
                let advance = match kind {
                    EventKind::Fin if event.retries == 0 => 1,
                    EventKind::Tx => event.length,
                    _ => 0,
                };
                let Some(window) = self.engine.tx_window(session) else {
                    return;
                };
                window.next_byte.wrapping_add(advance)
            }
        };
        self.engine
            .report_sent(TxSent {
                session,
                kind: event.kind,
                next_byte,
            })
            .unwrap();
    }

    /// Takes the events sent so far.
    pub fn take_sent(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.sent)
    }

    /// Opens a connection from `REMOTE:remote_port` to the listening
    /// `LOCAL:80`, with the peer's first sequence number at `peer_iss`.
    /// Returns the session.
    pub fn accept(&mut self, remote_port: u16, peer_iss: u32) -> SessionId {
        self.engine.listen(80).unwrap();
        self.settle();
        self.engine.pop_listen_reply();
        self.deliver(packet(remote_port, 80, peer_iss, &[], |tcp| tcp.syn()));
        self.deliver(packet(
            remote_port,
            80,
            peer_iss.wrapping_add(1),
            &[],
            |tcp| tcp.ack(ISS + 1),
        ));
        // The establishment notification
        self.engine.pop_notification();
        self.take_sent();
        self.engine.session(&tuple(80, remote_port)).unwrap()
    }

    /// Reads `length` received bytes the way the application would.
    pub fn read(&mut self, session: SessionId, length: u32) -> Vec<u8> {
        self.engine
            .push_read(toe_core::ReadRequest { session, length })
            .unwrap();
        let mut words = Vec::new();
        for _ in 0..10_000 {
            self.step();
            while let Some(word) = self.engine.pop_read_data() {
                let last = word.last;
                words.push(word);
                if last {
                    assert_eq!(self.engine.pop_read_session(), Some(session));
                    return toe_core::wire::from_words(&words);
                }
            }
        }
        panic!("Read did not finish");
    }
}
