use crate::{
    address::{Endpoint, FourTuple},
    channels::Channels,
    engine::Stage,
    types::{RxPacket, SegmentMeta, TaggedMeta},
    wire::{to_words, TcpHeader, Word},
};
use std::collections::VecDeque;

/// Verifies each segment's checksum and splits it into metadata and a
/// payload word stream.
///
/// A segment is held in full until verified. Metadata of a valid segment goes
/// to the resolver; its payload, if any, follows one word per step. Invalid
/// segments vanish here.
#[derive(Debug, Default)]
pub struct ChecksumValidator {
    payload: VecDeque<Word>,
}

impl ChecksumValidator {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(packet: &RxPacket) -> Option<(TaggedMeta, &[u8])> {
        let header = match TcpHeader::from_segment(&packet.segment, packet.src, packet.dst) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(src = %packet.src, error = %e, "Dropping invalid segment");
                return None;
            }
        };
        let payload = &packet.segment[header.bytes()..];
        let meta = SegmentMeta {
            seq: header.seq,
            ack: header.ack,
            window: header.wnd,
            length: payload.len() as u32,
            ctl: header.ctl,
        };
        let tuple = FourTuple::new(
            Endpoint::new(packet.dst, header.dst_port),
            Endpoint::new(packet.src, header.src_port),
        );
        Some((TaggedMeta { meta, tuple }, payload))
    }
}

impl Stage for ChecksumValidator {
    fn step(&mut self, ch: &mut Channels) {
        if let Some(word) = self.payload.front() {
            if ch.rx_payload.push(*word).is_ok() {
                self.payload.pop_front();
            }
            return;
        }

        if ch.validated.is_full() {
            return;
        }
        let Some(packet) = ch.rx_packets.pop() else {
            return;
        };
        if let Some((tagged, payload)) = Self::validate(&packet) {
            self.payload.extend(to_words(payload));
            let _ = ch.validated.push(tagged);
        }
    }

    fn is_idle(&self) -> bool {
        self.payload.is_empty()
    }
}
