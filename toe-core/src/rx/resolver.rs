use crate::{
    channels::Channels,
    engine::Stage,
    logging::segment_event,
    tables::LookupRequest,
    types::{Event, ResolvedSegment, TaggedMeta, Verdict},
};

#[derive(Debug)]
enum Pending {
    Port(TaggedMeta),
    Session(TaggedMeta),
}

/// Finds the session a validated segment belongs to.
///
/// Segments to closed ports are answered with a reset unless they are resets
/// themselves. Segments to open ports without a session are dropped unless
/// they open a connection. Each segment with payload gets exactly one vote.
#[derive(Debug, Default)]
pub struct PortSessionResolver {
    pending: Option<Pending>,
}

impl PortSessionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reset that answers a segment to a closed port.
    fn reset_for(tagged: &TaggedMeta) -> Event {
        let meta = &tagged.meta;
        let ack = meta.end();
        let seq = meta.ctl.ack().then_some(meta.ack);
        Event::rst_to(tagged.tuple, seq, ack)
    }

    fn vote(ch: &mut Channels, tagged: &TaggedMeta, verdict: Verdict) {
        if tagged.meta.length > 0 {
            let _ = ch.resolver_verdicts.push(verdict);
        }
    }
}

impl Stage for PortSessionResolver {
    fn step(&mut self, ch: &mut Channels) {
        match self.pending.take() {
            None => {
                if ch.ports.resolver.request.is_full() {
                    return;
                }
                if let Some(tagged) = ch.validated.pop() {
                    segment_event(tagged.tuple, &tagged.meta);
                    let _ = ch.ports.resolver.request.push(tagged.tuple.local.port);
                    self.pending = Some(Pending::Port(tagged));
                }
            }
            Some(Pending::Port(tagged)) => {
                let ready = !ch.ports.resolver.reply.is_empty()
                    && !ch.resolver_verdicts.is_full()
                    && !ch.resolver_events.is_full()
                    && !ch.lookup.resolver.request.is_full();
                if !ready {
                    self.pending = Some(Pending::Port(tagged));
                    return;
                }
                let Some(reply) = ch.ports.resolver.reply.pop() else {
                    return;
                };
                if reply.open {
                    let ctl = tagged.meta.ctl;
                    let create = ctl.syn() && !ctl.rst() && !ctl.fin();
                    let _ = ch.lookup.resolver.request.push(LookupRequest {
                        tuple: tagged.tuple,
                        create,
                    });
                    self.pending = Some(Pending::Session(tagged));
                } else {
                    tracing::debug!(port = reply.port, "Segment for a closed port");
                    if !tagged.meta.ctl.rst() {
                        let _ = ch.resolver_events.push(Self::reset_for(&tagged));
                    }
                    Self::vote(ch, &tagged, Verdict::Drop);
                }
            }
            Some(Pending::Session(tagged)) => {
                let ready = !ch.lookup.resolver.reply.is_empty()
                    && !ch.resolver_verdicts.is_full()
                    && !ch.resolved.is_full();
                if !ready {
                    self.pending = Some(Pending::Session(tagged));
                    return;
                }
                let Some(reply) = ch.lookup.resolver.reply.pop() else {
                    return;
                };
                match reply.session {
                    Some(session) => {
                        let _ = ch.resolved.push(ResolvedSegment {
                            session,
                            src_addr: tagged.tuple.remote.address,
                            dst_port: tagged.tuple.local.port,
                            meta: tagged.meta,
                        });
                        Self::vote(ch, &tagged, Verdict::Keep);
                    }
                    None => {
                        tracing::debug!(tuple = %tagged.tuple, "Segment without a session");
                        Self::vote(ch, &tagged, Verdict::Drop);
                    }
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{Endpoint, FourTuple, Ipv4Address},
        config::ToeConfig,
        tables::{PortTable, SessionLookup},
        types::{EventKind, EventTarget, SegmentMeta},
        wire::Control,
    };

    struct Rig {
        ch: Channels,
        resolver: PortSessionResolver,
        ports: PortTable,
        lookup: SessionLookup,
    }

    impl Rig {
        fn new() -> Self {
            let config = ToeConfig::default().max_sessions(4);
            let mut ports = PortTable::new();
            ports.listen(80);
            Self {
                ch: Channels::new(&config),
                resolver: PortSessionResolver::new(),
                ports,
                lookup: SessionLookup::new(4),
            }
        }

        fn run(&mut self, tagged: TaggedMeta) {
            self.ch.validated.push(tagged).unwrap();
            for _ in 0..8 {
                self.resolver.step(&mut self.ch);
                self.ports.step(&mut self.ch);
                self.lookup.step(&mut self.ch);
            }
        }
    }

    fn tagged(port: u16, ctl: Control, length: u32) -> TaggedMeta {
        TaggedMeta {
            meta: SegmentMeta {
                seq: 100,
                ack: 7,
                window: 1000,
                length,
                ctl,
            },
            tuple: FourTuple::new(
                Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), port),
                Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 5000),
            ),
        }
    }

    const SYN: Control = Control::new(false, false, false, false, true, false);
    const ACK: Control = Control::new(false, true, false, false, false, false);
    const RST: Control = Control::new(false, false, false, true, false, false);

    #[test]
    fn closed_port_is_reset() {
        let mut rig = Rig::new();
        rig.run(tagged(9999, ACK, 10));
        let event = rig.ch.resolver_events.pop().unwrap();
        assert_eq!(event.kind, EventKind::Rst);
        assert_eq!(event.ack, Some(110));
        assert_eq!(event.seq, Some(7));
        assert!(matches!(event.target, EventTarget::Tuple(tuple) if tuple.local.port == 9999));
        assert_eq!(rig.ch.resolver_verdicts.pop(), Some(Verdict::Drop));
        assert_eq!(rig.lookup.live_sessions(), 0);
        assert!(rig.ch.resolved.is_empty());
    }

    #[test]
    fn syn_to_closed_port_acks_the_syn() {
        let mut rig = Rig::new();
        rig.run(tagged(9999, SYN, 0));
        let event = rig.ch.resolver_events.pop().unwrap();
        assert_eq!(event.ack, Some(101));
        assert_eq!(event.seq, None);
        assert!(rig.ch.resolver_verdicts.is_empty());
    }

    #[test]
    fn reset_to_closed_port_is_ignored() {
        let mut rig = Rig::new();
        rig.run(tagged(9999, RST, 0));
        assert!(rig.ch.resolver_events.is_empty());
    }

    #[test]
    fn syn_creates_session() {
        let mut rig = Rig::new();
        rig.run(tagged(80, SYN, 0));
        let resolved = rig.ch.resolved.pop().unwrap();
        assert_eq!(resolved.dst_port, 80);
        assert_eq!(resolved.src_addr, Ipv4Address::new([10, 0, 0, 2]));
        assert_eq!(rig.lookup.live_sessions(), 1);
    }

    #[test]
    fn unknown_session_is_dropped_silently() {
        let mut rig = Rig::new();
        rig.run(tagged(80, ACK, 5));
        assert!(rig.ch.resolved.is_empty());
        assert!(rig.ch.resolver_events.is_empty());
        assert_eq!(rig.ch.resolver_verdicts.pop(), Some(Verdict::Drop));
        assert_eq!(rig.lookup.live_sessions(), 0);
    }
}
