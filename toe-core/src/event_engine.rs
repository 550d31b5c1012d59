use crate::{channels::Channels, engine::Stage, fifo::Fifo, types::Event};

/// Merges the event queues of every stage into the one queue the segment
/// builder reads, one event per step. Sources are served in a fixed order:
/// state machine, resolver, retransmission timer, probe timer, connection
/// requests, then application writes.
#[derive(Debug, Default)]
pub struct EventEngine;

impl EventEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for EventEngine {
    fn step(&mut self, ch: &mut Channels) {
        if ch.events.is_full() {
            return;
        }
        let sources: [&mut Fifo<Event>; 6] = [
            &mut ch.fsm_events,
            &mut ch.resolver_events,
            &mut ch.retransmit_events,
            &mut ch.probe_events,
            &mut ch.tx_app_events,
            &mut ch.app_writer_events,
        ];
        if let Some(event) = sources.into_iter().find_map(|source| source.pop()) {
            tracing::trace!(kind = ?event.kind, target = ?event.target, "Event out");
            let _ = ch.events.push(event);
        }
    }
}
