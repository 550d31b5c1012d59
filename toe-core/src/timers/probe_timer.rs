use super::Cursor;
use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    types::{Event, EventKind, SessionId},
};

/// Asks for a zero-window probe when a peer's window stays closed.
///
/// The segment builder arms the timer when it runs into a closed window and
/// the state machine disarms it when an acknowledgment or FIN arrives.
/// Clears are served before sets.
#[derive(Debug)]
pub struct ProbeTimer {
    remaining: Vec<Option<u32>>,
    cursor: Cursor,
    interval: u32,
}

impl ProbeTimer {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            remaining: vec![None; config.max_sessions as usize],
            cursor: Cursor::default(),
            interval: config.rounds(config.probe_interval),
        }
    }

    pub fn is_armed(&self, session: SessionId) -> bool {
        matches!(self.remaining.get(session.index()), Some(Some(_)))
    }

    fn slot(&mut self, session: SessionId) -> Option<&mut Option<u32>> {
        let slot = self.remaining.get_mut(session.index());
        if slot.is_none() {
            tracing::error!(%session, "Probe timer request for a session beyond the table");
        }
        slot
    }

    fn scan(&mut self, ch: &mut Channels) -> bool {
        let slot = self.cursor.current();
        let Some(Some(remaining)) = self.remaining.get_mut(slot) else {
            return true;
        };
        if *remaining > 1 {
            *remaining -= 1;
            return true;
        }
        if ch.probe_events.is_full() {
            return false;
        }
        let session = SessionId::new(slot as u16);
        tracing::debug!(%session, "Requesting a window probe");
        let _ = ch.probe_events.push(Event::new(EventKind::Tx, session));
        self.remaining[slot] = None;
        true
    }
}

impl Stage for ProbeTimer {
    fn step(&mut self, ch: &mut Channels) {
        if let Some(session) = ch.probe_clears.pop() {
            if let Some(slot) = self.slot(session) {
                *slot = None;
            }
        } else if let Some(session) = ch.probe_sets.pop() {
            let interval = self.interval;
            if let Some(slot) = self.slot(session) {
                slot.get_or_insert(interval);
            }
        } else if self.scan(ch) {
            self.cursor.advance(self.remaining.len());
        }
    }
}
