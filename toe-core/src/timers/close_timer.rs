use super::Cursor;
use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    tables::StateRequest,
    types::{SessionId, TcpState},
};

/// Moves sessions out of TIME_WAIT once the wait is over.
#[derive(Debug)]
pub struct CloseTimer {
    /// Scan rounds left for every waiting session
    remaining: Vec<Option<u32>>,
    cursor: Cursor,
    time_wait: u32,
}

impl CloseTimer {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            remaining: vec![None; config.max_sessions as usize],
            cursor: Cursor::default(),
            time_wait: config.rounds(config.time_wait),
        }
    }

    pub fn is_armed(&self, session: SessionId) -> bool {
        matches!(self.remaining.get(session.index()), Some(Some(_)))
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
        if ch.state.close.request.is_full() {
            return false;
        }
        let session = SessionId::new(slot as u16);
        tracing::debug!(%session, "TIME_WAIT over");
        let _ = ch.state.close.request.push(StateRequest::Release {
            session,
            from: Some(TcpState::TimeWait),
        });
        self.remaining[slot] = None;
        true
    }
}

impl Stage for CloseTimer {
    fn step(&mut self, ch: &mut Channels) {
        if let Some(session) = ch.close_timer_sets.pop() {
            match self.remaining.get_mut(session.index()) {
                Some(slot) => *slot = Some(self.time_wait),
                None => tracing::error!(%session, "Close timer set for a session beyond the table"),
            }
        } else if self.scan(ch) {
            self.cursor.advance(self.remaining.len());
        }
    }
}
