//! Per-session timers. Each one keeps an entry per session slot and visits one
//! slot per step, so a countdown is measured in scan rounds.

use crate::types::{EventKind, SessionId};

mod close_timer;
pub use close_timer::CloseTimer;

mod probe_timer;
pub use probe_timer::ProbeTimer;

mod retransmit;
pub use retransmit::RetransmitTimer;

/// What the state machine asks of a session's retransmission timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOp {
    /// Restart an armed timer at the first stage and forget past retries
    Load,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitCommand {
    pub session: SessionId,
    pub op: TimerOp,
}

/// Arms a retransmission timer after the segment builder sent a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitSet {
    pub session: SessionId,
    pub kind: EventKind,
}

/// Round-robin position over the session slots.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor(usize);

impl Cursor {
    fn current(self) -> usize {
        self.0
    }

    fn advance(&mut self, slots: usize) {
        self.0 = (self.0 + 1) % slots.max(1);
    }
}
