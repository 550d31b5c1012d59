use super::{Cursor, RetransmitCommand, RetransmitSet, TimerOp};
use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    logging::abort_event,
    tables::StateRequest,
    types::{AppNotification, Event, EventKind, NotificationStatus, OpenStatus, SessionId, TcpState},
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    active: bool,
    /// Scan rounds left before expiry
    remaining: u32,
    retries: u8,
    kind: EventKind,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            active: false,
            remaining: 0,
            retries: 0,
            kind: EventKind::Rt,
        }
    }
}

/// Resends unacknowledged segments with growing timeouts and aborts
/// sessions that stay silent.
///
/// The segment builder arms a session's timer each time it sends something
/// that needs an acknowledgment; the timeout is picked by how many times the
/// segment was already retried. On expiry the stored event is sent again, and
/// once the retry limit is reached the session is released instead, with one
/// failure report: a failed open for a SYN, a timed out notification for
/// anything else.
#[derive(Debug)]
pub struct RetransmitTimer {
    entries: Vec<Entry>,
    cursor: Cursor,
    /// Timeouts in scan rounds, by retry count
    stages: Vec<u32>,
    max_retries: u8,
    /// A session waiting for its four-tuple before being aborted
    aborting: Option<SessionId>,
}

impl RetransmitTimer {
    pub fn new(config: &ToeConfig) -> Self {
        let stages = (0..config.retransmit_stages.len() as u8)
            .map(|retries| config.retransmit_rounds(retries))
            .collect();
        Self {
            entries: vec![Entry::default(); config.max_sessions as usize],
            cursor: Cursor::default(),
            stages,
            max_retries: config.max_retries,
            aborting: None,
        }
    }

    fn timeout(&self, retries: u8) -> u32 {
        let stage = (retries as usize).min(self.stages.len().saturating_sub(1));
        self.stages.get(stage).copied().unwrap_or(1)
    }

    /// Whether a session's timer is armed.
    pub fn is_armed(&self, session: SessionId) -> bool {
        self.entries
            .get(session.index())
            .map_or(false, |entry| entry.active)
    }

    fn command(&mut self, command: RetransmitCommand) {
        let timeout = self.timeout(0);
        let Some(entry) = self.entries.get_mut(command.session.index()) else {
            tracing::error!(session = %command.session, "Timer command for a session beyond the table");
            return;
        };
        match command.op {
            TimerOp::Load => {
                entry.retries = 0;
                if entry.active {
                    entry.remaining = timeout;
                }
            }
            TimerOp::Stop => *entry = Entry::default(),
        }
    }

    fn set(&mut self, set: RetransmitSet) {
        let Some(&Entry { active, retries, .. }) = self.entries.get(set.session.index()) else {
            tracing::error!(session = %set.session, "Timer set for a session beyond the table");
            return;
        };
        if active {
            return;
        }
        let remaining = self.timeout(retries);
        let kind = match set.kind {
            EventKind::Tx => EventKind::Rt,
            kind => kind,
        };
        self.entries[set.session.index()] = Entry {
            active: true,
            remaining,
            retries,
            kind,
        };
    }

    /// Visits one session. Returns false if an expiry could not be handled
    /// for lack of output room, in which case the cursor stays put.
    fn scan(&mut self, ch: &mut Channels) -> bool {
        let slot = self.cursor.current();
        let Some(entry) = self.entries.get_mut(slot) else {
            return true;
        };
        if !entry.active {
            return true;
        }
        if entry.remaining > 1 {
            entry.remaining -= 1;
            return true;
        }

        let session = SessionId::new(slot as u16);
        let retries = entry.retries + 1;
        if retries < self.max_retries {
            if ch.retransmit_events.is_full() {
                return false;
            }
            tracing::debug!(%session, retries, kind = ?entry.kind, "Retransmitting");
            let _ = ch
                .retransmit_events
                .push(Event::new(entry.kind, session).with_retries(retries));
            entry.active = false;
            entry.retries = retries;
            return true;
        }

        if entry.kind == EventKind::Syn {
            if ch.timer_open_status.is_full() || ch.state.retransmit.request.is_full() {
                return false;
            }
            *entry = Entry::default();
            abort_event(session, retries);
            let _ = ch.timer_open_status.push(OpenStatus {
                session,
                success: false,
                state: TcpState::Closed,
            });
            let _ = ch.state.retransmit.request.push(StateRequest::Release {
                session,
                from: None,
            });
        } else {
            if ch.lookup.reverse_timer.request.is_full() {
                return false;
            }
            *entry = Entry::default();
            abort_event(session, retries);
            let _ = ch.lookup.reverse_timer.request.push(session);
            self.aborting = Some(session);
        }
        true
    }

    /// Finishes an abort once the four-tuple is known. Returns whether the
    /// abort is done.
    fn finish_abort(ch: &mut Channels, session: SessionId) -> bool {
        if ch.timer_notifications.is_full() || ch.state.retransmit.request.is_full() {
            return false;
        }
        let Some(reply) = ch.lookup.reverse_timer.reply.pop() else {
            return false;
        };
        match reply.tuple {
            Some(tuple) => {
                let _ = ch.timer_notifications.push(
                    AppNotification::event(session, tuple.remote.address, tuple.local.port)
                        .closing()
                        .with_status(NotificationStatus::TimedOut),
                );
            }
            None => tracing::debug!(%session, "Aborted session was already released"),
        }
        let _ = ch.state.retransmit.request.push(StateRequest::Release {
            session,
            from: None,
        });
        true
    }
}

impl Stage for RetransmitTimer {
    fn step(&mut self, ch: &mut Channels) {
        if let Some(session) = self.aborting {
            if Self::finish_abort(ch, session) {
                self.aborting = None;
            }
            return;
        }
        if let Some(command) = ch.retransmit_commands.pop() {
            self.command(command);
        } else if let Some(set) = ch.retransmit_sets.pop() {
            self.set(set);
        } else if self.scan(ch) {
            self.cursor.advance(self.entries.len());
        }
    }

    fn is_idle(&self) -> bool {
        self.aborting.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{Endpoint, FourTuple, Ipv4Address},
        tables::ReverseReply,
    };
    use std::time::Duration;

    const SESSIONS: u16 = 4;

    /// One round per stage second, so stage n lasts n rounds
    fn config() -> ToeConfig {
        ToeConfig::default()
            .max_sessions(SESSIONS)
            .buffer_size(64)
            .step_period(Duration::from_millis(250))
    }

    fn session() -> SessionId {
        SessionId::new(1)
    }

    fn tuple() -> FourTuple {
        FourTuple::new(
            Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 80),
            Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 40000),
        )
    }

    /// Steps until the timer emits a retransmission or gives up.
    fn run_until_expiry(timer: &mut RetransmitTimer, ch: &mut Channels) -> usize {
        for steps in 1..=10_000 {
            timer.step(ch);
            if !ch.retransmit_events.is_empty() || timer.aborting.is_some() {
                return steps;
            }
            if !ch.timer_open_status.is_empty() {
                return steps;
            }
        }
        panic!("timer never expired");
    }

    #[test]
    fn stages_grow_with_retries() {
        let config = config();
        let mut timer = RetransmitTimer::new(&config);
        let mut ch = Channels::new(&config);
        let mut previous = 0;
        for retries in 1..=3 {
            ch.retransmit_sets
                .push(RetransmitSet {
                    session: session(),
                    kind: EventKind::Tx,
                })
                .unwrap();
            let steps = run_until_expiry(&mut timer, &mut ch);
            assert!(steps > previous);
            previous = steps;
            let event = ch.retransmit_events.pop().unwrap();
            assert_eq!(event.kind, EventKind::Rt);
            assert_eq!(event.retries, retries);
            assert!(!timer.is_armed(session()));
        }
    }

    #[test]
    fn fourth_expiry_aborts_once() {
        let config = config();
        let mut timer = RetransmitTimer::new(&config);
        let mut ch = Channels::new(&config);
        for _ in 0..3 {
            ch.retransmit_sets
                .push(RetransmitSet {
                    session: session(),
                    kind: EventKind::Fin,
                })
                .unwrap();
            run_until_expiry(&mut timer, &mut ch);
            assert_eq!(ch.retransmit_events.pop().map(|event| event.kind), Some(EventKind::Fin));
        }
        ch.retransmit_sets
            .push(RetransmitSet {
                session: session(),
                kind: EventKind::Fin,
            })
            .unwrap();
        run_until_expiry(&mut timer, &mut ch);
        assert!(ch.retransmit_events.is_empty());
        assert_eq!(ch.lookup.reverse_timer.request.pop(), Some(session()));

        // Nothing happens until the lookup answers
        timer.step(&mut ch);
        assert!(ch.timer_notifications.is_empty());
        ch.lookup
            .reverse_timer
            .reply
            .push(ReverseReply {
                session: session(),
                tuple: Some(tuple()),
            })
            .unwrap();
        timer.step(&mut ch);
        assert!(timer.is_idle());

        let notification = ch.timer_notifications.pop().unwrap();
        assert_eq!(notification.status, NotificationStatus::TimedOut);
        assert!(notification.closed);
        assert_eq!(notification.src_addr, Ipv4Address::new([10, 0, 0, 2]));
        assert_eq!(notification.dst_port, 80);
        assert!(ch.timer_notifications.is_empty());
        assert_eq!(
            ch.state.retransmit.request.pop(),
            Some(StateRequest::Release {
                session: session(),
                from: None
            })
        );
    }

    #[test]
    fn syn_abort_fails_the_open() {
        let config = config().max_retries(1);
        let mut timer = RetransmitTimer::new(&config);
        let mut ch = Channels::new(&config);
        ch.retransmit_sets
            .push(RetransmitSet {
                session: session(),
                kind: EventKind::Syn,
            })
            .unwrap();
        run_until_expiry(&mut timer, &mut ch);
        let status = ch.timer_open_status.pop().unwrap();
        assert!(!status.success);
        assert_eq!(status.session, session());
        assert!(ch.lookup.reverse_timer.request.is_empty());
        assert!(ch.state.retransmit.request.pop().is_some());
    }

    #[test]
    fn stop_disarms() {
        let config = config();
        let mut timer = RetransmitTimer::new(&config);
        let mut ch = Channels::new(&config);
        ch.retransmit_sets
            .push(RetransmitSet {
                session: session(),
                kind: EventKind::SynAck,
            })
            .unwrap();
        timer.step(&mut ch);
        assert!(timer.is_armed(session()));
        ch.retransmit_commands
            .push(RetransmitCommand {
                session: session(),
                op: TimerOp::Stop,
            })
            .unwrap();
        timer.step(&mut ch);
        assert!(!timer.is_armed(session()));
        for _ in 0..1000 {
            timer.step(&mut ch);
        }
        assert!(ch.retransmit_events.is_empty());
    }

    #[test]
    fn set_does_not_rearm_an_armed_timer() {
        let config = config().retransmit_stages(vec![Duration::from_secs(10)]);
        let mut timer = RetransmitTimer::new(&config);
        let mut ch = Channels::new(&config);
        let set = RetransmitSet {
            session: session(),
            kind: EventKind::Tx,
        };
        ch.retransmit_sets.push(set).unwrap();
        timer.step(&mut ch);
        let first = timer.entries[session().index()];
        for _ in 0..SESSIONS {
            timer.step(&mut ch);
        }
        ch.retransmit_sets.push(set).unwrap();
        timer.step(&mut ch);
        assert!(timer.entries[session().index()].remaining < first.remaining);
    }

    #[test]
    fn load_resets_retries() {
        let config = config();
        let mut timer = RetransmitTimer::new(&config);
        let mut ch = Channels::new(&config);
        ch.retransmit_sets
            .push(RetransmitSet {
                session: session(),
                kind: EventKind::Tx,
            })
            .unwrap();
        run_until_expiry(&mut timer, &mut ch);
        ch.retransmit_events.pop();
        assert_eq!(timer.entries[session().index()].retries, 1);

        ch.retransmit_commands
            .push(RetransmitCommand {
                session: session(),
                op: TimerOp::Load,
            })
            .unwrap();
        timer.step(&mut ch);
        assert_eq!(timer.entries[session().index()].retries, 0);
    }
}
