//! The TCP state machine of the receive path.
//!
//! For every resolved segment the session's state (locked), receive window
//! and transmit window are read, the segment is processed in one go, and the
//! results are written back together: new state, window updates, timer
//! commands, events for the segment builder, the payload verdict, a buffer
//! write and notifications for the application.

use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    memory::BufferAccess,
    seq::{mod_within, IssGenerator},
    tables::{AckUpdate, RxWindow, RxWindowRequest, StateRequest, TxWindow, TxWindowRequest},
    timers::{RetransmitCommand, TimerOp},
    types::{
        AppNotification, Event, EventKind, NotificationStatus, OpenStatus, PendingWrite,
        ResolvedSegment, SessionId, TcpState, Verdict,
    },
};


/// Largest congestion window that can be advertised
const MAX_CONGESTION_WINDOW: u32 = 0xffff;

/// Everything one segment does to its session.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub state: TcpState,
    pub rx: Option<RxWindowRequest>,
    pub tx: Option<TxWindowRequest>,
    pub events: Vec<Event>,
    /// Whether the payload is accepted
    pub keep: bool,
    pub write: Option<PendingWrite>,
    pub notifications: Vec<AppNotification>,
    pub timer: Option<TimerOp>,
    pub close_timer: bool,
    pub probe_clear: bool,
    /// The result of an active open, if this segment decided it
    pub open: Option<bool>,
}

impl Outcome {
    fn new(state: TcpState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }
}

/// A segment waiting for its table reads.
#[derive(Debug)]
struct InFlight {
    segment: ResolvedSegment,
    state: Option<TcpState>,
    rx: Option<RxWindow>,
    tx: Option<TxWindow>,
}

#[derive(Debug)]
pub struct TcpStateMachine {
    rx_base: u64,
    buffer_size: u32,
    mss: u32,
    iss: IssGenerator,
    in_flight: Option<InFlight>,
}

impl TcpStateMachine {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            rx_base: config.rx_base,
            buffer_size: config.buffer_size,
            mss: config.mss as u32,
            iss: IssGenerator::new(config.fixed_iss),
            in_flight: None,
        }
    }

    /// Decides what a segment does to a session in the given state.
    pub(crate) fn process(
        &mut self,
        segment: &ResolvedSegment,
        state: TcpState,
        rx: RxWindow,
        tx: TxWindow,
    ) -> Outcome {
        let ctl = segment.meta.ctl;
        let mut out = Outcome::new(state);
        if ctl.rst() {
            self.on_rst(segment, state, rx, tx, &mut out);
        } else if ctl.syn() && !ctl.fin() {
            if ctl.ack() {
                self.on_syn_ack(segment, state, tx, &mut out);
            } else {
                self.on_syn(segment, state, rx, tx, &mut out);
            }
        } else if ctl.fin() && ctl.ack() && !ctl.syn() {
            self.on_fin(segment, state, rx, tx, &mut out);
        } else if ctl.ack() && !ctl.syn() && !ctl.fin() {
            self.on_ack(segment, state, rx, tx, &mut out);
        } else {
            tracing::debug!(session = %segment.session, flags = ?ctl, "Ignoring bogus segment");
        }
        out
    }

    fn on_syn(
        &mut self,
        segment: &ResolvedSegment,
        state: TcpState,
        rx: RxWindow,
        tx: TxWindow,
        out: &mut Outcome,
    ) {
        let session = segment.session;
        let meta = &segment.meta;
        match state {
            TcpState::Closed | TcpState::SynSent => {
                if state == TcpState::SynSent {
                    tracing::debug!(%session, seq = meta.seq, "Simultaneous open");
                }
                let recvd = meta.seq.wrapping_add(1);
                let iss = self.iss.next_iss();
                out.rx = Some(RxWindowRequest::Init { session, recvd });
                out.tx = Some(TxWindowRequest::Init {
                    session,
                    iss,
                    peer_window: meta.window,
                    // Crossing SYNs still owe the application its open result
                    active: state == TcpState::SynSent && tx.active_open,
                });
                out.events.push(
                    Event::new(EventKind::SynAck, session)
                        .with_seq(iss)
                        .with_ack(recvd),
                );
                out.state = TcpState::SynReceived;
            }
            TcpState::SynReceived => {
                if meta.seq.wrapping_add(1) == rx.recvd {
                    out.events.push(
                        Event::new(EventKind::SynAck, session)
                            .with_seq(tx.unacked)
                            .with_ack(rx.recvd),
                    );
                } else {
                    tracing::debug!(%session, seq = meta.seq, "Conflicting SYN, resetting");
                    out.events.push(
                        Event::new(EventKind::Rst, session).with_ack(meta.seq.wrapping_add(1)),
                    );
                    out.timer = Some(TimerOp::Stop);
                    out.state = TcpState::Closed;
                    if tx.active_open {
                        out.open = Some(false);
                    }
                }
            }
            _ => out.events.push(Event::new(EventKind::AckNoDelay, session)),
        }
    }

    fn on_syn_ack(
        &mut self,
        segment: &ResolvedSegment,
        state: TcpState,
        tx: TxWindow,
        out: &mut Outcome,
    ) {
        let session = segment.session;
        let meta = &segment.meta;
        if state != TcpState::SynSent {
            tracing::debug!(%session, ?state, "Unexpected SYN-ACK");
            return;
        }
        out.timer = Some(TimerOp::Stop);
        if meta.ack == tx.next_byte {
            let mut window = tx;
            window.unacked = meta.ack;
            window.peer_window = meta.window;
            out.rx = Some(RxWindowRequest::Init {
                session,
                recvd: meta.seq.wrapping_add(1),
            });
            out.tx = Some(TxWindowRequest::Ack {
                session,
                update: AckUpdate::from(&window),
            });
            out.events.push(Event::new(EventKind::AckNoDelay, session));
            out.state = TcpState::Established;
            out.open = Some(true);
        } else {
            tracing::debug!(%session, ack = meta.ack, "SYN-ACK acknowledges the wrong sequence");
            out.events.push(
                Event::new(EventKind::Rst, session)
                    .with_seq(meta.ack)
                    .with_ack(meta.seq.wrapping_add(meta.length).wrapping_add(1)),
            );
            out.state = TcpState::Closed;
            out.open = Some(false);
        }
    }

    fn on_ack(
        &mut self,
        segment: &ResolvedSegment,
        state: TcpState,
        rx: RxWindow,
        tx: TxWindow,
        out: &mut Outcome,
    ) {
        let session = segment.session;
        let meta = &segment.meta;
        let acceptable = matches!(
            state,
            TcpState::SynReceived
                | TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
        );
        if !acceptable {
            tracing::debug!(%session, ?state, "ACK in a state that takes none");
            return;
        }

        let ack = meta.ack;
        let in_window = mod_within(tx.unacked, ack, tx.next_byte);
        let new_ack = in_window && ack != tx.unacked;
        let duplicate = ack == tx.unacked && tx.unacked != tx.next_byte && meta.length == 0;

        let mut window = tx;
        if new_ack {
            out.probe_clear = true;
            window.congestion_window = self.grow(window.congestion_window, window.slow_start_threshold);
            window.dup_acks = 0;
            window.fast_retransmitted = false;
        } else if duplicate {
            window.dup_acks = window.dup_acks.saturating_add(1);
        }
        if in_window {
            window.unacked = ack;
            window.peer_window = meta.window;
        }

        if ack == tx.next_byte {
            out.timer = Some(TimerOp::Stop);
        } else if new_ack {
            out.timer = Some(TimerOp::Load);
        }

        if window.dup_acks == 3 && !window.fast_retransmitted {
            tracing::debug!(%session, unacked = window.unacked, "Fast retransmit");
            window.fast_retransmitted = true;
            window.slow_start_threshold = (window.congestion_window / 2).max(2 * self.mss);
            window.congestion_window = window.slow_start_threshold;
            out.events.push(Event::new(EventKind::Rt, session));
        }
        out.tx = Some(TxWindowRequest::Ack {
            session,
            update: AckUpdate::from(&window),
        });

        if meta.length > 0 {
            if self.accept_payload(segment, rx, out) {
                out.rx = Some(RxWindowRequest::Received {
                    session,
                    recvd: rx.recvd.wrapping_add(meta.length),
                });
            }
            out.events.push(Event::new(EventKind::Ack, session));
        }

        if ack == tx.next_byte {
            match state {
                TcpState::SynReceived => {
                    tracing::info!(%session, "Connection established");
                    out.state = TcpState::Established;
                    if tx.active_open {
                        out.open = Some(true);
                    } else {
                        out.notifications.push(AppNotification::event(
                            session,
                            segment.src_addr,
                            segment.dst_port,
                        ));
                    }
                }
                TcpState::FinWait1 => out.state = TcpState::FinWait2,
                TcpState::Closing => {
                    out.state = TcpState::TimeWait;
                    out.close_timer = true;
                }
                TcpState::LastAck => {
                    tracing::info!(%session, "Connection closed");
                    out.state = TcpState::Closed;
                }
                _ => {}
            }
        }
    }

    fn on_fin(
        &mut self,
        segment: &ResolvedSegment,
        state: TcpState,
        rx: RxWindow,
        tx: TxWindow,
        out: &mut Outcome,
    ) {
        let session = segment.session;
        let meta = &segment.meta;
        let in_order = matches!(
            state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        ) && meta.seq == rx.recvd;
        let fits = meta.length < rx.free_space(self.buffer_size);
        if !in_order || !fits {
            tracing::debug!(%session, ?state, seq = meta.seq, "Ignoring FIN");
            out.events.push(Event::new(EventKind::Ack, session));
            return;
        }

        let mut window = tx;
        if mod_within(tx.unacked, meta.ack, tx.next_byte) {
            window.unacked = meta.ack;
            window.peer_window = meta.window;
        }
        out.tx = Some(TxWindowRequest::Ack {
            session,
            update: AckUpdate::from(&window),
        });
        out.probe_clear = true;
        out.rx = Some(RxWindowRequest::Received {
            session,
            recvd: rx.recvd.wrapping_add(meta.length).wrapping_add(1),
        });

        if meta.length > 0 {
            self.accept_payload(segment, rx, out);
            if let Some(last) = out.notifications.last_mut() {
                last.closed = true;
            }
        } else {
            out.notifications.push(
                AppNotification::event(session, segment.src_addr, segment.dst_port).closing(),
            );
        }

        match state {
            TcpState::Established => {
                out.state = TcpState::LastAck;
                out.events.push(Event::new(EventKind::Fin, session));
            }
            _ => {
                if meta.ack == tx.next_byte {
                    out.state = TcpState::TimeWait;
                    out.close_timer = true;
                    out.timer = Some(TimerOp::Stop);
                } else {
                    out.state = TcpState::Closing;
                }
                out.events.push(Event::new(EventKind::Ack, session));
            }
        }
    }

    fn on_rst(
        &mut self,
        segment: &ResolvedSegment,
        state: TcpState,
        rx: RxWindow,
        tx: TxWindow,
        out: &mut Outcome,
    ) {
        let session = segment.session;
        let meta = &segment.meta;
        match state {
            TcpState::SynSent => {
                if meta.ctl.ack() && meta.ack == tx.next_byte {
                    tracing::info!(%session, "Connection refused");
                    out.open = Some(false);
                    out.timer = Some(TimerOp::Stop);
                    out.state = TcpState::Closed;
                }
            }
            TcpState::Closed => {}
            _ => {
                if meta.seq == rx.recvd {
                    tracing::info!(%session, "Connection reset");
                    out.state = TcpState::Closed;
                    out.timer = Some(TimerOp::Stop);
                    out.probe_clear = true;
                    if state == TcpState::SynReceived && tx.active_open {
                        out.open = Some(false);
                    } else {
                        out.notifications.push(
                            AppNotification::event(session, segment.src_addr, segment.dst_port)
                                .closing()
                                .with_status(NotificationStatus::Reset),
                        );
                    }
                } else {
                    tracing::debug!(%session, seq = meta.seq, "Ignoring stale reset");
                }
            }
        }
    }

    /// Accepts in-order payload that fits the buffer: a buffer write and a
    /// data notification are queued. Returns whether it was accepted.
    fn accept_payload(&self, segment: &ResolvedSegment, rx: RxWindow, out: &mut Outcome) -> bool {
        let meta = &segment.meta;
        let session = segment.session;
        if meta.seq != rx.recvd || rx.free_space(self.buffer_size) <= meta.length {
            tracing::debug!(
                %session,
                seq = meta.seq,
                recvd = rx.recvd,
                length = meta.length,
                "Dropping payload"
            );
            return false;
        }
        let access = BufferAccess::new(self.rx_base, session, self.buffer_size, rx.recvd, meta.length);
        out.write = Some(PendingWrite {
            session,
            src_addr: segment.src_addr,
            dst_port: segment.dst_port,
            length: meta.length,
            address: access.first.address,
            split_across_wrap: access.is_split(),
        });
        out.notifications.push(AppNotification::data(
            session,
            meta.length,
            segment.src_addr,
            segment.dst_port,
        ));
        out.keep = true;
        true
    }

    /// The congestion window after a new acknowledgment.
    fn grow(&self, window: u32, threshold: u32) -> u32 {
        let grown = if window <= threshold.saturating_sub(self.mss) {
            window + self.mss
        } else {
            window + (self.mss * self.mss / window.max(1)).max(1)
        };
        grown.min(MAX_CONGESTION_WINDOW)
    }

    fn outputs_ready(ch: &Channels) -> bool {
        !ch.state.fsm.request.is_full()
            && !ch.rx_window.fsm.request.is_full()
            && !ch.tx_window.fsm.request.is_full()
            && ch.fsm_events.room() >= 2
            && ch.fsm_notifications.room() >= 2
            && !ch.fsm_verdicts.is_full()
            && !ch.pending_writes.is_full()
            && !ch.retransmit_commands.is_full()
            && !ch.close_timer_sets.is_full()
            && !ch.probe_clears.is_full()
            && !ch.fsm_open_status.is_full()
    }

    fn apply(segment: &ResolvedSegment, out: Outcome, ch: &mut Channels) {
        let session = segment.session;
        let _ = ch.state.fsm.request.push(StateRequest::Write {
            session,
            state: out.state,
        });
        if let Some(request) = out.rx {
            let _ = ch.rx_window.fsm.request.push(request);
        }
        if let Some(request) = out.tx {
            let _ = ch.tx_window.fsm.request.push(request);
        }
        for event in out.events {
            let _ = ch.fsm_events.push(event);
        }
        if segment.meta.length > 0 {
            let verdict = if out.keep { Verdict::Keep } else { Verdict::Drop };
            let _ = ch.fsm_verdicts.push(verdict);
        }
        if let Some(write) = out.write {
            let _ = ch.pending_writes.push(write);
        }
        for notification in out.notifications {
            let _ = ch.fsm_notifications.push(notification);
        }
        if let Some(op) = out.timer {
            let _ = ch
                .retransmit_commands
                .push(RetransmitCommand { session, op });
        }
        if out.close_timer {
            let _ = ch.close_timer_sets.push(session);
        }
        if out.probe_clear {
            let _ = ch.probe_clears.push(session);
        }
        if let Some(success) = out.open {
            let _ = ch.fsm_open_status.push(OpenStatus {
                session,
                success,
                state: out.state,
            });
        }
    }

    fn issue_reads(ch: &mut Channels, session: SessionId) {
        let _ = ch.state.fsm.request.push(StateRequest::Read {
            session,
            lock: true,
        });
        let _ = ch.rx_window.fsm.request.push(RxWindowRequest::Read(session));
        let _ = ch.tx_window.fsm.request.push(TxWindowRequest::Read(session));
    }
}

impl Stage for TcpStateMachine {
    fn step(&mut self, ch: &mut Channels) {
        if self.in_flight.is_none() {
            let can_read = !ch.state.fsm.request.is_full()
                && !ch.rx_window.fsm.request.is_full()
                && !ch.tx_window.fsm.request.is_full();
            if !can_read {
                return;
            }
            if let Some(segment) = ch.resolved.pop() {
                Self::issue_reads(ch, segment.session);
                self.in_flight = Some(InFlight {
                    segment,
                    state: None,
                    rx: None,
                    tx: None,
                });
            }
            return;
        }
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };

        if in_flight.state.is_none() {
            in_flight.state = ch.state.fsm.reply.pop().map(|reply| reply.state);
        }
        if in_flight.rx.is_none() {
            in_flight.rx = ch.rx_window.fsm.reply.pop().map(|reply| reply.window);
        }
        if in_flight.tx.is_none() {
            in_flight.tx = ch.tx_window.fsm.reply.pop().map(|reply| reply.window);
        }
        let (Some(state), Some(rx), Some(tx)) = (in_flight.state, in_flight.rx, in_flight.tx) else {
            return;
        };
        if !Self::outputs_ready(ch) {
            return;
        }

        let segment = in_flight.segment;
        self.in_flight = None;
        let out = self.process(&segment, state, rx, tx);
        Self::apply(&segment, out, ch);
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }
}
