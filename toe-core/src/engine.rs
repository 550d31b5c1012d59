//! The step-driven engine that owns every stage, table and queue.

use crate::{
    address::{Endpoint, FourTuple},
    channels::{Channels, ListenReply},
    config::{ConfigError, ToeConfig},
    event_engine::EventEngine,
    fifo::Fifo,
    memory::{Dram, MemCommand},
    rx::{
        AppNotifier, BufferReader, BufferWriter, ChecksumValidator, PortSessionResolver,
        SegmentDropper, TcpStateMachine,
    },
    tables::{
        LookupUpdate, PortTable, ReverseReply, RxWindow, RxWindowTable, SessionLookup,
        SessionTable, TxWindow, TxWindowReply, TxWindowRequest, TxWindowTable,
    },
    timers::{CloseTimer, ProbeTimer, RetransmitSet, RetransmitTimer},
    tx::{AppWriter, TxAppInterface},
    types::{
        AppNotification, Event, OpenStatus, ReadRequest, RxPacket, SessionId, TcpState, TxSent,
        WriteReply, WriteRequest,
    },
    wire::{to_words, Word},
};
use std::collections::VecDeque;
use thiserror::Error as ThisError;

/// A pipeline stage. Each step a stage moves at most a little work from its
/// input queues to its output queues, and does nothing when an input is empty
/// or an output is full.
pub trait Stage {
    fn step(&mut self, ch: &mut Channels);

    /// Whether the stage holds no partially processed work.
    fn is_idle(&self) -> bool {
        true
    }
}

/// An input the engine could not take right now.
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum SubmitError {
    #[error("The {0} queue is full")]
    Full(&'static str),
}

fn submit<T>(fifo: &mut Fifo<T>, item: T, name: &'static str) -> Result<(), SubmitError> {
    fifo.push(item).map_err(|_| SubmitError::Full(name))
}

/// A TCP offload engine.
///
/// The engine is driven by calling [`Engine::step`], which runs every stage
/// once. Packets and application requests go in through the `push_*` and
/// request methods; events for the segment builder and everything meant for
/// the application come out through the `pop_*` methods.
///
/// # Examples
///
/// ```
/// use toe_core::{Engine, ToeConfig};
///
/// let mut engine = Engine::new(ToeConfig::default().max_sessions(16)).unwrap();
/// engine.listen(80).unwrap();
/// engine.run_until_idle(1000);
/// assert!(engine.pop_listen_reply().unwrap().accepted);
/// ```
#[derive(Debug)]
pub struct Engine {
    config: ToeConfig,
    ch: Channels,
    /// Application write data waiting for room in the write queue
    write_backlog: VecDeque<Word>,
    steps: u64,

    validator: ChecksumValidator,
    resolver: PortSessionResolver,
    fsm: TcpStateMachine,
    dropper: SegmentDropper,
    writer: BufferWriter,
    notifier: AppNotifier,
    reader: BufferReader,
    tx_app: TxAppInterface,
    app_writer: AppWriter,
    events: EventEngine,
    retransmit: RetransmitTimer,
    close_timer: CloseTimer,
    probe_timer: ProbeTimer,

    states: SessionTable,
    rx_windows: RxWindowTable,
    tx_windows: TxWindowTable,
    lookup: SessionLookup,
    ports: PortTable,
    memory: Dram,
}

impl Engine {
    pub fn new(config: ToeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let memory_end = config.rx_base.max(config.tx_base) + config.rx_region_len();
        tracing::info!(
            local = %config.local_address,
            sessions = config.max_sessions,
            buffer_size = config.buffer_size,
            "Starting engine"
        );
        Ok(Self {
            ch: Channels::new(&config),
            write_backlog: VecDeque::new(),
            steps: 0,
            validator: ChecksumValidator::new(),
            resolver: PortSessionResolver::new(),
            fsm: TcpStateMachine::new(&config),
            dropper: SegmentDropper::new(),
            writer: BufferWriter::new(&config),
            notifier: AppNotifier::new(config.queue_capacity),
            reader: BufferReader::new(&config),
            tx_app: TxAppInterface::new(&config),
            app_writer: AppWriter::new(&config),
            events: EventEngine::new(),
            retransmit: RetransmitTimer::new(&config),
            close_timer: CloseTimer::new(&config),
            probe_timer: ProbeTimer::new(&config),
            states: SessionTable::new(config.max_sessions),
            rx_windows: RxWindowTable::new(config.max_sessions),
            tx_windows: TxWindowTable::new(&config),
            lookup: SessionLookup::new(config.max_sessions),
            ports: PortTable::new(),
            memory: Dram::new(memory_end),
            config,
        })
    }

    pub fn config(&self) -> &ToeConfig {
        &self.config
    }

    /// Steps run so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Runs every stage once.
    pub fn step(&mut self) {
        while !self.ch.write_data.is_full() {
            let Some(word) = self.write_backlog.pop_front() else {
                break;
            };
            let _ = self.ch.write_data.push(word);
        }

        let ch = &mut self.ch;
        self.validator.step(ch);
        self.ports.step(ch);
        self.resolver.step(ch);
        self.lookup.step(ch);
        self.states.step(ch);
        self.rx_windows.step(ch);
        self.tx_windows.step(ch);
        self.fsm.step(ch);
        self.dropper.step(ch);
        self.writer.step(ch);
        self.memory.step(ch);
        self.notifier.step(ch);
        self.reader.step(ch);
        self.tx_app.step(ch);
        self.app_writer.step(ch);
        self.retransmit.step(ch);
        self.close_timer.step(ch);
        self.probe_timer.step(ch);
        self.events.step(ch);
        self.steps += 1;
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Steps until no work is in flight, at most `max_steps` times. Returns
    /// the number of steps taken. Armed timers do not count as work.
    pub fn run_until_idle(&mut self, max_steps: usize) -> usize {
        for steps in 0..max_steps {
            if self.is_idle() {
                return steps;
            }
            self.step();
        }
        max_steps
    }

    /// Whether no stage and no internal queue holds work.
    pub fn is_idle(&self) -> bool {
        self.write_backlog.is_empty()
            && self.ch.is_quiet()
            && self.validator.is_idle()
            && self.resolver.is_idle()
            && self.fsm.is_idle()
            && self.dropper.is_idle()
            && self.writer.is_idle()
            && self.memory.is_idle()
            && self.notifier.is_idle()
            && self.reader.is_idle()
            && self.tx_app.is_idle()
            && self.app_writer.is_idle()
            && self.retransmit.is_idle()
    }

    // Inputs from the IP layer and the application

    pub fn push_packet(&mut self, packet: RxPacket) -> Result<(), SubmitError> {
        submit(&mut self.ch.rx_packets, packet, "packet")
    }

    pub fn push_read(&mut self, request: ReadRequest) -> Result<(), SubmitError> {
        submit(&mut self.ch.read_requests, request, "read request")
    }

    pub fn listen(&mut self, port: u16) -> Result<(), SubmitError> {
        submit(&mut self.ch.listen.request, port, "listen")
    }

    pub fn open(&mut self, remote: Endpoint) -> Result<(), SubmitError> {
        submit(&mut self.ch.open.request, remote, "open")
    }

    pub fn close(&mut self, session: SessionId) -> Result<(), SubmitError> {
        submit(&mut self.ch.close, session, "close")
    }

    /// Asks to send `data`. The reply tells whether it was taken.
    pub fn write(&mut self, session: SessionId, data: &[u8]) -> Result<(), SubmitError> {
        let request = WriteRequest {
            session,
            length: data.len() as u32,
        };
        submit(&mut self.ch.write.request, request, "write")?;
        self.write_backlog.extend(to_words(data));
        Ok(())
    }

    // Inputs from the segment builder

    /// Records that a segment left: the session's next sequence number moves
    /// and the retransmission timer is armed for segments that need an
    /// acknowledgment.
    pub fn report_sent(&mut self, sent: TxSent) -> Result<(), SubmitError> {
        let timed = sent.kind.is_retransmitted();
        if self.ch.tx_window.tx_engine.request.is_full() {
            return Err(SubmitError::Full("transmit window"));
        }
        if timed && self.ch.retransmit_sets.is_full() {
            return Err(SubmitError::Full("retransmit"));
        }
        let _ = self.ch.tx_window.tx_engine.request.push(TxWindowRequest::Sent {
            session: sent.session,
            next_byte: sent.next_byte,
        });
        if timed {
            let _ = self.ch.retransmit_sets.push(RetransmitSet {
                session: sent.session,
                kind: sent.kind,
            });
        }
        Ok(())
    }

    /// Records that the peer's window is closed and a probe will be needed.
    pub fn report_probe(&mut self, session: SessionId) -> Result<(), SubmitError> {
        submit(&mut self.ch.probe_sets, session, "probe")
    }

    pub fn query_tx_window(&mut self, session: SessionId) -> Result<(), SubmitError> {
        submit(
            &mut self.ch.tx_window.tx_engine.request,
            TxWindowRequest::Read(session),
            "transmit window",
        )
    }

    pub fn pop_tx_window(&mut self) -> Option<TxWindowReply> {
        self.ch.tx_window.tx_engine.reply.pop()
    }

    pub fn reverse_lookup(&mut self, session: SessionId) -> Result<(), SubmitError> {
        submit(&mut self.ch.lookup.reverse_external.request, session, "reverse lookup")
    }

    pub fn pop_reverse_lookup(&mut self) -> Option<ReverseReply> {
        self.ch.lookup.reverse_external.reply.pop()
    }

    pub fn update_lookup(&mut self, update: LookupUpdate) -> Result<(), SubmitError> {
        submit(&mut self.ch.lookup.updates.request, update, "lookup update")
    }

    pub fn pop_lookup_update(&mut self) -> Option<LookupUpdate> {
        self.ch.lookup.updates.reply.pop()
    }

    /// Reads from the transmit buffers through the memory's transmit read
    /// port.
    pub fn read_tx_buffer(&mut self, command: MemCommand) -> Result<(), SubmitError> {
        submit(&mut self.ch.memory.tx_read.command, command, "transmit buffer read")
    }

    pub fn pop_tx_buffer_data(&mut self) -> Option<Word> {
        self.ch.memory.tx_read.data.pop()
    }

    // Outputs

    pub fn pop_event(&mut self) -> Option<Event> {
        self.ch.events.pop()
    }

    pub fn pop_notification(&mut self) -> Option<AppNotification> {
        self.ch.notifications.pop()
    }

    pub fn pop_read_session(&mut self) -> Option<SessionId> {
        self.ch.read_sessions.pop()
    }

    pub fn pop_read_data(&mut self) -> Option<Word> {
        self.ch.read_data.pop()
    }

    pub fn pop_open_status(&mut self) -> Option<OpenStatus> {
        self.ch.open.reply.pop()
    }

    pub fn pop_listen_reply(&mut self) -> Option<ListenReply> {
        self.ch.listen.reply.pop()
    }

    pub fn pop_write_reply(&mut self) -> Option<WriteReply> {
        self.ch.write.reply.pop()
    }

    // Inspection

    pub fn state(&self, session: SessionId) -> Option<TcpState> {
        self.states.state(session)
    }

    pub fn rx_window(&self, session: SessionId) -> Option<RxWindow> {
        self.rx_windows.window(session)
    }

    pub fn tx_window(&self, session: SessionId) -> Option<TxWindow> {
        self.tx_windows.window(session)
    }

    pub fn session(&self, tuple: &FourTuple) -> Option<SessionId> {
        self.lookup.get(tuple)
    }

    pub fn tuple(&self, session: SessionId) -> Option<FourTuple> {
        self.lookup.tuple(session)
    }

    pub fn live_sessions(&self) -> usize {
        self.lookup.live_sessions()
    }

    pub fn is_port_open(&self, port: u16) -> bool {
        self.ports.is_open(port)
    }

    pub fn is_retransmit_armed(&self, session: SessionId) -> bool {
        self.retransmit.is_armed(session)
    }

    pub fn memory(&self) -> &Dram {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Dram {
        &mut self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_config() {
        let config = ToeConfig::default().buffer_size(100);
        assert_eq!(Engine::new(config).err(), Some(ConfigError::BufferSize(100)));
    }

    #[test]
    fn full_queue_is_reported() {
        let mut engine = Engine::new(ToeConfig::default().queue_capacity(2)).unwrap();
        engine.close(SessionId::new(0)).unwrap();
        engine.close(SessionId::new(1)).unwrap();
        assert_eq!(engine.close(SessionId::new(2)), Err(SubmitError::Full("close")));
    }

    #[test]
    fn idle_engine_stays_idle() {
        let mut engine = Engine::new(ToeConfig::default().max_sessions(4)).unwrap();
        assert!(engine.is_idle());
        assert_eq!(engine.run_until_idle(10), 0);
        engine.run(10);
        assert!(engine.pop_event().is_none());
        assert_eq!(engine.steps(), 10);
    }

    #[test]
    fn listen_is_answered() {
        let mut engine = Engine::new(ToeConfig::default().max_sessions(4)).unwrap();
        engine.listen(80).unwrap();
        engine.listen(80).unwrap();
        engine.listen(40000).unwrap();
        engine.run_until_idle(100);
        let accepted: Vec<bool> = std::iter::from_fn(|| engine.pop_listen_reply())
            .map(|reply| reply.accepted)
            .collect();
        assert_eq!(accepted, vec![true, false, false]);
        assert!(engine.is_port_open(80));
    }
}
