//! Every queue of the pipeline, owned in one place so that each stage can
//! borrow exactly the queues it reads and writes.

use crate::{
    address::Endpoint,
    config::ToeConfig,
    fifo::{Fifo, Rpc},
    memory::MemoryPorts,
    tables::{LookupClients, PortClients, RxWindowClients, StateClients, TxWindowClients},
    timers::{RetransmitCommand, RetransmitSet},
    types::{
        AppNotification, Event, OpenStatus, PendingWrite, ReadRequest, ResolvedSegment, RxPacket,
        SessionId, TaggedMeta, Verdict, WriteReply, WriteRequest,
    },
    wire::Word,
};

/// The answer to a listen request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenReply {
    pub port: u16,
    pub accepted: bool,
}

#[derive(Debug)]
pub struct Channels {
    // Receive path
    pub rx_packets: Fifo<RxPacket>,
    pub validated: Fifo<TaggedMeta>,
    pub rx_payload: Fifo<Word>,
    pub resolved: Fifo<ResolvedSegment>,
    pub resolver_verdicts: Fifo<Verdict>,
    pub fsm_verdicts: Fifo<Verdict>,
    pub kept_payload: Fifo<Word>,
    pub pending_writes: Fifo<PendingWrite>,
    pub write_splits: Fifo<bool>,
    pub fsm_notifications: Fifo<AppNotification>,
    pub timer_notifications: Fifo<AppNotification>,

    // Application receive side
    pub notifications: Fifo<AppNotification>,
    pub read_requests: Fifo<ReadRequest>,
    pub read_data: Fifo<Word>,
    pub read_sessions: Fifo<SessionId>,

    // Application transmit side
    pub listen: Rpc<u16, ListenReply>,
    pub open: Rpc<Endpoint, OpenStatus>,
    pub close: Fifo<SessionId>,
    pub write: Rpc<WriteRequest, WriteReply>,
    pub write_data: Fifo<Word>,
    pub fsm_open_status: Fifo<OpenStatus>,
    pub timer_open_status: Fifo<OpenStatus>,

    // Events, merged into `events` for the segment builder
    pub fsm_events: Fifo<Event>,
    pub resolver_events: Fifo<Event>,
    pub retransmit_events: Fifo<Event>,
    pub probe_events: Fifo<Event>,
    pub tx_app_events: Fifo<Event>,
    pub app_writer_events: Fifo<Event>,
    pub events: Fifo<Event>,

    // Timers
    pub retransmit_commands: Fifo<RetransmitCommand>,
    pub retransmit_sets: Fifo<RetransmitSet>,
    pub close_timer_sets: Fifo<SessionId>,
    pub probe_sets: Fifo<SessionId>,
    pub probe_clears: Fifo<SessionId>,

    // Tables
    pub state: StateClients,
    pub rx_window: RxWindowClients,
    pub tx_window: TxWindowClients,
    pub lookup: LookupClients,
    pub lookup_release: Fifo<SessionId>,
    pub ports: PortClients,
    pub port_release: Fifo<u16>,

    pub memory: MemoryPorts,
}

impl Channels {
    pub fn new(config: &ToeConfig) -> Self {
        let capacity = config.queue_capacity;
        Self {
            rx_packets: Fifo::new(capacity),
            validated: Fifo::new(capacity),
            rx_payload: Fifo::new(capacity),
            resolved: Fifo::new(capacity),
            resolver_verdicts: Fifo::new(capacity),
            fsm_verdicts: Fifo::new(capacity),
            kept_payload: Fifo::new(capacity),
            pending_writes: Fifo::new(capacity),
            write_splits: Fifo::new(capacity),
            fsm_notifications: Fifo::new(capacity),
            timer_notifications: Fifo::new(capacity),
            notifications: Fifo::new(capacity),
            read_requests: Fifo::new(capacity),
            read_data: Fifo::new(capacity),
            read_sessions: Fifo::new(capacity),
            listen: Rpc::new(capacity),
            open: Rpc::new(capacity),
            close: Fifo::new(capacity),
            write: Rpc::new(capacity),
            write_data: Fifo::new(capacity),
            fsm_open_status: Fifo::new(capacity),
            timer_open_status: Fifo::new(capacity),
            fsm_events: Fifo::new(capacity),
            resolver_events: Fifo::new(capacity),
            retransmit_events: Fifo::new(capacity),
            probe_events: Fifo::new(capacity),
            tx_app_events: Fifo::new(capacity),
            app_writer_events: Fifo::new(capacity),
            events: Fifo::new(capacity),
            retransmit_commands: Fifo::new(capacity),
            retransmit_sets: Fifo::new(capacity),
            close_timer_sets: Fifo::new(capacity),
            probe_sets: Fifo::new(capacity),
            probe_clears: Fifo::new(capacity),
            state: StateClients::new(capacity),
            rx_window: RxWindowClients::new(capacity),
            tx_window: TxWindowClients::new(capacity),
            lookup: LookupClients::new(capacity),
            lookup_release: Fifo::new(capacity),
            ports: PortClients::new(capacity),
            port_release: Fifo::new(capacity),
            memory: MemoryPorts::new(capacity),
        }
    }

    /// Whether nothing is queued between stages or waiting at an input.
    /// Outputs left for the application and the segment builder do not count.
    pub fn is_quiet(&self) -> bool {
        self.rx_packets.is_empty()
            && self.validated.is_empty()
            && self.rx_payload.is_empty()
            && self.resolved.is_empty()
            && self.resolver_verdicts.is_empty()
            && self.fsm_verdicts.is_empty()
            && self.kept_payload.is_empty()
            && self.pending_writes.is_empty()
            && self.write_splits.is_empty()
            && self.fsm_notifications.is_empty()
            && self.timer_notifications.is_empty()
            && self.read_requests.is_empty()
            && self.listen.request.is_empty()
            && self.open.request.is_empty()
            && self.close.is_empty()
            && self.write.request.is_empty()
            && self.write_data.is_empty()
            && self.fsm_open_status.is_empty()
            && self.timer_open_status.is_empty()
            && self.fsm_events.is_empty()
            && self.resolver_events.is_empty()
            && self.retransmit_events.is_empty()
            && self.probe_events.is_empty()
            && self.tx_app_events.is_empty()
            && self.app_writer_events.is_empty()
            && self.retransmit_commands.is_empty()
            && self.retransmit_sets.is_empty()
            && self.close_timer_sets.is_empty()
            && self.probe_sets.is_empty()
            && self.probe_clears.is_empty()
            && self.state.is_empty()
            && self.rx_window.is_empty()
            && self.tx_window.is_empty()
            && self.lookup.is_empty()
            && self.lookup_release.is_empty()
            && self.ports.is_empty()
            && self.port_release.is_empty()
            && self.memory.rx_write.is_empty()
            && self.memory.rx_read.is_empty()
            && self.memory.tx_write.is_empty()
            && self.memory.tx_read.command.is_empty()
    }
}
