use crate::{channels::Channels, config::ToeConfig, engine::Stage, fifo::Rpc, types::SessionId};

/// Segments in the initial congestion window
const INITIAL_WINDOW_SEGMENTS: u32 = 10;

/// Send-side sequence and congestion bookkeeping for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxWindow {
    /// Oldest unacknowledged sequence number
    pub unacked: u32,
    /// Next sequence number to be sent
    pub next_byte: u32,
    /// Sequence number following the last byte the application wrote
    pub app_written: u32,
    pub peer_window: u16,
    pub congestion_window: u32,
    pub slow_start_threshold: u32,
    pub dup_acks: u8,
    pub fast_retransmitted: bool,
    /// Whether the application opened this connection and waits for the
    /// result
    pub active_open: bool,
}

impl TxWindow {
    /// Bytes written by the application and not yet acknowledged.
    pub fn buffered(&self) -> u32 {
        self.app_written.wrapping_sub(self.unacked)
    }
}

/// The fields of a [`TxWindow`] an acknowledgment changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckUpdate {
    pub unacked: u32,
    pub peer_window: u16,
    pub congestion_window: u32,
    pub slow_start_threshold: u32,
    pub dup_acks: u8,
    pub fast_retransmitted: bool,
}

impl From<&TxWindow> for AckUpdate {
    fn from(window: &TxWindow) -> Self {
        Self {
            unacked: window.unacked,
            peer_window: window.peer_window,
            congestion_window: window.congestion_window,
            slow_start_threshold: window.slow_start_threshold,
            dup_acks: window.dup_acks,
            fast_retransmitted: window.fast_retransmitted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxWindowRequest {
    Read(SessionId),
    /// Start a connection whose SYN carries `iss`. `active` marks an open
    /// requested by the application.
    Init {
        session: SessionId,
        iss: u32,
        peer_window: u16,
        active: bool,
    },
    Ack {
        session: SessionId,
        update: AckUpdate,
    },
    /// The application appended `length` bytes to the transmit buffer.
    Written { session: SessionId, length: u32 },
    /// The segment builder sent everything before `next_byte`.
    Sent { session: SessionId, next_byte: u32 },
}

impl TxWindowRequest {
    pub fn session(&self) -> SessionId {
        match *self {
            Self::Read(session)
            | Self::Init { session, .. }
            | Self::Ack { session, .. }
            | Self::Written { session, .. }
            | Self::Sent { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxWindowReply {
    pub session: SessionId,
    pub window: TxWindow,
}

/// The clients of the transmit window table, in priority order.
#[derive(Debug)]
pub struct TxWindowClients {
    pub fsm: Rpc<TxWindowRequest, TxWindowReply>,
    pub tx_app: Rpc<TxWindowRequest, TxWindowReply>,
    pub app_writer: Rpc<TxWindowRequest, TxWindowReply>,
    /// The external segment builder
    pub tx_engine: Rpc<TxWindowRequest, TxWindowReply>,
}

impl TxWindowClients {
    pub fn new(capacity: usize) -> Self {
        Self {
            fsm: Rpc::new(capacity),
            tx_app: Rpc::new(capacity),
            app_writer: Rpc::new(capacity),
            tx_engine: Rpc::new(capacity),
        }
    }

    fn by_priority(&mut self) -> [&mut Rpc<TxWindowRequest, TxWindowReply>; 4] {
        [
            &mut self.fsm,
            &mut self.tx_app,
            &mut self.app_writer,
            &mut self.tx_engine,
        ]
    }

    /// Whether every queue is empty, not counting replies to the segment
    /// builder.
    pub fn is_empty(&self) -> bool {
        [&self.fsm, &self.tx_app, &self.app_writer]
            .iter()
            .all(|rpc| rpc.request.is_empty() && rpc.reply.is_empty())
            && self.tx_engine.request.is_empty()
    }
}

#[derive(Debug)]
pub struct TxWindowTable {
    windows: Vec<TxWindow>,
    initial_window: u32,
    slow_start_threshold: u32,
}

impl TxWindowTable {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            windows: vec![TxWindow::default(); config.max_sessions as usize],
            initial_window: (INITIAL_WINDOW_SEGMENTS * config.mss as u32).min(0xffff),
            slow_start_threshold: config.slow_start_threshold,
        }
    }

    pub fn window(&self, session: SessionId) -> Option<TxWindow> {
        self.windows.get(session.index()).copied()
    }

    fn serve(&mut self, rpc: &mut Rpc<TxWindowRequest, TxWindowReply>) {
        let Some(request) = rpc.request.peek().copied() else {
            return;
        };
        let is_read = matches!(request, TxWindowRequest::Read(_));
        if is_read && !rpc.can_reply() {
            return;
        }
        rpc.request.pop();

        let session = request.session();
        let Some(window) = self.windows.get_mut(session.index()) else {
            tracing::error!(%session, "Transmit window request for a session beyond the table");
            return;
        };
        match request {
            TxWindowRequest::Read(_) => {
                let _ = rpc.reply.push(TxWindowReply {
                    session,
                    window: *window,
                });
            }
            TxWindowRequest::Init {
                iss,
                peer_window,
                active,
                ..
            } => {
                *window = TxWindow {
                    unacked: iss,
                    next_byte: iss.wrapping_add(1),
                    app_written: iss.wrapping_add(1),
                    peer_window,
                    congestion_window: self.initial_window,
                    slow_start_threshold: self.slow_start_threshold,
                    dup_acks: 0,
                    fast_retransmitted: false,
                    active_open: active,
                };
            }
            TxWindowRequest::Ack { update, .. } => {
                window.unacked = update.unacked;
                window.peer_window = update.peer_window;
                window.congestion_window = update.congestion_window;
                window.slow_start_threshold = update.slow_start_threshold;
                window.dup_acks = update.dup_acks;
                window.fast_retransmitted = update.fast_retransmitted;
            }
            TxWindowRequest::Written { length, .. } => {
                window.app_written = window.app_written.wrapping_add(length);
            }
            TxWindowRequest::Sent { next_byte, .. } => window.next_byte = next_byte,
        }
    }
}

impl Stage for TxWindowTable {
    fn step(&mut self, ch: &mut Channels) {
        for rpc in ch.tx_window.by_priority() {
            self.serve(rpc);
        }
    }
}
