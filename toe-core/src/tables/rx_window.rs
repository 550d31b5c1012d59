use crate::{channels::Channels, engine::Stage, fifo::Rpc, types::SessionId};

/// Receive-side sequence bookkeeping for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxWindow {
    /// The next sequence number expected from the peer
    pub recvd: u32,
    /// The sequence number of the next byte the application will read
    pub app_read: u32,
}

impl RxWindow {
    /// Bytes that can still be accepted without overwriting unread data.
    pub fn free_space(&self, buffer_size: u32) -> u32 {
        self.app_read.wrapping_sub(self.recvd).wrapping_sub(1) & (buffer_size - 1)
    }

    /// Bytes received and not yet read.
    pub fn unread(&self) -> u32 {
        self.recvd.wrapping_sub(self.app_read)
    }

    /// How much of a `length` byte read can be served.
    pub fn readable(&self, length: u32) -> u32 {
        length.min(self.unread())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxWindowRequest {
    Read(SessionId),
    /// Start a connection: both pointers move to `recvd`.
    Init { session: SessionId, recvd: u32 },
    /// Record accepted in-order data.
    Received { session: SessionId, recvd: u32 },
    /// Hand up to `length` bytes to the application, never more than were
    /// received. The reply carries the window from before the read.
    Consume { session: SessionId, length: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxWindowReply {
    pub session: SessionId,
    pub window: RxWindow,
}

/// The clients of the receive window table, in priority order.
#[derive(Debug)]
pub struct RxWindowClients {
    pub fsm: Rpc<RxWindowRequest, RxWindowReply>,
    pub reader: Rpc<RxWindowRequest, RxWindowReply>,
}

impl RxWindowClients {
    pub fn new(capacity: usize) -> Self {
        Self {
            fsm: Rpc::new(capacity),
            reader: Rpc::new(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        [&self.fsm, &self.reader]
            .iter()
            .all(|rpc| rpc.request.is_empty() && rpc.reply.is_empty())
    }
}

#[derive(Debug)]
pub struct RxWindowTable {
    windows: Vec<RxWindow>,
}

impl RxWindowTable {
    pub fn new(max_sessions: u16) -> Self {
        Self {
            windows: vec![RxWindow::default(); max_sessions as usize],
        }
    }

    pub fn window(&self, session: SessionId) -> Option<RxWindow> {
        self.windows.get(session.index()).copied()
    }

    fn serve(&mut self, rpc: &mut Rpc<RxWindowRequest, RxWindowReply>) {
        let Some(request) = rpc.request.peek().copied() else {
            return;
        };
        let needs_reply = matches!(
            request,
            RxWindowRequest::Read(_) | RxWindowRequest::Consume { .. }
        );
        if needs_reply && !rpc.can_reply() {
            return;
        }
        rpc.request.pop();

        let session = match request {
            RxWindowRequest::Read(session)
            | RxWindowRequest::Init { session, .. }
            | RxWindowRequest::Received { session, .. }
            | RxWindowRequest::Consume { session, .. } => session,
        };
        let Some(window) = self.windows.get_mut(session.index()) else {
            tracing::error!(%session, "Receive window request for a session beyond the table");
            return;
        };
        let before = *window;
        match request {
            RxWindowRequest::Read(_) => {}
            RxWindowRequest::Init { recvd, .. } => {
                window.recvd = recvd;
                window.app_read = recvd;
            }
            RxWindowRequest::Received { recvd, .. } => window.recvd = recvd,
            RxWindowRequest::Consume { length, .. } => {
                window.app_read = window.app_read.wrapping_add(before.readable(length))
            }
        }
        if needs_reply {
            let _ = rpc.reply.push(RxWindowReply {
                session,
                window: before,
            });
        }
    }
}

impl Stage for RxWindowTable {
    fn step(&mut self, ch: &mut Channels) {
        self.serve(&mut ch.rx_window.fsm);
        self.serve(&mut ch.rx_window.reader);
    }
}
