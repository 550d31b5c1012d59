use crate::{
    channels::Channels,
    engine::Stage,
    fifo::{Fifo, Rpc},
    logging::transition_event,
    types::{SessionId, TcpState},
};

/// A request to the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRequest {
    /// Read the state. With `lock`, no other client may read or write the
    /// session until this client writes it back.
    Read { session: SessionId, lock: bool },
    /// Overwrite the state, releasing the writer's lock.
    Write { session: SessionId, state: TcpState },
    /// Close the session unless it already is. With `from`, only a session
    /// in that state is closed.
    Release {
        session: SessionId,
        from: Option<TcpState>,
    },
}

impl StateRequest {
    pub fn session(&self) -> SessionId {
        match *self {
            Self::Read { session, .. } | Self::Write { session, .. } | Self::Release { session, .. } => {
                session
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReply {
    pub session: SessionId,
    pub state: TcpState,
}

/// The clients of the session table, in priority order.
#[derive(Debug)]
pub struct StateClients {
    pub fsm: Rpc<StateRequest, StateReply>,
    pub tx_app: Rpc<StateRequest, StateReply>,
    pub app_writer: Rpc<StateRequest, StateReply>,
    pub retransmit: Rpc<StateRequest, StateReply>,
    pub close: Rpc<StateRequest, StateReply>,
}

impl StateClients {
    pub fn new(capacity: usize) -> Self {
        Self {
            fsm: Rpc::new(capacity),
            tx_app: Rpc::new(capacity),
            app_writer: Rpc::new(capacity),
            retransmit: Rpc::new(capacity),
            close: Rpc::new(capacity),
        }
    }

    fn by_priority(&mut self) -> [&mut Rpc<StateRequest, StateReply>; 5] {
        [
            &mut self.fsm,
            &mut self.tx_app,
            &mut self.app_writer,
            &mut self.retransmit,
            &mut self.close,
        ]
    }

    pub fn is_empty(&self) -> bool {
        [&self.fsm, &self.tx_app, &self.app_writer, &self.retransmit, &self.close]
            .iter()
            .all(|rpc| rpc.request.is_empty() && rpc.reply.is_empty())
    }
}

/// The TCP state of every session slot.
///
/// Any write or release that leaves a session `Closed` hands the session to
/// the lookup table to be freed.
#[derive(Debug)]
pub struct SessionTable {
    states: Vec<TcpState>,
    /// The client index holding each session's lock
    locks: Vec<Option<usize>>,
}

impl SessionTable {
    pub fn new(max_sessions: u16) -> Self {
        Self {
            states: vec![TcpState::Closed; max_sessions as usize],
            locks: vec![None; max_sessions as usize],
        }
    }

    /// The state of a session as currently stored.
    pub fn state(&self, session: SessionId) -> Option<TcpState> {
        self.states.get(session.index()).copied()
    }

    pub fn is_locked(&self, session: SessionId) -> bool {
        matches!(self.locks.get(session.index()), Some(Some(_)))
    }

    fn serve(
        &mut self,
        client: usize,
        rpc: &mut Rpc<StateRequest, StateReply>,
        release: &mut Fifo<SessionId>,
    ) {
        let Some(request) = rpc.request.peek().copied() else {
            return;
        };
        let session = request.session();
        let slot = session.index();
        if slot >= self.states.len() {
            tracing::error!(%session, "State request for a session beyond the table");
            rpc.request.pop();
            return;
        }
        if matches!(self.locks[slot], Some(holder) if holder != client) {
            return;
        }

        match request {
            StateRequest::Read { lock, .. } => {
                if !rpc.can_reply() {
                    return;
                }
                rpc.request.pop();
                if lock {
                    self.locks[slot] = Some(client);
                }
                let _ = rpc.reply.push(StateReply {
                    session,
                    state: self.states[slot],
                });
            }
            StateRequest::Write { state, .. } => {
                if state == TcpState::Closed && release.is_full() {
                    return;
                }
                rpc.request.pop();
                transition_event(session, self.states[slot], state);
                self.states[slot] = state;
                self.locks[slot] = None;
                if state == TcpState::Closed {
                    let _ = release.push(session);
                }
            }
            StateRequest::Release { from, .. } => {
                let current = self.states[slot];
                let applies =
                    current != TcpState::Closed && from.map_or(true, |from| from == current);
                if applies && release.is_full() {
                    return;
                }
                rpc.request.pop();
                if applies {
                    transition_event(session, current, TcpState::Closed);
                    self.states[slot] = TcpState::Closed;
                    let _ = release.push(session);
                }
            }
        }
    }
}

impl Stage for SessionTable {
    fn step(&mut self, ch: &mut Channels) {
        let release = &mut ch.lookup_release;
        for (client, rpc) in ch.state.by_priority().into_iter().enumerate() {
            self.serve(client, rpc, release);
        }
    }
}
