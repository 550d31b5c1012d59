use super::port_table::EPHEMERAL_BASE;
use crate::{
    address::FourTuple,
    channels::Channels,
    engine::Stage,
    fifo::{Fifo, Rpc},
    logging::{session_created_event, session_released_event},
    types::SessionId,
};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupRequest {
    pub tuple: FourTuple,
    /// Allocate a session when the tuple is unknown
    pub create: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupReply {
    pub tuple: FourTuple,
    /// The session, or `None` on a miss or when no id is free
    pub session: Option<SessionId>,
}

impl LookupReply {
    pub fn hit(&self) -> bool {
        self.session.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOp {
    Insert,
    Delete,
}

/// A direct change to the association, echoed back once applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupUpdate {
    pub tuple: FourTuple,
    pub session: SessionId,
    pub op: LookupOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseReply {
    pub session: SessionId,
    pub tuple: Option<FourTuple>,
}

/// The clients of the session lookup.
#[derive(Debug)]
pub struct LookupClients {
    pub resolver: Rpc<LookupRequest, LookupReply>,
    pub tx_app: Rpc<LookupRequest, LookupReply>,
    pub updates: Rpc<LookupUpdate, LookupUpdate>,
    pub reverse_timer: Rpc<SessionId, ReverseReply>,
    /// Reverse lookups for the external segment builder
    pub reverse_external: Rpc<SessionId, ReverseReply>,
}

impl LookupClients {
    pub fn new(capacity: usize) -> Self {
        Self {
            resolver: Rpc::new(capacity),
            tx_app: Rpc::new(capacity),
            updates: Rpc::new(capacity),
            reverse_timer: Rpc::new(capacity),
            reverse_external: Rpc::new(capacity),
        }
    }

    /// Whether every internal queue is empty.
    pub fn is_empty(&self) -> bool {
        [&self.resolver, &self.tx_app]
            .iter()
            .all(|rpc| rpc.request.is_empty() && rpc.reply.is_empty())
            && self.reverse_timer.request.is_empty()
            && self.reverse_timer.reply.is_empty()
            && self.updates.request.is_empty()
            && self.reverse_external.request.is_empty()
    }
}

/// Associates four-tuples with densely allocated session ids.
#[derive(Debug)]
pub struct SessionLookup {
    sessions: FxHashMap<FourTuple, SessionId>,
    tuples: Vec<Option<FourTuple>>,
    /// Free ids, lowest on top
    free: Vec<SessionId>,
}

impl SessionLookup {
    pub fn new(max_sessions: u16) -> Self {
        Self {
            sessions: FxHashMap::default(),
            tuples: vec![None; max_sessions as usize],
            free: (0..max_sessions).rev().map(SessionId::new).collect(),
        }
    }

    pub fn get(&self, tuple: &FourTuple) -> Option<SessionId> {
        self.sessions.get(tuple).copied()
    }

    /// The tuple a live session belongs to.
    pub fn tuple(&self, session: SessionId) -> Option<FourTuple> {
        self.tuples.get(session.index()).copied().flatten()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn lookup(&mut self, request: LookupRequest) -> Option<SessionId> {
        if let Some(session) = self.get(&request.tuple) {
            return Some(session);
        }
        if !request.create {
            return None;
        }
        let Some(session) = self.free.pop() else {
            tracing::warn!(tuple = %request.tuple, "No free session for a new connection");
            return None;
        };
        self.insert(request.tuple, session);
        Some(session)
    }

    fn insert(&mut self, tuple: FourTuple, session: SessionId) {
        self.sessions.insert(tuple, session);
        self.tuples[session.index()] = Some(tuple);
        session_created_event(session, tuple);
    }

    /// Forgets a session, returning its tuple.
    fn remove(&mut self, session: SessionId) -> Option<FourTuple> {
        let tuple = self.tuples.get_mut(session.index())?.take()?;
        self.sessions.remove(&tuple);
        self.free.push(session);
        session_released_event(session, tuple);
        Some(tuple)
    }

    fn serve_lookup(&mut self, rpc: &mut Rpc<LookupRequest, LookupReply>) {
        if !rpc.can_reply() {
            return;
        }
        if let Some(request) = rpc.request.pop() {
            let session = self.lookup(request);
            let _ = rpc.reply.push(LookupReply {
                tuple: request.tuple,
                session,
            });
        }
    }

    fn serve_update(&mut self, rpc: &mut Rpc<LookupUpdate, LookupUpdate>) {
        if !rpc.can_reply() {
            return;
        }
        let Some(update) = rpc.request.pop() else {
            return;
        };
        let slot = update.session.index();
        match update.op {
            LookupOp::Insert => {
                let id_free = self.free.contains(&update.session);
                if id_free && !self.sessions.contains_key(&update.tuple) {
                    self.free.retain(|session| *session != update.session);
                    self.insert(update.tuple, update.session);
                } else {
                    tracing::debug!(session = %update.session, "Insert for a taken session ignored");
                }
            }
            LookupOp::Delete => {
                if slot < self.tuples.len() && self.tuples[slot] == Some(update.tuple) {
                    self.remove(update.session);
                }
            }
        }
        let _ = rpc.reply.push(update);
    }

    fn serve_reverse(&self, rpc: &mut Rpc<SessionId, ReverseReply>) {
        if !rpc.can_reply() {
            return;
        }
        if let Some(session) = rpc.request.pop() {
            let _ = rpc.reply.push(ReverseReply {
                session,
                tuple: self.tuple(session),
            });
        }
    }

    fn serve_release(&mut self, release: &mut Fifo<SessionId>, ports: &mut Fifo<u16>) {
        if ports.is_full() {
            return;
        }
        if let Some(session) = release.pop() {
            match self.remove(session) {
                Some(tuple) if tuple.local.port >= EPHEMERAL_BASE => {
                    let _ = ports.push(tuple.local.port);
                }
                Some(_) => {}
                None => tracing::debug!(%session, "Release of an unknown session"),
            }
        }
    }
}

impl Stage for SessionLookup {
    fn step(&mut self, ch: &mut Channels) {
        self.serve_release(&mut ch.lookup_release, &mut ch.port_release);
        self.serve_lookup(&mut ch.lookup.resolver);
        self.serve_lookup(&mut ch.lookup.tx_app);
        self.serve_update(&mut ch.lookup.updates);
        self.serve_reverse(&mut ch.lookup.reverse_timer);
        self.serve_reverse(&mut ch.lookup.reverse_external);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::{Endpoint, Ipv4Address},
        config::ToeConfig,
    };

    fn tuple(remote_port: u16, local_port: u16) -> FourTuple {
        FourTuple::new(
            Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), local_port),
            Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), remote_port),
        )
    }

    #[test]
    fn create_only_when_asked() {
        let mut lookup = SessionLookup::new(2);
        let a = tuple(5000, 80);
        assert_eq!(lookup.lookup(LookupRequest { tuple: a, create: false }), None);
        let session = lookup.lookup(LookupRequest { tuple: a, create: true });
        assert_eq!(session, Some(SessionId::new(0)));
        assert_eq!(lookup.lookup(LookupRequest { tuple: a, create: true }), session);
        assert_eq!(lookup.tuple(SessionId::new(0)), Some(a));
    }

    #[test]
    fn runs_out_of_ids() {
        let mut lookup = SessionLookup::new(2);
        for port in 0..2 {
            assert!(lookup
                .lookup(LookupRequest {
                    tuple: tuple(port, 80),
                    create: true
                })
                .is_some());
        }
        let extra = LookupRequest {
            tuple: tuple(9, 80),
            create: true,
        };
        assert_eq!(lookup.lookup(extra), None);
        lookup.remove(SessionId::new(1));
        assert_eq!(lookup.lookup(extra), Some(SessionId::new(1)));
    }

    #[test]
    fn release_frees_ephemeral_port() {
        let config = ToeConfig::default().max_sessions(4);
        let mut ch = Channels::new(&config);
        let mut lookup = SessionLookup::new(4);
        let active = tuple(80, 40000);
        ch.lookup
            .tx_app
            .request
            .push(LookupRequest {
                tuple: active,
                create: true,
            })
            .unwrap();
        lookup.step(&mut ch);
        let session = ch.lookup.tx_app.reply.pop().unwrap().session.unwrap();

        ch.lookup.reverse_external.request.push(session).unwrap();
        lookup.step(&mut ch);
        assert_eq!(
            ch.lookup.reverse_external.reply.pop(),
            Some(ReverseReply {
                session,
                tuple: Some(active)
            })
        );

        ch.lookup_release.push(session).unwrap();
        lookup.step(&mut ch);
        assert_eq!(ch.port_release.pop(), Some(40000));
        assert_eq!(lookup.live_sessions(), 0);
    }

    #[test]
    fn updates_are_echoed() {
        let config = ToeConfig::default().max_sessions(4);
        let mut ch = Channels::new(&config);
        let mut lookup = SessionLookup::new(4);
        let insert = LookupUpdate {
            tuple: tuple(1234, 80),
            session: SessionId::new(3),
            op: LookupOp::Insert,
        };
        ch.lookup.updates.request.push(insert).unwrap();
        lookup.step(&mut ch);
        assert_eq!(ch.lookup.updates.reply.pop(), Some(insert));
        assert_eq!(lookup.get(&insert.tuple), Some(SessionId::new(3)));

        let delete = LookupUpdate {
            op: LookupOp::Delete,
            ..insert
        };
        ch.lookup.updates.request.push(delete).unwrap();
        lookup.step(&mut ch);
        assert_eq!(ch.lookup.updates.reply.pop(), Some(delete));
        assert_eq!(lookup.get(&insert.tuple), None);
    }
}
