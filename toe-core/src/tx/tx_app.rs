use crate::{
    address::{Endpoint, FourTuple, Ipv4Address},
    channels::{Channels, ListenReply},
    config::ToeConfig,
    engine::Stage,
    seq::IssGenerator,
    tables::{EphemeralRequest, LookupRequest, StateRequest, TxWindowRequest},
    types::{Event, EventKind, OpenStatus, SessionId, TcpState},
};

#[derive(Debug, Clone, Copy)]
enum Op {
    /// Waiting for an ephemeral port
    Port { remote: Endpoint },
    /// Waiting for the new session
    Lookup { remote: Endpoint, port: u16 },
    /// Waiting for the locked state of a session being closed
    Close { session: SessionId },
}

/// Serves the application's listen, open and close requests.
///
/// Listens are passed to the port table. Opens and closes run one at a time.
/// An open is answered right away only when it fails locally; otherwise the
/// answer comes from the state machine (SYN-ACK or reset) or from the
/// retransmission timer giving up.
#[derive(Debug)]
pub struct TxAppInterface {
    local_address: Ipv4Address,
    iss: IssGenerator,
    op: Option<Op>,
}

impl TxAppInterface {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            local_address: config.local_address,
            iss: IssGenerator::new(config.fixed_iss),
            op: None,
        }
    }

    fn failed_open() -> OpenStatus {
        OpenStatus {
            session: SessionId::default(),
            success: false,
            state: TcpState::Closed,
        }
    }

    /// Hands the outcome of earlier opens to the application.
    fn forward_open_status(ch: &mut Channels) {
        if ch.open.reply.is_full() {
            return;
        }
        let status = ch
            .fsm_open_status
            .pop()
            .or_else(|| ch.timer_open_status.pop());
        if let Some(status) = status {
            if status.success {
                tracing::info!(session = %status.session, "Connection opened");
            } else {
                tracing::info!(session = %status.session, "Open failed");
            }
            let _ = ch.open.reply.push(status);
        }
    }

    fn serve_listen(ch: &mut Channels) {
        if !ch.ports.listen.request.is_full() {
            if let Some(port) = ch.listen.request.pop() {
                let _ = ch.ports.listen.request.push(port);
            }
        }
        if !ch.listen.reply.is_full() {
            if let Some(reply) = ch.ports.listen.reply.pop() {
                let _ = ch.listen.reply.push(ListenReply {
                    port: reply.port,
                    accepted: reply.open,
                });
            }
        }
    }

    /// Starts the next open or close. Opens go first.
    fn start(&mut self, ch: &mut Channels) -> Option<Op> {
        if !ch.open.request.is_empty() && !ch.ports.ephemeral.request.is_full() {
            let remote = ch.open.request.pop()?;
            let _ = ch.ports.ephemeral.request.push(EphemeralRequest::Allocate);
            return Some(Op::Port { remote });
        }
        if !ch.close.is_empty() && !ch.state.tx_app.request.is_full() {
            let session = ch.close.pop()?;
            let _ = ch.state.tx_app.request.push(StateRequest::Read {
                session,
                lock: true,
            });
            return Some(Op::Close { session });
        }
        None
    }

    /// Moves the current operation along. Returns the operation if it is
    /// still running.
    fn advance(&mut self, op: Op, ch: &mut Channels) -> Option<Op> {
        match op {
            Op::Port { remote } => {
                let ready = !ch.open.reply.is_full() && !ch.lookup.tx_app.request.is_full();
                if !ready {
                    return Some(op);
                }
                let Some(allocated) = ch.ports.ephemeral.reply.pop() else {
                    return Some(op);
                };
                match allocated {
                    Some(port) => {
                        let tuple = FourTuple::new(Endpoint::new(self.local_address, port), remote);
                        let _ = ch.lookup.tx_app.request.push(LookupRequest {
                            tuple,
                            create: true,
                        });
                        Some(Op::Lookup { remote, port })
                    }
                    None => {
                        tracing::warn!(%remote, "No ephemeral port left");
                        let _ = ch.open.reply.push(Self::failed_open());
                        None
                    }
                }
            }
            Op::Lookup { remote, port } => {
                let ready = !ch.open.reply.is_full()
                    && !ch.ports.ephemeral.request.is_full()
                    && !ch.state.tx_app.request.is_full()
                    && !ch.tx_window.tx_app.request.is_full()
                    && !ch.tx_app_events.is_full();
                if !ready {
                    return Some(op);
                }
                let Some(reply) = ch.lookup.tx_app.reply.pop() else {
                    return Some(op);
                };
                let Some(session) = reply.session else {
                    tracing::warn!(%remote, "No session left for an open");
                    let _ = ch.open.reply.push(Self::failed_open());
                    let _ = ch
                        .ports
                        .ephemeral
                        .request
                        .push(EphemeralRequest::Release(port));
                    return None;
                };
                let iss = self.iss.next_iss();
                tracing::info!(%session, %remote, port, "Opening connection");
                let _ = ch.state.tx_app.request.push(StateRequest::Write {
                    session,
                    state: TcpState::SynSent,
                });
                let _ = ch.tx_window.tx_app.request.push(TxWindowRequest::Init {
                    session,
                    iss,
                    peer_window: 0,
                    active: true,
                });
                let _ = ch
                    .tx_app_events
                    .push(Event::new(EventKind::Syn, session).with_seq(iss));
                None
            }
            Op::Close { session } => {
                let ready = !ch.state.tx_app.request.is_full() && !ch.tx_app_events.is_full();
                if !ready {
                    return Some(op);
                }
                let Some(reply) = ch.state.tx_app.reply.pop() else {
                    return Some(op);
                };
                let state = match reply.state {
                    TcpState::Established => {
                        tracing::info!(%session, "Closing connection");
                        let _ = ch.tx_app_events.push(Event::new(EventKind::Fin, session));
                        TcpState::FinWait1
                    }
                    state => {
                        tracing::debug!(%session, ?state, "Close leaves the session as it is");
                        state
                    }
                };
                let _ = ch
                    .state
                    .tx_app
                    .request
                    .push(StateRequest::Write { session, state });
                None
            }
        }
    }
}

impl Stage for TxAppInterface {
    fn step(&mut self, ch: &mut Channels) {
        Self::forward_open_status(ch);
        Self::serve_listen(ch);
        self.op = match self.op.take() {
            Some(op) => self.advance(op, ch),
            None => self.start(ch),
        };
    }

    fn is_idle(&self) -> bool {
        self.op.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{LookupReply, PortReply, StateReply};

    fn setup() -> (TxAppInterface, Channels) {
        let config = ToeConfig::default().max_sessions(4).fixed_iss(900);
        (TxAppInterface::new(&config), Channels::new(&config))
    }

    fn remote() -> Endpoint {
        Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 80)
    }

    #[test]
    fn open_sends_syn() {
        let (mut app, mut ch) = setup();
        ch.open.request.push(remote()).unwrap();
        app.step(&mut ch);
        assert_eq!(ch.ports.ephemeral.request.pop(), Some(EphemeralRequest::Allocate));

        ch.ports.ephemeral.reply.push(Some(40000)).unwrap();
        app.step(&mut ch);
        let lookup = ch.lookup.tx_app.request.pop().unwrap();
        assert!(lookup.create);
        assert_eq!(lookup.tuple.local, Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 40000));
        assert_eq!(lookup.tuple.remote, remote());

        let session = SessionId::new(2);
        ch.lookup
            .tx_app
            .reply
            .push(LookupReply {
                tuple: lookup.tuple,
                session: Some(session),
            })
            .unwrap();
        app.step(&mut ch);
        assert!(app.is_idle());
        assert_eq!(
            ch.state.tx_app.request.pop(),
            Some(StateRequest::Write {
                session,
                state: TcpState::SynSent
            })
        );
        assert_eq!(
            ch.tx_window.tx_app.request.pop(),
            Some(TxWindowRequest::Init {
                session,
                iss: 900,
                peer_window: 0,
                active: true
            })
        );
        assert_eq!(
            ch.tx_app_events.pop(),
            Some(Event::new(EventKind::Syn, session).with_seq(900))
        );
        // The answer waits for the handshake
        assert!(ch.open.reply.is_empty());
    }

    #[test]
    fn full_lookup_fails_the_open_and_frees_the_port() {
        let (mut app, mut ch) = setup();
        ch.open.request.push(remote()).unwrap();
        app.step(&mut ch);
        ch.ports.ephemeral.request.pop();
        ch.ports.ephemeral.reply.push(Some(40000)).unwrap();
        app.step(&mut ch);
        let lookup = ch.lookup.tx_app.request.pop().unwrap();
        ch.lookup
            .tx_app
            .reply
            .push(LookupReply {
                tuple: lookup.tuple,
                session: None,
            })
            .unwrap();
        app.step(&mut ch);
        assert_eq!(ch.open.reply.pop().map(|status| status.success), Some(false));
        assert_eq!(
            ch.ports.ephemeral.request.pop(),
            Some(EphemeralRequest::Release(40000))
        );
        assert!(ch.tx_app_events.is_empty());
    }

    #[test]
    fn close_sends_fin_only_when_established() {
        let (mut app, mut ch) = setup();
        let session = SessionId::new(1);
        for state in [TcpState::Established, TcpState::SynReceived] {
            ch.close.push(session).unwrap();
            app.step(&mut ch);
            assert_eq!(
                ch.state.tx_app.request.pop(),
                Some(StateRequest::Read {
                    session,
                    lock: true
                })
            );
            ch.state
                .tx_app
                .reply
                .push(StateReply { session, state })
                .unwrap();
            app.step(&mut ch);
            let expected = match state {
                TcpState::Established => TcpState::FinWait1,
                state => state,
            };
            assert_eq!(
                ch.state.tx_app.request.pop(),
                Some(StateRequest::Write {
                    session,
                    state: expected
                })
            );
        }
        assert_eq!(ch.tx_app_events.pop(), Some(Event::new(EventKind::Fin, session)));
        assert!(ch.tx_app_events.is_empty());
    }

    #[test]
    fn listen_replies_are_translated() {
        let (mut app, mut ch) = setup();
        ch.listen.request.push(80).unwrap();
        app.step(&mut ch);
        assert_eq!(ch.ports.listen.request.pop(), Some(80));
        ch.ports
            .listen
            .reply
            .push(PortReply { port: 80, open: true })
            .unwrap();
        app.step(&mut ch);
        assert_eq!(
            ch.listen.reply.pop(),
            Some(ListenReply {
                port: 80,
                accepted: true
            })
        );
    }

    #[test]
    fn open_statuses_are_forwarded() {
        let (mut app, mut ch) = setup();
        let status = OpenStatus {
            session: SessionId::new(3),
            success: true,
            state: TcpState::Established,
        };
        ch.fsm_open_status.push(status).unwrap();
        app.step(&mut ch);
        assert_eq!(ch.open.reply.pop(), Some(status));
    }
}
