use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    memory::{BufferAccess, WriteTransfer},
    tables::{StateRequest, TxWindow, TxWindowRequest},
    types::{Event, EventKind, TcpState, WriteReply, WriteRequest, WriteStatus},
};

#[derive(Debug)]
enum Writing {
    /// Waiting for the session's state and transmit window
    Checking {
        request: WriteRequest,
        state: Option<TcpState>,
        window: Option<TxWindow>,
    },
    /// Dropping the data of a refused write
    Discarding,
    Storing {
        request: WriteRequest,
        transfer: WriteTransfer,
    },
    /// Waiting for memory to confirm the write
    Confirming { request: WriteRequest, split: bool },
}

/// Accepts application data into the transmit buffers.
///
/// A write is refused when the connection is not established or the buffer
/// cannot take all of it; its data is then dropped. Accepted data is stored
/// behind whatever the application wrote before, and the segment builder is
/// told to send it once memory confirms the write.
#[derive(Debug)]
pub struct AppWriter {
    tx_base: u64,
    buffer_size: u32,
    writing: Option<Writing>,
}

impl AppWriter {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            tx_base: config.tx_base,
            buffer_size: config.buffer_size,
            writing: None,
        }
    }

    fn start(ch: &mut Channels) -> Option<Writing> {
        if ch.state.app_writer.request.is_full() || ch.tx_window.app_writer.request.is_full() {
            return None;
        }
        let request = ch.write.request.pop()?;
        let _ = ch.state.app_writer.request.push(StateRequest::Read {
            session: request.session,
            lock: false,
        });
        let _ = ch
            .tx_window
            .app_writer
            .request
            .push(TxWindowRequest::Read(request.session));
        Some(Writing::Checking {
            request,
            state: None,
            window: None,
        })
    }

    /// Decides a write once both reads are in.
    fn check(
        &self,
        request: WriteRequest,
        state: TcpState,
        window: TxWindow,
        ch: &mut Channels,
    ) -> Option<Writing> {
        let space = self.buffer_size.saturating_sub(window.buffered());
        let status = if state != TcpState::Established {
            WriteStatus::NoConnection
        } else if request.length > space {
            WriteStatus::NoSpace
        } else {
            WriteStatus::Ok
        };
        let space_left = match status {
            WriteStatus::Ok => space - request.length,
            _ => space,
        };
        let _ = ch.write.reply.push(WriteReply {
            session: request.session,
            status,
            space_left,
        });

        if status != WriteStatus::Ok {
            tracing::debug!(session = %request.session, ?status, length = request.length, "Write refused");
            return (request.length > 0).then_some(Writing::Discarding);
        }
        if request.length == 0 {
            return None;
        }
        let _ = ch.tx_window.app_writer.request.push(TxWindowRequest::Written {
            session: request.session,
            length: request.length,
        });
        let access = BufferAccess::new(
            self.tx_base,
            request.session,
            self.buffer_size,
            window.app_written,
            request.length,
        );
        Some(Writing::Storing {
            request,
            transfer: WriteTransfer::new(access),
        })
    }

    fn advance(&mut self, writing: Writing, ch: &mut Channels) -> Option<Writing> {
        match writing {
            Writing::Checking {
                request,
                mut state,
                mut window,
            } => {
                if state.is_none() {
                    state = ch.state.app_writer.reply.pop().map(|reply| reply.state);
                }
                if window.is_none() {
                    window = ch.tx_window.app_writer.reply.pop().map(|reply| reply.window);
                }
                let ready = !ch.write.reply.is_full() && !ch.tx_window.app_writer.request.is_full();
                match (state, window) {
                    (Some(state), Some(window)) if ready => self.check(request, state, window, ch),
                    _ => Some(Writing::Checking {
                        request,
                        state,
                        window,
                    }),
                }
            }
            Writing::Discarding => match ch.write_data.pop() {
                Some(word) if word.last => None,
                _ => Some(Writing::Discarding),
            },
            Writing::Storing {
                request,
                mut transfer,
            } => {
                let memory = &mut ch.memory.tx_write;
                if transfer.step(&mut ch.write_data, &mut memory.command, &mut memory.data) {
                    Some(Writing::Confirming {
                        request,
                        split: transfer.is_split(),
                    })
                } else {
                    Some(Writing::Storing { request, transfer })
                }
            }
            Writing::Confirming { request, split } => {
                let needed = if split { 2 } else { 1 };
                let statuses = &mut ch.memory.tx_write.status;
                if statuses.len() < needed || ch.app_writer_events.is_full() {
                    return Some(Writing::Confirming { request, split });
                }
                let ok = (0..needed)
                    .filter_map(|_| statuses.pop())
                    .fold(true, |ok, status| ok && status.ok);
                if ok {
                    let _ = ch.app_writer_events.push(
                        Event::new(EventKind::Tx, request.session).with_length(request.length),
                    );
                } else {
                    tracing::warn!(
                        session = %request.session,
                        length = request.length,
                        "Transmit buffer write failed"
                    );
                }
                None
            }
        }
    }
}

impl Stage for AppWriter {
    fn step(&mut self, ch: &mut Channels) {
        self.writing = match self.writing.take() {
            Some(writing) => self.advance(writing, ch),
            None => Self::start(ch),
        };
    }

    fn is_idle(&self) -> bool {
        self.writing.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{MemCommand, MemStatus},
        tables::{StateReply, TxWindowReply},
        types::SessionId,
        wire::{from_words, to_words, Word},
    };

    const BUFFER: u32 = 64;

    fn setup() -> (AppWriter, Channels, ToeConfig) {
        let config = ToeConfig::default().max_sessions(4).buffer_size(BUFFER);
        (AppWriter::new(&config), Channels::new(&config), config)
    }

    fn answer(ch: &mut Channels, session: SessionId, state: TcpState, unacked: u32, written: u32) {
        ch.state
            .app_writer
            .reply
            .push(StateReply { session, state })
            .unwrap();
        ch.tx_window
            .app_writer
            .reply
            .push(TxWindowReply {
                session,
                window: TxWindow {
                    unacked,
                    next_byte: unacked,
                    app_written: written,
                    ..Default::default()
                },
            })
            .unwrap();
    }

    fn submit(ch: &mut Channels, session: SessionId, bytes: &[u8]) {
        ch.write
            .request
            .push(WriteRequest {
                session,
                length: bytes.len() as u32,
            })
            .unwrap();
        for word in to_words(bytes) {
            ch.write_data.push(word).unwrap();
        }
    }

    #[test]
    fn accepted_write_is_stored_then_sent() {
        let (mut writer, mut ch, config) = setup();
        let session = SessionId::new(1);
        let bytes: Vec<u8> = (0..20).collect();
        submit(&mut ch, session, &bytes);
        writer.step(&mut ch);
        ch.state.app_writer.request.pop();
        ch.tx_window.app_writer.request.pop();
        // Ten bytes in flight, the write wraps at the buffer end
        answer(&mut ch, session, TcpState::Established, 44, 54);
        writer.step(&mut ch);
        assert_eq!(
            ch.write.reply.pop(),
            Some(WriteReply {
                session,
                status: WriteStatus::Ok,
                space_left: 34
            })
        );
        assert_eq!(
            ch.tx_window.app_writer.request.pop(),
            Some(TxWindowRequest::Written { session, length: 20 })
        );

        for _ in 0..20 {
            writer.step(&mut ch);
        }
        let base = config.tx_base + BUFFER as u64;
        let commands: Vec<MemCommand> = ch.memory.tx_write.command.drain().collect();
        assert_eq!(
            commands,
            vec![MemCommand::new(base + 54, 10), MemCommand::new(base, 10)]
        );
        let words: Vec<Word> = ch.memory.tx_write.data.drain().collect();
        assert_eq!(from_words(&words), bytes);
        assert!(ch.app_writer_events.is_empty());

        ch.memory.tx_write.status.push(MemStatus { ok: true }).unwrap();
        ch.memory.tx_write.status.push(MemStatus { ok: true }).unwrap();
        writer.step(&mut ch);
        assert!(writer.is_idle());
        assert_eq!(
            ch.app_writer_events.pop(),
            Some(Event::new(EventKind::Tx, session).with_length(20))
        );
    }

    #[test]
    fn refused_writes_drop_their_data() {
        let (mut writer, mut ch, _) = setup();
        let session = SessionId::new(2);
        let cases = [
            (TcpState::SynSent, WriteStatus::NoConnection, 14),
            (TcpState::Established, WriteStatus::NoSpace, 14),
        ];
        for (state, status, space_left) in cases {
            submit(&mut ch, session, &[7; 20]);
            writer.step(&mut ch);
            ch.state.app_writer.request.pop();
            ch.tx_window.app_writer.request.pop();
            answer(&mut ch, session, state, 0, 50);
            writer.step(&mut ch);
            assert_eq!(
                ch.write.reply.pop(),
                Some(WriteReply {
                    session,
                    status,
                    space_left
                })
            );
            for _ in 0..5 {
                writer.step(&mut ch);
            }
            assert!(writer.is_idle());
            assert!(ch.write_data.is_empty());
            assert!(ch.tx_window.app_writer.request.is_empty());
        }
        assert!(ch.memory.tx_write.command.is_empty());
        assert!(ch.app_writer_events.is_empty());
    }
}
