use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    memory::{BufferAccess, ReadTransfer},
    tables::RxWindowRequest,
    types::ReadRequest,
    wire::Word,
};

#[derive(Debug)]
enum Reading {
    /// Waiting for the read pointer
    Pointer(ReadRequest),
    Data(ReadTransfer),
}

/// Serves application reads out of the receive buffers.
///
/// The read pointer advances as soon as a request is accepted. A read never
/// goes past the received data: longer requests are cut short, and a read
/// with nothing to hand out ends in a single empty `last` word. Reads that
/// wrap around the buffer end are issued as two memory reads and handed to
/// the application as one packed stream.
#[derive(Debug)]
pub struct BufferReader {
    rx_base: u64,
    buffer_size: u32,
    reading: Option<Reading>,
}

impl BufferReader {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            rx_base: config.rx_base,
            buffer_size: config.buffer_size,
            reading: None,
        }
    }
}

impl Stage for BufferReader {
    fn step(&mut self, ch: &mut Channels) {
        match self.reading.take() {
            None => {
                if ch.rx_window.reader.request.is_full() {
                    return;
                }
                let Some(request) = ch.read_requests.pop() else {
                    return;
                };
                if request.length == 0 {
                    tracing::debug!(session = %request.session, "Ignoring empty read");
                    return;
                }
                let _ = ch.rx_window.reader.request.push(RxWindowRequest::Consume {
                    session: request.session,
                    length: request.length,
                });
                self.reading = Some(Reading::Pointer(request));
            }
            Some(Reading::Pointer(request)) => {
                if ch.read_sessions.is_full() || ch.read_data.is_full() {
                    self.reading = Some(Reading::Pointer(request));
                    return;
                }
                let Some(reply) = ch.rx_window.reader.reply.pop() else {
                    self.reading = Some(Reading::Pointer(request));
                    return;
                };
                let length = reply.window.readable(request.length);
                let _ = ch.read_sessions.push(request.session);
                if length == 0 {
                    tracing::debug!(session = %request.session, "Nothing to read");
                    let _ = ch.read_data.push(Word::new(&[], true));
                    return;
                }
                if length < request.length {
                    tracing::debug!(
                        session = %request.session,
                        requested = request.length,
                        length,
                        "Read cut short"
                    );
                }
                let access = BufferAccess::new(
                    self.rx_base,
                    request.session,
                    self.buffer_size,
                    reply.window.app_read,
                    length,
                );
                self.reading = Some(Reading::Data(ReadTransfer::new(access)));
            }
            Some(Reading::Data(mut transfer)) => {
                let memory = &mut ch.memory.rx_read;
                if !transfer.step(&mut memory.command, &mut memory.data, &mut ch.read_data) {
                    self.reading = Some(Reading::Data(transfer));
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.reading.is_none()
    }
}
