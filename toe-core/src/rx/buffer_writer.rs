use crate::{
    channels::Channels,
    config::ToeConfig,
    engine::Stage,
    memory::{BufferAccess, WriteTransfer},
};

/// Writes accepted payload into the session's receive buffer.
///
/// Writes that run past the end of the buffer become two memory commands.
/// Once every command of a write has its data, whether it was split is
/// reported so the notifier knows how many statuses to wait for.
#[derive(Debug)]
pub struct BufferWriter {
    rx_base: u64,
    buffer_size: u32,
    transfer: Option<WriteTransfer>,
}

impl BufferWriter {
    pub fn new(config: &ToeConfig) -> Self {
        Self {
            rx_base: config.rx_base,
            buffer_size: config.buffer_size,
            transfer: None,
        }
    }
}

impl Stage for BufferWriter {
    fn step(&mut self, ch: &mut Channels) {
        if self.transfer.is_none() {
            let Some(write) = ch.pending_writes.pop() else {
                return;
            };
            let access =
                BufferAccess::at(self.rx_base, self.buffer_size, write.address, write.length);
            if access.is_split() != write.split_across_wrap {
                tracing::error!(session = %write.session, "Write split disagrees with its address");
            }
            tracing::trace!(
                session = %write.session,
                length = write.length,
                split = access.is_split(),
                "Writing payload"
            );
            self.transfer = Some(WriteTransfer::new(access));
        }
        let Some(transfer) = self.transfer.as_mut() else {
            return;
        };

        // The split report goes out after the data, so there must be room
        if ch.write_splits.is_full() {
            return;
        }
        let memory = &mut ch.memory.rx_write;
        if transfer.step(&mut ch.kept_payload, &mut memory.command, &mut memory.data) {
            let _ = ch.write_splits.push(transfer.is_split());
            self.transfer = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.transfer.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::Ipv4Address,
        memory::MemCommand,
        types::{PendingWrite, SessionId},
        wire::{from_words, to_words, Word},
    };

    #[test]
    fn wrapped_write_takes_two_commands() {
        let config = ToeConfig::default().max_sessions(4).buffer_size(64);
        let mut ch = Channels::new(&config);
        let mut writer = BufferWriter::new(&config);
        let bytes: Vec<u8> = (0..20).collect();
        let session = SessionId::new(1);
        let access = BufferAccess::new(config.rx_base, session, 64, 60, 20);
        ch.pending_writes
            .push(PendingWrite {
                session,
                src_addr: Ipv4Address::LOCALHOST,
                dst_port: 80,
                length: 20,
                address: access.first.address,
                split_across_wrap: true,
            })
            .unwrap();
        for word in to_words(&bytes) {
            ch.kept_payload.push(word).unwrap();
        }
        for _ in 0..10 {
            writer.step(&mut ch);
        }
        assert!(writer.is_idle());
        assert_eq!(ch.write_splits.pop(), Some(true));
        let commands: Vec<MemCommand> = ch.memory.rx_write.command.drain().collect();
        assert_eq!(commands, vec![MemCommand::new(124, 4), MemCommand::new(64, 16)]);
        let words: Vec<Word> = ch.memory.rx_write.data.drain().collect();
        assert_eq!(from_words(&words), bytes);
        assert_eq!(words.iter().filter(|word| word.last).count(), 2);
    }
}
