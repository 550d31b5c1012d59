use super::MemCommand;
use crate::{
    fifo::Fifo,
    types::SessionId,
    wire::{Realigner, Word, WORD_BYTES},
};
use std::collections::VecDeque;

/// Where an access to a session's circular buffer lands in memory: one
/// command, or two when the access runs past the end of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAccess {
    pub first: MemCommand,
    pub second: Option<MemCommand>,
}

impl BufferAccess {
    /// The access of `length` bytes starting at sequence number `pointer` in
    /// the buffer of `session`. `buffer_size` must be a power of two.
    pub fn new(
        region_base: u64,
        session: SessionId,
        buffer_size: u32,
        pointer: u32,
        length: u32,
    ) -> Self {
        let base = region_base + session.index() as u64 * buffer_size as u64;
        let offset = pointer & (buffer_size - 1);
        Self::split(base, offset, buffer_size, length)
    }

    /// The access of `length` bytes starting at a physical address inside a
    /// buffer of the region.
    pub fn at(region_base: u64, buffer_size: u32, address: u64, length: u32) -> Self {
        let offset = ((address - region_base) % buffer_size as u64) as u32;
        Self::split(address - offset as u64, offset, buffer_size, length)
    }

    fn split(base: u64, offset: u32, buffer_size: u32, length: u32) -> Self {
        if offset as u64 + length as u64 > buffer_size as u64 {
            let head = buffer_size - offset;
            Self {
                first: MemCommand::new(base + offset as u64, head),
                second: Some(MemCommand::new(base, length - head)),
            }
        } else {
            Self {
                first: MemCommand::new(base + offset as u64, length),
                second: None,
            }
        }
    }

    pub fn is_split(&self) -> bool {
        self.second.is_some()
    }

    /// Total bytes covered.
    pub fn length(&self) -> u32 {
        self.first.byte_count + self.second.map_or(0, |second| second.byte_count)
    }

    fn commands(&self) -> VecDeque<MemCommand> {
        std::iter::once(self.first).chain(self.second).collect()
    }
}

/// Moves one word stream into memory as the commands of a [`BufferAccess`].
///
/// The incoming stream is re-sliced so that each command is followed by
/// exactly its own bytes, its final word flagged `last`. Input beyond the
/// access is read up to its `last` word and discarded. Input that ends early
/// closes every remaining command with a short final word, which the memory
/// reports as failed.
#[derive(Debug)]
pub struct WriteTransfer {
    commands: VecDeque<MemCommand>,
    part_remaining: u32,
    input_done: bool,
    realigner: Realigner,
    split: bool,
}

impl WriteTransfer {
    pub fn new(access: BufferAccess) -> Self {
        Self {
            commands: access.commands(),
            part_remaining: 0,
            input_done: false,
            realigner: Realigner::new(),
            split: access.is_split(),
        }
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    /// Issues at most one command, takes at most one input word and hands
    /// memory at most one data word. Returns whether the transfer is over.
    pub fn step(
        &mut self,
        input: &mut Fifo<Word>,
        command: &mut Fifo<MemCommand>,
        data: &mut Fifo<Word>,
    ) -> bool {
        if self.part_remaining == 0 {
            match self.commands.front() {
                Some(next) => {
                    if command.push(*next).is_err() {
                        return false;
                    }
                    self.part_remaining = next.byte_count;
                    self.commands.pop_front();
                }
                None => {
                    if !self.input_done {
                        if let Some(word) = input.pop() {
                            self.input_done = word.last;
                        }
                    }
                    if self.input_done {
                        self.realigner.clear();
                    }
                    return self.input_done;
                }
            }
        }

        let want = (self.part_remaining as usize).min(WORD_BYTES);
        if self.realigner.staged() < want && !self.input_done {
            if let Some(word) = input.pop() {
                self.realigner.push(&word);
                self.input_done = word.last;
            }
        }

        let staged = self.realigner.staged();
        let short = self.input_done && staged < want;
        if (staged >= want || short) && !data.is_full() {
            let take = want.min(staged);
            let last = short || take as u32 == self.part_remaining;
            let _ = data.push(self.realigner.take(take, last));
            self.part_remaining = if short {
                0
            } else {
                self.part_remaining - take as u32
            };
        }
        false
    }
}

/// Gathers the data of a [`BufferAccess`] read back out of memory into one
/// packed word stream, flagged `last` only on its final word.
#[derive(Debug)]
pub struct ReadTransfer {
    commands: VecDeque<MemCommand>,
    remaining: u32,
    realigner: Realigner,
}

impl ReadTransfer {
    pub fn new(access: BufferAccess) -> Self {
        Self {
            commands: access.commands(),
            remaining: access.length(),
            realigner: Realigner::new(),
        }
    }

    /// Issues at most one command, takes at most one memory word and emits
    /// at most one output word. Returns whether the transfer is over.
    pub fn step(
        &mut self,
        command: &mut Fifo<MemCommand>,
        data: &mut Fifo<Word>,
        output: &mut Fifo<Word>,
    ) -> bool {
        if let Some(next) = self.commands.front() {
            if command.push(*next).is_ok() {
                self.commands.pop_front();
            }
        }

        let want = (self.remaining as usize).min(WORD_BYTES);
        if self.realigner.staged() < want {
            if let Some(word) = data.pop() {
                self.realigner.push(&word);
            }
        }
        if want > 0 && self.realigner.staged() >= want && !output.is_full() {
            let last = want as u32 == self.remaining;
            let _ = output.push(self.realigner.take(want, last));
            self.remaining -= want as u32;
        }
        self.remaining == 0 && self.commands.is_empty()
    }
}
