//! The command, data and status contract of the buffer memory, and a
//! reference store that implements it.
//!
//! A write is a [`MemCommand`] followed by exactly `byte_count` bytes of word
//! data, the final word flagged `last`, answered by one [`MemStatus`]. A read
//! is a command answered by `byte_count` bytes of word data, the final word
//! flagged `last`, and no status.

mod transfer;
pub use transfer::{BufferAccess, ReadTransfer, WriteTransfer};

use crate::{
    channels::Channels,
    engine::Stage,
    fifo::Fifo,
    wire::{Word, WORD_BYTES},
};
use rustc_hash::FxHashMap;

const PAGE_BYTES: usize = 4096;

/// One memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemCommand {
    pub address: u64,
    pub byte_count: u32,
}

impl MemCommand {
    pub fn new(address: u64, byte_count: u32) -> Self {
        Self {
            address,
            byte_count,
        }
    }
}

/// The outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStatus {
    pub ok: bool,
}

/// The queues of one write port.
#[derive(Debug)]
pub struct WritePort {
    pub command: Fifo<MemCommand>,
    pub data: Fifo<Word>,
    pub status: Fifo<MemStatus>,
}

impl WritePort {
    pub fn new(capacity: usize) -> Self {
        Self {
            command: Fifo::new(capacity),
            data: Fifo::new(capacity),
            status: Fifo::new(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_empty() && self.data.is_empty() && self.status.is_empty()
    }
}

/// The queues of one read port.
#[derive(Debug)]
pub struct ReadPort {
    pub command: Fifo<MemCommand>,
    pub data: Fifo<Word>,
}

impl ReadPort {
    pub fn new(capacity: usize) -> Self {
        Self {
            command: Fifo::new(capacity),
            data: Fifo::new(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_empty() && self.data.is_empty()
    }
}

/// The four ports the engine drives.
#[derive(Debug)]
pub struct MemoryPorts {
    pub rx_write: WritePort,
    pub rx_read: ReadPort,
    pub tx_write: WritePort,
    /// Used by the external segment builder to fetch payload
    pub tx_read: ReadPort,
}

impl MemoryPorts {
    pub fn new(capacity: usize) -> Self {
        Self {
            rx_write: WritePort::new(capacity),
            rx_read: ReadPort::new(capacity),
            tx_write: WritePort::new(capacity),
            tx_read: ReadPort::new(capacity),
        }
    }
}

/// Byte-addressed storage allocated a page at a time. Unwritten bytes read as
/// zero.
#[derive(Debug, Default)]
struct Pages {
    pages: FxHashMap<u64, Box<[u8; PAGE_BYTES]>>,
}

impl Pages {
    fn write(&mut self, mut address: u64, bytes: &[u8]) {
        let mut bytes = bytes;
        while !bytes.is_empty() {
            let offset = (address % PAGE_BYTES as u64) as usize;
            let len = bytes.len().min(PAGE_BYTES - offset);
            let page = self
                .pages
                .entry(address / PAGE_BYTES as u64)
                .or_insert_with(|| Box::new([0; PAGE_BYTES]));
            page[offset..offset + len].copy_from_slice(&bytes[..len]);
            bytes = &bytes[len..];
            address += len as u64;
        }
    }

    fn read(&self, address: u64, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            let address = address + i as u64;
            *byte = self
                .pages
                .get(&(address / PAGE_BYTES as u64))
                .map_or(0, |page| page[(address % PAGE_BYTES as u64) as usize]);
        }
    }
}

#[derive(Debug)]
struct ActiveWrite {
    command: MemCommand,
    written: u32,
    ok: bool,
}

#[derive(Debug)]
struct ActiveRead {
    address: u64,
    remaining: u32,
}

/// A write port's progress.
#[derive(Debug, Default)]
struct WriteChannel {
    active: Option<ActiveWrite>,
}

/// A read port's progress.
#[derive(Debug, Default)]
struct ReadChannel {
    active: Option<ActiveRead>,
}

/// The reference memory. Every port moves at most one word per step.
#[derive(Debug)]
pub struct Dram {
    store: Pages,
    capacity: u64,
    fail_writes: u32,
    rx_write: WriteChannel,
    rx_read: ReadChannel,
    tx_write: WriteChannel,
    tx_read: ReadChannel,
}

impl Dram {
    /// Creates a memory covering addresses `0..capacity`.
    pub fn new(capacity: u64) -> Self {
        Self {
            store: Pages::default(),
            capacity,
            fail_writes: 0,
            rx_write: WriteChannel::default(),
            rx_read: ReadChannel::default(),
            tx_write: WriteChannel::default(),
            tx_read: ReadChannel::default(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Makes the next `count` write commands report failure. Their data is
    /// consumed and discarded.
    pub fn fail_next_writes(&mut self, count: u32) {
        self.fail_writes = count;
    }

    /// Copies bytes straight out of the store.
    pub fn peek(&self, address: u64, out: &mut [u8]) {
        self.store.read(address, out);
    }

    /// Copies bytes straight into the store.
    pub fn poke(&mut self, address: u64, bytes: &[u8]) {
        self.store.write(address, bytes);
    }

    fn serve_write(
        store: &mut Pages,
        channel: &mut WriteChannel,
        port: &mut WritePort,
        in_range: impl Fn(&MemCommand) -> bool,
        fail_writes: &mut u32,
    ) {
        if channel.active.is_none() {
            if let Some(command) = port.command.pop() {
                let mut ok = in_range(&command);
                if *fail_writes > 0 {
                    *fail_writes -= 1;
                    ok = false;
                }
                channel.active = Some(ActiveWrite {
                    command,
                    written: 0,
                    ok,
                });
            }
            return;
        }
        let Some(active) = channel.active.as_mut() else {
            return;
        };

        // The status has to fit before the final word is taken
        if port.status.is_full() {
            return;
        }
        let Some(word) = port.data.pop() else {
            return;
        };
        let room = active.command.byte_count.saturating_sub(active.written) as usize;
        let bytes = &word.bytes()[..word.len().min(room)];
        if active.ok {
            store.write(active.command.address + active.written as u64, bytes);
        }
        active.written += bytes.len() as u32;

        if word.last {
            let ok = active.ok && active.written == active.command.byte_count;
            if !ok {
                tracing::warn!(
                    address = active.command.address,
                    byte_count = active.command.byte_count,
                    written = active.written,
                    "Memory write failed"
                );
            }
            let _ = port.status.push(MemStatus { ok });
            channel.active = None;
        }
    }

    fn serve_read(store: &Pages, capacity: u64, channel: &mut ReadChannel, port: &mut ReadPort) {
        if channel.active.is_none() {
            if let Some(command) = port.command.pop() {
                if command.address + command.byte_count as u64 > capacity {
                    tracing::debug!(address = command.address, "Memory read out of range");
                }
                channel.active = Some(ActiveRead {
                    address: command.address,
                    remaining: command.byte_count,
                });
            }
            return;
        }
        let Some(active) = channel.active.as_mut() else {
            return;
        };

        if port.data.is_full() {
            return;
        }
        let len = (active.remaining as usize).min(WORD_BYTES);
        let mut bytes = [0u8; WORD_BYTES];
        for (i, byte) in bytes[..len].iter_mut().enumerate() {
            let address = active.address + i as u64;
            if address < capacity {
                store.read(address, std::slice::from_mut(byte));
            }
        }
        active.address += len as u64;
        active.remaining -= len as u32;
        let last = active.remaining == 0;
        let _ = port.data.push(Word::new(&bytes[..len], last));
        if last {
            channel.active = None;
        }
    }
}

impl Stage for Dram {
    fn step(&mut self, ch: &mut Channels) {
        let capacity = self.capacity;
        let in_range = |command: &MemCommand| command.address + command.byte_count as u64 <= capacity;
        Self::serve_write(
            &mut self.store,
            &mut self.rx_write,
            &mut ch.memory.rx_write,
            in_range,
            &mut self.fail_writes,
        );
        Self::serve_write(
            &mut self.store,
            &mut self.tx_write,
            &mut ch.memory.tx_write,
            in_range,
            &mut self.fail_writes,
        );
        Self::serve_read(&self.store, capacity, &mut self.rx_read, &mut ch.memory.rx_read);
        Self::serve_read(&self.store, capacity, &mut self.tx_read, &mut ch.memory.tx_read);
    }

    fn is_idle(&self) -> bool {
        self.rx_write.active.is_none()
            && self.tx_write.active.is_none()
            && self.rx_read.active.is_none()
            && self.tx_read.active.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{from_words, to_words};

    fn run(dram: &mut Dram, ports: &mut WritePort, steps: usize) {
        for _ in 0..steps {
            Dram::serve_write(
                &mut dram.store,
                &mut dram.rx_write,
                ports,
                |_| true,
                &mut dram.fail_writes,
            );
        }
    }

    #[test]
    fn write_then_read() {
        let mut dram = Dram::new(1 << 20);
        let mut port = WritePort::new(16);
        let bytes: Vec<u8> = (0..20).collect();
        port.command.push(MemCommand::new(4090, 20)).unwrap();
        for word in to_words(&bytes) {
            port.data.push(word).unwrap();
        }
        run(&mut dram, &mut port, 8);
        assert_eq!(port.status.pop(), Some(MemStatus { ok: true }));

        let mut read = ReadPort::new(16);
        read.command.push(MemCommand::new(4090, 20)).unwrap();
        for _ in 0..8 {
            Dram::serve_read(&dram.store, dram.capacity, &mut dram.rx_read, &mut read);
        }
        let words: Vec<Word> = read.data.drain().collect();
        assert_eq!(words.len(), 3);
        assert!(words[2].last);
        assert_eq!(from_words(&words), bytes);
    }

    #[test]
    fn short_write_fails() {
        let mut dram = Dram::new(1 << 20);
        let mut port = WritePort::new(16);
        port.command.push(MemCommand::new(0, 10)).unwrap();
        port.data.push(Word::new(&[1, 2, 3], true)).unwrap();
        run(&mut dram, &mut port, 4);
        assert_eq!(port.status.pop(), Some(MemStatus { ok: false }));
    }

    #[test]
    fn injected_failure() {
        let mut dram = Dram::new(1 << 20);
        dram.fail_next_writes(1);
        let mut port = WritePort::new(16);
        for _ in 0..2 {
            port.command.push(MemCommand::new(0, 2)).unwrap();
            port.data.push(Word::new(&[1, 2], true)).unwrap();
        }
        run(&mut dram, &mut port, 8);
        assert_eq!(port.status.pop(), Some(MemStatus { ok: false }));
        assert_eq!(port.status.pop(), Some(MemStatus { ok: true }));
    }

    #[test]
    fn unwritten_memory_reads_zero() {
        let dram = Dram::new(64);
        let mut out = [0xff; 4];
        dram.peek(100, &mut out);
        assert_eq!(out, [0; 4]);
    }
}
