use crate::{
    channels::Channels,
    engine::Stage,
    fifo::{Fifo, Rpc},
};

/// Ports from here up are handed out for active opens. Ports below can be
/// listened on.
pub const EPHEMERAL_BASE: u16 = 32768;

const HALF: usize = EPHEMERAL_BASE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EphemeralRequest {
    /// Reserve a free ephemeral port. Always answered.
    Allocate,
    /// Return a port. Not answered.
    Release(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReply {
    pub port: u16,
    /// Whether the port is open, or whether a listen request was accepted
    pub open: bool,
}

/// The clients of the port table, in priority order.
#[derive(Debug)]
pub struct PortClients {
    pub resolver: Rpc<u16, PortReply>,
    pub listen: Rpc<u16, PortReply>,
    pub ephemeral: Rpc<EphemeralRequest, Option<u16>>,
}

impl PortClients {
    pub fn new(capacity: usize) -> Self {
        Self {
            resolver: Rpc::new(capacity),
            listen: Rpc::new(capacity),
            ephemeral: Rpc::new(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        [&self.resolver, &self.listen]
            .iter()
            .all(|rpc| rpc.request.is_empty() && rpc.reply.is_empty())
            && self.ephemeral.request.is_empty()
            && self.ephemeral.reply.is_empty()
    }
}

/// Tracks which ports accept segments: listening ports below
/// [`EPHEMERAL_BASE`] and ephemeral ports in use by active opens above it.
#[derive(Debug)]
pub struct PortTable {
    listening: Vec<bool>,
    ephemeral: Vec<bool>,
    /// Where the search for a free ephemeral port starts
    next_ephemeral: usize,
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTable {
    pub fn new() -> Self {
        Self {
            listening: vec![false; HALF],
            ephemeral: vec![false; HALF],
            next_ephemeral: 0,
        }
    }

    pub fn is_open(&self, port: u16) -> bool {
        let port = port as usize;
        if port < HALF {
            self.listening[port]
        } else {
            self.ephemeral[port - HALF]
        }
    }

    /// Starts listening. Refused for ephemeral ports and ports already
    /// listening.
    pub fn listen(&mut self, port: u16) -> bool {
        if port >= EPHEMERAL_BASE || self.listening[port as usize] {
            return false;
        }
        self.listening[port as usize] = true;
        tracing::info!(port, "Listening");
        true
    }

    pub fn allocate(&mut self) -> Option<u16> {
        let found = (0..HALF)
            .map(|i| (self.next_ephemeral + i) % HALF)
            .find(|&i| !self.ephemeral[i])?;
        self.ephemeral[found] = true;
        self.next_ephemeral = (found + 1) % HALF;
        Some((found + HALF) as u16)
    }

    pub fn release(&mut self, port: u16) {
        if port >= EPHEMERAL_BASE {
            self.ephemeral[port as usize - HALF] = false;
        }
    }

    fn serve_release(&mut self, release: &mut Fifo<u16>) {
        if let Some(port) = release.pop() {
            self.release(port);
        }
    }
}

impl Stage for PortTable {
    fn step(&mut self, ch: &mut Channels) {
        self.serve_release(&mut ch.port_release);

        let rpc = &mut ch.ports.resolver;
        if rpc.can_reply() {
            if let Some(port) = rpc.request.pop() {
                let open = self.is_open(port);
                let _ = rpc.reply.push(PortReply { port, open });
            }
        }

        let rpc = &mut ch.ports.listen;
        if rpc.can_reply() {
            if let Some(port) = rpc.request.pop() {
                let open = self.listen(port);
                let _ = rpc.reply.push(PortReply { port, open });
            }
        }

        let rpc = &mut ch.ports.ephemeral;
        match rpc.request.peek() {
            Some(EphemeralRequest::Release(port)) => {
                let port = *port;
                rpc.request.pop();
                self.release(port);
            }
            Some(EphemeralRequest::Allocate) if rpc.can_reply() => {
                rpc.request.pop();
                let port = self.allocate();
                let _ = rpc.reply.push(port);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_once() {
        let mut table = PortTable::new();
        assert!(!table.is_open(80));
        assert!(table.listen(80));
        assert!(!table.listen(80));
        assert!(table.is_open(80));
        assert!(!table.listen(40000));
    }

    #[test]
    fn ephemeral_ports_cycle() {
        let mut table = PortTable::new();
        let first = table.allocate().unwrap();
        assert_eq!(first, EPHEMERAL_BASE);
        assert!(table.is_open(first));
        let second = table.allocate().unwrap();
        assert_eq!(second, EPHEMERAL_BASE + 1);
        table.release(first);
        assert!(!table.is_open(first));
        // The search continues after the last handed out port
        assert_eq!(table.allocate(), Some(EPHEMERAL_BASE + 2));
    }

    #[test]
    fn ephemeral_ports_run_out() {
        let mut table = PortTable::new();
        for _ in 0..HALF {
            assert!(table.allocate().is_some());
        }
        assert_eq!(table.allocate(), None);
        table.release(u16::MAX);
        assert_eq!(table.allocate(), Some(u16::MAX));
    }
}
