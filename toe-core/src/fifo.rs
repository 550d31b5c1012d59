//! Fixed-capacity queues connecting the pipeline stages.
//!
//! A stage that finds its output full leaves its input untouched and tries
//! again on the next step, so a full queue slows the pipeline down instead of
//! losing data.

use std::collections::VecDeque;

/// A bounded first-in first-out queue.
#[derive(Debug, Clone)]
pub struct Fifo<T> {
    queue: VecDeque<T>,
    capacity: usize,
}

impl<T> Fifo<T> {
    /// Creates an empty queue that holds at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left in the queue.
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.queue.len())
    }

    /// Appends an item, handing it back if the queue is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            Err(item)
        } else {
            self.queue.push_back(item);
            Ok(())
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.queue.front()
    }

    /// Removes every queued item.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.queue.drain(..)
    }
}

/// A request queue paired with the queue its replies come back on. Each
/// client of a table owns one.
#[derive(Debug, Clone)]
pub struct Rpc<Req, Rsp> {
    pub request: Fifo<Req>,
    pub reply: Fifo<Rsp>,
}

impl<Req, Rsp> Rpc<Req, Rsp> {
    pub fn new(capacity: usize) -> Self {
        Self {
            request: Fifo::new(capacity),
            reply: Fifo::new(capacity),
        }
    }

    /// Whether a reply could be pushed without overflowing.
    pub fn can_reply(&self) -> bool {
        !self.reply.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_when_full() {
        let mut fifo = Fifo::new(2);
        assert!(fifo.push(1).is_ok());
        assert!(fifo.push(2).is_ok());
        assert_eq!(fifo.push(3), Err(3));
        assert_eq!(fifo.room(), 0);
        assert_eq!(fifo.pop(), Some(1));
        assert!(fifo.push(3).is_ok());
        assert_eq!(fifo.drain().collect::<Vec<_>>(), vec![2, 3]);
        assert!(fifo.is_empty());
    }

    #[test]
    fn peek_keeps_item() {
        let mut fifo = Fifo::new(4);
        fifo.push("a").unwrap();
        assert_eq!(fifo.peek(), Some(&"a"));
        assert_eq!(fifo.len(), 1);
    }
}
