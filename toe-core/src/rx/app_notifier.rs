use crate::{
    channels::Channels,
    engine::Stage,
    types::{AppNotification, NotificationStatus},
};
use std::collections::VecDeque;

#[derive(Debug)]
struct Queued {
    notification: AppNotification,
    /// Whether the notification waits for its payload write
    awaits_write: bool,
}

/// Holds data notifications back until memory confirms the payload write.
///
/// A write split across the buffer end needs both statuses. A failed write
/// still releases its notification, marked [`NotificationStatus::WriteFailed`].
/// Notifications without data go out at once unless data notifications are
/// waiting, in which case they queue behind them.
#[derive(Debug)]
pub struct AppNotifier {
    queue: VecDeque<Queued>,
    capacity: usize,
}

impl AppNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Sends the head of the queue if it is ready.
    fn release(&mut self, ch: &mut Channels) {
        let Some(head) = self.queue.front() else {
            return;
        };
        if ch.notifications.is_full() {
            return;
        }
        if !head.awaits_write {
            let _ = ch.notifications.push(head.notification);
            self.queue.pop_front();
            return;
        }

        let Some(&split) = ch.write_splits.peek() else {
            return;
        };
        let needed = if split { 2 } else { 1 };
        let statuses = &mut ch.memory.rx_write.status;
        if statuses.len() < needed {
            return;
        }
        ch.write_splits.pop();
        let ok = (0..needed)
            .filter_map(|_| statuses.pop())
            .fold(true, |ok, status| ok && status.ok);

        let mut notification = head.notification;
        if !ok {
            tracing::warn!(
                session = %notification.session,
                length = notification.length,
                "Payload write failed"
            );
            notification = notification.with_status(NotificationStatus::WriteFailed);
        }
        let _ = ch.notifications.push(notification);
        self.queue.pop_front();
    }

    fn admit(&mut self, ch: &mut Channels, notification: AppNotification) {
        let awaits_write = notification.length > 0;
        if !awaits_write && self.queue.is_empty() && ch.notifications.push(notification).is_ok() {
            return;
        }
        self.queue.push_back(Queued {
            notification,
            awaits_write,
        });
    }
}

impl Stage for AppNotifier {
    fn step(&mut self, ch: &mut Channels) {
        self.release(ch);

        if self.queue.len() >= self.capacity {
            return;
        }
        if let Some(notification) = ch.fsm_notifications.pop() {
            self.admit(ch, notification);
        } else if let Some(notification) = ch.timer_notifications.pop() {
            self.admit(ch, notification);
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }
}
