//! The pending-response table.
//!
//! Commands that expect an answer register a one-shot awaiter against the
//! event id they expect back. Matching is strict FIFO per event id; a
//! timed-out awaiter is removed by identity, never by position, since
//! several awaiters for the same event id can be in flight at once.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

use futures::channel::oneshot;

use crate::protocol::Frame;

/// Why an awaiter completed without a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The deadline passed with no matching event.
    Timeout,
    /// The session shut down.
    Cancelled,
}

pub(crate) type WaitResult = Result<Frame, WaitError>;

/// Completion side of an installed awaiter.
pub(crate) type Receiver = oneshot::Receiver<WaitResult>;

struct Awaiter {
    id: u64,
    deadline: Instant,
    tx: oneshot::Sender<WaitResult>,
}

/// Event-id keyed queues of one-shot awaiters.
#[derive(Default)]
pub(crate) struct PendingTable {
    next_id: u64,
    queues: BTreeMap<u32, VecDeque<Awaiter>>,
}

impl PendingTable {
    /// Registers an awaiter for `event` and returns its identity together
    /// with the completion receiver.
    pub(crate) fn install(
        &mut self,
        event: u32,
        deadline: Instant,
    ) -> (u64, oneshot::Receiver<WaitResult>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.queues
            .entry(event)
            .or_default()
            .push_back(Awaiter { id, deadline, tx });

        (id, rx)
    }

    /// Delivers `frame` to the oldest awaiter for its event id. Returns
    /// false when no awaiter was queued, leaving the frame for the
    /// unsolicited handler.
    pub(crate) fn complete(&mut self, event: u32, frame: Frame) -> bool {
        let Some(queue) = self.queues.get_mut(&event) else {
            return false;
        };

        let Some(awaiter) = queue.pop_front() else {
            return false;
        };
        if queue.is_empty() {
            self.queues.remove(&event);
        }

        // The requester may have given up; that is not our problem here.
        let _ = awaiter.tx.send(Ok(frame));
        true
    }

    /// Removes the awaiter with identity `id`, wherever it sits in the
    /// queue.
    pub(crate) fn remove(&mut self, event: u32, id: u64) -> bool {
        let Some(queue) = self.queues.get_mut(&event) else {
            return false;
        };

        let before = queue.len();
        queue.retain(|awaiter| awaiter.id != id);
        let removed = queue.len() < before;

        if queue.is_empty() {
            self.queues.remove(&event);
        }

        removed
    }

    /// The earliest deadline across all awaiters.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.queues
            .values()
            .flat_map(|queue| queue.iter().map(|awaiter| awaiter.deadline))
            .min()
    }

    /// Fails every awaiter whose deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant) {
        self.queues.retain(|event, queue| {
            let mut kept = VecDeque::with_capacity(queue.len());
            for awaiter in queue.drain(..) {
                if awaiter.deadline <= now {
                    log::debug!("awaiter for event {event} timed out");
                    let _ = awaiter.tx.send(Err(WaitError::Timeout));
                } else {
                    kept.push_back(awaiter);
                }
            }

            *queue = kept;
            !queue.is_empty()
        });
    }

    /// Fails every awaiter. Used at shutdown.
    pub(crate) fn cancel_all(&mut self) {
        for (_, queue) in std::mem::take(&mut self.queues) {
            for awaiter in queue {
                let _ = awaiter.tx.send(Err(WaitError::Cancelled));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn try_take(rx: &mut oneshot::Receiver<WaitResult>) -> Option<WaitResult> {
        rx.try_recv().expect("sender dropped without completing")
    }

    #[test]
    fn fifo_per_event_id() {
        let mut table = PendingTable::default();

        let (_, mut rx_a) = table.install(22, far());
        let (_, mut rx_b) = table.install(22, far());

        assert!(table.complete(22, Frame::with_values(22, 1, 0)));
        assert!(table.complete(22, Frame::with_values(22, 2, 0)));
        assert!(!table.complete(22, Frame::new(22)));

        assert_eq!(try_take(&mut rx_a).unwrap().unwrap().value1, 1);
        assert_eq!(try_take(&mut rx_b).unwrap().unwrap().value1, 2);
    }

    #[test]
    fn identity_removal_keeps_later_awaiters() {
        let mut table = PendingTable::default();

        let (id_a, _rx_a) = table.install(14, far());
        let (_, mut rx_b) = table.install(14, far());

        assert!(table.remove(14, id_a));
        assert!(!table.remove(14, id_a));

        assert!(table.complete(14, Frame::with_values(14, 7, 0)));
        assert_eq!(try_take(&mut rx_b).unwrap().unwrap().value1, 7);
    }

    #[test]
    fn expiry_is_per_awaiter() {
        let mut table = PendingTable::default();
        let now = Instant::now();

        let (_, mut rx_due) = table.install(15, now);
        let (_, mut rx_later) = table.install(15, far());

        table.expire(now);

        assert_matches!(try_take(&mut rx_due), Some(Err(WaitError::Timeout)));
        assert_eq!(try_take(&mut rx_later), None);

        assert!(table.complete(15, Frame::new(15)));
        assert_matches!(try_take(&mut rx_later), Some(Ok(_)));
    }

    #[test]
    fn cancel_all() {
        let mut table = PendingTable::default();
        let (_, mut rx) = table.install(36, far());

        table.cancel_all();
        assert_matches!(try_take(&mut rx), Some(Err(WaitError::Cancelled)));
        assert_eq!(table.next_deadline(), None);
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let mut table = PendingTable::default();
        let now = Instant::now();

        table.install(1, now + Duration::from_secs(5));
        table.install(2, now + Duration::from_secs(2));
        table.install(1, now + Duration::from_secs(9));

        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(2)));
    }
}
