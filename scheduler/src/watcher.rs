// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Per-Operation subscriber fan-out (spec.md §4.9). Each subscriber gets a
// bounded channel; a slow subscriber is dropped rather than allowed to
// backpressure the Job lock (spec.md §9 "a stalled watcher must not stall
// the scheduler").

use std::collections::HashMap;

use buildgrid_proto::longrunning::Operation;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel capacity per subscriber. Small on purpose: subscribers only ever
/// need the latest snapshot, never a full history.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 4;

#[derive(Clone, Debug)]
pub enum OperationUpdate {
    Snapshot(Operation),
    Cancelled,
}

pub struct SubscriberTable {
    senders: HashMap<Uuid, mpsc::Sender<OperationUpdate>>,
}

impl SubscriberTable {
    pub fn new() -> SubscriberTable {
        SubscriberTable {
            senders: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn register(&mut self, initial: Operation) -> (Uuid, mpsc::Receiver<OperationUpdate>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let _ = tx.try_send(OperationUpdate::Snapshot(initial));
        let id = Uuid::new_v4();
        self.senders.insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&mut self, id: Uuid) {
        self.senders.remove(&id);
    }

    /// Fans `update` out to every live subscriber. A full channel means the
    /// subscriber isn't keeping up; it is dropped from the set rather than
    /// awaited, so other subscribers of the same Operation are never
    /// blocked by one slow peer (spec.md §9). Dropping its sender closes
    /// the subscriber's receiver, which the RPC layer surfaces as
    /// RESOURCE_EXHAUSTED (spec.md §7).
    pub fn notify_all(&mut self, update: OperationUpdate) {
        let mut overflowed = Vec::new();
        for (id, sender) in &self.senders {
            match sender.try_send(update.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("dropping a slow subscriber that fell behind on operation updates");
                    overflowed.push(*id);
                }
            }
        }
        for id in overflowed {
            self.senders.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_operation() -> Operation {
        Operation {
            name: "job-1".into(),
            metadata: None,
            done: false,
            result: None,
        }
    }

    #[test]
    fn register_delivers_initial_snapshot() {
        let mut table = SubscriberTable::new();
        let (_, mut rx) = table.register(sample_operation());
        assert!(matches!(rx.try_recv(), Ok(OperationUpdate::Snapshot(_))));
    }

    #[test]
    fn unregister_stops_future_notifications() {
        let mut table = SubscriberTable::new();
        let (id, mut rx) = table.register(sample_operation());
        rx.try_recv().unwrap();
        table.unregister(id);
        table.notify_all(OperationUpdate::Cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_the_slow_subscriber_without_blocking_others() {
        let mut table = SubscriberTable::new();
        let (_, mut rx) = table.register(sample_operation());
        rx.try_recv().unwrap();
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 2) {
            table.notify_all(OperationUpdate::Cancelled);
        }
        // The subscriber fell behind and was evicted; its receiver now sees
        // a closed channel rather than stale buffered updates.
        assert!(table.senders.is_empty());
        assert!(rx.recv().await.is_none());
    }
}
