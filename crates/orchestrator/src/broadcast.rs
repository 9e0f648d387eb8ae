//! Best-effort realtime fan-out of node state deltas. Each subscriber gets
//! a bounded channel and a non-blocking send; a subscriber that is full or
//! gone is dropped so it can never stall the heartbeat path.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use mesh_core::ids::MachineId;
use mesh_core::node::NodeStatus;
use serde::Serialize;
use tokio::sync::mpsc;

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone, Debug, Serialize)]
pub struct NodeDelta {
    pub machine_id: MachineId,
    pub status: NodeStatus,
    pub metrics: Option<serde_json::Value>,
    pub timestamp: u64,
}

#[derive(Default)]
pub struct RealtimeBroadcaster {
    subscribers: DashMap<u64, mpsc::Sender<NodeDelta>>,
    next_id: AtomicU64,
}

impl RealtimeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<NodeDelta>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Non-blocking delivery to every subscriber. Failures disconnect the
    /// subscriber in question and never affect the others.
    pub fn publish(&self, delta: NodeDelta) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if let Err(e) = entry.value().try_send(delta.clone()) {
                tracing::debug!(subscriber = *entry.key(), error = %e, "dropping slow subscriber");
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(ts: u64) -> NodeDelta {
        NodeDelta {
            machine_id: MachineId(1),
            status: NodeStatus::Online,
            metrics: None,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let b = RealtimeBroadcaster::new();
        let (_ida, mut rx_a) = b.subscribe();
        let (_idb, mut rx_b) = b.subscribe();

        b.publish(delta(1));
        assert_eq!(rx_a.recv().await.unwrap().timestamp, 1);
        assert_eq!(rx_b.recv().await.unwrap().timestamp, 1);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_without_blocking_others() {
        let b = RealtimeBroadcaster::new();
        let (_ida, rx_a) = b.subscribe();
        let (_idb, mut rx_b) = b.subscribe();
        drop(rx_a);

        b.publish(delta(7));
        assert_eq!(b.subscriber_count(), 1);
        assert_eq!(rx_b.recv().await.unwrap().timestamp, 7);
    }

    #[tokio::test]
    async fn full_subscriber_is_disconnected() {
        let b = RealtimeBroadcaster::new();
        let (_id, mut rx) = b.subscribe();
        for i in 0..(SUBSCRIBER_BUFFER as u64 + 1) {
            b.publish(delta(i));
        }
        // Overflow disconnects; buffered deltas stay readable.
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(rx.recv().await.unwrap().timestamp, 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry() {
        let b = RealtimeBroadcaster::new();
        let (id, _rx) = b.subscribe();
        b.unsubscribe(id);
        assert_eq!(b.subscriber_count(), 0);
    }
}
