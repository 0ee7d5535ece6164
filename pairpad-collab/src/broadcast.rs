//! Fan-out of encoded messages from a room's hub to its connections.
//!
//! One tokio broadcast channel per room. Every connection holds a
//! [`Subscriber`] whose buffer is bounded by the channel capacity: a
//! connection that falls more than `capacity` messages behind sees
//! [`RecvError::Lagged`] and is expected to disconnect rather than slow
//! down the hub, whose sends never block.
//!
//! Messages carry their origin connection so a subscriber never receives
//! its own operations back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// A pre-encoded message plus the connection it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// `None` for hub-originated messages, delivered to everyone
    pub origin: Option<Uuid>,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("subscriber lagged behind by {0} messages")]
    Lagged(u64),
    #[error("broadcast group closed")]
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub lagged_receivers: u64,
    pub receivers: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    lagged_receivers: AtomicU64,
}

/// Broadcast group for one room.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` bounds each subscriber's unconsumed queue.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self, connection_id: Uuid) -> Subscriber {
        Subscriber {
            connection_id,
            rx: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Encode once and fan out. Returns the number of live receivers.
    pub fn broadcast(&self, origin: Option<Uuid>, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(origin, Arc::new(msg.encode()?)))
    }

    pub fn broadcast_raw(&self, origin: Option<Uuid>, bytes: Arc<Vec<u8>>) -> usize {
        // No receivers is not an error: the room may be momentarily empty.
        let count = self.sender.send(Envelope { origin, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            lagged_receivers: self.stats.lagged_receivers.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

/// One connection's view of the room broadcast.
#[derive(Debug)]
pub struct Subscriber {
    connection_id: Uuid,
    rx: broadcast::Receiver<Envelope>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscriber {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Next message not sent by this connection.
    pub async fn recv(&mut self) -> Result<Arc<Vec<u8>>, RecvError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == Some(self.connection_id) => continue,
                Ok(envelope) => return Ok(envelope.bytes),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.lagged_receivers.fetch_add(1, Ordering::Relaxed);
                    return Err(RecvError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }

    /// Non-blocking variant, `Ok(None)` when nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<Arc<Vec<u8>>>, RecvError> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.origin == Some(self.connection_id) => continue,
                Ok(envelope) => return Ok(Some(envelope.bytes)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.stats.lagged_receivers.fetch_add(1, Ordering::Relaxed);
                    return Err(RecvError::Lagged(n));
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(origin: Uuid, clock: u64) -> SyncMessage {
        SyncMessage::update(origin, Uuid::nil(), clock, vec![clock as u8])
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();

        let mut rx_alice = group.subscribe(alice);
        let mut rx_bob = group.subscribe(bob);
        let mut rx_carol = group.subscribe(carol);

        let count = group.broadcast(Some(alice), &update(alice, 1)).unwrap();
        assert_eq!(count, 3);

        let got_bob = SyncMessage::decode(&rx_bob.recv().await.unwrap()).unwrap();
        let got_carol = SyncMessage::decode(&rx_carol.recv().await.unwrap()).unwrap();
        assert_eq!(got_bob.connection_id, alice);
        assert_eq!(got_carol.clock, 1);
        assert_eq!(rx_alice.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_hub_messages_reach_everyone() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();
        let mut rx = group.subscribe(conn);

        group.broadcast(None, &SyncMessage::awareness_remove(conn, Uuid::nil())).unwrap();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_fifo_per_origin() {
        let group = BroadcastGroup::new(64);
        let sender = Uuid::new_v4();
        let mut rx = group.subscribe(Uuid::new_v4());

        for clock in 0..20 {
            group.broadcast(Some(sender), &update(sender, clock)).unwrap();
        }
        for clock in 0..20 {
            let msg = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(msg.clock, clock);
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let group = BroadcastGroup::new(4);
        let sender = Uuid::new_v4();
        let mut slow = group.subscribe(Uuid::new_v4());

        for clock in 0..10 {
            group.broadcast(Some(sender), &update(sender, clock)).unwrap();
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(_))));
        assert_eq!(group.stats().lagged_receivers, 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(8);
        assert_eq!(group.broadcast_raw(None, Arc::new(vec![1, 2, 3])), 0);
        assert_eq!(group.stats().messages_sent, 1);
        assert_eq!(group.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscriber_releases_receiver() {
        let group = BroadcastGroup::new(8);
        let rx = group.subscribe(Uuid::new_v4());
        assert_eq!(group.receiver_count(), 1);
        drop(rx);
        assert_eq!(group.receiver_count(), 0);
        assert_eq!(group.capacity(), 8);
    }
}
