use std::collections::HashMap;

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::debug;

/// Frames queued for one connection before it is considered stuck.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Replaced,
    LoggedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    Offline,
    /// The receiver could not keep up and was dropped from the hub.
    Dropped,
}

#[derive(Debug)]
struct ClientHandle {
    conn_id: u64,
    outbound: mpsc::Sender<String>,
    evict: oneshot::Sender<EvictReason>,
}

impl ClientHandle {
    /// Eviction has its own channel, a full frame queue cannot hold it back.
    fn evict(self, reason: EvictReason) {
        self.evict.send(reason).ok();
    }
}

/// Receiving half of a connection: serialized JSON frames, and the reason the
/// hub let go of it. The eviction side resolves with an error when the hub
/// dropped the connection for being too slow.
#[derive(Debug)]
pub struct Registration {
    pub conn_id: u64,
    pub outbound: mpsc::Receiver<String>,
    pub evicted: oneshot::Receiver<EvictReason>,
}

/// Live chat connections, at most one per user.
#[derive(Debug, Default)]
pub struct Hub {
    clients: HashMap<i64, ClientHandle>,
    next_conn_id: u64,
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    pub fn register(&mut self, user_id: i64) -> Registration {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (evict_tx, evict_rx) = oneshot::channel();
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;

        let previous = self.clients.insert(
            user_id,
            ClientHandle {
                conn_id,
                outbound: tx,
                evict: evict_tx,
            },
        );
        if let Some(previous) = previous {
            debug!(
                user_id,
                old_conn_id = previous.conn_id,
                conn_id,
                "connection replaced"
            );
            previous.evict(EvictReason::Replaced);
        }
        debug!(user_id, conn_id, online = self.clients.len(), "client registered");

        Registration {
            conn_id,
            outbound: rx,
            evicted: evict_rx,
        }
    }

    /// Remove a connection unless it has already been replaced by a newer one.
    pub fn unregister(&mut self, user_id: i64, conn_id: u64) -> bool {
        match self.clients.get(&user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                self.clients.remove(&user_id);
                debug!(user_id, conn_id, online = self.clients.len(), "client unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn send_to(&mut self, user_id: i64, frame: String) -> Delivery {
        let Some(handle) = self.clients.get(&user_id) else {
            return Delivery::Offline;
        };

        match handle.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                // dropping the handle resolves the socket's eviction side with an error
                self.clients.remove(&user_id);
                debug!(user_id, "client removed due to blocked queue");
                Delivery::Dropped
            }
        }
    }

    pub fn disconnect(&mut self, user_id: i64, reason: EvictReason) -> bool {
        match self.clients.remove(&user_id) {
            Some(handle) => {
                handle.evict(reason);
                debug!(user_id, ?reason, "client disconnected");
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.clients.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_frames_arrive_in_order() {
        let mut hub = Hub::new();
        let mut reg = hub.register(1);

        assert_eq!(hub.send_to(1, "a".into()), Delivery::Queued);
        assert_eq!(hub.send_to(1, "b".into()), Delivery::Queued);

        assert_eq!(reg.outbound.recv().await.as_deref(), Some("a"));
        assert_eq!(reg.outbound.recv().await.as_deref(), Some("b"));
    }

    #[test]
    fn offline_user_is_reported() {
        let mut hub = Hub::new();
        assert_eq!(hub.send_to(7, "x".into()), Delivery::Offline);
        assert!(!hub.is_online(7));
    }

    #[tokio::test]
    async fn newer_connection_evicts_older() {
        let mut hub = Hub::new();
        let first = hub.register(1);
        let second = hub.register(1);

        assert_ne!(first.conn_id, second.conn_id);
        assert_eq!(hub.len(), 1);
        assert_eq!(first.evicted.await, Ok(EvictReason::Replaced));

        // the evicted connection must not unregister its replacement
        assert!(!hub.unregister(1, first.conn_id));
        assert!(hub.is_online(1));
        assert!(hub.unregister(1, second.conn_id));
        assert!(!hub.is_online(1));
    }

    #[tokio::test]
    async fn replacing_a_stuck_connection_still_evicts_it() {
        let mut hub = Hub::new();
        let mut first = hub.register(1);
        // a reader that stopped draining its queue
        for i in 0..OUTBOUND_CAPACITY {
            assert_eq!(hub.send_to(1, i.to_string()), Delivery::Queued);
        }

        let _second = hub.register(1);

        assert_eq!((&mut first.evicted).await, Ok(EvictReason::Replaced));
        assert_eq!(first.outbound.recv().await.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn full_queue_drops_receiver() {
        let mut hub = Hub::new();
        let reg = hub.register(1);

        for i in 0..OUTBOUND_CAPACITY {
            assert_eq!(hub.send_to(1, i.to_string()), Delivery::Queued);
        }
        assert_eq!(hub.send_to(1, "overflow".into()), Delivery::Dropped);
        assert!(!hub.is_online(1));
        assert_eq!(hub.send_to(1, "later".into()), Delivery::Offline);
        // no reason given, the socket treats this as being dropped
        assert!(reg.evicted.await.is_err());
    }

    #[test]
    fn closed_receiver_is_dropped() {
        let mut hub = Hub::new();
        let reg = hub.register(1);
        drop(reg);

        assert_eq!(hub.send_to(1, "x".into()), Delivery::Dropped);
        assert!(!hub.is_online(1));
    }

    #[tokio::test]
    async fn disconnect_sends_reason() {
        let mut hub = Hub::new();
        let mut reg = hub.register(3);

        assert!(hub.disconnect(3, EvictReason::LoggedOut));
        assert!(!hub.disconnect(3, EvictReason::LoggedOut));
        assert_eq!((&mut reg.evicted).await, Ok(EvictReason::LoggedOut));
        // sender gone with the handle
        assert!(reg.outbound.recv().await.is_none());
    }
}
