//! Host/operator pairing and message fan-out.
//!
//! One host connection per host id (later registrations replace earlier
//! ones); any number of operator connections may subscribe to the same host
//! id. The relay fans host traffic to every operator and funnels operator
//! traffic to the single host; single-operator admission is the host's call,
//! not the relay's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

/// Outbound queue depth per connection. Slow consumers drop, they do not
/// stall the sender.
pub const CONN_QUEUE: usize = 64;

struct HostSlot {
    conn: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
pub struct PairingRegistry {
    hosts: RwLock<HashMap<Uuid, HostSlot>>,
    operators: RwLock<HashMap<Uuid, HashMap<u64, mpsc::Sender<String>>>>,
    next_conn: AtomicU64,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Install a host connection. Idempotent for the same connection;
    /// a newer connection for the same host id replaces the older one.
    pub async fn register_host(&self, host_id: Uuid, conn: u64, tx: mpsc::Sender<String>) {
        let mut hosts = self.hosts.write().await;
        let replaced = hosts.insert(host_id, HostSlot { conn, tx });
        if let Some(old) = replaced
            && old.conn != conn
        {
            info!(%host_id, "Host connection replaced");
        } else {
            info!(%host_id, "Host registered");
        }
    }

    /// Remove a host connection, but only if it still owns the slot (a stale
    /// close must not evict a replacement).
    pub async fn unregister_host(&self, host_id: Uuid, conn: u64) {
        let mut hosts = self.hosts.write().await;
        if hosts.get(&host_id).is_some_and(|slot| slot.conn == conn) {
            hosts.remove(&host_id);
            info!(%host_id, "Host unregistered");
        }
    }

    pub async fn register_operator(&self, host_id: Uuid, conn: u64, tx: mpsc::Sender<String>) {
        let mut operators = self.operators.write().await;
        operators.entry(host_id).or_default().insert(conn, tx);
        info!(%host_id, conn, "Operator registered");
    }

    pub async fn unregister_operator(&self, host_id: Uuid, conn: u64) {
        let mut operators = self.operators.write().await;
        if let Some(set) = operators.get_mut(&host_id) {
            set.remove(&conn);
            if set.is_empty() {
                operators.remove(&host_id);
            }
        }
    }

    /// Operator → host. Dropped silently when no host is connected.
    pub async fn to_host(&self, host_id: Uuid, text: String) -> bool {
        let hosts = self.hosts.read().await;
        match hosts.get(&host_id) {
            Some(slot) => slot.tx.try_send(text).is_ok(),
            None => {
                debug!(%host_id, "No host for operator message, dropped");
                false
            }
        }
    }

    /// Host → all operators under the host id. Returns the delivery count.
    pub async fn to_operators(&self, host_id: Uuid, text: &str) -> usize {
        let operators = self.operators.read().await;
        let Some(set) = operators.get(&host_id) else {
            return 0;
        };
        set.values()
            .filter(|tx| tx.try_send(text.to_string()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(CONN_QUEUE)
    }

    #[tokio::test]
    async fn host_fan_out_reaches_every_operator() {
        let registry = PairingRegistry::new();
        let host = Uuid::new_v4();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.register_operator(host, registry.connection_id(), tx_a).await;
        registry.register_operator(host, registry.connection_id(), tx_b).await;

        let delivered = registry.to_operators(host, "frame").await;
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), "frame");
        assert_eq!(rx_b.recv().await.unwrap(), "frame");
    }

    #[tokio::test]
    async fn operator_messages_reach_only_matching_host() {
        let registry = PairingRegistry::new();
        let host_a = Uuid::new_v4();
        let host_b = Uuid::new_v4();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        registry.register_host(host_a, registry.connection_id(), tx_a).await;
        registry.register_host(host_b, registry.connection_id(), tx_b).await;

        assert!(registry.to_host(host_a, "auth".to_string()).await);
        assert_eq!(rx_a.recv().await.unwrap(), "auth");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_without_host_is_dropped_silently() {
        let registry = PairingRegistry::new();
        assert!(!registry.to_host(Uuid::new_v4(), "hello".to_string()).await);
        assert_eq!(registry.to_operators(Uuid::new_v4(), "frame").await, 0);
    }

    #[tokio::test]
    async fn newer_host_connection_replaces_older() {
        let registry = PairingRegistry::new();
        let host = Uuid::new_v4();
        let (tx_old, mut rx_old) = channel();
        let (tx_new, mut rx_new) = channel();
        let conn_old = registry.connection_id();
        let conn_new = registry.connection_id();
        registry.register_host(host, conn_old, tx_old).await;
        registry.register_host(host, conn_new, tx_new).await;

        registry.to_host(host, "msg".to_string()).await;
        assert!(rx_old.try_recv().is_err());
        assert_eq!(rx_new.recv().await.unwrap(), "msg");

        // The old connection's cleanup must not evict the replacement.
        registry.unregister_host(host, conn_old).await;
        assert!(registry.to_host(host, "again".to_string()).await);
    }

    #[tokio::test]
    async fn operator_unregister_removes_only_that_connection() {
        let registry = PairingRegistry::new();
        let host = Uuid::new_v4();
        let (tx_a, _rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let conn_a = registry.connection_id();
        let conn_b = registry.connection_id();
        registry.register_operator(host, conn_a, tx_a).await;
        registry.register_operator(host, conn_b, tx_b).await;

        registry.unregister_operator(host, conn_a).await;
        assert_eq!(registry.to_operators(host, "frame").await, 1);
        assert_eq!(rx_b.recv().await.unwrap(), "frame");
    }
}
