//! Concurrent peer table
//!
//! Maps a private IP to the live [`RemotePeer`] that owns it. Shared by the
//! listener, the connector, the router and every peer's teardown path.
//!
//! The lock is a plain `std::sync::RwLock`: no critical section awaits, and
//! peers replaced or removed are closed after the lock is released.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::peer::RemotePeer;

type PeerMap = HashMap<Ipv4Addr, Arc<RemotePeer>>;

/// Shared private IP -> peer mapping
#[derive(Clone, Default)]
pub struct PeerTable {
    peers: Arc<RwLock<PeerMap>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer under its private IP.
    ///
    /// A peer already registered for that IP is replaced and closed.
    pub fn add(&self, peer: Arc<RemotePeer>) -> Option<Arc<RemotePeer>> {
        let ip = peer.private_ip();
        let replaced = self.write().insert(ip, peer.clone());

        match replaced {
            Some(old) if !Arc::ptr_eq(&old, &peer) => {
                tracing::info!("Replacing tunnel to {}", ip);
                old.close();
                Some(old)
            }
            _ => {
                tracing::debug!("Added peer {}", ip);
                None
            }
        }
    }

    /// Remove and close whatever peer owns `ip`. Absent IPs are a no-op.
    pub fn remove(&self, ip: Ipv4Addr) -> Option<Arc<RemotePeer>> {
        let removed = self.write().remove(&ip)?;
        removed.close();
        tracing::debug!("Removed peer {}", ip);
        Some(removed)
    }

    /// Remove `peer` only if it is still the entry for its IP.
    ///
    /// A tunnel that was already replaced must not evict its successor.
    pub fn remove_peer(&self, peer: &Arc<RemotePeer>) -> bool {
        let ip = peer.private_ip();
        let mut peers = self.write();
        match peers.get(&ip) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(&ip);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<Arc<RemotePeer>> {
        self.read().get(&ip).cloned()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.read().contains_key(&ip)
    }

    /// Visit every peer registered at call time.
    ///
    /// `f` runs on a snapshot, so it may call back into the table.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<RemotePeer>),
    {
        for peer in self.snapshot() {
            f(&peer);
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<RemotePeer>> {
        self.read().values().cloned().collect()
    }

    pub fn private_ips(&self) -> Vec<Ipv4Addr> {
        let mut ips: Vec<_> = self.read().keys().copied().collect();
        ips.sort();
        ips
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove and close every peer
    pub fn close_all(&self) {
        let drained: Vec<_> = self.write().drain().map(|(_, peer)| peer).collect();
        for peer in drained {
            peer.close();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PeerMap> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerMap> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTable")
            .field("peers", &self.private_ips())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use crate::device::MemoryDevice;
    use crate::protocol::handshake::Role;
    use crate::protocol::session::Session;

    fn peer(ip: Ipv4Addr) -> (Arc<RemotePeer>, DuplexStream) {
        let (local, remote) = duplex(1024);
        let session = Session::new(Role::Responder, vec![7u8; 32], ip);
        (RemotePeer::new(Box::new(local), session, &[9u8; 32]), remote)
    }

    #[tokio::test]
    async fn test_add_replaces_and_closes_previous() {
        let table = PeerTable::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        let (first, mut first_remote) = peer(ip);
        let (second, _second_remote) = peer(ip);

        assert!(table.add(first.clone()).is_none());
        let replaced = table.add(second.clone()).unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(table.len(), 1);
        assert!(Arc::ptr_eq(&table.lookup(ip).unwrap(), &second));

        // Closed exactly once: a second close is a no-op
        assert!(!first.close());
        let mut buf = Vec::new();
        first_remote.read_to_end(&mut buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let table = PeerTable::new();
        let ip = Ipv4Addr::new(10, 0, 0, 3);
        let (p, _remote) = peer(ip);
        table.add(p.clone());

        assert!(table.remove(ip).is_some());
        assert!(p.is_closed());
        assert!(table.remove(ip).is_none());
        assert!(table.lookup(ip).is_none());
    }

    #[tokio::test]
    async fn test_remove_peer_spares_successor() {
        let table = PeerTable::new();
        let ip = Ipv4Addr::new(10, 0, 0, 4);
        let (old, _r1) = peer(ip);
        let (new, _r2) = peer(ip);

        table.add(old.clone());
        table.add(new.clone());

        assert!(!table.remove_peer(&old));
        assert!(Arc::ptr_eq(&table.lookup(ip).unwrap(), &new));
        assert!(table.remove_peer(&new));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_routes_by_ip() {
        let table = PeerTable::new();
        let mut remotes = Vec::new();
        for last in 2..=5u8 {
            let (p, r) = peer(Ipv4Addr::new(10, 0, 0, last));
            table.add(p);
            remotes.push(r);
        }

        for last in 2..=5u8 {
            let ip = Ipv4Addr::new(10, 0, 0, last);
            assert_eq!(table.lookup(ip).unwrap().private_ip(), ip);
        }
        assert!(table.lookup(Ipv4Addr::new(10, 0, 0, 9)).is_none());
        assert_eq!(
            table.private_ips(),
            (2..=5u8).map(|l| Ipv4Addr::new(10, 0, 0, l)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_for_each_may_mutate_table() {
        let table = PeerTable::new();
        let (a, _ra) = peer(Ipv4Addr::new(10, 0, 0, 2));
        let (b, _rb) = peer(Ipv4Addr::new(10, 0, 0, 3));
        table.add(a);
        table.add(b);

        let mut visited = 0;
        table.for_each(|p| {
            visited += 1;
            table.remove(p.private_ip());
        });
        assert_eq!(visited, 2);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove() {
        let table = PeerTable::new();
        let mut tasks = Vec::new();

        for i in 0..32u8 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                let ip = Ipv4Addr::new(10, 0, 1, i % 8);
                let (p, _remote) = peer(ip);
                table.add(p.clone());
                tokio::task::yield_now().await;
                table.remove(ip);
                table.remove(ip);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_races_forward_teardown() {
        let table = PeerTable::new();
        let ip = Ipv4Addr::new(10, 0, 2, 1);

        for _ in 0..20 {
            let (p, remote) = peer(ip);
            table.add(p.clone());
            let (device, _inject, _delivered) = MemoryDevice::new(1);
            let forwarding = tokio::spawn(p.clone().forward(table.clone(), Arc::new(device)));

            let remover = {
                let table = table.clone();
                tokio::spawn(async move {
                    table.remove(ip);
                })
            };
            drop(remote);

            remover.await.unwrap();
            tokio::time::timeout(std::time::Duration::from_secs(2), forwarding)
                .await
                .unwrap()
                .unwrap();

            assert!(p.is_closed());
            assert!(table.lookup(ip).is_none());
            assert!(table.remove(ip).is_none());
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let table = PeerTable::new();
        let (a, _ra) = peer(Ipv4Addr::new(10, 0, 0, 2));
        let (b, _rb) = peer(Ipv4Addr::new(10, 0, 0, 3));
        table.add(a.clone());
        table.add(b.clone());

        table.close_all();
        assert!(table.is_empty());
        assert!(a.is_closed() && b.is_closed());
    }
}
