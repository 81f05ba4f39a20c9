//! Shared index of live client connections.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

/// Stable identifier for one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub struct ConnId(u64);

/// Tracks which connections are currently alive.
///
/// The registry is a non-owning index; each session's task owns its sockets
/// and removes its entry exactly once during teardown. Identifiers increase
/// monotonically and are never recycled.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<ConnId, SocketAddr>>>,
    next: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its identifier.
    pub fn insert(&self, peer: SocketAddr) -> ConnId {
        let id = ConnId(self.next.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, peer);
        id
    }

    /// Removes a connection; returns its peer address if it was present.
    pub fn remove(&self, id: ConnId) -> Option<SocketAddr> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of live connection ids.
    pub fn ids(&self) -> Vec<ConnId> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, SocketAddr>> {
        // lock() only fails if a holder panicked; the map stays usable
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_stable() {
        let registry = Registry::new();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let a = registry.insert(peer);
        let b = registry.insert(peer);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(a), Some(peer));
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.len(), 1);

        // removal does not disturb other entries
        assert_eq!(registry.ids(), vec![b]);
    }
}
