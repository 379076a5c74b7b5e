//! Port pool management for wssocks

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

/// PortPool manages the set of SOCKS5 ports available for reverse tokens
///
/// Clones share the same underlying pool.
pub struct PortPool {
    ports: Arc<BTreeSet<u16>>,
    used: Arc<Mutex<HashSet<u16>>>,
}

impl PortPool {
    /// Create a new PortPool with the specified inclusive range
    pub fn new_from_range(min: u16, max: u16) -> Self {
        Self::new_from_ports(min..=max)
    }

    /// Create a new PortPool from an explicit set of ports
    pub fn new_from_ports<I: IntoIterator<Item = u16>>(ports: I) -> Self {
        PortPool {
            ports: Arc::new(ports.into_iter().collect()),
            used: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a new PortPool with the default range (1024-10240)
    pub fn new_default() -> Self {
        Self::new_from_range(1024, 10240)
    }

    /// Get a port from the pool
    ///
    /// A preferred port is honored only when it belongs to the pool and is
    /// currently free; otherwise the allocation fails rather than falling
    /// back to another port. Without a preference, any free port is
    /// returned.
    pub fn get(&self, preferred: Option<u16>) -> Option<u16> {
        let mut used = self.used.lock().unwrap();

        if let Some(port) = preferred {
            if self.ports.contains(&port) && !used.contains(&port) {
                used.insert(port);
                return Some(port);
            }
            return None;
        }

        let port = self.ports.iter().copied().find(|p| !used.contains(p))?;
        used.insert(port);
        Some(port)
    }

    /// Return a port to the pool; returning an unknown or already-free port
    /// is a no-op
    pub fn put(&self, port: u16) {
        if self.ports.contains(&port) {
            self.used.lock().unwrap().remove(&port);
        }
    }

    /// Check if a port is currently allocated
    pub fn is_used(&self, port: u16) -> bool {
        self.used.lock().unwrap().contains(&port)
    }

    /// Get the number of allocated ports
    pub fn used_count(&self) -> usize {
        self.used.lock().unwrap().len()
    }

    /// Get the number of free ports
    pub fn available_count(&self) -> usize {
        self.ports.len() - self.used.lock().unwrap().len()
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new_default()
    }
}

impl Clone for PortPool {
    fn clone(&self) -> Self {
        PortPool {
            ports: self.ports.clone(),
            used: self.used.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_any_free_port() {
        let pool = PortPool::new_from_range(3000, 3002);
        assert_eq!(pool.get(None), Some(3000));
        assert_eq!(pool.get(None), Some(3001));
        assert_eq!(pool.get(None), Some(3002));
        assert_eq!(pool.get(None), None);
    }

    #[test]
    fn preferred_port_must_be_free() {
        let pool = PortPool::new_from_range(3000, 3010);
        assert_eq!(pool.get(Some(3005)), Some(3005));
        // taken now, no fallback to another port
        assert_eq!(pool.get(Some(3005)), None);
        // outside the configured set
        assert_eq!(pool.get(Some(9999)), None);
    }

    #[test]
    fn put_is_idempotent() {
        let pool = PortPool::new_from_range(3000, 3001);
        let port = pool.get(Some(3000)).unwrap();
        pool.put(port);
        pool.put(port);
        pool.put(12345);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.get(Some(3000)), Some(3000));
    }

    #[test]
    fn explicit_port_set() {
        let pool = PortPool::new_from_ports([4010, 4020]);
        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.get(None), Some(4010));
        assert_eq!(pool.get(Some(4015)), None);
        assert_eq!(pool.get(None), Some(4020));
    }

    #[test]
    fn clones_share_the_pool() {
        let pool = PortPool::new_from_range(3000, 3000);
        let clone = pool.clone();
        assert_eq!(pool.get(None), Some(3000));
        assert_eq!(clone.get(None), None);
        clone.put(3000);
        assert!(!pool.is_used(3000));
    }
}
