use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

/// Caps concurrent connections in total and per client IP.
#[derive(Debug)]
pub struct ConnectionTracker {
    // Open connections per IP
    connections_per_ip: Mutex<HashMap<IpAddr, usize>>,

    // Open connections overall; only written while the map lock is held
    total_connections: AtomicUsize,

    max_per_ip: usize,
    max_total: usize,
}

impl ConnectionTracker {
    pub fn new(max_per_ip: usize, max_total: usize) -> Self {
        ConnectionTracker {
            connections_per_ip: Mutex::new(HashMap::new()),
            total_connections: AtomicUsize::new(0),
            max_per_ip,
            max_total,
        }
    }

    /// Claim a slot for a connection from `ip`.
    ///
    /// Returns `None` when either limit is reached. The slot is released when
    /// the returned guard is dropped.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnectionGuard> {
        let mut connections = self
            .connections_per_ip
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let total = self.total_connections.load(Ordering::SeqCst);
        if total >= self.max_total {
            warn!(%ip, total, max = self.max_total, "connection rejected: total limit reached");
            return None;
        }

        let open = connections.get(&ip).copied().unwrap_or(0);
        if open >= self.max_per_ip {
            warn!(%ip, open, max = self.max_per_ip, "connection rejected: per-IP limit reached");
            return None;
        }

        let ip_count = connections.entry(ip).or_insert(0);
        *ip_count += 1;
        let total = self.total_connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%ip, ip_connections = *ip_count, total, "connection accepted");

        Some(ConnectionGuard {
            tracker: Arc::clone(self),
            ip,
        })
    }

    /// Connections currently open.
    pub fn active(&self) -> usize {
        self.total_connections.load(Ordering::SeqCst)
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    fn release(&self, ip: IpAddr) {
        let mut connections = self
            .connections_per_ip
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = connections.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                connections.remove(&ip);
            }
            let total = self.total_connections.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!(%ip, total, "connection released");
        }
    }
}

/// Holds one connection slot; dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    ip: IpAddr,
}

impl ConnectionGuard {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.ip);
    }
}
