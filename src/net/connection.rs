//! Identity and bookkeeping for accepted connections.
//!
//! Every accepted socket gets a [`ConnectionGuard`] from its connector's
//! [`ConnectionTracker`]. The guard travels into the worker task, so the live
//! count drops when the task ends, including on panic or runtime shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::observability::metrics;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-wide connection number, shared by inbound and outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counts {
    live: AtomicU64,
    accepted: AtomicU64,
}

/// Live and lifetime connection counts of one server connector.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    connector_id: Arc<str>,
    counts: Arc<Counts>,
}

impl ConnectionTracker {
    pub fn new(connector_id: &str) -> Self {
        Self {
            connector_id: Arc::from(connector_id),
            counts: Arc::new(Counts::default()),
        }
    }

    pub fn track(&self, peer: SocketAddr) -> ConnectionGuard {
        self.counts.accepted.fetch_add(1, Ordering::Relaxed);
        let live = self.counts.live.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_connection_opened(&self.connector_id, live);
        ConnectionGuard {
            tracker: self.clone(),
            id: ConnectionId::new(),
            peer,
            opened: Instant::now(),
        }
    }

    /// Connections whose guard is still alive.
    pub fn active_count(&self) -> u64 {
        self.counts.live.load(Ordering::SeqCst)
    }

    pub fn accepted_count(&self) -> u64 {
        self.counts.accepted.load(Ordering::Relaxed)
    }
}

/// Held by the task serving one accepted connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
    peer: SocketAddr,
    opened: Instant,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let live = self.tracker.counts.live.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_connection_closed(&self.tracker.connector_id, live);
        tracing::trace!(
            connection_id = %self.id,
            connector_id = %self.tracker.connector_id,
            peer = %self.peer,
            duration_ms = self.opened.elapsed().as_millis() as u64,
            "Connection released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn ids_increase_and_display_with_prefix() {
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        assert!(second > first);
        assert!(first.to_string().starts_with("conn-"));
    }

    #[test]
    fn guards_drive_live_count_but_not_lifetime_total() {
        let tracker = ConnectionTracker::new("127.0.0.1-8280");

        let a = tracker.track(peer(40000));
        let b = tracker.track(peer(40001));
        assert_eq!(a.peer(), peer(40000));
        assert_eq!((tracker.active_count(), tracker.accepted_count()), (2, 2));

        drop(a);
        assert_eq!((tracker.active_count(), tracker.accepted_count()), (1, 2));

        let moved = tracker.clone();
        std::thread::spawn(move || drop(b)).join().unwrap();
        assert_eq!(moved.active_count(), 0);
        assert_eq!(tracker.accepted_count(), 2);
    }
}
