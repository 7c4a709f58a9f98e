//! Keyed pool of reusable outbound connections.
//!
//! # Responsibilities
//! - Hand out an idle connection for an endpoint, or open a new one
//! - Bound in-use connections per endpoint with a semaphore
//! - Return healthy connections on release, close broken ones
//! - Evict connections idle longer than the configured threshold
//!
//! # Design Decisions
//! - One independently locked idle stack per endpoint (LIFO reuse)
//! - A caller over the cap waits up to `max-wait-ms`, then gets `PoolExhausted`
//! - Permits are owned by [`Pooled`], so a failed connect leaves no in-use entry

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use http::Uri;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::TransportError;
use crate::observability::metrics;

/// A connection the pool can hold while idle.
pub trait Poolable: Send + 'static {
    /// Whether the underlying socket is still usable.
    fn is_open(&self) -> bool;

    fn close(self)
    where
        Self: Sized,
    {
    }
}

/// Identity of a remote endpoint: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Key for an absolute URI, filling in the scheme's default port.
    pub fn from_uri(uri: &Uri) -> Result<Self, TransportError> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no scheme", uri)))?;
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{} has no host", uri)))?;
        let port = match uri.port_u16() {
            Some(port) => port,
            None => default_port(scheme)
                .ok_or_else(|| TransportError::InvalidUrl(format!("unsupported scheme in {}", uri)))?,
        };
        Ok(Self::new(scheme, host.trim_start_matches('[').trim_end_matches(']'), port))
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }
}

pub(crate) fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

struct IdleEntry<T> {
    conn: T,
    idle_since: Instant,
}

/// Per-endpoint state. Locks are never shared across endpoints.
struct Endpoint<T> {
    key: EndpointKey,
    label: String,
    idle: Mutex<VecDeque<IdleEntry<T>>>,
    permits: Arc<Semaphore>,
}

impl<T: Poolable> Endpoint<T> {
    fn new(key: EndpointKey, max_active: usize) -> Self {
        Self {
            label: key.to_string(),
            key,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(max_active)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleEntry<T>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the most recently used healthy connection, discarding stale ones on the way.
    fn take_idle(&self, max_idle: Duration) -> Option<T> {
        let mut discarded = Vec::new();
        let found = {
            let mut idle = self.lock();
            let mut found = None;
            while let Some(entry) = idle.pop_back() {
                if !entry.conn.is_open() {
                    discarded.push((entry.conn, "closed"));
                } else if entry.idle_since.elapsed() >= max_idle {
                    discarded.push((entry.conn, "expired"));
                } else {
                    found = Some(entry.conn);
                    break;
                }
            }
            metrics::record_pool_idle(&self.label, idle.len());
            found
        };
        for (conn, reason) in discarded {
            metrics::record_pool_discard(&self.label, reason);
            conn.close();
        }
        found
    }

    fn put_idle(&self, conn: T) {
        let mut idle = self.lock();
        idle.push_back(IdleEntry {
            conn,
            idle_since: Instant::now(),
        });
        metrics::record_pool_idle(&self.label, idle.len());
    }

    fn evict(&self, max_idle: Duration) -> usize {
        let evicted: Vec<T> = {
            let mut idle = self.lock();
            let (keep, evict): (VecDeque<_>, VecDeque<_>) = idle
                .drain(..)
                .partition(|e| e.conn.is_open() && e.idle_since.elapsed() < max_idle);
            *idle = keep;
            metrics::record_pool_idle(&self.label, idle.len());
            evict.into_iter().map(|e| e.conn).collect()
        };
        let count = evicted.len();
        for conn in evicted {
            metrics::record_pool_discard(&self.label, "evicted");
            conn.close();
        }
        count
    }
}

/// Pool of `T` connections partitioned by [`EndpointKey`].
pub struct ConnectionPool<T: Poolable> {
    endpoints: DashMap<EndpointKey, Arc<Endpoint<T>>>,
    config: PoolConfig,
}

impl<T: Poolable> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoints", &self.endpoints.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Poolable> ConnectionPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn endpoint(&self, key: &EndpointKey) -> Arc<Endpoint<T>> {
        if let Some(endpoint) = self.endpoints.get(key) {
            return endpoint.clone();
        }
        self.endpoints
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Endpoint::new(key.clone(), self.config.max_active_per_endpoint)))
            .clone()
    }

    async fn permit(&self, endpoint: &Endpoint<T>) -> Result<OwnedSemaphorePermit, TransportError> {
        let exhausted = || TransportError::PoolExhausted {
            endpoint: endpoint.label.clone(),
        };
        let semaphore = endpoint.permits.clone();
        let max_wait = self.config.max_wait();
        if max_wait.is_zero() {
            return semaphore.try_acquire_owned().map_err(|_| exhausted());
        }
        match tokio::time::timeout(max_wait, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => Err(exhausted()),
        }
    }

    /// Take an idle connection for `key`, or open one with `connect`.
    ///
    /// `connect` runs only when no healthy idle connection exists. If it fails,
    /// the slot is given back and the error is returned unchanged.
    pub async fn acquire<F, Fut>(&self, key: &EndpointKey, connect: F) -> Result<Pooled<T>, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let endpoint = self.endpoint(key);
        let permit = self.permit(&endpoint).await?;

        if let Some(conn) = endpoint.take_idle(self.config.idle_timeout()) {
            metrics::record_pool_acquire(&endpoint.label, true);
            tracing::trace!(endpoint = %endpoint.label, "Reusing pooled connection");
            return Ok(Pooled::new(conn, endpoint, permit, true));
        }

        let conn = connect().await?;
        metrics::record_pool_acquire(&endpoint.label, false);
        tracing::debug!(endpoint = %endpoint.label, "Opened pooled connection");
        Ok(Pooled::new(conn, endpoint, permit, false))
    }

    /// Close idle connections that are closed or older than the idle threshold.
    ///
    /// Endpoints left with nothing idle, loaned or waiting are dropped afterwards.
    pub fn evict_idle(&self) -> usize {
        let max_idle = self.config.idle_timeout();
        let evicted: usize = self.snapshot().iter().map(|e| e.evict(max_idle)).sum();
        let pruned = self.prune_unused();
        if evicted > 0 || pruned > 0 {
            tracing::debug!(evicted, pruned, "Evicted idle pooled connections");
        }
        evicted
    }

    fn snapshot(&self) -> Vec<Arc<Endpoint<T>>> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove endpoints referenced only by the map and holding no idle connection.
    ///
    /// Loans and queued acquires keep an `Arc` to their endpoint, and `retain`
    /// holds the shard lock that `endpoint()` needs to hand out a new one.
    fn prune_unused(&self) -> usize {
        let mut pruned = 0;
        self.endpoints.retain(|_, endpoint| {
            let keep = Arc::strong_count(endpoint) > 1 || !endpoint.lock().is_empty();
            if !keep {
                pruned += 1;
            }
            keep
        });
        pruned
    }

    /// Number of endpoints currently tracked.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn idle_count(&self, key: &EndpointKey) -> usize {
        self.endpoints.get(key).map(|e| e.lock().len()).unwrap_or(0)
    }

    /// Connections currently handed out for `key`.
    pub fn active_count(&self, key: &EndpointKey) -> usize {
        self.endpoints
            .get(key)
            .map(|e| self.config.max_active_per_endpoint - e.permits.available_permits())
            .unwrap_or(0)
    }

    pub fn total_idle(&self) -> usize {
        self.endpoints.iter().map(|e| e.lock().len()).sum()
    }

    /// Close every idle connection regardless of age.
    pub fn clear(&self) -> usize {
        let closed = self.snapshot().iter().map(|e| e.evict(Duration::ZERO)).sum();
        self.prune_unused();
        closed
    }
}

/// Run [`ConnectionPool::evict_idle`] every `interval` until the pool is dropped
/// or `shutdown` fires.
pub fn spawn_evictor<T: Poolable>(
    pool: &Arc<ConnectionPool<T>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let pool: Weak<ConnectionPool<T>> = Arc::downgrade(pool);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => match pool.upgrade() {
                    Some(pool) => {
                        pool.evict_idle();
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Pool evictor stopped");
    })
}

/// A connection on loan from the pool.
///
/// Call [`release`](Pooled::release) after a successful exchange. Dropping it
/// instead drops the connection and frees the slot.
pub struct Pooled<T: Poolable> {
    conn: T,
    endpoint: Arc<Endpoint<T>>,
    _permit: OwnedSemaphorePermit,
    reused: bool,
    broken: bool,
}

impl<T: Poolable> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("key", &self.endpoint.key)
            .field("reused", &self.reused)
            .field("broken", &self.broken)
            .finish()
    }
}

impl<T: Poolable> Pooled<T> {
    fn new(conn: T, endpoint: Arc<Endpoint<T>>, permit: OwnedSemaphorePermit, reused: bool) -> Self {
        Self {
            conn,
            endpoint,
            _permit: permit,
            reused,
            broken: false,
        }
    }

    pub fn key(&self) -> &EndpointKey {
        &self.endpoint.key
    }

    /// Whether this connection came from the idle set.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Record an I/O error; the connection will be closed instead of returned.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Give the connection back. Broken or closed connections are closed instead.
    pub fn release(self) {
        let Pooled {
            conn,
            endpoint,
            _permit,
            broken,
            ..
        } = self;
        if broken || !conn.is_open() {
            metrics::record_pool_discard(&endpoint.label, if broken { "error" } else { "closed" });
            conn.close();
        } else {
            endpoint.put_idle(conn);
        }
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}
