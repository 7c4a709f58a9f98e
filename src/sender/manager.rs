//! Connection pool manager shared by every HTTP client connector of a factory.
//!
//! The manager is an explicit instance rather than process-global state. A
//! [`ConnectionManagerCell`] keeps the "first `init` wins" guard: later calls
//! return the instance that already exists and never reconfigure it.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use axum::body::Body;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::{SocketTunables, TransportProperties};
use crate::error::TransportError;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionId;
use crate::net::io::BoxedIo;
use crate::sender::pool::{spawn_evictor, ConnectionPool, Poolable};

/// An HTTP/1.1 client connection driven by a background task.
pub struct HttpConnection {
    id: ConnectionId,
    sender: http1::SendRequest<Body>,
    task: JoinHandle<()>,
}

impl HttpConnection {
    /// Run the HTTP/1.1 handshake over an already wrapped stream.
    pub async fn handshake(io: BoxedIo, id: ConnectionId) -> Result<Self, TransportError> {
        let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
        let task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(connection_id = %id, error = %e, "Client connection ended with error");
            }
        });
        Ok(Self { id, sender, task })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&mut self, request: Request<Body>) -> Result<Response<Incoming>, hyper::Error> {
        self.sender.ready().await?;
        self.sender.send_request(request).await
    }
}

impl Poolable for HttpConnection {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn close(self) {
        tracing::trace!(connection_id = %self.id, "Closing pooled connection");
        self.task.abort();
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Pooled outbound HTTP connections plus the socket options used to open them.
#[derive(Debug)]
pub struct ConnectionManager {
    pool: Arc<ConnectionPool<HttpConnection>>,
    client_socket: SocketTunables,
    shutdown: Shutdown,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Build a manager. The idle evictor starts only when called inside a tokio runtime.
    pub fn new(properties: &TransportProperties) -> Self {
        let pool = Arc::new(ConnectionPool::new(properties.pool.clone()));
        let shutdown = Shutdown::new();

        let evictor = match (properties.pool.eviction_interval(), Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(spawn_evictor(&pool, interval, shutdown.subscribe())),
            (Some(_), Err(_)) => {
                tracing::debug!("No runtime available, idle eviction runs on demand only");
                None
            }
            (None, _) => None,
        };

        tracing::info!(
            max_active_per_endpoint = properties.pool.max_active_per_endpoint,
            max_wait_ms = properties.pool.max_wait_ms,
            pool_idle_timeout_ms = properties.pool.pool_idle_timeout_ms,
            "Connection manager initialized"
        );

        Self {
            pool,
            client_socket: properties.client_socket.clone(),
            shutdown,
            evictor: Mutex::new(evictor),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<HttpConnection>> {
        &self.pool
    }

    pub fn socket_tunables(&self) -> &SocketTunables {
        &self.client_socket
    }

    /// Stop the evictor and close every idle connection. Loaned connections are
    /// closed when their holders drop or release them.
    pub fn shutdown(&self) -> usize {
        self.shutdown.trigger();
        if let Some(evictor) = self.evictor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            evictor.abort();
        }
        let closed = self.pool.clear();
        tracing::info!(closed, "Connection manager shut down");
        closed
    }
}

/// Init-once holder for a [`ConnectionManager`].
#[derive(Debug, Default)]
pub struct ConnectionManagerCell {
    cell: OnceLock<Arc<ConnectionManager>>,
}

impl ConnectionManagerCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize on first call; later calls return the existing manager unchanged.
    pub fn init(&self, properties: &TransportProperties) -> Arc<ConnectionManager> {
        let mut created = false;
        let manager = self.cell.get_or_init(|| {
            created = true;
            Arc::new(ConnectionManager::new(properties))
        });
        if !created && manager.pool().config() != &properties.pool {
            tracing::debug!("Connection manager already initialized, ignoring new pool properties");
        }
        manager.clone()
    }

    pub fn get(&self) -> Result<Arc<ConnectionManager>, TransportError> {
        self.cell.get().cloned().ok_or(TransportError::PoolUninitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}
