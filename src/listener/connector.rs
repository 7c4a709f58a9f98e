//! Server connector: one listener identified by `host:port`.
//!
//! # State Transitions
//! ```text
//! Created → Binding → Bound → Closing → Closed
//!              ↓
//!            Failed
//! ```
//!
//! A failed connector is terminal; retry with a new connector.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::listener::bootstrap::ConnectorBootstrap;
use crate::listener::future::ServerConnectorFuture;
use crate::net::connection::ConnectionTracker;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Created = 0,
    Binding = 1,
    Bound = 2,
    Closing = 3,
    Closed = 4,
    Failed = 5,
}

impl From<u8> for ConnectorState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnectorState::Binding,
            2 => ConnectorState::Bound,
            3 => ConnectorState::Closing,
            4 => ConnectorState::Closed,
            5 => ConnectorState::Failed,
            _ => ConnectorState::Created,
        }
    }
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Created => "created",
            ConnectorState::Binding => "binding",
            ConnectorState::Bound => "bound",
            ConnectorState::Closing => "closing",
            ConnectorState::Closed => "closed",
            ConnectorState::Failed => "failed",
        }
    }
}

/// Control side of a running accept loop.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    pub(crate) shutdown: oneshot::Sender<()>,
    /// Receives `true` once a bound listener is closed, `false` if the bind failed.
    pub(crate) closed: mpsc::Receiver<bool>,
}

/// State shared between a connector and its bind task.
#[derive(Debug)]
pub(crate) struct ConnectorShared {
    state: AtomicU8,
    handle: Mutex<Option<ListenerHandle>>,
    future: Mutex<Option<ServerConnectorFuture>>,
    local_addr: Mutex<Option<SocketAddr>>,
    pub(crate) tracker: ConnectionTracker,
}

impl ConnectorShared {
    fn new(id: &str) -> Self {
        Self {
            state: AtomicU8::new(ConnectorState::Created as u8),
            handle: Mutex::new(None),
            future: Mutex::new(None),
            local_addr: Mutex::new(None),
            tracker: ConnectionTracker::new(id),
        }
    }

    pub(crate) fn state(&self) -> ConnectorState {
        ConnectorState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically move `from → to`. Returns the observed state on failure.
    pub(crate) fn transition(&self, from: ConnectorState, to: ConnectorState) -> Result<(), ConnectorState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnectorState::from)
    }

    pub(crate) fn install(&self, handle: ListenerHandle, future: ServerConnectorFuture) {
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *self.future.lock().unwrap_or_else(PoisonError::into_inner) = Some(future);
    }

    pub(crate) fn take_handle(&self) -> Option<ListenerHandle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
    }
}

/// A listener produced by [`ConnectorBootstrap::get_server_connector`].
pub struct ServerConnector {
    id: String,
    host: String,
    port: u16,
    bootstrap: Arc<ConnectorBootstrap>,
    pub(crate) shared: Arc<ConnectorShared>,
}

impl ServerConnector {
    pub(crate) fn new(bootstrap: Arc<ConnectorBootstrap>, host: &str, port: u16) -> Self {
        let id = crate::config::schema::connector_id(host, port);
        Self {
            shared: Arc::new(ConnectorShared::new(&id)),
            id,
            host: host.to_string(),
            port,
            bootstrap,
        }
    }

    /// Begin binding. The returned handle resolves once the listener is bound or has failed.
    ///
    /// Fails with [`TransportError::AlreadyStarted`] unless the connector is still
    /// `Created`, and with [`TransportError::NotInitialized`] when the bootstrap has
    /// no thread groups. Bind failures are reported only through the handle.
    pub fn start(&self) -> Result<ServerConnectorFuture, TransportError> {
        self.bootstrap.bind(self)
    }

    /// Close the listening socket, blocking until it is closed.
    ///
    /// Returns `false` when nothing was bound. Accepted connections stay open.
    pub fn stop(&self) -> bool {
        self.bootstrap.unbind(self)
    }

    /// Identity string `host-port`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Configured port; `0` asks for an ephemeral port, see [`local_addr`](Self::local_addr).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectorState {
        self.shared.state()
    }

    /// Address actually bound, once the connector reached `Bound`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completion handle of the last `start()`.
    pub fn future(&self) -> Option<ServerConnectorFuture> {
        self.shared.future.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn active_connections(&self) -> u64 {
        self.shared.tracker.active_count()
    }

    /// Connections accepted since the connector was created.
    pub fn accepted_connections(&self) -> u64 {
        self.shared.tracker.accepted_count()
    }

    pub fn bootstrap(&self) -> &Arc<ConnectorBootstrap> {
        &self.bootstrap
    }
}

impl std::fmt::Debug for ServerConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnector")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnectorState::Created,
            ConnectorState::Binding,
            ConnectorState::Bound,
            ConnectorState::Closing,
            ConnectorState::Closed,
            ConnectorState::Failed,
        ] {
            assert_eq!(ConnectorState::from(state as u8), state);
        }
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let shared = ConnectorShared::new("h-1");
        assert!(shared.transition(ConnectorState::Created, ConnectorState::Binding).is_ok());
        assert_eq!(
            shared.transition(ConnectorState::Created, ConnectorState::Binding),
            Err(ConnectorState::Binding)
        );
        assert_eq!(shared.state(), ConnectorState::Binding);
    }

    #[test]
    fn connector_identity() {
        let bootstrap = ConnectorBootstrap::new();
        let connector = bootstrap.get_server_connector("localhost", 9443);
        assert_eq!(connector.id(), "localhost-9443");
        assert_eq!(connector.host(), "localhost");
        assert_eq!(connector.port(), 9443);
        assert_eq!(connector.state(), ConnectorState::Created);
        assert!(connector.local_addr().is_none());
        assert!(connector.future().is_none());
    }
}
