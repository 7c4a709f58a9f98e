//! Single entry point the host uses to build connectors.

use std::sync::Arc;

use axum::Router;

use crate::config::validation::{validate_listener, validate_pool, validate_sender};
use crate::config::{ListenerConfig, SenderConfig, SocketTunables, TransportProperties};
use crate::error::TransportError;
use crate::listener::threads;
use crate::listener::{ConnectorBootstrap, ServerConnector};
use crate::pipeline::TransportInitializer;
use crate::sender::{
    ConnectionManager, ConnectionManagerCell, HttpClientConnector, WebSocketClientConnector,
    WsSenderProperties,
};

/// Builds server connectors dispatching into `dispatcher`, and client connectors
/// sharing one connection pool.
pub struct HttpWsConnectorFactory {
    dispatcher: Router,
    initializers: Vec<Arc<dyn TransportInitializer>>,
    connection_manager: ConnectionManagerCell,
}

impl HttpWsConnectorFactory {
    pub fn new(dispatcher: Router) -> Self {
        Self {
            dispatcher,
            initializers: Vec::new(),
            connection_manager: ConnectionManagerCell::new(),
        }
    }

    /// Register an initializer installed on every server connector created afterwards.
    pub fn with_initializer(mut self, initializer: Arc<dyn TransportInitializer>) -> Self {
        self.initializers.push(initializer);
        self
    }

    /// Configure a fresh bootstrap from `listener` and return its unbound connector.
    ///
    /// Thread groups default to one acceptor and two worker threads per CPU
    /// unless the listener overrides them.
    pub fn create_server_connector(
        &self,
        tunables: &SocketTunables,
        listener: &ListenerConfig,
    ) -> Result<ServerConnector, TransportError> {
        validate_listener(listener)?;

        let bootstrap = ConnectorBootstrap::new();
        bootstrap.configure_sockets(tunables.clone());
        bootstrap.configure_security(listener.tls.clone());
        bootstrap.configure_idle_timeout(listener.idle_timeout());
        bootstrap.configure_tracing(listener.trace_log_enabled);
        bootstrap.configure_chunking(listener.chunking_disabled);
        bootstrap.configure_parameters(listener.parameter_map());
        bootstrap.configure_dispatcher(self.dispatcher.clone());
        for initializer in &self.initializers {
            bootstrap.add_transport_initializer(initializer.clone());
        }

        let (acceptor_default, worker_default) = threads::default_sizes();
        let acceptor = listener.acceptor_threads.unwrap_or(acceptor_default);
        let worker = listener.worker_threads.unwrap_or(worker_default);
        bootstrap.configure_concurrency(acceptor, worker)?;

        tracing::debug!(
            connector_id = %listener.connector_id(),
            tls = listener.tls.is_some(),
            idle_timeout_ms = listener.idle_timeout_ms,
            acceptor_threads = acceptor,
            worker_threads = worker,
            "Server connector created"
        );
        Ok(bootstrap.get_server_connector(&listener.host, listener.port))
    }

    /// Client connector on the shared pool. The first call initializes the pool
    /// from `properties`; later calls reuse it as configured.
    pub fn create_http_client_connector(
        &self,
        properties: &TransportProperties,
        sender: &SenderConfig,
    ) -> Result<HttpClientConnector, TransportError> {
        validate_pool(&properties.pool)?;
        validate_sender(sender)?;
        let manager = self.connection_manager.init(properties);
        HttpClientConnector::new(manager, sender.clone())
    }

    pub fn create_ws_client_connector(
        &self,
        properties: WsSenderProperties,
    ) -> Result<WebSocketClientConnector, TransportError> {
        WebSocketClientConnector::new(properties)
    }

    pub fn connection_manager(&self) -> Result<Arc<ConnectionManager>, TransportError> {
        self.connection_manager.get()
    }

    /// Close pooled idle connections, if a pool was ever created.
    pub fn shutdown(&self) {
        if let Ok(manager) = self.connection_manager.get() {
            manager.shutdown();
        }
    }
}

impl std::fmt::Debug for HttpWsConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpWsConnectorFactory")
            .field("initializers", &self.initializers.len())
            .field("pool_initialized", &self.connection_manager.is_initialized())
            .finish()
    }
}
