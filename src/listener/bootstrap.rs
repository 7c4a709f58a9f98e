//! Connector bootstrap: pipeline template, thread groups, bind and unbind.
//!
//! # Data Flow
//! ```text
//! configure_*()  → mutate pipeline template / socket tunables
//! bind()         → freeze template into a pipeline → spawn bind task on acceptor group
//!                    → bind socket → resolve completion handle
//!                    → accept loop → serve each connection on worker group
//! unbind()       → signal accept loop → block until the listener is closed
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::Router;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::{SocketTunables, TlsConfig};
use crate::error::{BindError, TransportError};
use crate::listener::connector::{ConnectorShared, ConnectorState, ListenerHandle, ServerConnector};
use crate::listener::future::{self, Completion, ServerConnectorFuture};
use crate::listener::threads::ThreadGroups;
use crate::net::socket;
use crate::observability::metrics;
use crate::pipeline::{PipelineInitializer, PipelineTemplate, ServerPipeline, TransportInitializer};

const THREAD_GROUP_NAME: &str = "transport";
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Owns the shared pipeline template and thread groups for one transport instance.
#[derive(Debug, Default)]
pub struct ConnectorBootstrap {
    tunables: ArcSwap<SocketTunables>,
    initializer: PipelineInitializer,
    thread_groups: OnceLock<ThreadGroups>,
}

impl ConnectorBootstrap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the options applied to listening and accepted sockets.
    pub fn configure_sockets(&self, tunables: SocketTunables) {
        self.tunables.store(Arc::new(tunables));
    }

    /// `Some` inserts a TLS stage, `None` serves plaintext.
    pub fn configure_security(&self, tls: Option<TlsConfig>) {
        self.initializer.update(|t| t.tls = tls.clone());
    }

    pub fn configure_idle_timeout(&self, timeout: Duration) {
        self.initializer.update(|t| t.idle_timeout = timeout);
    }

    pub fn configure_tracing(&self, enabled: bool) {
        self.initializer.update(|t| t.trace_log_enabled = enabled);
    }

    pub fn configure_chunking(&self, disabled: bool) {
        self.initializer.update(|t| t.chunking_disabled = disabled);
    }

    /// Flattened listener parameters handed to transport initializers.
    pub fn configure_parameters(&self, parameters: HashMap<String, String>) {
        self.initializer.update(|t| t.parameters = parameters.clone());
    }

    /// Application router that receives decoded requests.
    pub fn configure_dispatcher(&self, dispatcher: Router) {
        self.initializer.update(|t| t.dispatcher = dispatcher.clone());
    }

    /// Register an initializer; its `setup` runs now with the current parameters.
    pub fn add_transport_initializer(&self, initializer: Arc<dyn TransportInitializer>) {
        initializer.setup(&self.initializer.snapshot().parameters);
        self.initializer.update(|t| t.initializers.push(initializer.clone()));
    }

    /// Create the acceptor and worker thread groups. Allowed exactly once.
    pub fn configure_concurrency(&self, acceptor_threads: usize, worker_threads: usize) -> Result<(), TransportError> {
        if self.thread_groups.get().is_some() {
            return Err(TransportError::InvalidConfig(
                "thread groups are already configured".to_string(),
            ));
        }
        let groups = ThreadGroups::new(THREAD_GROUP_NAME, acceptor_threads, worker_threads)?;
        self.thread_groups.set(groups).map_err(|_| {
            TransportError::InvalidConfig("thread groups are already configured".to_string())
        })
    }

    pub fn thread_group_sizes(&self) -> Option<(usize, usize)> {
        self.thread_groups.get().map(ThreadGroups::sizes)
    }

    pub fn socket_tunables(&self) -> SocketTunables {
        SocketTunables::clone(&self.tunables.load())
    }

    /// Current template. Bound listeners keep the snapshot taken at bind time.
    pub fn template(&self) -> Arc<PipelineTemplate> {
        self.initializer.snapshot()
    }

    /// New, unbound connector for `host:port`. Opens no socket.
    pub fn get_server_connector(self: &Arc<Self>, host: &str, port: u16) -> ServerConnector {
        ServerConnector::new(self.clone(), host, port)
    }

    /// Start binding `connector` on the acceptor group.
    pub fn bind(&self, connector: &ServerConnector) -> Result<ServerConnectorFuture, TransportError> {
        let groups = self
            .thread_groups
            .get()
            .ok_or(TransportError::NotInitialized("connector bootstrap thread groups"))?;

        connector
            .shared
            .transition(ConnectorState::Created, ConnectorState::Binding)
            .map_err(|state| TransportError::AlreadyStarted {
                id: connector.id().to_string(),
                state: state.as_str(),
            })?;

        let (completion, handle) = future::completion();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = mpsc::sync_channel(1);
        connector.shared.install(
            ListenerHandle {
                shutdown: shutdown_tx,
                closed: closed_rx,
            },
            handle.clone(),
        );

        let task = BindTask {
            connector_id: connector.id().to_string(),
            host: connector.host().to_string(),
            port: connector.port(),
            tunables: self.socket_tunables(),
            shared: connector.shared.clone(),
            worker: groups.worker().clone(),
            completion,
            shutdown: shutdown_rx,
            closed: closed_tx,
        };
        let frozen = self.initializer.freeze(connector.id(), &task.tunables);
        groups.acceptor().spawn(task.run(frozen));

        Ok(handle)
    }

    /// Close the listening socket of `connector`, blocking until it is closed.
    ///
    /// Returns `false` without touching any socket when the connector is not
    /// binding or bound. A bind that fails while this call waits leaves the
    /// connector `Failed`.
    pub fn unbind(&self, connector: &ServerConnector) -> bool {
        let shared = &connector.shared;
        let claimed = shared
            .transition(ConnectorState::Bound, ConnectorState::Closing)
            .map(|()| ConnectorState::Bound)
            .or_else(|state| match state {
                ConnectorState::Binding => shared
                    .transition(ConnectorState::Binding, ConnectorState::Closing)
                    .map(|()| ConnectorState::Binding),
                other => Err(other),
            });
        let previous = match claimed {
            Ok(previous) => previous,
            Err(state) => {
                tracing::debug!(connector_id = %connector.id(), state = state.as_str(), "Nothing to unbind");
                return false;
            }
        };
        let Some(handle) = shared.take_handle() else {
            // `bind` has not installed its handle yet.
            shared.set_state(previous);
            return false;
        };
        let _ = handle.shutdown.send(());

        match handle.closed.recv() {
            Ok(true) => {
                shared.set_state(ConnectorState::Closed);
                tracing::info!(
                    connector_id = %connector.id(),
                    host = %connector.host(),
                    port = connector.port(),
                    "Stopped listening"
                );
                true
            }
            Ok(false) => {
                shared.set_state(ConnectorState::Failed);
                let cause = connector
                    .future()
                    .and_then(|future| future.outcome())
                    .and_then(|outcome| outcome.err())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::warn!(
                    connector_id = %connector.id(),
                    host = %connector.host(),
                    port = connector.port(),
                    cause = %cause,
                    "Listener failed to bind before it could be stopped"
                );
                false
            }
            Err(e) => {
                // The bind task is gone and its listener with it.
                shared.set_state(ConnectorState::Closed);
                tracing::warn!(connector_id = %connector.id(), error = %e, "Interrupted while waiting for listener to close");
                false
            }
        }
    }
}

/// Everything the acceptor group needs to bind and run one listener.
struct BindTask {
    connector_id: String,
    host: String,
    port: u16,
    tunables: SocketTunables,
    shared: Arc<ConnectorShared>,
    worker: Handle,
    completion: Completion,
    shutdown: oneshot::Receiver<()>,
    closed: mpsc::SyncSender<bool>,
}

impl BindTask {
    /// `frozen` is the pipeline built at `bind`; a TLS load error fails the bind here.
    async fn run(self, frozen: Result<ServerPipeline, TransportError>) {
        let pipeline = match frozen {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                let cause = BindError::Tls {
                    host: self.host.clone(),
                    port: self.port,
                    reason: e.to_string(),
                };
                return self.fail(cause);
            }
        };

        let listener = match socket::bind_listener(&self.host, self.port, &self.tunables).await {
            Ok(listener) => listener,
            Err(e) => return self.fail(e),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => return self.fail(BindError::Io(e.to_string())),
        };

        self.shared.set_local_addr(addr);
        // stop() may already have moved the connector to Closing.
        let _ = self.shared.transition(ConnectorState::Binding, ConnectorState::Bound);
        self.completion.complete(Ok(addr));
        metrics::record_bind(&self.connector_id, true);
        let stages: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
        tracing::info!(
            connector_id = %self.connector_id,
            host = %self.host,
            port = addr.port(),
            stages = ?stages,
            "HTTP(S) interface starting"
        );

        self.accept_loop(listener, addr, pipeline).await;
    }

    async fn accept_loop(self, listener: TcpListener, addr: SocketAddr, pipeline: Arc<ServerPipeline>) {
        let BindTask {
            connector_id,
            shared,
            worker,
            mut shutdown,
            closed,
            ..
        } = self;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let guard = shared.tracker.track(peer);
                        tracing::trace!(connection_id = %guard.id(), peer = %peer, "Accepted connection");
                        let pipeline = pipeline.clone();
                        worker.spawn(async move {
                            pipeline.serve(stream, peer, guard).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(connector_id = %connector_id, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        tracing::debug!(connector_id = %connector_id, address = %addr, "Listener closed");
        let _ = closed.send(true);
    }

    fn fail(self, cause: BindError) {
        self.shared.set_state(ConnectorState::Failed);
        self.completion.complete(Err(cause.clone()));
        metrics::record_bind(&self.connector_id, false);
        tracing::error!(
            connector_id = %self.connector_id,
            host = %self.host,
            port = self.port,
            error = %cause,
            "Cannot bind port"
        );
        let _ = self.closed.send(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_updates_the_template() {
        let bootstrap = ConnectorBootstrap::new();
        bootstrap.configure_idle_timeout(Duration::from_secs(5));
        bootstrap.configure_tracing(true);
        bootstrap.configure_chunking(true);

        let template = bootstrap.template();
        assert_eq!(template.idle_timeout, Duration::from_secs(5));
        assert!(template.trace_log_enabled);
        assert!(template.chunking_disabled);
        assert!(template.tls.is_none());
    }

    #[test]
    fn concurrency_is_configured_once() {
        let bootstrap = ConnectorBootstrap::new();
        assert_eq!(bootstrap.thread_group_sizes(), None);
        bootstrap.configure_concurrency(1, 2).unwrap();
        assert_eq!(bootstrap.thread_group_sizes(), Some((1, 2)));
        assert!(matches!(
            bootstrap.configure_concurrency(1, 2),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bind_before_concurrency_is_not_initialized() {
        let bootstrap = ConnectorBootstrap::new();
        let connector = bootstrap.get_server_connector("127.0.0.1", 0);
        assert!(matches!(
            connector.start(),
            Err(TransportError::NotInitialized(_))
        ));
        assert_eq!(connector.state(), ConnectorState::Created);
    }

    #[test]
    fn unbind_of_unstarted_connector_is_false() {
        let bootstrap = ConnectorBootstrap::new();
        bootstrap.configure_concurrency(1, 1).unwrap();
        let connector = bootstrap.get_server_connector("127.0.0.1", 0);
        assert!(!connector.stop());
        assert_eq!(connector.state(), ConnectorState::Created);
    }

    /// Installs a listener handle by hand so the bind side can be scripted.
    fn scripted_binding(
        connector: &ServerConnector,
    ) -> (Completion, oneshot::Receiver<()>, mpsc::SyncSender<bool>) {
        connector
            .shared
            .transition(ConnectorState::Created, ConnectorState::Binding)
            .unwrap();
        let (completion, handle) = future::completion();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = mpsc::sync_channel(1);
        connector.shared.install(
            ListenerHandle {
                shutdown: shutdown_tx,
                closed: closed_rx,
            },
            handle,
        );
        (completion, shutdown_rx, closed_tx)
    }

    #[test]
    fn bind_failing_while_unbind_waits_stays_failed() {
        let bootstrap = ConnectorBootstrap::new();
        let connector = bootstrap.get_server_connector("127.0.0.1", 0);
        let (completion, shutdown, closed) = scripted_binding(&connector);

        let shared = connector.shared.clone();
        let bind_side = std::thread::spawn(move || {
            shutdown.blocking_recv().unwrap();
            assert_eq!(shared.state(), ConnectorState::Closing);
            shared.set_state(ConnectorState::Failed);
            completion.complete(Err(BindError::AddressInUse {
                addr: "127.0.0.1:1".parse().unwrap(),
            }));
            closed.send(false).unwrap();
        });

        assert!(!connector.stop());
        bind_side.join().unwrap();
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[test]
    fn unbind_after_bind_failed_does_not_touch_state() {
        let bootstrap = ConnectorBootstrap::new();
        let connector = bootstrap.get_server_connector("127.0.0.1", 0);
        let (_completion, _shutdown, _closed) = scripted_binding(&connector);
        connector.shared.set_state(ConnectorState::Failed);

        assert!(!connector.stop());
        assert_eq!(connector.state(), ConnectorState::Failed);
    }

    #[test]
    fn unbind_of_bound_connector_closes_it() {
        let bootstrap = ConnectorBootstrap::new();
        let connector = bootstrap.get_server_connector("127.0.0.1", 0);
        let (_completion, shutdown, closed) = scripted_binding(&connector);
        connector
            .shared
            .transition(ConnectorState::Binding, ConnectorState::Bound)
            .unwrap();

        let accept_side = std::thread::spawn(move || {
            shutdown.blocking_recv().unwrap();
            closed.send(true).unwrap();
        });

        assert!(connector.stop());
        accept_side.join().unwrap();
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert!(!connector.stop());
    }

    #[test]
    fn sockets_configuration_replaces_tunables() {
        let bootstrap = ConnectorBootstrap::new();
        let tunables = SocketTunables {
            backlog: 7,
            ..SocketTunables::default()
        };
        bootstrap.configure_sockets(tunables.clone());
        assert_eq!(bootstrap.socket_tunables(), tunables);
    }
}
