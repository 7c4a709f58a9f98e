//! HTTP/WebSocket transport.
//!
//! Turns listening sockets into managed server connectors and hands out
//! pooled HTTP and WebSocket client connectors.
//!
//! # Architecture Overview
//!
//! ```text
//!   host ──▶ HttpWsConnectorFactory
//!              │
//!              ├─▶ ConnectorBootstrap ──▶ ServerConnector ── start() ──▶ ServerConnectorFuture
//!              │     ├ pipeline template (tls, idle, trace, chunking, codec)
//!              │     └ thread groups (acceptor, worker)
//!              │
//!              ├─▶ HttpClientConnector ──▶ ConnectionManager ──▶ ConnectionPool
//!              │
//!              └─▶ WebSocketClientConnector ──▶ standalone client / relay to source handler
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod listener;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod sender;

pub use config::{ListenerConfig, SenderConfig, SocketTunables, TransportConfig, TransportProperties};
pub use error::{BindError, TransportError};
pub use factory::HttpWsConnectorFactory;
pub use lifecycle::Shutdown;
pub use listener::{ConnectorBootstrap, ConnectorState, ServerConnector, ServerConnectorFuture};
pub use pipeline::{ConnectionInfo, Stage, TransportInitializer};
pub use sender::{
    HttpClientConnector, WebSocketClientConnector, WebSocketSession, WebSocketSourceHandler,
    WsFrame, WsSenderProperties,
};
