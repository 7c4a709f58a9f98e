//! Outbound connectors.
//!
//! # Data Flow
//! ```text
//! HttpClientConnector::send
//!     → ConnectionManager → ConnectionPool::acquire(endpoint)
//!         idle hit  → reuse
//!         idle miss → connect → sender pipeline → HTTP/1.1 handshake
//!     → exchange → release (healthy) / close (error)
//!
//! WebSocketClientConnector::connect
//!     → connect → TLS (wss) → opening handshake → standalone client or relay
//! ```

pub mod http;
pub mod manager;
pub mod pool;
pub mod websocket;

pub use self::http::HttpClientConnector;
pub use manager::{ConnectionManager, ConnectionManagerCell, HttpConnection};
pub use pool::{ConnectionPool, EndpointKey, Poolable, Pooled};
pub use websocket::{
    RelayHandle, SourceEndpoint, WebSocketClient, WebSocketClientConnector, WebSocketSession,
    WebSocketSourceHandler, WsFrame, WsSenderProperties,
};
