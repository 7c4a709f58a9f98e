//! Error types shared by the listener, pipeline and sender subsystems.
//!
//! # Design Decisions
//! - `TransportError` is returned synchronously (configuration, pool, connect)
//! - `BindError` is cloneable so it can travel through the bind completion handle
//! - Bind failures never surface as `TransportError`; they only resolve the handle

use std::io;
use std::net::SocketAddr;

/// Errors reported synchronously by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A configuration value was missing, malformed or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The bootstrap was used before a required setup step.
    #[error("connector bootstrap is not initialized: {0}")]
    NotInitialized(&'static str),

    /// `start()` was called on a connector that already left `CREATED`.
    #[error("server connector {id} was already started (state: {state})")]
    AlreadyStarted { id: String, state: &'static str },

    /// The connection pool manager was requested before `init`.
    #[error("connection pool manager has not been initialized")]
    PoolUninitialized,

    /// No connection slot became available for the endpoint in time.
    #[error("connection pool exhausted for {endpoint}")]
    PoolExhausted { endpoint: String },

    /// Establishing an outbound connection failed.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded or the handshake failed.
    #[error("tls: {0}")]
    Tls(String),

    /// A URL or URI could not be turned into an endpoint.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The remote peer negotiated WebSocket extensions that were not allowed.
    #[error("websocket extensions negotiated by {endpoint} but extensions are disabled")]
    ExtensionsNotAllowed { endpoint: String },

    /// The inbound side of a WebSocket source has gone away.
    #[error("websocket source {id} is closed")]
    SourceClosed { id: String },

    /// Another outbound connection already relays this WebSocket source.
    #[error("websocket source {id} is already relayed")]
    SourceAlreadyRelayed { id: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("http: {0}")]
    HttpMessage(#[from] http::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Outcome of a failed bind, delivered through the completion handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("address {addr} is already in use")]
    AddressInUse { addr: SocketAddr },

    #[error("permission denied binding {addr}")]
    PermissionDenied { addr: SocketAddr },

    #[error("invalid listener address {host}:{port}: {reason}")]
    InvalidAddress { host: String, port: u16, reason: String },

    #[error("tls context for {host}:{port} could not be built: {reason}")]
    Tls { host: String, port: u16, reason: String },

    #[error("bind failed: {0}")]
    Io(String),

    /// The bind task went away before reporting an outcome.
    #[error("bind was aborted before completing")]
    Aborted,
}

impl BindError {
    /// Classify an OS bind error for the given address.
    pub fn from_io(addr: SocketAddr, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindError::AddressInUse { addr },
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied { addr },
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                BindError::InvalidAddress {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                    reason: err.to_string(),
                }
            }
            _ => BindError::Io(err.to_string()),
        }
    }

    pub fn is_address_in_use(&self) -> bool {
        matches!(self, BindError::AddressInUse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bind_errors() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let in_use = io::Error::from(io::ErrorKind::AddrInUse);
        assert!(BindError::from_io(addr, &in_use).is_address_in_use());

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(
            BindError::from_io(addr, &denied),
            BindError::PermissionDenied { addr }
        );

        let unavailable = io::Error::from(io::ErrorKind::AddrNotAvailable);
        assert!(matches!(
            BindError::from_io(addr, &unavailable),
            BindError::InvalidAddress { port: 8080, .. }
        ));
    }
}
