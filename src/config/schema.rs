//! Configuration schema definitions.
//!
//! This module defines the typed configuration consumed by the transport.
//! All types derive Serde traits for deserialization from config files and
//! reject keys they do not recognize.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default idle timeout for inbound connections.
pub const DEFAULT_LISTENER_IDLE_TIMEOUT_MS: u64 = 120_000;

/// Default idle timeout for outbound connections.
pub const DEFAULT_SENDER_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Root configuration for the `transportd` daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct TransportConfig {
    /// Socket options applied to every listener.
    pub server_socket: SocketTunables,

    /// Listener definitions, one server connector each.
    pub listeners: Vec<ListenerConfig>,

    /// Outbound pool and socket settings.
    pub client: TransportProperties,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Low-level socket options.
///
/// Applied to the accepting socket and to every accepted (or opened) connection.
/// Buffer sizes of zero leave the OS default in place.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SocketTunables {
    /// Pending-connection queue length for listening sockets.
    pub backlog: u32,

    /// Disable Nagle's algorithm.
    pub tcp_no_delay: bool,

    /// Enable TCP keep-alive probes.
    pub keep_alive: bool,

    /// Outbound connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// `SO_SNDBUF` in bytes.
    pub send_buffer_bytes: u32,

    /// `SO_RCVBUF` in bytes.
    pub recv_buffer_bytes: u32,
}

impl Default for SocketTunables {
    fn default() -> Self {
        Self {
            backlog: 100,
            tcp_no_delay: true,
            keep_alive: true,
            connect_timeout_ms: 15_000,
            send_buffer_bytes: 1_048_576,
            recv_buffer_bytes: 1_048_576,
        }
    }
}

impl SocketTunables {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Server-side TLS material and constraints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Allowed protocol versions ("TLSv1.2", "TLSv1.3"). Empty means all supported.
    #[serde(default)]
    pub protocols: Vec<String>,

    /// Allowed cipher suites by IANA-style rustls name. Empty means provider defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,
}

/// Client-side TLS trust and constraints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClientTlsConfig {
    /// PEM file of trusted roots. When absent the platform trust store is used.
    pub trust_store_path: Option<String>,

    pub protocols: Vec<String>,

    pub ciphers: Vec<String>,
}

/// A named extension parameter passed through to transport initializers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Per-listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListenerConfig {
    /// Interface to bind (IP literal or resolvable host name).
    pub host: String,

    /// Port to bind. Zero asks the OS for an ephemeral port.
    pub port: u16,

    /// Optional TLS configuration; presence enables the TLS stage.
    pub tls: Option<TlsConfig>,

    /// Idle timeout for accepted connections in milliseconds.
    pub idle_timeout_ms: u64,

    /// Enable the wire trace-log stage.
    pub trace_log_enabled: bool,

    /// Drop the chunked-writer stage; responses are buffered and sent with Content-Length.
    pub chunking_disabled: bool,

    /// Extension parameters, flattened before use (last write wins).
    pub parameters: Vec<Parameter>,

    /// Acceptor thread-group size override.
    pub acceptor_threads: Option<usize>,

    /// Worker thread-group size override.
    pub worker_threads: Option<usize>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: None,
            idle_timeout_ms: DEFAULT_LISTENER_IDLE_TIMEOUT_MS,
            trace_log_enabled: false,
            chunking_disabled: false,
            parameters: Vec::new(),
            acceptor_threads: None,
            worker_threads: None,
        }
    }
}

impl ListenerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Display identity of the listener (`host-port`).
    pub fn connector_id(&self) -> String {
        connector_id(&self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Flatten the parameter list into a map. Duplicate names keep the last value.
    pub fn parameter_map(&self) -> HashMap<String, String> {
        flatten_parameters(&self.parameters)
    }
}

/// Client-side analog of [`ListenerConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SenderConfig {
    pub tls: Option<ClientTlsConfig>,
    pub idle_timeout_ms: u64,
    pub trace_log_enabled: bool,
    pub chunking_disabled: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            tls: None,
            idle_timeout_ms: DEFAULT_SENDER_IDLE_TIMEOUT_MS,
            trace_log_enabled: false,
            chunking_disabled: false,
        }
    }
}

impl SenderConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Limits for the outbound connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum connections (idle + in use) per endpoint.
    pub max_active_per_endpoint: usize,

    /// How long an acquire may queue for a free slot. Zero fails immediately.
    pub max_wait_ms: u64,

    /// Idle connections older than this are discarded.
    pub pool_idle_timeout_ms: u64,

    /// Interval of the background eviction pass. Zero disables it.
    pub eviction_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active_per_endpoint: 16,
            max_wait_ms: 30_000,
            pool_idle_timeout_ms: 60_000,
            eviction_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }

    pub fn eviction_interval(&self) -> Option<Duration> {
        (self.eviction_interval_ms > 0).then(|| Duration::from_millis(self.eviction_interval_ms))
    }
}

/// Transport-wide outbound properties used to initialize the pool manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct TransportProperties {
    /// Socket options for outbound connections.
    pub client_socket: SocketTunables,

    pub pool: PoolConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Build the `host-port` display identity used for connectors and logs.
pub fn connector_id(host: &str, port: u16) -> String {
    format!("{}-{}", host, port)
}

fn flatten_parameters(parameters: &[Parameter]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(parameters.len());
    for parameter in parameters {
        map.insert(parameter.name.clone(), parameter.value.clone());
    }
    map
}
