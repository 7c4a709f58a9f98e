//! Recognized string-map keys.
//!
//! Hosts that hand the transport loose `name → value` maps go through these
//! constructors. Every key is enumerated here; anything else is rejected.

use std::collections::HashMap;
use std::str::FromStr;

use crate::config::schema::{PoolConfig, SocketTunables, TransportProperties};
use crate::error::TransportError;

pub const BACKLOG: &str = "backlog";
pub const TCP_NO_DELAY: &str = "tcp-no-delay";
pub const KEEP_ALIVE: &str = "keep-alive";
pub const CONNECT_TIMEOUT_MS: &str = "connect-timeout-ms";
pub const SEND_BUFFER_BYTES: &str = "send-buffer-bytes";
pub const RECV_BUFFER_BYTES: &str = "recv-buffer-bytes";

pub const MAX_ACTIVE_PER_ENDPOINT: &str = "max-active-per-endpoint";
pub const MAX_WAIT_MS: &str = "max-wait-ms";
pub const POOL_IDLE_TIMEOUT_MS: &str = "pool-idle-timeout-ms";
pub const EVICTION_INTERVAL_MS: &str = "eviction-interval-ms";

pub const REMOTE_ADDRESS: &str = "remote-address";
pub const TO: &str = "to";
pub const WEBSOCKET_SUBPROTOCOLS: &str = "websocket-subprotocols";
pub const WEBSOCKET_ALLOW_EXTENSIONS: &str = "websocket-allow-extensions";

pub const SOCKET_KEYS: &[&str] = &[
    BACKLOG,
    TCP_NO_DELAY,
    KEEP_ALIVE,
    CONNECT_TIMEOUT_MS,
    SEND_BUFFER_BYTES,
    RECV_BUFFER_BYTES,
];

pub const POOL_KEYS: &[&str] = &[
    MAX_ACTIVE_PER_ENDPOINT,
    MAX_WAIT_MS,
    POOL_IDLE_TIMEOUT_MS,
    EVICTION_INTERVAL_MS,
];

pub const WS_SENDER_KEYS: &[&str] = &[
    REMOTE_ADDRESS,
    TO,
    WEBSOCKET_SUBPROTOCOLS,
    WEBSOCKET_ALLOW_EXTENSIONS,
];

/// Fail on the first key not listed in `known`.
pub(crate) fn reject_unknown<'a>(
    properties: &HashMap<String, String>,
    known: impl Iterator<Item = &'a &'a str> + Clone,
) -> Result<(), TransportError> {
    let mut unknown: Vec<&str> = properties
        .keys()
        .map(String::as_str)
        .filter(|key| !known.clone().any(|k| k == key))
        .collect();
    unknown.sort_unstable();

    match unknown.first() {
        Some(key) => Err(TransportError::InvalidConfig(format!(
            "unrecognized property '{}'",
            key
        ))),
        None => Ok(()),
    }
}

/// Parse `key` if present, leaving `target` untouched otherwise.
pub(crate) fn parse_into<T: FromStr>(
    properties: &HashMap<String, String>,
    key: &str,
    target: &mut T,
) -> Result<(), TransportError> {
    if let Some(raw) = properties.get(key) {
        *target = raw.trim().parse().map_err(|_| {
            TransportError::InvalidConfig(format!("property '{}' has invalid value '{}'", key, raw))
        })?;
    }
    Ok(())
}

impl SocketTunables {
    /// Build tunables from a string map, starting from defaults.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, TransportError> {
        reject_unknown(properties, SOCKET_KEYS.iter())?;
        Self::apply(properties)
    }

    fn apply(properties: &HashMap<String, String>) -> Result<Self, TransportError> {
        let mut tunables = Self::default();
        parse_into(properties, BACKLOG, &mut tunables.backlog)?;
        parse_into(properties, TCP_NO_DELAY, &mut tunables.tcp_no_delay)?;
        parse_into(properties, KEEP_ALIVE, &mut tunables.keep_alive)?;
        parse_into(properties, CONNECT_TIMEOUT_MS, &mut tunables.connect_timeout_ms)?;
        parse_into(properties, SEND_BUFFER_BYTES, &mut tunables.send_buffer_bytes)?;
        parse_into(properties, RECV_BUFFER_BYTES, &mut tunables.recv_buffer_bytes)?;
        Ok(tunables)
    }
}

impl TransportProperties {
    /// Build transport properties from a string map holding socket and pool keys.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, TransportError> {
        reject_unknown(properties, SOCKET_KEYS.iter().chain(POOL_KEYS.iter()))?;

        let client_socket = SocketTunables::apply(properties)?;
        let mut pool = PoolConfig::default();
        parse_into(properties, MAX_ACTIVE_PER_ENDPOINT, &mut pool.max_active_per_endpoint)?;
        parse_into(properties, MAX_WAIT_MS, &mut pool.max_wait_ms)?;
        parse_into(properties, POOL_IDLE_TIMEOUT_MS, &mut pool.pool_idle_timeout_ms)?;
        parse_into(properties, EVICTION_INTERVAL_MS, &mut pool.eviction_interval_ms)?;

        Ok(Self { client_socket, pool })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn socket_tunables_from_map() {
        let tunables = SocketTunables::from_properties(&map(&[
            ("backlog", "512"),
            ("tcp-no-delay", "false"),
            ("connect-timeout-ms", "2500"),
        ]))
        .unwrap();

        assert_eq!(tunables.backlog, 512);
        assert!(!tunables.tcp_no_delay);
        assert_eq!(tunables.connect_timeout_ms, 2500);
        assert_eq!(tunables.recv_buffer_bytes, SocketTunables::default().recv_buffer_bytes);
    }

    #[test]
    fn negative_values_are_rejected() {
        let err = SocketTunables::from_properties(&map(&[("backlog", "-1")])).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(msg) if msg.contains("backlog")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SocketTunables::from_properties(&map(&[("so-linger", "5")])).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(msg) if msg.contains("so-linger")));
    }

    #[test]
    fn transport_properties_split_socket_and_pool_keys() {
        let props = TransportProperties::from_properties(&map(&[
            ("keep-alive", "false"),
            ("max-active-per-endpoint", "4"),
            ("max-wait-ms", "0"),
        ]))
        .unwrap();

        assert!(!props.client_socket.keep_alive);
        assert_eq!(props.pool.max_active_per_endpoint, 4);
        assert_eq!(props.pool.max_wait_ms, 0);
        assert_eq!(props.pool.eviction_interval_ms, PoolConfig::default().eviction_interval_ms);
    }
}
