//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, thread counts > 0, pool cap > 0)
//! - Detect listeners sharing a `host:port` key
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function over the typed config
//! - Runs before a config is handed to a bootstrap or pool

use std::collections::HashSet;

use crate::config::schema::{
    ListenerConfig, PoolConfig, SenderConfig, TlsConfig, TransportConfig,
};
use crate::error::TransportError;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl From<Vec<ValidationError>> for TransportError {
    fn from(errors: Vec<ValidationError>) -> Self {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        TransportError::InvalidConfig(joined)
    }
}

fn check_tls(prefix: &str, tls: &TlsConfig, errors: &mut Vec<ValidationError>) {
    if tls.cert_path.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.tls.cert-path", prefix), "must not be empty"));
    }
    if tls.key_path.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.tls.key-path", prefix), "must not be empty"));
    }
}

fn collect_listener(prefix: &str, config: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    if config.host.trim().is_empty() {
        errors.push(ValidationError::new(format!("{}.host", prefix), "must not be empty"));
    }
    if config.idle_timeout_ms == 0 {
        errors.push(ValidationError::new(
            format!("{}.idle-timeout-ms", prefix),
            "must be greater than zero",
        ));
    }
    if config.acceptor_threads == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.acceptor-threads", prefix),
            "must be greater than zero",
        ));
    }
    if config.worker_threads == Some(0) {
        errors.push(ValidationError::new(
            format!("{}.worker-threads", prefix),
            "must be greater than zero",
        ));
    }
    if let Some(tls) = &config.tls {
        check_tls(prefix, tls, errors);
    }
}

/// Validate a single listener.
pub fn validate_listener(config: &ListenerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    collect_listener("listener", config, &mut errors);
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate a sender.
pub fn validate_sender(config: &SenderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    if config.idle_timeout_ms == 0 {
        errors.push(ValidationError::new("sender.idle-timeout-ms", "must be greater than zero"));
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate pool limits.
pub fn validate_pool(config: &PoolConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    if config.max_active_per_endpoint == 0 {
        errors.push(ValidationError::new(
            "pool.max-active-per-endpoint",
            "must be greater than zero",
        ));
    }
    if config.pool_idle_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "pool.pool-idle-timeout-ms",
            "must be greater than zero",
        ));
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate a whole daemon configuration.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (i, listener) in config.listeners.iter().enumerate() {
        let prefix = format!("listeners[{}]", i);
        collect_listener(&prefix, listener, &mut errors);

        // Port 0 is ephemeral and never collides.
        if listener.port != 0 && !seen.insert((listener.host.clone(), listener.port)) {
            errors.push(ValidationError::new(
                prefix,
                format!("duplicate listener {}:{}", listener.host, listener.port),
            ));
        }
    }

    if let Err(pool_errors) = validate_pool(&config.client.pool) {
        errors.extend(pool_errors);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
