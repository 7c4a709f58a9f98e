//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! host-supplied string maps            config file (TOML, daemon only)
//!     → properties.rs (recognized keys)    → loader.rs (parse & deserialize)
//!                  ↘                      ↙
//!                   schema.rs (typed, immutable structs)
//!                      → validation.rs (semantic checks)
//!                      → handed to bootstrap / factory by value or Arc
//! ```
//!
//! # Design Decisions
//! - Config objects are immutable once handed to a bootstrap; reconfiguration builds new ones
//! - Unrecognized keys are rejected, both in files and in string maps
//! - Validation returns all errors, not just the first

pub mod loader;
pub mod properties;
pub mod schema;
pub mod validation;

pub use schema::{
    ClientTlsConfig, ListenerConfig, ObservabilityConfig, Parameter, PoolConfig, SenderConfig,
    SocketTunables, TlsConfig, TransportConfig, TransportProperties,
};
