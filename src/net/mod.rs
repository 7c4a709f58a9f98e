//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound:
//!     socket.rs (bind + listen with tunables, per-connection options)
//!     → tls.rs (optional TLS termination)
//!     → io.rs (idle watchdog, wire trace)
//!     → connection.rs (lifecycle tracking)
//!     → pipeline codec
//!
//! Outbound:
//!     socket.rs (connect with timeout) → tls.rs → io.rs → pooled HTTP/WebSocket client
//! ```
//!
//! # Design Decisions
//! - Socket options are applied before `listen` so accepted sockets inherit them
//! - Pipeline stages wrap a boxed stream; the order of wrapping is the stage order

pub mod connection;
pub mod io;
pub mod socket;
pub mod tls;
