//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! listener / pipeline / pool events
//!     → logging.rs (subscriber setup for the daemon)
//!     → metrics.rs (counters and gauges via the `metrics` facade)
//!     → net::io::TraceIo (wire trace under its own target)
//! ```
//!
//! # Design Decisions
//! - The library only emits; installing sinks is left to the binary or host
//! - Metric updates are cheap no-ops when no recorder is installed

pub mod logging;
pub mod metrics;
