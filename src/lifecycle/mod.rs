//! Lifecycle helpers.
//!
//! ```text
//! ctrl-c / host teardown → Shutdown::trigger → evictor and daemon loops exit
//! ```

pub mod shutdown;

pub use shutdown::Shutdown;
