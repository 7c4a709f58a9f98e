//! Server-side connector lifecycle.
//!
//! # Data Flow
//! ```text
//! ConnectorBootstrap (bootstrap.rs)
//!     configure_*()          → pipeline template, socket tunables
//!     configure_concurrency  → ThreadGroups (threads.rs)
//!     get_server_connector   → ServerConnector (connector.rs)
//!
//! ServerConnector::start()   → ServerConnectorFuture (future.rs)
//! ServerConnector::stop()    → blocking close of the listening socket
//! ```
//!
//! # Design Decisions
//! - Bind failures never escape as errors; they resolve the completion handle
//! - A listener serves the template snapshot taken when it was bound
//! - Stopping closes only the listening socket, accepted connections live on

pub mod bootstrap;
pub mod connector;
pub mod future;
pub mod threads;

pub use bootstrap::ConnectorBootstrap;
pub use connector::{ConnectorState, ServerConnector};
pub use future::{BindOutcome, ServerConnectorFuture};
pub use threads::ThreadGroups;
