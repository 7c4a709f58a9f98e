//! Per-connection processing pipeline.
//!
//! # Data Flow
//! ```text
//! raw TCP stream
//!     → [Tls]            terminate / originate TLS when configured
//!     → [IdleTimeout]    watchdog over reads and writes of every inner stage
//!     → [TraceLog]       wire trace when enabled
//!     → [ChunkedWriter]  stream bodies of unknown length (absent: buffer + Content-Length)
//!     → [Codec]          HTTP/1.1 framing and application dispatch
//! ```
//!
//! # Design Decisions
//! - Stage order is fixed; configuration only decides which optional stages exist
//! - The idle watchdog sits on the raw stream, under TLS, so a handshake that
//!   never progresses is timed out as well
//! - A bound listener serves a frozen template snapshot (see `template.rs`)
//! - Client connections run the same stream stages with a client TLS context

pub mod server;
pub mod template;

use std::time::Duration;

use crate::config::SenderConfig;
use crate::error::TransportError;
use crate::net::connection::ConnectionId;
use crate::net::io::{BoxedIo, IdleTimeoutIo, TraceIo};
use crate::net::tls::TlsContext;

pub use server::{ConnectionInfo, ServerPipeline};
pub use template::{PipelineInitializer, PipelineTemplate, TransportInitializer};

/// One stage of the per-connection handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Tls,
    IdleTimeout(Duration),
    TraceLog,
    ChunkedWriter,
    Codec,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Tls => "tls",
            Stage::IdleTimeout(_) => "idle-timeout",
            Stage::TraceLog => "trace-log",
            Stage::ChunkedWriter => "chunked-writer",
            Stage::Codec => "codec",
        }
    }
}

/// Build the ordered stage list, outermost first.
pub fn stage_order(tls: bool, idle_timeout: Duration, trace_log: bool, chunking_disabled: bool) -> Vec<Stage> {
    let mut stages = Vec::with_capacity(5);
    if tls {
        stages.push(Stage::Tls);
    }
    stages.push(Stage::IdleTimeout(idle_timeout));
    if trace_log {
        stages.push(Stage::TraceLog);
    }
    if !chunking_disabled {
        stages.push(Stage::ChunkedWriter);
    }
    stages.push(Stage::Codec);
    stages
}

/// The stream-level part of a pipeline plus its resolved TLS context.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    tls: Option<TlsContext>,
}

impl Pipeline {
    /// `tls` must be present exactly when `stages` contains [`Stage::Tls`].
    pub fn new(stages: Vec<Stage>, tls: Option<TlsContext>) -> Self {
        debug_assert_eq!(stages.contains(&Stage::Tls), tls.is_some());
        Self { stages, tls }
    }

    /// Pipeline for outbound connections of one sender.
    pub fn for_sender(config: &SenderConfig) -> Result<Self, TransportError> {
        let tls = config
            .tls
            .as_ref()
            .map(|tls| TlsContext::client(Some(tls)))
            .transpose()?;
        let stages = stage_order(
            tls.is_some(),
            config.idle_timeout(),
            config.trace_log_enabled,
            config.chunking_disabled,
        );
        Ok(Self::new(stages, tls))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn is_chunked(&self) -> bool {
        self.stages.contains(&Stage::ChunkedWriter)
    }

    pub fn is_traced(&self) -> bool {
        self.stages.contains(&Stage::TraceLog)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.stages.iter().find_map(|stage| match stage {
            Stage::IdleTimeout(timeout) => Some(*timeout),
            _ => None,
        })
    }

    /// Wrap `io` with the stream stages in order.
    ///
    /// A client TLS context is applied only when `server_name` is given, i.e.
    /// when the target scheme is secure.
    pub async fn wrap_io(
        &self,
        mut io: BoxedIo,
        connection_id: ConnectionId,
        server_name: Option<&str>,
    ) -> Result<BoxedIo, TransportError> {
        if let Some(timeout) = self.idle_timeout() {
            io = Box::new(IdleTimeoutIo::new(io, timeout));
        }
        for stage in &self.stages {
            io = match stage {
                Stage::Tls => match &self.tls {
                    Some(ctx @ TlsContext::Server(_)) => ctx.wrap(io, None).await?,
                    Some(ctx @ TlsContext::Client(_)) if server_name.is_some() => {
                        ctx.wrap(io, server_name).await?
                    }
                    _ => io,
                },
                // Already applied beneath every other stage.
                Stage::IdleTimeout(_) => io,
                Stage::TraceLog => Box::new(TraceIo::new(io, connection_id)),
                // Message-level stages are applied by the codec.
                Stage::ChunkedWriter | Stage::Codec => io,
            };
        }
        Ok(io)
    }
}
