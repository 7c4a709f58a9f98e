//! Mutable pipeline template owned by a connector bootstrap.
//!
//! Configuration calls update the template through [`ArcSwap::rcu`]; binding
//! takes a frozen [`Arc`] snapshot, so a listener that is already bound never
//! observes later changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::Router;

use crate::config::{SocketTunables, TlsConfig};
use crate::error::TransportError;
use crate::pipeline::server::{ConnectionInfo, ServerPipeline};
use crate::pipeline::{stage_order, Stage};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Host-supplied hook invoked when the transport is set up and for every accepted connection.
pub trait TransportInitializer: Send + Sync + 'static {
    /// Receives the flattened listener parameters once, when registered.
    fn setup(&self, parameters: &HashMap<String, String>);

    fn on_connection(&self, _info: &ConnectionInfo) {}
}

/// Everything a listener needs to build per-connection pipelines.
#[derive(Clone)]
pub struct PipelineTemplate {
    pub tls: Option<TlsConfig>,
    pub idle_timeout: Duration,
    pub trace_log_enabled: bool,
    pub chunking_disabled: bool,
    pub parameters: HashMap<String, String>,
    pub dispatcher: Router,
    pub initializers: Vec<Arc<dyn TransportInitializer>>,
}

impl Default for PipelineTemplate {
    fn default() -> Self {
        Self {
            tls: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            trace_log_enabled: false,
            chunking_disabled: false,
            parameters: HashMap::new(),
            dispatcher: Router::new(),
            initializers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for PipelineTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineTemplate")
            .field("tls", &self.tls.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .field("trace_log_enabled", &self.trace_log_enabled)
            .field("chunking_disabled", &self.chunking_disabled)
            .field("parameters", &self.parameters)
            .field("initializers", &self.initializers.len())
            .finish()
    }
}

impl PipelineTemplate {
    pub fn stages(&self) -> Vec<Stage> {
        stage_order(
            self.tls.is_some(),
            self.idle_timeout,
            self.trace_log_enabled,
            self.chunking_disabled,
        )
    }
}

/// Shared, atomically replaceable template.
#[derive(Debug, Default)]
pub struct PipelineInitializer {
    template: ArcSwap<PipelineTemplate>,
}

impl PipelineInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to a copy of the current template and publish the result.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&mut PipelineTemplate),
    {
        self.template.rcu(|current| {
            let mut next = PipelineTemplate::clone(current);
            f(&mut next);
            next
        });
    }

    pub fn snapshot(&self) -> Arc<PipelineTemplate> {
        self.template.load_full()
    }

    /// Freeze the current template into a servable pipeline.
    pub fn freeze(
        &self,
        connector_id: &str,
        tunables: &SocketTunables,
    ) -> Result<ServerPipeline, TransportError> {
        ServerPipeline::build(connector_id, self.snapshot(), tunables)
    }
}
