//! Server side of the pipeline: turns an accepted stream into an HTTP/1.1
//! connection dispatching into the application router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ConnectInfo;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{middleware, Extension, Router};
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tower_http::trace::TraceLayer;

use crate::config::SocketTunables;
use crate::error::TransportError;
use crate::net::connection::{ConnectionGuard, ConnectionId};
use crate::net::socket;
use crate::net::tls::TlsContext;
use crate::pipeline::template::PipelineTemplate;
use crate::pipeline::{Pipeline, Stage};

/// What initializers see about a newly accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub connector_id: Arc<str>,
    pub peer: SocketAddr,
}

/// Frozen pipeline serving one bound listener.
#[derive(Debug)]
pub struct ServerPipeline {
    connector_id: Arc<str>,
    template: Arc<PipelineTemplate>,
    pipeline: Pipeline,
    tunables: SocketTunables,
}

impl ServerPipeline {
    /// Resolve a template snapshot into a servable pipeline.
    ///
    /// TLS material is loaded here, so a broken certificate surfaces as a bind failure.
    pub fn build(
        connector_id: &str,
        template: Arc<PipelineTemplate>,
        tunables: &SocketTunables,
    ) -> Result<Self, TransportError> {
        let tls = template.tls.as_ref().map(TlsContext::server).transpose()?;
        let pipeline = Pipeline::new(template.stages(), tls);
        tracing::debug!(
            connector_id,
            stages = ?pipeline.stage_names(),
            "Pipeline frozen"
        );
        Ok(Self {
            connector_id: Arc::from(connector_id),
            template,
            pipeline,
            tunables: tunables.clone(),
        })
    }

    pub fn stages(&self) -> &[Stage] {
        self.pipeline.stages()
    }

    pub fn template(&self) -> &PipelineTemplate {
        &self.template
    }

    /// Drive one accepted connection to completion.
    ///
    /// `guard` is held until the connection ends.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr, guard: ConnectionGuard) {
        let connection_id = guard.id();
        if let Err(e) = socket::configure_stream(&stream, &self.tunables) {
            tracing::debug!(connection_id = %connection_id, error = %e, "Failed to apply socket options");
        }

        let info = ConnectionInfo {
            connection_id,
            connector_id: self.connector_id.clone(),
            peer,
        };
        for initializer in &self.template.initializers {
            initializer.on_connection(&info);
        }

        let io = match self.pipeline.wrap_io(Box::new(stream), connection_id, None).await {
            Ok(io) => io,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, peer = %peer, error = %e, "Connection setup failed");
                return;
            }
        };

        let service = TowerToHyperService::new(self.router(peer));
        let result = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await;

        match result {
            Ok(()) => tracing::trace!(connection_id = %connection_id, "Connection finished"),
            Err(e) => tracing::debug!(connection_id = %connection_id, peer = %peer, error = %e, "Connection closed with error"),
        }
        drop(guard);
    }

    /// Application router wrapped with the message-level stages.
    fn router(&self, peer: SocketAddr) -> Router {
        let mut router = self
            .template
            .dispatcher
            .clone()
            .layer(Extension(ConnectInfo(peer)));
        if !self.pipeline.is_chunked() {
            router = router.layer(middleware::map_response(buffer_response));
        }
        if self.pipeline.is_traced() {
            router = router.layer(TraceLayer::new_for_http());
        }
        router
    }
}

/// Aggregate the response body so it goes out with Content-Length instead of chunked.
async fn buffer_response(response: Response) -> Response {
    let status = response.status();
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            parts.headers.remove(TRANSFER_ENCODING);
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            Response::from_parts(parts, axum::body::Body::from(bytes))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to aggregate response body");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
