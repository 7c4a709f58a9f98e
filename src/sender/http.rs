//! Outbound HTTP client connector.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::uri::{PathAndQuery, Uri};
use http::{HeaderValue, Request, Response};
use http_body_util::BodyExt;

use crate::config::SenderConfig;
use crate::error::TransportError;
use crate::net::connection::ConnectionId;
use crate::net::socket;
use crate::pipeline::Pipeline;
use crate::sender::manager::{ConnectionManager, HttpConnection};
use crate::sender::pool::{default_port, EndpointKey, Pooled};

/// Sends requests to absolute URIs over pooled connections.
///
/// Errors are returned to the caller as-is; nothing is retried.
#[derive(Debug, Clone)]
pub struct HttpClientConnector {
    manager: Arc<ConnectionManager>,
    pipeline: Pipeline,
    config: SenderConfig,
}

impl HttpClientConnector {
    pub fn new(manager: Arc<ConnectionManager>, config: SenderConfig) -> Result<Self, TransportError> {
        let pipeline = Pipeline::for_sender(&config)?;
        Ok(Self {
            manager,
            pipeline,
            config,
        })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Send `request` and collect the full response.
    ///
    /// The request URI must be absolute. The connection goes back to the pool
    /// once the response body has been read; on any error it is closed.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Bytes>, TransportError> {
        let key = EndpointKey::from_uri(request.uri())?;
        if key.is_secure() && !self.pipeline.has_tls() {
            return Err(TransportError::Tls(format!(
                "{} requires a sender tls configuration",
                key
            )));
        }

        let request = self.prepare(request, &key).await?;
        let mut conn = self
            .manager
            .pool()
            .acquire(&key, || self.connect(&key))
            .await?;

        match exchange(&mut conn, request).await {
            Ok(response) => {
                conn.release();
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(endpoint = %key, connection_id = %conn.id(), error = %e, "Request failed");
                conn.mark_broken();
                conn.release();
                Err(e)
            }
        }
    }

    async fn connect(&self, key: &EndpointKey) -> Result<HttpConnection, TransportError> {
        let stream = socket::connect(&key.host, key.port, self.manager.socket_tunables()).await?;
        let id = ConnectionId::new();
        let server_name = key.is_secure().then_some(key.host.as_str());
        let io = self.pipeline.wrap_io(Box::new(stream), id, server_name).await?;
        HttpConnection::handshake(io, id).await
    }

    /// Rewrite to origin-form, set Host, and buffer the body when chunking is disabled.
    async fn prepare(&self, request: Request<Body>, key: &EndpointKey) -> Result<Request<Body>, TransportError> {
        let (mut parts, body) = request.into_parts();

        if !parts.headers.contains_key(HOST) {
            let host = if default_port(&key.scheme) == Some(key.port) {
                key.host.clone()
            } else {
                format!("{}:{}", key.host, key.port)
            };
            let value = HeaderValue::from_str(&host)
                .map_err(|e| TransportError::InvalidUrl(format!("invalid host '{}': {}", host, e)))?;
            parts.headers.insert(HOST, value);
        }

        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);

        let body = if self.config.chunking_disabled {
            let bytes = body
                .collect()
                .await
                .map_err(|e| TransportError::Io(io::Error::other(e)))?
                .to_bytes();
            parts.headers.remove(TRANSFER_ENCODING);
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            Body::from(bytes)
        } else {
            body
        };

        Ok(Request::from_parts(parts, body))
    }
}

async fn exchange(
    conn: &mut Pooled<HttpConnection>,
    request: Request<Body>,
) -> Result<Response<Bytes>, TransportError> {
    let response = conn.send(request).await?;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, bytes))
}
