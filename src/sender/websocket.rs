//! Outbound WebSocket client connector.
//!
//! # Data Flow
//! ```text
//! standalone:  caller ⇄ WebSocketClient ⇄ remote
//! relayed:     inbound client ⇄ WebSocketSourceHandler ⇄ relay task ⇄ remote
//! ```
//!
//! # Design Decisions
//! - Close frames are propagated in both directions, then the relay ends
//! - Ping/pong are relayed as ordinary frames
//! - Negotiated extensions are refused unless `allow_extensions` is set

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::ws::{self, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::header::{SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL};
use http::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::config::properties::{
    self, parse_into, reject_unknown, REMOTE_ADDRESS, TO, WEBSOCKET_ALLOW_EXTENSIONS,
    WEBSOCKET_SUBPROTOCOLS,
};
use crate::config::{ClientTlsConfig, SocketTunables};
use crate::error::TransportError;
use crate::net::connection::ConnectionId;
use crate::net::io::BoxedIo;
use crate::net::socket;
use crate::net::tls::TlsContext;

const SOURCE_BUFFER: usize = 64;

/// A WebSocket frame independent of which side it travels on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

impl WsFrame {
    pub fn is_close(&self) -> bool {
        matches!(self, WsFrame::Close(_))
    }

    /// Raw frames have no counterpart and map to `None`.
    pub fn from_message(message: Message) -> Option<Self> {
        Some(match message {
            Message::Text(text) => WsFrame::Text(text.as_str().to_string()),
            Message::Binary(data) => WsFrame::Binary(data),
            Message::Ping(data) => WsFrame::Ping(data),
            Message::Pong(data) => WsFrame::Pong(data),
            Message::Close(frame) => {
                WsFrame::Close(frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string())))
            }
            Message::Frame(_) => return None,
        })
    }
}

impl From<WsFrame> for Message {
    fn from(frame: WsFrame) -> Self {
        match frame {
            WsFrame::Text(text) => Message::Text(text.into()),
            WsFrame::Binary(data) => Message::Binary(data),
            WsFrame::Ping(data) => Message::Ping(data),
            WsFrame::Pong(data) => Message::Pong(data),
            WsFrame::Close(frame) => Message::Close(frame.map(|(code, reason)| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }
}

impl From<ws::Message> for WsFrame {
    fn from(message: ws::Message) -> Self {
        match message {
            ws::Message::Text(text) => WsFrame::Text(text.as_str().to_string()),
            ws::Message::Binary(data) => WsFrame::Binary(data),
            ws::Message::Ping(data) => WsFrame::Ping(data),
            ws::Message::Pong(data) => WsFrame::Pong(data),
            ws::Message::Close(frame) => {
                WsFrame::Close(frame.map(|f| (f.code, f.reason.as_str().to_string())))
            }
        }
    }
}

impl From<WsFrame> for ws::Message {
    fn from(frame: WsFrame) -> Self {
        match frame {
            WsFrame::Text(text) => ws::Message::Text(text.into()),
            WsFrame::Binary(data) => ws::Message::Binary(data),
            WsFrame::Ping(data) => ws::Message::Ping(data),
            WsFrame::Pong(data) => ws::Message::Pong(data),
            WsFrame::Close(frame) => ws::Message::Close(frame.map(|(code, reason)| ws::CloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

/// Far side of a [`WebSocketSourceHandler`] channel, held by whoever owns the inbound socket.
#[derive(Debug)]
pub struct SourceEndpoint {
    /// Frames received from the inbound client.
    pub from_client: mpsc::Sender<WsFrame>,
    /// Frames to write back to the inbound client.
    pub to_client: mpsc::Receiver<WsFrame>,
}

/// Handle on an inbound WebSocket connection that an outbound connector can relay to.
#[derive(Debug)]
pub struct WebSocketSourceHandler {
    id: ConnectionId,
    to_client: mpsc::Sender<WsFrame>,
    from_client: Mutex<Option<mpsc::Receiver<WsFrame>>>,
}

impl WebSocketSourceHandler {
    pub fn channel(buffer: usize) -> (Arc<Self>, SourceEndpoint) {
        let (from_client_tx, from_client_rx) = mpsc::channel(buffer);
        let (to_client_tx, to_client_rx) = mpsc::channel(buffer);
        let handler = Arc::new(Self {
            id: ConnectionId::new(),
            to_client: to_client_tx,
            from_client: Mutex::new(Some(from_client_rx)),
        });
        let endpoint = SourceEndpoint {
            from_client: from_client_tx,
            to_client: to_client_rx,
        };
        (handler, endpoint)
    }

    /// Wrap an upgraded inbound socket. Must be called inside a tokio runtime.
    pub fn attach(socket: WebSocket) -> Arc<Self> {
        let (handler, endpoint) = Self::channel(SOURCE_BUFFER);
        let id = handler.id;
        tokio::spawn(pump_source(socket, endpoint, id));
        handler
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame for the inbound client.
    pub async fn send(&self, frame: WsFrame) -> Result<(), TransportError> {
        self.to_client
            .send(frame)
            .await
            .map_err(|_| self.closed())
    }

    /// Whether the inbound client can no longer receive frames.
    pub fn is_closed(&self) -> bool {
        self.to_client.is_closed()
    }

    fn closed(&self) -> TransportError {
        TransportError::SourceClosed {
            id: self.id.to_string(),
        }
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<WsFrame>> {
        self.from_client.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Claim the inbound frames for one relay.
    fn claim(&self) -> Result<mpsc::Receiver<WsFrame>, TransportError> {
        if self.is_closed() {
            return Err(self.closed());
        }
        self.take_inbound().ok_or_else(|| TransportError::SourceAlreadyRelayed {
            id: self.id.to_string(),
        })
    }

    /// Hand back frames claimed by a relay that never started.
    fn unclaim(&self, inbound: mpsc::Receiver<WsFrame>) {
        *self.from_client.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
    }
}

async fn pump_source(socket: WebSocket, endpoint: SourceEndpoint, id: ConnectionId) {
    let SourceEndpoint {
        from_client,
        mut to_client,
    } = endpoint;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => {
                    let frame = WsFrame::from(message);
                    let close = frame.is_close();
                    if from_client.send(frame).await.is_err() || close {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %id, error = %e, "Inbound websocket failed");
                    let _ = from_client.send(WsFrame::Close(None)).await;
                    break;
                }
                None => {
                    let _ = from_client.send(WsFrame::Close(None)).await;
                    break;
                }
            },
            outgoing = to_client.recv() => match outgoing {
                Some(frame) => {
                    let close = frame.is_close();
                    if sink.send(frame.into()).await.is_err() || close {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(ws::Message::Close(None)).await;
                    break;
                }
            },
        }
    }
    tracing::trace!(connection_id = %id, "Inbound websocket pump finished");
}

/// Properties of one outbound WebSocket sender.
#[derive(Clone)]
pub struct WsSenderProperties {
    pub remote_url: Url,
    pub target: Option<String>,
    pub sub_protocols: Vec<String>,
    pub allow_extensions: bool,
    pub tls: Option<ClientTlsConfig>,
    pub client_socket: SocketTunables,
    pub source: Option<Arc<WebSocketSourceHandler>>,
}

impl fmt::Debug for WsSenderProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsSenderProperties")
            .field("remote_url", &self.remote_url.as_str())
            .field("target", &self.target)
            .field("sub_protocols", &self.sub_protocols)
            .field("allow_extensions", &self.allow_extensions)
            .field("tls", &self.tls.is_some())
            .field("source", &self.source.as_ref().map(|s| s.id()))
            .finish()
    }
}

impl WsSenderProperties {
    pub fn new(remote_url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(remote_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", remote_url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "{}: websocket url must use ws or wss",
                remote_url
            )));
        }
        if url.host_str().is_none() {
            return Err(TransportError::InvalidUrl(format!("{}: missing host", remote_url)));
        }
        Ok(Self {
            remote_url: url,
            target: None,
            sub_protocols: Vec::new(),
            allow_extensions: true,
            tls: None,
            client_socket: SocketTunables::default(),
            source: None,
        })
    }

    /// Build from a string map of `remote-address`, `to`, `websocket-subprotocols`
    /// (comma separated) and `websocket-allow-extensions`.
    pub fn from_properties(map: &HashMap<String, String>) -> Result<Self, TransportError> {
        reject_unknown(map, properties::WS_SENDER_KEYS.iter())?;
        let url = map.get(REMOTE_ADDRESS).ok_or_else(|| {
            TransportError::InvalidConfig(format!("missing property '{}'", REMOTE_ADDRESS))
        })?;

        let mut props = Self::new(url)?;
        props.target = map.get(TO).cloned();
        if let Some(raw) = map.get(WEBSOCKET_SUBPROTOCOLS) {
            props.sub_protocols = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        parse_into(map, WEBSOCKET_ALLOW_EXTENSIONS, &mut props.allow_extensions)?;
        Ok(props)
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_sub_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow_extensions(mut self, allow: bool) -> Self {
        self.allow_extensions = allow;
        self
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_socket_tunables(mut self, tunables: SocketTunables) -> Self {
        self.client_socket = tunables;
        self
    }

    /// Relay frames between the new outbound connection and `source`.
    pub fn with_source(mut self, source: Arc<WebSocketSourceHandler>) -> Self {
        self.source = Some(source);
        self
    }

    fn host_port(&self) -> Result<(&str, u16), TransportError> {
        let host = self
            .remote_url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing host", self.remote_url)))?;
        let port = self
            .remote_url
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{}: missing port", self.remote_url)))?;
        Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

/// A standalone outbound WebSocket connection.
pub struct WebSocketClient {
    id: ConnectionId,
    protocol: Option<String>,
    stream: WebSocketStream<BoxedIo>,
}

impl fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl WebSocketClient {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sub-protocol selected by the server, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub async fn send(&mut self, frame: WsFrame) -> Result<(), TransportError> {
        self.stream.send(frame.into()).await?;
        Ok(())
    }

    /// Next frame from the remote, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<WsFrame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(message) => {
                    if let Some(frame) = WsFrame::from_message(message) {
                        return Some(Ok(frame));
                    }
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Background relay between a source handler and a remote connection.
#[derive(Debug)]
pub struct RelayHandle {
    id: ConnectionId,
    protocol: Option<String>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait until either side closes.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(connection_id = %self.id, "Websocket relay panicked");
            }
        }
    }
}

/// Result of [`WebSocketClientConnector::connect`].
#[derive(Debug)]
pub enum WebSocketSession {
    Standalone(WebSocketClient),
    Relayed(RelayHandle),
}

impl WebSocketSession {
    pub fn into_client(self) -> Option<WebSocketClient> {
        match self {
            WebSocketSession::Standalone(client) => Some(client),
            WebSocketSession::Relayed(_) => None,
        }
    }

    pub fn into_relay(self) -> Option<RelayHandle> {
        match self {
            WebSocketSession::Relayed(relay) => Some(relay),
            WebSocketSession::Standalone(_) => None,
        }
    }
}

/// Opens outbound WebSocket connections for one set of [`WsSenderProperties`].
#[derive(Debug)]
pub struct WebSocketClientConnector {
    properties: WsSenderProperties,
    tls: Option<TlsContext>,
}

impl WebSocketClientConnector {
    pub fn new(properties: WsSenderProperties) -> Result<Self, TransportError> {
        let tls = if properties.remote_url.scheme() == "wss" {
            Some(TlsContext::client(properties.tls.as_ref())?)
        } else {
            None
        };
        Ok(Self { properties, tls })
    }

    pub fn properties(&self) -> &WsSenderProperties {
        &self.properties
    }

    /// Connect and run the opening handshake.
    ///
    /// With a source handler the session is relayed in the background;
    /// otherwise the caller drives the returned client. The source is claimed
    /// before the remote is contacted and released again if the handshake fails.
    pub async fn connect(&self) -> Result<WebSocketSession, TransportError> {
        let Some(source) = &self.properties.source else {
            return self.open().await.map(WebSocketSession::Standalone);
        };

        let inbound = source.claim()?;
        match self.open().await {
            Ok(client) => Ok(WebSocketSession::Relayed(relay(client, source, inbound))),
            Err(e) => {
                source.unclaim(inbound);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<WebSocketClient, TransportError> {
        let (host, port) = self.properties.host_port()?;
        let endpoint = format!("{}:{}", host, port);

        let stream = socket::connect(host, port, &self.properties.client_socket).await?;
        let io: BoxedIo = match &self.tls {
            Some(tls) => tls.wrap(Box::new(stream), Some(host)).await?,
            None => Box::new(stream),
        };

        let mut request = self.properties.remote_url.as_str().into_client_request()?;
        if !self.properties.sub_protocols.is_empty() {
            let joined = self.properties.sub_protocols.join(", ");
            let value = HeaderValue::from_str(&joined).map_err(|e| {
                TransportError::InvalidConfig(format!("invalid sub-protocols '{}': {}", joined, e))
            })?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, response) = tokio_tungstenite::client_async(request, io).await?;
        check_extensions(self.properties.allow_extensions, response.headers(), &endpoint)?;

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let client = WebSocketClient {
            id: ConnectionId::new(),
            protocol,
            stream,
        };
        tracing::debug!(
            connection_id = %client.id,
            endpoint = %endpoint,
            protocol = ?client.protocol,
            relayed = self.properties.source.is_some(),
            "Websocket connected"
        );
        Ok(client)
    }
}

fn check_extensions(allow: bool, headers: &HeaderMap, endpoint: &str) -> Result<(), TransportError> {
    if !allow && headers.contains_key(SEC_WEBSOCKET_EXTENSIONS) {
        return Err(TransportError::ExtensionsNotAllowed {
            endpoint: endpoint.to_string(),
        });
    }
    Ok(())
}

fn relay(
    client: WebSocketClient,
    source: &WebSocketSourceHandler,
    mut from_client: mpsc::Receiver<WsFrame>,
) -> RelayHandle {
    let to_client = source.to_client.clone();
    let WebSocketClient { id, protocol, stream } = client;

    let task = tokio::spawn(async move {
        let (mut remote_sink, mut remote_stream) = stream.split();
        loop {
            tokio::select! {
                inbound = from_client.recv() => match inbound {
                    Some(frame) => {
                        let close = frame.is_close();
                        if let Err(e) = remote_sink.send(frame.into()).await {
                            tracing::debug!(connection_id = %id, error = %e, "Relay to remote failed");
                            let _ = to_client.send(WsFrame::Close(None)).await;
                            break;
                        }
                        if close {
                            break;
                        }
                    }
                    None => {
                        let _ = remote_sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                outbound = remote_stream.next() => match outbound {
                    Some(Ok(message)) => {
                        let Some(frame) = WsFrame::from_message(message) else { continue };
                        let close = frame.is_close();
                        if to_client.send(frame).await.is_err() || close {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %id, error = %e, "Remote websocket failed");
                        let _ = to_client.send(WsFrame::Close(None)).await;
                        break;
                    }
                    None => {
                        let _ = to_client.send(WsFrame::Close(None)).await;
                        break;
                    }
                },
            }
        }
        tracing::trace!(connection_id = %id, "Websocket relay finished");
    });

    RelayHandle { id, protocol, task }
}
