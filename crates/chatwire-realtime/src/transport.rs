//! Transport seams.
//!
//! The connection manager and the stream channel never touch a socket
//! library directly. They talk to a [`SocketConnector`] or an
//! [`EventSourceConnector`], which hand back boxed `Sink`/`Stream` halves of
//! plain frames. Production uses `tokio-tungstenite` and `reqwest` +
//! `eventsource-stream`; tests script both.

use std::pin::Pin;

use async_trait::async_trait;
use chatwire_core::RealtimeError;
use eventsource_stream::Eventsource;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

// ─────────────────────────────────────────────────────────────────────────────
// Frames and errors
// ─────────────────────────────────────────────────────────────────────────────

/// Close code and reason carried by a close frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code.
    pub code: u16,
    /// Human-readable reason (may be empty).
    pub reason: String,
}

/// A frame on the bidirectional channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame (ignored by the engine).
    Binary(Vec<u8>),
    /// Close frame, with or without a code.
    Close(Option<CloseInfo>),
}

/// One server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` name. Empty when the server omitted it.
    pub event: String,
    /// `data:` payload.
    pub data: String,
}

/// Transport plumbing failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The URL or handshake request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Connecting failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The server answered with a non-success HTTP status.
    #[error("server answered HTTP {0}")]
    Status(u16),
    /// Reading from an established transport failed.
    #[error("transport I/O failed: {0}")]
    Io(String),
    /// Writing to an established transport failed.
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// The HTTP status, if it is an authentication rejection (401/403).
    pub fn auth_status(&self) -> Option<u16> {
        match self {
            Self::Status(status @ (401 | 403)) => Some(*status),
            _ => None,
        }
    }
}

impl From<TransportError> for RealtimeError {
    fn from(err: TransportError) -> Self {
        match err.auth_status() {
            Some(code) => Self::AuthRejected { code },
            None => Self::Transport(err.to_string()),
        }
    }
}

/// Outbound half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;
/// Inbound half of a socket.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;
/// An open event stream.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseFrame, TransportError>> + Send>>;

// ─────────────────────────────────────────────────────────────────────────────
// Seams
// ─────────────────────────────────────────────────────────────────────────────

/// Opens bidirectional sockets.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Connect to `url`, offering `protocols` as sub-protocols.
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<(FrameSink, FrameStream), TransportError>;
}

/// Opens unidirectional event streams.
#[async_trait]
pub trait EventSourceConnector: Send + Sync {
    /// Open a fresh event stream at `url`.
    async fn open(&self, url: &str) -> Result<SseStream, TransportError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// tokio-tungstenite
// ─────────────────────────────────────────────────────────────────────────────

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<(FrameSink, FrameStream), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let _ = request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (ws, _response) = connect_async(request).await.map_err(handshake_error)?;
        let (ws_tx, ws_rx) = ws.split();

        let sink = ws_tx
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(to_message(frame))));
        let stream = ws_rx.filter_map(|item| {
            future::ready(match item {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(TransportError::Io(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Keep the HTTP status when the server refuses the upgrade.
fn handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => TransportError::Status(response.status().as_u16()),
        other => TransportError::Connect(other.to_string()),
    }
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(data) => Message::Binary(data.into()),
        WireFrame::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

/// Control frames are answered by tungstenite itself and never surface.
fn from_message(message: Message) -> Option<WireFrame> {
    match message {
        Message::Text(text) => Some(WireFrame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(WireFrame::Binary(data.to_vec())),
        Message::Close(frame) => Some(WireFrame::Close(frame.map(|frame| CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_owned(),
        }))),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// reqwest + eventsource-stream
// ─────────────────────────────────────────────────────────────────────────────

/// Event-stream connector backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct HttpEventSource {
    client: reqwest::Client,
}

impl HttpEventSource {
    /// Use an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSourceConnector for HttpEventSource {
    async fn open(&self, url: &str) -> Result<SseStream, TransportError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        let events = response.bytes_stream().eventsource().map(|item| match item {
            Ok(event) => Ok(SseFrame {
                event: event.event,
                data: event.data,
            }),
            Err(e) => Err(TransportError::Io(e.to_string())),
        });
        Ok(Box::pin(events))
    }
}
