//! Scripted transports and timing helpers for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chatwire_core::UserId;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::ApiError;
use crate::presence::PresenceSource;
use crate::transport::{
    CloseInfo, EventSourceConnector, FrameSink, FrameStream, SocketConnector, SseFrame, SseStream,
    TransportError, WireFrame,
};

/// Let every ready task run without moving the paused clock.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket
// ─────────────────────────────────────────────────────────────────────────────

enum SocketScript {
    Accept(
        mpsc::UnboundedReceiver<Result<WireFrame, TransportError>>,
        mpsc::UnboundedSender<WireFrame>,
    ),
    Fail(TransportError),
}

/// Server side of one accepted mock socket.
pub(crate) struct MockPeer {
    to_client: mpsc::UnboundedSender<Result<WireFrame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<WireFrame>,
}

impl MockPeer {
    pub(crate) fn push_text(&self, text: &str) {
        let _ = self.to_client.send(Ok(WireFrame::Text(text.to_owned())));
    }

    pub(crate) fn close_with(&self, code: u16) {
        let _ = self.to_client.send(Ok(WireFrame::Close(Some(CloseInfo {
            code,
            reason: String::new(),
        }))));
    }

    pub(crate) fn fail(&self, message: &str) {
        let _ = self.to_client.send(Err(TransportError::Io(message.to_owned())));
    }

    /// Frames the client has written so far.
    pub(crate) fn sent(&mut self) -> Vec<WireFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Text frames the client has written, parsed as JSON.
    pub(crate) fn sent_json(&mut self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                WireFrame::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    /// Whether the client dropped its end of the socket.
    pub(crate) fn client_gone(&self) -> bool {
        self.to_client.is_closed()
    }
}

/// Connector whose outcomes are queued by the test. An empty queue refuses.
#[derive(Default)]
pub(crate) struct MockConnector {
    script: Mutex<VecDeque<SocketScript>>,
    urls: Mutex<Vec<String>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an attempt that succeeds; returns the server side.
    pub(crate) fn accept(&self) -> MockPeer {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        self.script
            .lock()
            .push_back(SocketScript::Accept(client_rx, client_tx));
        MockPeer {
            to_client,
            from_client,
        }
    }

    /// Queue an attempt that fails.
    pub(crate) fn refuse(&self) {
        self.script
            .lock()
            .push_back(SocketScript::Fail(TransportError::Connect("refused".into())));
    }

    /// Queue an attempt whose upgrade request is answered with `status`.
    pub(crate) fn reject_upgrade(&self, status: u16) {
        self.script
            .lock()
            .push_back(SocketScript::Fail(TransportError::Status(status)));
    }

    pub(crate) fn attempts(&self) -> usize {
        self.urls.lock().len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(
        &self,
        url: &str,
        _protocols: &[String],
    ) -> Result<(FrameSink, FrameStream), TransportError> {
        self.urls.lock().push(url.to_owned());
        let next = self.script.lock().pop_front();
        match next {
            Some(SocketScript::Accept(inbound, outbound)) => {
                let sink = futures::sink::unfold(outbound, |tx, frame: WireFrame| async move {
                    tx.send(frame)
                        .map_err(|e| TransportError::Send(e.to_string()))?;
                    Ok::<_, TransportError>(tx)
                });
                let stream = stream::unfold(inbound, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                Ok((Box::pin(sink), Box::pin(stream)))
            }
            Some(SocketScript::Fail(err)) => Err(err),
            None => Err(TransportError::Connect("no scripted outcome".into())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event stream
// ─────────────────────────────────────────────────────────────────────────────

enum SourceScript {
    Open(mpsc::UnboundedReceiver<Result<SseFrame, TransportError>>),
    Fail(TransportError),
}

/// Server side of one mock event source.
pub(crate) struct MockSource {
    tx: mpsc::UnboundedSender<Result<SseFrame, TransportError>>,
}

impl MockSource {
    pub(crate) fn event(&self, event: &str, data: &str) {
        let _ = self.tx.send(Ok(SseFrame {
            event: event.to_owned(),
            data: data.to_owned(),
        }));
    }

    pub(crate) fn error(&self) {
        let _ = self.tx.send(Err(TransportError::Io("connection reset".into())));
    }

    /// Whether the client dropped this source.
    pub(crate) fn closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Event-source connector with queued outcomes. An empty queue refuses.
#[derive(Default)]
pub(crate) struct MockEventSource {
    script: Mutex<VecDeque<SourceScript>>,
    urls: Mutex<Vec<String>>,
}

impl MockEventSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn open_next(&self) -> MockSource {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(SourceScript::Open(rx));
        MockSource { tx }
    }

    pub(crate) fn reject_next(&self, status: u16) {
        self.script
            .lock()
            .push_back(SourceScript::Fail(TransportError::Status(status)));
    }

    pub(crate) fn opens(&self) -> usize {
        self.urls.lock().len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl EventSourceConnector for MockEventSource {
    async fn open(&self, url: &str) -> Result<SseStream, TransportError> {
        self.urls.lock().push(url.to_owned());
        let next = self.script.lock().pop_front();
        match next {
            Some(SourceScript::Open(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
            Some(SourceScript::Fail(err)) => Err(err),
            None => Err(TransportError::Connect("no scripted outcome".into())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Presence
// ─────────────────────────────────────────────────────────────────────────────

/// Presence source returning queued responses; repeats the last one.
#[derive(Default)]
pub(crate) struct MockPresence {
    responses: Mutex<VecDeque<Result<Vec<UserId>, u16>>>,
    calls: AtomicUsize,
}

impl MockPresence {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, ids: &[i64]) {
        self.responses
            .lock()
            .push_back(Ok(ids.iter().copied().map(UserId::new).collect()));
    }

    pub(crate) fn fail(&self, status: u16) {
        self.responses.lock().push_back(Err(status));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceSource for MockPresence {
    async fn online_user_ids(&self) -> Result<Vec<UserId>, ApiError> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock();
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        match next {
            Some(Ok(ids)) => Ok(ids),
            Some(Err(status)) => Err(ApiError::Status {
                status,
                body: String::new(),
            }),
            None => Ok(Vec::new()),
        }
    }
}
