//! Tokio transports behind the core's `Connector` seam. Each connection runs
//! in its own task that only owns channel senders and atomics; lifecycle
//! events go back to the main loop tagged with their connection id.

use fleet_core::wire::SseFrameDecoder;
use fleet_live::{Connection, ConnectionId, Connector, ReadyState, StreamEvent};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Debug)]
pub struct TransportEvent {
    pub id: ConnectionId,
    pub event: StreamEvent,
}

fn decode_state(raw: u8) -> ReadyState {
    match raw {
        STATE_CONNECTING => ReadyState::Connecting,
        STATE_OPEN => ReadyState::Open,
        STATE_CLOSING => ReadyState::Closing,
        _ => ReadyState::Closed,
    }
}

struct TaskConnection {
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
}

impl TaskConnection {
    fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(Arc<AtomicU8>, Arc<Notify>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let shutdown = Arc::new(Notify::new());
        tokio::spawn(run(state.clone(), shutdown.clone()));
        Self { state, shutdown }
    }
}

impl Connection for TaskConnection {
    fn ready_state(&self) -> ReadyState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    fn close(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPEN,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.state.compare_exchange(
            STATE_CONNECTING,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shutdown.notify_one();
    }
}

/// False when the owner already asked the connection to close.
fn mark_open(state: &AtomicU8) -> bool {
    state
        .compare_exchange(
            STATE_CONNECTING,
            STATE_OPEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

async fn emit(tx: &mpsc::Sender<TransportEvent>, id: ConnectionId, event: StreamEvent) -> bool {
    tx.send(TransportEvent { id, event }).await.is_ok()
}

/// Live snapshot socket over tokio-tungstenite.
pub struct WsConnector {
    events: mpsc::Sender<TransportEvent>,
}

impl WsConnector {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self { events }
    }
}

impl Connector for WsConnector {
    fn open(&self, id: ConnectionId, endpoint: &Url) -> Box<dyn Connection> {
        let tx = self.events.clone();
        let endpoint = endpoint.to_string();
        Box::new(TaskConnection::spawn(move |state, shutdown| {
            run_socket(id, endpoint, tx, state, shutdown)
        }))
    }
}

async fn run_socket(
    id: ConnectionId,
    endpoint: String,
    tx: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
) {
    let connect = tokio::select! {
        result = connect_async(endpoint) => result,
        _ = shutdown.notified() => {
            state.store(STATE_CLOSED, Ordering::Release);
            return;
        }
    };
    let mut ws = match connect {
        Ok((ws, _)) => ws,
        Err(err) => {
            state.store(STATE_CLOSED, Ordering::Release);
            emit(&tx, id, StreamEvent::Error(err.to_string())).await;
            return;
        }
    };
    if !mark_open(&state) {
        let _ = ws.close(None).await;
        state.store(STATE_CLOSED, Ordering::Release);
        return;
    }
    if !emit(&tx, id, StreamEvent::Open).await {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                state.store(STATE_CLOSING, Ordering::Release);
                let _ = ws.close(None).await;
                state.store(STATE_CLOSED, Ordering::Release);
                return;
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !emit(&tx, id, StreamEvent::Message(text)).await {
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if !emit(&tx, id, StreamEvent::Message(text)).await {
                            return;
                        }
                    }
                    Err(err) => warn!(event = "ws_binary_frame", conn_id = %id, error = %err),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    state.store(STATE_CLOSED, Ordering::Release);
                    emit(&tx, id, StreamEvent::Error(err.to_string())).await;
                    return;
                }
            }
        }
    }

    state.store(STATE_CLOSED, Ordering::Release);
    emit(&tx, id, StreamEvent::Closed).await;
}

/// `text/event-stream` reader over reqwest.
pub struct SseConnector {
    http: reqwest::Client,
    events: mpsc::Sender<TransportEvent>,
}

impl SseConnector {
    pub fn new(http: reqwest::Client, events: mpsc::Sender<TransportEvent>) -> Self {
        Self { http, events }
    }
}

impl Connector for SseConnector {
    fn open(&self, id: ConnectionId, endpoint: &Url) -> Box<dyn Connection> {
        let tx = self.events.clone();
        let http = self.http.clone();
        let endpoint = endpoint.clone();
        Box::new(TaskConnection::spawn(move |state, shutdown| {
            run_event_stream(id, http, endpoint, tx, state, shutdown)
        }))
    }
}

async fn run_event_stream(
    id: ConnectionId,
    http: reqwest::Client,
    endpoint: Url,
    tx: mpsc::Sender<TransportEvent>,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
) {
    let request = http
        .get(endpoint)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send();
    let response = tokio::select! {
        result = request => result,
        _ = shutdown.notified() => {
            state.store(STATE_CLOSED, Ordering::Release);
            return;
        }
    };
    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            state.store(STATE_CLOSED, Ordering::Release);
            let reason = format!("unexpected status {}", response.status());
            emit(&tx, id, StreamEvent::Error(reason)).await;
            return;
        }
        Err(err) => {
            state.store(STATE_CLOSED, Ordering::Release);
            emit(&tx, id, StreamEvent::Error(err.to_string())).await;
            return;
        }
    };
    if !mark_open(&state) {
        state.store(STATE_CLOSED, Ordering::Release);
        return;
    }
    if !emit(&tx, id, StreamEvent::Open).await {
        return;
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseFrameDecoder::default();
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                state.store(STATE_CLOSED, Ordering::Release);
                return;
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    let report = decoder.push_chunk(&bytes);
                    for err in report.errors {
                        warn!(event = "sse_decode_error", conn_id = %id, error = %err);
                    }
                    for frame in report.frames {
                        if !emit(&tx, id, StreamEvent::Message(frame.data)).await {
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    state.store(STATE_CLOSED, Ordering::Release);
                    emit(&tx, id, StreamEvent::Error(err.to_string())).await;
                    return;
                }
                None => break,
            }
        }
    }

    for err in decoder.finish().errors {
        debug!(event = "sse_decode_error", conn_id = %id, error = %err);
    }
    state.store(STATE_CLOSED, Ordering::Release);
    emit(&tx, id, StreamEvent::Closed).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiResource {
    Team,
    Metrics,
}

impl ApiResource {
    pub fn path(&self) -> &'static str {
        match self {
            ApiResource::Team => "/api/team",
            ApiResource::Metrics => "/api/metrics/history",
        }
    }
}

#[derive(Debug)]
pub struct ApiReply {
    pub resource: ApiResource,
    pub result: Result<Value, String>,
}

/// One-shot JSON queries; replies come back through the main loop.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    replies: mpsc::Sender<ApiReply>,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base: Url, replies: mpsc::Sender<ApiReply>) -> Self {
        Self {
            http,
            base,
            replies,
        }
    }

    pub fn fetch(&self, resource: ApiResource) {
        let url = match self.base.join(resource.path()) {
            Ok(url) => url,
            Err(err) => {
                warn!(event = "api_url_error", path = resource.path(), error = %err);
                return;
            }
        };
        let http = self.http.clone();
        let replies = self.replies.clone();
        tokio::spawn(async move {
            let result = fetch_json(&http, url).await;
            let _ = replies.send(ApiReply { resource, result }).await;
        });
    }
}

async fn fetch_json(http: &reqwest::Client, url: Url) -> Result<Value, String> {
    let response = http.get(url).send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("unexpected status {status}"));
    }
    let body = response.bytes().await.map_err(|err| err.to_string())?;
    serde_json::from_slice(&body).map_err(|err| err.to_string())
}
