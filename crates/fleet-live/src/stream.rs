//! One-way event stream client. Payloads go to the caller untouched and
//! nothing reconnects on its own; callers that want that call `connect()`
//! again from their error callback.

use crate::transport::{Connection, ConnectionId, Connector, ReadyState, StreamEvent};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream transport error: {0}")]
    Transport(String),
    #[error("stream ended")]
    Ended,
}

pub type MessageCallback = Box<dyn FnMut(&str)>;
pub type ErrorCallback = Box<dyn FnMut(&StreamError)>;

pub struct StreamClient {
    endpoint: Url,
    connector: Rc<dyn Connector>,
    on_message: RefCell<MessageCallback>,
    on_error: RefCell<Option<ErrorCallback>>,
    current: RefCell<Option<(ConnectionId, Box<dyn Connection>)>>,
}

impl StreamClient {
    pub fn new(
        endpoint: Url,
        connector: Rc<dyn Connector>,
        on_message: MessageCallback,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            endpoint,
            connector,
            on_message: RefCell::new(on_message),
            on_error: RefCell::new(on_error),
            current: RefCell::new(None),
        }
    }

    pub fn connect(&self) {
        self.close();
        let id = ConnectionId::next();
        info!(event = "stream_connect", conn_id = %id, endpoint = %self.endpoint);
        let connection = self.connector.open(id, &self.endpoint);
        *self.current.borrow_mut() = Some((id, connection));
    }

    pub fn close(&self) {
        let previous = self.current.borrow_mut().take();
        if let Some((id, connection)) = previous {
            debug!(event = "stream_close", conn_id = %id);
            connection.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .borrow()
            .as_ref()
            .map(|(_, connection)| connection.ready_state() == ReadyState::Open)
            .unwrap_or(false)
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.current.borrow().as_ref().map(|(id, _)| *id)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn handle_event(&self, id: ConnectionId, event: StreamEvent) {
        if self.current_id() != Some(id) {
            return;
        }
        match event {
            StreamEvent::Open => debug!(event = "stream_open", conn_id = %id),
            StreamEvent::Message(payload) => (self.on_message.borrow_mut())(&payload),
            StreamEvent::Error(reason) => self.report(StreamError::Transport(reason)),
            StreamEvent::Closed => self.report(StreamError::Ended),
        }
    }

    fn report(&self, error: StreamError) {
        debug!(event = "stream_error", endpoint = %self.endpoint, error = %error);
        if let Some(callback) = self.on_error.borrow_mut().as_mut() {
            callback(&error);
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some((_, connection)) = self.current.get_mut().take() {
            connection.close();
        }
    }
}
