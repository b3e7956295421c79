//! Seam between the stream clients and whatever moves bytes.
//!
//! A [`Connector`] opens connections and the host feeds their lifecycle back
//! as [`StreamEvent`]s tagged with the [`ConnectionId`] they belong to.
//! Clients drop events whose id is no longer current.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique, so events from several clients can share one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

pub trait Connection {
    fn ready_state(&self) -> ReadyState;
    /// Must be safe to call more than once and after the peer went away.
    fn close(&self);
}

pub trait Connector {
    fn open(&self, id: ConnectionId, endpoint: &Url) -> Box<dyn Connection>;
}
