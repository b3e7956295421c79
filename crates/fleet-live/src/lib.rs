//! Live-state sync core for the fleet dashboard: reactive store, stream
//! clients and the tab router. Everything here is single-threaded; hosts
//! pump transport events and timer deadlines into it from one loop.

pub mod board;
pub mod duplex;
pub mod router;
pub mod store;
pub mod stream;
pub mod timers;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use board::{Connectivity, PanelBoard};
pub use duplex::{ConnectionPhase, DuplexClient, StatusIndicator, SyncConfig};
pub use router::{RefreshTasks, Router, RouterInput, TabPresenter, View};
pub use store::{key, AppState, StatePatch, StateKey, Store, Subscription};
pub use stream::{StreamClient, StreamError};
pub use timers::{Scheduler, TimerHandle, TimerQueue};
pub use transport::{Connection, ConnectionId, Connector, ReadyState, StreamEvent};
