//! Auto-reconnecting live socket client.
//!
//! `Idle -> Connecting -> Open -> Retrying -> Connecting ...`, with `close()`
//! terminal from any phase. Every inbound payload is a whole fleet snapshot
//! and replaces the store's copy.

use crate::store::{key, StatePatch, Store};
use crate::timers::{Scheduler, TimerHandle};
use crate::transport::{Connection, ConnectionId, Connector, ReadyState, StreamEvent};
use chrono::Utc;
use fleet_core::wire::{decode_snapshot_with_limit, DEFAULT_MAX_FRAME_BYTES};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Connection status surface: the live/offline dot, the offline banner and
/// the stale-data banner.
pub trait StatusIndicator {
    fn show_live(&self);
    fn show_offline(&self);
    fn show_stale(&self, age: Duration);
    fn hide_stale(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub stale_after: Duration,
    pub stale_check_interval: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            stale_after: Duration::from_secs(30),
            stale_check_interval: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// `base * 2^failures`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    2u32.checked_pow(failures)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Open,
    Retrying,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Retrying => "retrying",
        }
    }
}

pub struct DuplexClient {
    me: Weak<DuplexClient>,
    endpoint: Url,
    config: SyncConfig,
    store: Store,
    connector: Rc<dyn Connector>,
    scheduler: Rc<dyn Scheduler>,
    indicator: Rc<dyn StatusIndicator>,
    phase: Cell<ConnectionPhase>,
    failures: Cell<u32>,
    current: RefCell<Option<(ConnectionId, Box<dyn Connection>)>>,
    retry: RefCell<Option<TimerHandle>>,
    retry_delay: Cell<Option<Duration>>,
    watchdog: RefCell<Option<TimerHandle>>,
    last_data_at: Cell<Option<Duration>>,
    stale: Cell<bool>,
}

impl DuplexClient {
    pub fn new(
        endpoint: Url,
        config: SyncConfig,
        store: Store,
        connector: Rc<dyn Connector>,
        scheduler: Rc<dyn Scheduler>,
        indicator: Rc<dyn StatusIndicator>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            endpoint,
            config,
            store,
            connector,
            scheduler,
            indicator,
            phase: Cell::new(ConnectionPhase::Idle),
            failures: Cell::new(0),
            current: RefCell::new(None),
            retry: RefCell::new(None),
            retry_delay: Cell::new(None),
            watchdog: RefCell::new(None),
            last_data_at: Cell::new(None),
            stale: Cell::new(false),
        })
    }

    /// Opens a fresh connection, closing any previous one and dropping a
    /// pending retry first.
    pub fn connect(&self) {
        self.cancel_retry();
        self.drop_connection();

        let id = ConnectionId::next();
        info!(event = "connect", conn_id = %id, endpoint = %self.endpoint);
        self.phase.set(ConnectionPhase::Connecting);
        let connection = self.connector.open(id, &self.endpoint);
        *self.current.borrow_mut() = Some((id, connection));
        self.ensure_watchdog();
    }

    /// Terminal shutdown: no retry is scheduled afterwards and every timer
    /// this client owns is cancelled.
    pub fn close(&self) {
        self.cancel_retry();
        if let Some(handle) = self.watchdog.borrow_mut().take() {
            handle.cancel();
        }
        let had_connection = self.drop_connection();
        self.phase.set(ConnectionPhase::Idle);
        if had_connection {
            info!(event = "close", endpoint = %self.endpoint);
        }
        self.store.update(
            StatePatch::new()
                .with::<key::Connected>(false)
                .with::<key::ConnectedAt>(None),
        );
    }

    pub fn handle_event(&self, id: ConnectionId, event: StreamEvent) {
        if self.current_id() != Some(id) {
            debug!(event = "superseded_event", conn_id = %id);
            return;
        }
        match event {
            StreamEvent::Open => self.on_open(id),
            StreamEvent::Message(payload) => self.on_message(id, &payload),
            StreamEvent::Error(reason) => self.on_failure(id, &reason),
            StreamEvent::Closed => self.on_failure(id, "closed"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current
            .borrow()
            .as_ref()
            .map(|(_, connection)| connection.ready_state() == ReadyState::Open)
            .unwrap_or(false)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.get()
    }

    pub fn failures(&self) -> u32 {
        self.failures.get()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.get()
    }

    /// Delay of the reconnect currently waiting to fire.
    pub fn pending_retry_delay(&self) -> Option<Duration> {
        let pending = self
            .retry
            .borrow()
            .as_ref()
            .map(TimerHandle::is_pending)
            .unwrap_or(false);
        if pending {
            self.retry_delay.get()
        } else {
            None
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.current.borrow().as_ref().map(|(id, _)| *id)
    }

    fn on_open(&self, id: ConnectionId) {
        info!(event = "ws_open", conn_id = %id, recovered_after = self.failures.get());
        self.phase.set(ConnectionPhase::Open);
        self.failures.set(0);
        self.indicator.show_live();
        self.store.update(
            StatePatch::new()
                .with::<key::Connected>(true)
                .with::<key::ConnectedAt>(Some(Utc::now().timestamp_millis())),
        );
    }

    fn on_message(&self, id: ConnectionId, payload: &str) {
        let snapshot = match decode_snapshot_with_limit(payload, self.config.max_frame_bytes) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(event = "snapshot_decode_error", conn_id = %id, error = %err);
                return;
            }
        };
        self.last_data_at.set(Some(self.scheduler.now()));
        if self.stale.replace(false) {
            info!(event = "stale_cleared", conn_id = %id);
            self.indicator.hide_stale();
        }
        self.store.update(
            StatePatch::new()
                .with::<key::Fleet>(Some(Rc::new(snapshot)))
                .with::<key::FirstRender>(false),
        );
    }

    fn on_failure(&self, id: ConnectionId, reason: &str) {
        self.drop_connection();
        self.phase.set(ConnectionPhase::Retrying);
        self.store.update(
            StatePatch::new()
                .with::<key::Connected>(false)
                .with::<key::ConnectedAt>(None),
        );
        self.indicator.show_offline();

        let failures = self.failures.get();
        let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, failures);
        self.failures.set(failures.saturating_add(1));
        warn!(
            event = "ws_close",
            conn_id = %id,
            reason,
            failures = failures + 1,
            retry_ms = delay.as_millis() as u64
        );

        let me = self.me.clone();
        let handle = self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(client) = me.upgrade() {
                    client.retry.borrow_mut().take();
                    client.connect();
                }
            }),
        );
        self.cancel_retry();
        *self.retry.borrow_mut() = Some(handle);
        self.retry_delay.set(Some(delay));
    }

    fn ensure_watchdog(&self) {
        let running = self
            .watchdog
            .borrow()
            .as_ref()
            .map(TimerHandle::is_pending)
            .unwrap_or(false);
        if running {
            return;
        }
        let me = self.me.clone();
        let handle = self.scheduler.schedule_repeating(
            self.config.stale_check_interval,
            Box::new(move || {
                if let Some(client) = me.upgrade() {
                    client.check_staleness();
                }
            }),
        );
        *self.watchdog.borrow_mut() = Some(handle);
    }

    fn check_staleness(&self) {
        let Some(last) = self.last_data_at.get() else {
            return;
        };
        let age = self.scheduler.now().saturating_sub(last);
        if age < self.config.stale_after {
            return;
        }
        if !self.stale.replace(true) {
            warn!(event = "stale_data", age_secs = age.as_secs());
        }
        self.indicator.show_stale(age);
    }

    fn cancel_retry(&self) {
        if let Some(handle) = self.retry.borrow_mut().take() {
            handle.cancel();
        }
        self.retry_delay.set(None);
    }

    fn drop_connection(&self) -> bool {
        let previous = self.current.borrow_mut().take();
        match previous {
            Some((id, connection)) => {
                debug!(event = "connection_dropped", conn_id = %id, state = connection.ready_state().as_str());
                connection.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for DuplexClient {
    fn drop(&mut self) {
        if let Some(handle) = self.retry.get_mut().take() {
            handle.cancel();
        }
        if let Some(handle) = self.watchdog.get_mut().take() {
            handle.cancel();
        }
        if let Some((_, connection)) = self.current.get_mut().take() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Connectivity, PanelBoard};
    use crate::store::key::{Connected, ConnectedAt, FirstRender, Fleet};
    use crate::test_support::MockConnector;
    use crate::timers::TimerQueue;

    struct Harness {
        store: Store,
        queue: TimerQueue,
        connector: Rc<MockConnector>,
        board: Rc<PanelBoard>,
        client: Rc<DuplexClient>,
    }

    fn harness() -> Harness {
        let store = Store::new();
        let queue = TimerQueue::new();
        let connector = Rc::new(MockConnector::default());
        let board = Rc::new(PanelBoard::new());
        let client = DuplexClient::new(
            Url::parse("ws://localhost:8767/ws").expect("url"),
            SyncConfig::default(),
            store.clone(),
            connector.clone(),
            Rc::new(queue.clone()),
            board.clone(),
        );
        Harness {
            store,
            queue,
            connector,
            board,
            client,
        }
    }

    fn deliver(h: &Harness, event: StreamEvent) {
        let id = h.client.current_id().expect("live connection");
        h.client.handle_event(id, event);
    }

    fn open(h: &Harness) {
        h.connector.last().set_open();
        deliver(h, StreamEvent::Open);
    }

    const SNAPSHOT: &str = r#"{"pipelines":[{"issue":42,"title":"Fix login","status":"running"}]}"#;

    #[test]
    fn backoff_doubles_from_base_and_stops_at_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(30));
        assert_eq!(backoff_delay(base, max, 64), Duration::from_secs(30));
    }

    #[test]
    fn retry_delays_grow_and_reset_after_open() {
        let h = harness();
        h.client.connect();
        assert_eq!(h.client.phase(), ConnectionPhase::Connecting);

        deliver(&h, StreamEvent::Closed);
        assert_eq!(h.client.phase(), ConnectionPhase::Retrying);
        assert_eq!(h.client.pending_retry_delay(), Some(Duration::from_millis(1000)));
        h.queue.advance(Duration::from_millis(999));
        assert_eq!(h.connector.opened(), 1);
        h.queue.advance(Duration::from_millis(1));
        assert_eq!(h.connector.opened(), 2);

        deliver(&h, StreamEvent::Closed);
        assert_eq!(h.client.pending_retry_delay(), Some(Duration::from_millis(2000)));
        h.queue.advance(Duration::from_millis(2000));
        assert_eq!(h.connector.opened(), 3);

        open(&h);
        assert_eq!(h.client.failures(), 0);
        deliver(&h, StreamEvent::Closed);
        assert_eq!(h.client.pending_retry_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn connect_closes_prior_connection_first() {
        let h = harness();
        h.client.connect();
        let first = h.connector.last();
        open(&h);
        h.client.connect();
        assert_eq!(first.close_calls(), 1);
        assert_eq!(h.connector.opened(), 2);
        assert_eq!(h.connector.live(), 1);

        h.client.connect();
        assert_eq!(h.connector.live(), 1);
    }

    #[test]
    fn manual_connect_cancels_pending_retry() {
        let h = harness();
        h.client.connect();
        deliver(&h, StreamEvent::Closed);
        h.client.connect();
        assert_eq!(h.client.pending_retry_delay(), None);
        h.queue.advance(Duration::from_secs(5));
        assert_eq!(h.connector.opened(), 2);
    }

    #[test]
    fn open_and_close_drive_store_and_indicator() {
        let h = harness();
        h.client.connect();
        open(&h);
        assert!(h.store.get::<Connected>());
        assert!(h.store.get::<ConnectedAt>().is_some_and(|at| at > 0));
        assert_eq!(h.board.connectivity(), Connectivity::Live);
        assert!(!h.board.offline_banner_visible());
        assert!(h.client.is_connected());

        deliver(&h, StreamEvent::Error("connection reset".to_string()));
        assert!(!h.store.get::<Connected>());
        assert_eq!(h.store.get::<ConnectedAt>(), None);
        assert_eq!(h.board.connectivity(), Connectivity::Offline);
        assert!(h.board.offline_banner_visible());
        assert!(!h.client.is_connected());

        h.queue.advance(Duration::from_secs(1));
        open(&h);
        assert!(!h.board.offline_banner_visible());
    }

    #[test]
    fn error_then_close_for_same_connection_counts_once() {
        let h = harness();
        h.client.connect();
        let id = h.client.current_id().expect("id");
        h.client.handle_event(id, StreamEvent::Error("refused".to_string()));
        h.client.handle_event(id, StreamEvent::Closed);
        assert_eq!(h.client.failures(), 1);
        assert_eq!(h.queue.pending(), 2);
    }

    #[test]
    fn events_from_superseded_connection_are_ignored() {
        let h = harness();
        h.client.connect();
        let stale_id = h.client.current_id().expect("id");
        h.client.connect();
        h.client.handle_event(stale_id, StreamEvent::Closed);
        h.client
            .handle_event(stale_id, StreamEvent::Message(SNAPSHOT.to_string()));
        assert_eq!(h.client.phase(), ConnectionPhase::Connecting);
        assert_eq!(h.client.failures(), 0);
        assert!(h.store.get::<Fleet>().is_none());
    }

    #[test]
    fn message_replaces_snapshot_and_clears_first_render() {
        let h = harness();
        h.client.connect();
        open(&h);
        assert!(h.store.get::<FirstRender>());

        deliver(&h, StreamEvent::Message(SNAPSHOT.to_string()));
        let first = h.store.get::<Fleet>().expect("snapshot");
        assert_eq!(first.pipelines[0].issue, "42");
        assert!(!h.store.get::<FirstRender>());

        deliver(&h, StreamEvent::Message(r#"{"machines":[]}"#.to_string()));
        let second = h.store.get::<Fleet>().expect("snapshot");
        assert!(second.pipelines.is_empty());
        assert!(!Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn malformed_payload_leaves_snapshot_untouched() {
        let h = harness();
        h.client.connect();
        open(&h);
        deliver(&h, StreamEvent::Message(SNAPSHOT.to_string()));
        let before = h.store.get::<Fleet>().expect("snapshot");

        deliver(&h, StreamEvent::Message("not json{{{".to_string()));
        deliver(&h, StreamEvent::Message("[1,2]".to_string()));

        let after = h.store.get::<Fleet>().expect("snapshot");
        assert!(Rc::ptr_eq(&before, &after));
        assert_eq!(h.client.phase(), ConnectionPhase::Open);
    }

    #[test]
    fn malformed_first_payload_keeps_store_empty() {
        let h = harness();
        h.client.connect();
        open(&h);
        deliver(&h, StreamEvent::Message("not json{{{".to_string()));
        assert!(h.store.get::<Fleet>().is_none());
        assert!(h.store.get::<FirstRender>());
    }

    #[test]
    fn watchdog_flags_stale_data_and_next_message_clears_it() {
        let h = harness();
        h.client.connect();
        open(&h);
        deliver(&h, StreamEvent::Message(SNAPSHOT.to_string()));

        h.queue.advance(Duration::from_secs(25));
        assert!(!h.client.is_stale());
        assert_eq!(h.board.stale_age(), None);

        h.queue.advance(Duration::from_secs(10));
        assert!(h.client.is_stale());
        assert!(h.board.stale_age().is_some_and(|age| age >= Duration::from_secs(30)));

        deliver(&h, StreamEvent::Message(SNAPSHOT.to_string()));
        assert!(!h.client.is_stale());
        assert_eq!(h.board.stale_age(), None);
    }

    #[test]
    fn watchdog_stays_quiet_before_first_message() {
        let h = harness();
        h.client.connect();
        open(&h);
        h.queue.advance(Duration::from_secs(120));
        assert!(!h.client.is_stale());
    }

    #[test]
    fn close_is_terminal_and_cancels_every_timer() {
        let h = harness();
        h.client.connect();
        open(&h);
        let live = h.connector.last();
        deliver(&h, StreamEvent::Closed);
        assert_eq!(live.close_calls(), 1);
        assert!(h.queue.pending() > 0);

        h.client.close();
        assert_eq!(h.queue.pending(), 0);
        assert_eq!(h.client.phase(), ConnectionPhase::Idle);
        h.queue.advance(Duration::from_secs(120));
        assert_eq!(h.connector.opened(), 1);
        assert!(!h.client.is_connected());
    }

    #[test]
    fn close_while_open_disconnects_without_retry() {
        let h = harness();
        h.client.connect();
        open(&h);
        let live = h.connector.last();
        h.client.close();
        assert_eq!(live.close_calls(), 1);
        assert!(!h.store.get::<Connected>());
        h.queue.advance(Duration::from_secs(60));
        assert_eq!(h.connector.opened(), 1);
    }
}
