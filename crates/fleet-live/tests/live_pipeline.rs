use fleet_core::{FleetState, TabId};
use fleet_live::{
    key, Connection, ConnectionId, Connector, Connectivity, DuplexClient, PanelBoard,
    ReadyState, Router, RouterInput, Scheduler, Store, StreamEvent, SyncConfig, TimerQueue, View,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use url::Url;

struct SocketStub {
    state: Rc<Cell<ReadyState>>,
}

impl Connection for SocketStub {
    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn close(&self) {
        self.state.set(ReadyState::Closed);
    }
}

#[derive(Default)]
struct StubConnector {
    sockets: RefCell<Vec<(ConnectionId, Rc<Cell<ReadyState>>)>>,
}

impl StubConnector {
    fn latest(&self) -> (ConnectionId, Rc<Cell<ReadyState>>) {
        self.sockets.borrow().last().cloned().expect("socket opened")
    }
}

impl Connector for StubConnector {
    fn open(&self, id: ConnectionId, _endpoint: &Url) -> Box<dyn Connection> {
        let state = Rc::new(Cell::new(ReadyState::Connecting));
        self.sockets.borrow_mut().push((id, state.clone()));
        Box::new(SocketStub { state })
    }
}

#[derive(Default)]
struct PipelineCounter {
    board: RefCell<Option<Rc<PanelBoard>>>,
    renders: Cell<u32>,
    fail_next_render: Cell<bool>,
}

impl View for PipelineCounter {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&self, snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        self.renders.set(self.renders.get() + 1);
        if self.fail_next_render.replace(false) {
            anyhow::bail!("pipelines table failed to draw");
        }
        if let Some(board) = self.board.borrow().as_ref() {
            board.set_lines(
                TabId::Pipelines,
                vec![format!("{} pipelines", snapshot.pipelines.len())],
            );
        }
        Ok(())
    }
}

struct Dashboard {
    store: Store,
    queue: TimerQueue,
    board: Rc<PanelBoard>,
    connector: Rc<StubConnector>,
    router: Rc<Router>,
    client: Rc<DuplexClient>,
    pipelines: Rc<PipelineCounter>,
}

fn dashboard(fragment: &str) -> Dashboard {
    let store = Store::new();
    let queue = TimerQueue::new();
    let board = Rc::new(PanelBoard::with_fragment(fragment));
    let connector = Rc::new(StubConnector::default());
    let router = Router::new(store.clone(), board.clone());
    let pipelines = Rc::new(PipelineCounter::default());
    *pipelines.board.borrow_mut() = Some(board.clone());
    router.register_view(TabId::Pipelines, pipelines.clone());
    let client = DuplexClient::new(
        Url::parse("ws://127.0.0.1:8767/ws").expect("url"),
        SyncConfig::default(),
        store.clone(),
        connector.clone(),
        Rc::new(queue.clone()),
        board.clone(),
    );
    router.setup_router();
    Dashboard {
        store,
        queue,
        board,
        connector,
        router,
        client,
        pipelines,
    }
}

fn open(d: &Dashboard) -> ConnectionId {
    let (id, state) = d.connector.latest();
    state.set(ReadyState::Open);
    d.client.handle_event(id, StreamEvent::Open);
    id
}

fn snapshot(issues: &[u64]) -> String {
    let pipelines = issues
        .iter()
        .map(|issue| serde_json::json!({"issue": issue, "title": "t", "status": "running"}))
        .collect::<Vec<_>>();
    serde_json::json!({ "pipelines": pipelines }).to_string()
}

#[test]
fn snapshots_flow_from_socket_to_active_view() {
    let d = dashboard("#pipelines");
    assert_eq!(d.store.get::<key::ActiveTab>(), TabId::Pipelines);

    d.client.connect();
    let id = open(&d);
    assert_eq!(d.board.connectivity(), Connectivity::Live);

    d.client
        .handle_event(id, StreamEvent::Message(snapshot(&[1, 2, 3])));
    assert_eq!(d.pipelines.renders.get(), 1);
    assert_eq!(d.board.lines(TabId::Pipelines), vec!["3 pipelines"]);
    assert!(!d.store.get::<key::FirstRender>());

    d.client
        .handle_event(id, StreamEvent::Message("garbage".to_string()));
    assert_eq!(d.pipelines.renders.get(), 1);
}

#[test]
fn background_tabs_do_not_render_on_snapshot() {
    let d = dashboard("");
    d.client.connect();
    let id = open(&d);
    d.client.handle_event(id, StreamEvent::Message(snapshot(&[1])));
    assert_eq!(d.pipelines.renders.get(), 0);

    d.router
        .handle_input(RouterInput::TabSelected(Some("pipelines".to_string())));
    assert_eq!(d.pipelines.renders.get(), 1);
}

#[test]
fn view_failure_is_isolated_from_transport_and_recovers_on_retry() {
    let d = dashboard("#pipelines");
    d.client.connect();
    let id = open(&d);

    d.pipelines.fail_next_render.set(true);
    d.client.handle_event(id, StreamEvent::Message(snapshot(&[1])));
    assert_eq!(
        d.board.boundary_messages(TabId::Pipelines),
        vec!["pipelines table failed to draw"]
    );
    assert!(d.client.is_connected());
    assert!(d.store.get::<key::Connected>());

    d.router
        .handle_input(RouterInput::RetryRequested(TabId::Pipelines));
    assert!(d.board.boundary_messages(TabId::Pipelines).is_empty());
    assert_eq!(d.board.lines(TabId::Pipelines), vec!["1 pipelines"]);
}

#[test]
fn outage_goes_offline_backs_off_and_recovers() {
    let d = dashboard("");
    d.client.connect();
    let first = open(&d);
    d.client.handle_event(first, StreamEvent::Message(snapshot(&[7])));

    d.client.handle_event(first, StreamEvent::Closed);
    assert!(d.board.offline_banner_visible());
    assert!(!d.store.get::<key::Connected>());
    assert!(d.store.get::<key::Fleet>().is_some());

    let (refused, _) = {
        d.queue.advance(Duration::from_secs(1));
        d.connector.latest()
    };
    d.client.handle_event(refused, StreamEvent::Error("refused".to_string()));
    d.queue.advance(Duration::from_millis(1999));
    assert_eq!(d.connector.sockets.borrow().len(), 2);
    d.queue.advance(Duration::from_millis(1));
    assert_eq!(d.connector.sockets.borrow().len(), 3);

    open(&d);
    assert!(!d.board.offline_banner_visible());
    assert!(d.store.get::<key::Connected>());
    assert_eq!(d.client.failures(), 0);

    d.queue.advance(Duration::from_secs(40));
    assert!(d.client.is_stale());
    assert!(d.board.stale_age().is_some());
    assert!(d.queue.now() >= Duration::from_secs(43));
}
