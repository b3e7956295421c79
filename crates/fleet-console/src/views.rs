use crate::net::{ApiClient, ApiResource};
use crate::ui::ellipsize;
use fleet_core::{FleetState, PipelineInfo, TabId};
use fleet_live::stream::{ErrorCallback, MessageCallback};
use fleet_live::{
    key, ConnectionId, Connector, PanelBoard, RefreshTasks, Router, Scheduler, Store,
    StreamClient, StreamError, StreamEvent, Subscription, TimerHandle, View,
};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;
use url::Url;

const ACTIVITY_LIMIT: usize = 200;
const ACTIVITY_RECONNECT: Duration = Duration::from_secs(5);
const TEAM_REFRESH: Duration = Duration::from_secs(10);
const VALUE_WIDTH: usize = 96;

pub const PIPELINE_FILTERS: [&str; 5] = ["all", "active", "running", "failed", "completed"];

/// Source of one-shot API reads; the console backs it with HTTP.
pub trait Fetcher {
    fn fetch(&self, resource: ApiResource);
}

impl Fetcher for ApiClient {
    fn fetch(&self, resource: ApiResource) {
        ApiClient::fetch(self, resource)
    }
}

pub struct OverviewView {
    board: Rc<PanelBoard>,
}

impl View for OverviewView {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&self, snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        let mut lines = Vec::new();
        if let Some(daemon) = &snapshot.daemon {
            lines.push(format!(
                "Daemon: up {} | {}/{} jobs | queue {}",
                format_elapsed(daemon.uptime_s.unwrap_or(0)),
                daemon.active_jobs.unwrap_or(0),
                daemon.max_parallel.unwrap_or(0),
                daemon.queue_depth.unwrap_or(0),
            ));
        } else {
            lines.push("Daemon: no status reported".to_string());
        }
        lines.push(format!(
            "Pipelines: {} active / {} total",
            snapshot.active_pipelines(),
            snapshot.pipelines.len()
        ));
        lines.push(format!("Queue: {} waiting", snapshot.queue.len()));
        lines.push(format!(
            "Machines: {}/{} online",
            snapshot.online_machines(),
            snapshot.machines.len()
        ));
        if let Some(timestamp) = &snapshot.timestamp {
            lines.push(format!("Snapshot: {timestamp}"));
        }
        for item in snapshot.queue.iter().take(5) {
            let score = item
                .score
                .map(|score| format!("{score:.1}"))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!("  next #{} [{score}] {}", item.issue, item.title));
        }
        self.board.set_lines(TabId::Overview, lines);
        Ok(())
    }
}

pub struct PipelinesView {
    store: Store,
    board: Rc<PanelBoard>,
}

impl View for PipelinesView {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&self, snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        let filter = self.store.get::<key::PipelineFilter>();
        let selected = self.store.get::<key::SelectedPipelineIssue>();
        let mut lines = vec![format!("Filter: {filter} (f to cycle)")];
        let mut shown = 0;
        for pipeline in snapshot
            .pipelines
            .iter()
            .filter(|pipeline| pipeline_matches(&filter, pipeline))
        {
            let marker = match selected {
                Some(issue) if pipeline.issue == issue.to_string() => ">",
                _ => " ",
            };
            lines.push(format!(
                "{marker} #{:<6} {:<10} {:<12} {:>8}  {}",
                pipeline.issue,
                ellipsize(&pipeline.status, 10),
                ellipsize(pipeline.stage.as_deref().unwrap_or("-"), 12),
                pipeline
                    .elapsed_s
                    .map(format_elapsed)
                    .unwrap_or_else(|| "-".to_string()),
                pipeline.title
            ));
            shown += 1;
        }
        if shown == 0 {
            lines.push("No pipelines match.".to_string());
        }
        self.board.set_lines(TabId::Pipelines, lines);
        Ok(())
    }
}

pub fn pipeline_matches(filter: &str, pipeline: &PipelineInfo) -> bool {
    match filter {
        "" | "all" => true,
        "active" => !pipeline.is_finished(),
        other => pipeline.status.eq_ignore_ascii_case(other),
    }
}

pub fn next_pipeline_filter(current: &str) -> String {
    let index = PIPELINE_FILTERS
        .iter()
        .position(|filter| *filter == current)
        .map(|index| (index + 1) % PIPELINE_FILTERS.len())
        .unwrap_or(0);
    PIPELINE_FILTERS[index].to_string()
}

pub struct MachinesView {
    board: Rc<PanelBoard>,
}

impl View for MachinesView {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&self, snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        let mut lines: Vec<String> = snapshot
            .machines
            .iter()
            .map(|machine| {
                format!(
                    "{:<20} {:<8} {}/{} workers  last seen {}",
                    ellipsize(&machine.name, 20),
                    machine.status,
                    machine.active_jobs,
                    machine.max_workers,
                    machine.last_heartbeat.as_deref().unwrap_or("never")
                )
            })
            .collect();
        if lines.is_empty() {
            lines.push("No machines registered.".to_string());
        }
        self.board.set_lines(TabId::Machines, lines);
        Ok(())
    }
}

/// Activity feed over the one-way event stream. The stream never
/// reconnects itself, so this view does it on a fixed delay while active.
pub struct ActivityView {
    store: Store,
    board: Rc<PanelBoard>,
    scheduler: Rc<dyn Scheduler>,
    client: StreamClient,
    reconnect: RefCell<Option<TimerHandle>>,
    activation: RefCell<Option<Subscription>>,
    me: Weak<ActivityView>,
}

impl ActivityView {
    pub fn new(
        endpoint: Url,
        connector: Rc<dyn Connector>,
        store: Store,
        board: Rc<PanelBoard>,
        scheduler: Rc<dyn Scheduler>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me: &Weak<ActivityView>| {
            let on_message_view = me.clone();
            let on_message: MessageCallback = Box::new(move |payload: &str| {
                if let Some(view) = on_message_view.upgrade() {
                    view.ingest(payload);
                }
            });
            let on_error_view = me.clone();
            let on_error: ErrorCallback = Box::new(move |err: &StreamError| {
                if let Some(view) = on_error_view.upgrade() {
                    view.schedule_reconnect(err);
                }
            });
            Self {
                store,
                board,
                scheduler,
                client: StreamClient::new(endpoint, connector, on_message, Some(on_error)),
                reconnect: RefCell::new(None),
                activation: RefCell::new(None),
                me: me.clone(),
            }
        })
    }

    pub fn handle_event(&self, id: ConnectionId, event: StreamEvent) {
        self.client.handle_event(id, event);
    }

    /// Reopens the stream closed by `destroy` and redraws the feed. Runs on
    /// every activation, snapshot or not.
    fn resume(&self) {
        if self.client.current_id().is_none() {
            self.client.connect();
        }
        self.write_lines();
    }

    fn ingest(&self, payload: &str) {
        let event = serde_json::from_str::<Value>(payload)
            .unwrap_or_else(|_| Value::String(payload.to_string()));
        let mut events: Vec<Value> = self
            .store
            .get::<key::ActivityEvents>()
            .iter()
            .cloned()
            .collect();
        events.insert(0, event);
        events.truncate(ACTIVITY_LIMIT);
        self.store.set::<key::ActivityEvents>(Rc::new(events));
        if self.store.get::<key::ActiveTab>() == TabId::Activity {
            self.write_lines();
        }
    }

    fn schedule_reconnect(&self, err: &StreamError) {
        if self
            .reconnect
            .borrow()
            .as_ref()
            .map(TimerHandle::is_pending)
            .unwrap_or(false)
        {
            return;
        }
        debug!(event = "activity_reconnect_scheduled", error = %err);
        let view = self.me.clone();
        let handle = self.scheduler.schedule(
            ACTIVITY_RECONNECT,
            Box::new(move || {
                if let Some(view) = view.upgrade() {
                    view.client.connect();
                }
            }),
        );
        *self.reconnect.borrow_mut() = Some(handle);
    }

    fn write_lines(&self) {
        let filter = self.store.get::<key::ActivityFilter>();
        let issue_filter = self.store.get::<key::ActivityIssueFilter>();
        let events = self.store.get::<key::ActivityEvents>();
        let mut lines = Vec::new();
        if !self.client.is_connected() {
            lines.push("Event stream reconnecting...".to_string());
        }
        lines.extend(
            events
                .iter()
                .filter(|event| activity_matches(&filter, &issue_filter, event))
                .map(activity_line),
        );
        if events.is_empty() {
            lines.push("No activity yet.".to_string());
        }
        self.board.set_lines(TabId::Activity, lines);
    }
}

impl View for ActivityView {
    fn init(&self) -> anyhow::Result<()> {
        self.client.connect();
        if self.activation.borrow().is_none() {
            let view = self.me.clone();
            let subscription = self.store.subscribe::<key::ActiveTab, _>(move |tab, _| {
                if *tab != TabId::Activity {
                    return;
                }
                if let Some(view) = view.upgrade() {
                    view.resume();
                }
            });
            *self.activation.borrow_mut() = Some(subscription);
        }
        Ok(())
    }

    fn render(&self, _snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        self.resume();
        Ok(())
    }

    fn destroy(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.reconnect.borrow_mut().take() {
            handle.cancel();
        }
        self.client.close();
        Ok(())
    }
}

pub fn activity_matches(filter: &str, issue_filter: &str, event: &Value) -> bool {
    let kind_ok = match filter {
        "" | "all" => true,
        kind => event.get("type").and_then(Value::as_str) == Some(kind),
    };
    let issue_ok = issue_filter.trim().is_empty()
        || event
            .get("issue")
            .map(|issue| match issue {
                Value::String(text) => text == issue_filter.trim(),
                other => other.to_string() == issue_filter.trim(),
            })
            .unwrap_or(false);
    kind_ok && issue_ok
}

pub fn activity_line(event: &Value) -> String {
    let Some(object) = event.as_object() else {
        return ellipsize(&value_text(event), VALUE_WIDTH);
    };
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| object.get(*name))
            .map(value_text)
            .unwrap_or_default()
    };
    let time = field(&["ts", "timestamp"]);
    let kind = field(&["type", "event"]);
    let issue = field(&["issue"]);
    let message = field(&["message", "detail", "title"]);
    let mut line = String::new();
    for part in [time, kind] {
        if !part.is_empty() {
            line.push_str(&part);
            line.push(' ');
        }
    }
    if !issue.is_empty() {
        line.push_str(&format!("#{issue} "));
    }
    line.push_str(&message);
    ellipsize(line.trim_end(), VALUE_WIDTH)
}

pub struct MetricsView {
    store: Store,
    board: Rc<PanelBoard>,
    fetcher: Rc<dyn Fetcher>,
}

impl View for MetricsView {
    fn init(&self) -> anyhow::Result<()> {
        self.fetcher.fetch(ApiResource::Metrics);
        Ok(())
    }

    fn render(&self, _snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        let lines = match self.store.get::<key::MetricsCache>() {
            Some(metrics) => summarize_value(&metrics),
            None => vec!["Loading metrics...".to_string()],
        };
        self.board.set_lines(TabId::Metrics, lines);
        Ok(())
    }
}

/// Team roster, polled while the tab is active.
pub struct TeamView {
    store: Store,
    board: Rc<PanelBoard>,
    fetcher: Rc<dyn Fetcher>,
    scheduler: Rc<dyn Scheduler>,
    refresh: RefreshTasks,
}

impl View for TeamView {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&self, _snapshot: &Rc<FleetState>) -> anyhow::Result<()> {
        if !self.refresh.is_running(TabId::Team) {
            self.fetcher.fetch(ApiResource::Team);
            let fetcher = self.fetcher.clone();
            let handle = self.scheduler.schedule_repeating(
                TEAM_REFRESH,
                Box::new(move || fetcher.fetch(ApiResource::Team)),
            );
            self.refresh.install(TabId::Team, handle);
        }
        let lines = match self.store.get::<key::TeamCache>() {
            Some(team) => team_lines(&team),
            None => vec!["Loading team...".to_string()],
        };
        self.board.set_lines(TabId::Team, lines);
        Ok(())
    }
}

fn team_lines(team: &Value) -> Vec<String> {
    let members = team
        .get("members")
        .and_then(Value::as_array)
        .or_else(|| team.as_array());
    let Some(members) = members else {
        return summarize_value(team);
    };
    if members.is_empty() {
        return vec!["No team members online.".to_string()];
    }
    members
        .iter()
        .map(|member| {
            let name = member
                .get("name")
                .or_else(|| member.get("login"))
                .map(value_text)
                .unwrap_or_else(|| "?".to_string());
            let status = member.get("status").map(value_text).unwrap_or_default();
            let working_on = member
                .get("working_on")
                .or_else(|| member.get("issue"))
                .map(|issue| format!(" on #{}", value_text(issue)))
                .unwrap_or_default();
            ellipsize(&format!("{name:<18} {status}{working_on}"), VALUE_WIDTH)
        })
        .collect()
}

pub fn summarize_value(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) if !map.is_empty() => map
            .iter()
            .map(|(key, value)| ellipsize(&format!("{key}: {}", value_text(value)), VALUE_WIDTH))
            .collect(),
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| ellipsize(&value_text(item), VALUE_WIDTH))
            .collect(),
        Value::Object(_) | Value::Array(_) | Value::Null => vec!["No data.".to_string()],
        other => vec![value_text(other)],
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn format_elapsed(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m{:02}s", seconds / 60, seconds % 60),
        _ => format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60),
    }
}

pub struct ViewDeps {
    pub store: Store,
    pub board: Rc<PanelBoard>,
    pub scheduler: Rc<dyn Scheduler>,
    pub fetcher: Rc<dyn Fetcher>,
    pub activity_endpoint: Url,
    pub activity_connector: Rc<dyn Connector>,
}

/// Registers every console view and hands back the activity view, whose
/// stream events the host loop routes by connection id.
pub fn register_views(router: &Router, deps: ViewDeps) -> Rc<ActivityView> {
    let ViewDeps {
        store,
        board,
        scheduler,
        fetcher,
        activity_endpoint,
        activity_connector,
    } = deps;

    router.register_view(
        TabId::Overview,
        Rc::new(OverviewView {
            board: board.clone(),
        }),
    );
    router.register_view(
        TabId::Pipelines,
        Rc::new(PipelinesView {
            store: store.clone(),
            board: board.clone(),
        }),
    );
    router.register_view(
        TabId::Machines,
        Rc::new(MachinesView {
            board: board.clone(),
        }),
    );
    router.register_view(
        TabId::Metrics,
        Rc::new(MetricsView {
            store: store.clone(),
            board: board.clone(),
            fetcher: fetcher.clone(),
        }),
    );
    router.register_view(
        TabId::Team,
        Rc::new(TeamView {
            store: store.clone(),
            board: board.clone(),
            fetcher,
            scheduler: scheduler.clone(),
            refresh: router.refresh_tasks(),
        }),
    );
    let activity = ActivityView::new(
        activity_endpoint,
        activity_connector,
        store,
        board,
        scheduler,
    );
    router.register_view(TabId::Activity, activity.clone());
    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_live::{Connection, ReadyState, RouterInput, TimerQueue};
    use std::cell::Cell;

    #[derive(Default)]
    struct RecordingFetcher {
        calls: RefCell<Vec<ApiResource>>,
    }

    impl Fetcher for RecordingFetcher {
        fn fetch(&self, resource: ApiResource) {
            self.calls.borrow_mut().push(resource);
        }
    }

    struct StubStream {
        state: Rc<Cell<ReadyState>>,
    }

    impl Connection for StubStream {
        fn ready_state(&self) -> ReadyState {
            self.state.get()
        }

        fn close(&self) {
            self.state.set(ReadyState::Closed);
        }
    }

    #[derive(Default)]
    struct StubConnector {
        opened: RefCell<Vec<(ConnectionId, Rc<Cell<ReadyState>>)>>,
    }

    impl StubConnector {
        fn latest(&self) -> (ConnectionId, Rc<Cell<ReadyState>>) {
            self.opened.borrow().last().cloned().expect("stream opened")
        }
    }

    impl Connector for StubConnector {
        fn open(&self, id: ConnectionId, _endpoint: &Url) -> Box<dyn Connection> {
            let state = Rc::new(Cell::new(ReadyState::Connecting));
            self.opened.borrow_mut().push((id, state.clone()));
            Box::new(StubStream { state })
        }
    }

    struct Console {
        store: Store,
        queue: TimerQueue,
        board: Rc<PanelBoard>,
        router: Rc<Router>,
        fetcher: Rc<RecordingFetcher>,
        connector: Rc<StubConnector>,
        activity: Rc<ActivityView>,
    }

    fn console() -> Console {
        let store = Store::new();
        let queue = TimerQueue::new();
        let board = Rc::new(PanelBoard::new());
        let router = Router::new(store.clone(), board.clone());
        let fetcher = Rc::new(RecordingFetcher::default());
        let connector = Rc::new(StubConnector::default());
        let activity = register_views(
            &router,
            ViewDeps {
                store: store.clone(),
                board: board.clone(),
                scheduler: Rc::new(queue.clone()),
                fetcher: fetcher.clone(),
                activity_endpoint: Url::parse("http://127.0.0.1:8767/api/events/stream")
                    .expect("url"),
                activity_connector: connector.clone(),
            },
        );
        router.setup_router();
        Console {
            store,
            queue,
            board,
            router,
            fetcher,
            connector,
            activity,
        }
    }

    fn push_snapshot(store: &Store, raw: serde_json::Value) {
        let snapshot: FleetState = serde_json::from_value(raw).expect("snapshot");
        store.set::<key::Fleet>(Some(Rc::new(snapshot)));
    }

    fn select(router: &Router, tab: TabId) {
        router.handle_input(RouterInput::TabSelected(Some(tab.as_str().to_string())));
    }

    #[test]
    fn overview_summarizes_snapshot() {
        let c = console();
        push_snapshot(
            &c.store,
            serde_json::json!({
                "daemon": {"uptime_s": 3725, "active_jobs": 2, "max_parallel": 4, "queue_depth": 1},
                "pipelines": [
                    {"issue": 1, "status": "running"},
                    {"issue": 2, "status": "completed"}
                ],
                "machines": [{"name": "m1", "status": "online"}, {"name": "m2", "status": "offline"}]
            }),
        );
        let lines = c.board.lines(TabId::Overview);
        assert_eq!(lines[0], "Daemon: up 1h02m | 2/4 jobs | queue 1");
        assert!(lines.contains(&"Pipelines: 1 active / 2 total".to_string()));
        assert!(lines.contains(&"Machines: 1/2 online".to_string()));
    }

    #[test]
    fn pipelines_filter_narrows_rows() {
        let c = console();
        select(&c.router, TabId::Pipelines);
        c.store.set::<key::PipelineFilter>("failed".to_string());
        push_snapshot(
            &c.store,
            serde_json::json!({"pipelines": [
                {"issue": 10, "title": "ok", "status": "running"},
                {"issue": "11", "title": "broken", "status": "Failed"}
            ]}),
        );
        let lines = c.board.lines(TabId::Pipelines);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("#11"));
        assert!(lines[1].ends_with("broken"));
    }

    #[test]
    fn pipeline_filter_cycle_wraps() {
        assert_eq!(next_pipeline_filter("all"), "active");
        assert_eq!(next_pipeline_filter("completed"), "all");
        assert_eq!(next_pipeline_filter("bogus"), "all");
    }

    #[test]
    fn activity_streams_while_active_and_stops_on_leave() {
        let c = console();
        push_snapshot(&c.store, serde_json::json!({}));
        select(&c.router, TabId::Activity);
        let (id, state) = c.connector.latest();
        state.set(ReadyState::Open);
        c.activity.handle_event(id, StreamEvent::Open);
        c.activity.handle_event(
            id,
            StreamEvent::Message(
                r#"{"ts":"12:00","type":"stage","issue":42,"message":"build"}"#.to_string(),
            ),
        );
        assert_eq!(c.board.lines(TabId::Activity), vec!["12:00 stage #42 build"]);
        assert_eq!(c.store.get::<key::ActivityEvents>().len(), 1);

        select(&c.router, TabId::Overview);
        assert_eq!(state.get(), ReadyState::Closed);

        select(&c.router, TabId::Activity);
        assert_eq!(c.connector.opened.borrow().len(), 2);
    }

    #[test]
    fn activity_reopens_on_return_before_any_snapshot() {
        let c = console();
        assert!(c.store.get::<key::Fleet>().is_none());

        select(&c.router, TabId::Activity);
        let (_, first) = c.connector.latest();
        select(&c.router, TabId::Overview);
        assert_eq!(first.get(), ReadyState::Closed);

        select(&c.router, TabId::Activity);
        assert_eq!(c.connector.opened.borrow().len(), 2);
        let (_, second) = c.connector.latest();
        assert_eq!(second.get(), ReadyState::Connecting);
        assert_eq!(
            c.board.lines(TabId::Activity),
            vec!["Event stream reconnecting...", "No activity yet."]
        );
    }

    #[test]
    fn activity_reconnects_after_stream_error() {
        let c = console();
        push_snapshot(&c.store, serde_json::json!({}));
        select(&c.router, TabId::Activity);
        let (id, _) = c.connector.latest();
        c.activity
            .handle_event(id, StreamEvent::Error("reset".to_string()));
        assert_eq!(c.connector.opened.borrow().len(), 1);
        c.queue.advance(ACTIVITY_RECONNECT);
        assert_eq!(c.connector.opened.borrow().len(), 2);
    }

    #[test]
    fn team_polls_only_while_active() {
        let c = console();
        push_snapshot(&c.store, serde_json::json!({}));
        select(&c.router, TabId::Team);
        assert_eq!(*c.fetcher.calls.borrow(), vec![ApiResource::Team]);
        assert_eq!(c.board.lines(TabId::Team), vec!["Loading team..."]);

        c.queue.advance(TEAM_REFRESH);
        assert_eq!(c.fetcher.calls.borrow().len(), 2);

        select(&c.router, TabId::Overview);
        c.queue.advance(TEAM_REFRESH * 3);
        assert_eq!(c.fetcher.calls.borrow().len(), 2);
    }

    #[test]
    fn team_lines_read_member_list() {
        let team = serde_json::json!({"members": [
            {"name": "sam", "status": "active", "working_on": 7},
            {"login": "kai"}
        ]});
        let lines = team_lines(&team);
        assert_eq!(lines[0].trim_end(), "sam                active on #7");
        assert!(lines[1].starts_with("kai"));
    }

    #[test]
    fn activity_filters_by_type_and_issue() {
        let event = serde_json::json!({"type": "stage", "issue": 5});
        assert!(activity_matches("all", "", &event));
        assert!(activity_matches("stage", "5", &event));
        assert!(!activity_matches("error", "", &event));
        assert!(!activity_matches("all", "6", &event));
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(9), "9s");
        assert_eq!(format_elapsed(125), "2m05s");
        assert_eq!(format_elapsed(7260), "2h01m");
    }
}
