mod net;
mod ui;
mod views;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use fleet_core::wire::{live_socket_url, stream_url};
use fleet_core::TabId;
use fleet_live::{
    key, DuplexClient, PanelBoard, Router, RouterInput, Scheduler, Store, SyncConfig, TimerQueue,
};
use futures_util::StreamExt;
use net::{ApiClient, ApiReply, ApiResource, SseConnector, WsConnector};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use ui::{render_ui, LinkStatus};
use url::Url;
use views::{next_pipeline_filter, ActivityView, ViewDeps};

const EVENT_QUEUE_CAPACITY: usize = 256;
const IDLE_WAKE: Duration = Duration::from_millis(500);
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:18767";
const ACTIVITY_STREAM_PATH: &str = "/api/events/stream";
const LOG_FILE_NAME: &str = "fleet-console.log";

#[derive(Parser, Debug)]
#[command(name = "fleet-console")]
struct Args {
    #[arg(long, default_value = "")]
    base_url: String,
    #[arg(long, default_value = "")]
    tab: String,
    #[arg(long, default_value_t = 1000)]
    backoff_base_ms: u64,
    #[arg(long, default_value_t = 30_000)]
    backoff_max_ms: u64,
    #[arg(long, default_value_t = 30)]
    stale_secs: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Clone)]
struct Config {
    base_url: Url,
    initial_fragment: String,
    sync: SyncConfig,
    log_dir: String,
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    Quit,
    Select(TabId),
    Retry,
    Reconnect,
    CycleFilter,
}

struct App {
    store: Store,
    timers: TimerQueue,
    board: Rc<PanelBoard>,
    router: Rc<Router>,
    client: Rc<DuplexClient>,
    activity: Rc<ActivityView>,
    epoch: Instant,
}

impl App {
    fn tick(&self) {
        self.timers.advance_to(self.epoch.elapsed());
    }

    fn next_wake(&self) -> Instant {
        let idle = Instant::now() + IDLE_WAKE;
        match self.timers.next_deadline() {
            Some(deadline) => (self.epoch + deadline).min(idle),
            None => idle,
        }
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus {
            endpoint: self.client.endpoint().to_string(),
            retry_in: self.client.pending_retry_delay(),
            awaiting_first_snapshot: self.store.get::<key::FirstRender>(),
        }
    }

    fn apply_api_reply(&self, reply: ApiReply) {
        let value = match reply.result {
            Ok(value) => Rc::new(value),
            Err(err) => {
                warn!(event = "api_fetch_error", path = reply.resource.path(), error = %err);
                return;
            }
        };
        match reply.resource {
            ApiResource::Team => self.store.set::<key::TeamCache>(Some(value)),
            ApiResource::Metrics => self.store.set::<key::MetricsCache>(Some(value)),
        }
        self.router.render_active_view();
    }

    /// Returns true when the console should exit.
    fn apply_key(&self, action: KeyAction) -> bool {
        match action {
            KeyAction::Quit => return true,
            KeyAction::Select(tab) => self
                .router
                .handle_input(RouterInput::TabSelected(Some(tab.as_str().to_string()))),
            KeyAction::Retry => {
                let tab = self.router.active_tab();
                if self.router.has_error_boundary(tab) {
                    self.router.handle_input(RouterInput::RetryRequested(tab));
                } else {
                    self.router.render_active_view();
                }
            }
            KeyAction::Reconnect => {
                if !self.client.is_connected() {
                    self.client.connect();
                }
            }
            KeyAction::CycleFilter => {
                if self.router.active_tab() == TabId::Pipelines {
                    let next = next_pipeline_filter(&self.store.get::<key::PipelineFilter>());
                    self.store.set::<key::PipelineFilter>(next);
                    self.router.render_active_view();
                }
            }
        }
        false
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config);
    info!(
        event = "console_start",
        base_url = %config.base_url,
        started_at = %Utc::now().to_rfc3339(),
        pid = std::process::id()
    );

    let (socket_tx, mut socket_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (stream_tx, mut stream_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (api_tx, mut api_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let http = reqwest::Client::new();

    let store = Store::new();
    let timers = TimerQueue::new();
    let scheduler: Rc<dyn Scheduler> = Rc::new(timers.clone());
    let board = Rc::new(PanelBoard::with_fragment(&config.initial_fragment));
    let router = Router::new(store.clone(), board.clone());
    let activity = views::register_views(
        &router,
        ViewDeps {
            store: store.clone(),
            board: board.clone(),
            scheduler: scheduler.clone(),
            fetcher: Rc::new(ApiClient::new(
                http.clone(),
                config.base_url.clone(),
                api_tx,
            )),
            activity_endpoint: stream_url(&config.base_url, ACTIVITY_STREAM_PATH)?,
            activity_connector: Rc::new(SseConnector::new(http, stream_tx)),
        },
    );
    let client = DuplexClient::new(
        live_socket_url(&config.base_url)?,
        config.sync.clone(),
        store.clone(),
        Rc::new(WsConnector::new(socket_tx)),
        scheduler,
        board.clone(),
    );
    router.setup_router();
    client.connect();

    let app = App {
        store,
        timers,
        board,
        router,
        client,
        activity,
        epoch: Instant::now(),
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let default_hook = std::panic::take_hook();
    install_panic_hook();

    loop {
        app.tick();
        let link = app.link_status();
        terminal.draw(|frame| render_ui(frame, &app.board, app.router.active_tab(), &link))?;
        tokio::select! {
            _ = tokio::time::sleep_until(app.next_wake()) => {}
            Some(event) = socket_rx.recv() => {
                app.client.handle_event(event.id, event.event);
            }
            Some(event) = stream_rx.recv() => {
                app.activity.handle_event(event.id, event.event);
            }
            Some(reply) = api_rx.recv() => {
                app.apply_api_reply(reply);
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    if handle_input(event, &app) {
                        break;
                    }
                }
            }
        }
    }

    app.client.close();
    std::panic::set_hook(default_hook);
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    info!(event = "console_exit");
    Ok(())
}

/// Sends panic reports to the log while the alternate screen is up. Panics
/// caught by the router's boundaries still pass through the hook.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!(event = "panic", detail = %info);
    }));
}

fn handle_input(event: Event, app: &App) -> bool {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => {
            match key_action(key, app.router.active_tab()) {
                Some(action) => app.apply_key(action),
                None => false,
            }
        }
        _ => false,
    }
}

fn key_action(key: KeyEvent, active: TabId) -> Option<KeyAction> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Some(KeyAction::Quit);
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Some(KeyAction::Quit),
        KeyCode::Char(digit @ '1'..='9') => {
            let index = digit as usize - '1' as usize;
            TabId::ALL.get(index).copied().map(KeyAction::Select)
        }
        KeyCode::Tab => Some(KeyAction::Select(active.next())),
        KeyCode::Char('r') => Some(KeyAction::Retry),
        KeyCode::Char('c') => Some(KeyAction::Reconnect),
        KeyCode::Char('f') => Some(KeyAction::CycleFilter),
        _ => None,
    }
}

fn load_config() -> anyhow::Result<Config> {
    config_from_args(Args::parse())
}

fn config_from_args(args: Args) -> anyhow::Result<Config> {
    let raw_base = resolve_setting(&args.base_url, "FLEET_BASE_URL", DEFAULT_BASE_URL);
    let base_url =
        Url::parse(&raw_base).with_context(|| format!("invalid base url: {raw_base}"))?;
    if args.backoff_base_ms == 0 {
        bail!("--backoff-base-ms must be greater than zero");
    }
    if args.stale_secs == 0 {
        bail!("--stale-secs must be greater than zero");
    }
    let sync = SyncConfig {
        backoff_base: Duration::from_millis(args.backoff_base_ms),
        backoff_max: Duration::from_millis(args.backoff_max_ms.max(args.backoff_base_ms)),
        stale_after: Duration::from_secs(args.stale_secs),
        ..SyncConfig::default()
    };
    Ok(Config {
        base_url,
        initial_fragment: fragment_for(&resolve_setting(&args.tab, "FLEET_TAB", "")),
        sync,
        log_dir: resolve_setting(&args.log_dir, "FLEET_LOG_DIR", ".fleet/logs"),
        debug: args.debug || env_true("FLEET_DEBUG"),
    })
}

fn fragment_for(tab: &str) -> String {
    let tab = tab.trim();
    if tab.is_empty() || tab.starts_with('#') {
        tab.to_string()
    } else {
        format!("#{tab}")
    }
}

fn resolve_setting(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or(false)
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout_enabled = env_true("FLEET_LOG_STDOUT");
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(stdout_enabled, file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// The terminal belongs to the UI, so stdout is opt-in.
struct MultiWriter {
    stdout: Option<io::Stdout>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(stdout_enabled: bool, file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: stdout_enabled.then(io::stdout),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stdout) = self.stdout.as_mut() {
            let _ = stdout.write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stdout) = self.stdout.as_mut() {
            let _ = stdout.flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
