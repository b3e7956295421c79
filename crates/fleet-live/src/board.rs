//! In-memory presentation state: tab buttons, panels, error boundaries and
//! the connection indicators. The console draws it; tests inspect it.

use crate::duplex::StatusIndicator;
use crate::router::TabPresenter;
use fleet_core::TabId;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Unknown,
    Live,
    Offline,
}

impl Connectivity {
    pub fn label(&self) -> &'static str {
        match self {
            Connectivity::Unknown => "CONNECTING",
            Connectivity::Live => "LIVE",
            Connectivity::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBoundary {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Panel {
    pub active: bool,
    pub boundaries: Vec<ErrorBoundary>,
    pub lines: Vec<String>,
}

#[derive(Debug)]
struct BoardState {
    fragment: String,
    buttons: BTreeMap<TabId, bool>,
    panels: BTreeMap<TabId, Panel>,
    connectivity: Connectivity,
    offline_banner: bool,
    stale_age: Option<Duration>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            fragment: String::new(),
            buttons: TabId::ALL.iter().map(|tab| (*tab, false)).collect(),
            panels: TabId::ALL
                .iter()
                .map(|tab| (*tab, Panel::default()))
                .collect(),
            connectivity: Connectivity::Unknown,
            offline_banner: false,
            stale_age: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct PanelBoard {
    state: RefCell<BoardState>,
}

impl PanelBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fragment(fragment: &str) -> Self {
        let board = Self::default();
        board.state.borrow_mut().fragment = fragment.to_string();
        board
    }

    /// Tabs whose button and panel both carry active styling.
    pub fn active_tabs(&self) -> Vec<TabId> {
        let state = self.state.borrow();
        TabId::ALL
            .iter()
            .copied()
            .filter(|tab| {
                state.buttons.get(tab).copied().unwrap_or(false)
                    && state.panels.get(tab).is_some_and(|panel| panel.active)
            })
            .collect()
    }

    pub fn panel(&self, tab: TabId) -> Panel {
        self.state
            .borrow()
            .panels
            .get(&tab)
            .cloned()
            .unwrap_or_default()
    }

    pub fn boundary_messages(&self, tab: TabId) -> Vec<String> {
        self.panel(tab)
            .boundaries
            .into_iter()
            .map(|boundary| boundary.message)
            .collect()
    }

    pub fn set_lines(&self, tab: TabId, lines: Vec<String>) {
        if let Some(panel) = self.state.borrow_mut().panels.get_mut(&tab) {
            panel.lines = lines;
        }
    }

    pub fn lines(&self, tab: TabId) -> Vec<String> {
        self.panel(tab).lines
    }

    pub fn connectivity(&self) -> Connectivity {
        self.state.borrow().connectivity
    }

    pub fn offline_banner_visible(&self) -> bool {
        self.state.borrow().offline_banner
    }

    pub fn stale_age(&self) -> Option<Duration> {
        self.state.borrow().stale_age
    }
}

impl TabPresenter for PanelBoard {
    fn fragment(&self) -> String {
        self.state.borrow().fragment.clone()
    }

    fn set_fragment(&self, fragment: &str) {
        self.state.borrow_mut().fragment = fragment.to_string();
    }

    fn set_active(&self, tab: TabId) {
        let mut state = self.state.borrow_mut();
        for (id, active) in state.buttons.iter_mut() {
            *active = *id == tab;
        }
        for (id, panel) in state.panels.iter_mut() {
            panel.active = *id == tab;
        }
    }

    fn show_error_boundary(&self, tab: TabId, message: &str) {
        if let Some(panel) = self.state.borrow_mut().panels.get_mut(&tab) {
            panel.boundaries.push(ErrorBoundary {
                message: message.to_string(),
            });
        }
    }

    fn clear_error_boundary(&self, tab: TabId) {
        if let Some(panel) = self.state.borrow_mut().panels.get_mut(&tab) {
            panel.boundaries.clear();
        }
    }
}

impl StatusIndicator for PanelBoard {
    fn show_live(&self) {
        let mut state = self.state.borrow_mut();
        state.connectivity = Connectivity::Live;
        state.offline_banner = false;
    }

    fn show_offline(&self) {
        let mut state = self.state.borrow_mut();
        state.connectivity = Connectivity::Offline;
        state.offline_banner = true;
    }

    fn show_stale(&self, age: Duration) {
        self.state.borrow_mut().stale_age = Some(age);
    }

    fn hide_stale(&self) {
        self.state.borrow_mut().stale_age = None;
    }
}
