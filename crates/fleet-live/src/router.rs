//! Tab router: one active view at a time, lazy one-shot `init`, and a
//! per-tab error boundary around every `init`/`render` call.

use crate::store::{key, Store, Subscription};
use crate::timers::TimerHandle;
use fleet_core::{FleetState, TabId};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

const UNKNOWN_FAILURE: &str = "unknown view failure";

/// Lifecycle contract for a tab's view.
///
/// `init` runs once per router lifetime (again only through retry), `render`
/// on every activation and snapshot change while active. Both may fail or
/// panic; the router confines either to the tab's error boundary.
pub trait View {
    fn init(&self) -> anyhow::Result<()>;
    fn render(&self, snapshot: &Rc<FleetState>) -> anyhow::Result<()>;
    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Presentation side of navigation: fragment, active styling, boundaries.
pub trait TabPresenter {
    fn fragment(&self) -> String;
    fn set_fragment(&self, fragment: &str);
    /// Active styling on exactly this tab's button and panel.
    fn set_active(&self, tab: TabId);
    fn show_error_boundary(&self, tab: TabId, message: &str);
    fn clear_error_boundary(&self, tab: TabId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterInput {
    /// A tab selector was activated; selectors without an id carry `None`.
    TabSelected(Option<String>),
    FragmentChanged(String),
    RetryRequested(TabId),
}

/// Per-tab background refresh timers, shared between the router and the
/// views that install them. Leaving a tab cancels its task.
#[derive(Clone, Default)]
pub struct RefreshTasks {
    tasks: Rc<RefCell<HashMap<TabId, TimerHandle>>>,
}

impl RefreshTasks {
    pub fn install(&self, tab: TabId, handle: TimerHandle) {
        let previous = self.tasks.borrow_mut().insert(tab, handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub fn cancel(&self, tab: TabId) -> bool {
        let removed = self.tasks.borrow_mut().remove(&tab);
        match removed {
            Some(handle) => {
                let was_pending = handle.is_pending();
                handle.cancel();
                was_pending
            }
            None => false,
        }
    }

    pub fn is_running(&self, tab: TabId) -> bool {
        self.tasks
            .borrow()
            .get(&tab)
            .map(TimerHandle::is_pending)
            .unwrap_or(false)
    }
}

pub struct Router {
    me: Weak<Router>,
    store: Store,
    presenter: Rc<dyn TabPresenter>,
    views: RefCell<HashMap<TabId, Rc<dyn View>>>,
    initialized: RefCell<HashSet<TabId>>,
    errored: RefCell<HashSet<TabId>>,
    refresh: RefreshTasks,
    snapshot_subscription: RefCell<Option<Subscription>>,
}

impl Router {
    pub fn new(store: Store, presenter: Rc<dyn TabPresenter>) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            presenter,
            views: RefCell::new(HashMap::new()),
            initialized: RefCell::new(HashSet::new()),
            errored: RefCell::new(HashSet::new()),
            refresh: RefreshTasks::default(),
            snapshot_subscription: RefCell::new(None),
        })
    }

    pub fn register_view(&self, tab: TabId, view: Rc<dyn View>) {
        if self.views.borrow_mut().insert(tab, view).is_some() {
            debug!(event = "view_replaced", tab = %tab);
        }
    }

    pub fn registered_views(&self) -> HashMap<TabId, Rc<dyn View>> {
        self.views.borrow().clone()
    }

    pub fn refresh_tasks(&self) -> RefreshTasks {
        self.refresh.clone()
    }

    pub fn active_tab(&self) -> TabId {
        self.store.get::<key::ActiveTab>()
    }

    pub fn is_initialized(&self, tab: TabId) -> bool {
        self.initialized.borrow().contains(&tab)
    }

    pub fn has_error_boundary(&self, tab: TabId) -> bool {
        self.errored.borrow().contains(&tab)
    }

    pub fn switch_tab(&self, tab: TabId) {
        let previous = self.active_tab();
        if previous == tab {
            return;
        }

        if let Some(view) = self.view(previous) {
            if let Err(message) = guarded(|| view.destroy()) {
                warn!(event = "view_destroy_error", tab = %previous, error = %message);
            }
        }
        if self.refresh.cancel(previous) {
            debug!(event = "refresh_cancelled", tab = %previous);
        }

        info!(event = "tab_switch", from = %previous, to = %tab);
        self.store.set::<key::ActiveTab>(tab);
        self.presenter.set_fragment(&tab.fragment());
        self.presenter.set_active(tab);
        self.activate(tab);
    }

    pub fn render_active_view(&self) {
        let tab = self.active_tab();
        if let Some(view) = self.view(tab) {
            self.render_guarded(tab, &view);
        }
    }

    /// Hooks snapshot changes to `render_active_view` and applies the
    /// initial fragment. Calling it again replaces the earlier hook.
    pub fn setup_router(&self) {
        let me = self.me.clone();
        let subscription = self.store.subscribe::<key::Fleet, _>(move |_, _| {
            if let Some(router) = me.upgrade() {
                router.render_active_view();
            }
        });
        let previous = self.snapshot_subscription.replace(Some(subscription));
        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        let active = self.active_tab();
        let fragment = self.presenter.fragment();
        let requested = TabId::from_fragment(&fragment)
            .filter(|tab| self.views.borrow().contains_key(tab));
        match requested {
            Some(tab) if tab != active => self.switch_tab(tab),
            _ => {
                if !fragment.is_empty() && requested.is_none() {
                    debug!(event = "unknown_fragment", fragment = %fragment);
                }
                self.presenter.set_active(active);
                self.activate(active);
            }
        }
    }

    pub fn handle_input(&self, input: RouterInput) {
        match input {
            RouterInput::TabSelected(None) => {}
            RouterInput::TabSelected(Some(name)) => match name.parse::<TabId>() {
                Ok(tab) => self.switch_tab(tab),
                Err(err) => debug!(event = "unknown_tab", error = %err),
            },
            RouterInput::FragmentChanged(fragment) => {
                if let Some(tab) = TabId::from_fragment(&fragment) {
                    if tab != self.active_tab() {
                        self.switch_tab(tab);
                    }
                }
            }
            RouterInput::RetryRequested(tab) => self.retry(tab),
        }
    }

    /// Re-runs `init`, and on success drops the boundary and renders the
    /// current snapshot under the same guard.
    pub fn retry(&self, tab: TabId) {
        let Some(view) = self.view(tab) else {
            return;
        };
        info!(event = "view_retry", tab = %tab);
        if let Err(message) = guarded(|| view.init()) {
            self.show_boundary(tab, &message);
            return;
        }
        self.initialized.borrow_mut().insert(tab);
        if self.errored.borrow_mut().remove(&tab) {
            self.presenter.clear_error_boundary(tab);
        }
        self.render_guarded(tab, &view);
    }

    fn view(&self, tab: TabId) -> Option<Rc<dyn View>> {
        self.views.borrow().get(&tab).cloned()
    }

    fn activate(&self, tab: TabId) {
        let Some(view) = self.view(tab) else {
            return;
        };
        if !self.is_initialized(tab) {
            if let Err(message) = guarded(|| view.init()) {
                self.show_boundary(tab, &message);
                return;
            }
            self.initialized.borrow_mut().insert(tab);
        }
        self.render_guarded(tab, &view);
    }

    fn render_guarded(&self, tab: TabId, view: &Rc<dyn View>) {
        let Some(snapshot) = self.store.get::<key::Fleet>() else {
            return;
        };
        if let Err(message) = guarded(|| view.render(&snapshot)) {
            self.show_boundary(tab, &message);
        }
    }

    fn show_boundary(&self, tab: TabId, message: &str) {
        warn!(event = "view_failure", tab = %tab, error = %message);
        if self.errored.borrow_mut().insert(tab) {
            self.presenter.show_error_boundary(tab, message);
        }
    }
}

fn guarded<F>(call: F) -> Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        UNKNOWN_FAILURE.to_string()
    }
}
