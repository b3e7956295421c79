//! Reactive key/value store.
//!
//! The schema is closed: every key is a zero-sized marker type in [`key`]
//! implementing [`StateKey`], so reading or writing an unknown key is a
//! compile error. Dispatch is synchronous and no internal borrow is held
//! while a listener runs, so listeners may write back into the store.
//! Recursive write chains are the caller's to bound.

use fleet_core::{FleetState, TabId};
use serde_json::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

/// Change test used by `set` and `update`: value equality for plain values,
/// pointer identity for shared composites.
pub trait StrictEq {
    fn strict_eq(&self, other: &Self) -> bool;
}

macro_rules! value_equality {
    ($($ty:ty),* $(,)?) => {
        $(impl StrictEq for $ty {
            fn strict_eq(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

value_equality!(bool, u32, u64, i32, i64, usize, f64, String, TabId);

impl<T: ?Sized> StrictEq for Rc<T> {
    fn strict_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

impl<T: StrictEq> StrictEq for Option<T> {
    fn strict_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(left), Some(right)) => left.strict_eq(right),
            (None, None) => true,
            _ => false,
        }
    }
}

pub trait StateKey: 'static {
    type Value: Clone + StrictEq + 'static;
    const NAME: &'static str;

    #[doc(hidden)]
    fn slot(state: &AppState) -> &Self::Value;
    #[doc(hidden)]
    fn slot_mut(state: &mut AppState) -> &mut Self::Value;
    #[doc(hidden)]
    fn patch_slot(patch: &mut StatePatch) -> &mut Option<Self::Value>;
}

struct Change {
    key: &'static str,
    new: Box<dyn Any>,
    old: Box<dyn Any>,
}

macro_rules! app_state {
    ($($(#[$meta:meta])* $field:ident : $key:ident => $ty:ty = $default:expr),* $(,)?) => {
        /// Point-in-time copy of every key. Composite values are shared
        /// `Rc`s, so cloning is shallow and editing a copy never reaches
        /// the store.
        #[derive(Debug, Clone)]
        pub struct AppState {
            $(pub $field: $ty,)*
        }

        impl Default for AppState {
            fn default() -> Self {
                Self {
                    $($field: $default,)*
                }
            }
        }

        pub mod key {
            use super::*;

            $(
                $(#[$meta])*
                #[derive(Debug, Clone, Copy)]
                pub struct $key;

                impl StateKey for $key {
                    type Value = $ty;
                    const NAME: &'static str = stringify!($field);

                    fn slot(state: &AppState) -> &Self::Value {
                        &state.$field
                    }

                    fn slot_mut(state: &mut AppState) -> &mut Self::Value {
                        &mut state.$field
                    }

                    fn patch_slot(patch: &mut StatePatch) -> &mut Option<Self::Value> {
                        &mut patch.$field
                    }
                }
            )*
        }

        /// Multi-key write applied by [`Store::update`].
        #[derive(Default)]
        pub struct StatePatch {
            $($field: Option<$ty>,)*
        }

        impl StatePatch {
            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }

            fn apply(self, state: &mut AppState) -> Vec<Change> {
                let mut changes = Vec::new();
                $(
                    if let Some(value) = self.$field {
                        if !value.strict_eq(&state.$field) {
                            let old = std::mem::replace(&mut state.$field, value);
                            changes.push(Change {
                                key: stringify!($field),
                                new: Box::new(state.$field.clone()),
                                old: Box::new(old),
                            });
                        }
                    }
                )*
                changes
            }
        }
    };
}

app_state! {
    connected: Connected => bool = false,
    /// Epoch milliseconds of the last successful open.
    connected_at: ConnectedAt => Option<i64> = None,
    /// Primary data key; the router re-renders on every change.
    fleet_state: Fleet => Option<Rc<FleetState>> = None,
    active_tab: ActiveTab => TabId = TabId::Overview,
    selected_pipeline_issue: SelectedPipelineIssue => Option<u64> = None,
    pipeline_detail: PipelineDetail => Option<Rc<Value>> = None,
    pipeline_filter: PipelineFilter => String = String::from("all"),
    activity_filter: ActivityFilter => String = String::from("all"),
    activity_issue_filter: ActivityIssueFilter => String = String::new(),
    activity_events: ActivityEvents => Rc<Vec<Value>> = Rc::default(),
    activity_offset: ActivityOffset => u64 = 0,
    activity_has_more: ActivityHasMore => bool = false,
    metrics_cache: MetricsCache => Option<Rc<Value>> = None,
    insights_cache: InsightsCache => Option<Rc<Value>> = None,
    machines_cache: MachinesCache => Option<Rc<Value>> = None,
    join_tokens_cache: JoinTokensCache => Option<Rc<Value>> = None,
    cost_breakdown_cache: CostBreakdownCache => Option<Rc<Value>> = None,
    alerts_cache: AlertsCache => Option<Rc<Value>> = None,
    alert_dismissed: AlertDismissed => bool = false,
    team_cache: TeamCache => Option<Rc<Value>> = None,
    team_activity_cache: TeamActivityCache => Option<Rc<Value>> = None,
    daemon_config: DaemonConfig => Option<Rc<Value>> = None,
    current_user: CurrentUser => Option<Rc<Value>> = None,
    selected_issues: SelectedIssues => Rc<BTreeMap<String, bool>> = Rc::default(),
    /// True until the first snapshot lands.
    first_render: FirstRender => bool = true,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<K: StateKey>(mut self, value: K::Value) -> Self {
        *K::patch_slot(&mut self) = Some(value);
        self
    }
}

type KeyedListener = dyn Fn(&dyn Any, &dyn Any);
type AnyListener = dyn Fn(&AppState);

struct Registration<F: ?Sized> {
    id: u64,
    active: Rc<Cell<bool>>,
    listener: Box<F>,
}

#[derive(Default)]
struct StoreInner {
    state: RefCell<AppState>,
    keyed: RefCell<HashMap<&'static str, Vec<Rc<Registration<KeyedListener>>>>>,
    any: RefCell<Vec<Rc<Registration<AnyListener>>>>,
    next_id: Cell<u64>,
}

impl StoreInner {
    fn next_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }
}

/// Shared handle to one store. Clones observe the same state; separate
/// `Store::new()` calls are fully independent.
#[derive(Clone, Default)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<K: StateKey>(&self) -> K::Value {
        K::slot(&self.inner.state.borrow()).clone()
    }

    pub fn get_state(&self) -> AppState {
        self.inner.state.borrow().clone()
    }

    pub fn set<K: StateKey>(&self, value: K::Value) {
        let change = {
            let mut state = self.inner.state.borrow_mut();
            let slot = K::slot_mut(&mut state);
            if value.strict_eq(slot) {
                return;
            }
            let old = std::mem::replace(slot, value);
            Change {
                key: K::NAME,
                new: Box::new(K::slot(&state).clone()),
                old: Box::new(old),
            }
        };
        self.dispatch(vec![change]);
    }

    /// Applies every key of `patch`, notifies per-key listeners for the keys
    /// that changed, then any-change listeners once.
    pub fn update(&self, patch: StatePatch) {
        let changes = {
            let mut state = self.inner.state.borrow_mut();
            patch.apply(&mut state)
        };
        self.dispatch(changes);
    }

    pub fn subscribe<K, F>(&self, listener: F) -> Subscription
    where
        K: StateKey,
        F: Fn(&K::Value, &K::Value) + 'static,
    {
        let id = self.inner.next_id();
        let active = Rc::new(Cell::new(true));
        let erased: Box<KeyedListener> = Box::new(move |new: &dyn Any, old: &dyn Any| {
            if let (Some(new), Some(old)) = (
                new.downcast_ref::<K::Value>(),
                old.downcast_ref::<K::Value>(),
            ) {
                listener(new, old);
            }
        });
        self.inner
            .keyed
            .borrow_mut()
            .entry(K::NAME)
            .or_default()
            .push(Rc::new(Registration {
                id,
                active: active.clone(),
                listener: erased,
            }));
        Subscription {
            store: Rc::downgrade(&self.inner),
            key: Some(K::NAME),
            id,
            active,
        }
    }

    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AppState) + 'static,
    {
        let id = self.inner.next_id();
        let active = Rc::new(Cell::new(true));
        let listener: Box<AnyListener> = Box::new(listener);
        self.inner.any.borrow_mut().push(Rc::new(Registration {
            id,
            active: active.clone(),
            listener,
        }));
        Subscription {
            store: Rc::downgrade(&self.inner),
            key: None,
            id,
            active,
        }
    }

    fn dispatch(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }
        for change in &changes {
            let listeners = self
                .inner
                .keyed
                .borrow()
                .get(change.key)
                .cloned()
                .unwrap_or_default();
            for registration in listeners {
                if registration.active.get() {
                    (registration.listener)(&*change.new, &*change.old);
                }
            }
        }

        let listeners = self.inner.any.borrow().clone();
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.get_state();
        for registration in listeners {
            if registration.active.get() {
                (registration.listener)(&snapshot);
            }
        }
    }
}

/// Handle for one registration. Dropping it leaves the listener in place.
pub struct Subscription {
    store: Weak<StoreInner>,
    key: Option<&'static str>,
    id: u64,
    active: Rc<Cell<bool>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.replace(false) {
            return;
        }
        let Some(store) = self.store.upgrade() else {
            return;
        };
        match self.key {
            Some(key) => {
                if let Some(listeners) = store.keyed.borrow_mut().get_mut(key) {
                    listeners.retain(|registration| registration.id != self.id);
                }
            }
            None => store
                .any
                .borrow_mut()
                .retain(|registration| registration.id != self.id),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}
