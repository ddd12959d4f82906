//! The store: per-instance runtime state for blocks, loaders and actions
//!
//! Definitions are shared and immutable; everything mutable lives here,
//! keyed by definition id and created on first touch. A store is
//! single-threaded (`!Send`): futures it hands out are driven by whoever
//! awaits them, and the store never spawns.
//!
//! # Layout
//!
//! - `blocks`: block runtime state, rule subscriptions and seed replay
//! - `loaders`: the cache freshness machine and staleness resolution
//! - `dispatch`: signal and effect action dispatch

mod blocks;
mod dispatch;
mod loaders;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::{Action, EffectAction};
use crate::block::Block;
use crate::config::StoreConfig;
use crate::errors::{StoreError, StoreResult};
use crate::hub::{MessageHub, Subscription};
use crate::loader::Loader;
use crate::message::{Message, MessageId};

pub use loaders::{CancelLoad, InitialCache};

/// Definitions whose changes can be observed with [`Store::on_invalidate`].
pub trait Invalidates {
    /// Channel published when the target may have changed
    fn invalidation(&self) -> &Message<()>;
}

impl<V> Invalidates for Block<V> {
    fn invalidation(&self) -> &Message<()> {
        self.changed()
    }
}

impl<V> Invalidates for Loader<V> {
    fn invalidation(&self) -> &Message<()> {
        self.invalidated()
    }
}

/// Snapshot of a store's size, for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Blocks with runtime state
    pub blocks: usize,
    /// Loaders with runtime state
    pub loaders: usize,
    /// Live bus subscriptions (rules, ledgers and listeners)
    pub subscriptions: usize,
    /// Effect actions with at least one dispatch in flight
    pub running_actions: usize,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    hub: MessageHub,
    blocks: RefCell<HashMap<Arc<str>, Rc<dyn Any>>>,
    loaders: RefCell<HashMap<Arc<str>, Rc<dyn Any>>>,
    actions: RefCell<HashMap<MessageId, Rc<Cell<usize>>>>,
    sequence: Cell<u64>,
}

/// Reactive state-and-cache store.
///
/// Cloning yields a handle to the **same** store.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

/// Non-owning store handle held by toolboxes and bus handlers.
#[derive(Clone)]
pub(crate) struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub(crate) fn upgrade(&self) -> StoreResult<Store> {
        self.inner
            .upgrade()
            .map(|inner| Store { inner })
            .ok_or_else(|| StoreError::internal("store dropped while still in use"))
    }
}

impl Store {
    /// Create a store with default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a store with the given configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        tracing::debug!(store = %config.label, "store created");
        Self {
            inner: Rc::new(StoreInner {
                config,
                hub: MessageHub::new(),
                blocks: RefCell::new(HashMap::new()),
                loaders: RefCell::new(HashMap::new()),
                actions: RefCell::new(HashMap::new()),
                sequence: Cell::new(0),
            }),
        }
    }

    /// The store's configuration
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub(crate) fn hub(&self) -> &MessageHub {
        &self.inner.hub
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        let next = self.inner.sequence.get() + 1;
        self.inner.sequence.set(next);
        next
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bus surface
    // ─────────────────────────────────────────────────────────────────────

    /// Publish an application-defined message on this store's bus.
    pub fn publish<P: 'static>(&self, message: &Message<P>, payload: &P) -> StoreResult<()> {
        self.inner.hub.publish(message, payload)
    }

    /// Subscribe to any message on this store's bus.
    pub fn subscribe<P, F>(&self, message: &Message<P>, handler: F) -> Subscription
    where
        P: 'static,
        F: Fn(&P) -> StoreResult<()> + 'static,
    {
        self.inner.hub.subscribe(message, handler)
    }

    /// Listen for changes of a block or invalidation of a loader cache.
    pub fn on_invalidate<T, F>(&self, target: &T, listener: F) -> Subscription
    where
        T: Invalidates + ?Sized,
        F: Fn() + 'static,
    {
        self.inner.hub.subscribe(target.invalidation(), move |_| {
            listener();
            Ok(())
        })
    }

    /// Listen for new runs of `loader`.
    pub fn on_load_start<V, F>(&self, loader: &Loader<V>, listener: F) -> Subscription
    where
        F: Fn() + 'static,
    {
        self.inner.hub.subscribe(loader.started(), move |_| {
            listener();
            Ok(())
        })
    }

    /// Listen for successful runs of `loader`.
    pub fn on_load_success<V, F>(&self, loader: &Loader<V>, listener: F) -> Subscription
    where
        V: 'static,
        F: Fn(&V) + 'static,
    {
        self.inner.hub.subscribe(loader.done_message(), move |value| {
            listener(value);
            Ok(())
        })
    }

    /// Listen for dispatches of a signal or effect action.
    pub fn on_action_dispatch<A, F>(&self, action: &A, listener: F) -> Subscription
    where
        A: Action,
        F: Fn(&A::Payload) + 'static,
    {
        self.inner.hub.subscribe(action.dispatched(), move |payload| {
            listener(payload);
            Ok(())
        })
    }

    /// Listen for successful completions of an effect action.
    pub fn on_action_success<P, R, F>(&self, action: &EffectAction<P, R>, listener: F) -> Subscription
    where
        R: 'static,
        F: Fn(&R) + 'static,
    {
        self.inner.hub.subscribe(action.done(), move |result| {
            listener(result);
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Current size of the store.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            blocks: self.inner.blocks.borrow().len(),
            loaders: self.inner.loaders.borrow().len(),
            subscriptions: self.inner.hub.total_subscriptions(),
            running_actions: self
                .inner
                .actions
                .borrow()
                .values()
                .filter(|count| count.get() > 0)
                .count(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("label", &self.inner.config.label)
            .field("stats", &self.stats())
            .finish()
    }
}

fn downcast_state<T: 'static>(id: &str, state: Rc<dyn Any>) -> StoreResult<Rc<T>> {
    state.downcast::<T>().map_err(|_| {
        StoreError::internal(format!(
            "definition {id} is registered with a different value type"
        ))
    })
}
