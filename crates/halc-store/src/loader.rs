//! Loaders: cached async derived computations
//!
//! A [`Loader<V>`] is an async function of store state. The store caches its
//! result, records every block and loader the run read in a dependency
//! ledger, and reuses the cache until one of those dependencies changes.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};

use crate::block::{Block, Trigger};
use crate::errors::{StoreError, StoreResult};
use crate::hub::ErasedHandler;
use crate::ledger::{
    DependencyCheck, DependencyKey, DependencyLedger, FreshnessProbe, ResolvePass, ValueCheck,
};
use crate::loadable::LoadFuture;
use crate::message::{next_id, Message};
use crate::store::{Store, WeakStore};

type ComputeFn<V> = Box<dyn Fn(LoaderToolbox) -> LocalBoxFuture<'static, StoreResult<V>> + Send + Sync>;

/// Freshness of a loader's cache in one store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Freshness {
    /// Must run on next load
    Stale,
    /// A dependency reported a change; verified lazily on next load
    MaybeStale,
    /// Cached value can be reused
    Fresh,
    /// A run is in flight
    Loading,
    /// The last run failed; next load retries
    Error,
}

struct LoaderDef<V> {
    id: Arc<str>,
    compute: ComputeFn<V>,
    done: Message<V>,
    started: Message<()>,
    invalidated: Message<()>,
}

/// Cached async computation definition.
///
/// Cloning yields a handle to the **same** definition.
pub struct Loader<V> {
    def: Arc<LoaderDef<V>>,
}

impl<V: Clone + 'static> Loader<V> {
    /// Define a loader. The id is `name` plus a process-unique suffix.
    pub fn new<F, Fut>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(LoaderToolbox) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<V>> + 'static,
    {
        let name = name.into();
        Self::with_id(format!("{name}#{}", next_id()), compute)
    }

    /// Define a loader with an exact id, so hydrated caches can be matched
    /// across processes.
    ///
    /// Two definitions sharing an id share runtime state in a store.
    pub fn with_id<F, Fut>(id: impl Into<String>, compute: F) -> Self
    where
        F: Fn(LoaderToolbox) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<V>> + 'static,
    {
        let id: Arc<str> = Arc::from(id.into());
        Self {
            def: Arc::new(LoaderDef {
                done: Message::new(format!("{id}-done")),
                started: Message::new(format!("{id}-started")),
                invalidated: Message::new(format!("{id}-invalidated")),
                compute: Box::new(move |tools| compute(tools).boxed_local()),
                id,
            }),
        }
    }

    /// Trigger for block rules reacting to successful runs.
    ///
    /// Blocks created after the loader already finished replay its cached
    /// value on first touch.
    pub fn done(&self) -> Trigger<V> {
        Trigger::loader_done(self)
    }
}

impl<V> Loader<V> {
    /// Unique id of this loader
    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub(crate) fn key(&self) -> &Arc<str> {
        &self.def.id
    }

    /// Published with the value after every successful run
    pub fn done_message(&self) -> &Message<V> {
        &self.def.done
    }

    /// Published when a new run begins
    pub fn started(&self) -> &Message<()> {
        &self.def.started
    }

    /// Published when the cache leaves `Fresh`
    pub fn invalidated(&self) -> &Message<()> {
        &self.def.invalidated
    }

    pub(crate) fn compute(&self, tools: LoaderToolbox) -> LocalBoxFuture<'static, StoreResult<V>> {
        (self.def.compute)(tools)
    }
}

impl<V> Clone for Loader<V> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<V> fmt::Debug for Loader<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader").field("id", &self.def.id).finish()
    }
}

/// Cancellation and completion flags shared by every generation of one run.
#[derive(Debug, Default)]
pub(crate) struct RunToken {
    pub(crate) cancelled: Cell<bool>,
    pub(crate) settled: Cell<bool>,
}

/// Per-generation context behind a [`LoaderToolbox`].
pub(crate) struct RunContext {
    pub(crate) loader_id: Arc<str>,
    pub(crate) generation: u64,
    pub(crate) token: Rc<RunToken>,
    pub(crate) ledger: Weak<RefCell<DependencyLedger>>,
    pub(crate) on_invalidated: ErasedHandler,
}

impl RunContext {
    /// Ledger to record into, if this generation can still affect the cache.
    fn live_ledger(&self) -> Option<Rc<RefCell<DependencyLedger>>> {
        if self.token.cancelled.get() || self.token.settled.get() {
            return None;
        }
        self.ledger.upgrade()
    }
}

/// Read access handed to a loader body.
///
/// Every read is recorded as a dependency of the current run.
#[derive(Clone)]
pub struct LoaderToolbox {
    store: WeakStore,
    run: Rc<RunContext>,
}

impl LoaderToolbox {
    pub(crate) fn new(store: WeakStore, run: RunContext) -> Self {
        Self {
            store,
            run: Rc::new(run),
        }
    }

    /// Read a block and depend on it.
    pub fn get<T: Clone + 'static>(&self, block: &Block<T>) -> StoreResult<T> {
        let store = self.store.upgrade()?;
        let value = store.get(block)?;

        if let Some(ledger) = self.run.live_ledger() {
            let key = DependencyKey::Block(block.key().clone());
            let observed = value.clone();
            let target = block.clone();
            let check: ValueCheck = Rc::new(move |store: &Store| {
                let now = store.get(&target)?;
                Ok(target.is_same(&observed, &now))
            });
            let subscription = if ledger.borrow().contains(&key) {
                None
            } else {
                Some(
                    store
                        .hub()
                        .subscribe_erased(block.changed().id(), self.run.on_invalidated.clone()),
                )
            };
            ledger
                .borrow_mut()
                .record(key, DependencyCheck::Value(check), subscription);
        }
        Ok(value)
    }

    /// Load another loader and depend on it.
    ///
    /// Loading the loader that is currently running fails with
    /// [`StoreError::CycleDetected`].
    pub fn load<T: Clone + 'static>(&self, loader: &Loader<T>) -> LoadFuture<T> {
        match self.load_dependency(loader) {
            Ok(future) => future,
            Err(error) => futures::future::ready(Err(error)).boxed_local().shared(),
        }
    }

    fn load_dependency<T: Clone + 'static>(&self, loader: &Loader<T>) -> StoreResult<LoadFuture<T>> {
        if loader.key() == &self.run.loader_id {
            return Err(StoreError::cycle([loader.id(), loader.id()]));
        }
        let store = self.store.upgrade()?;
        let loadable = store.load(loader)?;

        // Sequence of the snapshot this run consumes. Known up front for a
        // settled cache, otherwise once the in-flight run has settled.
        let observed = Rc::new(Cell::new(None));
        let future = if loadable.is_loading() {
            let pending = loadable.future();
            let store = self.store.clone();
            let (loader, observed) = (loader.clone(), observed.clone());
            async move {
                let outcome = pending.await;
                if outcome.is_ok() {
                    if let Ok(store) = store.upgrade() {
                        observed.set(store.cached_snapshot(&loader).map(|last| last.sequence));
                    }
                }
                outcome
            }
            .boxed_local()
            .shared()
        } else {
            observed.set(
                loadable
                    .get()
                    .and(loadable.last_loaded())
                    .map(|last| last.sequence),
            );
            loadable.future()
        };

        if let Some(ledger) = self.run.live_ledger() {
            let key = DependencyKey::Loader(loader.key().clone());
            let probe: Rc<dyn FreshnessProbe> = Rc::new(LoaderProbe {
                loader: loader.clone(),
                observed,
            });
            let subscription = if ledger.borrow().contains(&key) {
                None
            } else {
                Some(
                    store
                        .hub()
                        .subscribe_erased(loader.invalidated().id(), self.run.on_invalidated.clone()),
                )
            };
            ledger
                .borrow_mut()
                .record(key, DependencyCheck::Loader(probe), subscription);
        }
        Ok(future)
    }

    /// Whether the store will ignore this run's result.
    ///
    /// Long loader bodies may poll this to stop early; results of cancelled
    /// or superseded runs are discarded either way.
    pub fn is_cancelled(&self) -> bool {
        self.run.token.cancelled.get() || self.run.ledger.strong_count() == 0
    }

    /// Generation of the run this toolbox belongs to
    pub fn generation(&self) -> u64 {
        self.run.generation
    }
}

impl fmt::Debug for LoaderToolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderToolbox")
            .field("loader", &self.run.loader_id)
            .field("generation", &self.run.generation)
            .finish()
    }
}

struct LoaderProbe<T> {
    loader: Loader<T>,
    observed: Rc<Cell<Option<u64>>>,
}

impl<T: Clone + 'static> FreshnessProbe for LoaderProbe<T> {
    fn loader_id(&self) -> &Arc<str> {
        self.loader.key()
    }

    /// Fresh, and still holding the snapshot the dependent run consumed.
    fn resolve(&self, store: &Store, pass: &mut ResolvePass) -> StoreResult<bool> {
        if !store.resolve_freshness(&self.loader, pass)? {
            return Ok(false);
        }
        let current = store.cached_snapshot(&self.loader).map(|last| last.sequence);
        Ok(current.is_some() && current == self.observed.get())
    }
}
