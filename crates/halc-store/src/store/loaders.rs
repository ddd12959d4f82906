//! Loader cache freshness machine
//!
//! | From         | Event                        | To                      |
//! |--------------|------------------------------|-------------------------|
//! | `Stale`      | load                         | `Loading`               |
//! | `Error`      | load                         | `Loading`               |
//! | `Loading`    | run succeeded                | `Fresh`                 |
//! | `Loading`    | run failed                   | `Error`                 |
//! | `Loading`    | dependency changed           | `Loading` (restarted)   |
//! | `Loading`    | cancel                       | `Stale` or `Fresh`      |
//! | `Fresh`      | dependency changed           | `MaybeStale`            |
//! | `MaybeStale` | load, ledger unchanged       | `Fresh`                 |
//! | `MaybeStale` | load, ledger changed         | `Stale`, then `Loading` |
//!
//! `MaybeStale` is resolved lazily on the next `load` by walking the
//! dependency ledger of the last successful run.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

use super::{downcast_state, Store};
use crate::errors::{StoreError, StoreResult};
use crate::hub::ErasedHandler;
use crate::ledger::{DependencyCheck, DependencyLedger, ResolvePass};
use crate::loadable::{LastLoaded, LoadFuture, Loadable};
use crate::loader::{Freshness, Loader, LoaderToolbox, RunContext, RunToken};
use crate::restartable::RestartableComputation;

type SharedLedger = Rc<RefCell<DependencyLedger>>;

/// Options for [`Store::cancel_load`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelLoad {
    /// Leave a previously loaded snapshot `Stale` rather than `Fresh`
    pub mark_as_stale: bool,
}

impl CancelLoad {
    /// Cancel and force the next load to run
    pub fn stale() -> Self {
        Self {
            mark_as_stale: true,
        }
    }
}

/// Hydration input for [`Store::set_initial_cache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialCache<V> {
    /// Value to seed the cache with
    pub value: V,
    /// Treat the seeded value as fresh, so the next load does not run
    pub skip_run: bool,
}

impl<V> InitialCache<V> {
    /// Seed `value`; the next load still runs.
    pub fn new(value: V) -> Self {
        Self {
            value,
            skip_run: false,
        }
    }

    /// Seed `value` as fresh.
    pub fn fresh(value: V) -> Self {
        Self {
            value,
            skip_run: true,
        }
    }
}

struct ActiveRun<V: Clone + 'static> {
    computation: RestartableComputation<StoreResult<V>>,
    token: Rc<RunToken>,
}

enum Cache<V: Clone + 'static> {
    Stale {
        last_loaded: Option<LastLoaded<V>>,
    },
    MaybeStale {
        last_loaded: LastLoaded<V>,
    },
    Fresh {
        last_loaded: LastLoaded<V>,
    },
    Loading {
        loadable: Loadable<V>,
        run: ActiveRun<V>,
    },
    Error {
        loadable: Loadable<V>,
    },
}

impl<V: Clone + 'static> Cache<V> {
    fn freshness(&self) -> Freshness {
        match self {
            Self::Stale { .. } => Freshness::Stale,
            Self::MaybeStale { .. } => Freshness::MaybeStale,
            Self::Fresh { .. } => Freshness::Fresh,
            Self::Loading { .. } => Freshness::Loading,
            Self::Error { .. } => Freshness::Error,
        }
    }

    fn last_loaded(&self) -> Option<LastLoaded<V>> {
        match self {
            Self::Stale { last_loaded } => last_loaded.clone(),
            Self::MaybeStale { last_loaded } | Self::Fresh { last_loaded } => {
                Some(last_loaded.clone())
            }
            Self::Loading { loadable, .. } | Self::Error { loadable } => {
                loadable.last_loaded().cloned()
            }
        }
    }

    fn envelope(&self) -> Option<Loadable<V>> {
        match self {
            Self::Stale { last_loaded } => last_loaded.clone().map(Loadable::value),
            Self::MaybeStale { last_loaded } | Self::Fresh { last_loaded } => {
                Some(Loadable::value(last_loaded.clone()))
            }
            Self::Loading { loadable, .. } | Self::Error { loadable } => Some(loadable.clone()),
        }
    }
}

pub(super) struct LoaderState<V: Clone + 'static> {
    cache: RefCell<Cache<V>>,
    /// Ledger of the last successful run
    ledger: RefCell<Option<SharedLedger>>,
    /// Ledger of the in-flight generation
    pending: RefCell<Option<SharedLedger>>,
}

impl<V: Clone + 'static> LoaderState<V> {
    fn new() -> Self {
        Self {
            cache: RefCell::new(Cache::Stale { last_loaded: None }),
            ledger: RefCell::new(None),
            pending: RefCell::new(None),
        }
    }

    pub(super) fn last_loaded(&self) -> Option<LastLoaded<V>> {
        self.cache.borrow().last_loaded()
    }

    /// Swap the cache, dropping the previous state outside the borrow.
    fn replace_cache(&self, next: Cache<V>) {
        let previous = self.cache.replace(next);
        drop(previous);
    }

    fn release_ledger(&self) {
        let released = self.ledger.borrow_mut().take();
        if let Some(ledger) = released {
            ledger.borrow_mut().release();
        }
    }

    fn release_pending(&self) {
        let released = self.pending.borrow_mut().take();
        if let Some(ledger) = released {
            ledger.borrow_mut().release();
        }
    }
}

enum Reaction<V: Clone + 'static> {
    Restart(RestartableComputation<StoreResult<V>>),
    Invalidate(LastLoaded<V>),
    Ignore,
}

impl Store {
    /// Load `loader`, reusing the cache when it is still valid.
    ///
    /// Concurrent callers share one in-flight run. A stale or failed cache
    /// starts a new run; the returned envelope's future drives it.
    pub fn load<V: Clone + 'static>(&self, loader: &Loader<V>) -> StoreResult<Loadable<V>> {
        let state = self.loader_state(loader)?;
        if matches!(*state.cache.borrow(), Cache::MaybeStale { .. }) {
            self.resolve_freshness(loader, &mut ResolvePass::new())?;
        }

        let reusable = match &*state.cache.borrow() {
            Cache::Loading { loadable, .. } => Some(loadable.clone()),
            Cache::Fresh { last_loaded } => Some(Loadable::value(last_loaded.clone())),
            _ => None,
        };
        match reusable {
            Some(loadable) => {
                tracing::trace!(
                    store = %self.label(),
                    loader = %loader.id(),
                    state = ?loadable.state(),
                    "cache reused"
                );
                Ok(loadable)
            }
            None => self.start_run(loader, &state),
        }
    }

    /// Cancel the in-flight run of `loader`. Returns whether a run was
    /// cancelled.
    ///
    /// The cancelled run's result is ignored. The cache falls back to the
    /// previous snapshot (`Fresh`, or `Stale` with
    /// [`mark_as_stale`](CancelLoad::mark_as_stale)), or to an empty `Stale`.
    pub fn cancel_load<V: Clone + 'static>(&self, loader: &Loader<V>, options: CancelLoad) -> bool {
        let Some(state) = self.existing_loader_state(loader) else {
            return false;
        };
        let last_loaded = match &*state.cache.borrow() {
            Cache::Loading { loadable, run } => {
                run.token.cancelled.set(true);
                loadable.last_loaded().cloned()
            }
            _ => return false,
        };
        state.release_pending();

        let next = match last_loaded {
            None => Cache::Stale { last_loaded: None },
            Some(last_loaded) if options.mark_as_stale => Cache::Stale {
                last_loaded: Some(last_loaded),
            },
            Some(last_loaded) => Cache::Fresh { last_loaded },
        };
        state.replace_cache(next);
        tracing::debug!(
            store = %self.label(),
            loader = %loader.id(),
            mark_as_stale = options.mark_as_stale,
            "loader run cancelled"
        );
        true
    }

    /// Force the next load of `loader` to run.
    ///
    /// Cancels an in-flight run. Publishes `invalidated` unless the cache was
    /// already stale or failed.
    pub fn invalidate_cache<V: Clone + 'static>(&self, loader: &Loader<V>) -> StoreResult<()> {
        let Some(state) = self.existing_loader_state(loader) else {
            return Ok(());
        };
        let freshness = state.cache.borrow().freshness();
        match freshness {
            Freshness::Loading => {
                self.cancel_load(loader, CancelLoad::stale());
            }
            Freshness::Fresh | Freshness::MaybeStale => {
                let last_loaded = state.last_loaded();
                state.replace_cache(Cache::Stale { last_loaded });
            }
            Freshness::Stale | Freshness::Error => return Ok(()),
        }
        tracing::debug!(
            store = %self.label(),
            loader = %loader.id(),
            from = ?freshness,
            "loader cache invalidated"
        );
        self.inner.hub.publish(loader.invalidated(), &())
    }

    /// Current envelope of `loader` without starting a run.
    pub fn cached<V: Clone + 'static>(&self, loader: &Loader<V>) -> Option<Loadable<V>> {
        let state = self.existing_loader_state(loader)?;
        let envelope = state.cache.borrow().envelope();
        envelope
    }

    /// Seed a never-loaded cache, e.g. with server-rendered data.
    ///
    /// Has no effect once the loader has a cached value, an in-flight run or
    /// a failure; the existing envelope is returned instead.
    pub fn set_initial_cache<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
        initial: InitialCache<V>,
    ) -> StoreResult<Loadable<V>> {
        let state = self.loader_state(loader)?;
        let untouched = matches!(*state.cache.borrow(), Cache::Stale { last_loaded: None });
        if untouched {
            let snapshot = LastLoaded {
                value: initial.value,
                loaded_at: self.inner.config.clock.now_ms(),
                sequence: self.next_sequence(),
            };
            let next = if initial.skip_run {
                Cache::Fresh {
                    last_loaded: snapshot,
                }
            } else {
                Cache::Stale {
                    last_loaded: Some(snapshot),
                }
            };
            state.replace_cache(next);
            tracing::debug!(
                store = %self.label(),
                loader = %loader.id(),
                skip_run = initial.skip_run,
                "loader cache seeded"
            );
        }
        let envelope = state.cache.borrow().envelope();
        envelope.ok_or_else(|| StoreError::internal(format!("loader {} has no cache", loader.id())))
    }

    /// Freshness of `loader`, or `None` if this store never touched it.
    pub fn freshness<V: Clone + 'static>(&self, loader: &Loader<V>) -> Option<Freshness> {
        let state = self.existing_loader_state(loader)?;
        let freshness = state.cache.borrow().freshness();
        Some(freshness)
    }

    /// Ids of the blocks and loaders `loader` currently depends on, in read
    /// order.
    ///
    /// Reports the last successful run's ledger, or the in-flight one while
    /// loading. A failed run keeps no ledger, so a loader in
    /// [`Freshness::Error`] reports none.
    pub fn dependencies<V: Clone + 'static>(&self, loader: &Loader<V>) -> Vec<String> {
        let Some(state) = self.existing_loader_state(loader) else {
            return Vec::new();
        };
        let live = state.ledger.borrow().clone();
        let ledger = live.or_else(|| state.pending.borrow().clone());
        let ids = match ledger {
            Some(ledger) => ledger.borrow().keys().map(|k| k.id().to_string()).collect(),
            None => Vec::new(),
        };
        ids
    }

    // ─────────────────────────────────────────────────────────────────────
    // State lookup
    // ─────────────────────────────────────────────────────────────────────

    fn loader_state<V: Clone + 'static>(&self, loader: &Loader<V>) -> StoreResult<Rc<LoaderState<V>>> {
        let existing = self.inner.loaders.borrow().get(loader.key()).cloned();
        if let Some(state) = existing {
            return downcast_state(loader.id(), state);
        }
        let state = Rc::new(LoaderState::<V>::new());
        self.inner
            .loaders
            .borrow_mut()
            .insert(loader.key().clone(), state.clone());
        Ok(state)
    }

    pub(super) fn existing_loader_state<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
    ) -> Option<Rc<LoaderState<V>>> {
        let existing = self.inner.loaders.borrow().get(loader.key()).cloned()?;
        downcast_state(loader.id(), existing).ok()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Staleness resolution
    // ─────────────────────────────────────────────────────────────────────

    /// Settle a `MaybeStale` cache into `Fresh` or `Stale` by re-checking
    /// its ledger, and report whether the loader ended up fresh.
    pub(crate) fn resolve_freshness<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
        pass: &mut ResolvePass,
    ) -> StoreResult<bool> {
        let id = loader.key();
        if let Some(fresh) = pass.memoized(id) {
            return Ok(fresh);
        }
        let state = self.loader_state(loader)?;
        let snapshot = match &*state.cache.borrow() {
            Cache::Fresh { .. } => return Ok(true),
            Cache::MaybeStale { last_loaded } => last_loaded.clone(),
            _ => return Ok(false),
        };

        if let Err(path) = pass.enter(id) {
            if self.inner.config.detect_cycles {
                return Err(StoreError::cycle(path));
            }
            tracing::warn!(
                store = %self.label(),
                loader = %loader.id(),
                "dependency cycle during staleness check, treating as stale"
            );
            return Ok(false);
        }

        let checks = {
            let ledger = state.ledger.borrow();
            ledger
                .as_ref()
                .map(|ledger| ledger.borrow().checks())
                .unwrap_or_default()
        };
        let mut fresh = true;
        for check in checks {
            let outcome = match &check {
                DependencyCheck::Value(unchanged) => unchanged(self),
                DependencyCheck::Loader(probe) => {
                    tracing::trace!(
                        loader = %loader.id(),
                        dependency = %probe.loader_id(),
                        "checking loader dependency"
                    );
                    probe.resolve(self, pass)
                }
            };
            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    fresh = false;
                    break;
                }
                Err(error) => {
                    pass.abort(id);
                    return Err(error);
                }
            }
        }
        pass.exit(id, fresh);

        // Only settle if nothing moved the cache while checks ran.
        if matches!(*state.cache.borrow(), Cache::MaybeStale { .. }) {
            let next = if fresh {
                Cache::Fresh {
                    last_loaded: snapshot,
                }
            } else {
                Cache::Stale {
                    last_loaded: Some(snapshot),
                }
            };
            state.replace_cache(next);
        }
        tracing::trace!(
            store = %self.label(),
            loader = %loader.id(),
            fresh,
            "staleness resolved"
        );
        Ok(fresh)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────

    fn start_run<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
        state: &Rc<LoaderState<V>>,
    ) -> StoreResult<Loadable<V>> {
        let last_loaded = state.last_loaded();
        state.release_ledger();
        let token = Rc::new(RunToken::default());

        let computation = {
            let store = self.downgrade();
            let weak_state = Rc::downgrade(state);
            let loader = loader.clone();
            let token = token.clone();
            RestartableComputation::start(move |generation| {
                match (store.upgrade(), weak_state.upgrade()) {
                    (Ok(store), Some(state)) => {
                        store.begin_generation(&loader, &state, &token, generation)
                    }
                    _ => futures::future::ready(Err(StoreError::internal(
                        "store dropped before the loader could run",
                    )))
                    .boxed_local(),
                }
            })
        };

        let future: LoadFuture<V> = {
            let latest = computation.latest();
            let store = self.downgrade();
            let weak_state = Rc::downgrade(state);
            let loader = loader.clone();
            let token = token.clone();
            async move {
                let outcome = latest.await;
                if let (Ok(store), Some(state)) = (store.upgrade(), weak_state.upgrade()) {
                    store.settle_run(&loader, &state, &token, &outcome)?;
                }
                outcome
            }
            .boxed_local()
            .shared()
        };

        let loadable = Loadable::loading(future, last_loaded);
        state.replace_cache(Cache::Loading {
            loadable: loadable.clone(),
            run: ActiveRun { computation, token },
        });
        tracing::debug!(store = %self.label(), loader = %loader.id(), "loader run started");
        self.inner.hub.publish(loader.started(), &())?;
        Ok(loadable)
    }

    /// Build one generation of a run: a fresh ledger and toolbox, then the
    /// loader body.
    fn begin_generation<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
        state: &LoaderState<V>,
        token: &Rc<RunToken>,
        generation: u64,
    ) -> LocalBoxFuture<'static, StoreResult<V>> {
        let ledger: SharedLedger = Rc::new(RefCell::new(DependencyLedger::default()));
        let superseded = state.pending.replace(Some(ledger.clone()));
        drop(superseded);

        let on_invalidated: ErasedHandler = {
            let store = self.downgrade();
            let loader = loader.clone();
            let token = token.clone();
            Rc::new(move |_: &dyn Any| match store.upgrade() {
                Ok(store) => store.dependency_invalidated(&loader, &token, generation),
                Err(_) => Ok(()),
            })
        };
        let tools = LoaderToolbox::new(
            self.downgrade(),
            RunContext {
                loader_id: loader.key().clone(),
                generation,
                token: token.clone(),
                ledger: Rc::downgrade(&ledger),
                on_invalidated,
            },
        );
        tracing::trace!(store = %self.label(), loader = %loader.id(), generation, "generation built");
        loader.compute(tools)
    }

    /// Write the outcome of a run into the cache, unless the run was
    /// cancelled or replaced.
    fn settle_run<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
        state: &LoaderState<V>,
        token: &Rc<RunToken>,
        outcome: &StoreResult<V>,
    ) -> StoreResult<()> {
        if token.settled.replace(true) || token.cancelled.get() {
            return Ok(());
        }
        let current = matches!(
            &*state.cache.borrow(),
            Cache::Loading { run, .. } if Rc::ptr_eq(&run.token, token)
        );
        if !current {
            return Ok(());
        }

        let pending = state.pending.borrow_mut().take();
        match outcome {
            Ok(value) => {
                let snapshot = LastLoaded {
                    value: value.clone(),
                    loaded_at: self.inner.config.clock.now_ms(),
                    sequence: self.next_sequence(),
                };
                let dependencies = pending.as_ref().map(|l| l.borrow().len()).unwrap_or(0);
                let released = state.ledger.replace(pending);
                drop(released);
                state.replace_cache(Cache::Fresh {
                    last_loaded: snapshot,
                });
                tracing::debug!(
                    store = %self.label(),
                    loader = %loader.id(),
                    dependencies,
                    "loader run succeeded"
                );
                self.inner.hub.publish(loader.done_message(), value)
            }
            Err(error) => {
                drop(pending);
                let last_loaded = state.last_loaded();
                tracing::warn!(
                    store = %self.label(),
                    loader = %loader.id(),
                    error = %error,
                    "loader run failed"
                );
                state.replace_cache(Cache::Error {
                    loadable: Loadable::error(error.clone(), last_loaded),
                });
                Ok(())
            }
        }
    }

    /// Invoked through a ledger subscription when a dependency of `loader`
    /// changed.
    fn dependency_invalidated<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
        token: &Rc<RunToken>,
        generation: u64,
    ) -> StoreResult<()> {
        let Some(state) = self.existing_loader_state(loader) else {
            return Ok(());
        };
        let reaction = match &*state.cache.borrow() {
            Cache::Loading { run, .. }
                if Rc::ptr_eq(&run.token, token)
                    && !token.cancelled.get()
                    && run.computation.is_current(generation) =>
            {
                Reaction::Restart(run.computation.clone())
            }
            Cache::Fresh { last_loaded } => Reaction::Invalidate(last_loaded.clone()),
            _ => Reaction::Ignore,
        };

        match reaction {
            Reaction::Restart(computation) => {
                let generation = computation.restart();
                tracing::debug!(
                    store = %self.label(),
                    loader = %loader.id(),
                    generation,
                    "dependency changed mid-run, restarted"
                );
                Ok(())
            }
            Reaction::Invalidate(last_loaded) => {
                state.replace_cache(Cache::MaybeStale { last_loaded });
                tracing::debug!(store = %self.label(), loader = %loader.id(), "loader maybe stale");
                self.inner.hub.publish(loader.invalidated(), &())
            }
            Reaction::Ignore => Ok(()),
        }
    }
}
