//! Actions: named entry points that mutate the store
//!
//! A [`SignalAction`] only publishes its payload; blocks react through
//! their update rules. An [`EffectAction`] additionally runs a function
//! (sync or async) and publishes the result on success.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures::future::{FutureExt, LocalBoxFuture};

use crate::block::{Block, Trigger};
use crate::errors::StoreResult;
use crate::loadable::LoadFuture;
use crate::loader::Loader;
use crate::message::Message;
use crate::store::Store;

/// Anything that can be dispatched on a store.
pub trait Action {
    /// Payload passed to [`Store::dispatch`] or [`Store::dispatch_effect`]
    type Payload: 'static;

    /// Published with the payload on every dispatch
    fn dispatched(&self) -> &Message<Self::Payload>;
}

/// Action that only announces its payload.
pub struct SignalAction<P> {
    dispatched: Message<P>,
}

impl<P> SignalAction<P> {
    /// Define a signal action.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            dispatched: Message::new(format!("action-{}-dispatched", name.into())),
        }
    }

    /// Trigger for block rules reacting to this action
    pub fn trigger(&self) -> Trigger<P> {
        Trigger::from(&self.dispatched)
    }
}

impl<P: 'static> Action for SignalAction<P> {
    type Payload = P;

    fn dispatched(&self) -> &Message<P> {
        &self.dispatched
    }
}

impl<P> Clone for SignalAction<P> {
    fn clone(&self) -> Self {
        Self {
            dispatched: self.dispatched.clone(),
        }
    }
}

impl<P> fmt::Debug for SignalAction<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalAction")
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

/// Result of an effect action's run function
pub enum Effect<R> {
    /// Completed synchronously
    Ready(StoreResult<R>),
    /// Completes when the future resolves
    Pending(LocalBoxFuture<'static, StoreResult<R>>),
}

impl<R> Effect<R> {
    /// Wrap an async result
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = StoreResult<R>> + 'static,
    {
        Self::Pending(future.boxed_local())
    }
}

impl<R> From<StoreResult<R>> for Effect<R> {
    fn from(result: StoreResult<R>) -> Self {
        Self::Ready(result)
    }
}

impl<R> fmt::Debug for Effect<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f
                .debug_tuple("Ready")
                .field(&result.as_ref().map(|_| ()))
                .finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

type RunFn<P, R> = Box<dyn Fn(ActionToolbox, P) -> Effect<R> + Send + Sync>;

struct EffectDef<P, R> {
    name: Arc<str>,
    run: RunFn<P, R>,
    dispatched: Message<P>,
    done: Message<R>,
}

/// Action with a side-effecting run function.
///
/// Cloning yields a handle to the **same** definition.
pub struct EffectAction<P, R> {
    def: Arc<EffectDef<P, R>>,
}

impl<P: 'static, R: 'static> EffectAction<P, R> {
    /// Define an effect action from a run function returning an [`Effect`].
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(ActionToolbox, P) -> Effect<R> + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        Self {
            def: Arc::new(EffectDef {
                dispatched: Message::new(format!("action-{name}-dispatched")),
                done: Message::new(format!("action-{name}-done")),
                run: Box::new(run),
                name,
            }),
        }
    }

    /// Define an effect action with a synchronous run function.
    pub fn sync<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(ActionToolbox, P) -> StoreResult<R> + Send + Sync + 'static,
    {
        Self::new(name, move |tools, payload| Effect::Ready(run(tools, payload)))
    }

    /// Define an effect action with an async run function.
    pub fn future<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(ActionToolbox, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<R>> + 'static,
    {
        Self::new(name, move |tools, payload| Effect::pending(run(tools, payload)))
    }
}

impl<P, R> EffectAction<P, R> {
    /// Name given at definition
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Published with the result after every successful run
    pub fn done(&self) -> &Message<R> {
        &self.def.done
    }

    /// Trigger for block rules reacting to dispatches
    pub fn trigger(&self) -> Trigger<P> {
        Trigger::from(&self.def.dispatched)
    }

    /// Trigger for block rules reacting to successful runs
    pub fn done_trigger(&self) -> Trigger<R> {
        Trigger::from(&self.def.done)
    }

    pub(crate) fn run(&self, tools: ActionToolbox, payload: P) -> Effect<R> {
        (self.def.run)(tools, payload)
    }
}

impl<P: 'static, R> Action for EffectAction<P, R> {
    type Payload = P;

    fn dispatched(&self) -> &Message<P> {
        &self.def.dispatched
    }
}

impl<P, R> Clone for EffectAction<P, R> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<P, R> fmt::Debug for EffectAction<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectAction")
            .field("name", &self.def.name)
            .finish()
    }
}

/// Outcome of [`Store::dispatch_effect`].
///
/// Await it (it implements [`IntoFuture`]) to get the result either way.
pub enum Dispatched<R> {
    /// The run function completed synchronously
    Ready(R),
    /// The run function is still in progress
    Pending(LocalBoxFuture<'static, StoreResult<R>>),
}

impl<R> Dispatched<R> {
    /// Whether the run already completed
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The result, if the run completed synchronously
    pub fn ready(self) -> Option<R> {
        match self {
            Self::Ready(result) => Some(result),
            Self::Pending(_) => None,
        }
    }
}

impl<R: 'static> IntoFuture for Dispatched<R> {
    type Output = StoreResult<R>;
    type IntoFuture = LocalBoxFuture<'static, StoreResult<R>>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Ready(result) => futures::future::ready(Ok(result)).boxed_local(),
            Self::Pending(future) => future,
        }
    }
}

impl<R> fmt::Debug for Dispatched<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Ready"),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// Store access handed to an effect action's run function.
#[derive(Clone)]
pub struct ActionToolbox {
    store: Store,
}

impl ActionToolbox {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Read a block.
    pub fn get<V: Clone + 'static>(&self, block: &Block<V>) -> StoreResult<V> {
        self.store.get(block)
    }

    /// Load a loader and return the future of its value.
    pub fn load<V: Clone + 'static>(&self, loader: &Loader<V>) -> StoreResult<LoadFuture<V>> {
        Ok(self.store.load(loader)?.future())
    }

    /// Dispatch a signal action.
    pub fn dispatch<P: 'static>(&self, action: &SignalAction<P>, payload: P) -> StoreResult<()> {
        self.store.dispatch(action, payload)
    }

    /// Dispatch another effect action.
    pub fn dispatch_effect<P: 'static, Q: 'static>(
        &self,
        action: &EffectAction<P, Q>,
        payload: P,
    ) -> StoreResult<Dispatched<Q>> {
        self.store.dispatch_effect(action, payload)
    }

    /// Force the next load of `loader` to run.
    pub fn invalidate<V: Clone + 'static>(&self, loader: &Loader<V>) -> StoreResult<()> {
        self.store.invalidate_cache(loader)
    }
}

impl fmt::Debug for ActionToolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionToolbox").finish_non_exhaustive()
    }
}
