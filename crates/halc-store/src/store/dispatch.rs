//! Action dispatch and in-flight tracking

use std::cell::Cell;
use std::rc::Rc;

use futures::future::FutureExt;

use super::Store;
use crate::action::{Action, ActionToolbox, Dispatched, Effect, EffectAction, SignalAction};
use crate::errors::StoreResult;

/// Holds one in-flight slot of an effect action until dropped.
struct InFlight {
    count: Rc<Cell<usize>>,
}

impl InFlight {
    fn enter(count: Rc<Cell<usize>>) -> Self {
        count.set(count.get() + 1);
        Self { count }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.count.set(self.count.get().saturating_sub(1));
    }
}

impl Store {
    /// Publish a signal action's payload.
    pub fn dispatch<P: 'static>(&self, action: &SignalAction<P>, payload: P) -> StoreResult<()> {
        tracing::debug!(
            store = %self.label(),
            action = %action.dispatched().name(),
            "signal dispatched"
        );
        self.inner.hub.publish(action.dispatched(), &payload)
    }

    /// Dispatch an effect action.
    ///
    /// `dispatched` is published before the run function is called; `done`
    /// is published after it succeeds. The in-flight count is released
    /// before `done` is published and also when the run fails or the
    /// returned future is dropped.
    pub fn dispatch_effect<P: 'static, R: 'static>(
        &self,
        action: &EffectAction<P, R>,
        payload: P,
    ) -> StoreResult<Dispatched<R>> {
        let guard = InFlight::enter(self.action_counter(action));
        tracing::debug!(store = %self.label(), action = %action.name(), "effect dispatched");
        self.inner.hub.publish(action.dispatched(), &payload)?;

        match action.run(ActionToolbox::new(self.clone()), payload) {
            Effect::Ready(result) => {
                drop(guard);
                let value = result?;
                self.inner.hub.publish(action.done(), &value)?;
                Ok(Dispatched::Ready(value))
            }
            Effect::Pending(future) => {
                let store = self.downgrade();
                let action = action.clone();
                Ok(Dispatched::Pending(
                    async move {
                        let result = future.await;
                        drop(guard);
                        let value = result?;
                        let store = store.upgrade()?;
                        tracing::debug!(
                            store = %store.label(),
                            action = %action.name(),
                            "effect completed"
                        );
                        store.inner.hub.publish(action.done(), &value)?;
                        Ok(value)
                    }
                    .boxed_local(),
                ))
            }
        }
    }

    /// Whether a dispatch of `action` is still in flight.
    pub fn is_action_running<P: 'static, R>(&self, action: &EffectAction<P, R>) -> bool {
        let running = self
            .inner
            .actions
            .borrow()
            .get(&action.dispatched().id())
            .is_some_and(|count| count.get() > 0);
        running
    }

    fn action_counter<P: 'static, R>(&self, action: &EffectAction<P, R>) -> Rc<Cell<usize>> {
        self.inner
            .actions
            .borrow_mut()
            .entry(action.dispatched().id())
            .or_default()
            .clone()
    }
}
