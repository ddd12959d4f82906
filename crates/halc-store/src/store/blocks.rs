//! Block runtime state and the update engine

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use super::{downcast_state, Store};
use crate::block::{Block, RuleFn, SeedValue, Update, UpdateRules, UpdateToolbox};
use crate::errors::StoreResult;
use crate::hub::{ErasedHandler, Subscription};
use crate::loadable::LastLoaded;
use crate::loader::Loader;

pub(super) struct BlockState<V> {
    current: RefCell<V>,
    rules: RefCell<Vec<Subscription>>,
}

impl Store {
    /// Current value of `block`, creating its state on first access.
    pub fn get<V: Clone + 'static>(&self, block: &Block<V>) -> StoreResult<V> {
        let state = self.block_state(block)?;
        let value = state.current.borrow().clone();
        Ok(value)
    }

    fn block_state<V: Clone + 'static>(&self, block: &Block<V>) -> StoreResult<Rc<BlockState<V>>> {
        let existing = self.inner.blocks.borrow().get(block.key()).cloned();
        match existing {
            Some(state) => downcast_state(block.id(), state),
            None => self.init_block(block),
        }
    }

    fn init_block<V: Clone + 'static>(&self, block: &Block<V>) -> StoreResult<Rc<BlockState<V>>> {
        let state = Rc::new(BlockState {
            current: RefCell::new(block.make_default()?),
            rules: RefCell::new(Vec::new()),
        });
        // Registered before rules run so re-entrant reads see this state.
        self.inner
            .blocks
            .borrow_mut()
            .insert(block.key().clone(), state.clone());

        let mut rules = UpdateRules::new();
        block.build_rules(&mut rules, &UpdateToolbox::new(self.downgrade()));

        let mut seeds: Vec<(SeedValue, RuleFn<V>)> = Vec::new();
        let mut subscriptions = Vec::new();
        for rule in rules.into_rules() {
            if let Some(seed) = rule.seed.as_ref().and_then(|seed| seed(self)) {
                seeds.push((seed, rule.apply.clone()));
            }
            let handler: ErasedHandler = {
                let store = self.downgrade();
                let block = block.clone();
                let state = state.clone();
                let apply = rule.apply;
                Rc::new(move |payload: &dyn Any| {
                    store.upgrade()?.apply_rule(&block, &state, &apply, payload)
                })
            };
            subscriptions.push(self.inner.hub.subscribe_erased(rule.message, handler));
        }
        tracing::debug!(
            store = %self.label(),
            block = %block.id(),
            rules = subscriptions.len(),
            seeds = seeds.len(),
            "block initialized"
        );
        state.rules.borrow_mut().extend(subscriptions);

        seeds.sort_by_key(|((loaded_at, sequence, _), _)| (*loaded_at, *sequence));
        for ((_, _, value), apply) in seeds {
            self.apply_rule(block, &state, &apply, value.as_ref())?;
        }
        Ok(state)
    }

    fn apply_rule<V: Clone + 'static>(
        &self,
        block: &Block<V>,
        state: &BlockState<V>,
        apply: &RuleFn<V>,
        payload: &dyn Any,
    ) -> StoreResult<()> {
        // Rules may publish (e.g. through `UpdateToolbox::invalidate`), so the
        // value is not borrowed while one runs.
        let base = state.current.borrow().clone();
        let next = match apply(&base, payload) {
            Update::Changed(next) => next,
            Update::Unchanged => return Ok(()),
        };
        let superseded = !block.is_same(&base, &state.current.borrow());
        if superseded {
            tracing::debug!(
                store = %self.label(),
                block = %block.id(),
                "update computed from a superseded value, dropped"
            );
            return Ok(());
        }
        if block.is_same(&base, &next) {
            return Ok(());
        }
        *state.current.borrow_mut() = next;
        tracing::debug!(store = %self.label(), block = %block.id(), "block updated");
        self.inner.hub.publish(block.changed(), &())
    }

    /// Last successful snapshot of `loader`, whatever its freshness.
    pub(crate) fn cached_snapshot<V: Clone + 'static>(
        &self,
        loader: &Loader<V>,
    ) -> Option<LastLoaded<V>> {
        self.existing_loader_state(loader)
            .and_then(|state| state.last_loaded())
    }
}
