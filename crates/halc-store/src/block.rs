//! Blocks: named value cells
//!
//! A [`Block<V>`] is an immutable definition: an id, a default factory, an
//! equality comparer, and a rule builder describing how bus messages update
//! the value. Runtime state lives in each [`Store`](crate::Store) and is
//! created on first touch.
//!
//! Definitions are `Send + Sync`, so they can be declared as statics and
//! shared between stores.
//!
//! ```rust,ignore
//! static SET_COUNT: Lazy<SignalAction<i64>> = Lazy::new(|| SignalAction::new("set_count"));
//! static COUNT: Lazy<Block<i64>> = Lazy::new(|| {
//!     Block::builder("count")
//!         .default(|| 0)
//!         .update(|rules, _tools| {
//!             rules.on(SET_COUNT.trigger(), |_, n| Update::Changed(*n));
//!         })
//!         .build()
//! });
//! ```

use std::any::Any;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::errors::{StoreError, StoreResult};
use crate::loader::Loader;
use crate::message::{next_id, Message, MessageId};
use crate::store::{Store, WeakStore};

type DefaultFn<V> = Box<dyn Fn() -> V + Send + Sync>;
type EqualsFn<V> = Box<dyn Fn(&V, &V) -> bool + Send + Sync>;
type RuleBuilderFn<V> = Box<dyn Fn(&mut UpdateRules<V>, &UpdateToolbox) + Send + Sync>;

pub(crate) type RuleFn<V> = Rc<dyn Fn(&V, &dyn Any) -> Update<V>>;

/// A replayable payload: `(loaded_at, sequence, value)`.
pub(crate) type SeedValue = (u64, u64, Box<dyn Any>);
pub(crate) type SeedFn = Rc<dyn Fn(&Store) -> Option<SeedValue>>;

/// Outcome of an update rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<V> {
    /// Replace the value (still skipped if `equals` to the current one)
    Changed(V),
    /// Leave the value alone
    Unchanged,
}

impl<V> From<Option<V>> for Update<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => Self::Changed(v),
            None => Self::Unchanged,
        }
    }
}

struct BlockDef<V> {
    id: Arc<str>,
    default: Option<DefaultFn<V>>,
    equals: EqualsFn<V>,
    changed: Message<()>,
    rules: Option<RuleBuilderFn<V>>,
}

/// A named value cell definition.
///
/// Cloning yields a handle to the **same** definition.
pub struct Block<V> {
    def: Arc<BlockDef<V>>,
}

impl<V: Clone + 'static> Block<V> {
    /// Start defining a block.
    pub fn builder(name: impl Into<String>) -> BlockBuilder<V> {
        BlockBuilder {
            name: name.into(),
            default: None,
            equals: None,
            rules: None,
        }
    }

    /// Shorthand for a block with a default and no update rules.
    pub fn new<F>(name: impl Into<String>, default: F) -> Self
    where
        V: PartialEq,
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self::builder(name).default(default).build()
    }
}

impl<V> Block<V> {
    /// Unique id of this block
    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub(crate) fn key(&self) -> &Arc<str> {
        &self.def.id
    }

    /// Published (with `()`) whenever the value changes in a store
    pub fn changed(&self) -> &Message<()> {
        &self.def.changed
    }

    /// Compare two values with this block's comparer
    pub fn is_same(&self, a: &V, b: &V) -> bool {
        (self.def.equals)(a, b)
    }

    pub(crate) fn make_default(&self) -> StoreResult<V> {
        match &self.def.default {
            Some(default) => Ok(default()),
            None => Err(StoreError::missing_default(self.id())),
        }
    }

    pub(crate) fn build_rules(&self, rules: &mut UpdateRules<V>, toolbox: &UpdateToolbox) {
        if let Some(builder) = &self.def.rules {
            builder(rules, toolbox);
        }
    }
}

impl<V> Clone for Block<V> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<V> fmt::Debug for Block<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("id", &self.def.id).finish()
    }
}

/// Builder for [`Block`]
pub struct BlockBuilder<V> {
    name: String,
    default: Option<DefaultFn<V>>,
    equals: Option<EqualsFn<V>>,
    rules: Option<RuleBuilderFn<V>>,
}

impl<V: Clone + 'static> BlockBuilder<V> {
    /// Value used on first access in a store.
    ///
    /// Without a default, reading the block fails with
    /// [`StoreError::MissingDefault`].
    pub fn default<F>(mut self, default: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        self.default = Some(Box::new(default));
        self
    }

    /// Custom equality used to suppress no-op writes and to verify freshness.
    pub fn equals<F>(mut self, equals: F) -> Self
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        self.equals = Some(Box::new(equals));
        self
    }

    /// Declare the update rules. Evaluated once per store, on first touch.
    pub fn update<F>(mut self, rules: F) -> Self
    where
        F: Fn(&mut UpdateRules<V>, &UpdateToolbox) + Send + Sync + 'static,
    {
        self.rules = Some(Box::new(rules));
        self
    }

    /// Finish, comparing values with `PartialEq` unless [`equals`](Self::equals) was set.
    pub fn build(self) -> Block<V>
    where
        V: PartialEq,
    {
        let equals = self.equals.unwrap_or_else(|| Box::new(|a: &V, b: &V| a == b));
        Self::finish(self.name, self.default, equals, self.rules)
    }

    /// Finish with an explicit comparer, for types without `PartialEq`.
    pub fn build_with_equals<F>(self, equals: F) -> Block<V>
    where
        F: Fn(&V, &V) -> bool + Send + Sync + 'static,
    {
        Self::finish(self.name, self.default, Box::new(equals), self.rules)
    }

    fn finish(
        name: String,
        default: Option<DefaultFn<V>>,
        equals: EqualsFn<V>,
        rules: Option<RuleBuilderFn<V>>,
    ) -> Block<V> {
        let id: Arc<str> = Arc::from(format!("{name}#{}", next_id()));
        Block {
            def: Arc::new(BlockDef {
                changed: Message::new(format!("{id}-changed")),
                id,
                default,
                equals,
                rules,
            }),
        }
    }
}

/// What a rule reacts to: a plain message, or a loader's completion.
///
/// Loader completions can be replayed into blocks created after the loader
/// already finished.
pub struct Trigger<P> {
    message: Message<P>,
    seed: Option<SeedFn>,
}

impl<P: Clone + 'static> Trigger<P> {
    pub(crate) fn loader_done(loader: &Loader<P>) -> Self {
        let source = loader.clone();
        Self {
            message: loader.done_message().clone(),
            seed: Some(Rc::new(move |store: &Store| {
                store.cached_snapshot(&source).map(|last| {
                    (
                        last.loaded_at,
                        last.sequence,
                        Box::new(last.value) as Box<dyn Any>,
                    )
                })
            })),
        }
    }
}

impl<P> From<&Message<P>> for Trigger<P> {
    fn from(message: &Message<P>) -> Self {
        Self {
            message: message.clone(),
            seed: None,
        }
    }
}

impl<P> From<Message<P>> for Trigger<P> {
    fn from(message: Message<P>) -> Self {
        Self {
            message,
            seed: None,
        }
    }
}

pub(crate) struct Rule<V> {
    pub(crate) message: MessageId,
    pub(crate) apply: RuleFn<V>,
    pub(crate) seed: Option<SeedFn>,
}

/// Rule set handed to a block's rule builder.
pub struct UpdateRules<V> {
    rules: Vec<Rule<V>>,
}

impl<V: 'static> UpdateRules<V> {
    pub(crate) fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Update the block whenever `trigger` fires.
    pub fn on<P, F>(&mut self, trigger: Trigger<P>, update: F) -> &mut Self
    where
        P: 'static,
        F: Fn(&V, &P) -> Update<V> + 'static,
    {
        self.rules.push(Rule {
            message: trigger.message.id(),
            apply: Rc::new(move |current: &V, payload: &dyn Any| {
                match payload.downcast_ref::<P>() {
                    Some(p) => update(current, p),
                    None => Update::Unchanged,
                }
            }),
            seed: trigger.seed,
        });
        self
    }

    /// Number of rules declared so far
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule has been declared
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub(crate) fn into_rules(self) -> Vec<Rule<V>> {
        self.rules
    }
}

/// Side-effect toolbox available to update rules.
#[derive(Clone)]
pub struct UpdateToolbox {
    store: WeakStore,
}

impl UpdateToolbox {
    pub(crate) fn new(store: WeakStore) -> Self {
        Self { store }
    }

    /// Explicitly invalidate a loader's cache.
    pub fn invalidate<T: Clone + 'static>(&self, loader: &Loader<T>) -> StoreResult<()> {
        self.store.upgrade()?.invalidate_cache(loader)
    }
}

impl fmt::Debug for UpdateToolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateToolbox").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_per_definition() {
        let a: Block<i32> = Block::new("count", || 0);
        let b: Block<i32> = Block::new("count", || 0);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("count#"));
        assert_ne!(a.changed(), b.changed());
    }

    #[test]
    fn test_default_and_missing_default() {
        let with: Block<i32> = Block::new("with", || 3);
        assert_eq!(with.make_default(), Ok(3));

        let without: Block<i32> = Block::builder("without").build();
        assert!(matches!(
            without.make_default(),
            Err(StoreError::MissingDefault { .. })
        ));
    }

    #[test]
    fn test_custom_equality() {
        let block: Block<(u32, String)> = Block::builder("user")
            .default(|| (1, "a".to_string()))
            .equals(|a, b| a.0 == b.0)
            .build();
        assert!(block.is_same(&(1, "a".into()), &(1, "b".into())));
        assert!(!block.is_same(&(1, "a".into()), &(2, "a".into())));
    }

    #[test]
    fn test_build_with_equals_for_non_partial_eq() {
        struct Opaque(u8);
        impl Clone for Opaque {
            fn clone(&self) -> Self {
                Opaque(self.0)
            }
        }
        let block: Block<Opaque> = Block::builder("opaque")
            .default(|| Opaque(0))
            .build_with_equals(|a, b| a.0 == b.0);
        assert!(block.is_same(&Opaque(4), &Opaque(4)));
    }

    #[test]
    fn test_rules_apply_typed_payload() {
        let add: Message<i32> = Message::new("add");
        let mut rules: UpdateRules<i32> = UpdateRules::new();
        rules.on(Trigger::from(&add), |v, n| Update::Changed(v + n));
        assert_eq!(rules.len(), 1);

        let rule = rules.into_rules().pop().unwrap();
        assert_eq!(rule.message, add.id());
        assert!(rule.seed.is_none());
        assert_eq!((rule.apply)(&2, &5i32 as &dyn Any), Update::Changed(7));
        assert_eq!((rule.apply)(&2, &"x" as &dyn Any), Update::Unchanged);
    }

    #[test]
    fn test_update_from_option() {
        assert_eq!(Update::from(Some(1)), Update::Changed(1));
        assert_eq!(Update::<i32>::from(None), Update::Unchanged);
    }

    #[test]
    fn test_block_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Block<std::rc::Rc<u8>>>();
    }
}
