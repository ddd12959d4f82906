//! Dependency ledgers
//!
//! A ledger records every block and loader a single loader run read. Each
//! entry owns the subscription that reports invalidation of its target, so
//! dropping or [releasing](DependencyLedger::release) a ledger unsubscribes
//! everything at once.
//!
//! Entries keep insertion order, which is the order staleness checks visit
//! them in.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::errors::StoreResult;
use crate::hub::Subscription;
use crate::store::Store;

/// Key of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DependencyKey {
    Block(Arc<str>),
    Loader(Arc<str>),
}

impl DependencyKey {
    pub(crate) fn id(&self) -> &str {
        match self {
            Self::Block(id) | Self::Loader(id) => id,
        }
    }
}

/// Whether a block still holds the value a run observed.
pub(crate) type ValueCheck = Rc<dyn Fn(&Store) -> StoreResult<bool>>;

/// Type-erased access to a loader's freshness, for recursive staleness checks.
pub(crate) trait FreshnessProbe {
    fn loader_id(&self) -> &Arc<str>;

    /// Resolve the loader's `MaybeStale` state and report whether it is fresh.
    fn resolve(&self, store: &Store, pass: &mut ResolvePass) -> StoreResult<bool>;
}

/// A single check to run during staleness resolution
#[derive(Clone)]
pub(crate) enum DependencyCheck {
    Value(ValueCheck),
    Loader(Rc<dyn FreshnessProbe>),
}

struct Entry {
    check: DependencyCheck,
    _subscription: Subscription,
}

/// Everything one loader run depended on.
#[derive(Default)]
pub(crate) struct DependencyLedger {
    entries: IndexMap<DependencyKey, Entry>,
}

impl DependencyLedger {
    pub(crate) fn contains(&self, key: &DependencyKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Record a dependency. Re-reading a known target only refreshes the
    /// recorded check; the existing subscription is kept.
    pub(crate) fn record(
        &mut self,
        key: DependencyKey,
        check: DependencyCheck,
        subscription: Option<Subscription>,
    ) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.check = check;
            return;
        }
        if let Some(subscription) = subscription {
            self.entries.insert(
                key,
                Entry {
                    check,
                    _subscription: subscription,
                },
            );
        }
    }

    /// Snapshot of the checks, in recording order.
    pub(crate) fn checks(&self) -> Vec<DependencyCheck> {
        self.entries.values().map(|e| e.check.clone()).collect()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &DependencyKey> {
        self.entries.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry, unsubscribing all of them.
    pub(crate) fn release(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for DependencyLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Memoization and cycle tracking for one staleness resolution pass.
#[derive(Debug, Default)]
pub(crate) struct ResolvePass {
    resolved: HashMap<Arc<str>, bool>,
    stack: Vec<Arc<str>>,
    on_stack: HashSet<Arc<str>>,
}

impl ResolvePass {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn memoized(&self, id: &Arc<str>) -> Option<bool> {
        self.resolved.get(id).copied()
    }

    /// Push `id`; returns the cycle path if `id` is already being resolved.
    pub(crate) fn enter(&mut self, id: &Arc<str>) -> Result<(), Vec<Arc<str>>> {
        if self.on_stack.contains(id) {
            let start = self.stack.iter().position(|s| s == id).unwrap_or(0);
            let mut path: Vec<Arc<str>> = self.stack[start..].to_vec();
            path.push(id.clone());
            return Err(path);
        }
        self.on_stack.insert(id.clone());
        self.stack.push(id.clone());
        Ok(())
    }

    pub(crate) fn exit(&mut self, id: &Arc<str>, fresh: bool) {
        self.on_stack.remove(id);
        if self.stack.last() == Some(id) {
            self.stack.pop();
        }
        self.resolved.insert(id.clone(), fresh);
    }

    /// Unwind `id` without memoizing (used when resolution failed).
    pub(crate) fn abort(&mut self, id: &Arc<str>) {
        self.on_stack.remove(id);
        if self.stack.last() == Some(id) {
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::MessageHub;
    use crate::message::Message;

    fn always(result: bool) -> DependencyCheck {
        DependencyCheck::Value(Rc::new(move |_| Ok(result)))
    }

    #[test]
    fn test_record_keeps_first_subscription() {
        let hub = MessageHub::new();
        let msg: Message<()> = Message::new("changed");
        let mut ledger = DependencyLedger::default();
        let key = DependencyKey::Block(Arc::from("n"));

        ledger.record(key.clone(), always(true), Some(hub.subscribe(&msg, |_| Ok(()))));
        ledger.record(key.clone(), always(false), Some(hub.subscribe(&msg, |_| Ok(()))));

        assert_eq!(ledger.len(), 1);
        assert_eq!(hub.subscriber_count(msg.id()), 1);
        assert!(ledger.contains(&key));
    }

    #[test]
    fn test_release_unsubscribes_everything() {
        let hub = MessageHub::new();
        let a: Message<()> = Message::new("a");
        let b: Message<()> = Message::new("b");
        let mut ledger = DependencyLedger::default();

        ledger.record(
            DependencyKey::Block(Arc::from("a")),
            always(true),
            Some(hub.subscribe(&a, |_| Ok(()))),
        );
        ledger.record(
            DependencyKey::Loader(Arc::from("b")),
            always(true),
            Some(hub.subscribe(&b, |_| Ok(()))),
        );
        assert_eq!(hub.total_subscriptions(), 2);

        ledger.release();
        assert_eq!(ledger.len(), 0);
        assert_eq!(hub.total_subscriptions(), 0);
    }

    #[test]
    fn test_keys_keep_recording_order() {
        let hub = MessageHub::new();
        let msg: Message<()> = Message::new("m");
        let mut ledger = DependencyLedger::default();
        for id in ["z", "a", "m"] {
            ledger.record(
                DependencyKey::Block(Arc::from(id)),
                always(true),
                Some(hub.subscribe(&msg, |_| Ok(()))),
            );
        }
        let keys: Vec<_> = ledger.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                DependencyKey::Block(Arc::from("z")),
                DependencyKey::Block(Arc::from("a")),
                DependencyKey::Block(Arc::from("m")),
            ]
        );
    }

    #[test]
    fn test_resolve_pass_detects_cycle() {
        let mut pass = ResolvePass::new();
        let a: Arc<str> = Arc::from("a");
        let b: Arc<str> = Arc::from("b");

        pass.enter(&a).unwrap();
        pass.enter(&b).unwrap();
        let path = pass.enter(&a).unwrap_err();
        assert_eq!(path, vec![a.clone(), b.clone(), a.clone()]);

        pass.exit(&b, true);
        pass.abort(&a);
        assert_eq!(pass.memoized(&b), Some(true));
        assert_eq!(pass.memoized(&a), None);
    }
}
