//! Message hub: identity-keyed publish/subscribe
//!
//! # Invariants
//!
//! 1. Handlers run synchronously, in subscription order.
//! 2. The subscriber list is snapshotted at the start of each publish, so
//!    handlers subscribed during a round are not called in that round.
//! 3. A subscription released mid-round is skipped if its handler has not
//!    started yet. Handlers that already ran are unaffected.
//! 4. Handler errors are not isolated: the first failure aborts the round
//!    and is returned from [`MessageHub::publish`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::errors::{StoreError, StoreResult};
use crate::message::{Message, MessageId};

pub(crate) type ErasedHandler = Rc<dyn Fn(&dyn Any) -> StoreResult<()>>;

struct Entry {
    id: u64,
    active: Rc<Cell<bool>>,
    handler: ErasedHandler,
}

#[derive(Default)]
struct HubInner {
    channels: HashMap<MessageId, Vec<Entry>>,
    next_entry: u64,
}

/// Publish/subscribe registry keyed by [`MessageId`].
///
/// Single-threaded; cloning yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct MessageHub {
    inner: Rc<RefCell<HubInner>>,
}

impl MessageHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a typed handler to `message`.
    pub fn subscribe<P, F>(&self, message: &Message<P>, handler: F) -> Subscription
    where
        P: 'static,
        F: Fn(&P) -> StoreResult<()> + 'static,
    {
        let name = message.name().to_string();
        self.subscribe_erased(
            message.id(),
            Rc::new(move |payload: &dyn Any| match payload.downcast_ref::<P>() {
                Some(p) => handler(p),
                None => Err(StoreError::internal(format!(
                    "payload type mismatch on message {name}"
                ))),
            }),
        )
    }

    pub(crate) fn subscribe_erased(&self, message: MessageId, handler: ErasedHandler) -> Subscription {
        let active = Rc::new(Cell::new(true));
        let mut inner = self.inner.borrow_mut();
        inner.next_entry += 1;
        let id = inner.next_entry;
        let entries = inner.channels.entry(message).or_default();
        entries.retain(|e| e.active.get());
        entries.push(Entry {
            id,
            active: active.clone(),
            handler,
        });
        Subscription {
            hub: Rc::downgrade(&self.inner),
            message,
            id,
            active,
        }
    }

    /// Invoke every subscriber of `message` with `payload`.
    pub fn publish<P: 'static>(&self, message: &Message<P>, payload: &P) -> StoreResult<()> {
        let snapshot: Vec<(Rc<Cell<bool>>, ErasedHandler)> = {
            let inner = self.inner.borrow();
            match inner.channels.get(&message.id()) {
                Some(entries) => entries
                    .iter()
                    .filter(|e| e.active.get())
                    .map(|e| (e.active.clone(), e.handler.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        tracing::trace!(
            message = %message.name(),
            subscribers = snapshot.len(),
            "publish"
        );
        for (active, handler) in snapshot {
            if active.get() {
                handler(payload)?;
            }
        }
        Ok(())
    }

    /// Number of live subscriptions on `message`.
    pub fn subscriber_count(&self, message: MessageId) -> usize {
        self.inner
            .borrow()
            .channels
            .get(&message)
            .map(|entries| entries.iter().filter(|e| e.active.get()).count())
            .unwrap_or(0)
    }

    /// Number of live subscriptions across all channels.
    pub fn total_subscriptions(&self) -> usize {
        self.inner
            .borrow()
            .channels
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|e| e.active.get())
            .count()
    }
}

impl fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHub")
            .field("subscriptions", &self.total_subscriptions())
            .finish()
    }
}

/// RAII guard for a hub subscription.
///
/// Dropping the guard (or calling [`Subscription::unsubscribe`]) removes the
/// handler. Outliving the hub is harmless.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<RefCell<HubInner>>,
    message: MessageId,
    id: u64,
    active: Rc<Cell<bool>>,
}

impl Subscription {
    /// Remove the handler now.
    pub fn unsubscribe(self) {}

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Channel this subscription listens on
    pub fn message(&self) -> MessageId {
        self.message
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active.replace(false) {
            return;
        }
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        // If the hub is mid-borrow the entry stays, inactive, until the next
        // subscribe on this channel prunes it.
        let borrowed = hub.try_borrow_mut();
        if let Ok(mut inner) = borrowed {
            if let Some(entries) = inner.channels.get_mut(&self.message) {
                entries.retain(|e| e.id != self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("message", &self.message)
            .field("active", &self.active.get())
            .finish()
    }
}
