//! Identity-keyed message channels
//!
//! A [`Message<P>`] names a bus channel carrying payloads of type `P`.
//! Channels compare by an opaque process-unique token, never by name: two
//! messages defined with the same display name are different channels.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique sequence number for definitions.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opaque identity of a message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// A typed bus channel.
///
/// Cloning a `Message` yields a handle to the **same** channel.
pub struct Message<P> {
    id: MessageId,
    name: Arc<str>,
    _payload: PhantomData<fn(P) -> P>,
}

impl<P> Message<P> {
    /// Define a new channel. Every call creates a distinct identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: MessageId(next_id()),
            name: Arc::from(name.into()),
            _payload: PhantomData,
        }
    }

    /// Identity token of this channel
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Human-readable name, for logs only
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P> Clone for Message<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> PartialEq for Message<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<P> Eq for Message<P> {}

impl<P> Hash for Message<P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<P> fmt::Debug for Message<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
