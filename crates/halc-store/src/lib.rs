//! Halc Store: reactive state-and-cache engine
//!
//! A [`Store`] holds named value cells ([`Block`]) and cached asynchronous
//! derived computations ([`Loader`]). It records which loader read which
//! blocks and loaders, and keeps every loader cache consistent as those
//! dependencies change, without recomputing anything nobody asked for.
//!
//! # Core pieces
//!
//! - [`Message`] / [`MessageHub`]: identity-keyed publish/subscribe bus
//! - [`Block`]: value cell with a default, an equality comparer and update
//!   rules reacting to bus messages
//! - [`Loader`]: async function of store state, cached with a five-state
//!   freshness machine ([`Freshness`])
//! - [`Loadable`]: loading / value / error envelope handed to callers
//! - [`RestartableComputation`]: last-invocation-wins async wrapper used for
//!   runs whose dependencies change mid-flight
//! - [`SignalAction`] / [`EffectAction`]: dispatchable entry points
//!
//! # Threading
//!
//! Definitions are `Send + Sync` and may live in statics. A `Store` is
//! single-threaded and never spawns: the futures it returns are driven by
//! whoever awaits them. Multi-threaded hosts confine a store to one thread,
//! e.g. inside a Tokio `LocalSet`.
//!
//! # Example
//!
//! ```rust,ignore
//! use halc_store::*;
//!
//! let n: Block<i64> = Block::new("n", || 2);
//! let square = Loader::new("square", {
//!     let n = n.clone();
//!     move |tools| {
//!         let n = n.clone();
//!         async move {
//!             let v = tools.get(&n)?;
//!             Ok(v * v)
//!         }
//!     }
//! });
//!
//! let store = Store::new();
//! assert_eq!(store.load(&square)?.future().await?, 4);
//! ```

#![forbid(unsafe_code)]

pub mod action;
pub mod block;
pub mod config;
pub mod errors;
pub mod hub;
mod ledger;
pub mod loadable;
pub mod loader;
pub mod message;
pub mod restartable;
pub mod store;

pub use action::{Action, ActionToolbox, Dispatched, Effect, EffectAction, SignalAction};
pub use block::{Block, BlockBuilder, Trigger, Update, UpdateRules, UpdateToolbox};
pub use config::{Clock, StoreConfig, SystemClock};
pub use errors::{StoreError, StoreResult};
pub use hub::{MessageHub, Subscription};
pub use loadable::{LastLoaded, LoadFuture, Loadable, LoadableState};
pub use loader::{Freshness, Loader, LoaderToolbox};
pub use message::{Message, MessageId};
pub use restartable::{Latest, RestartableComputation};
pub use store::{CancelLoad, InitialCache, Invalidates, Store, StoreStats};
