//! Halc Testing Infrastructure
//!
//! Helpers for the store's integration tests: an
//! imperatively released gate for suspending loader bodies, a manual clock
//! for deterministic `loaded_at` stamps, a thread-safe call counter and a
//! tracing initialiser.
//!
//! # Usage
//!
//! ```rust,ignore
//! use halc_testkit::*;
//!
//! let pauser = Pauser::new();
//! let calls = CallCounter::new();
//! let loader = Loader::new("slow", {
//!     let (pauser, calls) = (pauser.clone(), calls.clone());
//!     move |_| {
//!         let (pauser, calls) = (pauser.clone(), calls.clone());
//!         async move {
//!             calls.hit();
//!             pauser.pause().await;
//!             Ok(1)
//!         }
//!     }
//! });
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;

use halc_store::{Clock, Store, StoreConfig};

type Gate = (oneshot::Sender<()>, Shared<oneshot::Receiver<()>>);

/// Future resolvable imperatively, for suspending loader bodies mid-run.
///
/// Every `pause()` until the next `resume()` waits on the same gate.
#[derive(Clone, Default)]
pub struct Pauser {
    gate: Arc<Mutex<Option<Gate>>>,
}

impl Pauser {
    /// Create an open pauser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the next [`resume`](Self::resume).
    pub fn pause(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut gate = self.gate.lock();
        let waiter = match gate.as_ref() {
            Some((_, waiter)) => waiter.clone(),
            None => {
                let (tx, rx) = oneshot::channel();
                let waiter = rx.shared();
                *gate = Some((tx, waiter.clone()));
                waiter
            }
        };
        waiter.map(|_| ())
    }

    /// Release everything waiting in [`pause`](Self::pause). Returns false if
    /// nothing was paused.
    pub fn resume(&self) -> bool {
        let released = self.gate.lock().take();
        match released {
            Some((tx, _)) => {
                tracing::trace!("pauser resumed");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Whether a gate is currently closed
    pub fn is_paused(&self) -> bool {
        self.gate.lock().is_some()
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now_ms: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock reading `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set an absolute time.
    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Thread-safe invocation counter, cloneable into `Send + Sync` closures.
#[derive(Clone, Debug, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    /// Create a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and return the new total.
    pub fn hit(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Calls recorded so far
    pub fn get(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Store labelled `label` whose snapshots are stamped by `clock`.
pub fn test_store(label: &str, clock: &ManualClock) -> Store {
    Store::with_config(
        StoreConfig::default()
            .with_label(label)
            .with_clock(Arc::new(clock.clone())),
    )
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
