//! Result envelopes for loader reads
//!
//! A [`Loadable<V>`] is an immutable snapshot of a loader's status: loading,
//! resolved, or failed. Every variant can hand out a shared future of the
//! eventual value, and the loading/failed variants keep the last successful
//! snapshot for stale-while-revalidating display.

use std::fmt;

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use serde::{Deserialize, Serialize};

use crate::errors::{StoreError, StoreResult};

/// Cloneable future of a loader's eventual value.
///
/// Every clone resolves to the same output; awaiting any clone drives the
/// underlying run.
pub type LoadFuture<V> = Shared<LocalBoxFuture<'static, StoreResult<V>>>;

/// The most recent successful value of a loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastLoaded<V> {
    /// The loaded value
    pub value: V,
    /// Wall-clock time of the load, in milliseconds since the Unix epoch
    pub loaded_at: u64,
    /// Store-local sequence number, breaks ties between equal timestamps
    pub sequence: u64,
}

/// Discriminant of a [`Loadable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadableState {
    /// A run is in flight
    Loading,
    /// A value is available
    HasValue,
    /// The last run failed
    HasError,
}

/// Status of a loader's value.
#[derive(Clone)]
pub enum Loadable<V: Clone + 'static> {
    /// A run is in flight
    Loading {
        /// Resolves to the outcome of the most recent run
        future: LoadFuture<V>,
        /// Snapshot from before this run, if any
        last_loaded: Option<LastLoaded<V>>,
    },
    /// A value is available
    Value {
        /// The value and when it was loaded
        last_loaded: LastLoaded<V>,
    },
    /// The last run failed
    Error {
        /// The failure
        error: StoreError,
        /// Snapshot from before the failure, if any
        last_loaded: Option<LastLoaded<V>>,
    },
}

impl<V: Clone + 'static> Loadable<V> {
    /// Envelope for an in-flight run.
    pub fn loading(future: LoadFuture<V>, last_loaded: Option<LastLoaded<V>>) -> Self {
        Self::Loading {
            future,
            last_loaded,
        }
    }

    /// Envelope for a resolved value.
    pub fn value(last_loaded: LastLoaded<V>) -> Self {
        Self::Value { last_loaded }
    }

    /// Envelope for a failed run.
    pub fn error(error: StoreError, last_loaded: Option<LastLoaded<V>>) -> Self {
        Self::Error { error, last_loaded }
    }

    /// Which variant this is
    pub fn state(&self) -> LoadableState {
        match self {
            Self::Loading { .. } => LoadableState::Loading,
            Self::Value { .. } => LoadableState::HasValue,
            Self::Error { .. } => LoadableState::HasError,
        }
    }

    /// Whether a run is in flight
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    /// The resolved value, only for [`Loadable::Value`]
    pub fn get(&self) -> Option<&V> {
        match self {
            Self::Value { last_loaded } => Some(&last_loaded.value),
            _ => None,
        }
    }

    /// The failure, only for [`Loadable::Error`]
    pub fn get_error(&self) -> Option<&StoreError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Last successful snapshot, whatever the current status
    pub fn last_loaded(&self) -> Option<&LastLoaded<V>> {
        match self {
            Self::Loading { last_loaded, .. } | Self::Error { last_loaded, .. } => {
                last_loaded.as_ref()
            }
            Self::Value { last_loaded } => Some(last_loaded),
        }
    }

    /// Best value to display now: the resolved value or the last snapshot.
    pub fn latest_value(&self) -> Option<&V> {
        self.last_loaded().map(|l| &l.value)
    }

    /// Future of the eventual value.
    ///
    /// Resolved and failed envelopes return an already-completed future.
    pub fn future(&self) -> LoadFuture<V> {
        match self {
            Self::Loading { future, .. } => future.clone(),
            Self::Value { last_loaded } => {
                futures::future::ready(Ok(last_loaded.value.clone()))
                    .boxed_local()
                    .shared()
            }
            Self::Error { error, .. } => futures::future::ready(Err(error.clone()))
                .boxed_local()
                .shared(),
        }
    }
}

impl<V: Clone + fmt::Debug + 'static> fmt::Debug for Loadable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading { last_loaded, .. } => f
                .debug_struct("Loading")
                .field("last_loaded", last_loaded)
                .finish_non_exhaustive(),
            Self::Value { last_loaded } => f
                .debug_struct("Value")
                .field("last_loaded", last_loaded)
                .finish(),
            Self::Error { error, last_loaded } => f
                .debug_struct("Error")
                .field("error", error)
                .field("last_loaded", last_loaded)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(value: i32) -> LastLoaded<i32> {
        LastLoaded {
            value,
            loaded_at: 1_000,
            sequence: 1,
        }
    }

    #[test]
    fn test_value_envelope() {
        let l = Loadable::value(snapshot(5));
        assert_eq!(l.state(), LoadableState::HasValue);
        assert_eq!(l.get(), Some(&5));
        assert_eq!(l.latest_value(), Some(&5));
        assert_eq!(l.future().now_or_never(), Some(Ok(5)));
    }

    #[test]
    fn test_error_envelope_keeps_snapshot() {
        let l = Loadable::error(StoreError::compute("boom"), Some(snapshot(3)));
        assert_eq!(l.state(), LoadableState::HasError);
        assert_eq!(l.get(), None);
        assert_eq!(l.get_error(), Some(&StoreError::compute("boom")));
        assert_eq!(l.latest_value(), Some(&3));
        assert_eq!(
            l.future().now_or_never(),
            Some(Err(StoreError::compute("boom")))
        );
    }

    #[test]
    fn test_loading_envelope_shares_future() {
        let (tx, rx) = futures::channel::oneshot::channel::<i32>();
        let fut = async move { rx.await.map_err(|_| StoreError::internal("dropped")) }
            .boxed_local()
            .shared();
        let l = Loadable::loading(fut, None);
        assert!(l.is_loading());
        assert_eq!(l.latest_value(), None);

        let a = l.future();
        let b = l.clone().future();
        assert!(a.clone().now_or_never().is_none());
        tx.send(9).unwrap();
        assert_eq!(a.now_or_never(), Some(Ok(9)));
        assert_eq!(b.now_or_never(), Some(Ok(9)));
    }

    #[test]
    fn test_debug_omits_future() {
        let l = Loadable::value(snapshot(1));
        assert!(format!("{l:?}").starts_with("Value"));
    }
}
