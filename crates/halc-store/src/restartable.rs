//! Restartable computations: last invocation wins
//!
//! A [`RestartableComputation`] wraps a factory of futures. Each
//! [`restart`](RestartableComputation::restart) bumps a generation counter and
//! creates a fresh underlying future right away, without waiting for the
//! previous one. Observers created by [`latest`](RestartableComputation::latest)
//! always resolve to the output of the newest generation:
//!
//! - a superseded generation that completes is discarded and the observer
//!   moves on to the current one;
//! - observers are woken on restart, so a superseded generation that never
//!   completes does not block them.
//!
//! Underlying futures are not aborted explicitly. A superseded future is
//! dropped once no observer holds it any longer; the generation check is the
//! authoritative guard either way.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::{FutureExt, LocalBoxFuture, Shared};

type Factory<T> = Rc<dyn Fn(u64) -> LocalBoxFuture<'static, T>>;

struct RestartState<T: Clone + 'static> {
    generation: u64,
    current: Shared<LocalBoxFuture<'static, T>>,
    wakers: Vec<Waker>,
}

/// Async wrapper guaranteeing only the newest invocation's result is observed.
///
/// Cloning yields a handle to the same computation.
pub struct RestartableComputation<T: Clone + 'static> {
    state: Rc<RefCell<RestartState<T>>>,
    factory: Factory<T>,
}

impl<T: Clone + 'static> RestartableComputation<T> {
    /// Create the computation and its first generation (generation 1).
    ///
    /// The factory receives the generation it is building.
    pub fn start<F>(factory: F) -> Self
    where
        F: Fn(u64) -> LocalBoxFuture<'static, T> + 'static,
    {
        let factory: Factory<T> = Rc::new(factory);
        let current = factory(1).shared();
        Self {
            state: Rc::new(RefCell::new(RestartState {
                generation: 1,
                current,
                wakers: Vec::new(),
            })),
            factory,
        }
    }

    /// Supersede the current generation with a fresh one and return its number.
    pub fn restart(&self) -> u64 {
        let generation = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.generation
        };
        let fresh = (self.factory)(generation).shared();
        let (superseded, wakers) = {
            let mut state = self.state.borrow_mut();
            let old = std::mem::replace(&mut state.current, fresh);
            (old, std::mem::take(&mut state.wakers))
        };
        drop(superseded);
        tracing::trace!(generation, observers = wakers.len(), "computation restarted");
        for waker in wakers {
            waker.wake();
        }
        generation
    }

    /// Generation currently considered authoritative
    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    /// Whether `generation` is still the newest one
    pub fn is_current(&self, generation: u64) -> bool {
        self.state.borrow().generation == generation
    }

    /// Future resolving to the outcome of the newest generation.
    pub fn latest(&self) -> Latest<T> {
        Latest {
            state: self.state.clone(),
            tracked: None,
        }
    }
}

impl<T: Clone + 'static> Clone for RestartableComputation<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            factory: self.factory.clone(),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for RestartableComputation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestartableComputation")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Observer returned by [`RestartableComputation::latest`].
#[must_use = "futures do nothing unless polled"]
pub struct Latest<T: Clone + 'static> {
    state: Rc<RefCell<RestartState<T>>>,
    tracked: Option<(u64, Shared<LocalBoxFuture<'static, T>>)>,
}

impl<T: Clone + 'static> Future for Latest<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        loop {
            {
                let mut state = this.state.borrow_mut();
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                let newest = state.generation;
                if this.tracked.as_ref().map(|(g, _)| *g) != Some(newest) {
                    this.tracked = Some((newest, state.current.clone()));
                }
            }

            let (generation, fut) = match this.tracked.as_mut() {
                Some((generation, fut)) => (*generation, fut),
                None => return Poll::Pending,
            };
            match fut.poll_unpin(cx) {
                Poll::Ready(output) => {
                    if this.state.borrow().generation == generation {
                        return Poll::Ready(output);
                    }
                    tracing::trace!(generation, "discarding superseded generation");
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use std::cell::Cell;

    type Senders = Rc<RefCell<Vec<oneshot::Sender<u64>>>>;

    fn gated() -> (RestartableComputation<u64>, Senders, Rc<Cell<u32>>) {
        let senders: Senders = Rc::new(RefCell::new(Vec::new()));
        let built = Rc::new(Cell::new(0));
        let s = senders.clone();
        let b = built.clone();
        let computation = RestartableComputation::start(move |_generation| {
            b.set(b.get() + 1);
            let (tx, rx) = oneshot::channel();
            s.borrow_mut().push(tx);
            async move { rx.await.unwrap_or(0) }.boxed_local()
        });
        (computation, senders, built)
    }

    #[test]
    fn test_start_builds_first_generation() {
        let (computation, _senders, built) = gated();
        assert_eq!(computation.generation(), 1);
        assert!(computation.is_current(1));
        assert_eq!(built.get(), 1);
    }

    #[test]
    fn test_restart_builds_immediately() {
        let (computation, _senders, built) = gated();
        assert_eq!(computation.restart(), 2);
        assert_eq!(built.get(), 2);
        assert!(!computation.is_current(1));
        assert!(computation.is_current(2));
    }

    #[test]
    fn test_superseded_result_is_discarded() {
        let (computation, senders, _built) = gated();
        let mut observer = computation.latest();
        assert!((&mut observer).now_or_never().is_none());

        computation.restart();
        let mut senders = senders.borrow_mut().drain(..).collect::<Vec<_>>();
        let newest = senders.pop().unwrap();
        let oldest = senders.pop().unwrap();

        // Old generation resolves first; observer must keep waiting.
        oldest.send(16).unwrap();
        assert!((&mut observer).now_or_never().is_none());

        newest.send(81).unwrap();
        assert_eq!(observer.now_or_never(), Some(81));
    }

    #[test]
    fn test_never_finishing_generation_does_not_block() {
        let (computation, senders, _built) = gated();
        let mut observer = computation.latest();
        assert!((&mut observer).now_or_never().is_none());

        computation.restart();
        let newest = senders.borrow_mut().pop().unwrap();
        newest.send(49).unwrap();
        assert_eq!(observer.now_or_never(), Some(49));
    }

    #[test]
    fn test_observers_share_outcome() {
        let (computation, senders, built) = gated();
        let a = computation.latest();
        let b = computation.latest();
        senders.borrow_mut().pop().unwrap().send(4).unwrap();
        assert_eq!(a.now_or_never(), Some(4));
        assert_eq!(b.now_or_never(), Some(4));
        assert_eq!(built.get(), 1);
    }

    #[tokio::test]
    async fn test_restart_wakes_pending_observer() {
        let (computation, senders, _built) = gated();
        let observer = computation.latest();

        let driver = async {
            tokio::task::yield_now().await;
            computation.restart();
            senders.borrow_mut().pop().unwrap().send(9).unwrap();
        };
        let (value, ()) = futures::join!(observer, driver);
        assert_eq!(value, 9);
    }
}
