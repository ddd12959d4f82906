//! Store Property Tests
//!
//! Cache reuse, run sharing, dependency-driven recomputation, last-run-wins,
//! failure recovery, late block replay and dispatch ordering.

#![allow(clippy::unwrap_used)]

use std::future::IntoFuture;
use std::sync::Arc;

use assert_matches::assert_matches;
use futures::FutureExt;
use halc_store::*;
use halc_testkit::{init_test_tracing, test_store, CallCounter, ManualClock, Pauser};
use parking_lot::Mutex;

struct Squares {
    n: Block<i64>,
    set_n: SignalAction<i64>,
    square: Loader<i64>,
    minus: Loader<i64>,
    square_calls: CallCounter,
    minus_calls: CallCounter,
}

/// `square = n * n`, `minus = -square`. `pause_when` suspends the square
/// body after reading `n` when the predicate holds for `(n, call)`.
fn squares(initial: i64, pauser: &Pauser, pause_when: fn(i64, usize) -> bool) -> Squares {
    let set_n: SignalAction<i64> = SignalAction::new("set_n");
    let n = Block::builder("n")
        .default(move || initial)
        .update({
            let set_n = set_n.clone();
            move |rules, _| {
                rules.on(set_n.trigger(), |_, v| Update::Changed(*v));
            }
        })
        .build();

    let square_calls = CallCounter::new();
    let square = Loader::new("square", {
        let n = n.clone();
        let calls = square_calls.clone();
        let pauser = pauser.clone();
        move |tools: LoaderToolbox| {
            let n = n.clone();
            let call = calls.hit();
            let pauser = pauser.clone();
            async move {
                let v = tools.get(&n)?;
                if pause_when(v, call) {
                    pauser.pause().await;
                }
                Ok(v * v)
            }
        }
    });

    let minus_calls = CallCounter::new();
    let minus = Loader::new("minus", {
        let square = square.clone();
        let calls = minus_calls.clone();
        move |tools: LoaderToolbox| {
            let square = square.clone();
            calls.hit();
            async move { Ok(-tools.load(&square).await?) }
        }
    });

    Squares {
        n,
        set_n,
        square,
        minus,
        square_calls,
        minus_calls,
    }
}

fn never(_: i64, _: usize) -> bool {
    false
}

async fn value_of<V: Clone + 'static>(store: &Store, loader: &Loader<V>) -> StoreResult<V> {
    store.load(loader)?.future().await
}

#[tokio::test]
async fn test_fresh_cache_is_reused() {
    init_test_tracing();
    let store = Store::new();
    let s = squares(3, &Pauser::new(), never);

    assert_eq!(value_of(&store, &s.square).await, Ok(9));
    let again = store.load(&s.square).unwrap();
    assert_eq!(again.state(), LoadableState::HasValue);
    assert_eq!(again.get(), Some(&9));
    assert_eq!(s.square_calls.get(), 1);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_run() {
    let store = Store::new();
    let s = squares(3, &Pauser::new(), never);

    let a = store.load(&s.square).unwrap();
    let b = store.load(&s.square).unwrap();
    assert!(a.is_loading() && b.is_loading());

    let (x, y) = futures::join!(a.future(), b.future());
    assert_eq!(x, Ok(9));
    assert_eq!(y, Ok(9));
    assert_eq!(s.square_calls.get(), 1);
}

#[tokio::test]
async fn test_dependency_change_triggers_single_recompute() {
    let store = Store::new();
    let s = squares(2, &Pauser::new(), never);

    assert_eq!(value_of(&store, &s.square).await, Ok(4));
    assert_eq!(value_of(&store, &s.square).await, Ok(4));
    store.dispatch(&s.set_n, 7).unwrap();
    assert_eq!(value_of(&store, &s.square).await, Ok(49));
    assert_eq!(value_of(&store, &s.square).await, Ok(49));

    assert_eq!(s.square_calls.get(), 2);
}

#[tokio::test]
async fn test_transitive_dependency_recomputes_once_per_change() {
    let store = Store::new();
    let s = squares(2, &Pauser::new(), never);

    assert_eq!(value_of(&store, &s.minus).await, Ok(-4));
    store.dispatch(&s.set_n, 7).unwrap();
    assert_eq!(value_of(&store, &s.minus).await, Ok(-49));
    assert_eq!(value_of(&store, &s.minus).await, Ok(-49));
    store.dispatch(&s.set_n, 3).unwrap();
    assert_eq!(value_of(&store, &s.minus).await, Ok(-9));

    assert_eq!(s.minus_calls.get(), 3);
    assert_eq!(s.square_calls.get(), s.minus_calls.get());
}

#[tokio::test]
async fn test_last_run_wins_when_dependency_changes_mid_flight() {
    let store = Store::new();
    let pauser = Pauser::new();
    let s = squares(4, &pauser, |n, _| n == 4);

    let future = store.load(&s.square).unwrap().future();
    assert!(future.clone().now_or_never().is_none());
    assert!(pauser.is_paused());

    store.dispatch(&s.set_n, 9).unwrap();
    assert_eq!(future.clone().await, Ok(81));

    // Letting the superseded run finish changes nothing.
    pauser.resume();
    assert_eq!(value_of(&store, &s.square).await, Ok(81));
    assert_eq!(store.freshness(&s.square), Some(Freshness::Fresh));
    assert_eq!(s.square_calls.get(), 2);
}

#[tokio::test]
async fn test_shared_run_restarts_for_every_caller() {
    let store = Store::new();
    let pauser = Pauser::new();
    let s = squares(2, &pauser, |_, call| call == 1);

    let a = store.load(&s.square).unwrap();
    let b = store.load(&s.square).unwrap();
    assert!(a.future().now_or_never().is_none());

    store.dispatch(&s.set_n, 5).unwrap();
    let (x, y) = futures::join!(a.future(), b.future());
    assert_eq!(x, Ok(25));
    assert_eq!(y, Ok(25));
    assert_eq!(s.square_calls.get(), 2);
}

#[tokio::test]
async fn test_failed_run_is_retried_on_next_load() {
    let store = Store::new();
    let calls = CallCounter::new();
    let flaky = Loader::new("flaky", {
        let calls = calls.clone();
        move |_| {
            let first = calls.hit() == 1;
            async move {
                if first {
                    Err(StoreError::compute("first run fails"))
                } else {
                    Ok(10)
                }
            }
        }
    });

    assert_eq!(
        value_of(&store, &flaky).await,
        Err(StoreError::compute("first run fails"))
    );
    assert_eq!(store.freshness(&flaky), Some(Freshness::Error));
    let cached = store.cached(&flaky).unwrap();
    assert_eq!(cached.get_error(), Some(&StoreError::compute("first run fails")));

    assert_eq!(value_of(&store, &flaky).await, Ok(10));
    assert_eq!(calls.get(), 2);
}

#[tokio::test]
async fn test_failure_keeps_last_snapshot() {
    let store = Store::new();
    let calls = CallCounter::new();
    let loader = Loader::new("second-fails", {
        let calls = calls.clone();
        move |_| {
            let call = calls.hit();
            async move {
                if call == 2 {
                    Err(StoreError::compute("backend down"))
                } else {
                    Ok(call)
                }
            }
        }
    });

    assert_eq!(value_of(&store, &loader).await, Ok(1));
    store.invalidate_cache(&loader).unwrap();
    assert!(value_of(&store, &loader).await.is_err());

    let cached = store.cached(&loader).unwrap();
    assert_eq!(cached.state(), LoadableState::HasError);
    assert_eq!(cached.latest_value(), Some(&1));
}

#[tokio::test]
async fn test_late_block_replays_loader_value() {
    let store = Store::new();
    let calls = CallCounter::new();
    let user = Loader::new("user", {
        let calls = calls.clone();
        move |_| {
            calls.hit();
            async { Ok("ada".to_string()) }
        }
    });
    let greeting = Block::builder("greeting")
        .default(String::new)
        .update({
            let user = user.clone();
            move |rules, _| {
                rules.on(user.done(), |_, name: &String| {
                    Update::Changed(format!("hi {name}"))
                });
            }
        })
        .build();

    assert_eq!(value_of(&store, &user).await, Ok("ada".to_string()));
    assert_eq!(store.get(&greeting), Ok("hi ada".to_string()));
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_replay_follows_load_order_not_rule_order() {
    let clock = ManualClock::new(100);
    let store = test_store("replay", &clock);
    let first = Loader::new("first", |_| async { Ok("first") });
    let second = Loader::new("second", |_| async { Ok("second") });

    value_of(&store, &first).await.unwrap();
    clock.advance(50);
    value_of(&store, &second).await.unwrap();

    let latest = Block::builder("latest")
        .default(|| "none")
        .update({
            let (first, second) = (first.clone(), second.clone());
            move |rules, _| {
                rules.on(second.done(), |_, v| Update::Changed(*v));
                rules.on(first.done(), |_, v| Update::Changed(*v));
            }
        })
        .build();
    assert_eq!(store.get(&latest), Ok("second"));
}

#[tokio::test]
async fn test_live_block_follows_loader_done() {
    let store = Store::new();
    let s = squares(2, &Pauser::new(), never);
    let history = Block::<Vec<i64>>::builder("history")
        .default(Vec::new)
        .update({
            let square = s.square.clone();
            move |rules, _| {
                rules.on(square.done(), |seen, v| {
                    let mut next = seen.clone();
                    next.push(*v);
                    Update::Changed(next)
                });
            }
        })
        .build();

    assert_eq!(store.get(&history), Ok(vec![]));
    value_of(&store, &s.square).await.unwrap();
    store.dispatch(&s.set_n, 3).unwrap();
    value_of(&store, &s.square).await.unwrap();
    assert_eq!(store.get(&history), Ok(vec![4, 9]));
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn record(log: &Log, entry: &'static str) {
    log.lock().push(entry);
}

#[tokio::test]
async fn test_sync_effect_dispatch_order() {
    let store = Store::new();
    let log: Log = Arc::default();
    let double = EffectAction::sync("double", {
        let log = log.clone();
        move |_, n: i32| {
            record(&log, "run");
            Ok(n * 2)
        }
    });
    let l = log.clone();
    let _on_dispatch = store.on_action_dispatch(&double, move |_| record(&l, "dispatched"));
    let l = log.clone();
    let _on_done = store.on_action_success(&double, move |_| record(&l, "done"));

    let out = store.dispatch_effect(&double, 4).unwrap();
    assert_eq!(out.ready(), Some(8));
    assert_eq!(*log.lock(), vec!["dispatched", "run", "done"]);
    assert!(!store.is_action_running(&double));
}

#[tokio::test]
async fn test_async_effect_dispatch_order() {
    let store = Store::new();
    let log: Log = Arc::default();
    let pauser = Pauser::new();
    let upload = EffectAction::future("upload", {
        let (log, pauser) = (log.clone(), pauser.clone());
        move |_, bytes: usize| {
            let (log, pauser) = (log.clone(), pauser.clone());
            async move {
                record(&log, "run started");
                pauser.pause().await;
                record(&log, "run finished");
                Ok(bytes)
            }
        }
    });
    let l = log.clone();
    let _on_dispatch = store.on_action_dispatch(&upload, move |_| record(&l, "dispatched"));
    let l = log.clone();
    let _on_done = store.on_action_success(&upload, move |_| record(&l, "done"));

    let dispatched = store.dispatch_effect(&upload, 64).unwrap();
    assert!(!dispatched.is_ready());
    assert!(store.is_action_running(&upload));

    let mut pending = dispatched.into_future();
    assert!((&mut pending).now_or_never().is_none());
    assert_eq!(*log.lock(), vec!["dispatched", "run started"]);

    pauser.resume();
    assert_eq!(pending.await, Ok(64));
    assert_eq!(
        *log.lock(),
        vec!["dispatched", "run started", "run finished", "done"]
    );
    assert!(!store.is_action_running(&upload));
}

#[tokio::test]
async fn test_effect_can_update_blocks_and_invalidate() {
    let store = Store::new();
    let s = squares(2, &Pauser::new(), never);
    let reset = EffectAction::sync("reset", {
        let (set_n, square) = (s.set_n.clone(), s.square.clone());
        move |tools: ActionToolbox, _: ()| {
            tools.dispatch(&set_n, 0)?;
            tools.invalidate(&square)?;
            tools.get(&Block::new("scratch", || 1))
        }
    });

    assert_eq!(value_of(&store, &s.square).await, Ok(4));
    let out = store.dispatch_effect(&reset, ()).unwrap();
    assert_eq!(out.ready(), Some(1));
    assert_eq!(store.get(&s.n), Ok(0));
    assert_eq!(store.freshness(&s.square), Some(Freshness::Stale));
    assert_eq!(value_of(&store, &s.square).await, Ok(0));
}

#[tokio::test]
async fn test_effect_failure_skips_done() {
    let store = Store::new();
    let done = CallCounter::new();
    let failing: EffectAction<(), ()> =
        EffectAction::sync("failing", |_, _| Err(StoreError::action("rejected")));
    let d = done.clone();
    let _on_done = store.on_action_success(&failing, move |_| {
        d.hit();
    });

    let result = store.dispatch_effect(&failing, ());
    assert_matches!(result, Err(StoreError::Action { .. }));
    assert_eq!(done.get(), 0);
    assert!(!store.is_action_running(&failing));
}
