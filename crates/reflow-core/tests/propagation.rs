//! End-to-end propagation scenarios on the default domain
//! (sequential mode, toposort engine).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reflow_core::{Domain, DomainConfig, ObserverAction, ReflowError, TurnFlags};

fn domain() -> Domain {
    Domain::new(DomainConfig::default()).unwrap()
}

#[test]
fn diamond_ticks_each_node_once_and_settles() {
    let d = domain();
    let a = d.var(0i64);
    let b = d.var(0i64);
    let ticks = Arc::new(AtomicUsize::new(0));

    let sum = {
        let (a, b, ticks) = (a.signal().clone(), b.signal().clone(), ticks.clone());
        d.computed(&[a.id(), b.id()], move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            a.get() + b.get()
        })
    };
    let product = {
        let (a, b, ticks) = (a.signal().clone(), b.signal().clone(), ticks.clone());
        d.computed(&[a.id(), b.id()], move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            a.get() * b.get()
        })
    };
    let total = {
        let (s, p, ticks) = (sum.clone(), product.clone(), ticks.clone());
        d.computed(&[sum.id(), product.id()], move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            s.get() + p.get()
        })
    };

    assert_eq!(d.node_level(a.id()), Some(0));
    assert_eq!(d.node_level(sum.id()), Some(1));
    assert_eq!(d.node_level(total.id()), Some(2));

    ticks.store(0, Ordering::SeqCst); // discard construction evaluations
    d.do_transaction(TurnFlags::NONE, |tx| {
        tx.set(&a, 2);
        tx.set(&b, 3);
    })
    .unwrap();

    assert_eq!(total.get(), 11);
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    d.validate().unwrap();
}

#[test]
fn ticks_respect_level_order() {
    let d = domain();
    let order = Arc::new(Mutex::new(Vec::new()));
    let a = d.var(0u32);

    let push = |name: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
        let order = order.clone();
        move |v: u32| {
            order.lock().push(name);
            v
        }
    };

    let b = {
        let (a_sig, f) = (a.signal().clone(), push("b", &order));
        d.computed(&[a.id()], move || f(a_sig.get() + 1))
    };
    let c = {
        let (b_sig, f) = (b.clone(), push("c", &order));
        d.computed(&[b.id()], move || f(b_sig.get() + 1))
    };
    let side = {
        let (a_sig, f) = (a.signal().clone(), push("side", &order));
        d.computed(&[a.id()], move || f(a_sig.get() + 10))
    };
    let join = {
        let (c_sig, s_sig, f) = (c.clone(), side.clone(), push("join", &order));
        d.computed(&[c.id(), side.id()], move || f(c_sig.get() + s_sig.get()))
    };

    order.lock().clear();
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&a, 5)).unwrap();

    let order = order.lock();
    assert_eq!(order.len(), 4, "each node ticks exactly once: {order:?}");
    let pos = |name| order.iter().position(|&n| n == name).unwrap();
    assert!(pos("b") < pos("c"));
    assert!(pos("c") < pos("join"));
    assert!(pos("side") < pos("join"));
    assert_eq!(join.get(), 22);
}

#[test]
fn unchanged_values_cut_propagation() {
    let d = domain();
    let a = d.var(4i32);
    let clamped = {
        let a_sig = a.signal().clone();
        d.computed(&[a.id()], move || a_sig.get().min(10))
    };
    let downstream_ticks = Arc::new(AtomicUsize::new(0));
    let _leaf = {
        let (c, ticks) = (clamped.clone(), downstream_ticks.clone());
        d.computed(&[clamped.id()], move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            c.get()
        })
    };

    downstream_ticks.store(0, Ordering::SeqCst);
    // 4 -> 12 clamps to 10: pulse reaches the leaf.
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&a, 12)).unwrap();
    assert_eq!(downstream_ticks.load(Ordering::SeqCst), 1);

    // 12 -> 15 still clamps to 10: clamped ticks but reports idle.
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&a, 15)).unwrap();
    assert_eq!(downstream_ticks.load(Ordering::SeqCst), 1);
}

#[test]
fn coalesced_event_inputs_run_in_a_single_turn() {
    let d = domain();
    let src = d.event_source::<i32>();
    let log: Arc<Mutex<Vec<(u64, i32)>>> = Arc::new(Mutex::new(Vec::new()));

    let _obs = {
        let log = log.clone();
        d.observe_events(src.events(), move |event, ctx| {
            log.lock().push((ctx.turn_id(), *event));
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| {
        tx.push(&src, 1);
        tx.push(&src, 2);
        tx.push(&src, 3);
    })
    .unwrap();

    let log = log.lock();
    assert_eq!(log.iter().map(|&(_, v)| v).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(log.iter().all(|&(t, _)| t == log[0].0), "one turn only: {log:?}");
}

#[test]
fn event_buffers_are_per_turn() {
    let d = domain();
    let src = d.event_source::<u8>();
    let sink = d.map_events(src.events(), |e| *e);

    d.do_transaction(TurnFlags::NONE, |tx| {
        tx.push(&src, 1);
        tx.push(&src, 2);
    })
    .unwrap();
    assert_eq!(sink.snapshot(), vec![1, 2]);

    d.do_transaction(TurnFlags::NONE, |tx| tx.push(&src, 9)).unwrap();
    assert_eq!(sink.snapshot(), vec![9], "previous turn's buffer was cleared");
}

#[test]
fn merge_and_map_collect_in_source_order() {
    let d = domain();
    let left = d.event_source::<i32>();
    let right = d.event_source::<i32>();
    let merged = d.merge(left.events(), right.events());
    let scaled = d.map_events(&merged, |e| e * 10);

    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let _obs = {
        let log = log.clone();
        d.observe_events(&scaled, move |event, _| {
            log.lock().push(*event);
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| {
        tx.push(&right, 2);
        tx.push(&left, 1);
    })
    .unwrap();

    assert_eq!(*log.lock(), vec![10, 20], "left stream collects first");
}

#[test]
fn filter_drops_events_and_reports_idle_when_empty() {
    let d = domain();
    let src = d.event_source::<i32>();
    let evens = d.filter_events(src.events(), |e| e % 2 == 0);

    let log: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let downstream_calls = Arc::new(AtomicUsize::new(0));
    let _obs = {
        let (log, calls) = (log.clone(), downstream_calls.clone());
        d.observe_events(&evens, move |event, _| {
            log.lock().push(*event);
            calls.fetch_add(1, Ordering::SeqCst);
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| {
        tx.push(&src, 1);
        tx.push(&src, 2);
        tx.push(&src, 3);
        tx.push(&src, 4);
    })
    .unwrap();
    assert_eq!(*log.lock(), vec![2, 4]);

    // Every occurrence rejected: the filter ticks but stays idle, so its
    // observer never runs this turn.
    d.do_transaction(TurnFlags::NONE, |tx| {
        tx.push(&src, 5);
        tx.push(&src, 7);
    })
    .unwrap();
    assert_eq!(*log.lock(), vec![2, 4]);
    assert_eq!(downstream_calls.load(Ordering::SeqCst), 2);
    assert!(evens.snapshot().is_empty(), "rejected turn left an empty buffer");
}

#[test]
fn signal_observer_sees_committed_values() {
    let d = domain();
    let celsius = d.var(0.0f64);
    let fahrenheit = {
        let c = celsius.signal().clone();
        d.computed(&[celsius.id()], move || c.get() * 9.0 / 5.0 + 32.0)
    };

    let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let _obs = {
        let seen = seen.clone();
        d.observe(&fahrenheit, move |v, _| {
            seen.lock().push(*v);
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&celsius, 100.0)).unwrap();
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&celsius, -40.0)).unwrap();
    assert_eq!(*seen.lock(), vec![212.0, -40.0]);
}

#[test]
fn dynamic_reparent_settles_in_the_same_turn() {
    let d = domain();
    let x = d.var(1i64);
    let shallow = {
        let x_sig = x.signal().clone();
        d.computed(&[x.id()], move || x_sig.get() + 10)
    };

    let y = d.var(2i64);
    let mid = {
        let y_sig = y.signal().clone();
        d.computed(&[y.id()], move || y_sig.get() + 1)
    };
    let deep = {
        let m = mid.clone();
        d.computed(&[mid.id()], move || m.get() * 2)
    };

    let selector = d.var(shallow.clone());
    let flat = d.flatten(selector.signal());
    assert_eq!(flat.get(), 11);

    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&selector, deep.clone()))
        .unwrap();

    assert_eq!(flat.get(), 6, "re-ticked at its new level within the turn");
    assert!(d.node_level(flat.id()).unwrap() > d.node_level(deep.id()).unwrap());
    d.validate().unwrap();

    // The new edge is live: updates flow through the deep chain now.
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&y, 5)).unwrap();
    assert_eq!(flat.get(), 12);

    // The old edge is gone: the shallow branch no longer wakes `flat`.
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&x, 100)).unwrap();
    assert_eq!(flat.get(), 12);
}

#[test]
fn observer_self_detach_is_deferred_to_turn_end() {
    let d = domain();
    let src = d.event_source::<u32>();
    let calls = Arc::new(AtomicUsize::new(0));

    let obs = {
        let calls = calls.clone();
        d.observe_events(src.events(), move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            ObserverAction::Detach
        })
    };
    assert!(obs.is_attached());

    // The observer still receives the pulse of the turn it detaches in.
    d.do_transaction(TurnFlags::NONE, |tx| tx.push(&src, 7)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!obs.is_attached(), "edge removed by end of turn");

    d.do_transaction(TurnFlags::NONE, |tx| tx.push(&src, 8)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no callback after detach");
}

#[test]
fn observer_detach_outside_turn_is_immediate() {
    let d = domain();
    let ticker = d.var(0u32);
    let calls = Arc::new(AtomicUsize::new(0));
    let obs = {
        let calls = calls.clone();
        d.observe(ticker.signal(), move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&ticker, 1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    obs.detach().unwrap();
    assert!(!obs.is_attached());
    obs.detach().unwrap(); // idempotent

    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&ticker, 2)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cycles_are_rejected_and_leave_the_graph_unchanged() {
    let d = domain();
    let a = d.var(0i32);
    let b = d.var(0i32);
    let ca = {
        let a_sig = a.signal().clone();
        d.computed(&[a.id()], move || a_sig.get())
    };
    let cb = {
        let b_sig = b.signal().clone();
        d.computed(&[b.id()], move || b_sig.get())
    };

    let err = d.attach(ca.id(), ca.id()).unwrap_err();
    assert!(matches!(err, ReflowError::CycleDetected { .. }));

    d.attach(ca.id(), cb.id()).unwrap();
    let level_ca = d.node_level(ca.id());
    let level_cb = d.node_level(cb.id());

    let err = d.attach(cb.id(), ca.id()).unwrap_err();
    assert!(matches!(err, ReflowError::CycleDetected { .. }));

    assert_eq!(d.node_level(ca.id()), level_ca);
    assert_eq!(d.node_level(cb.id()), level_cb);
    d.validate().unwrap();
}

#[test]
fn level_dominance_survives_attach_detach_churn() {
    let d = domain();
    let roots: Vec<_> = (0..4).map(|i| d.var(i as i32)).collect();
    let mut layer: Vec<_> = roots
        .iter()
        .map(|r| {
            let sig = r.signal().clone();
            d.computed(&[r.id()], move || sig.get())
        })
        .collect();
    for _ in 0..3 {
        layer = layer
            .iter()
            .map(|p| {
                let sig = p.clone();
                d.computed(&[p.id()], move || sig.get() + 1)
            })
            .collect();
    }

    // Cross-link columns, then remove some of the links again.
    d.attach(layer[0].id(), roots[1].id()).unwrap();
    d.attach(layer[1].id(), layer[3].id()).unwrap();
    d.attach(layer[2].id(), layer[0].id()).unwrap();
    d.validate().unwrap();
    d.detach(layer[1].id(), layer[3].id()).unwrap();
    d.validate().unwrap();

    // Edges that would close a loop after the churn still fail.
    let err = d.attach(layer[0].id(), layer[2].id()).unwrap_err();
    assert!(matches!(err, ReflowError::CycleDetected { .. }));
    d.validate().unwrap();

    // The reshaped graph still propagates consistently.
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&roots[0], 40)).unwrap();
    assert_eq!(layer[0].get(), 43);
}

#[test]
fn failed_tick_aborts_the_turn_and_the_domain_recovers() {
    let d = domain();
    let x = d.var(0i32);
    let fragile = {
        let x_sig = x.signal().clone();
        d.computed(&[x.id()], move || {
            let v = x_sig.get();
            assert!(v != 13, "unlucky input");
            v
        })
    };

    let err = d
        .do_transaction(TurnFlags::NONE, |tx| tx.set(&x, 13))
        .unwrap_err();
    match err {
        ReflowError::TurnFailed { reason, .. } => assert!(reason.contains("unlucky")),
        other => panic!("expected TurnFailed, got {other}"),
    }

    // The engine discarded the remaining work; the next turn is clean.
    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&x, 1)).unwrap();
    assert_eq!(fragile.get(), 1);
}

#[test]
fn continuations_run_as_a_fresh_turn_after_the_current_one() {
    let d = domain();
    let x = d.var(0i32);
    let y = d.var(0i32);

    let turn_ids: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let _x_obs = {
        let (y, turn_ids) = (y.clone(), turn_ids.clone());
        d.observe(x.signal(), move |v, ctx| {
            turn_ids.lock().push(ctx.turn_id());
            if *v == 1 {
                let y = y.clone();
                ctx.enqueue_continuation(move |tx| tx.set(&y, 42));
            }
            ObserverAction::Continue
        })
    };
    let _y_obs = {
        let turn_ids = turn_ids.clone();
        d.observe(y.signal(), move |_, ctx| {
            turn_ids.lock().push(ctx.turn_id());
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&x, 1)).unwrap();

    assert_eq!(y.get(), 42, "continuation applied after the turn ended");
    let ids = turn_ids.lock();
    assert_eq!(ids.len(), 2);
    assert!(ids[1] > ids[0], "continuation ran as its own turn");
}

#[test]
fn transactions_inside_a_turn_are_rejected() {
    let d = domain();
    let x = d.var(0i32);
    let nested_result: Arc<Mutex<Option<ReflowError>>> = Arc::new(Mutex::new(None));

    let _obs = {
        let (d2, nested_result) = (d.clone(), nested_result.clone());
        d.observe(x.signal(), move |_, _| {
            let err = d2
                .do_transaction(TurnFlags::NONE, |_| {})
                .expect_err("nested transaction must fail");
            *nested_result.lock() = Some(err);
            ObserverAction::Continue
        })
    };

    d.do_transaction(TurnFlags::NONE, |tx| tx.set(&x, 1)).unwrap();
    assert!(matches!(
        nested_result.lock().take(),
        Some(ReflowError::InvalidStructuralOp(_))
    ));
}

#[test]
fn destroy_honors_strong_predecessor_edges() {
    let d = domain();
    let a = d.var(0u8);
    let b = {
        let a_sig = a.signal().clone();
        d.computed(&[a.id()], move || a_sig.get())
    };

    let err = d.destroy(a.id()).unwrap_err();
    assert!(matches!(err, ReflowError::InvalidStructuralOp(_)));

    d.destroy(b.id()).unwrap();
    d.destroy(a.id()).unwrap();
}
