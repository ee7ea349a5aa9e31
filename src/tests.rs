use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    channel::Channel,
    engine::Engine,
    error::{Error, FiberError, ThreadError},
    fiber::{Fiber, FiberStatus},
    host::{Host, NativeHost},
    safepoint::{Phase, PhaseTracker},
    shared_state::SharedState,
    value::Value,
    Config,
};

fn config() -> Config {
    Config {
        fiber_stack_size: 16 * 1024,
        fiber_stacks: 4,
        thread_stack_size: 512 * 1024,
        concurrent_marking: false,
        ..Default::default()
    }
}

fn runtime() -> Arc<SharedState> {
    SharedState::new(config())
}

#[test]
fn resume_returns_result_then_dead_fiber_error() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let fib = Fiber::create(&shared, |_| Ok(Value::Int(42)));
    assert_eq!(fib.status(), FiberStatus::Created);
    assert_eq!(fib.resume(vec![]).unwrap(), Value::Int(42));
    assert_eq!(fib.status(), FiberStatus::Dead);
    assert!(!fib.is_alive());
    assert_eq!(fib.resume(vec![]), Err(FiberError::Dead.into()));
    assert_eq!(fib.transfer(vec![]), Err(FiberError::Dead.into()));
    shared.shutdown();
}

#[test]
fn yield_hands_values_back_and_forth() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let fib = Fiber::create(&shared, |args| {
        if args != vec![Value::Int(1), Value::Int(2)] {
            return Ok(Value::Bool(false));
        }
        let first = Fiber::yield_(vec![Value::Int(3), Value::Int(4)])?;
        let second = Fiber::yield_(vec![])?;
        Ok(Value::Array(vec![first, second]))
    });

    assert_eq!(
        fib.resume(vec![Value::Int(1), Value::Int(2)]).unwrap(),
        Value::Array(vec![Value::Int(3), Value::Int(4)])
    );
    assert_eq!(fib.status(), FiberStatus::Sleeping);
    assert!(!fib.has_resumer());
    assert_eq!(fib.resume(vec![Value::Int(5)]).unwrap(), Value::Nil);
    assert_eq!(
        fib.resume(vec![]).unwrap(),
        Value::Array(vec![Value::Int(5), Value::Nil])
    );
    assert!(!fib.is_alive());
    shared.shutdown();
}

#[test]
fn yield_from_root_is_an_error() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    assert!(Fiber::current().unwrap().is_root());
    assert_eq!(Fiber::yield_(vec![]), Err(FiberError::RootYield.into()));
    shared.shutdown();
}

#[test]
fn fiber_api_requires_an_attached_thread() {
    let shared = runtime();
    let fib = Fiber::create(&shared, |_| Ok(Value::Nil));
    assert_eq!(fib.resume(vec![]), Err(ThreadError::NotAttached.into()));
    assert!(Fiber::current().is_err());
    shared.shutdown();
}

#[test]
fn resuming_a_fiber_that_awaits_its_resumer_is_a_double_resume() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let outer_handle: Arc<Mutex<Option<Fiber>>> = Arc::new(Mutex::new(None));

    let outer = {
        let outer_handle = outer_handle.clone();
        let inner_shared = shared.clone();
        Fiber::create(&shared, move |_| {
            let inner = Fiber::create(&inner_shared, move |_| {
                let outer = match outer_handle.lock().clone() {
                    Some(outer) => outer,
                    None => return Ok(Value::Nil),
                };
                let result = outer.resume(vec![]);
                Ok(Value::Bool(result == Err(FiberError::DoubleResume.into())))
            });
            inner.resume(vec![])
        })
    };
    *outer_handle.lock() = Some(outer.clone());

    assert_eq!(outer.resume(vec![]).unwrap(), Value::Bool(true));
    outer_handle.lock().take();
    shared.shutdown();
}

#[test]
fn resuming_the_running_fiber_is_rejected() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let root = Fiber::current().unwrap();
    assert_eq!(root.resume(vec![]), Err(FiberError::Current.into()));

    let fib = Fiber::create(&shared, |_| {
        let me = Fiber::current()?;
        Ok(Value::Bool(
            me.transfer(vec![]) == Err(FiberError::Current.into()),
        ))
    });
    assert_eq!(fib.resume(vec![]).unwrap(), Value::Bool(true));
    shared.shutdown();
}

#[test]
fn transfer_always_returns_to_the_root_fiber() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let b = Fiber::create(&shared, |_| Ok(Value::Int(7)));
    let a = {
        let b = b.clone();
        Fiber::create(&shared, move |_| {
            let back = b.transfer(vec![])?;
            Ok(Value::Array(vec![Value::Int(1), back]))
        })
    };

    // b finishing lands in root, not in a
    assert_eq!(a.transfer(vec![]).unwrap(), Value::Int(7));
    assert_eq!(b.status(), FiberStatus::Dead);
    assert!(a.is_alive());
    assert_eq!(a.status(), FiberStatus::Sleeping);
    assert!(a.has_resumer());
    assert_eq!(a.resume(vec![]), Err(FiberError::DoubleResume.into()));

    assert_eq!(
        a.transfer(vec![Value::Int(9)]).unwrap(),
        Value::Array(vec![Value::Int(1), Value::Int(9)])
    );
    shared.shutdown();
}

#[test]
fn yield_after_transfer_returns_to_the_root_fiber() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let b = Fiber::create(&shared, |_| {
        Fiber::yield_(vec![Value::Int(5)])?;
        Ok(Value::Nil)
    });
    let a = {
        let b = b.clone();
        let received = received.clone();
        Fiber::create(&shared, move |_| {
            let back = b.transfer(vec![])?;
            received.lock().push(back.clone());
            Ok(back)
        })
    };

    // the yield lands in root's pending resume, a stays suspended in its transfer
    assert_eq!(a.resume(vec![]).unwrap(), Value::Int(5));
    assert!(received.lock().is_empty());
    assert_eq!(a.status(), FiberStatus::Sleeping);
    assert_eq!(b.status(), FiberStatus::Sleeping);
    assert!(Fiber::current().unwrap().is_root());

    assert_eq!(a.transfer(vec![Value::Int(9)]).unwrap(), Value::Int(9));
    assert_eq!(*received.lock(), vec![Value::Int(9)]);
    assert_eq!(a.status(), FiberStatus::Dead);
    shared.shutdown();
}

#[test]
fn fiber_bound_to_another_engine_cannot_be_resumed() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let fib = Fiber::create(&shared, |_| {
        Fiber::yield_(vec![])?;
        Ok(Value::Nil)
    });
    fib.resume(vec![]).unwrap();

    let worker = {
        let fib = fib.clone();
        Engine::spawn(&shared, "worker", move || {
            let result = fib.resume(vec![]);
            Ok(Value::Bool(result == Err(FiberError::CrossEngine.into())))
        })
        .unwrap()
    };
    assert_eq!(worker.value().unwrap(), Value::Bool(true));
    assert_eq!(fib.resume(vec![]).unwrap(), Value::Nil);
    shared.shutdown();
}

#[test]
fn fiber_locals_shadow_engine_locals() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    main.set_local("x", Value::Int(1));

    let fib = Fiber::create(&shared, |_| {
        let engine = Engine::current()?;
        let before = engine.local("x");
        engine.set_local("x", Value::Int(2));
        Fiber::yield_(vec![before])?;
        Ok(engine.local("x"))
    });

    assert_eq!(fib.resume(vec![]).unwrap(), Value::Nil);
    assert_eq!(main.local("x"), Value::Int(1));
    assert_eq!(fib.local("x"), Some(Value::Int(2)));
    assert_eq!(fib.resume(vec![]).unwrap(), Value::Int(2));

    assert!(main.has_local("x"));
    assert_eq!(main.local_keys(), vec!["x".to_string()]);
    assert_eq!(main.remove_local("x"), Value::Int(1));
    assert_eq!(main.local("x"), Value::Nil);
    shared.shutdown();
}

#[test]
fn panicking_fiber_delivers_an_error_to_its_resumer() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let fib = Fiber::create(&shared, |_| panic!("boom"));
    assert_eq!(fib.resume(vec![]), Err(Error::Panic("boom".to_string())));
    assert!(!fib.is_alive());

    let raising = Fiber::create(&shared, |_| Err(Error::raise(5i64)));
    assert_eq!(raising.resume(vec![]), Err(Error::raise(5i64)));
    shared.shutdown();
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn wait_for(flag: &AtomicBool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    flag.load(Ordering::SeqCst)
}

#[test]
fn dropping_a_suspended_fiber_retires_its_context() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let unwound = Arc::new(AtomicBool::new(false));
    let fib = {
        let unwound = unwound.clone();
        Fiber::create(&shared, move |_| {
            let _guard = SetOnDrop(unwound);
            Fiber::yield_(vec![])
        })
    };
    fib.resume(vec![]).unwrap();
    let before = shared.pool().contexts().len();
    let leased = shared.pool().statistics().total_refs;
    drop(fib);

    assert_eq!(shared.pool().statistics().total_refs, leased - 1);
    assert!(wait_for(&unwound));
    assert_eq!(shared.pool().contexts().len(), before - 1);
    shared.shutdown();
}

#[test]
fn killed_fiber_never_runs_past_its_suspension() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    let unwound = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicBool::new(false));
    let fib = {
        let unwound = unwound.clone();
        let ran = ran.clone();
        Fiber::create(&shared, move |_| {
            let _guard = SetOnDrop(unwound);
            // ignoring the error must not let the body carry on
            let _ = Fiber::yield_(vec![]);
            ran.store(true, Ordering::SeqCst);
            Engine::current()?.set_local("ghost", Value::Int(1));
            Ok(Value::Nil)
        })
    };
    fib.resume(vec![]).unwrap();
    let before = shared.pool().contexts().len();
    drop(fib);

    assert!(wait_for(&unwound));
    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(main.local("ghost"), Value::Nil);
    assert_eq!(shared.pool().contexts().len(), before - 1);
    assert!(Engine::current().unwrap().current_fiber().is_root());
    shared.shutdown();
}

#[test]
fn pool_stays_bounded_and_preserves_stack_roots() {
    let shared = SharedState::new(Config {
        fiber_stacks: 2,
        ..config()
    });
    let main = shared.attach_current_thread("main").unwrap();

    let fibers = (0..5)
        .map(|i| {
            let object = main.allocate(vec![Value::Int(i)]);
            Fiber::create(&shared, move |_| {
                let engine = Engine::current()?;
                engine.enter_frame()?;
                engine.push_root(object)?;
                Fiber::yield_(vec![])?;
                let popped = engine.pop_root()?;
                engine.leave_frame()?;
                Ok(Value::Bool(popped == Some(object)))
            })
        })
        .collect::<Vec<_>>();

    for fib in fibers.iter() {
        assert_eq!(fib.resume(vec![]).unwrap(), Value::Nil);
        assert!(shared.pool().len() <= 2);
    }
    assert_eq!(shared.pool().len(), 2);
    for fib in fibers.iter().rev() {
        assert_eq!(fib.resume(vec![]).unwrap(), Value::Bool(true));
    }
    assert!(shared.pool().len() <= 2);
    shared.shutdown();
}

#[test]
fn channel_is_fifo() {
    let shared = runtime();
    let channel = Channel::new(&shared);
    for i in 0..3 {
        channel.send(Value::Int(i));
    }
    assert_eq!(channel.len(), 3);
    for i in 0..3 {
        assert_eq!(channel.receive().unwrap(), Value::Int(i));
    }
    assert!(channel.is_empty());
    assert_eq!(channel.try_receive(), Value::Nil);
    shared.shutdown();
}

#[test]
fn nil_sends_act_as_a_semaphore() {
    let shared = runtime();
    let channel = Channel::new(&shared);
    channel.send(Value::Nil);
    channel.send(Value::Nil);
    assert_eq!(channel.semaphore_count(), 2);
    channel.send(Value::Int(5));
    // pending counts became placeholders in front of the value
    assert_eq!(channel.semaphore_count(), 0);
    assert_eq!(channel.receive().unwrap(), Value::Nil);
    assert_eq!(channel.receive().unwrap(), Value::Nil);
    assert_eq!(channel.receive().unwrap(), Value::Int(5));

    channel.send(Value::Int(6));
    channel.send(Value::Nil);
    assert_eq!(channel.receive().unwrap(), Value::Nil);
    assert_eq!(channel.receive().unwrap(), Value::Int(6));
    shared.shutdown();
}

#[test]
fn receive_timeout_returns_nil_after_the_deadline() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let channel = Channel::new(&shared);
    let start = Instant::now();
    assert_eq!(
        channel.receive_timeout(Some(Duration::from_millis(10))).unwrap(),
        Value::Nil
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(10));
    assert!(elapsed < Duration::from_secs(2));

    assert_eq!(
        channel.receive_timeout_value(&Value::Float(0.01)).unwrap(),
        Value::Nil
    );
    assert!(channel
        .receive_timeout_value(&Value::Bool(true))
        .is_err());
    shared.shutdown();
}

#[test]
fn receive_wakes_up_for_a_value_sent_from_another_engine() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let channel = Channel::new(&shared);
    let sender = {
        let channel = channel.clone();
        Engine::spawn(&shared, "sender", move || {
            thread::sleep(Duration::from_millis(20));
            channel.send(Value::Int(11));
            Ok(Value::Nil)
        })
        .unwrap()
    };
    assert_eq!(channel.receive().unwrap(), Value::Int(11));
    sender.join(None).unwrap();
    shared.shutdown();
}

#[test]
fn wakeup_without_a_value_returns_false() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let channel = Channel::new(&shared);
    let worker = {
        let channel = channel.clone();
        Engine::spawn(&shared, "receiver", move || channel.receive()).unwrap()
    };
    while worker.join(Some(Duration::from_millis(5))).unwrap().is_none() {
        worker.wakeup();
    }
    assert_eq!(worker.value().unwrap(), Value::Bool(false));
    assert!(!worker.wakeup());
    shared.shutdown();
}

#[test]
fn kill_interrupts_a_channel_wait() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let channel = Channel::new(&shared);
    let interrupted = Arc::new(AtomicBool::new(false));
    let worker = {
        let channel = channel.clone();
        let interrupted = interrupted.clone();
        Engine::spawn(&shared, "receiver", move || {
            let result = channel.receive();
            interrupted.store(result == Err(Error::Killed), Ordering::SeqCst);
            result
        })
        .unwrap()
    };
    thread::sleep(Duration::from_millis(10));
    worker.kill().unwrap();
    assert!(worker.join(Some(Duration::from_secs(5))).unwrap().is_some());
    assert!(interrupted.load(Ordering::SeqCst));
    assert_eq!(worker.value().unwrap(), Value::Nil);
    assert_eq!(channel.waiters(), 0);
    shared.shutdown();
}

#[test]
fn kill_is_delivered_at_the_next_checkpoint() {
    let shared = runtime();
    let _main = shared.attach_current_thread("main").unwrap();
    let spins = Arc::new(AtomicUsize::new(0));
    let worker = {
        let spins = spins.clone();
        Engine::spawn(&shared, "spinner", move || {
            let engine = Engine::current()?;
            loop {
                engine.checkpoint()?;
                spins.fetch_add(1, Ordering::Relaxed);
                thread::yield_now();
            }
        })
        .unwrap()
    };
    while spins.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }
    worker.kill().unwrap();
    assert_eq!(worker.value().unwrap(), Value::Nil);
    assert!(!worker.is_alive());
    assert!(worker.is_zombie());
    assert_eq!(shared.reap_zombies(), 1);
    shared.shutdown();
}

#[test]
fn raise_delivers_the_exception_as_the_task_result() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    let worker = Engine::spawn(&shared, "sleeper", move || {
        let engine = Engine::current()?;
        loop {
            engine.sleep(Some(Duration::from_millis(50)))?;
        }
    })
    .unwrap();
    thread::sleep(Duration::from_millis(10));
    worker.raise(Error::raise(3i64)).unwrap();
    assert_eq!(worker.value(), Err(Error::raise(3i64)));

    // on the calling engine the condition is returned in place
    assert_eq!(main.kill(), Err(Error::Killed));
    assert_eq!(main.raise(Error::raise(4i64)), Err(Error::raise(4i64)));
    shared.shutdown();
}

#[test]
fn join_times_out_on_a_running_engine() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    let worker = Engine::spawn(&shared, "sleeper", || {
        let slept = Engine::current()?.sleep(None)?;
        Ok(Value::Float(slept.as_secs_f64()))
    })
    .unwrap();
    assert!(worker
        .join(Some(Duration::from_millis(20)))
        .unwrap()
        .is_none());
    assert!(worker.is_alive());
    while worker.join(Some(Duration::from_millis(5))).unwrap().is_none() {
        worker.wakeup();
    }
    assert!(matches!(worker.value(), Ok(Value::Float(_))));
    assert_eq!(main.join(None), Err(ThreadError::JoinSelf.into()));
    shared.shutdown();
}

#[test]
fn engine_bookkeeping() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    assert!(main.is_main());
    assert!(main.is_alive());
    assert!(main.tid() != 0);
    assert!(main.start_time().is_some());
    assert_eq!(main.set_priority(5), 5);
    assert_eq!(main.priority(), 5);
    assert_eq!(
        shared.attach_current_thread("again").map(|_| ()),
        Err(ThreadError::AlreadyStarted.into())
    );

    let worker = Engine::create(&shared, "worker", || Ok(Value::Int(1)));
    assert!(!worker.is_alive());
    assert!(!worker.is_main());
    worker.fork(Some(1)).unwrap();
    assert_eq!(worker.fork(None), Err(ThreadError::AlreadyStarted.into()));
    assert_eq!(worker.value().unwrap(), Value::Int(1));
    assert!(worker.start_time().is_some());
    assert_eq!(Engine::list(&shared).len(), 2);

    let bad = Engine::create(&shared, "bad", || Ok(Value::Nil));
    assert!(matches!(
        bad.fork(Some(0)),
        Err(Error::Thread(ThreadError::StackSize { .. }))
    ));
    shared.shutdown();
}

#[test]
fn exit_requests_reach_the_host() {
    let host = Arc::new(NativeHost::new());
    let shared = SharedState::with_host(config(), host.clone() as Arc<dyn Host>);
    let _main = shared.attach_current_thread("main").unwrap();
    let worker = Engine::spawn(&shared, "exiter", || Err(Error::Exit(3))).unwrap();
    worker.join(None).unwrap();
    assert_eq!(host.exit_status(), Some(3));

    let plain = Engine::spawn(&shared, "plain", || Err(Error::raise(1i64))).unwrap();
    plain.join(None).unwrap();
    assert_eq!(host.exit_status(), Some(3));

    // the main engine finishing reports a clean exit
    shared.shutdown();
    assert_eq!(host.exit_status(), Some(0));
}

#[test]
fn synchronous_collection_keeps_roots_and_sweeps_garbage() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    let kept = main.allocate(vec![]);
    let nested = main.allocate(vec![Value::Int(1)]);
    shared.heap().set_field(kept, 0, Value::Object(nested)).unwrap();
    main.set_local("kept", Value::Object(kept));
    let garbage = main.allocate(vec![]);

    let queued = main.allocate(vec![]);
    let channel = Channel::new(&shared);
    channel.send(Value::Object(queued));

    let on_stack = main.allocate(vec![]);
    let fib = Fiber::create(&shared, move |_| {
        let engine = Engine::current()?;
        engine.push_root(on_stack)?;
        Fiber::yield_(vec![])?;
        Ok(Value::Nil)
    });
    fib.resume(vec![]).unwrap();

    shared.collect_garbage();
    let heap = shared.heap();
    assert!(heap.contains(kept));
    assert!(heap.contains(nested));
    assert!(heap.contains(queued));
    assert!(heap.contains(on_stack));
    assert!(!heap.contains(garbage));
    assert_eq!(shared.barrier().cycles(), 1);
    assert!(fib.is_alive());
    assert_eq!(fib.resume(vec![]).unwrap(), Value::Nil);
    shared.shutdown();
}

#[test]
fn marker_finishes_a_requested_cycle() {
    let shared = SharedState::new(Config {
        concurrent_marking: true,
        gc_threshold: 1 << 20,
        mark_step: 2,
        ..config()
    });
    assert!(shared.marker().is_running());
    let main = shared.attach_current_thread("main").unwrap();

    let mut chain = Value::Nil;
    for _ in 0..64 {
        chain = Value::Object(main.allocate(vec![chain]));
    }
    let head = chain.as_object().unwrap();
    main.set_local("chain", chain);
    let garbage = (0..32).map(|_| main.allocate(vec![])).collect::<Vec<_>>();

    shared.collect_garbage();
    let heap = shared.heap();
    assert!(shared.barrier().cycles() >= 1);
    assert!(heap.contains(head));
    assert_eq!(heap.len(), 64);
    assert!(garbage.iter().all(|object| !heap.contains(*object)));
    assert!(!heap.is_marking());

    let stats = shared.statistics();
    assert_eq!(stats.live_objects, 64);
    assert!(stats.total_objects_swept >= 32);
    assert!(stats.to_string().contains("Total GC cycles count"));
    shared.shutdown();
    assert!(!shared.marker().is_running());
}

#[test]
fn young_pass_runs_with_the_world_stopped() {
    let shared = runtime();
    let main = shared.attach_current_thread("main").unwrap();
    main.allocate(vec![]);
    let observed = Arc::new(Mutex::new(None));
    {
        let observed = observed.clone();
        shared.collect_young(move |heap| {
            *observed.lock() = Some((heap.collect_young_requested(), heap.len()));
        });
    }
    assert_eq!(*observed.lock(), Some((true, 1)));
    assert!(!shared.heap().collect_young_requested());
    shared.shutdown();
}

#[test]
fn young_pass_makes_a_tracing_marker_step_aside() {
    let shared = SharedState::new(Config {
        concurrent_marking: true,
        gc_threshold: 1 << 20,
        mark_step: 1,
        ..config()
    });
    let main = shared.attach_current_thread("main").unwrap();
    let mut chain = Value::Nil;
    for _ in 0..50_000 {
        chain = Value::Object(main.allocate(vec![chain]));
    }
    let head = chain.as_object().unwrap();
    main.set_local("chain", chain);

    shared.barrier().request_gc(false);
    shared.marker().wake();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !shared.heap().is_marking() && Instant::now() < deadline {
        main.pass();
    }
    assert!(shared.heap().is_marking());

    let mut observed = None;
    shared.collect_young(|heap| {
        let marker = shared
            .tracker()
            .phases()
            .into_iter()
            .find(|(name, _)| name == "comet.marker")
            .map(|(_, phase)| phase);
        observed = Some((heap.is_marking(), heap.collect_full_requested(), marker));
    });
    // the cycle is suspended, not finished
    assert_eq!(observed, Some((true, false, Some(Phase::Yielding))));
    assert!(shared.marker().yields() >= 1);

    shared.collect_garbage();
    assert!(shared.barrier().cycles() >= 1);
    assert!(shared.heap().contains(head));
    assert_eq!(shared.heap().len(), 50_000);
    shared.shutdown();
}

#[test]
fn after_fork_child_discards_marking_and_restarts_the_marker() {
    let shared = SharedState::new(Config {
        concurrent_marking: true,
        gc_threshold: 1 << 20,
        ..config()
    });
    let main = shared.attach_current_thread("main").unwrap();
    let worker = Engine::spawn(&shared, "worker", || {
        Engine::current()?.sleep(Some(Duration::from_millis(100)))?;
        Ok(Value::Nil)
    })
    .unwrap();
    let kept = main.allocate(vec![]);
    main.set_local("kept", Value::Object(kept));

    // the marker thread does not exist in a child image; leave its state behind
    shared.marker().stop(&shared);
    assert!(!shared.marker().is_running());
    shared.heap().start_marking();
    shared.heap().set_collect_young(true);
    assert!(!shared.forked());

    shared.after_fork_child().unwrap();
    assert!(!shared.heap().is_marking());
    assert!(!shared.heap().collect_young_requested());
    assert!(shared.marker().is_running());
    assert_eq!(shared.marker().threshold(), 1 << 20);
    assert!(!worker.is_alive());
    assert!(main.is_alive());

    shared.collect_garbage();
    assert!(shared.barrier().cycles() >= 1);
    assert!(shared.heap().contains(kept));
    shared.shutdown();
    assert!(!shared.marker().is_running());
}

#[test]
fn stop_the_world_waits_for_a_blocking_marker() {
    let tracker = Arc::new(PhaseTracker::new());
    let marker = tracker.register("marker");
    let mutator = tracker.register("mutator");
    tracker.managed(&marker);
    tracker.blocking(&marker);
    tracker.unmanaged(&mutator);

    let locked = Arc::new(AtomicBool::new(false));
    let t = {
        let tracker = tracker.clone();
        let locked = locked.clone();
        thread::spawn(move || {
            let _guard = tracker.lock(&mutator);
            locked.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!locked.load(Ordering::SeqCst));
    assert!(tracker.is_stop_requested());

    tracker.yielding(&marker);
    t.join().unwrap();
    assert!(locked.load(Ordering::SeqCst));
    assert_eq!(marker.phase(), Phase::Yielding);
    tracker.blocking(&marker);
    assert_eq!(marker.phase(), Phase::Blocking);
}

#[test]
fn jit_is_disabled() {
    let shared = runtime();
    assert!(!shared.jit().enable());
    assert!(!shared.jit().compile("loop", 10_000, true));
    shared.shutdown();
}
