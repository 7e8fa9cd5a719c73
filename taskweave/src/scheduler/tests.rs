use super::*;
use crate::deps::{EventDep, ManualEvent, set_dependency_completion};
use crate::error::PoolError;
use crate::runtime::Builder;
use crate::task::{
    self, CustomDep, Interlock, InterlockDep, InterlockFlag, StrongDep, StrongDeps, TaskStatus,
    WeakDep, WeakDeps,
};
use crate::test_utils::*;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicU64, AtomicUsize};

assert_impl_all!(Scheduler: Send, Sync, Clone);

const W: ThreadType = ThreadType::Worker;
const M: ThreadType = ThreadType::Main;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_strong_chain_runs_in_order() -> Result<()> {
    let rt = threaded_runtime(4);
    let value = Arc::new(AtomicU64::new(0));

    let step = |digit: u64| {
        let value = value.clone();
        AsyncTask::new(task::from_fn(W, "step", move |_| {
            let v = value.load(Ordering::Relaxed);
            value.store(v * 16 + digit, Ordering::Relaxed);
        }))
    };

    let (a, b, c) = (step(1), step(1), step(2));

    // Dependents first, their predecessors are still `Initial`.
    rt.enqueue(&c, &b)?;
    rt.enqueue(&b, &a)?;
    rt.enqueue(&a, ())?;

    rt.wait(&[a, b, c.clone()], TIMEOUT)?;
    assert_eq!(value.load(Ordering::Relaxed), 0x112);
    assert_eq!(c.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_cancel_propagates_along_strong_edges_only() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let a = rt.spawn(rec.task("a"), ())?;
    let b = rt.spawn(rec.task("b"), &a)?;
    let c = rt.spawn(rec.task("c"), StrongDep(b.clone()))?;
    let d = rt.spawn(rec.task("d"), WeakDep(a.clone()))?;

    assert!(rt.cancel(&a));
    assert_eq!(rt.run_until_idle(W), 4);

    for task in [&a, &b, &c] {
        assert_eq!(task.status(), TaskStatus::Canceled, "{task:?}");
    }
    assert_eq!(d.status(), TaskStatus::Completed);

    assert_eq!(
        rec.events().iter().filter(|e| matches!(e, Event::Cancel(_))).count(),
        3
    );
    assert!(rec.ran("d"));
    assert!(!rec.ran("a") && !rec.ran("b") && !rec.ran("c"));
    assert!(rec.position(&Event::Cancel("a")) < rec.position(&Event::Cancel("b")));

    Ok(())
}

#[test]
fn test_canceled_predecessor_dooms_join() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let a = rt.spawn(rec.task("a"), ())?;
    let b = rt.spawn(rec.task("b"), ())?;
    let c = rt.spawn(rec.task("c"), StrongDeps(vec![a.clone(), b.clone()]))?;

    assert!(rt.cancel(&b));
    assert_eq!(rt.run_until_idle(W), 3);

    assert_eq!(a.status(), TaskStatus::Completed);
    assert_eq!(b.status(), TaskStatus::Canceled);
    assert_eq!(c.status(), TaskStatus::Canceled);
    assert_eq!(
        rec.events(),
        vec![Event::Run("a"), Event::Cancel("b"), Event::Cancel("c")]
    );

    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Complete,
    Fail,
    Cancel,
}

#[rstest]
#[case::weak_after_complete(Outcome::Complete, false, TaskStatus::Completed)]
#[case::weak_after_fail(Outcome::Fail, false, TaskStatus::Completed)]
#[case::weak_after_cancel(Outcome::Cancel, false, TaskStatus::Completed)]
#[case::strong_after_complete(Outcome::Complete, true, TaskStatus::Completed)]
#[case::strong_after_fail(Outcome::Fail, true, TaskStatus::Completed)]
#[case::strong_after_cancel(Outcome::Cancel, true, TaskStatus::Canceled)]
fn test_dependent_outcome(
    #[case] outcome: Outcome,
    #[case] strong: bool,
    #[case] expected: TaskStatus,
    #[values(false, true)] finished_before_registration: bool,
) -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let pred = match outcome {
        Outcome::Fail => rec.task("pred").failing(),
        _ => rec.task("pred"),
    };
    let pred = AsyncTask::new(pred);

    let finish_pred = || -> Result<()> {
        if let Outcome::Cancel = outcome {
            assert!(rt.cancel(&pred));
        }
        rt.enqueue(&pred, ())?;
        assert_eq!(rt.run_until_idle(W), 1);
        Ok(())
    };

    if finished_before_registration {
        finish_pred()?;
    }

    let dep = task::Dependency::Task {
        task: pred.clone(),
        strong,
    };
    let dependent = rt.spawn(rec.task("dependent").on(M), dep)?;

    if !finished_before_registration {
        assert!(!dependent.is_ready());
        finish_pred()?;
    }

    assert!(dependent.is_ready());
    assert_eq!(rt.run_until_idle(M), 1);
    assert_eq!(dependent.status(), expected);
    assert_eq!(rec.ran("dependent"), expected == TaskStatus::Completed);

    Ok(())
}

#[rstest]
#[case(1)]
#[case(7)]
#[case(63)]
#[case(64)]
fn test_ready_only_after_every_dependency(#[case] k: usize) -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let preds = (0..k)
        .map(|_| rt.spawn(rec.task("pred"), ()))
        .collect::<Result<Vec<_>, _>>()?;
    let dependent = rt.spawn(rec.task("dependent").on(M), StrongDeps(preds.clone()))?;

    for (i, _) in preds.iter().enumerate() {
        assert!(!rt.process_task(M, i), "dependent pulled with {} deps left", k - i);
        assert!(rt.process_task(W, i));
    }

    assert_eq!(dependent.wait_bits(), 0);
    assert!(rt.process_task(M, 0));
    assert_eq!(dependent.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_too_many_dependencies() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let preds = (0..=MAX_DEPS)
        .map(|_| AsyncTask::new(rec.task("pred")))
        .collect::<Vec<_>>();

    let dependent = AsyncTask::new(rec.task("dependent"));
    let err = rt.enqueue(&dependent, WeakDeps(preds)).unwrap_err();

    assert_eq!(
        err,
        SchedulerError::TooManyDependencies {
            requested: MAX_DEPS + 1,
            max: MAX_DEPS,
        }
    );
    assert!(err.is_fatal());
    assert_eq!(dependent.status(), TaskStatus::Initial);
    assert_eq!(rt.queued(W), 0);

    Ok(())
}

const MAX_DEPS: usize = crate::task::MAX_DEPENDENCIES;

#[test]
fn test_continue_with_weak_dependency() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let outer = {
        let rec = rec.clone();
        let runs = runs.clone();

        task::from_fn(W, "outer", move |cx| {
            match runs.fetch_add(1, Ordering::Relaxed) {
                0 => {
                    let helper = cx
                        .scheduler()
                        .spawn(rec.task("helper").failing(), ())
                        .expect("helper enqueued");
                    cx.continue_with(WeakDep(helper)).expect("continuation registered");
                }
                _ => rec.record(Event::Run("outer")),
            }
        })
    };

    let outer = rt.spawn(outer, ())?;
    let downstream = rt.spawn(rec.task("downstream"), &outer)?;

    assert!(rt.process_task(W, 0));
    assert_eq!(outer.status(), TaskStatus::Pending);
    assert!(!outer.is_ready());
    assert!(!downstream.is_ready());

    rt.run_until_idle(W);

    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert_eq!(outer.status(), TaskStatus::Completed);
    assert_eq!(
        rec.events(),
        vec![
            Event::Run("helper"),
            Event::Run("outer"),
            Event::Run("downstream")
        ]
    );

    Ok(())
}

#[test]
fn test_continue_without_deps_requeues() -> Result<()> {
    let rt = manual_runtime();
    let runs = Arc::new(AtomicUsize::new(0));

    let looping = {
        let runs = runs.clone();
        task::from_fn(W, "looping", move |cx| {
            if runs.fetch_add(1, Ordering::Relaxed) < 4 {
                cx.continue_with(()).expect("requeued");
            }
        })
    };

    let task = rt.spawn(looping, ())?;
    assert_eq!(rt.run_until_idle(W), 5);
    assert_eq!(task.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_cancel_while_continuing() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();
    let observed = Arc::new(AtomicUsize::new(0));

    let body = {
        let observed = observed.clone();
        task::from_fn(W, "self-cancel", move |cx| {
            cx.continue_with(()).expect("continuation registered");
            assert!(cx.scheduler().cancel(cx.task()));
            if cx.is_cancellation_requested() {
                observed.fetch_add(1, Ordering::Relaxed);
            }
        })
    };

    let task = rt.spawn(body, ())?;
    let strong = rt.spawn(rec.task("strong"), &task)?;

    rt.run_until_idle(W);

    assert_eq!(observed.load(Ordering::Relaxed), 1);
    assert_eq!(task.status(), TaskStatus::Canceled);
    assert_eq!(strong.status(), TaskStatus::Canceled);
    assert!(!rt.cancel(&task));

    Ok(())
}

#[test]
fn test_cancel_before_enqueue_runs_on_cancel() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let task = AsyncTask::new(rec.task("early").on(ThreadType::FileIO));
    assert!(rt.cancel(&task));
    assert!(!rt.cancel(&task));

    rt.enqueue(&task, ())?;
    assert_eq!(rt.run_until_idle(W), 0);
    assert_eq!(rt.run_until_idle(ThreadType::FileIO), 1);

    assert_eq!(task.status(), TaskStatus::Canceled);
    assert_eq!(rec.events(), vec![Event::Cancel("early")]);

    Ok(())
}

#[test]
fn test_panicking_task_fails_without_propagating() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let boom = rt.spawn(task::from_fn(W, "boom", |_| panic!("boom")), ())?;
    let strong = rt.spawn(rec.task("strong"), &boom)?;
    let weak = rt.spawn(rec.task("weak"), WeakDep(boom.clone()))?;

    rt.run_until_idle(W);

    assert_eq!(boom.status(), TaskStatus::Failed);
    assert!(boom.is_interrupted());
    assert_eq!(strong.status(), TaskStatus::Completed);
    assert_eq!(weak.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_interlock_mutual_exclusion() -> Result<()> {
    const TASKS: usize = 64;

    let rt = threaded_runtime(4);
    let flag = InterlockFlag::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let tasks = (0..TASKS)
        .map(|_| {
            let active = active.clone();
            let max_active = max_active.clone();

            let body = task::from_fn(W, "exclusive", move |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(100));
                active.fetch_sub(1, Ordering::SeqCst);
            });

            rt.spawn(body, InterlockDep(flag.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    rt.wait(&tasks, TIMEOUT)?;

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(!flag.is_locked());

    Ok(())
}

#[test]
fn test_interlock_held_by_outsider_blocks_pull() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();
    let flag = InterlockFlag::new();

    assert!(flag.try_lock());
    let task = rt.spawn(rec.task("locked"), InterlockDep(flag.clone()))?;

    assert_eq!(rt.run_until_idle(W), 0);

    // Cancellation does not need the interlock.
    assert!(rt.cancel(&task));
    assert_eq!(rt.run_until_idle(W), 1);
    assert_eq!(task.status(), TaskStatus::Canceled);
    assert!(flag.is_locked());

    Ok(())
}

#[test]
fn test_registration_errors() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let task = AsyncTask::new(rec.task("self"));
    assert!(matches!(rt.enqueue(&task, &task), Err(SchedulerError::Other(_))));

    let task = AsyncTask::new(rec.task("twice"));
    let locks = (
        InterlockDep(InterlockFlag::new()),
        InterlockDep(InterlockFlag::new()),
    );
    assert_eq!(rt.enqueue(&task, locks), Err(SchedulerError::DuplicateInterlock));

    let task = AsyncTask::new(rec.task("unknown"));
    assert_eq!(
        rt.enqueue(&task, CustomDep::new(5u16)),
        Err(SchedulerError::UnknownDependency("u16"))
    );

    let task = rt.spawn(rec.task("again"), ())?;
    assert_eq!(
        rt.enqueue(&task, ()),
        Err(SchedulerError::InvalidState {
            expected: "Initial",
            found: TaskStatus::Pending,
        })
    );

    Ok(())
}

#[test]
fn test_failed_enqueue_leaves_no_edge_behind() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let a = rt.spawn(rec.task("a"), ())?;
    let b = AsyncTask::new(rec.task("b"));
    let t = AsyncTask::new(rec.task("t"));

    assert_eq!(
        rt.enqueue(&t, (&a, CustomDep::new(5u16))),
        Err(SchedulerError::UnknownDependency("u16"))
    );
    assert_eq!(t.status(), TaskStatus::Initial);

    // Retried behind `b` only, finishing `a` must not release it.
    rt.enqueue(&t, &b)?;
    assert_eq!(rt.run_until_idle(W), 1);

    assert!(!t.is_ready());
    assert_eq!(t.wait_bits(), 1);
    assert!(!rec.ran("t"));

    rt.enqueue(&b, ())?;
    assert_eq!(rt.run_until_idle(W), 2);
    assert_eq!(rec.events(), vec![Event::Run("a"), Event::Run("b"), Event::Run("t")]);

    Ok(())
}

#[test]
fn test_exhaustion_mid_registration_unlinks_earlier_edges() -> Result<()> {
    let rt = Builder::new()
        .worker_threads(0)
        .output_chunk_size(1)
        .output_max_chunks(1)
        .try_build()?;
    let rec = Recorder::new();

    // The only output chunk of the pool, one slot left.
    let root = rt.spawn(rec.task("root").on(M), ())?;
    for _ in 0..crate::task::output::OUTPUT_CHUNK_CAPACITY - 1 {
        rt.spawn(rec.task("leaf"), &root)?;
    }

    let other = AsyncTask::new(rec.task("other"));
    let t = AsyncTask::new(rec.task("t"));

    assert_eq!(
        rt.enqueue(&t, (&root, &other)),
        Err(SchedulerError::Pool(PoolError::Exhausted))
    );
    assert_eq!(t.status(), TaskStatus::Initial);
    assert_eq!(t.wait_bits(), u64::MAX);

    assert_eq!(rt.run_until_idle(M), 1);
    assert_eq!(rt.run_until_idle(W), crate::task::output::OUTPUT_CHUNK_CAPACITY - 1);
    assert_eq!(t.wait_bits(), u64::MAX);

    // The chunk went back to the pool with `root`.
    rt.enqueue(&t, &other)?;
    assert_eq!(rt.run_until_idle(W), 0);

    rt.enqueue(&other, ())?;
    assert_eq!(rt.run_until_idle(W), 2);
    assert!(rec.ran("t"));
    assert_eq!(rt.shared.output_pool.assigned_count(), 0);

    Ok(())
}

#[test]
fn test_manager_failure_after_parking_fails_task() -> Result<()> {
    // Takes a bit, then reports an error. The parked bit stays live.
    struct Parked;

    #[derive(Default)]
    struct ParkingManager {
        parked: parking_lot::Mutex<Vec<(AsyncTask, u32)>>,
    }

    impl DependencyManager for ParkingManager {
        fn resolve(
            &self,
            _scheduler: &Scheduler,
            _dep: CustomDep,
            task: &AsyncTask,
            bit_index: &mut u32,
        ) -> Result<(), SchedulerError> {
            let bit = crate::deps::next_wait_bit(bit_index)?;
            self.parked.lock().push((task.clone(), bit));
            Err(PoolError::Exhausted.into())
        }
    }

    let rt = manual_runtime();
    let rec = Recorder::new();
    let manager = Arc::new(ParkingManager::default());
    assert!(rt.register_dependency_manager::<Parked>(manager.clone()));

    let a = rt.spawn(rec.task("a"), ())?;
    let t = AsyncTask::new(rec.task("t"));
    let dependent = rt.spawn(rec.task("dependent"), &t)?;

    assert_eq!(
        rt.enqueue(&t, (&a, CustomDep::new(Parked))),
        Err(SchedulerError::Pool(PoolError::Exhausted))
    );

    // Cannot be retried while the manager holds a bit, dependents move on.
    assert_eq!(t.status(), TaskStatus::Failed);
    assert_eq!(t.wait_bits(), 0b10);
    assert!(dependent.is_ready());
    assert_eq!(
        t.reset_for_reuse(),
        Err(SchedulerError::UnresolvedDependencies { remaining: 1 })
    );

    assert_eq!(rt.run_until_idle(W), 2);
    assert_eq!(t.wait_bits(), 0b10);
    assert!(!rec.ran("t"));

    for (task, bit) in manager.parked.lock().drain(..) {
        set_dependency_completion(&task, bit, false);
    }
    t.reset_for_reuse()?;
    rt.enqueue(&t, ())?;
    rt.run_until_idle(W);
    assert_eq!(t.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_failed_continuation_is_reusable_once_resolved() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let gate = AsyncTask::new(rec.task("gate"));
    let unknown = AsyncTask::new(rec.task("unknown"));

    let body = {
        let gate = gate.clone();
        let unknown = unknown.clone();
        let runs = runs.clone();

        task::from_fn(W, "flaky", move |cx| match runs.fetch_add(1, Ordering::Relaxed) {
            0 => {
                let res = cx.continue_with((&unknown, CustomDep::new(5u16)));
                assert!(matches!(res, Err(SchedulerError::UnknownDependency(_))));
            }
            1 => {
                cx.continue_with(&gate).expect("continuation registered");
                assert!(cx.fail());
            }
            _ => {}
        })
    };

    let task = rt.spawn(body, ())?;
    rt.run_until_idle(W);
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.wait_bits(), 0);

    // Nothing was linked to `unknown`.
    task.reset_for_reuse()?;
    rt.enqueue(&task, ())?;
    rt.run_until_idle(W);
    assert_eq!(task.status(), TaskStatus::Failed);

    // Failed while still linked to `gate`.
    assert_eq!(
        task.reset_for_reuse(),
        Err(SchedulerError::UnresolvedDependencies { remaining: 1 })
    );

    rt.enqueue(&gate, ())?;
    rt.run_until_idle(W);
    task.reset_for_reuse()?;
    rt.enqueue(&task, ())?;
    rt.run_until_idle(W);

    assert_eq!(runs.load(Ordering::Relaxed), 3);
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(!rec.ran("unknown"));

    Ok(())
}

#[test]
fn test_wait_times_out() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let never = AsyncTask::new(rec.task("never"));
    let blocked = rt.spawn(rec.task("blocked"), &never)?;

    let err = rt.wait(&[blocked], Duration::from_millis(20)).unwrap_err();
    assert_eq!(err, SchedulerError::Timeout(Duration::from_millis(20)));
    assert!(err.is_retryable());

    Ok(())
}

#[test]
fn test_reset_for_reuse_runs_again() -> Result<()> {
    let rt = manual_runtime();
    let runs = Arc::new(AtomicUsize::new(0));

    let body = {
        let runs = runs.clone();
        task::from_fn(W, "reused", move |_| {
            runs.fetch_add(1, Ordering::Relaxed);
        })
    };

    let task = rt.spawn(body, ())?;
    rt.run_until_idle(W);
    assert_eq!(task.status(), TaskStatus::Completed);

    task.reset_for_reuse()?;
    rt.enqueue(&task, ())?;
    rt.run_until_idle(W);

    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert_eq!(task.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_many_dependents_span_output_chunks() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let root = rt.spawn(rec.task("root").on(M), ())?;
    let dependents = (0..40)
        .map(|_| rt.spawn(rec.task("leaf"), &root))
        .collect::<Result<Vec<_>, _>>()?;

    assert_eq!(rt.run_until_idle(W), 0);
    assert_eq!(rt.run_until_idle(M), 1);
    assert_eq!(rt.run_until_idle(W), 40);

    assert!(dependents.iter().all(|t| t.status() == TaskStatus::Completed));
    assert_eq!(rt.shared.output_pool.assigned_count(), 0);

    Ok(())
}

#[test]
fn test_output_pool_exhaustion() -> Result<()> {
    let rt = Builder::new()
        .worker_threads(0)
        .output_chunk_size(1)
        .output_max_chunks(1)
        .try_build()?;
    let rec = Recorder::new();

    let root = rt.spawn(rec.task("root").on(M), ())?;
    for _ in 0..crate::task::output::OUTPUT_CHUNK_CAPACITY {
        rt.spawn(rec.task("leaf"), &root)?;
    }

    let overflow = AsyncTask::new(rec.task("overflow"));
    assert_eq!(
        rt.enqueue(&overflow, &root),
        Err(SchedulerError::Pool(PoolError::Exhausted))
    );
    assert_eq!(overflow.status(), TaskStatus::Initial);

    Ok(())
}

#[test]
fn test_event_dependency() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let set_early = ManualEvent::new();
    set_early.set();
    let free = rt.spawn(rec.task("free"), CustomDep::new(EventDep(set_early)))?;
    assert!(free.is_ready());

    let event = ManualEvent::new();
    let gated = rt.spawn(
        rec.task("gated").on(M),
        CustomDep::new(EventDep(event.clone())),
    )?;

    // The poller keeps re-arming itself while the event is unset.
    for seed in 0..8 {
        rt.process_task(W, seed);
    }
    assert!(!gated.is_ready());
    assert_eq!(rt.run_until_idle(M), 0);

    event.set();
    for seed in 0..8 {
        rt.process_task(W, seed);
    }

    assert!(gated.is_ready());
    assert_eq!(rt.run_until_idle(M), 1);
    assert!(rec.ran("gated") && rec.ran("free"));

    // Nothing left to poll.
    assert_eq!(rt.run_until_idle(W), 0);

    Ok(())
}

#[test]
fn test_custom_manager() -> Result<()> {
    struct Countdown(Arc<AtomicUsize>);

    // Resolves immediately when the count is zero, cancels otherwise.
    struct CountdownManager;

    impl DependencyManager for CountdownManager {
        fn resolve(
            &self,
            _scheduler: &Scheduler,
            dep: CustomDep,
            task: &AsyncTask,
            bit_index: &mut u32,
        ) -> Result<(), SchedulerError> {
            let count = dep
                .downcast_ref::<Countdown>()
                .map(|c| c.0.load(Ordering::Relaxed))
                .ok_or(SchedulerError::UnknownDependency(dep.type_name()))?;

            let bit = crate::deps::next_wait_bit(bit_index)?;
            crate::deps::set_dependency_completion(task, bit, count != 0);
            Ok(())
        }
    }

    let rt = manual_runtime();
    let rec = Recorder::new();

    assert!(rt.register_dependency_manager::<Countdown>(Arc::new(CountdownManager)));
    assert!(!rt.register_dependency_manager::<Countdown>(Arc::new(CountdownManager)));

    let zero = Arc::new(AtomicUsize::new(0));
    let two = Arc::new(AtomicUsize::new(2));

    let ok = rt.spawn(rec.task("ok"), CustomDep::new(Countdown(zero)))?;
    let doomed = rt.spawn(rec.task("doomed"), CustomDep::new(Countdown(two.clone())))?;

    rt.run_until_idle(W);
    assert_eq!(ok.status(), TaskStatus::Completed);
    assert_eq!(doomed.status(), TaskStatus::Canceled);

    assert!(rt.unregister_dependency_manager::<Countdown>());
    let orphan = AsyncTask::new(rec.task("orphan"));
    assert!(matches!(
        rt.enqueue(&orphan, CustomDep::new(Countdown(two))),
        Err(SchedulerError::UnknownDependency(_))
    ));

    Ok(())
}

#[test]
fn test_main_tasks_wait_for_main_thread() -> Result<()> {
    let rt = threaded_runtime(2);
    let rec = Recorder::new();

    let on_main = rt.spawn(rec.task("main").on(M), ())?;
    let on_worker = rt.spawn(rec.task("worker"), ())?;

    rt.wait(std::slice::from_ref(&on_worker), TIMEOUT)?;
    assert_eq!(on_main.status(), TaskStatus::Pending);

    assert_eq!(rt.run_until_idle(M), 1);
    assert_eq!(on_main.status(), TaskStatus::Completed);

    Ok(())
}

#[test]
fn test_shutdown_cancels_queued_tasks() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    let never = AsyncTask::new(rec.task("never"));
    let blocked = rt.spawn(rec.task("blocked"), &never)?;
    let ready = rt.spawn(rec.task("ready").on(ThreadType::Network), ())?;
    let event = ManualEvent::new();
    let gated = rt.spawn(rec.task("gated"), CustomDep::new(EventDep(event)))?;

    rt.handle().shutdown()?;

    for task in [&blocked, &ready, &gated] {
        assert_eq!(task.status(), TaskStatus::Canceled, "{task:?}");
    }
    assert!(rec.canceled("blocked") && rec.canceled("ready") && rec.canceled("gated"));
    assert_eq!(
        rt.spawn(rec.task("late"), ()).unwrap_err(),
        SchedulerError::Shutdown
    );

    Ok(())
}

#[test]
fn test_queue_stats_count_processed() -> Result<()> {
    let rt = manual_runtime();
    let rec = Recorder::new();

    for _ in 0..5 {
        rt.spawn(rec.task("t").on(ThreadType::Renderer), ())?;
    }
    rt.run_until_idle(ThreadType::Renderer);

    let stats = rt.queue_stats(ThreadType::Renderer);
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.shards, 2);
    assert_eq!(rt.queue_stats(W).processed, 0);

    Ok(())
}

#[test]
fn test_concurrent_diamonds() -> Result<()> {
    const LAYERS: usize = 6;
    const WIDTH: usize = 24;

    let rt = threaded_runtime(4);
    let violations = Arc::new(AtomicUsize::new(0));
    let mut rng = fastrand::Rng::with_seed(0x5eed);

    let mut previous: Vec<AsyncTask> = Vec::new();
    let mut all = Vec::new();

    for _ in 0..LAYERS {
        let mut layer = Vec::with_capacity(WIDTH);

        for _ in 0..WIDTH {
            let preds = if previous.is_empty() {
                Vec::new()
            } else {
                (0..rng.usize(1..=4))
                    .map(|_| previous[rng.usize(..previous.len())].clone())
                    .collect::<Vec<_>>()
            };

            let body = {
                let preds = preds.clone();
                let violations = violations.clone();
                task::from_fn(W, "node", move |_| {
                    if !preds.iter().all(AsyncTask::is_finished) {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                })
            };

            layer.push(rt.spawn(body, StrongDeps(preds))?);
        }

        all.extend(layer.iter().cloned());
        previous = layer;
    }

    rt.wait(&all, TIMEOUT)?;

    assert_eq!(violations.load(Ordering::Relaxed), 0);
    assert!(all.iter().all(|t| t.status() == TaskStatus::Completed));

    Ok(())
}
