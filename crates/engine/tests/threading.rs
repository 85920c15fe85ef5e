mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use common::{
    Counters, RecordingInstrument, TestLanguage, ThreadPolicy, context_with, engine_with, is_current,
};
use engine::{ContextConfig, EngineBuilder, EngineError, ThreadHandle};

#[test]
fn concurrent_threads_switch_the_context_to_multi_threaded() {
    let a = TestLanguage::new("a");
    let b = TestLanguage::new("b");
    let (a_counters, b_counters) = (a.counters(), b.counters());
    let context = context_with(vec![a, b]);

    let previous = context.enter().expect("enter");
    context.initialize_language("a").expect("init a");
    context.initialize_language("b").expect("init b");
    assert!(context.is_single_threaded());

    let remote = Arc::clone(&context);
    let worker = thread::spawn(move || {
        let previous = remote.enter()?;
        let single = remote.is_single_threaded();
        remote.leave(previous);
        Ok::<_, EngineError>(single)
    });
    let single_inside_worker = worker.join().expect("join").expect("worker enter");

    assert!(!single_inside_worker);
    assert!(!context.is_single_threaded());
    assert!(!context.engine().is_single_thread());
    assert_eq!(Counters::get(&a_counters.multi_threading), 1);
    assert_eq!(Counters::get(&b_counters.multi_threading), 1);
    assert_eq!(context.thread_count(), 2);

    context.leave(previous);
}

#[test]
fn overlapping_threads_always_observe_multi_threaded_mode() {
    let engine = engine_with(vec![TestLanguage::new("js")]);
    let violations = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
        let context = engine.create_context(ContextConfig::new()).expect("context");
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let workers: Vec<_> = (0..2)
            .map(|index| {
                let context = Arc::clone(&context);
                let inside = Arc::clone(&inside);
                let barrier = Arc::clone(&barrier);
                let violations = Arc::clone(&violations);
                thread::spawn(move || {
                    if index == 0 {
                        // Leaves this thread cached for the fast path.
                        let previous = context.enter().expect("prime");
                        context.leave(previous);
                    }
                    barrier.wait();
                    for _ in 0..50 {
                        let previous = context.enter().expect("enter");
                        if inside.fetch_add(1, Ordering::SeqCst) == 1 && context.is_single_threaded() {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        inside.fetch_sub(1, Ordering::SeqCst);
                        context.leave(previous);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
        context.close(false).expect("close");
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn creator_only_language_rejects_a_second_thread() {
    let x = TestLanguage::new("x").policy(ThreadPolicy::CreatorOnly);
    let context = context_with(vec![x]);
    context.initialize_language("x").expect("init x");
    assert_eq!(context.thread_count(), 1);

    let remote = Arc::clone(&context);
    let result = thread::spawn(move || remote.enter().map(|previous| remote.leave(previous)))
        .join()
        .expect("join");

    match result {
        Err(EngineError::ThreadAccessDenied {
            single_threaded,
            languages,
            ..
        }) => {
            assert!(single_threaded);
            assert_eq!(languages, vec!["x".to_string()]);
        }
        other => panic!("expected access denial, got {:?}", other),
    }
    assert_eq!(context.thread_count(), 1);
}

#[test]
fn refused_transition_leaves_no_trace() {
    let shared = TestLanguage::new("shared");
    let local = TestLanguage::new("local").policy(ThreadPolicy::SingleThreadedOnly);
    let local_counters = local.counters();
    let context = context_with(vec![shared, local]);

    let previous = context.enter().expect("enter");
    context.initialize_language("shared").expect("init shared");
    context.initialize_language("local").expect("init local");

    let remote = Arc::clone(&context);
    let (key, result) = thread::spawn(move || {
        let key = ThreadHandle::current_key();
        (key, remote.enter().map(|previous| remote.leave(previous)))
    })
    .join()
    .expect("join");

    match result {
        Err(EngineError::ThreadAccessDenied {
            single_threaded,
            languages,
            ..
        }) => {
            assert!(!single_threaded);
            assert_eq!(languages, vec!["local".to_string()]);
        }
        other => panic!("expected access denial, got {:?}", other),
    }
    assert!(!context.has_thread(key));
    assert!(context.is_single_threaded());
    assert_eq!(Counters::get(&local_counters.multi_threading), 0);

    context.leave(previous);
}

#[test]
fn multi_threaded_mode_is_never_reverted() {
    let context = context_with(vec![TestLanguage::new("js")]);
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let context = Arc::clone(&context);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let previous = context.enter().expect("enter");
                barrier.wait();
                barrier.wait();
                context.leave(previous);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }
    assert!(!context.is_single_threaded());
    assert!(!context.is_active());

    let previous = context.enter().expect("enter again");
    assert!(!context.is_single_threaded());
    context.leave(previous);
    assert!(!context.is_single_threaded());
}

#[test]
fn new_threads_are_announced_to_languages_and_instruments() {
    let js = TestLanguage::new("js");
    let counters = js.counters();
    let recorder = RecordingInstrument::default();
    let engine = EngineBuilder::new()
        .with_language(js)
        .with_instrument(recorder.clone())
        .build()
        .expect("engine");
    let context = engine.create_context(ContextConfig::new()).expect("context");
    context.initialize_language("js").expect("init");

    let remote = Arc::clone(&context);
    thread::spawn(move || {
        let previous = remote.enter().expect("enter");
        remote.leave(previous);
    })
    .join()
    .expect("join");

    // The initializing thread was known before js existed.
    assert_eq!(Counters::get(&counters.threads_initialized), 2);
    assert_eq!(recorder.count("thread_started:"), 2);

    context.close(false).expect("close");
    assert_eq!(recorder.count("thread_finished:"), 2);
}

#[test]
fn polyglot_thread_runs_inside_the_context() {
    let recorder = RecordingInstrument::default();
    let engine = EngineBuilder::new()
        .with_language(TestLanguage::new("js"))
        .with_instrument(recorder.clone())
        .build()
        .expect("engine");
    let context = engine.create_context(ContextConfig::new()).expect("context");

    let (tx, rx) = mpsc::channel();
    let worker = context
        .create_thread(move |current| {
            tx.send((is_current(current), ThreadHandle::current_key()))
                .expect("send");
            Ok(())
        })
        .expect("create thread");
    assert!(worker.name().starts_with("polyglot-"));
    worker.join().expect("body");

    let (was_current, key) = rx.recv().expect("recv");
    assert!(was_current);
    assert!(!context.has_thread(key));
    assert_eq!(recorder.count("thread_started:"), 1);
    assert_eq!(recorder.count("thread_finished:"), 1);
}

#[test]
fn panicking_polyglot_thread_still_leaves_the_context() {
    let recorder = RecordingInstrument::default();
    let engine = EngineBuilder::new()
        .with_language(TestLanguage::new("js"))
        .with_instrument(recorder.clone())
        .build()
        .expect("engine");
    let context = engine.create_context(ContextConfig::new()).expect("context");

    let worker = context
        .create_thread(|_| panic!("guest body failed"))
        .expect("spawn");
    let err = worker.join().expect_err("panicked");
    assert!(matches!(err, EngineError::IllegalState(_)));

    assert!(!context.is_active());
    assert_eq!(context.thread_count(), 0);
    assert_eq!(recorder.count("thread_finished:"), 1);
    assert!(context.close(false).expect("close"));
}

#[test]
fn polyglot_thread_is_refused_by_single_threaded_languages() {
    let local = TestLanguage::new("local").policy(ThreadPolicy::SingleThreadedOnly);
    let context = context_with(vec![local]);
    let previous = context.enter().expect("enter");
    context.initialize_language("local").expect("init");

    let worker = context.create_thread(|_| Ok(())).expect("spawn");
    let err = worker.join().expect_err("denied");
    assert!(matches!(err, EngineError::ThreadAccessDenied { .. }));
    assert!(context.is_single_threaded());

    context.leave(previous);
}

#[test]
fn thread_creation_can_be_disabled() {
    let engine = EngineBuilder::new()
        .option("engine.allow_create_thread", "false")
        .build()
        .expect("engine");
    let context = engine.create_context(ContextConfig::new()).expect("context");
    let err = context.create_thread(|_| Ok(())).expect_err("disabled");
    assert!(matches!(err, EngineError::IllegalState(_)));

    let allowed = engine
        .create_context(ContextConfig::new().allow_create_thread(true))
        .expect("context");
    allowed
        .create_thread(|_| Ok(()))
        .expect("spawn")
        .join()
        .expect("body");
}
