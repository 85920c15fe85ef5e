mod common;

use std::sync::Arc;

use common::{TestLanguage, context_with, engine_with, is_current};
use engine::{Context, ContextConfig, EngineError, ThreadHandle};

#[test]
fn repeated_enter_on_one_thread_stays_on_the_fast_path() {
    let context = context_with(vec![TestLanguage::new("js")]);

    let warm_up = context.enter().expect("enter");
    context.leave(warm_up);
    let slow_entries = context.slow_path_entries();

    for _ in 0..100_000 {
        let previous = context.enter().expect("enter");
        context.leave(previous);
    }

    assert_eq!(context.slow_path_entries(), slow_entries);
    assert_eq!(context.thread_count(), 1);
    assert!(context.has_thread(ThreadHandle::current_key()));
    assert!(context.is_single_threaded());
}

#[test]
fn nested_enter_restores_the_outer_state() {
    let context = context_with(vec![TestLanguage::new("js")]);
    assert!(Context::current().is_none());

    let outer = context.enter().expect("outer enter");
    let inner = context.enter().expect("inner enter");
    assert!(is_current(&context));
    assert!(context.is_active());

    context.leave(inner);
    assert!(is_current(&context));
    context.leave(outer);

    assert!(Context::current().is_none());
    assert!(!context.is_active());
}

#[test]
fn entering_a_second_context_stacks_and_unwinds() {
    let engine = engine_with(vec![TestLanguage::new("js")]);
    let first = engine.create_context(ContextConfig::new()).expect("first");
    let second = engine.create_context(ContextConfig::new()).expect("second");

    let outer = first.enter().expect("enter first");
    let inner = second.enter().expect("enter second");
    assert!(is_current(&second));
    assert!(inner.context().is_some_and(|previous| Arc::ptr_eq(previous, &first)));

    second.leave(inner);
    assert!(is_current(&first));
    first.leave(outer);
    assert!(Context::current().is_none());
}

#[test]
fn guard_and_exec_leave_on_scope_exit() {
    let context = context_with(vec![TestLanguage::new("js")]);
    {
        let guard = context.enter_guard().expect("guard");
        assert!(is_current(guard.context()));
        assert!(!context.needs_enter());
    }
    assert!(context.needs_enter());

    let name = context
        .exec(|current| {
            assert!(is_current(current));
            Ok(current.name().to_string())
        })
        .expect("exec");
    assert_eq!(name, context.name());
    assert!(Context::current().is_none());
}

#[test]
fn enter_if_needed_skips_an_already_current_context() {
    let context = context_with(vec![TestLanguage::new("js")]);
    let previous = context.enter().expect("enter");

    let nested = context.enter_if_needed().expect("enter if needed");
    assert!(nested.is_none());
    context.leave_if_needed(nested);

    assert!(is_current(&context));
    context.leave(previous);
}

#[test]
fn explicit_enter_is_kept_until_explicit_leave() {
    let context = context_with(vec![TestLanguage::new("js")]);
    context.explicit_enter().expect("explicit enter");
    assert!(is_current(&context));

    let err = context.close(false).expect_err("explicitly entered");
    assert!(matches!(err, EngineError::IllegalState(_)));
    assert!(!context.is_closed());

    context.explicit_leave().expect("explicit leave");
    assert!(Context::current().is_none());
    let err = context.explicit_leave().expect_err("nothing to leave");
    assert!(matches!(err, EngineError::IllegalState(_)));

    assert!(context.close(false).expect("close"));
}

#[test]
fn closed_context_cannot_be_entered() {
    let context = context_with(vec![TestLanguage::new("js")]);
    context.close(false).expect("close");

    let err = context.enter().expect_err("closed");
    assert_eq!(err, EngineError::illegal_state("The Context is already closed."));
}

#[test]
fn contexts_of_a_closed_engine_cannot_be_entered() {
    let engine = engine_with(vec![TestLanguage::new("js")]);
    let context = engine.create_context(ContextConfig::new()).expect("context");
    engine.close(false).expect("close engine");

    assert!(context.is_closed());
    assert!(context.enter().is_err());
}

#[test]
fn closing_from_inside_the_context_allows_the_final_leave() {
    let context = context_with(vec![TestLanguage::new("js")]);
    let previous = context.enter().expect("enter");

    assert!(context.close(false).expect("close"));
    assert!(context.is_closed());

    context.leave(previous);
    assert!(Context::current().is_none());
}
