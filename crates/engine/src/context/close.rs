use std::sync::Arc;
use std::sync::atomic::Ordering;

use runtime_core::{ThreadHandle, ThreadKey};

use super::Context;
use crate::error::EngineError;
use crate::thread_info::ThreadInfo;

enum CloseOutcome {
    Closed {
        disposed: Vec<usize>,
        failure: Option<EngineError>,
    },
    // A child still has threads executing.
    Pending,
}

impl Context {
    /// Closes the context and every inner context it owns.
    ///
    /// Without `cancel_if_executing`, fails when another thread is executing
    /// in the context. With it, those threads are cancelled and the call
    /// blocks until they have left.
    pub fn close(self: &Arc<Self>, cancel_if_executing: bool) -> Result<bool, EngineError> {
        let completed = self.close_impl(cancel_if_executing, cancel_if_executing)?;
        if self.is_cancelling() {
            self.engine
                .cancel_handler()
                .wait_for_closing(std::slice::from_ref(self))?;
        } else if !completed {
            return Err(EngineError::illegal_state(
                "The context is currently executing on another thread. \
                 Set cancel_if_executing to true to stop the execution on this thread.",
            ));
        }

        if self.engine.is_bound() && self.parent.is_none() {
            self.engine.ensure_closed(cancel_if_executing, false)?;
        }
        Ok(true)
    }

    /// Closes a context nobody else has seen yet. Failures are logged since
    /// there is no caller left to report them to.
    pub(crate) fn discard(self: &Arc<Self>) {
        match self.close_impl(false, false) {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Context {} was still active when discarded", self.name()),
            Err(err) => tracing::warn!("Failed to close context {}: {}", self.name(), err),
        }
    }

    /// One close attempt. Returns false when other threads are still active.
    pub(crate) fn close_impl(
        self: &Arc<Self>,
        cancel_if_executing: bool,
        wait_for_polyglot_threads: bool,
    ) -> Result<bool, EngineError> {
        let me = ThreadHandle::current_key();
        let poll = self.engine.config().close_poll_interval();
        {
            let mut state = self.state.lock();
            loop {
                if self.is_closed() {
                    return Ok(true);
                }
                match state.closing_thread {
                    Some(owner) if owner == me => return Ok(true),
                    Some(_) => {
                        self.state_changed.wait_for(&mut state, poll);
                    }
                    None => break,
                }
            }

            let current = state.thread_info(me);
            if current.as_ref().is_some_and(|info| info.explicit_depth() > 0) {
                return Err(EngineError::illegal_state(
                    "The context is explicitly entered on the current thread. \
                     Call leave() before closing the context to resolve this.",
                ));
            }
            self.set_cached_thread(None);

            let children = state.children.clone();
            if cancel_if_executing {
                self.cancelling.store(true, Ordering::SeqCst);
                if let Some(info) = &current {
                    info.set_cancelled(true);
                    info.handle().clear_interrupt();
                }
                for child in &children {
                    child.mark_cancelling();
                }
            }

            let busy = state.has_active_thread_other_than(me)
                || (wait_for_polyglot_threads
                    && children.iter().any(|child| child.has_foreign_activity(me)));
            if busy {
                return Ok(false);
            }

            state.closing_thread = Some(me);
            self.closing_key.store(me, Ordering::SeqCst);
        }

        let outcome = self.run_close(cancel_if_executing, wait_for_polyglot_threads);
        self.finish_close(outcome)
    }

    fn run_close(
        self: &Arc<Self>,
        cancel_if_executing: bool,
        wait_for_polyglot_threads: bool,
    ) -> Result<CloseOutcome, EngineError> {
        let previous = self.enter()?;
        let outcome = self.close_entered(cancel_if_executing, wait_for_polyglot_threads);
        self.leave(previous);
        outcome
    }

    fn close_entered(
        self: &Arc<Self>,
        cancel_if_executing: bool,
        wait_for_polyglot_threads: bool,
    ) -> Result<CloseOutcome, EngineError> {
        let children = self.state.lock().children.clone();
        for child in &children {
            if !child.close_impl(cancel_if_executing, wait_for_polyglot_threads)? {
                return Ok(CloseOutcome::Pending);
            }
        }

        self.finalize_languages()?;
        self.closed.store(true, Ordering::SeqCst);
        let (disposed, failure) = self.dispose_languages();
        Ok(CloseOutcome::Closed { disposed, failure })
    }

    /// Finalizes the most recently created languages first, repeating until
    /// a pass finalizes nothing new.
    fn finalize_languages(&self) -> Result<(), EngineError> {
        loop {
            let order: Vec<usize> = self.creation_order.lock().iter().rev().copied().collect();
            let mut did_work = false;
            for index in order {
                let _language = self.language_lock.lock();
                did_work |= self.slots[index].finalize()?;
            }
            if !did_work {
                return Ok(());
            }
        }
    }

    fn dispose_languages(&self) -> (Vec<usize>, Option<EngineError>) {
        let _language = self.language_lock.lock();
        let mut disposed = Vec::new();
        let mut failure = None;
        for (index, slot) in self.slots.iter().enumerate().rev() {
            match slot.dispose() {
                Ok(true) => disposed.push(index),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("Failed to dispose context {}: {}", self.name, err);
                    failure.get_or_insert(err);
                }
            }
        }
        (disposed, failure)
    }

    fn finish_close(
        self: &Arc<Self>,
        outcome: Result<CloseOutcome, EngineError>,
    ) -> Result<bool, EngineError> {
        let threads: Vec<Arc<ThreadInfo>> = {
            let mut state = self.state.lock();
            let threads = if matches!(outcome, Ok(CloseOutcome::Closed { .. })) {
                state.unregistered = None;
                state.threads.drain().map(|(_, info)| info).collect()
            } else {
                Vec::new()
            };
            if !matches!(outcome, Ok(CloseOutcome::Pending)) {
                self.cancelling.store(false, Ordering::SeqCst);
            }
            self.set_cached_thread(None);
            state.closing_thread = None;
            self.closing_key.store(0, Ordering::SeqCst);
            self.state_changed.notify_all();
            threads
        };

        match outcome {
            Err(err) => Err(err),
            Ok(CloseOutcome::Pending) => Ok(false),
            Ok(CloseOutcome::Closed { disposed, failure }) => {
                self.after_close(&disposed, &threads);
                match failure {
                    Some(err) => Err(err),
                    None => Ok(true),
                }
            }
        }
    }

    fn after_close(&self, disposed: &[usize], threads: &[Arc<ThreadInfo>]) {
        let instruments = self.engine.instruments();
        for index in disposed {
            let language = self.slots[*index].language().id();
            tracing::debug!("Language {} disposed in context {}", language, self.name);
            for instrument in instruments {
                instrument.on_language_context_disposed(self, language);
            }
        }

        match self.parent() {
            Some(parent) => parent.remove_child(self),
            None => self.engine.remove_context(self),
        }
        // A closing thread that is still inside releases its slot on leave.
        let entered_here =
            Context::current().is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), self));
        if !entered_here {
            self.engine.context_profile().clear(self);
        }
        self.bindings.clear();

        for info in threads {
            for instrument in instruments {
                instrument.on_thread_finished(self, info.handle());
            }
        }
        for instrument in instruments {
            instrument.on_context_closed(self);
        }
        tracing::info!("Context {} closed", self.name);
    }

    /// Retries closing until it succeeds, waking up whenever a thread leaves
    /// and at least once per poll interval.
    pub(crate) fn wait_for_close(self: &Arc<Self>) -> Result<(), EngineError> {
        let me = ThreadHandle::current_key();
        let poll = self.engine.config().close_poll_interval();
        loop {
            if self.close_impl(false, true)? {
                return Ok(());
            }
            let mut state = self.state.lock();
            if self.is_closed() {
                return Ok(());
            }
            if state.closing_thread.is_none() && !state.has_active_thread_other_than(me) {
                // A child is still busy; its threads do not signal us.
                drop(state);
                std::thread::sleep(poll.min(std::time::Duration::from_millis(10)));
                continue;
            }
            self.state_changed.wait_for(&mut state, poll);
        }
    }

    /// Interrupts every other thread executing in this cancelling context or
    /// its inner contexts.
    pub fn send_interrupt(&self) {
        let me = ThreadHandle::current_key();
        let children = {
            let state = self.state.lock();
            if !self.is_cancelling() {
                return;
            }
            for info in state.threads.values() {
                if info.key() != me && info.is_active() {
                    info.handle().interrupt();
                }
            }
            state.children.clone()
        };
        for child in children {
            child.send_interrupt();
        }
    }

    fn mark_cancelling(&self) {
        self.cancelling.store(true, Ordering::SeqCst);
        let children = self.state.lock().children.clone();
        for child in children {
            child.mark_cancelling();
        }
    }

    /// Whether a thread other than `me` is executing here or in an inner
    /// context.
    pub(crate) fn has_foreign_activity(&self, me: ThreadKey) -> bool {
        let children = {
            let state = self.state.lock();
            if state.has_active_thread_other_than(me) {
                return true;
            }
            state.children.clone()
        };
        children.iter().any(|child| child.has_foreign_activity(me))
    }
}
