//! Forced cancellation of executing contexts.
//!
//! While at least one handler is enabled anywhere in the process, guest
//! execution layers are expected to call [`safepoint`] at their execution
//! boundaries. It fails with [`EngineError::Cancelled`] when the context
//! entered on the calling thread is being cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::context::Context;
use crate::error::EngineError;

static ACTIVE_LISTENERS: AtomicUsize = AtomicUsize::new(0);

pub struct CancelHandler {
    users: Mutex<usize>,
}

impl CancelHandler {
    pub(crate) fn new() -> Self {
        Self {
            users: Mutex::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        *self.users.lock() > 0
    }

    fn enable(&self) {
        let mut users = self.users.lock();
        if *users == 0 {
            ACTIVE_LISTENERS.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Cancellation listener attached");
        }
        *users += 1;
    }

    fn disable(&self) {
        let mut users = self.users.lock();
        if *users == 0 {
            return;
        }
        *users -= 1;
        if *users == 0 {
            ACTIVE_LISTENERS.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("Cancellation listener detached");
        }
    }

    /// Blocks until every cancelling context in `contexts` is closed.
    pub fn wait_for_closing(&self, contexts: &[Arc<Context>]) -> Result<(), EngineError> {
        if !contexts.iter().any(|context| context.is_cancelling()) {
            return Ok(());
        }

        self.enable();
        for context in contexts {
            context.send_interrupt();
        }
        let result = contexts
            .iter()
            .try_for_each(|context| context.wait_for_close());
        self.disable();
        result
    }
}

/// Execution boundary check for guest code.
pub fn safepoint() -> Result<(), EngineError> {
    if ACTIVE_LISTENERS.load(Ordering::SeqCst) == 0 {
        return Ok(());
    }
    match Context::current() {
        Some(context) if context.should_cancel_current_thread() => Err(EngineError::Cancelled),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_and_disable_are_reference_counted() {
        let handler = CancelHandler::new();
        handler.enable();
        handler.enable();
        handler.disable();
        assert!(handler.is_enabled());
        handler.disable();
        assert!(!handler.is_enabled());
        handler.disable();
        assert!(!handler.is_enabled());
    }

    #[test]
    fn safepoint_outside_any_context_passes() {
        assert_eq!(safepoint(), Ok(()));
    }
}
