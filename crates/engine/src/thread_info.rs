use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use runtime_core::{ThreadHandle, ThreadKey};

use crate::context::PreviousContext;

/// Bookkeeping for one thread that has entered one context.
pub struct ThreadInfo {
    handle: Arc<ThreadHandle>,
    depth: AtomicUsize,
    cancelled: AtomicBool,
    polyglot: bool,
    explicit: Mutex<Vec<PreviousContext>>,
}

impl ThreadInfo {
    pub(crate) fn new(handle: Arc<ThreadHandle>, polyglot: bool) -> Self {
        Self {
            handle,
            depth: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            polyglot,
            explicit: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> &Arc<ThreadHandle> {
        &self.handle
    }

    pub fn key(&self) -> ThreadKey {
        self.handle.key()
    }

    pub fn is_current(&self) -> bool {
        self.handle.is_current()
    }

    /// Runtime-managed worker, as opposed to a thread supplied by the embedder.
    pub fn is_polyglot(&self) -> bool {
        self.polyglot
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    pub(crate) fn enter(&self) -> usize {
        self.depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn leave(&self) -> usize {
        let previous = self.depth.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "thread left a context it never entered");
        previous.saturating_sub(1)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::SeqCst);
    }

    pub(crate) fn push_explicit(&self, previous: PreviousContext) {
        self.explicit.lock().push(previous);
    }

    pub(crate) fn pop_explicit(&self) -> Option<PreviousContext> {
        self.explicit.lock().pop()
    }

    pub fn explicit_depth(&self) -> usize {
        self.explicit.lock().len()
    }
}

impl fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("thread", &self.handle.to_string())
            .field("depth", &self.depth())
            .field("cancelled", &self.is_cancelled())
            .field("polyglot", &self.polyglot)
            .finish()
    }
}
