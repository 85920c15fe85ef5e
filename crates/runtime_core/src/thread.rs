//! Process-wide identity and interrupt state for native threads.
//!
//! Rust threads cannot be interrupted the way some guest runtimes expect, so
//! every thread that touches the engine gets a [`ThreadHandle`] carrying a
//! sticky interrupt flag. Interrupting sets the flag and unparks the thread;
//! blocking primitives that care about cancellation park through
//! [`park_interruptibly`] and observe the flag when they wake.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::Thread;
use std::time::{Duration, Instant};

pub type ThreadKey = u64;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Arc<ThreadHandle> = Arc::new(ThreadHandle::for_current_thread());
}

pub struct ThreadHandle {
    key: ThreadKey,
    thread: Thread,
    interrupted: AtomicBool,
}

impl ThreadHandle {
    fn for_current_thread() -> Self {
        Self {
            key: NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed),
            thread: std::thread::current(),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn current() -> Arc<ThreadHandle> {
        CURRENT.with(Arc::clone)
    }

    /// Key of the calling thread. Keys are never reused within a process.
    pub fn current_key() -> ThreadKey {
        CURRENT.with(|handle| handle.key)
    }

    pub fn key(&self) -> ThreadKey {
        self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.thread.name()
    }

    pub fn is_current(&self) -> bool {
        self.key == Self::current_key()
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Returns whether an interrupt was pending and clears it.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread[{},{}]", self.name().unwrap_or("unnamed"), self.key)
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("key", &self.key)
            .field("name", &self.name())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("thread was interrupted")]
pub struct Interrupted;

/// Parks the calling thread until it is interrupted or `timeout` elapses.
///
/// Without a timeout this only returns through an interrupt. A pending
/// interrupt is consumed and reported as `Err(Interrupted)`.
pub fn park_interruptibly(timeout: Option<Duration>) -> Result<(), Interrupted> {
    let handle = ThreadHandle::current();
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        if handle.take_interrupt() {
            return Err(Interrupted);
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                std::thread::park_timeout(deadline - now);
            }
            None => std::thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn keys_are_stable_per_thread_and_distinct_across_threads() {
        let here = ThreadHandle::current_key();
        assert_eq!(here, ThreadHandle::current().key());
        let there = std::thread::spawn(ThreadHandle::current_key)
            .join()
            .expect("join");
        assert_ne!(here, there);
    }

    #[test]
    fn interrupt_wakes_a_parked_thread() {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            tx.send(ThreadHandle::current()).expect("send handle");
            park_interruptibly(None)
        });
        let handle = rx.recv().expect("handle");
        handle.interrupt();
        assert_eq!(worker.join().expect("join"), Err(Interrupted));
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn park_with_timeout_returns_without_interrupt() {
        assert_eq!(park_interruptibly(Some(Duration::from_millis(5))), Ok(()));
    }

    #[test]
    fn pending_interrupt_is_consumed_once() {
        let handle = ThreadHandle::current();
        handle.interrupt();
        assert!(handle.take_interrupt());
        assert!(!handle.take_interrupt());
    }
}
