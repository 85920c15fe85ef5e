//! Worker threads created by guest code through a context.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use runtime_core::ThreadHandle;

use crate::context::{Context, PreviousContext};
use crate::error::EngineError;

static POLYGLOT_THREAD_IDS: AtomicU64 = AtomicU64::new(1);

/// A runtime-managed thread that runs its body inside one context.
pub struct PolyglotThread {
    name: String,
    handle: JoinHandle<Result<(), EngineError>>,
}

impl PolyglotThread {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the thread and returns what its body returned.
    pub fn join(self) -> Result<(), EngineError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(EngineError::illegal_state(format!(
                "Polyglot thread {} panicked.",
                self.name
            ))),
        }
    }
}

impl std::fmt::Debug for PolyglotThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolyglotThread")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Context {
    /// Starts a thread that enters this context, runs `body` and leaves.
    ///
    /// The thread is admitted like any other, so languages that refuse
    /// multi-threaded access make the body fail before it runs.
    pub fn create_thread<F>(self: &Arc<Self>, body: F) -> Result<PolyglotThread, EngineError>
    where
        F: FnOnce(&Arc<Context>) -> Result<(), EngineError> + Send + 'static,
    {
        if !self.allows_create_thread() {
            return Err(EngineError::illegal_state(
                "Creating threads is not allowed. Use allow_create_thread to allow thread creation.",
            ));
        }
        self.check_closed()?;
        if self.is_closing() {
            return Err(EngineError::illegal_state(
                "Can not create new threads in closing context.",
            ));
        }

        let name = format!(
            "{}-{}",
            self.engine().config().engine.thread_name_prefix,
            POLYGLOT_THREAD_IDS.fetch_add(1, Ordering::Relaxed)
        );
        let context = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_polyglot_thread(&context, body))
            .map_err(|err| {
                EngineError::illegal_state(format!("Failed to spawn polyglot thread: {}", err))
            })?;

        Ok(PolyglotThread { name, handle })
    }
}

/// Leaves the context and retires the thread even if the body unwinds.
struct PolyglotScope<'a> {
    context: &'a Arc<Context>,
    previous: Option<PreviousContext>,
}

impl Drop for PolyglotScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.leave(previous);
        }
        self.context.thread_finished(ThreadHandle::current_key());
        if std::thread::panicking() {
            tracing::warn!(
                "Polyglot thread {} panicked in context {}",
                ThreadHandle::current(),
                self.context.name()
            );
        } else {
            tracing::debug!(
                "Polyglot thread {} finished in context {}",
                ThreadHandle::current(),
                self.context.name()
            );
        }
    }
}

fn run_polyglot_thread<F>(context: &Arc<Context>, body: F) -> Result<(), EngineError>
where
    F: FnOnce(&Arc<Context>) -> Result<(), EngineError>,
{
    let _scope = PolyglotScope {
        context,
        previous: Some(context.enter_polyglot()?),
    };
    tracing::debug!(
        "Polyglot thread {} started in context {}",
        ThreadHandle::current(),
        context.name()
    );
    body(context)
}
