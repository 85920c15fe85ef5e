use runtime_core::ThreadHandle;

use crate::context::Context;
use crate::engine::Engine;

/// Listener for context and thread lifecycle events.
///
/// Callbacks run on the thread that caused the event, outside the context
/// state lock.
pub trait Instrument: Send + Sync {
    fn id(&self) -> &str;

    /// Option names accepted under the `<id>.` prefix.
    fn options(&self) -> &[&str] {
        &[]
    }

    fn on_context_created(&self, _context: &Context) {}

    fn on_language_context_initialized(&self, _context: &Context, _language: &str) {}

    fn on_language_context_disposed(&self, _context: &Context, _language: &str) {}

    fn on_thread_started(&self, _context: &Context, _thread: &ThreadHandle) {}

    fn on_thread_finished(&self, _context: &Context, _thread: &ThreadHandle) {}

    fn on_context_closed(&self, _context: &Context) {}

    fn on_engine_closed(&self, _engine: &Engine) {}
}
