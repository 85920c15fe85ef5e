use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::thread::ThreadHandle;

pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;
pub type SharedReader = Arc<Mutex<Box<dyn Read + Send>>>;

pub fn shared_writer<W: Write + Send + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

pub fn shared_reader<R: Read + Send + 'static>(reader: R) -> SharedReader {
    Arc::new(Mutex::new(Box::new(reader)))
}

/// A hosted language, registered once per engine.
pub trait LanguageProvider: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    /// Internal languages are only reachable from other languages, never
    /// through a context's default allow-list.
    fn is_internal(&self) -> bool {
        false
    }

    /// Option names accepted under the `<id>.` prefix.
    fn options(&self) -> &[&str] {
        &[]
    }

    fn create_context(&self, env: LanguageEnv) -> Result<Box<dyn LanguageContext>, String>;
}

/// Per-context state of one language.
///
/// Hooks that run under the owning context's state lock (`is_thread_access_allowed`,
/// `initialize_multi_threading`) must not call back into that context.
pub trait LanguageContext: Send + Sync {
    fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    /// Runs guest-visible shutdown work. May initialize other languages.
    fn finalize(&self) -> Result<(), String> {
        Ok(())
    }

    fn dispose(&self) -> Result<(), String> {
        Ok(())
    }

    /// Initialization performed ahead of time, before the context is handed
    /// to an embedder.
    fn pre_initialize(&self) -> Result<(), String> {
        self.initialize()
    }

    /// Adapts a pre-initialized context to the real configuration. Returning
    /// false discards the pre-initialized context.
    fn patch(&self, _env: &LanguageEnv) -> bool {
        false
    }

    fn is_thread_access_allowed(&self, _thread: &ThreadHandle, single_threaded: bool) -> bool {
        single_threaded
    }

    fn initialize_thread(&self, _thread: &ThreadHandle) {}

    fn dispose_thread(&self, _thread: &ThreadHandle) {}

    fn initialize_multi_threading(&self) {}

    /// Legacy symbol lookup. `only_explicit` restricts the search to values
    /// the language exported on purpose, as opposed to its global scope.
    fn find_exported_symbol(&self, _name: &str, _only_explicit: bool) -> Option<Value> {
        None
    }
}

#[derive(Clone)]
pub struct LanguageEnv {
    pub context_id: String,
    pub language_id: String,
    pub options: HashMap<String, String>,
    pub arguments: Vec<String>,
    pub out: SharedWriter,
    pub err: SharedWriter,
    pub input: SharedReader,
}

impl LanguageEnv {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn write_out(&self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }

    pub fn write_err(&self, text: &str) -> io::Result<()> {
        let mut err = self.err.lock();
        err.write_all(text.as_bytes())?;
        err.flush()
    }
}

impl fmt::Debug for LanguageEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageEnv")
            .field("context_id", &self.context_id)
            .field("language_id", &self.language_id)
            .field("options", &self.options)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}
