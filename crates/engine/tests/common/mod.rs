#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use engine::{
    Context, ContextConfig, Engine, EngineBuilder, Instrument, LanguageContext, LanguageEnv,
    LanguageProvider, ThreadHandle,
};
use parking_lot::Mutex;
use serde_json::Value;

/// Which threads a test language admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPolicy {
    AllowAll,
    SingleThreadedOnly,
    CreatorOnly,
}

#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub initialized: AtomicUsize,
    pub pre_initialized: AtomicUsize,
    pub patched: AtomicUsize,
    pub finalized: AtomicUsize,
    pub disposed: AtomicUsize,
    pub threads_initialized: AtomicUsize,
    pub threads_disposed: AtomicUsize,
    pub multi_threading: AtomicUsize,
    pub last_mode: Mutex<Option<String>>,
    pub last_arguments: Mutex<Vec<String>>,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct TestLanguage {
    pub id: &'static str,
    pub policy: ThreadPolicy,
    pub counters: Arc<Counters>,
    pub fail_finalize: bool,
    pub fail_dispose: bool,
    pub accept_patch: bool,
    pub exports: Vec<(&'static str, Value, bool)>,
}

impl TestLanguage {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            policy: ThreadPolicy::AllowAll,
            counters: Arc::new(Counters::default()),
            fail_finalize: false,
            fail_dispose: false,
            accept_patch: true,
            exports: Vec::new(),
        }
    }

    pub fn policy(mut self, policy: ThreadPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn fail_finalize(mut self) -> Self {
        self.fail_finalize = true;
        self
    }

    pub fn fail_dispose(mut self) -> Self {
        self.fail_dispose = true;
        self
    }

    pub fn refuse_patch(mut self) -> Self {
        self.accept_patch = false;
        self
    }

    pub fn export(mut self, name: &'static str, value: Value, explicit: bool) -> Self {
        self.exports.push((name, value, explicit));
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }
}

impl LanguageProvider for TestLanguage {
    fn id(&self) -> &str {
        self.id
    }

    fn options(&self) -> &[&str] {
        &["mode"]
    }

    fn create_context(&self, env: LanguageEnv) -> Result<Box<dyn LanguageContext>, String> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_mode.lock() = env.option("mode").map(str::to_string);
        *self.counters.last_arguments.lock() = env.arguments.clone();
        Ok(Box::new(TestLanguageContext {
            language: self.clone(),
            creator: ThreadHandle::current_key(),
        }))
    }
}

pub struct TestLanguageContext {
    language: TestLanguage,
    creator: u64,
}

impl LanguageContext for TestLanguageContext {
    fn initialize(&self) -> Result<(), String> {
        self.language.counters.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pre_initialize(&self) -> Result<(), String> {
        self.language.counters.pre_initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn patch(&self, env: &LanguageEnv) -> bool {
        if !self.language.accept_patch {
            return false;
        }
        self.language.counters.patched.fetch_add(1, Ordering::SeqCst);
        *self.language.counters.last_mode.lock() = env.option("mode").map(str::to_string);
        true
    }

    fn finalize(&self) -> Result<(), String> {
        self.language.counters.finalized.fetch_add(1, Ordering::SeqCst);
        if self.language.fail_finalize {
            return Err("finalizer exploded".to_string());
        }
        Ok(())
    }

    fn dispose(&self) -> Result<(), String> {
        self.language.counters.disposed.fetch_add(1, Ordering::SeqCst);
        if self.language.fail_dispose {
            return Err("dispose exploded".to_string());
        }
        Ok(())
    }

    fn is_thread_access_allowed(&self, thread: &ThreadHandle, single_threaded: bool) -> bool {
        match self.language.policy {
            ThreadPolicy::AllowAll => true,
            ThreadPolicy::SingleThreadedOnly => single_threaded,
            ThreadPolicy::CreatorOnly => thread.key() == self.creator,
        }
    }

    fn initialize_thread(&self, _thread: &ThreadHandle) {
        self.language
            .counters
            .threads_initialized
            .fetch_add(1, Ordering::SeqCst);
    }

    fn dispose_thread(&self, _thread: &ThreadHandle) {
        self.language.counters.threads_disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn initialize_multi_threading(&self) {
        self.language.counters.multi_threading.fetch_add(1, Ordering::SeqCst);
    }

    fn find_exported_symbol(&self, name: &str, only_explicit: bool) -> Option<Value> {
        self.language
            .exports
            .iter()
            .find(|(export, _, explicit)| *export == name && (*explicit || !only_explicit))
            .map(|(_, value, _)| value.clone())
    }
}

/// Records lifecycle events as `"<event>:<detail>"` strings.
#[derive(Clone, Default)]
pub struct RecordingInstrument {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingInstrument {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl Instrument for RecordingInstrument {
    fn id(&self) -> &str {
        "recorder"
    }

    fn options(&self) -> &[&str] {
        &["verbose"]
    }

    fn on_context_created(&self, context: &Context) {
        self.record(format!("context_created:{}", context.name()));
    }

    fn on_language_context_initialized(&self, context: &Context, language: &str) {
        self.record(format!("language_initialized:{}:{}", context.name(), language));
    }

    fn on_language_context_disposed(&self, context: &Context, language: &str) {
        self.record(format!("language_disposed:{}:{}", context.name(), language));
    }

    fn on_thread_started(&self, _context: &Context, thread: &ThreadHandle) {
        self.record(format!("thread_started:{}", thread.key()));
    }

    fn on_thread_finished(&self, _context: &Context, thread: &ThreadHandle) {
        self.record(format!("thread_finished:{}", thread.key()));
    }

    fn on_context_closed(&self, context: &Context) {
        self.record(format!("context_closed:{}", context.name()));
    }

    fn on_engine_closed(&self, engine: &Engine) {
        self.record(format!("engine_closed:{}", engine.name()));
    }
}

/// Engine with a short close poll interval so cancellation tests stay fast.
pub fn engine_with(languages: Vec<TestLanguage>) -> Arc<Engine> {
    languages
        .into_iter()
        .fold(
            EngineBuilder::new().option("engine.close_poll_interval_ms", "10"),
            |builder, language| builder.with_language(language),
        )
        .build()
        .expect("engine")
}

pub fn context_with(languages: Vec<TestLanguage>) -> Arc<Context> {
    engine_with(languages)
        .create_context(ContextConfig::new())
        .expect("context")
}

pub fn is_current(context: &Arc<Context>) -> bool {
    Context::current().is_some_and(|current| Arc::ptr_eq(&current, context))
}
