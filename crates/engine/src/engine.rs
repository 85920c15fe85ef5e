use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use runtime_core::{
    LanguageProvider, SharedReader, SharedWriter, shared_reader, shared_writer,
};

use crate::cancel::CancelHandler;
use crate::config::{EngineConfig, split_option_key};
use crate::context::{Context, ContextConfig, generate_name};
use crate::error::EngineError;
use crate::instrument::Instrument;
use crate::language::{LanguageRegistry, verify_id};
use crate::profile::Profile;

static ENGINE_IDS: AtomicU64 = AtomicU64::new(1);
static ENGINE_PROFILE: OnceLock<Profile<Engine>> = OnceLock::new();

/// Options configurable under the `engine.` prefix.
const ENGINE_OPTIONS: [&str; 3] = [
    "close_poll_interval_ms",
    "allow_create_thread",
    "allow_inner_contexts",
];

/// Process-wide profile answering which engine the calling thread is in.
pub fn engine_profile() -> &'static Profile<Engine> {
    ENGINE_PROFILE.get_or_init(|| Profile::new("engine"))
}

struct EngineState {
    // Strong until each context closes; `after_close` and `ensure_closed`
    // break the context-engine cycle.
    contexts: Vec<Arc<Context>>,
    pre_initialized: Option<Arc<Context>>,
}

pub struct Engine {
    id: u64,
    name: String,
    config: EngineConfig,
    languages: LanguageRegistry,
    instruments: Vec<Arc<dyn Instrument>>,
    bound: bool,
    closed: AtomicBool,
    single_thread: AtomicBool,
    state: Mutex<EngineState>,
    close_lock: Mutex<()>,
    cancel_handler: OnceLock<CancelHandler>,
    context_profile: Profile<Context>,
    out: SharedWriter,
    err: SharedWriter,
    input: SharedReader,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The engine of the context entered on the calling thread.
    pub fn current() -> Option<Arc<Engine>> {
        engine_profile().get()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// False once any context of this engine went multi-threaded.
    pub fn is_single_thread(&self) -> bool {
        self.single_thread.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate_single_thread(&self) {
        self.single_thread.store(false, Ordering::Release);
    }

    pub fn language_ids(&self) -> Vec<String> {
        self.languages.public_ids()
    }

    pub(crate) fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    pub(crate) fn instruments(&self) -> &[Arc<dyn Instrument>] {
        &self.instruments
    }

    pub fn context_profile(&self) -> &Profile<Context> {
        &self.context_profile
    }

    pub(crate) fn allows_inner_contexts(&self) -> bool {
        self.config.engine.allow_inner_contexts
    }

    pub(crate) fn default_streams(&self) -> (SharedWriter, SharedWriter, SharedReader) {
        (
            Arc::clone(&self.out),
            Arc::clone(&self.err),
            Arc::clone(&self.input),
        )
    }

    pub fn cancel_handler(&self) -> &CancelHandler {
        self.cancel_handler.get_or_init(CancelHandler::new)
    }

    pub fn check_state(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::illegal_state("Engine is already closed."));
        }
        Ok(())
    }

    /// Context options may only address languages and instruments.
    pub(crate) fn validate_context_option(&self, key: &str) -> Result<(), EngineError> {
        let Some((group, name)) = split_option_key(key) else {
            return Err(unknown_option(key));
        };
        if group == "engine" {
            return Err(EngineError::invalid_argument(format!(
                "Option {} is an engine option. Engine level options can only be configured on the engine.",
                key
            )));
        }
        validate_group_option(&self.languages, &self.instruments, key, group, name)
    }

    // ========== Contexts ==========

    pub fn create_context(self: &Arc<Self>, config: ContextConfig) -> Result<Arc<Context>, EngineError> {
        self.check_state()?;
        if self.bound && !self.live_contexts().is_empty() {
            return Err(bound_engine_error());
        }

        let context = match self.take_pre_initialized(&config)? {
            Some(context) => context,
            None => Context::new(self, None, config)?,
        };

        {
            let mut state = self.state.lock();
            if self.is_closed() || (self.bound && !state.contexts.is_empty()) {
                drop(state);
                context.discard();
                self.check_state()?;
                return Err(bound_engine_error());
            }
            state.contexts.push(Arc::clone(&context));
        }

        tracing::info!("Context {} created on engine {}", context.name(), self.name);
        for instrument in &self.instruments {
            instrument.on_context_created(&context);
        }
        Ok(context)
    }

    fn take_pre_initialized(
        self: &Arc<Self>,
        config: &ContextConfig,
    ) -> Result<Option<Arc<Context>>, EngineError> {
        let Some(context) = self.state.lock().pre_initialized.take() else {
            return Ok(None);
        };
        match context.patch(config.clone()) {
            Ok(true) => {
                tracing::debug!("Reusing pre-initialized context {}", context.name());
                Ok(Some(context))
            }
            Ok(false) => {
                context.discard();
                Ok(None)
            }
            Err(err) => {
                self.state.lock().pre_initialized.get_or_insert(context);
                Err(err)
            }
        }
    }

    pub(crate) fn remove_context(&self, context: &Context) {
        let target: *const Context = context;
        self.state
            .lock()
            .contexts
            .retain(|existing| !std::ptr::eq(Arc::as_ptr(existing), target));
    }

    /// Contexts created by this engine that are still open.
    pub fn live_contexts(&self) -> Vec<Arc<Context>> {
        self.state
            .lock()
            .contexts
            .iter()
            .filter(|context| !context.is_closed())
            .cloned()
            .collect()
    }

    /// Initializes `languages` in a context that is kept aside and handed
    /// to the next [`Engine::create_context`] if every language accepts the
    /// embedder's configuration.
    pub fn pre_initialize(self: &Arc<Self>, languages: &[&str]) -> Result<(), EngineError> {
        self.check_state()?;
        let context = Context::new(self, None, ContextConfig::default())?;
        if let Err(err) = context.pre_initialize(languages) {
            context.discard();
            return Err(err);
        }

        let replaced = self.state.lock().pre_initialized.replace(context);
        if let Some(replaced) = replaced {
            replaced.discard();
        }
        tracing::debug!("Engine {} pre-initialized {:?}", self.name, languages);
        Ok(())
    }

    // ========== Shutdown ==========

    pub fn close(&self, cancel_if_executing: bool) -> Result<(), EngineError> {
        self.ensure_closed(cancel_if_executing, false)
    }

    /// Closes every context and then the engine itself.
    ///
    /// Contexts are closed without holding the engine state lock.
    /// With `ignore_close_failure`, contexts that fail to close are logged
    /// and the engine is closed regardless.
    pub fn ensure_closed(
        &self,
        cancel_if_executing: bool,
        ignore_close_failure: bool,
    ) -> Result<(), EngineError> {
        let _closing = self.close_lock.lock();
        if self.is_closed() {
            return Ok(());
        }

        let mut contexts = self.live_contexts();
        if let Some(pre_initialized) = self.state.lock().pre_initialized.take() {
            contexts.push(pre_initialized);
        }

        let me = runtime_core::ThreadHandle::current_key();
        if !cancel_if_executing && !ignore_close_failure {
            for context in &contexts {
                if context.has_foreign_activity(me) {
                    return Err(executing_error());
                }
            }
        }

        let mut failure = None;
        let mut pending = false;
        for context in &contexts {
            match context.close_impl(cancel_if_executing, cancel_if_executing) {
                Ok(true) => {}
                Ok(false) => pending = true,
                Err(err) if ignore_close_failure => {
                    tracing::warn!("Failed to close context {}: {}", context.name(), err);
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if cancel_if_executing {
            self.cancel_handler().wait_for_closing(&contexts)?;
            pending = false;
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if pending && !ignore_close_failure {
            return Err(executing_error());
        }

        self.state.lock().contexts.clear();
        self.closed.store(true, Ordering::SeqCst);
        let entered_here = Engine::current().is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), self));
        if !entered_here {
            engine_profile().clear(self);
        }
        for instrument in &self.instruments {
            instrument.on_engine_closed(self);
        }
        tracing::info!("Engine {} closed", self.name);
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("bound", &self.bound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn bound_engine_error() -> EngineError {
    EngineError::invalid_argument(
        "Automatically created engines cannot be used to create more than one context. \
         Use an explicitly created engine to share one engine between multiple contexts.",
    )
}

fn executing_error() -> EngineError {
    EngineError::illegal_state(
        "One of the context instances is currently executing. \
         Set cancel_if_executing to true to stop the execution on this thread.",
    )
}

fn unknown_option(key: &str) -> EngineError {
    EngineError::invalid_argument(format!("Could not find option with name {}.", key))
}

fn validate_group_option(
    languages: &LanguageRegistry,
    instruments: &[Arc<dyn Instrument>],
    key: &str,
    group: &str,
    name: &str,
) -> Result<(), EngineError> {
    if let Some(language) = languages.get(group) {
        if language.accepts_option(name) {
            return Ok(());
        }
        return Err(unknown_option(key));
    }
    if let Some(instrument) = instruments.iter().find(|instrument| instrument.id() == group) {
        if instrument.options().contains(&name) {
            return Ok(());
        }
    }
    Err(unknown_option(key))
}

// ========== Builder ==========

pub struct EngineBuilder {
    config: EngineConfig,
    languages: Vec<Arc<dyn LanguageProvider>>,
    instruments: Vec<Arc<dyn Instrument>>,
    bound: bool,
    out: Option<SharedWriter>,
    err: Option<SharedWriter>,
    input: Option<SharedReader>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            languages: Vec::new(),
            instruments: Vec::new(),
            bound: false,
            out: None,
            err: None,
            input: None,
        }
    }

    /// Starts from the config file found by [`EngineConfig::load`] with
    /// `POLYGLOT_*` environment overrides applied.
    pub fn from_env() -> Self {
        let config =
            EngineConfig::load().with_env_overrides(&|key: &str| std::env::var(key).ok());
        Self::new().with_config(config)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_language<L: LanguageProvider + 'static>(mut self, language: L) -> Self {
        self.languages.push(Arc::new(language));
        self
    }

    pub fn with_language_arc(mut self, language: Arc<dyn LanguageProvider>) -> Self {
        self.languages.push(language);
        self
    }

    pub fn with_instrument<I: Instrument + 'static>(mut self, instrument: I) -> Self {
        self.instruments.push(Arc::new(instrument));
        self
    }

    pub fn with_instrument_arc(mut self, instrument: Arc<dyn Instrument>) -> Self {
        self.instruments.push(instrument);
        self
    }

    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.config.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn out(mut self, out: SharedWriter) -> Self {
        self.out = Some(out);
        self
    }

    pub fn err(mut self, err: SharedWriter) -> Self {
        self.err = Some(err);
        self
    }

    pub fn input(mut self, input: SharedReader) -> Self {
        self.input = Some(input);
        self
    }

    pub fn build(self) -> Result<Arc<Engine>, EngineError> {
        let languages = LanguageRegistry::new(self.languages)?;

        let mut instrument_ids = Vec::new();
        for instrument in &self.instruments {
            let id = instrument.id();
            verify_id("instrument", id)?;
            if languages.get(id).is_some() || instrument_ids.contains(&id) {
                return Err(EngineError::invalid_argument(format!(
                    "Duplicate instrument id '{}'.",
                    id
                )));
            }
            instrument_ids.push(id);
        }

        let mut config = self.config;
        apply_engine_options(&mut config, &languages, &self.instruments)?;

        let engine = Arc::new(Engine {
            id: ENGINE_IDS.fetch_add(1, Ordering::Relaxed),
            name: generate_name("engine"),
            config,
            languages,
            instruments: self.instruments,
            bound: self.bound,
            closed: AtomicBool::new(false),
            single_thread: AtomicBool::new(true),
            state: Mutex::new(EngineState {
                contexts: Vec::new(),
                pre_initialized: None,
            }),
            close_lock: Mutex::new(()),
            cancel_handler: OnceLock::new(),
            context_profile: Profile::new("context"),
            out: self.out.unwrap_or_else(|| shared_writer(std::io::stdout())),
            err: self.err.unwrap_or_else(|| shared_writer(std::io::stderr())),
            input: self.input.unwrap_or_else(|| shared_reader(std::io::stdin())),
        });

        tracing::debug!(
            "Engine {} built with languages {:?}",
            engine.name,
            engine.language_ids()
        );
        Ok(engine)
    }

    /// Builds an engine bound to a single context and creates that context.
    /// Closing the context closes the engine.
    pub fn create_context(mut self, config: ContextConfig) -> Result<Arc<Context>, EngineError> {
        self.bound = true;
        self.build()?.create_context(config)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_engine_options(
    config: &mut EngineConfig,
    languages: &LanguageRegistry,
    instruments: &[Arc<dyn Instrument>],
) -> Result<(), EngineError> {
    let options: BTreeMap<String, String> = config.options.clone();
    for (key, value) in &options {
        let Some((group, name)) = split_option_key(key) else {
            return Err(unknown_option(key));
        };
        if group != "engine" {
            validate_group_option(languages, instruments, key, group, name)?;
            continue;
        }
        if !ENGINE_OPTIONS.contains(&name) {
            return Err(unknown_option(key));
        }
        let invalid = || {
            EngineError::invalid_argument(format!("Invalid value '{}' for option {}.", value, key))
        };
        match name {
            "close_poll_interval_ms" => {
                config.engine.close_poll_interval_ms = value.parse().map_err(|_| invalid())?;
            }
            "allow_create_thread" => {
                config.engine.allow_create_thread = value.parse().map_err(|_| invalid())?;
            }
            _ => {
                config.engine.allow_inner_contexts = value.parse().map_err(|_| invalid())?;
            }
        }
    }
    Ok(())
}
