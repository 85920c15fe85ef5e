//! Execution contexts and the enter/leave protocol.
//!
//! A thread entering a context first tries the fast path: when it is the
//! thread cached as last entered, only its enter depth and the profile slots
//! change. Every other entry goes through the state lock, which admits new
//! threads, checks language thread policies and performs the one-way switch
//! from single- to multi-threaded access.

mod close;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use nanoid::nanoid;
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use runtime_core::{
    LanguageContext, LanguageEnv, SharedReader, SharedWriter, ThreadHandle, ThreadKey,
};
use serde_json::Value;

use crate::bindings::Bindings;
use crate::config::split_option_key;
use crate::engine::{Engine, engine_profile};
use crate::error::{EngineError, LanguagePhase};
use crate::language::{LanguageSlot, SlotPhase};
use crate::thread_info::ThreadInfo;

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

static CONTEXT_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) fn generate_name(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid!(10, &ID_ALPHABET))
}

// ========== Configuration ==========

/// Embedder-supplied settings for a new context.
#[derive(Clone, Default)]
pub struct ContextConfig {
    /// Languages the context may use. Empty means every public language.
    pub allowed_languages: Vec<String>,
    pub options: BTreeMap<String, String>,
    pub arguments: HashMap<String, Vec<String>>,
    pub out: Option<SharedWriter>,
    pub err: Option<SharedWriter>,
    pub input: Option<SharedReader>,
    pub allow_create_thread: Option<bool>,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_language(mut self, id: &str) -> Self {
        self.allowed_languages.push(id.to_string());
        self
    }

    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn arguments(mut self, language: &str, args: &[&str]) -> Self {
        self.arguments.insert(
            language.to_string(),
            args.iter().map(|arg| arg.to_string()).collect(),
        );
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

    pub fn allow_create_thread(mut self, allow: bool) -> Self {
        self.allow_create_thread = Some(allow);
        self
    }
}

/// Resolved settings. Replaced wholesale when a pre-initialized context is
/// handed to an embedder.
pub(crate) struct ContextSettings {
    allowed: Vec<bool>,
    options: BTreeMap<String, String>,
    arguments: HashMap<String, Vec<String>>,
    out: SharedWriter,
    err: SharedWriter,
    input: SharedReader,
    allow_create_thread: bool,
}

impl ContextSettings {
    fn resolve(
        engine: &Engine,
        parent: Option<&Context>,
        config: ContextConfig,
    ) -> Result<Self, EngineError> {
        let entries = engine.languages().entries();
        let inherited = parent.map(|parent| parent.settings());

        let allowed = if config.allowed_languages.is_empty() {
            match &inherited {
                Some(settings) => settings.allowed.clone(),
                None => entries
                    .iter()
                    .map(|entry| entry.is_host() || !entry.is_internal())
                    .collect(),
            }
        } else {
            let mut allowed = vec![false; entries.len()];
            allowed[0] = true;
            for id in &config.allowed_languages {
                let entry = engine.languages().get(id).ok_or_else(|| {
                    EngineError::invalid_argument(format!(
                        "A language with id '{}' is not installed. Installed languages are: {}.",
                        id,
                        engine.languages().public_ids().join(", ")
                    ))
                })?;
                allowed[entry.index()] = true;
            }
            allowed
        };

        for key in config.options.keys() {
            engine.validate_context_option(key)?;
        }

        let (default_out, default_err, default_input) = match &inherited {
            Some(settings) => (
                Arc::clone(&settings.out),
                Arc::clone(&settings.err),
                Arc::clone(&settings.input),
            ),
            None => engine.default_streams(),
        };

        Ok(Self {
            allowed,
            options: config.options,
            arguments: config.arguments,
            out: config.out.unwrap_or(default_out),
            err: config.err.unwrap_or(default_err),
            input: config.input.unwrap_or(default_input),
            allow_create_thread: config
                .allow_create_thread
                .unwrap_or(engine.config().engine.allow_create_thread),
        })
    }
}

// ========== State ==========

pub(crate) struct ContextState {
    pub(crate) threads: HashMap<ThreadKey, Arc<ThreadInfo>>,
    pub(crate) children: Vec<Arc<Context>>,
    pub(crate) closing_thread: Option<ThreadKey>,
    pub(crate) in_pre_initialization: bool,
    // The pre-initializing thread, kept out of `threads`.
    pub(crate) unregistered: Option<Arc<ThreadInfo>>,
}

impl ContextState {
    pub(crate) fn thread_info(&self, key: ThreadKey) -> Option<Arc<ThreadInfo>> {
        self.threads.get(&key).cloned().or_else(|| {
            self.unregistered
                .as_ref()
                .filter(|info| info.key() == key)
                .cloned()
        })
    }

    pub(crate) fn has_active_thread_other_than(&self, key: ThreadKey) -> bool {
        self.threads
            .values()
            .any(|info| info.key() != key && info.is_active())
    }
}

/// What [`Context::enter`] displaced on the calling thread.
pub struct PreviousContext {
    engine: Option<Arc<Engine>>,
    context: Option<Arc<Context>>,
}

impl PreviousContext {
    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }
}

impl fmt::Debug for PreviousContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviousContext")
            .field("engine", &self.engine.as_ref().map(|engine| engine.name().to_string()))
            .field("context", &self.context.as_ref().map(|context| context.name().to_string()))
            .finish()
    }
}

pub struct Context {
    id: u64,
    name: String,
    engine: Arc<Engine>,
    parent: Option<Weak<Context>>,
    settings: RwLock<Arc<ContextSettings>>,
    slots: Vec<LanguageSlot>,
    creation_order: Mutex<Vec<usize>>,
    language_lock: ReentrantMutex<()>,
    pub(crate) state: Mutex<ContextState>,
    pub(crate) state_changed: Condvar,
    cached_thread: RwLock<Option<Arc<ThreadInfo>>>,
    single_threaded: AtomicBool,
    cancelling: AtomicBool,
    closed: AtomicBool,
    closing_key: AtomicU64,
    slow_path_entries: AtomicU64,
    bindings: Bindings,
}

impl Context {
    pub(crate) fn new(
        engine: &Arc<Engine>,
        parent: Option<&Arc<Context>>,
        config: ContextConfig,
    ) -> Result<Arc<Context>, EngineError> {
        let settings = ContextSettings::resolve(engine, parent.map(Arc::as_ref), config)?;
        let slots = engine
            .languages()
            .entries()
            .iter()
            .map(|entry| LanguageSlot::new(Arc::clone(entry)))
            .collect();

        let context = Arc::new(Context {
            id: CONTEXT_IDS.fetch_add(1, Ordering::Relaxed),
            name: generate_name("ctx"),
            engine: Arc::clone(engine),
            parent: parent.map(Arc::downgrade),
            settings: RwLock::new(Arc::new(settings)),
            slots,
            creation_order: Mutex::new(Vec::new()),
            language_lock: ReentrantMutex::new(()),
            state: Mutex::new(ContextState {
                threads: HashMap::new(),
                children: Vec::new(),
                closing_thread: None,
                in_pre_initialization: false,
                unregistered: None,
            }),
            state_changed: Condvar::new(),
            cached_thread: RwLock::new(None),
            single_threaded: AtomicBool::new(true),
            cancelling: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing_key: AtomicU64::new(0),
            slow_path_entries: AtomicU64::new(0),
            bindings: Bindings::default(),
        });

        context.ensure_initialized(0, LanguagePhase::Initialize)?;
        Ok(context)
    }

    /// The context entered on the calling thread, if any.
    pub fn current() -> Option<Arc<Context>> {
        Engine::current()?.context_profile().get()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn parent(&self) -> Option<Arc<Context>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Arc<Context>> {
        self.state.lock().children.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing_key.load(Ordering::SeqCst) != 0
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded.load(Ordering::Acquire)
    }

    /// Number of threads that have entered and not yet finished.
    pub fn thread_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    pub fn has_thread(&self, key: ThreadKey) -> bool {
        self.state.lock().threads.contains_key(&key)
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().threads.values().any(|info| info.is_active())
    }

    /// How many entries went through the locked slow path.
    pub fn slow_path_entries(&self) -> u64 {
        self.slow_path_entries.load(Ordering::Relaxed)
    }

    pub fn out(&self) -> SharedWriter {
        Arc::clone(&self.settings().out)
    }

    pub fn err(&self) -> SharedWriter {
        Arc::clone(&self.settings().err)
    }

    pub fn input(&self) -> SharedReader {
        Arc::clone(&self.settings().input)
    }

    fn settings(&self) -> Arc<ContextSettings> {
        Arc::clone(&self.settings.read())
    }

    pub(crate) fn allows_create_thread(&self) -> bool {
        self.settings().allow_create_thread
    }

    pub(crate) fn check_closed(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::illegal_state("The Context is already closed."));
        }
        Ok(())
    }

    pub(crate) fn should_cancel_current_thread(&self) -> bool {
        self.is_cancelling()
            && self.closing_key.load(Ordering::SeqCst) != ThreadHandle::current_key()
            && self.engine.cancel_handler().is_enabled()
    }

    fn set_cached_thread(&self, info: Option<Arc<ThreadInfo>>) {
        *self.cached_thread.write() = info;
    }

    // ========== Enter / Leave ==========

    pub fn enter(self: &Arc<Self>) -> Result<PreviousContext, EngineError> {
        self.enter_with(false)
    }

    pub(crate) fn enter_polyglot(self: &Arc<Self>) -> Result<PreviousContext, EngineError> {
        self.enter_with(true)
    }

    fn enter_with(self: &Arc<Self>, polyglot: bool) -> Result<PreviousContext, EngineError> {
        {
            let cached = self.cached_thread.read();
            if let Some(info) = cached.as_ref() {
                if info.is_current() {
                    info.enter();
                    drop(cached);
                    return Ok(self.swap_in());
                }
            }
        }
        self.enter_thread_changed(polyglot)
    }

    fn enter_thread_changed(
        self: &Arc<Self>,
        polyglot: bool,
    ) -> Result<PreviousContext, EngineError> {
        self.slow_path_entries.fetch_add(1, Ordering::Relaxed);
        let handle = ThreadHandle::current();
        let me = handle.key();

        let (previous, info, announce) = {
            let mut state = self.state.lock();
            self.engine.check_state()?;
            self.check_closed()?;

            let existing = state.thread_info(me);
            match state.closing_thread {
                Some(owner) if owner != me => {
                    return Err(EngineError::illegal_state(if existing.is_none() {
                        "Can not create new threads in closing context."
                    } else {
                        "The context is currently being closed on another thread."
                    }));
                }
                None if self.is_cancelling() => return Err(EngineError::Cancelled),
                _ => {}
            }

            let new_thread = existing.is_none();
            let info = match existing {
                Some(info) => info,
                None => {
                    self.check_thread_access(&handle, self.is_single_threaded())?;
                    Arc::new(ThreadInfo::new(Arc::clone(&handle), polyglot))
                }
            };

            // Dropping the cache waits out any fast-path enter in flight, so its
            // depth is visible to the activity check below.
            self.set_cached_thread(None);
            let transition = self.is_single_threaded() && state.has_active_thread_other_than(me);
            if transition {
                self.check_all_thread_accesses(&state, &handle)?;
            }

            if new_thread {
                if state.in_pre_initialization {
                    state.unregistered = Some(Arc::clone(&info));
                } else {
                    state.threads.insert(me, Arc::clone(&info));
                }
            }

            info.enter();
            let previous = self.swap_in();

            if transition {
                self.transition_to_multi_threaded();
            }
            if state.closing_thread.is_none() && !self.is_closed() {
                self.set_cached_thread(Some(Arc::clone(&info)));
            }

            (previous, info, new_thread && !state.in_pre_initialization)
        };

        if announce {
            if info.is_polyglot() {
                tracing::debug!("Polyglot thread {} admitted to context {}", info.handle(), self.name);
            } else {
                tracing::debug!("Thread {} admitted to context {}", info.handle(), self.name);
            }
            self.notify_thread_started(&info);
        }
        Ok(previous)
    }

    /// Restores what the matching [`Context::enter`] displaced.
    pub fn leave(self: &Arc<Self>, previous: PreviousContext) {
        debug_assert!(
            Context::current().is_some_and(|current| Arc::ptr_eq(&current, self)),
            "Cannot leave context that is currently not entered. Forgot to enter or leave a context?"
        );
        self.swap_out(previous);

        {
            let cached = self.cached_thread.read();
            if let Some(info) = cached.as_ref() {
                if info.is_current() {
                    info.leave();
                    return;
                }
            }
        }
        self.leave_thread_changed();
    }

    fn leave_thread_changed(&self) {
        let me = ThreadHandle::current_key();
        let state = self.state.lock();
        self.set_cached_thread(None);

        let Some(info) = state.thread_info(me) else {
            // Closing drops every thread record.
            debug_assert!(
                self.is_closed(),
                "thread {} left context {} it never entered",
                me,
                self.name
            );
            return;
        };

        if info.leave() == 0 {
            if self.is_cancelling() {
                info.set_cancelled(true);
                info.handle().clear_interrupt();
            }
            self.state_changed.notify_all();
        }

        if !self.is_closed() && !self.is_cancelling() && state.closing_thread.is_none() {
            self.set_cached_thread(Some(info));
        }
    }

    fn swap_in(self: &Arc<Self>) -> PreviousContext {
        let engine = engine_profile().enter(&self.engine);
        let context = self.engine.context_profile().enter(self);
        PreviousContext { engine, context }
    }

    fn swap_out(&self, previous: PreviousContext) {
        self.engine.context_profile().leave(previous.context);
        engine_profile().leave(previous.engine);
    }

    pub fn needs_enter(self: &Arc<Self>) -> bool {
        !Context::current().is_some_and(|current| Arc::ptr_eq(&current, self))
    }

    pub fn enter_if_needed(self: &Arc<Self>) -> Result<Option<PreviousContext>, EngineError> {
        if self.needs_enter() {
            return self.enter().map(Some);
        }
        self.check_closed()?;
        Ok(None)
    }

    pub fn leave_if_needed(self: &Arc<Self>, previous: Option<PreviousContext>) {
        if let Some(previous) = previous {
            self.leave(previous);
        }
    }

    /// Enters the context until the returned guard is dropped.
    pub fn enter_guard(self: &Arc<Self>) -> Result<ContextGuard, EngineError> {
        let previous = self.enter()?;
        Ok(ContextGuard {
            context: Arc::clone(self),
            previous: Some(previous),
        })
    }

    /// Runs `f` with the context entered on the calling thread.
    pub fn exec<R, F>(self: &Arc<Self>, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&Arc<Context>) -> Result<R, EngineError>,
    {
        let previous = self.enter_if_needed()?;
        let result = f(self);
        self.leave_if_needed(previous);
        result
    }

    /// Enters and keeps the context entered until [`Context::explicit_leave`].
    pub fn explicit_enter(self: &Arc<Self>) -> Result<(), EngineError> {
        let previous = self.enter()?;
        let info = self.state.lock().thread_info(ThreadHandle::current_key());
        match info {
            Some(info) => {
                info.push_explicit(previous);
                Ok(())
            }
            None => {
                self.leave(previous);
                Err(EngineError::illegal_state(
                    "The context has no record of the current thread.",
                ))
            }
        }
    }

    pub fn explicit_leave(self: &Arc<Self>) -> Result<(), EngineError> {
        let info = self.state.lock().thread_info(ThreadHandle::current_key());
        match info.and_then(|info| info.pop_explicit()) {
            Some(previous) => {
                self.leave(previous);
                Ok(())
            }
            None => Err(EngineError::illegal_state(
                "The context is not entered explicitly on the current thread.",
            )),
        }
    }

    // ========== Thread Admission ==========

    fn check_thread_access(
        &self,
        thread: &ThreadHandle,
        single_threaded: bool,
    ) -> Result<(), EngineError> {
        let denied: Vec<String> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let instance = slot.guards_threads()?;
                (!instance.is_thread_access_allowed(thread, single_threaded))
                    .then(|| slot.language().id().to_string())
            })
            .collect();

        if denied.is_empty() {
            return Ok(());
        }
        Err(EngineError::ThreadAccessDenied {
            thread: thread.to_string(),
            single_threaded,
            languages: denied,
        })
    }

    /// Re-checks the entering thread and every known thread under the
    /// multi-threaded policy.
    fn check_all_thread_accesses(
        &self,
        state: &ContextState,
        entering: &ThreadHandle,
    ) -> Result<(), EngineError> {
        let mut denied = Vec::new();
        let mut offender: Option<String> = None;

        for slot in &self.slots {
            let Some(instance) = slot.guards_threads() else {
                continue;
            };
            let refused = std::iter::once(entering)
                .chain(
                    state
                        .threads
                        .values()
                        .filter(|info| info.key() != entering.key())
                        .map(|info| info.handle().as_ref()),
                )
                .find(|thread| !instance.is_thread_access_allowed(thread, false));
            if let Some(thread) = refused {
                offender.get_or_insert_with(|| thread.to_string());
                denied.push(slot.language().id().to_string());
            }
        }

        match offender {
            None => Ok(()),
            Some(thread) => Err(EngineError::ThreadAccessDenied {
                thread,
                single_threaded: false,
                languages: denied,
            }),
        }
    }

    fn transition_to_multi_threaded(&self) {
        for slot in &self.slots {
            if let Some(instance) = slot.guards_threads() {
                instance.initialize_multi_threading();
            }
        }
        self.single_threaded.store(false, Ordering::Release);
        self.engine.invalidate_single_thread();
        tracing::debug!("Context {} switched to multi-threaded access", self.name);
    }

    fn notify_thread_started(&self, info: &ThreadInfo) {
        for slot in &self.slots {
            if let Some(instance) = slot.guards_threads() {
                instance.initialize_thread(info.handle());
            }
        }
        for instrument in self.engine.instruments() {
            instrument.on_thread_started(self, info.handle());
        }
    }

    /// Removes a finished runtime-managed thread from the context and tells
    /// languages and instruments about it. Embedder threads stay registered
    /// until the context closes.
    pub(crate) fn thread_finished(&self, key: ThreadKey) {
        let removed = {
            let mut state = self.state.lock();
            let inactive = state
                .threads
                .get(&key)
                .is_some_and(|info| info.is_polyglot() && !info.is_active());
            let removed = if inactive { state.threads.remove(&key) } else { None };
            if let Some(info) = &removed {
                let cached = self.cached_thread.read().as_ref().map(|cached| cached.key());
                if cached == Some(info.key()) {
                    self.set_cached_thread(None);
                }
                self.state_changed.notify_all();
            }
            removed
        };

        let Some(info) = removed else {
            return;
        };
        for slot in &self.slots {
            if let Some(instance) = slot.guards_threads() {
                instance.dispose_thread(info.handle());
            }
        }
        for instrument in self.engine.instruments() {
            instrument.on_thread_finished(self, info.handle());
        }
        tracing::debug!("Thread {} finished in context {}", info.handle(), self.name);
    }

    // ========== Languages ==========

    fn slot_index(&self, language: &str) -> Result<usize, EngineError> {
        let entry = self.engine.languages().get(language).ok_or_else(|| {
            EngineError::invalid_argument(format!(
                "A language with id '{}' is not installed. Installed languages are: {}.",
                language,
                self.engine.languages().public_ids().join(", ")
            ))
        })?;
        if !self.settings().allowed[entry.index()] {
            return Err(EngineError::illegal_state(format!(
                "Access to language '{}' is not permitted.",
                language
            )));
        }
        Ok(entry.index())
    }

    pub fn is_language_initialized(&self, language: &str) -> bool {
        self.engine
            .languages()
            .get(language)
            .is_some_and(|entry| self.slots[entry.index()].is_initialized())
    }

    /// Initializes `language` if needed. Returns whether this call did it.
    pub fn initialize_language(self: &Arc<Self>, language: &str) -> Result<bool, EngineError> {
        let index = self.slot_index(language)?;
        self.exec(|context| context.ensure_initialized(index, LanguagePhase::Initialize))
    }

    /// The initialized per-context state of `language`.
    pub fn language_context(
        self: &Arc<Self>,
        language: &str,
    ) -> Result<Arc<dyn LanguageContext>, EngineError> {
        self.check_closed()?;
        let index = self.slot_index(language)?;
        let slot = &self.slots[index];
        if slot.is_initialized() {
            if let Some(instance) = slot.instance() {
                return Ok(Arc::clone(instance));
            }
        }
        self.exec(|context| context.ensure_initialized(index, LanguagePhase::Initialize))?;
        slot.instance().cloned().ok_or_else(|| {
            EngineError::illegal_state(format!("Language context for '{}' is unavailable.", language))
        })
    }

    pub(crate) fn ensure_initialized(
        &self,
        index: usize,
        phase: LanguagePhase,
    ) -> Result<bool, EngineError> {
        let slot = &self.slots[index];
        if slot.is_initialized() {
            return Ok(false);
        }

        let _language = self.language_lock.lock();
        self.check_closed()?;
        if slot.is_initialized() {
            return Ok(false);
        }
        if slot.phase() == SlotPhase::Empty {
            slot.create(self.language_env(index))?;
            self.creation_order.lock().push(index);
        }

        let threads: Vec<Arc<ThreadInfo>> = {
            let state = self.state.lock();
            if !slot.begin_initialize()? {
                return Ok(false);
            }
            state.threads.values().cloned().collect()
        };
        let single_threaded = self.is_single_threaded();
        let Some(instance) = slot.instance().cloned() else {
            slot.abort_initialize();
            return Ok(false);
        };

        if let Some(refused) = threads
            .iter()
            .find(|info| !instance.is_thread_access_allowed(info.handle(), single_threaded))
        {
            slot.abort_initialize();
            return Err(EngineError::ThreadAccessDenied {
                thread: refused.handle().to_string(),
                single_threaded,
                languages: vec![slot.language().id().to_string()],
            });
        }

        slot.finish_initialize(phase)?;
        if !self.is_single_threaded() {
            instance.initialize_multi_threading();
        }
        for info in &threads {
            instance.initialize_thread(info.handle());
        }

        tracing::debug!(
            "Language {} initialized in context {}",
            slot.language().id(),
            self.name
        );
        for instrument in self.engine.instruments() {
            instrument.on_language_context_initialized(self, slot.language().id());
        }
        Ok(true)
    }

    fn language_env(&self, index: usize) -> LanguageEnv {
        let settings = self.settings();
        self.language_env_with(index, &settings)
    }

    fn language_env_with(&self, index: usize, settings: &ContextSettings) -> LanguageEnv {
        let language = self.slots[index].language().id();
        let options = settings
            .options
            .iter()
            .chain(self.engine.config().options.iter())
            .filter_map(|(key, value)| {
                let (group, name) = split_option_key(key)?;
                (group == language).then(|| (name.to_string(), value.clone()))
            })
            .fold(HashMap::new(), |mut options, (name, value)| {
                options.entry(name).or_insert(value);
                options
            });

        LanguageEnv {
            context_id: self.name.clone(),
            language_id: language.to_string(),
            options,
            arguments: settings.arguments.get(language).cloned().unwrap_or_default(),
            out: Arc::clone(&settings.out),
            err: Arc::clone(&settings.err),
            input: Arc::clone(&settings.input),
        }
    }

    // ========== Inner Contexts ==========

    /// Creates a child context sharing this context's engine.
    pub fn create_inner(self: &Arc<Self>, config: ContextConfig) -> Result<Arc<Context>, EngineError> {
        self.engine.check_state()?;
        self.check_closed()?;
        if !self.engine.allows_inner_contexts() {
            return Err(EngineError::illegal_state(
                "Creating inner contexts is not allowed by the engine configuration.",
            ));
        }
        if self.is_closing() {
            return Err(EngineError::illegal_state(
                "Adding child context into a closing context.",
            ));
        }

        let child = Context::new(&self.engine, Some(self), config)?;
        {
            let mut state = self.state.lock();
            if state.closing_thread.is_some() || self.is_closed() {
                drop(state);
                child.discard();
                return Err(EngineError::illegal_state(
                    "Adding child context into a closing context.",
                ));
            }
            state.children.push(Arc::clone(&child));
        }

        tracing::debug!("Context {} created inside {}", child.name, self.name);
        for instrument in self.engine.instruments() {
            instrument.on_context_created(&child);
        }
        Ok(child)
    }

    pub(crate) fn remove_child(&self, child: &Context) {
        self.state
            .lock()
            .children
            .retain(|existing| !std::ptr::eq(Arc::as_ptr(existing), child));
    }

    // ========== Symbols ==========

    pub fn export_symbol(&self, name: &str, value: Value) -> Result<(), EngineError> {
        self.check_closed()?;
        self.bindings.put(name, value);
        Ok(())
    }

    pub fn remove_symbol(&self, name: &str) -> Result<Option<Value>, EngineError> {
        self.check_closed()?;
        Ok(self.bindings.remove(name))
    }

    /// Looks `name` up in the context bindings, then in the explicit and
    /// finally the implicit exports of every initialized language.
    pub fn import_symbol(&self, name: &str) -> Result<Option<Value>, EngineError> {
        self.check_closed()?;
        if let Some(value) = self.bindings.get(name) {
            return Ok(Some(value));
        }

        for only_explicit in [true, false] {
            for slot in self.slots.iter().skip(1) {
                if !slot.is_initialized() {
                    continue;
                }
                if let Some(value) = slot
                    .instance()
                    .and_then(|instance| instance.find_exported_symbol(name, only_explicit))
                {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    // ========== Pre-initialization ==========

    pub(crate) fn pre_initialize(self: &Arc<Self>, languages: &[&str]) -> Result<(), EngineError> {
        self.state.lock().in_pre_initialization = true;
        let previous = self.enter()?;
        let result = languages.iter().try_for_each(|language| {
            let index = self.slot_index(language)?;
            self.ensure_initialized(index, LanguagePhase::PreInitialize)
                .map(|_| ())
        });
        self.leave(previous);
        self.reset_thread_affinity();
        result
    }

    /// Forgets the pre-initializing thread so it does not leak into the
    /// context that is handed out later.
    fn reset_thread_affinity(&self) {
        {
            let mut state = self.state.lock();
            state.in_pre_initialization = false;
            state.unregistered = None;
            self.set_cached_thread(None);
        }
        self.engine.context_profile().clear(self);
    }

    /// Offers this pre-initialized context to every initialized language
    /// under the embedder's configuration. Returns false when a language
    /// refuses.
    pub(crate) fn patch(&self, config: ContextConfig) -> Result<bool, EngineError> {
        let settings = ContextSettings::resolve(&self.engine, None, config)?;
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.is_initialized() {
                continue;
            }
            if !settings.allowed[index] {
                return Ok(false);
            }
            let env = self.language_env_with(index, &settings);
            if !slot.instance().is_some_and(|instance| instance.patch(&env)) {
                tracing::debug!(
                    "Language {} refused to patch pre-initialized context {}",
                    slot.language().id(),
                    self.name
                );
                return Ok(false);
            }
        }
        *self.settings.write() = Arc::new(settings);
        Ok(true)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("single_threaded", &self.is_single_threaded())
            .field("cancelling", &self.is_cancelling())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Leaves the context when dropped.
pub struct ContextGuard {
    context: Arc<Context>,
    previous: Option<PreviousContext>,
}

impl ContextGuard {
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.context.leave(previous);
        }
    }
}
