use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use runtime_core::{LanguageContext, LanguageEnv, LanguageProvider, ThreadHandle};

use crate::error::{EngineError, LanguagePhase};

pub const HOST_LANGUAGE_ID: &str = "host";

/// Ids that languages and instruments may not use.
pub(crate) const RESERVED_IDS: [&str; 2] = ["engine", HOST_LANGUAGE_ID];

// ========== Host Language ==========

struct HostLanguage;

struct HostContext;

impl LanguageProvider for HostLanguage {
    fn id(&self) -> &str {
        HOST_LANGUAGE_ID
    }

    fn name(&self) -> &str {
        "Host"
    }

    fn is_internal(&self) -> bool {
        true
    }

    fn create_context(&self, _env: LanguageEnv) -> Result<Box<dyn LanguageContext>, String> {
        Ok(Box::new(HostContext))
    }
}

impl LanguageContext for HostContext {
    fn is_thread_access_allowed(&self, _thread: &ThreadHandle, _single_threaded: bool) -> bool {
        true
    }

    fn patch(&self, _env: &LanguageEnv) -> bool {
        true
    }
}

// ========== Registry ==========

pub struct LanguageEntry {
    index: usize,
    provider: Arc<dyn LanguageProvider>,
}

impl LanguageEntry {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn is_host(&self) -> bool {
        self.index == 0
    }

    pub fn is_internal(&self) -> bool {
        self.provider.is_internal()
    }

    pub fn accepts_option(&self, name: &str) -> bool {
        self.provider.options().contains(&name)
    }

    fn create_context(&self, env: LanguageEnv) -> Result<Box<dyn LanguageContext>, String> {
        self.provider.create_context(env)
    }
}

/// Languages of one engine. Index 0 is always the host language, so every
/// context of the engine shares the same slot layout.
pub(crate) struct LanguageRegistry {
    entries: Vec<Arc<LanguageEntry>>,
    by_id: HashMap<String, usize>,
}

impl LanguageRegistry {
    pub(crate) fn new(providers: Vec<Arc<dyn LanguageProvider>>) -> Result<Self, EngineError> {
        let mut entries: Vec<Arc<LanguageEntry>> = Vec::with_capacity(providers.len() + 1);
        let mut by_id = HashMap::new();

        let host: Arc<dyn LanguageProvider> = Arc::new(HostLanguage);
        for provider in std::iter::once(host).chain(providers) {
            let index = entries.len();
            let id = provider.id().to_string();
            if index > 0 {
                verify_id("language", &id)?;
            }
            if by_id.insert(id.clone(), index).is_some() {
                return Err(EngineError::invalid_argument(format!(
                    "Duplicate language id '{}'.",
                    id
                )));
            }
            entries.push(Arc::new(LanguageEntry { index, provider }));
        }

        Ok(Self { entries, by_id })
    }

    pub(crate) fn entries(&self) -> &[Arc<LanguageEntry>] {
        &self.entries
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Arc<LanguageEntry>> {
        self.by_id.get(id).map(|index| &self.entries[*index])
    }

    pub(crate) fn public_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_internal())
            .map(|entry| entry.id().to_string())
            .collect()
    }
}

pub(crate) fn verify_id(kind: &str, id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::invalid_argument(format!("The {} id must not be empty.", kind)));
    }
    if RESERVED_IDS.contains(&id) {
        return Err(EngineError::invalid_argument(format!(
            "The {} id '{}' is reserved and must not be used.",
            kind, id
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(EngineError::invalid_argument(format!(
            "The {} id '{}' may only contain letters, digits, '_' and '-'.",
            kind, id
        )));
    }
    Ok(())
}

// ========== Per-context Slot ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotPhase {
    Empty,
    Creating,
    Created,
    Initializing,
    Initialized,
    Finalized,
    Disposed,
}

impl SlotPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SlotPhase::Empty,
            1 => SlotPhase::Creating,
            2 => SlotPhase::Created,
            3 => SlotPhase::Initializing,
            4 => SlotPhase::Initialized,
            5 => SlotPhase::Finalized,
            _ => SlotPhase::Disposed,
        }
    }

    fn as_u8(self) -> u8 {
        self as u8
    }
}

/// State of one language inside one context.
///
/// Transitions happen under the owning context's language lock; reads go
/// through the atomic phase and the write-once instance.
pub(crate) struct LanguageSlot {
    language: Arc<LanguageEntry>,
    phase: AtomicU8,
    instance: OnceLock<Arc<dyn LanguageContext>>,
}

impl LanguageSlot {
    pub(crate) fn new(language: Arc<LanguageEntry>) -> Self {
        Self {
            language,
            phase: AtomicU8::new(SlotPhase::Empty.as_u8()),
            instance: OnceLock::new(),
        }
    }

    pub(crate) fn language(&self) -> &Arc<LanguageEntry> {
        &self.language
    }

    pub(crate) fn phase(&self) -> SlotPhase {
        SlotPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SlotPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    pub(crate) fn instance(&self) -> Option<&Arc<dyn LanguageContext>> {
        self.instance.get()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        matches!(self.phase(), SlotPhase::Initialized | SlotPhase::Finalized)
    }

    /// Slots whose thread policy applies to newly admitted threads.
    pub(crate) fn guards_threads(&self) -> Option<&Arc<dyn LanguageContext>> {
        match self.phase() {
            SlotPhase::Initializing | SlotPhase::Initialized | SlotPhase::Finalized => {
                self.instance()
            }
            _ => None,
        }
    }

    fn cyclic_access(&self) -> EngineError {
        EngineError::illegal_state(format!(
            "Cyclic access to language context for language '{}'. \
             The context is currently being created or initialized.",
            self.language.id()
        ))
    }

    /// Creates the language context. The caller holds the language lock.
    pub(crate) fn create(&self, env: LanguageEnv) -> Result<(), EngineError> {
        match self.phase() {
            SlotPhase::Empty => {}
            SlotPhase::Creating => return Err(self.cyclic_access()),
            SlotPhase::Disposed => return Err(self.disposed()),
            _ => return Ok(()),
        }

        self.set_phase(SlotPhase::Creating);
        match self.language.create_context(env) {
            Ok(created) => {
                let created: Arc<dyn LanguageContext> = Arc::from(created);
                // Set once: the phase guard above keeps us from getting here twice.
                let _ = self.instance.set(created);
                self.set_phase(SlotPhase::Created);
                Ok(())
            }
            Err(message) => {
                self.set_phase(SlotPhase::Empty);
                Err(EngineError::guest(self.language.id(), LanguagePhase::Create, message))
            }
        }
    }

    /// Marks the slot as initializing. Returns false when it already is
    /// initialized. The caller holds the language lock.
    pub(crate) fn begin_initialize(&self) -> Result<bool, EngineError> {
        match self.phase() {
            SlotPhase::Created => {
                self.set_phase(SlotPhase::Initializing);
                Ok(true)
            }
            SlotPhase::Initialized | SlotPhase::Finalized => Ok(false),
            SlotPhase::Creating | SlotPhase::Initializing => Err(self.cyclic_access()),
            SlotPhase::Disposed => Err(self.disposed()),
            SlotPhase::Empty => Err(EngineError::illegal_state(format!(
                "Language context for '{}' was not created.",
                self.language.id()
            ))),
        }
    }

    pub(crate) fn abort_initialize(&self) {
        if self.phase() == SlotPhase::Initializing {
            self.set_phase(SlotPhase::Created);
        }
    }

    pub(crate) fn finish_initialize(&self, phase: LanguagePhase) -> Result<(), EngineError> {
        let Some(instance) = self.instance() else {
            self.abort_initialize();
            return Err(self.disposed());
        };
        let result = match phase {
            LanguagePhase::PreInitialize => instance.pre_initialize(),
            _ => instance.initialize(),
        };
        match result {
            Ok(()) => {
                self.set_phase(SlotPhase::Initialized);
                Ok(())
            }
            Err(message) => {
                self.abort_initialize();
                Err(EngineError::guest(self.language.id(), phase, message))
            }
        }
    }

    /// Runs the finalize hook the first time it is called after
    /// initialization. Returns whether the hook ran.
    pub(crate) fn finalize(&self) -> Result<bool, EngineError> {
        if self.phase() != SlotPhase::Initialized {
            return Ok(false);
        }
        self.set_phase(SlotPhase::Finalized);
        match self.instance() {
            Some(instance) => instance.finalize().map(|()| true).map_err(|message| {
                EngineError::guest(self.language.id(), LanguagePhase::Finalize, message)
            }),
            None => Ok(false),
        }
    }

    /// Disposes an initialized slot. Returns whether the dispose hook ran.
    pub(crate) fn dispose(&self) -> Result<bool, EngineError> {
        let phase = self.phase();
        if phase == SlotPhase::Disposed {
            return Ok(false);
        }
        self.set_phase(SlotPhase::Disposed);
        if !matches!(phase, SlotPhase::Initialized | SlotPhase::Finalized) {
            return Ok(false);
        }
        match self.instance() {
            Some(instance) => instance.dispose().map(|()| true).map_err(|message| {
                EngineError::guest(self.language.id(), LanguagePhase::Dispose, message)
            }),
            None => Ok(false),
        }
    }

    fn disposed(&self) -> EngineError {
        EngineError::illegal_state(format!(
            "Language context for '{}' is already disposed.",
            self.language.id()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::{shared_reader, shared_writer};
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        id: &'static str,
        fail_create: bool,
        finalized: Arc<AtomicUsize>,
    }

    struct CountingContext {
        finalized: Arc<AtomicUsize>,
    }

    impl LanguageProvider for Counting {
        fn id(&self) -> &str {
            self.id
        }

        fn create_context(&self, _env: LanguageEnv) -> Result<Box<dyn LanguageContext>, String> {
            if self.fail_create {
                return Err("no memory".to_string());
            }
            Ok(Box::new(CountingContext {
                finalized: Arc::clone(&self.finalized),
            }))
        }
    }

    impl LanguageContext for CountingContext {
        fn finalize(&self) -> Result<(), String> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn provider(id: &'static str, fail_create: bool) -> Arc<dyn LanguageProvider> {
        Arc::new(Counting {
            id,
            fail_create,
            finalized: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn env(language: &str) -> LanguageEnv {
        LanguageEnv {
            context_id: "ctx_test".to_string(),
            language_id: language.to_string(),
            options: HashMap::new(),
            arguments: Vec::new(),
            out: shared_writer(std::io::sink()),
            err: shared_writer(std::io::sink()),
            input: shared_reader(std::io::empty()),
        }
    }

    #[test]
    fn host_language_takes_index_zero() {
        let registry = LanguageRegistry::new(vec![provider("js", false)]).expect("registry");
        assert!(registry.entries()[0].is_host());
        assert_eq!(registry.get("js").map(|entry| entry.index()), Some(1));
        assert_eq!(registry.public_ids(), vec!["js".to_string()]);
    }

    #[test]
    fn duplicate_and_reserved_ids_are_rejected() {
        let duplicate = LanguageRegistry::new(vec![provider("js", false), provider("js", false)]);
        assert!(matches!(duplicate, Err(EngineError::InvalidArgument(_))));
        let reserved = LanguageRegistry::new(vec![provider("engine", false)]);
        assert!(matches!(reserved, Err(EngineError::InvalidArgument(_))));
        let malformed = LanguageRegistry::new(vec![provider("j s", false)]);
        assert!(matches!(malformed, Err(EngineError::InvalidArgument(_))));
    }

    #[test]
    fn failed_creation_rolls_back_to_empty() {
        let registry = LanguageRegistry::new(vec![provider("broken", true)]).expect("registry");
        let slot = LanguageSlot::new(Arc::clone(&registry.entries()[1]));
        let err = slot.create(env("broken")).expect_err("create fails");
        assert!(matches!(err, EngineError::Guest { phase: LanguagePhase::Create, .. }));
        assert_eq!(slot.phase(), SlotPhase::Empty);
        assert!(slot.instance().is_none());
    }

    #[test]
    fn finalize_runs_once_and_dispose_skips_uninitialized_slots() {
        let registry = LanguageRegistry::new(vec![provider("js", false)]).expect("registry");
        let slot = LanguageSlot::new(Arc::clone(&registry.entries()[1]));
        assert_eq!(slot.dispose(), Ok(false));

        let slot = LanguageSlot::new(Arc::clone(&registry.entries()[1]));
        slot.create(env("js")).expect("create");
        assert!(slot.begin_initialize().expect("begin"));
        slot.finish_initialize(LanguagePhase::Initialize).expect("initialize");
        assert!(slot.is_initialized());
        assert_eq!(slot.finalize(), Ok(true));
        assert_eq!(slot.finalize(), Ok(false));
        assert_eq!(slot.dispose(), Ok(true));
        assert_eq!(slot.dispose(), Ok(false));
        assert!(slot.begin_initialize().is_err());
    }

    #[test]
    fn initializing_slot_reports_cyclic_access() {
        let registry = LanguageRegistry::new(vec![provider("js", false)]).expect("registry");
        let slot = LanguageSlot::new(Arc::clone(&registry.entries()[1]));
        slot.create(env("js")).expect("create");
        assert!(slot.begin_initialize().expect("begin"));
        let err = slot.begin_initialize().expect_err("cyclic");
        assert!(err.to_string().contains("Cyclic access"));
        slot.abort_initialize();
        assert_eq!(slot.phase(), SlotPhase::Created);
    }
}
