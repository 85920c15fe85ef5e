//! Context and thread management for a multi-language runtime host.
//!
//! An [`Engine`] owns the installed languages and instruments; a [`Context`]
//! is an isolated execution environment inside it that threads enter and
//! leave. Language state is created lazily per context and torn down when the
//! context closes.

pub mod bindings;
pub mod cancel;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod language;
pub mod polyglot_thread;
pub mod profile;
pub mod thread_info;

pub use bindings::{Bindings, global_bindings};
pub use cancel::{CancelHandler, safepoint};
pub use config::{EngineConfig, EngineSection};
pub use context::{Context, ContextConfig, ContextGuard, PreviousContext};
pub use engine::{Engine, EngineBuilder, engine_profile};
pub use error::{EngineError, LanguagePhase, recover};
pub use instrument::Instrument;
pub use language::{HOST_LANGUAGE_ID, LanguageEntry};
pub use polyglot_thread::PolyglotThread;
pub use profile::{Profile, ProfileTier, TierHits};
pub use thread_info::ThreadInfo;

pub use runtime_core::{
    LanguageContext, LanguageEnv, LanguageProvider, ThreadHandle, park_interruptibly,
};
