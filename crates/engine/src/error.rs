use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguagePhase {
    Create,
    Initialize,
    PreInitialize,
    Finalize,
    Dispose,
}

impl fmt::Display for LanguagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            LanguagePhase::Create => "create",
            LanguagePhase::Initialize => "initialize",
            LanguagePhase::PreInitialize => "pre-initialize",
            LanguagePhase::Finalize => "finalize",
            LanguagePhase::Dispose => "dispose",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    IllegalState(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error(
        "{} threaded access requested by thread {thread} but is not allowed for language(s) {}.",
        if *single_threaded { "Single" } else { "Multi" },
        languages.join(", ")
    )]
    ThreadAccessDenied {
        thread: String,
        single_threaded: bool,
        languages: Vec<String>,
    },

    /// Raised at a safepoint of a context that is being cancelled. Never hand
    /// this to a guest-level error handler; see [`recover`].
    #[error("Execution got cancelled.")]
    Cancelled,

    #[error("Language '{language}' failed to {phase}: {message}")]
    Guest {
        language: String,
        phase: LanguagePhase,
        message: String,
    },
}

impl EngineError {
    pub fn illegal_state(message: impl Into<String>) -> Self {
        EngineError::IllegalState(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument(message.into())
    }

    pub fn guest(language: &str, phase: LanguagePhase, message: String) -> Self {
        EngineError::Guest {
            language: language.to_string(),
            phase,
            message,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Handles a failed result with `handler`, except for cancellation which is
/// passed through untouched.
pub fn recover<T, F>(result: Result<T, EngineError>, handler: F) -> Result<T, EngineError>
where
    F: FnOnce(EngineError) -> Result<T, EngineError>,
{
    match result {
        Err(err) if err.is_cancelled() => Err(err),
        Err(err) => handler(err),
        ok => ok,
    }
}
