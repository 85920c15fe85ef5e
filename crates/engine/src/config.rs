use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use runtime_core::env::{env_flag_with, env_parse_with};
use serde::Deserialize;

use crate::error::EngineError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    /// `"<language-or-engine>.<name>" = "value"` pairs.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub close_poll_interval_ms: u64,
    pub allow_create_thread: bool,
    pub allow_inner_contexts: bool,
    pub thread_name_prefix: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            close_poll_interval_ms: 1000,
            allow_create_thread: true,
            allow_inner_contexts: true,
            thread_name_prefix: "polyglot".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads the first config file found, falling back to defaults.
    pub fn load() -> Self {
        let path = match Self::find_config_path() {
            Some(path) => path,
            None => return Self::default(),
        };

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to load {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            EngineError::invalid_argument(format!("Failed to read {}: {}", path.display(), err))
        })?;
        Self::parse(&contents).map_err(|err| {
            EngineError::invalid_argument(format!("Failed to parse {}: {}", path.display(), err))
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides(&|key: &str| std::env::var(key).ok())
    }

    pub fn with_env_overrides<F>(mut self, env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = env_parse_with("POLYGLOT_CLOSE_POLL_MS", env_get) {
            self.engine.close_poll_interval_ms = ms;
        }
        self.engine.allow_create_thread = env_flag_with(
            "POLYGLOT_ALLOW_CREATE_THREAD",
            self.engine.allow_create_thread,
            env_get,
        );
        self.engine.allow_inner_contexts = env_flag_with(
            "POLYGLOT_ALLOW_INNER_CONTEXTS",
            self.engine.allow_inner_contexts,
            env_get,
        );
        self
    }

    pub fn close_poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine.close_poll_interval_ms.max(1))
    }

    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    fn find_config_path() -> Option<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(path) = std::env::var("POLYGLOT_ENGINE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(
                "POLYGLOT_ENGINE_CONFIG set but file not found: {}",
                path.display()
            );
        }

        candidates.push(PathBuf::from("engine.toml"));
        candidates.push(PathBuf::from("polyglot.toml"));

        if let Some(path) = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        {
            candidates.push(path.join("polyglot").join("engine.toml"));
        }

        candidates.push(PathBuf::from("/etc/polyglot/engine.toml"));

        candidates.into_iter().find(|path| path.exists())
    }
}

/// Splits `"<group>.<name>"` option keys.
pub(crate) fn split_option_key(key: &str) -> Option<(&str, &str)> {
    let (group, name) = key.split_once('.')?;
    if group.is_empty() || name.is_empty() {
        return None;
    }
    Some((group, name))
}
