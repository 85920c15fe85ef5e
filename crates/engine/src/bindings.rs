use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde_json::Value;

/// Named values shared between languages.
#[derive(Default)]
pub struct Bindings {
    values: RwLock<HashMap<String, Value>>,
}

static GLOBAL_BINDINGS: OnceLock<Bindings> = OnceLock::new();

/// Process-wide symbol table, independent of any engine.
pub fn global_bindings() -> &'static Bindings {
    GLOBAL_BINDINGS.get_or_init(Bindings::default)
}

impl Bindings {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }

    /// Stores `value` under `name`, returning the value it replaced.
    pub fn put(&self, name: &str, value: Value) -> Option<Value> {
        self.values.write().insert(name.to_string(), value)
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }
}
