//! Module-owned state carried between image sets.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Typed key/value store owned by one module slot.
///
/// The only state a module may carry from one image set to the next. It is
/// handed to the module through the `Workspace` on every hook and crosses
/// process boundaries only through `for_worker` / `set_for_worker`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState(Map<String, Value>);

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed read. Returns `None` if the key is absent or holds another type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> serde_json::Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Snapshot to ship to a worker process.
    pub fn for_worker(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Replace the contents with a snapshot received from a worker.
    ///
    /// Anything other than a JSON object clears the state.
    pub fn set_for_worker(&mut self, snapshot: Value) {
        self.0.clear();
        if let Value::Object(map) = snapshot {
            self.0.extend(map);
        }
    }
}

/// Per-slot state the pipeline keeps on behalf of a module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleState {
    pub shared_state: SharedState,
    /// Opaque host-specific data stashed when preparing a batch pipeline.
    pub batch_state: Vec<u8>,
}
