//! State store trait and the in-memory backend

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

use super::{merge_json, state_key, RunState};
use crate::error::{Error, Result};

/// Persistence of [`RunState`]s
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stored state of a task, `None` when it never ran
    async fn load(&self, name: &str, task_type: &str) -> Result<Option<RunState>>;

    /// Merge-write: set fields overwrite, unset fields and absent custom
    /// keys keep their stored values, `suspended` is left alone
    async fn save(&self, state: &RunState) -> Result<()>;

    /// Update only the suspended flag, creating the entry when needed
    async fn set_suspended(&self, name: &str, task_type: &str, suspended: bool) -> Result<()>;

    /// Every stored state
    async fn list(&self) -> Result<Vec<RunState>>;
}

pub(crate) fn decode(value: JsonValue) -> Result<RunState> {
    serde_json::from_value(value).map_err(|e| Error::state(format!("malformed state: {}", e)))
}

pub(crate) fn suspended_patch(name: &str, task_type: &str, suspended: bool) -> JsonValue {
    json!({ "name": name, "type": task_type, "suspended": suspended })
}

/// Process-local state store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, JsonValue>>,
}

impl MemoryStateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored document of a task
    pub fn raw(&self, name: &str, task_type: &str) -> Option<JsonValue> {
        self.entries.lock().get(&state_key(name, task_type)).cloned()
    }

    fn upsert(&self, key: String, patch: &JsonValue) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| json!({}));
        merge_json(entry, patch);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, name: &str, task_type: &str) -> Result<Option<RunState>> {
        self.raw(name, task_type).map(decode).transpose()
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        self.upsert(state.key(), &state.to_patch()?);
        Ok(())
    }

    async fn set_suspended(&self, name: &str, task_type: &str, suspended: bool) -> Result<()> {
        self.upsert(
            state_key(name, task_type),
            &suspended_patch(name, task_type, suspended),
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        let values: Vec<JsonValue> = self.entries.lock().values().cloned().collect();
        values.into_iter().map(decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_then_load() {
        let store = MemoryStateStore::new();
        assert!(store.load("t", "jdbc").await.unwrap().is_none());

        let mut state = RunState::new("t", "jdbc");
        state.counter = 3;
        state.started = Some(Utc::now());
        store.save(&state).await.unwrap();

        assert_eq!(store.load("t", "jdbc").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_save_keeps_unset_fields() {
        let store = MemoryStateStore::new();
        let mut state = RunState::new("t", "jdbc");
        let begin = Utc::now();
        state.last_active_begin = Some(begin);
        store.save(&state).await.unwrap();

        state.last_active_begin = None;
        state.counter = 7;
        store.save(&state).await.unwrap();

        let loaded = store.load("t", "jdbc").await.unwrap().unwrap();
        assert_eq!(loaded.counter, 7);
        assert_eq!(loaded.last_active_begin, Some(begin));
    }

    #[tokio::test]
    async fn test_save_never_clears_suspended() {
        let store = MemoryStateStore::new();
        store.set_suspended("t", "jdbc", true).await.unwrap();

        let state = RunState::new("t", "jdbc");
        store.save(&state).await.unwrap();
        assert!(store.load("t", "jdbc").await.unwrap().unwrap().suspended);

        store.set_suspended("t", "jdbc", false).await.unwrap();
        assert!(!store.load("t", "jdbc").await.unwrap().unwrap().suspended);
    }

    #[tokio::test]
    async fn test_list() {
        let store = MemoryStateStore::new();
        store.save(&RunState::new("a", "jdbc")).await.unwrap();
        store.save(&RunState::new("b", "jdbc")).await.unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
