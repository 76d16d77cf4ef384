//! Run state tracking
//!
//! A [`RunState`] per task records the run counter, the window of the last
//! successful run and the active/suspended flags. The [`StateTracker`] sits
//! in front of a [`StateStore`] and never lets a state problem fail a run:
//! load errors yield a fresh state and save errors are logged.

pub mod index;
pub mod store;

pub use index::{IndexStateStore, StateDocuments};
pub use store::{MemoryStateStore, StateStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::Result;

/// Persistent state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    /// Task name
    pub name: String,
    /// Task type, e.g. `jdbc`
    #[serde(rename = "type")]
    pub task_type: String,
    /// Number of runs started
    pub counter: i64,
    /// Start of the current or last run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Start of the last successful run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_begin: Option<DateTime<Utc>>,
    /// End of the last successful run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_end: Option<DateTime<Utc>>,
    /// Task enabled
    pub enabled: bool,
    /// A run is in progress
    pub active: bool,
    /// Writes paused by an operator
    pub suspended: bool,
    /// Free-form values, merged key by key
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, JsonValue>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            name: String::new(),
            task_type: String::new(),
            counter: 0,
            started: None,
            last_active_begin: None,
            last_active_end: None,
            enabled: true,
            active: false,
            suspended: false,
            custom: Map::new(),
        }
    }
}

impl RunState {
    /// Fresh state of a task that never ran
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    /// Storage key
    pub fn key(&self) -> String {
        state_key(&self.name, &self.task_type)
    }

    /// Start and end of the last successful run, when both are known
    pub fn last_run(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.last_active_begin.zip(self.last_active_end)
    }

    /// Partial document written by a save; never carries `suspended`
    pub fn to_patch(&self) -> Result<JsonValue> {
        let mut value = serde_json::to_value(self)?;
        if let JsonValue::Object(map) = &mut value {
            map.remove("suspended");
        }
        Ok(value)
    }
}

/// Storage key of a task's state
pub fn state_key(name: &str, task_type: &str) -> String {
    format!("{}.{}", task_type, name)
}

/// Merge `patch` into `target`: objects merge key by key, anything else
/// replaces
pub fn merge_json(target: &mut JsonValue, patch: &JsonValue) {
    match (target, patch) {
        (JsonValue::Object(target), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Fault-tolerant front of a [`StateStore`]
#[derive(Clone)]
pub struct StateTracker {
    store: Arc<dyn StateStore>,
}

impl StateTracker {
    /// Create a tracker
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Load a task's state, or a fresh one when missing or unreadable
    pub async fn load(&self, name: &str, task_type: &str) -> RunState {
        match self.store.load(name, task_type).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(task = name, "no stored state, starting fresh");
                RunState::new(name, task_type)
            }
            Err(e) => {
                warn!(task = name, error = %e, "unable to load state, starting fresh");
                RunState::new(name, task_type)
            }
        }
    }

    /// Merge-write a task's state; failures are logged
    pub async fn save(&self, state: &RunState) -> bool {
        match self.store.save(state).await {
            Ok(()) => true,
            Err(e) => {
                error!(task = %state.name, error = %e, "unable to save state");
                false
            }
        }
    }

    /// Set the suspended flag
    pub async fn set_suspended(&self, name: &str, task_type: &str, suspended: bool) -> Result<()> {
        self.store.set_suspended(name, task_type, suspended).await
    }

    /// Enable or disable a task; a disabled task is skipped when due
    pub async fn set_enabled(&self, name: &str, task_type: &str, enabled: bool) -> Result<()> {
        let mut state = self
            .store
            .load(name, task_type)
            .await?
            .unwrap_or_else(|| RunState::new(name, task_type));
        state.enabled = enabled;
        self.store.save(&state).await
    }

    /// Stored suspended flag, `false` when unknown
    pub async fn is_suspended(&self, name: &str, task_type: &str) -> bool {
        match self.store.load(name, task_type).await {
            Ok(state) => state.is_some_and(|s| s.suspended),
            Err(e) => {
                debug!(task = name, error = %e, "unable to read suspended flag");
                false
            }
        }
    }

    /// All stored states
    pub async fn list(&self) -> Result<Vec<RunState>> {
        self.store.list().await
    }
}

impl std::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTracker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingStateStore;
    use serde_json::json;

    #[test]
    fn test_merge_json_preserves_absent_keys() {
        let mut target = json!({"a": 1, "b": 2, "nested": {"x": 1}});
        merge_json(&mut target, &json!({"b": 99, "nested": {"y": 2}}));
        assert_eq!(target, json!({"a": 1, "b": 99, "nested": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_patch_omits_unset_and_suspended() {
        let mut state = RunState::new("products", "jdbc");
        state.suspended = true;
        let patch = state.to_patch().unwrap();
        assert_eq!(patch["name"], json!("products"));
        assert_eq!(patch["type"], json!("jdbc"));
        assert!(patch.get("suspended").is_none());
        assert!(patch.get("last_active_begin").is_none());
        assert!(patch.get("custom").is_none());
    }

    #[test]
    fn test_last_run_needs_both_ends() {
        let mut state = RunState::new("t", "jdbc");
        state.last_active_begin = Some(Utc::now());
        assert!(state.last_run().is_none());
        state.last_active_end = Some(Utc::now());
        assert!(state.last_run().is_some());
    }

    #[tokio::test]
    async fn test_set_enabled_keeps_run_window() {
        let tracker = StateTracker::new(Arc::new(MemoryStateStore::new()));
        let mut state = RunState::new("products", "jdbc");
        state.counter = 4;
        state.last_active_begin = Some(Utc::now());
        assert!(tracker.save(&state).await);

        tracker.set_enabled("products", "jdbc", false).await.unwrap();
        let stored = tracker.load("products", "jdbc").await;
        assert!(!stored.enabled);
        assert_eq!(stored.counter, 4);
        assert_eq!(stored.last_active_begin, state.last_active_begin);
    }

    #[tokio::test]
    async fn test_load_failure_yields_fresh_state() {
        let tracker = StateTracker::new(Arc::new(FailingStateStore));
        let state = tracker.load("products", "jdbc").await;
        assert_eq!(state, RunState::new("products", "jdbc"));
        assert!(!tracker.save(&state).await);
        assert!(!tracker.is_suspended("products", "jdbc").await);
    }
}
