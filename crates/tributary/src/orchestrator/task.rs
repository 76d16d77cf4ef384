//! Task definitions and the task registry

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::schedule::Schedule;
use crate::fetch::FetchSettings;

/// Default task type
pub const JDBC_TASK_TYPE: &str = "jdbc";

/// Everything needed to run one task
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Task name, unique within a registry
    pub name: String,
    /// Task type, part of the state key
    pub task_type: String,
    /// When the task runs
    pub schedule: Schedule,
    /// Fetch configuration
    pub fetch: FetchSettings,
    /// Target index
    pub index: String,
    /// Settings for index creation
    pub index_settings: Option<JsonValue>,
    /// Mappings for index creation
    pub index_mappings: Option<JsonValue>,
    /// Disable refresh and replicas during a run
    pub bulk_mode_tuning: bool,
    /// Extra attempts after a failed run
    pub max_retries: u32,
    /// Pause between attempts
    pub max_retries_wait: Duration,
}

impl TaskDefinition {
    /// Definition with a one-shot schedule and no retries
    pub fn new(fetch: FetchSettings, index: impl Into<String>) -> Self {
        Self {
            name: fetch.task.clone(),
            task_type: JDBC_TASK_TYPE.to_string(),
            schedule: Schedule::OneShot,
            fetch,
            index: index.into(),
            index_settings: None,
            index_mappings: None,
            bulk_mode_tuning: false,
            max_retries: 0,
            max_retries_wait: Duration::ZERO,
        }
    }

    /// Set the schedule
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Set the retry policy
    pub fn with_retries(mut self, max_retries: u32, wait: Duration) -> Self {
        self.max_retries = max_retries;
        self.max_retries_wait = wait;
        self
    }

    /// Settings compared on re-registration
    ///
    /// The password is left out.
    pub fn fingerprint(&self) -> JsonValue {
        let fetch = &self.fetch;
        let schedule = match &self.schedule {
            Schedule::OneShot => json!("once"),
            Schedule::Interval(period) => json!({ "interval_ms": period.as_millis() as u64 }),
            Schedule::Cron(schedules) => {
                json!(schedules.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            }
        };
        json!({
            "url": fetch.connection.url,
            "user": fetch.connection.user,
            "columns": [fetch.columns.created, fetch.columns.updated, fetch.columns.deleted],
            "column_escape": fetch.column_escape,
            "overlap_ms": fetch.overlap.as_millis() as u64,
            "fetch_size": fetch.fetch_size,
            "query_timeout_ms": fetch.query_timeout.map(|t| t.as_millis() as u64),
            "sql": fetch.commands,
            "index": self.index,
            "index_settings": self.index_settings,
            "index_mappings": self.index_mappings,
            "bulk_mode_tuning": self.bulk_mode_tuning,
            "max_retries": self.max_retries,
            "max_retries_wait_ms": self.max_retries_wait.as_millis() as u64,
            "schedule": schedule,
        })
    }
}

/// Outcome of registering a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// No definition under this name before
    Added,
    /// Type, strategy or settings differ from the previous definition
    Changed,
    /// Same as the previous definition
    Unchanged,
}

/// Named task definitions
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<BTreeMap<String, Arc<TaskDefinition>>>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition
    pub fn register(&self, definition: TaskDefinition) -> Registration {
        let mut tasks = self.tasks.lock();
        let outcome = match tasks.get(&definition.name) {
            None => Registration::Added,
            Some(previous)
                if previous.task_type != definition.task_type
                    || previous.fetch.strategy != definition.fetch.strategy
                    || previous.fingerprint() != definition.fingerprint() =>
            {
                Registration::Changed
            }
            Some(_) => Registration::Unchanged,
        };
        if outcome != Registration::Unchanged {
            tasks.insert(definition.name.clone(), Arc::new(definition));
        }
        outcome
    }

    /// Definition by name
    pub fn get(&self, name: &str) -> Option<Arc<TaskDefinition>> {
        self.tasks.lock().get(name).cloned()
    }

    /// Remove a definition
    pub fn remove(&self, name: &str) -> Option<Arc<TaskDefinition>> {
        self.tasks.lock().remove(name)
    }

    /// All definitions, ordered by name
    pub fn all(&self) -> Vec<Arc<TaskDefinition>> {
        self.tasks.lock().values().cloned().collect()
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Strategy;
    use crate::testing::fetch_settings;

    #[test]
    fn test_registration_outcomes() {
        let registry = TaskRegistry::new();
        let def = TaskDefinition::new(fetch_settings("products", Strategy::Simple, &["SELECT 1"]), "products");

        assert_eq!(registry.register(def.clone()), Registration::Added);
        assert_eq!(registry.register(def.clone()), Registration::Unchanged);

        let mut column = def.clone();
        column.fetch.strategy = Strategy::Column;
        assert_eq!(registry.register(column), Registration::Changed);

        let mut other_type = def.clone();
        other_type.task_type = "csv".into();
        assert_eq!(registry.register(other_type), Registration::Changed);

        let mut other_index = def;
        other_index.index = "products_v2".into();
        assert_eq!(registry.register(other_index), Registration::Changed);
        assert_eq!(registry.get("products").unwrap().index, "products_v2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fingerprint_ignores_password() {
        let mut a = TaskDefinition::new(fetch_settings("t", Strategy::Simple, &["SELECT 1"]), "t");
        let mut b = a.clone();
        a.fetch.connection.password = Some("one".into());
        b.fetch.connection.password = Some("two".into());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
