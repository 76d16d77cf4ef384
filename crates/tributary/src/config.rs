//! Configuration types for tributary
//!
//! One YAML file describes the index server, the state store, global
//! settings and the tasks. `${VAR}` and `${VAR:-default}` are expanded from
//! the environment before parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tributary_rdbc::connection::ConnectionConfig;
use validator::Validate;

use crate::bulk::{BulkSettings, HealthStatus, HttpIndexConfig, OverflowPolicy};
use crate::error::{Error, Result};
use crate::fetch::{FetchSettings, Strategy};
use crate::orchestrator::{OrchestratorSettings, Schedule, TaskDefinition, TaskRegistry, JDBC_TASK_TYPE};
use crate::planner::ChangeColumns;
use crate::sql::SqlCommand;
use crate::state::index::DEFAULT_STATE_INDEX;
use crate::types::SensitiveString;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TributaryConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    /// Index server connection and bulk settings
    #[serde(default)]
    #[validate(nested)]
    pub index_server: IndexServerConfig,

    /// Where run state is kept
    #[serde(default)]
    pub state: StateConfig,

    /// Global settings
    #[serde(default)]
    #[validate(nested)]
    pub settings: GlobalSettings,

    /// Tasks by name
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Index server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct IndexServerConfig {
    /// Base URL
    #[serde(default = "default_index_server_url")]
    #[validate(url)]
    pub url: String,

    /// Basic auth user
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Timeout of one request
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 100, max = 3_600_000))]
    pub request_timeout_ms: u64,

    /// Cluster health required before a run
    #[serde(default)]
    pub wait_for_status: HealthStatus,

    /// How long to wait for that health
    #[serde(default = "default_health_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub health_timeout_secs: u64,

    /// Manage target indexes (health wait, creation, bulk mode, refresh)
    #[serde(default = "default_true")]
    pub manage_indexes: bool,

    /// Bulk client settings
    #[serde(default)]
    #[validate(nested)]
    pub bulk: BulkConfig,
}

impl Default for IndexServerConfig {
    fn default() -> Self {
        Self {
            url: default_index_server_url(),
            username: None,
            password: None,
            request_timeout_ms: default_request_timeout_ms(),
            wait_for_status: HealthStatus::default(),
            health_timeout_secs: default_health_timeout_secs(),
            manage_indexes: true,
            bulk: BulkConfig::default(),
        }
    }
}

impl IndexServerConfig {
    /// HTTP client settings
    pub fn http_config(&self) -> HttpIndexConfig {
        HttpIndexConfig {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Health wait timeout
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

fn default_index_server_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_health_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Bulk client configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BulkConfig {
    /// Actions per batch
    #[serde(default = "default_max_bulk_actions")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_bulk_actions: usize,

    /// Bytes per batch
    #[serde(default = "default_max_bulk_volume")]
    #[validate(range(min = 1024, max = 1_073_741_824))]
    pub max_bulk_volume: usize,

    /// Batches in flight at once
    #[serde(default = "default_max_concurrent_bulk_requests")]
    #[validate(range(min = 1, max = 256))]
    pub max_concurrent_bulk_requests: usize,

    /// Maximum age of a pending batch, 0 to disable
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Behavior at the in-flight cap
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Pause applied to a submit while suspended
    #[serde(default = "default_suspend_wait_ms")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub suspend_wait_ms: u64,

    /// How long shutdown waits for outstanding responses
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_bulk_actions: default_max_bulk_actions(),
            max_bulk_volume: default_max_bulk_volume(),
            max_concurrent_bulk_requests: default_max_concurrent_bulk_requests(),
            flush_interval_ms: default_flush_interval_ms(),
            overflow: OverflowPolicy::default(),
            suspend_wait_ms: default_suspend_wait_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl BulkConfig {
    /// Bulk client settings with `default_index` for documents without one
    pub fn settings(&self, default_index: impl Into<String>) -> BulkSettings {
        BulkSettings {
            max_bulk_actions: self.max_bulk_actions,
            max_bulk_volume: self.max_bulk_volume,
            max_concurrent_bulk_requests: self.max_concurrent_bulk_requests,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            overflow: self.overflow,
            suspend_wait: Duration::from_millis(self.suspend_wait_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            default_index: default_index.into(),
        }
    }
}

fn default_max_bulk_actions() -> usize {
    1000
}

fn default_max_bulk_volume() -> usize {
    10 * 1024 * 1024
}

fn default_max_concurrent_bulk_requests() -> usize {
    4
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_suspend_wait_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

/// State store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    /// Process memory, lost on exit
    Memory,
    /// Documents in an index on the index server
    #[default]
    IndexServer,
}

/// State store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    /// Backend
    #[serde(default)]
    pub backend: StateBackend,

    /// Index holding state documents
    #[serde(default = "default_state_index")]
    pub index: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            index: default_state_index(),
        }
    }
}

fn default_state_index() -> String {
    DEFAULT_STATE_INDEX.to_string()
}

/// Global settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GlobalSettings {
    /// Worker count
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,

    /// Poll interval of stored suspended flags, 0 to disable
    #[serde(default = "default_suspension_poll_interval_ms")]
    pub suspension_poll_interval_ms: u64,

    /// Interval of the metrics log line, 0 to disable
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            suspension_poll_interval_ms: default_suspension_poll_interval_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl GlobalSettings {
    /// Orchestrator settings
    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            concurrency: self.concurrency,
            suspension_poll_interval: Duration::from_millis(self.suspension_poll_interval_ms),
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_suspension_poll_interval_ms() -> u64 {
    1000
}

fn default_metrics_interval_secs() -> u64 {
    60
}

/// One task
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TaskConfig {
    /// Task type
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,

    /// Row selection strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Source database URL
    #[validate(length(min = 1))]
    pub url: String,

    /// Database user
    #[serde(default)]
    pub user: Option<String>,

    /// Database password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Target index
    #[validate(length(min = 1))]
    pub index: String,

    /// Settings used when the index is created
    #[serde(default)]
    pub index_settings: Option<JsonValue>,

    /// Mappings used when the index is created
    #[serde(default)]
    pub index_mappings: Option<JsonValue>,

    /// Disable refresh and replicas while a run is in progress
    #[serde(default)]
    pub bulk_mode_tuning: bool,

    /// Creation timestamp column (column strategy)
    #[serde(default)]
    pub created_at: Option<String>,

    /// Modification timestamp column (column strategy)
    #[serde(default)]
    pub updated_at: Option<String>,

    /// Soft-delete timestamp column (column strategy)
    #[serde(default)]
    pub deleted_at: Option<String>,

    /// Quote change-detection column names
    #[serde(default = "default_true")]
    pub column_escape: bool,

    /// Subtracted from the last run start to form the watermark
    #[serde(default)]
    pub last_run_timestamp_overlap_ms: u64,

    /// Driver fetch size hint
    #[serde(default)]
    pub fetchsize: Option<u32>,

    /// Statement timeout, 0 for none
    #[serde(default)]
    pub query_timeout_ms: u64,

    /// Extra attempts after a failed run
    #[serde(default)]
    #[validate(range(max = 100))]
    pub max_retries: u32,

    /// Pause between attempts
    #[serde(default = "default_max_retries_wait_ms")]
    pub max_retries_wait_ms: u64,

    /// Cron expressions (6 or 7 fields)
    #[serde(default)]
    pub schedule: Vec<String>,

    /// Fixed interval between run starts
    #[serde(default)]
    pub interval_secs: Option<u64>,

    /// Statements in execution order
    #[validate(length(min = 1))]
    pub sql: Vec<SqlCommand>,
}

fn default_task_type() -> String {
    JDBC_TASK_TYPE.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries_wait_ms() -> u64 {
    30_000
}

impl TaskConfig {
    /// Change-detection columns
    pub fn columns(&self) -> ChangeColumns {
        ChangeColumns {
            created: self.created_at.clone(),
            updated: self.updated_at.clone(),
            deleted: self.deleted_at.clone(),
        }
    }

    /// Check what the derive cannot express
    fn check(&self, name: &str) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("task '{}': {}", name, e)))?;

        if self.strategy == Strategy::Column && self.columns().is_empty() {
            return Err(Error::config(format!(
                "task '{}': column strategy needs created_at, updated_at or deleted_at",
                name
            )));
        }
        for command in &self.sql {
            let placeholders = command.placeholder_count();
            if placeholders != command.parameters.len() {
                return Err(Error::config(format!(
                    "task '{}': statement has {} placeholders but {} parameters: {}",
                    name,
                    placeholders,
                    command.parameters.len(),
                    command.statement
                )));
            }
        }
        Schedule::from_parts(&self.schedule, self.interval_secs.map(Duration::from_secs))?;
        Ok(())
    }

    /// Build the task definition
    pub fn definition(&self, name: &str) -> Result<TaskDefinition> {
        self.check(name)?;

        let connection = ConnectionConfig::new(self.url.clone())
            .with_credentials(
                self.user.clone(),
                self.password.as_ref().map(|p| p.expose_secret().to_string()),
            )
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_application_name(format!("tributary-{}", name));

        let fetch = FetchSettings {
            task: name.to_string(),
            strategy: self.strategy,
            columns: self.columns(),
            column_escape: self.column_escape,
            overlap: Duration::from_millis(self.last_run_timestamp_overlap_ms),
            fetch_size: self.fetchsize,
            query_timeout: (self.query_timeout_ms > 0)
                .then(|| Duration::from_millis(self.query_timeout_ms)),
            commands: self.sql.clone(),
            connection,
        };

        let schedule = Schedule::from_parts(&self.schedule, self.interval_secs.map(Duration::from_secs))?;
        let mut definition = TaskDefinition::new(fetch, self.index.clone())
            .with_schedule(schedule)
            .with_retries(
                self.max_retries,
                Duration::from_millis(self.max_retries_wait_ms),
            );
        definition.task_type = self.task_type.clone();
        definition.index_settings = self.index_settings.clone();
        definition.index_mappings = self.index_mappings.clone();
        definition.bulk_mode_tuning = self.bulk_mode_tuning;
        Ok(definition)
    }
}

impl TributaryConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(|e| Error::config(e.to_string()))?;
        if self.tasks.is_empty() {
            return Err(Error::config("at least one task is required"));
        }
        for (name, task) in &self.tasks {
            task.check(name)?;
        }
        Ok(())
    }

    /// Registry with every task, optionally forced to run once
    pub fn registry(&self, once: bool) -> Result<TaskRegistry> {
        let registry = TaskRegistry::new();
        for (name, task) in &self.tasks {
            let mut definition = task.definition(name)?;
            if once {
                definition.schedule = Schedule::OneShot;
            }
            registry.register(definition);
        }
        Ok(registry)
    }

    /// Task by name
    pub fn task(&self, name: &str) -> Result<&TaskConfig> {
        self.tasks
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown task '{}'", name)))
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
