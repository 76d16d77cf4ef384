//! Testing utilities
//!
//! In-process fakes for the three external systems: the SQL connection, the
//! index server and the state store.
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::testing::*;
//!
//! #[tokio::test]
//! async fn test_fetch() {
//!     let factory = ScriptedFactory::new(|_sql, _params| {
//!         Ok(vec![row(&[("_id", Value::from(1)), ("name", Value::from("a"))])])
//!     });
//!     let transport = Arc::new(RecordingTransport::new());
//!     // ... run a FetchEngine against factory, a BulkClient against transport
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tributary_rdbc::connection::{
    Connection, ConnectionConfig, ConnectionFactory, QueryOptions, RowStream, VecRowStream,
};
use tributary_rdbc::{Row, Value};

use crate::bulk::{BulkRequest, BulkResponse, BulkTransport, HealthStatus, IndexAdmin, ItemResult};
use crate::document::OpType;
use crate::error::{Error, Result};
use crate::fetch::{FetchSettings, Strategy};
use crate::sql::SqlCommand;
use crate::state::{merge_json, RunState, StateDocuments, StateStore};

/// Build a row from column/value pairs
pub fn row(pairs: &[(&str, Value)]) -> Row {
    let (columns, values): (Vec<String>, Vec<Value>) = pairs
        .iter()
        .map(|(c, v)| (c.to_string(), v.clone()))
        .unzip();
    Row::new(columns, values)
}

/// Fetch settings for a task reading `statements` from a fake database
pub fn fetch_settings(task: &str, strategy: Strategy, statements: &[&str]) -> FetchSettings {
    FetchSettings {
        task: task.to_string(),
        strategy,
        columns: Default::default(),
        column_escape: false,
        overlap: Duration::ZERO,
        fetch_size: None,
        query_timeout: None,
        commands: statements.iter().map(|s| SqlCommand::new(*s)).collect(),
        connection: ConnectionConfig::new("postgres://localhost/test"),
    }
}

// ============================================================================
// SQL connection
// ============================================================================

type Handler = dyn Fn(&str, &[Value]) -> tributary_rdbc::Result<Vec<Row>> + Send + Sync;

#[derive(Default)]
struct ScriptState {
    queries: Mutex<Vec<(String, Vec<Value>)>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    refuse: AtomicBool,
}

/// Connection factory answering every query through a closure
#[derive(Clone)]
pub struct ScriptedFactory {
    handler: Arc<Handler>,
    state: Arc<ScriptState>,
    quote: String,
    timestampdiff: bool,
}

impl ScriptedFactory {
    /// Answer queries with `handler`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> tributary_rdbc::Result<Vec<Row>> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            state: Arc::new(ScriptState::default()),
            quote: String::new(),
            timestampdiff: false,
        }
    }

    /// Set the identifier quote reported by connections
    pub fn with_quote(mut self, quote: &str) -> Self {
        self.quote = quote.to_string();
        self
    }

    /// Report `TIMESTAMPDIFF` support
    pub fn with_timestampdiff(mut self, supported: bool) -> Self {
        self.timestampdiff = supported;
        self
    }

    /// Refuse new connections
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Executed queries with their parameters
    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.state.queries.lock().clone()
    }

    /// Connections opened
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections closed
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> tributary_rdbc::Result<Box<dyn Connection>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(tributary_rdbc::Error::connection("connection refused"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            factory: self.clone(),
        }))
    }
}

/// Connection created by [`ScriptedFactory`]
pub struct ScriptedConnection {
    factory: ScriptedFactory,
}

impl ScriptedConnection {
    fn answer(&self, sql: &str, params: &[Value]) -> tributary_rdbc::Result<Vec<Row>> {
        self.factory
            .state
            .queries
            .lock()
            .push((sql.to_string(), params.to_vec()));
        (self.factory.handler)(sql, params)
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> tributary_rdbc::Result<Vec<Row>> {
        self.answer(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> tributary_rdbc::Result<u64> {
        self.answer(sql, params).map(|rows| rows.len() as u64)
    }

    async fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
        _options: &QueryOptions,
    ) -> tributary_rdbc::Result<Pin<Box<dyn RowStream>>> {
        let rows = self.answer(sql, params)?;
        Ok(Box::pin(VecRowStream::new(rows)))
    }

    fn identifier_quote(&self) -> &str {
        &self.factory.quote
    }

    async fn probe_timestampdiff(&self) -> bool {
        self.factory.timestampdiff
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> tributary_rdbc::Result<()> {
        self.factory.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Bulk transport
// ============================================================================

/// Bulk transport that records every request
#[derive(Debug, Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<BulkRequest>>,
    started: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
    fail_at: Option<usize>,
    failing_ids: HashSet<String>,
    calls: AtomicUsize,
}

impl RecordingTransport {
    /// Transport acknowledging everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the `n`th request (0-based) as a whole
    pub fn failing_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Report the actions on these ids as failed items
    pub fn failing_ids(mut self, ids: &[&str]) -> Self {
        self.failing_ids = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Acknowledged requests in send order
    pub fn batches(&self) -> Vec<BulkRequest> {
        self.batches.lock().clone()
    }

    /// Id of the first action of every request, in the order sends started
    pub fn started_ids(&self) -> Vec<Option<String>> {
        self.started.lock().clone()
    }

    /// Action counts of the acknowledged requests
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(BulkRequest::len).collect()
    }

    /// Operation types of all acknowledged actions
    pub fn ops(&self) -> Vec<OpType> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.actions().iter().map(|a| a.op()))
            .collect()
    }
}

#[async_trait]
impl BulkTransport for RecordingTransport {
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.started
            .lock()
            .push(request.actions().first().and_then(|a| a.id()).map(String::from));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_at == Some(call) {
            return Err(Error::transport("connection reset by peer"));
        }
        self.batches.lock().push(request.clone());

        let mut response = BulkResponse::success(request);
        for item in &mut response.items {
            if item.id.as_ref().is_some_and(|id| self.failing_ids.contains(id)) {
                item.status = 409;
                item.error = Some("version conflict".to_string());
            }
        }
        Ok(response)
    }
}

// ============================================================================
// Index server
// ============================================================================

#[derive(Debug, Default)]
struct IndexData {
    settings: Map<String, JsonValue>,
    docs: BTreeMap<String, JsonValue>,
    refreshes: usize,
}

/// In-memory index server: bulk writes, index admin and state documents
#[derive(Debug)]
pub struct MemoryIndexServer {
    indices: Mutex<BTreeMap<String, IndexData>>,
    health: HealthStatus,
    next_id: AtomicUsize,
}

impl Default for MemoryIndexServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndexServer {
    /// Empty server reporting green health
    pub fn new() -> Self {
        Self {
            indices: Mutex::new(BTreeMap::new()),
            health: HealthStatus::Green,
            next_id: AtomicUsize::new(1),
        }
    }

    /// Report `health` instead of green
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    /// Stored document
    pub fn document(&self, index: &str, id: &str) -> Option<JsonValue> {
        self.indices
            .lock()
            .get(index)
            .and_then(|i| i.docs.get(id).cloned())
    }

    /// Number of documents in an index
    pub fn count(&self, index: &str) -> usize {
        self.indices.lock().get(index).map_or(0, |i| i.docs.len())
    }

    /// Refreshes of an index
    pub fn refresh_count(&self, index: &str) -> usize {
        self.indices.lock().get(index).map_or(0, |i| i.refreshes)
    }

    fn apply(&self, index: &str, op: OpType, id: Option<&str>, source: Option<JsonValue>) -> ItemResult {
        let mut indices = self.indices.lock();
        let data = indices.entry(index.to_string()).or_default();
        let id = id
            .map(String::from)
            .unwrap_or_else(|| format!("auto-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let (status, error) = match op {
            OpType::Create if data.docs.contains_key(&id) => (409, Some("document already exists".to_string())),
            OpType::Create | OpType::Index => {
                let created = data
                    .docs
                    .insert(id.clone(), source.unwrap_or_else(|| json!({})))
                    .is_none();
                (if created { 201 } else { 200 }, None)
            }
            OpType::Delete => match data.docs.remove(&id) {
                Some(_) => (200, None),
                None => (404, None),
            },
        };
        ItemResult {
            op: op.as_str().to_string(),
            id: Some(id),
            status,
            error,
        }
    }
}

#[async_trait]
impl BulkTransport for MemoryIndexServer {
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse> {
        let mut items = Vec::with_capacity(request.len());
        for action in request.actions() {
            let source = match action.lines().lines().nth(1) {
                Some(line) => Some(serde_json::from_str(line)?),
                None => None,
            };
            items.push(self.apply(action.index(), action.op(), action.id(), source));
        }
        Ok(BulkResponse { took_ms: 1, items })
    }
}

#[async_trait]
impl IndexAdmin for MemoryIndexServer {
    async fn wait_for_health(&self, status: HealthStatus, _timeout: Duration) -> Result<()> {
        if self.health >= status {
            Ok(())
        } else {
            Err(Error::IndexServer(format!(
                "cluster health {} did not reach {}",
                self.health, status
            )))
        }
    }

    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.indices.lock().contains_key(index))
    }

    async fn create_index(
        &self,
        index: &str,
        settings: Option<&JsonValue>,
        _mappings: Option<&JsonValue>,
    ) -> Result<()> {
        let mut indices = self.indices.lock();
        let data = indices.entry(index.to_string()).or_default();
        if let Some(JsonValue::Object(settings)) = settings {
            data.settings = settings.clone();
        }
        Ok(())
    }

    async fn index_settings(&self, index: &str) -> Result<JsonValue> {
        self.indices
            .lock()
            .get(index)
            .map(|i| JsonValue::Object(i.settings.clone()))
            .ok_or_else(|| Error::IndexServer(format!("no such index: {}", index)))
    }

    async fn update_settings(&self, index: &str, settings: &JsonValue) -> Result<()> {
        let mut indices = self.indices.lock();
        let data = indices
            .get_mut(index)
            .ok_or_else(|| Error::IndexServer(format!("no such index: {}", index)))?;
        if let JsonValue::Object(settings) = settings {
            for (key, value) in settings {
                if value.is_null() {
                    data.settings.remove(key);
                } else {
                    data.settings.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let mut indices = self.indices.lock();
        indices.entry(index.to_string()).or_default().refreshes += 1;
        Ok(())
    }
}

#[async_trait]
impl StateDocuments for MemoryIndexServer {
    async fn get_document(&self, index: &str, id: &str) -> Result<Option<JsonValue>> {
        Ok(self.document(index, id))
    }

    async fn upsert_partial(&self, index: &str, id: &str, patch: &JsonValue) -> Result<()> {
        let mut indices = self.indices.lock();
        let doc = indices
            .entry(index.to_string())
            .or_default()
            .docs
            .entry(id.to_string())
            .or_insert_with(|| json!({}));
        merge_json(doc, patch);
        Ok(())
    }

    async fn list_documents(&self, index: &str) -> Result<Vec<JsonValue>> {
        Ok(self
            .indices
            .lock()
            .get(index)
            .map(|i| i.docs.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ============================================================================
// State store
// ============================================================================

/// State store whose every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStateStore;

#[async_trait]
impl StateStore for FailingStateStore {
    async fn load(&self, _name: &str, _task_type: &str) -> Result<Option<RunState>> {
        Err(Error::state("state store unavailable"))
    }

    async fn save(&self, _state: &RunState) -> Result<()> {
        Err(Error::state("state store unavailable"))
    }

    async fn set_suspended(&self, _name: &str, _task_type: &str, _suspended: bool) -> Result<()> {
        Err(Error::state("state store unavailable"))
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        Err(Error::state("state store unavailable"))
    }
}
