//! Fetch engine
//!
//! Runs the configured statements of one task against its read connection,
//! folds the rows into documents and hands them to a [`DocumentSink`].
//!
//! Two strategies are supported:
//! - `simple`: statements run as written, every document is an `index`
//! - `column`: change detection on created/updated/deleted timestamp
//!   columns, see [`crate::planner`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tributary_rdbc::connection::{Connection, ConnectionConfig, ConnectionFactory, QueryOptions};

use crate::document::{Document, OpType};
use crate::error::{Error, Result};
use crate::merge::RowMerger;
use crate::planner::{ChangeColumns, ComparisonStyle, PlannedQuery, Planner};
use crate::sql::{ParameterContext, SqlCommand};

/// How rows are selected in each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Statements run as written
    #[default]
    Simple,
    /// Timestamp-column change detection
    Column,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Column => write!(f, "column"),
        }
    }
}

/// Engine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// Between cycles
    Idle,
    /// Running the before-fetch hook
    BeforeFetch,
    /// Executing statements
    Fetch,
    /// Running the after-fetch hook
    AfterFetch,
}

/// Outcome of submitting one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Accepted into the current batch
    Queued,
    /// Sink is suspended, nothing was enqueued; try again
    Suspended,
}

/// Receiver of the documents a fetch cycle produces
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Submit a document with its own operation type
    async fn submit(&self, doc: &Document) -> Result<Submit>;
}

/// Extension points around a fetch cycle
#[async_trait]
pub trait FetchHooks: Send + Sync {
    /// Called before the first statement runs
    async fn before_fetch(&self, _task: &str) -> Result<()> {
        Ok(())
    }

    /// Called after the last statement succeeded
    async fn after_fetch(&self, _task: &str, _stats: &FetchStats) -> Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl FetchHooks for NoopHooks {}

/// Immutable fetch configuration of one task
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Task name (logging, `$task.name`)
    pub task: String,
    /// Row selection strategy
    pub strategy: Strategy,
    /// Change-detection columns (column strategy)
    pub columns: ChangeColumns,
    /// Quote change-detection column names
    pub column_escape: bool,
    /// Subtracted from the last run start to form the watermark
    pub overlap: Duration,
    /// Driver fetch size hint
    pub fetch_size: Option<u32>,
    /// Statement timeout
    pub query_timeout: Option<Duration>,
    /// Statements in execution order
    pub commands: Vec<SqlCommand>,
    /// Read connection
    pub connection: ConnectionConfig,
}

/// Timing of one cycle and of the last successful run
#[derive(Debug, Clone, Copy)]
pub struct CycleInput {
    /// Start of this cycle
    pub started: DateTime<Utc>,
    /// Counter of this run
    pub counter: i64,
    /// Start and end of the last successful run
    pub last_run: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Counters of one fetch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Queries executed
    pub queries: u64,
    /// Rows read
    pub rows: u64,
    /// `create` documents submitted
    pub created: u64,
    /// `index` documents submitted
    pub indexed: u64,
    /// `delete` documents submitted
    pub deleted: u64,
    /// Row groups dropped for having no fields
    pub skipped: u64,
}

impl FetchStats {
    /// Total documents submitted
    pub fn documents(&self) -> u64 {
        self.created + self.indexed + self.deleted
    }

    fn count(&mut self, op: OpType) {
        match op {
            OpType::Create => self.created += 1,
            OpType::Index => self.indexed += 1,
            OpType::Delete => self.deleted += 1,
        }
    }
}

/// Watermark for a run: the last successful start minus the overlap, or
/// the Unix epoch when there is none
pub fn watermark(last_run_start: Option<DateTime<Utc>>, overlap: Duration) -> DateTime<Utc> {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    match last_run_start {
        Some(start) => {
            let overlap = chrono::Duration::from_std(overlap).unwrap_or(chrono::Duration::zero());
            start
                .checked_sub_signed(overlap)
                .map_or(epoch, |w| w.max(epoch))
        }
        None => epoch,
    }
}

/// Executes the statements of one task
pub struct FetchEngine {
    settings: FetchSettings,
    factory: Arc<dyn ConnectionFactory>,
    hooks: Arc<dyn FetchHooks>,
    conn: Option<Box<dyn Connection>>,
    style: Option<ComparisonStyle>,
    phase: FetchPhase,
}

impl FetchEngine {
    /// Create an engine; the connection is opened on the first fetch
    pub fn new(settings: FetchSettings, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            settings,
            factory,
            hooks: Arc::new(NoopHooks),
            conn: None,
            style: None,
            phase: FetchPhase::Idle,
        }
    }

    /// Install before/after hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Current phase
    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    /// Configuration
    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Run one fetch cycle
    ///
    /// Stops with [`Error::Interrupted`] as soon as `cancel` fires; documents
    /// already submitted stay submitted.
    pub async fn fetch(
        &mut self,
        input: &CycleInput,
        sink: &dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> Result<FetchStats> {
        let started = Instant::now();
        let result = self.run_phases(input, sink, cancel).await;
        self.phase = FetchPhase::Idle;

        let task = self.settings.task.clone();
        histogram!("tributary.fetch.duration_ms", "task" => task.clone())
            .record(started.elapsed().as_millis() as f64);
        match &result {
            Ok(stats) => {
                counter!("tributary.fetch.cycles", "task" => task.clone()).increment(1);
                counter!("tributary.fetch.rows", "task" => task).increment(stats.rows);
            }
            Err(e) => {
                counter!("tributary.fetch.failures", "task" => task).increment(1);
                if matches!(e, Error::Rdbc(inner) if inner.is_retriable()) {
                    // Reopen on the next cycle.
                    self.close().await;
                }
            }
        }
        result
    }

    async fn run_phases(
        &mut self,
        input: &CycleInput,
        sink: &dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> Result<FetchStats> {
        self.phase = FetchPhase::BeforeFetch;
        self.hooks.before_fetch(&self.settings.task).await?;

        self.phase = FetchPhase::Fetch;
        let queries = self.plan(input).await?;
        let mut stats = FetchStats::default();
        for query in queries {
            self.execute(&query, sink, cancel, &mut stats).await?;
        }

        self.phase = FetchPhase::AfterFetch;
        self.hooks.after_fetch(&self.settings.task, &stats).await?;

        info!(
            task = %self.settings.task,
            queries = stats.queries,
            rows = stats.rows,
            created = stats.created,
            indexed = stats.indexed,
            deleted = stats.deleted,
            "fetch cycle complete"
        );
        Ok(stats)
    }

    async fn connection(&mut self) -> Result<&dyn Connection> {
        if self.conn.is_none() {
            debug!(task = %self.settings.task, "opening read connection");
            let conn = self
                .factory
                .connect(&self.settings.connection)
                .await
                .map_err(|e| {
                    error!(task = %self.settings.task, error = %e, "unable to open read connection");
                    e
                })?;
            self.conn = Some(conn);
        }
        self.conn
            .as_deref()
            .ok_or_else(|| Error::from(tributary_rdbc::Error::connection("no connection")))
    }

    async fn plan(&mut self, input: &CycleInput) -> Result<Vec<PlannedQuery>> {
        let watermark = watermark(input.last_run.map(|(s, _)| s), self.settings.overlap);
        let ctx = ParameterContext {
            now: input.started,
            last_run_start: watermark,
            last_run_end: input
                .last_run
                .map(|(_, e)| e)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            counter: input.counter,
            task_name: self.settings.task.clone(),
        };
        let bound: Vec<_> = self.settings.commands.iter().map(|c| c.bind(&ctx)).collect();

        match self.settings.strategy {
            Strategy::Simple => Ok(bound
                .into_iter()
                .map(|cmd| PlannedQuery {
                    op: OpType::Index,
                    sql: cmd.sql,
                    params: cmd.params,
                })
                .collect()),
            Strategy::Column => {
                let column_escape = self.settings.column_escape;
                let conn = self.connection().await?;
                let quote = if column_escape {
                    conn.identifier_quote().to_string()
                } else {
                    String::new()
                };
                let style = match self.style {
                    Some(style) => style,
                    None => {
                        let conn = self.connection().await?;
                        let style = if conn.probe_timestampdiff().await {
                            ComparisonStyle::TimestampDiff
                        } else {
                            ComparisonStyle::Direct
                        };
                        debug!(task = %self.settings.task, ?style, "comparison style probed");
                        self.style = Some(style);
                        style
                    }
                };
                let planner = Planner::new(&self.settings.columns, &quote, style)?;
                debug!(task = %self.settings.task, %watermark, "planning change detection");
                Ok(bound
                    .iter()
                    .flat_map(|cmd| planner.plan(cmd, watermark))
                    .collect())
            }
        }
    }

    async fn execute(
        &mut self,
        query: &PlannedQuery,
        sink: &dyn DocumentSink,
        cancel: &CancellationToken,
        stats: &mut FetchStats,
    ) -> Result<()> {
        let options = QueryOptions {
            fetch_size: self.settings.fetch_size,
            timeout: self.settings.query_timeout,
        };
        let task = self.settings.task.clone();
        let conn = self.connection().await?;

        debug!(
            task = %task,
            op = %query.op,
            sql = %query.sql,
            params = query.params.len(),
            "executing"
        );
        let mut rows = conn
            .query_stream(&query.sql, &query.params, &options)
            .await?;
        stats.queries += 1;

        let mut merger = RowMerger::new(query.op);
        merger.begin();
        while let Some(row) = rows.next().await? {
            stats.rows += 1;
            if let Some(doc) = merger.merge_row(&row)? {
                emit(&doc, sink, cancel, stats).await?;
            }
        }
        if let Some(doc) = merger.end() {
            emit(&doc, sink, cancel, stats).await?;
        }
        stats.skipped += merger.skipped();
        Ok(())
    }

    /// Close the read connection, best effort
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!(task = %self.settings.task, error = %e, "error closing read connection");
            }
        }
    }
}

async fn emit(
    doc: &Document,
    sink: &dyn DocumentSink,
    cancel: &CancellationToken,
    stats: &mut FetchStats,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        match sink.submit(doc).await? {
            Submit::Queued => break,
            Submit::Suspended => continue,
        }
    }
    stats.count(doc.op());
    Ok(())
}
