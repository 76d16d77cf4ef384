//! One task's run: state bookkeeping around a fetch cycle, with retries

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tributary_rdbc::connection::ConnectionFactory;

use super::task::TaskDefinition;
use super::BulkHandle;
use crate::bulk::{IndexLifecycle, SavedSettings};
use crate::error::{Error, Result};
use crate::fetch::{CycleInput, FetchEngine, FetchHooks, FetchStats};
use crate::state::{RunState, StateTracker};

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// State as persisted after the run
    pub state: RunState,
    /// Fetch counters
    pub stats: FetchStats,
    /// Attempts it took, 1 without retries
    pub attempts: u32,
    /// The stored state disables the task; nothing was fetched
    pub skipped: bool,
}

/// Runs one task; owns its fetch engine and read connection
pub struct TaskRunner {
    definition: Arc<TaskDefinition>,
    engine: FetchEngine,
    state: StateTracker,
    lifecycle: Option<IndexLifecycle>,
}

impl TaskRunner {
    /// Create a runner
    pub fn new(
        definition: Arc<TaskDefinition>,
        factory: Arc<dyn ConnectionFactory>,
        state: StateTracker,
    ) -> Self {
        let engine = FetchEngine::new(definition.fetch.clone(), factory);
        Self {
            definition,
            engine,
            state,
            lifecycle: None,
        }
    }

    /// Manage the target index around each run
    pub fn with_lifecycle(mut self, lifecycle: IndexLifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Install fetch hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn FetchHooks>) -> Self {
        self.engine = self.engine.with_hooks(hooks);
        self
    }

    /// Task definition
    pub fn definition(&self) -> &Arc<TaskDefinition> {
        &self.definition
    }

    /// Run, retrying failed attempts up to `max_retries` times
    pub async fn run(&mut self, bulk: &BulkHandle, cancel: &CancellationToken) -> Result<RunOutcome> {
        let mut attempt = 1;
        loop {
            match self.run_once(bulk, cancel).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt <= self.definition.max_retries => {
                    warn!(
                        task = %self.definition.name,
                        attempt,
                        max_retries = self.definition.max_retries,
                        error = %e,
                        "run failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Interrupted),
                        _ = tokio::time::sleep(self.definition.max_retries_wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run once, without retries
    pub async fn run_once(&mut self, bulk: &BulkHandle, cancel: &CancellationToken) -> Result<RunOutcome> {
        let def = Arc::clone(&self.definition);
        let mut state = self.state.load(&def.name, &def.task_type).await;
        if !state.enabled {
            info!(task = %def.name, "task disabled, skipping run");
            return Ok(RunOutcome {
                state,
                stats: FetchStats::default(),
                attempts: 1,
                skipped: true,
            });
        }

        let started = Utc::now();
        let input = CycleInput {
            started,
            counter: state.counter + 1,
            last_run: state.last_run(),
        };
        state.counter += 1;
        state.started = Some(started);
        state.active = true;
        self.state.save(&state).await;
        info!(task = %def.name, counter = state.counter, "run started");

        let clock = Instant::now();
        let result = self.cycle(&input, bulk, cancel).await;

        state.active = false;
        if result.is_ok() {
            state.last_active_begin = Some(started);
            state.last_active_end = Some(Utc::now());
        }
        self.state.save(&state).await;

        match result {
            Ok(stats) => {
                info!(
                    task = %def.name,
                    counter = state.counter,
                    documents = stats.documents(),
                    elapsed_ms = clock.elapsed().as_millis() as u64,
                    "run complete"
                );
                Ok(RunOutcome {
                    state,
                    stats,
                    attempts: 1,
                    skipped: false,
                })
            }
            Err(e) => {
                if e.is_interrupted() {
                    info!(task = %def.name, "run interrupted");
                    self.engine.close().await;
                }
                Err(e)
            }
        }
    }

    async fn cycle(
        &mut self,
        input: &CycleInput,
        bulk: &BulkHandle,
        cancel: &CancellationToken,
    ) -> Result<FetchStats> {
        let def = Arc::clone(&self.definition);
        let saved = match &self.lifecycle {
            Some(lifecycle) => {
                lifecycle
                    .prepare(
                        &def.index,
                        def.index_settings.as_ref(),
                        def.index_mappings.as_ref(),
                        def.bulk_mode_tuning,
                    )
                    .await?
            }
            None => None,
        };

        let result = self.fetch_and_drain(input, bulk, cancel).await;
        self.finish_index(&def.index, saved.as_ref()).await;
        result
    }

    async fn fetch_and_drain(
        &mut self,
        input: &CycleInput,
        bulk: &BulkHandle,
        cancel: &CancellationToken,
    ) -> Result<FetchStats> {
        let client = bulk.client();
        let sink = client.sink_for(self.definition.index.clone());
        let stats = self.engine.fetch(input, &sink, cancel).await?;

        client.flush().await?;
        let timeout = client.settings().shutdown_timeout;
        let drained = client.wait_for_responses(timeout).await;
        if let Some(cause) = client.closed_cause() {
            return Err(Error::client_closed(cause));
        }
        if !drained {
            let outstanding = client.in_flight();
            warn!(
                task = %self.definition.name,
                outstanding,
                "bulk responses still outstanding after run"
            );
            return Err(Error::DrainTimeout {
                outstanding,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(stats)
    }

    async fn finish_index(&self, index: &str, saved: Option<&SavedSettings>) {
        if let Some(lifecycle) = &self.lifecycle {
            if let Err(e) = lifecycle.finish(index, saved).await {
                warn!(task = %self.definition.name, index, error = %e, "unable to finish index");
            } else {
                debug!(task = %self.definition.name, index, "index refreshed");
            }
        }
    }

    /// Close the read connection
    pub async fn close(&mut self) {
        self.engine.close().await;
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("task", &self.definition.name)
            .field("phase", &self.engine.phase())
            .finish()
    }
}
