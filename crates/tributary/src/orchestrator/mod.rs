//! Task orchestration
//!
//! Every registered task gets a scheduler that queues it when due;
//! `concurrency` workers drain the queue and run the tasks. A task is queued
//! again only after its previous run finished, so runs of one task never
//! overlap.
//!
//! ```text
//! Scheduled -> Running -> Success | Failed -> Scheduled   (recurring)
//!                                          -> Terminated  (one-shot)
//! ```
//!
//! A background timer polls the stored `suspended` flags and logs metrics.
//! Everything stops on the group's [`CancellationToken`].

pub mod runner;
pub mod schedule;
pub mod task;

pub use runner::{RunOutcome, TaskRunner};
pub use schedule::Schedule;
pub use task::{Registration, TaskDefinition, TaskRegistry, JDBC_TASK_TYPE};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tributary_rdbc::connection::ConnectionFactory;

use crate::bulk::{BulkClient, BulkSettings, BulkTransport, IndexLifecycle};
use crate::error::{Error, Result};
use crate::state::StateTracker;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Worker count
    pub concurrency: usize,
    /// How often stored suspended flags are polled; zero disables polling
    pub suspension_poll_interval: Duration,
    /// How often metrics are logged; zero disables the log line
    pub metrics_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            suspension_poll_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Shared bulk client, rebuilt after a transport failure closed it
pub struct BulkHandle {
    settings: BulkSettings,
    transport: Arc<dyn BulkTransport>,
    current: Mutex<BulkClient>,
    shut_down: AtomicBool,
}

impl BulkHandle {
    /// Create the handle and its first client
    pub fn new(settings: BulkSettings, transport: Arc<dyn BulkTransport>) -> Self {
        let client = BulkClient::new(settings.clone(), Arc::clone(&transport));
        Self {
            settings,
            transport,
            current: Mutex::new(client),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Current client; a closed one is replaced unless the handle was shut
    /// down
    pub fn client(&self) -> BulkClient {
        let mut current = self.current.lock();
        if current.is_closed() && !self.shut_down.load(Ordering::SeqCst) {
            warn!(
                cause = current.closed_cause().as_deref().unwrap_or("-"),
                "replacing closed bulk client"
            );
            let suspended = current.is_suspended();
            *current = BulkClient::new(self.settings.clone(), Arc::clone(&self.transport));
            if suspended {
                current.suspend();
            }
        }
        current.clone()
    }

    /// Shut the current client down; no replacement afterwards
    pub async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        let client = self.current.lock().clone();
        client.shutdown().await
    }
}

impl std::fmt::Debug for BulkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkHandle")
            .field("current", &*self.current.lock())
            .finish()
    }
}

/// Runs and failures of one task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    /// Task name
    pub name: String,
    /// Successful runs
    pub runs: u64,
    /// Failed runs, after retries
    pub failures: u64,
    /// Runs skipped because the task is disabled
    pub skipped: u64,
    /// Error of the last failed run
    pub last_error: Option<String>,
}

struct Job {
    runner: TaskRunner,
    done: oneshot::Sender<(TaskRunner, Result<RunOutcome>)>,
}

/// Runs the tasks of a registry
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<TaskRegistry>,
    factory: Arc<dyn ConnectionFactory>,
    state: StateTracker,
    bulk: Arc<BulkHandle>,
    lifecycle: Option<IndexLifecycle>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator
    pub fn new(
        settings: OrchestratorSettings,
        registry: Arc<TaskRegistry>,
        factory: Arc<dyn ConnectionFactory>,
        state: StateTracker,
        bulk: Arc<BulkHandle>,
    ) -> Self {
        Self {
            settings,
            registry,
            factory,
            state,
            bulk,
            lifecycle: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Manage target indexes around runs
    pub fn with_lifecycle(mut self, lifecycle: IndexLifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start all tasks in the background
    pub fn spawn(self) -> TaskGroup {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(self.run());
        TaskGroup { cancel, handle }
    }

    /// Run until every task terminated or the token fired
    ///
    /// One-shot tasks terminate after their run; recurring tasks only stop
    /// on cancellation.
    pub async fn run(self) -> Result<Vec<TaskReport>> {
        let definitions = self.registry.all();
        if definitions.is_empty() {
            return Err(Error::config("no tasks configured"));
        }
        info!(
            tasks = definitions.len(),
            concurrency = self.settings.concurrency,
            "orchestrator starting"
        );

        let reports = Arc::new(Mutex::new(BTreeMap::<String, TaskReport>::new()));
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers: Vec<JoinHandle<()>> = (0..self.settings.concurrency.max(1))
            .map(|id| tokio::spawn(worker(id, Arc::clone(&rx), Arc::clone(&self.bulk), self.cancel.clone())))
            .collect();

        let background = self.cancel.child_token();
        let timer = tokio::spawn(background_timer(
            self.settings.clone(),
            Arc::clone(&self.registry),
            self.state.clone(),
            Arc::clone(&self.bulk),
            background.clone(),
        ));

        let schedulers: Vec<JoinHandle<()>> = definitions
            .into_iter()
            .map(|def| {
                let mut runner = TaskRunner::new(Arc::clone(&def), Arc::clone(&self.factory), self.state.clone());
                if let Some(lifecycle) = &self.lifecycle {
                    runner = runner.with_lifecycle(lifecycle.clone());
                }
                tokio::spawn(scheduler(runner, tx.clone(), Arc::clone(&reports), self.cancel.clone()))
            })
            .collect();
        drop(tx);

        for result in join_all(schedulers).await {
            if let Err(e) = result {
                error!(error = %e, "task scheduler panicked");
            }
        }
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "worker panicked");
            }
        }
        background.cancel();
        if let Err(e) = timer.await {
            error!(error = %e, "background timer panicked");
        }

        if let Err(e) = self.bulk.shutdown().await {
            warn!(error = %e, "bulk client shutdown incomplete");
        }

        let reports: Vec<TaskReport> = reports.lock().values().cloned().collect();
        info!(tasks = reports.len(), "orchestrator stopped");
        Ok(reports)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("tasks", &self.registry.len())
            .finish()
    }
}

/// Handle on a running orchestrator
#[derive(Debug)]
pub struct TaskGroup {
    cancel: CancellationToken,
    handle: JoinHandle<Result<Vec<TaskReport>>>,
}

impl TaskGroup {
    /// Token that interrupts every run of the group
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Interrupt all runs and stop scheduling
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the group to stop
    pub async fn join(self) -> Result<Vec<TaskReport>> {
        self.handle
            .await
            .map_err(|e| Error::state(format!("orchestrator task failed: {}", e)))?
    }
}

async fn scheduler(
    mut runner: TaskRunner,
    queue: mpsc::UnboundedSender<Job>,
    reports: Arc<Mutex<BTreeMap<String, TaskReport>>>,
    cancel: CancellationToken,
) {
    let def = Arc::clone(runner.definition());
    reports.lock().insert(
        def.name.clone(),
        TaskReport {
            name: def.name.clone(),
            ..Default::default()
        },
    );
    let mut next = Utc::now();

    loop {
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !wait.is_zero() {
            debug!(task = %def.name, next = %next, "scheduled");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let started = Utc::now();
        let (done, finished) = oneshot::channel();
        if queue.send(Job { runner, done }).is_err() {
            warn!(task = %def.name, "run queue closed");
            return;
        }
        let result = match finished.await {
            Ok((returned, result)) => {
                runner = returned;
                result
            }
            Err(_) => {
                error!(task = %def.name, "worker dropped the run");
                return;
            }
        };

        {
            let mut reports = reports.lock();
            if let Some(report) = reports.get_mut(&def.name) {
                match &result {
                    Ok(outcome) if outcome.skipped => report.skipped += 1,
                    Ok(_) => report.runs += 1,
                    Err(e) => {
                        report.failures += 1;
                        report.last_error = Some(e.to_string());
                    }
                }
            }
        }
        match result {
            Err(e) if e.is_interrupted() => break,
            Err(e) => error!(task = %def.name, error = %e, "run failed"),
            Ok(_) => {}
        }

        let base = match def.schedule {
            Schedule::Interval(_) => started,
            _ => Utc::now(),
        };
        match def.schedule.next_after(base) {
            Some(at) => next = at,
            None => {
                debug!(task = %def.name, "terminated");
                break;
            }
        }
    }
    runner.close().await;
}

async fn worker(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    bulk: Arc<BulkHandle>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "worker started");
    loop {
        let job = { queue.lock().await.recv().await };
        let Some(Job { mut runner, done }) = job else { break };
        let result = runner.run(&bulk, &cancel).await;
        // The scheduler may have stopped waiting; nothing to do then.
        let _ = done.send((runner, result));
    }
    debug!(worker = id, "worker stopped");
}

async fn background_timer(
    settings: OrchestratorSettings,
    registry: Arc<TaskRegistry>,
    state: StateTracker,
    bulk: Arc<BulkHandle>,
    cancel: CancellationToken,
) {
    let mut poll = (!settings.suspension_poll_interval.is_zero())
        .then(|| tokio::time::interval(settings.suspension_poll_interval));
    let mut report = (!settings.metrics_interval.is_zero())
        .then(|| tokio::time::interval(settings.metrics_interval));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick(&mut poll) => poll_suspension(&registry, &state, &bulk).await,
            _ = tick(&mut report) => log_metrics(&bulk),
        }
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn poll_suspension(registry: &TaskRegistry, state: &StateTracker, bulk: &BulkHandle) {
    let mut suspended = false;
    for def in registry.all() {
        if state.is_suspended(&def.name, &def.task_type).await {
            suspended = true;
            break;
        }
    }
    let client = bulk.client();
    if suspended {
        client.suspend();
    } else {
        client.resume();
    }
}

fn log_metrics(bulk: &BulkHandle) {
    let stats = bulk.client().stats();
    info!(
        submitted = stats.actions_submitted,
        succeeded = stats.actions_succeeded,
        failed = stats.actions_failed,
        batches = stats.batches_sent,
        batches_failed = stats.batches_failed,
        batches_rejected = stats.batches_rejected,
        bytes = stats.bytes_sent,
        in_flight = stats.in_flight,
        "bulk metrics"
    );
}
