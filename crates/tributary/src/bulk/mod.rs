//! Bulk ingest client
//!
//! Accumulates index/delete actions into batches and sends them to the index
//! server asynchronously. A batch goes out when it reaches
//! `max_bulk_actions` actions or `max_bulk_volume` bytes, or when the
//! background ticker finds it older than `flush_interval`.
//!
//! At most `max_concurrent_bulk_requests` batches are in flight. At the cap a
//! send waits for a free slot ([`OverflowPolicy::Block`]) or fails with
//! [`Error::Backpressure`] ([`OverflowPolicy::Reject`]).
//!
//! Per-item failures are counted and logged. A failure of a whole request
//! closes the client: every later operation fails with
//! [`Error::ClientClosed`] carrying the cause.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = BulkClient::new(BulkSettings::default(), Arc::new(http));
//! client.index(&doc).await?;
//! client.flush().await?;
//! client.wait_for_responses(Duration::from_secs(30)).await;
//! client.shutdown().await?;
//! ```

pub mod action;
pub mod http;
pub mod lifecycle;
pub mod transport;

pub use action::{BulkAction, BulkRequest, BulkResponse, ItemResult};
pub use http::{HttpIndexClient, HttpIndexConfig};
pub use lifecycle::{IndexLifecycle, SavedSettings};
pub use transport::{BulkTransport, HealthStatus, IndexAdmin};

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::document::{Document, OpType};
use crate::error::{Error, Result};
use crate::fetch::{DocumentSink, Submit};

/// What happens when all bulk request slots are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a free slot
    #[default]
    Block,
    /// Fail the send with a backpressure error
    Reject,
}

/// Bulk client configuration
#[derive(Debug, Clone)]
pub struct BulkSettings {
    /// Actions per batch
    pub max_bulk_actions: usize,
    /// Bytes per batch
    pub max_bulk_volume: usize,
    /// Batches in flight at once
    pub max_concurrent_bulk_requests: usize,
    /// Maximum age of a pending batch; zero disables the ticker
    pub flush_interval: Duration,
    /// Behavior at the in-flight cap
    pub overflow: OverflowPolicy,
    /// Pause applied to a submit while suspended
    pub suspend_wait: Duration,
    /// How long shutdown waits for outstanding responses
    pub shutdown_timeout: Duration,
    /// Index for documents without `_index`
    pub default_index: String,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            max_bulk_actions: 1000,
            max_bulk_volume: 10 * 1024 * 1024,
            max_concurrent_bulk_requests: 4,
            flush_interval: Duration::from_secs(5),
            overflow: OverflowPolicy::Block,
            suspend_wait: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            default_index: "tributary".to_string(),
        }
    }
}

/// Bulk client counters
#[derive(Debug, Default)]
pub struct AtomicBulkStats {
    actions_submitted: AtomicU64,
    actions_succeeded: AtomicU64,
    actions_failed: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    batches_rejected: AtomicU64,
    bytes_sent: AtomicU64,
    total_send_time_ms: AtomicU64,
}

impl AtomicBulkStats {
    fn record_response(&self, response: &BulkResponse, bytes: usize, duration: Duration) {
        let failed = response.failed() as u64;
        self.actions_succeeded
            .fetch_add(response.succeeded() as u64, Ordering::Relaxed);
        self.actions_failed.fetch_add(failed, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.total_send_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_batch_failure(&self, actions: u64) {
        self.actions_failed.fetch_add(actions, Ordering::Relaxed);
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self, actions: u64) {
        self.actions_failed.fetch_add(actions, Ordering::Relaxed);
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self, in_flight: usize) -> BulkStats {
        BulkStats {
            actions_submitted: self.actions_submitted.load(Ordering::Relaxed),
            actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            total_send_time_ms: self.total_send_time_ms.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

/// Point-in-time view of the bulk client counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkStats {
    /// Actions accepted into a batch
    pub actions_submitted: u64,
    /// Actions acknowledged by the server
    pub actions_succeeded: u64,
    /// Actions that failed, individually or with their batch
    pub actions_failed: u64,
    /// Batches that got a response
    pub batches_sent: u64,
    /// Batches whose request failed
    pub batches_failed: u64,
    /// Batches refused at the in-flight cap
    pub batches_rejected: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Accumulated request time
    pub total_send_time_ms: u64,
    /// Batches currently in flight
    pub in_flight: usize,
}

#[derive(Default)]
struct Batch {
    request: BulkRequest,
    opened: Option<Instant>,
    next_seq: u64,
}

/// A batch taken for sending, numbered in creation order
struct Pending {
    seq: u64,
    request: BulkRequest,
}

impl Batch {
    fn push(&mut self, action: BulkAction) {
        if self.request.is_empty() {
            self.opened = Some(Instant::now());
        }
        self.request.push(action);
    }

    fn is_full(&self, settings: &BulkSettings) -> bool {
        self.request.len() >= settings.max_bulk_actions
            || self.request.bytes() >= settings.max_bulk_volume
    }

    fn is_due(&self, max_age: Duration) -> bool {
        self.opened.is_some_and(|opened| opened.elapsed() >= max_age)
    }

    fn take(&mut self) -> Option<Pending> {
        self.opened = None;
        if self.request.is_empty() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(Pending {
            seq,
            request: std::mem::take(&mut self.request),
        })
    }
}

struct Inner {
    settings: BulkSettings,
    transport: Arc<dyn BulkTransport>,
    batch: Mutex<Batch>,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
    next_turn: AtomicU64,
    turn: Notify,
    closed: Mutex<Option<String>>,
    shut_down: AtomicBool,
    suspended: AtomicBool,
    stats: AtomicBulkStats,
    ticker: CancellationToken,
}

impl Inner {
    fn closed_cause(&self) -> Option<String> {
        self.closed.lock().clone()
    }

    fn close_with(&self, cause: String) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(cause);
        }
        self.ticker.cancel();
    }

    /// Take the pending batch; must be called with the batch lock held
    ///
    /// The batch counts as in flight from here on, so `wait_for_responses`
    /// cannot miss it between the lock and the dispatch.
    fn take_locked(&self, batch: &mut Batch) -> Option<Pending> {
        let pending = batch.take()?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(pending)
    }

    async fn wait_turn(&self, seq: u64) {
        loop {
            let notified = self.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.next_turn.load(Ordering::SeqCst) == seq {
                return;
            }
            notified.await;
        }
    }

    fn advance_turn(&self) {
        self.next_turn.fetch_add(1, Ordering::SeqCst);
        self.turn.notify_waiters();
    }

    /// Send a taken batch; batches claim slots and start in `seq` order
    async fn dispatch(self: &Arc<Self>, pending: Pending) -> Result<()> {
        let Pending { seq, request } = pending;
        let actions = request.len() as u64;

        self.wait_turn(seq).await;
        let acquired = self.acquire().await;
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => {
                self.advance_turn();
                self.stats.record_rejected(actions);
                counter!("tributary.bulk.batches.rejected").increment(1);
                self.release();
                return Err(e);
            }
        };

        let inner = Arc::clone(self);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            inner.send(request, started_tx).await;
            drop(permit);
            inner.release();
        });
        // The next batch may go once this one has reached the transport.
        let _ = started_rx.await;
        self.advance_turn();
        Ok(())
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match self.settings.overflow {
            OverflowPolicy::Block => Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| Error::client_closed("bulk request slots closed")),
            OverflowPolicy::Reject => {
                Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
                    Error::Backpressure(format!(
                        "{} bulk requests already in flight",
                        self.settings.max_concurrent_bulk_requests
                    ))
                })
            }
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        gauge!("tributary.bulk.in_flight").set(self.in_flight.load(Ordering::SeqCst) as f64);
    }

    async fn send(&self, request: BulkRequest, started_tx: tokio::sync::oneshot::Sender<()>) {
        let actions = request.len();
        let bytes = request.bytes();
        debug!(actions, bytes, "sending bulk request");
        let started = Instant::now();

        let mut response = self.transport.bulk(&request);
        let mut started_tx = Some(started_tx);
        let result = std::future::poll_fn(|cx| {
            let poll = response.as_mut().poll(cx);
            if let Some(tx) = started_tx.take() {
                let _ = tx.send(());
            }
            poll
        })
        .await;
        match result {
            Ok(response) => {
                let elapsed = started.elapsed();
                self.stats.record_response(&response, bytes, elapsed);
                counter!("tributary.bulk.batches.sent").increment(1);
                counter!("tributary.bulk.bytes").increment(bytes as u64);
                histogram!("tributary.bulk.send.duration_ms").record(elapsed.as_millis() as f64);
                histogram!("tributary.bulk.batch.actions").record(actions as f64);

                let failed = response.failed();
                if failed > 0 {
                    counter!("tributary.bulk.items.failed").increment(failed as u64);
                    for item in response.items.iter().filter(|i| i.is_failure()) {
                        warn!(
                            op = %item.op,
                            id = item.id.as_deref().unwrap_or("-"),
                            status = item.status,
                            error = item.error.as_deref().unwrap_or("-"),
                            "bulk item failed"
                        );
                    }
                }
                debug!(
                    actions,
                    failed,
                    took_ms = response.took_ms,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "bulk response"
                );
            }
            Err(e) => {
                self.stats.record_batch_failure(actions as u64);
                counter!("tributary.bulk.batches.failed").increment(1);
                error!(actions, error = %e, "bulk request failed, closing client");
                self.close_with(e.to_string());
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.ticker.cancel();
    }
}

/// Asynchronous batching client for the index server
///
/// Cheap to clone; clones share batches, slots and counters. Safe for
/// concurrent `index`/`delete` from several fetch workers. Must be created
/// inside a tokio runtime.
#[derive(Clone)]
pub struct BulkClient {
    inner: Arc<Inner>,
}

impl BulkClient {
    /// Create a client and start its flush ticker
    pub fn new(settings: BulkSettings, transport: Arc<dyn BulkTransport>) -> Self {
        let slots = settings.max_concurrent_bulk_requests.max(1);
        let inner = Arc::new(Inner {
            permits: Arc::new(Semaphore::new(slots)),
            settings,
            transport,
            batch: Mutex::new(Batch::default()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            next_turn: AtomicU64::new(0),
            turn: Notify::new(),
            closed: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            stats: AtomicBulkStats::default(),
            ticker: CancellationToken::new(),
        });

        if !inner.settings.flush_interval.is_zero() {
            spawn_ticker(Arc::downgrade(&inner), inner.ticker.clone(), inner.settings.flush_interval);
        }
        Self { inner }
    }

    /// Configuration
    pub fn settings(&self) -> &BulkSettings {
        &self.inner.settings
    }

    /// Submit a `create` or `index` document to the default index
    pub async fn index(&self, doc: &Document) -> Result<Submit> {
        if doc.op() == OpType::Delete {
            return Err(Error::invalid_document("delete document passed to index"));
        }
        self.add(doc, &self.inner.settings.default_index).await
    }

    /// Submit a `delete` document to the default index
    pub async fn delete(&self, doc: &Document) -> Result<Submit> {
        if doc.op() != OpType::Delete {
            return Err(Error::invalid_document(format!(
                "{} document passed to delete",
                doc.op()
            )));
        }
        self.add(doc, &self.inner.settings.default_index).await
    }

    /// A sink that sends documents without `_index` to `index`
    pub fn sink_for(&self, index: impl Into<String>) -> IndexSink {
        IndexSink {
            client: self.clone(),
            index: index.into(),
        }
    }

    async fn add(&self, doc: &Document, default_index: &str) -> Result<Submit> {
        if let Some(cause) = self.inner.closed_cause() {
            return Err(Error::client_closed(cause));
        }
        if self.is_suspended() {
            tokio::time::sleep(self.inner.settings.suspend_wait).await;
            return Ok(Submit::Suspended);
        }

        let action = match BulkAction::from_document(doc, default_index) {
            Ok(action) => action,
            Err(Error::InvalidDocument(reason)) => {
                warn!(op = %doc.op(), reason = %reason, "dropping document");
                self.inner.stats.actions_failed.fetch_add(1, Ordering::Relaxed);
                return Ok(Submit::Queued);
            }
            Err(e) => return Err(e),
        };

        self.inner
            .stats
            .actions_submitted
            .fetch_add(1, Ordering::Relaxed);
        counter!("tributary.bulk.actions.submitted", "op" => doc.op().as_str()).increment(1);

        let full = {
            let mut batch = self.inner.batch.lock();
            batch.push(action);
            if batch.is_full(&self.inner.settings) {
                self.inner.take_locked(&mut batch)
            } else {
                None
            }
        };
        if let Some(request) = full {
            self.inner.dispatch(request).await?;
        }
        Ok(Submit::Queued)
    }

    /// Send the pending batch, if any
    pub async fn flush(&self) -> Result<()> {
        if let Some(cause) = self.inner.closed_cause() {
            return Err(Error::client_closed(cause));
        }
        let pending = {
            let mut batch = self.inner.batch.lock();
            self.inner.take_locked(&mut batch)
        };
        match pending {
            Some(request) => self.inner.dispatch(request).await,
            None => Ok(()),
        }
    }

    /// Wait until no batch is in flight
    ///
    /// Returns `false` when `timeout` elapsed first.
    pub async fn wait_for_responses(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
    }

    /// Stop accepting documents until [`resume`](Self::resume)
    pub fn suspend(&self) {
        if !self.inner.suspended.swap(true, Ordering::SeqCst) {
            info!("bulk client suspended");
        }
    }

    /// Accept documents again
    pub fn resume(&self) {
        if self.inner.suspended.swap(false, Ordering::SeqCst) {
            info!("bulk client resumed");
        }
    }

    /// Whether the client is suspended
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    /// Batches taken for sending and not yet answered
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Why the client was closed, if it was
    pub fn closed_cause(&self) -> Option<String> {
        self.inner.closed_cause()
    }

    /// Whether the client was closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().is_some()
    }

    /// Flush, wait for outstanding responses and close
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flushed = if self.is_closed() {
            Ok(())
        } else {
            self.flush().await
        };
        let drained = self
            .wait_for_responses(self.inner.settings.shutdown_timeout)
            .await;
        if !drained {
            warn!(
                in_flight = self.inner.in_flight.load(Ordering::SeqCst),
                "bulk responses still outstanding at shutdown"
            );
        }
        self.inner.close_with("client shut down".to_string());

        let stats = self.stats();
        info!(
            submitted = stats.actions_submitted,
            succeeded = stats.actions_succeeded,
            failed = stats.actions_failed,
            batches = stats.batches_sent,
            "bulk client shut down"
        );
        flushed
    }

    /// Current counters
    pub fn stats(&self) -> BulkStats {
        self.inner
            .stats
            .snapshot(self.inner.in_flight.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for BulkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkClient")
            .field("settings", &self.inner.settings)
            .field("suspended", &self.is_suspended())
            .field("closed", &self.closed_cause())
            .finish()
    }
}

#[async_trait]
impl DocumentSink for BulkClient {
    async fn submit(&self, doc: &Document) -> Result<Submit> {
        self.add(doc, &self.inner.settings.default_index).await
    }
}

/// Bulk client view with a task-specific default index
#[derive(Clone, Debug)]
pub struct IndexSink {
    client: BulkClient,
    index: String,
}

impl IndexSink {
    /// Default index of this sink
    pub fn index(&self) -> &str {
        &self.index
    }
}

#[async_trait]
impl DocumentSink for IndexSink {
    async fn submit(&self, doc: &Document) -> Result<Submit> {
        self.client.add(doc, &self.index).await
    }
}

fn spawn_ticker(weak: Weak<Inner>, token: CancellationToken, max_age: Duration) {
    let period = (max_age / 4).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            let due = {
                let mut batch = inner.batch.lock();
                if batch.is_due(max_age) {
                    inner.take_locked(&mut batch)
                } else {
                    None
                }
            };
            if let Some(pending) = due {
                debug!(actions = pending.request.len(), "flush interval elapsed");
                if let Err(e) = inner.dispatch(pending).await {
                    warn!(error = %e, "interval flush failed");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentMeta;
    use crate::testing::RecordingTransport;
    use serde_json::{json, Map};

    fn doc(op: OpType, id: &str) -> Document {
        let meta = DocumentMeta {
            id: Some(id.to_string()),
            ..Default::default()
        };
        let mut source = Map::new();
        source.insert("n".into(), json!(id));
        Document::new(op, meta, source)
    }

    fn settings(max_actions: usize) -> BulkSettings {
        BulkSettings {
            max_bulk_actions: max_actions,
            flush_interval: Duration::ZERO,
            suspend_wait: Duration::from_millis(5),
            default_index: "test".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_volume_threshold_sends_batch() {
        let transport = Arc::new(RecordingTransport::new());
        let mut s = settings(1000);
        s.max_bulk_volume = 1;
        let client = BulkClient::new(s, transport.clone());

        client.index(&doc(OpType::Index, "1")).await.unwrap();
        assert!(client.wait_for_responses(Duration::from_secs(5)).await);
        assert_eq!(transport.batch_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_op_mismatch_rejected() {
        let client = BulkClient::new(settings(10), Arc::new(RecordingTransport::new()));
        assert!(client.index(&doc(OpType::Delete, "1")).await.is_err());
        assert!(client.delete(&doc(OpType::Create, "1")).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_interval_sends_pending() {
        let transport = Arc::new(RecordingTransport::new());
        let mut s = settings(1000);
        s.flush_interval = Duration::from_millis(40);
        let client = BulkClient::new(s, transport.clone());

        client.index(&doc(OpType::Create, "1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.wait_for_responses(Duration::from_secs(5)).await);
        assert_eq!(transport.batch_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_reject_policy_at_capacity() {
        let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(300)));
        let mut s = settings(1);
        s.max_concurrent_bulk_requests = 1;
        s.overflow = OverflowPolicy::Reject;
        let client = BulkClient::new(s, transport);

        client.index(&doc(OpType::Index, "1")).await.unwrap();
        let err = client.index(&doc(OpType::Index, "2")).await.unwrap_err();
        assert!(matches!(err, Error::Backpressure(_)));
        assert_eq!(client.stats().batches_rejected, 1);
        assert!(client.wait_for_responses(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_index_sink_uses_its_index() {
        let transport = Arc::new(RecordingTransport::new());
        let client = BulkClient::new(settings(1), transport.clone());
        let sink = client.sink_for("products");

        sink.submit(&doc(OpType::Index, "1")).await.unwrap();
        assert!(client.wait_for_responses(Duration::from_secs(5)).await);
        let batches = transport.batches();
        assert_eq!(batches[0].actions()[0].index(), "products");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let transport = Arc::new(RecordingTransport::new());
        let client = BulkClient::new(settings(10), transport.clone());
        client.index(&doc(OpType::Index, "1")).await.unwrap();

        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(transport.batch_sizes(), vec![1]);
        assert!(matches!(
            client.index(&doc(OpType::Index, "2")).await,
            Err(Error::ClientClosed { .. })
        ));
    }
}
