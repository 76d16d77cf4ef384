//! Target index lifecycle around a run
//!
//! Before a run: wait for cluster health, create the index when missing and,
//! with bulk-mode tuning, switch off refresh and replicas. After a run: put
//! the saved settings back and refresh.
//!
//! Bulk mode is counted per index. Tasks sharing an index enter it once; the
//! settings seen by the first task are restored when the last one finishes.

use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::transport::{HealthStatus, IndexAdmin};
use crate::error::Result;

const REFRESH_INTERVAL: &str = "index.refresh_interval";
const NUMBER_OF_REPLICAS: &str = "index.number_of_replicas";

/// Index settings saved before bulk-mode tuning
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedSettings {
    /// Previous `index.refresh_interval`, `None` when it was unset
    pub refresh_interval: Option<JsonValue>,
    /// Previous `index.number_of_replicas`, `None` when it was unset
    pub number_of_replicas: Option<JsonValue>,
}

struct BulkMode {
    runs: usize,
    saved: SavedSettings,
}

/// Prepares and finishes the target index of a task
///
/// Clones share the bulk-mode bookkeeping.
#[derive(Clone)]
pub struct IndexLifecycle {
    admin: Arc<dyn IndexAdmin>,
    wait_for_status: HealthStatus,
    health_timeout: Duration,
    bulk_mode: Arc<Mutex<HashMap<String, BulkMode>>>,
}

impl IndexLifecycle {
    /// Create a lifecycle helper
    pub fn new(admin: Arc<dyn IndexAdmin>, wait_for_status: HealthStatus, health_timeout: Duration) -> Self {
        Self {
            admin,
            wait_for_status,
            health_timeout,
            bulk_mode: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the index ready for a run
    ///
    /// Returns the settings to restore in [`finish`](Self::finish) when
    /// `bulk_mode` tuning was applied.
    pub async fn prepare(
        &self,
        index: &str,
        settings: Option<&JsonValue>,
        mappings: Option<&JsonValue>,
        bulk_mode: bool,
    ) -> Result<Option<SavedSettings>> {
        self.admin
            .wait_for_health(self.wait_for_status, self.health_timeout)
            .await?;

        if !self.admin.index_exists(index).await? {
            info!(index, "creating index");
            self.admin.create_index(index, settings, mappings).await?;
        }

        if !bulk_mode {
            return Ok(None);
        }

        let mut tuned = self.bulk_mode.lock().await;
        if let Some(entry) = tuned.get_mut(index) {
            entry.runs += 1;
            debug!(index, runs = entry.runs, "index already in bulk mode");
            return Ok(Some(entry.saved.clone()));
        }

        let current = self.admin.index_settings(index).await?;
        let saved = SavedSettings {
            refresh_interval: current.get(REFRESH_INTERVAL).cloned(),
            number_of_replicas: current.get(NUMBER_OF_REPLICAS).cloned(),
        };
        debug!(index, ?saved, "entering bulk mode");
        self.admin
            .update_settings(
                index,
                &json!({ REFRESH_INTERVAL: "-1", NUMBER_OF_REPLICAS: 0 }),
            )
            .await?;
        tuned.insert(
            index.to_string(),
            BulkMode {
                runs: 1,
                saved: saved.clone(),
            },
        );
        Ok(Some(saved))
    }

    /// Leave bulk mode, if `prepare` entered it, and refresh
    ///
    /// Settings are restored only when no other run still holds the index
    /// in bulk mode.
    pub async fn finish(&self, index: &str, saved: Option<&SavedSettings>) -> Result<()> {
        if saved.is_some() {
            self.leave_bulk_mode(index).await?;
        }
        self.admin.refresh(index).await
    }

    async fn leave_bulk_mode(&self, index: &str) -> Result<()> {
        let mut tuned = self.bulk_mode.lock().await;
        let Some(entry) = tuned.get_mut(index) else {
            return Ok(());
        };
        entry.runs -= 1;
        if entry.runs > 0 {
            debug!(index, runs = entry.runs, "index stays in bulk mode");
            return Ok(());
        }
        if let Some(BulkMode { saved, .. }) = tuned.remove(index) {
            let mut restore = Map::new();
            restore.insert(
                REFRESH_INTERVAL.into(),
                saved.refresh_interval.unwrap_or(JsonValue::Null),
            );
            restore.insert(
                NUMBER_OF_REPLICAS.into(),
                saved.number_of_replicas.unwrap_or(JsonValue::Null),
            );
            debug!(index, "leaving bulk mode");
            self.admin
                .update_settings(index, &JsonValue::Object(restore))
                .await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for IndexLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexLifecycle")
            .field("wait_for_status", &self.wait_for_status)
            .field("health_timeout", &self.health_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryIndexServer;

    #[tokio::test]
    async fn test_prepare_creates_missing_index() {
        let server = Arc::new(MemoryIndexServer::new());
        let lifecycle = IndexLifecycle::new(server.clone(), HealthStatus::Yellow, Duration::from_secs(1));

        let saved = lifecycle
            .prepare("products", None, Some(&json!({"properties": {}})), false)
            .await
            .unwrap();
        assert!(saved.is_none());
        assert!(server.index_exists("products").await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_mode_saves_and_restores() {
        let server = Arc::new(MemoryIndexServer::new());
        server
            .create_index("products", Some(&json!({REFRESH_INTERVAL: "5s"})), None)
            .await
            .unwrap();
        let lifecycle = IndexLifecycle::new(server.clone(), HealthStatus::Green, Duration::from_secs(1));

        let saved = lifecycle.prepare("products", None, None, true).await.unwrap();
        let during = server.index_settings("products").await.unwrap();
        assert_eq!(during[REFRESH_INTERVAL], json!("-1"));
        assert_eq!(during[NUMBER_OF_REPLICAS], json!(0));

        lifecycle.finish("products", saved.as_ref()).await.unwrap();
        let after = server.index_settings("products").await.unwrap();
        assert_eq!(after[REFRESH_INTERVAL], json!("5s"));
        assert!(after.get(NUMBER_OF_REPLICAS).is_none());
        assert_eq!(server.refresh_count("products"), 1);
    }

    #[tokio::test]
    async fn test_shared_index_restored_by_last_run() {
        let server = Arc::new(MemoryIndexServer::new());
        server
            .create_index("products", Some(&json!({REFRESH_INTERVAL: "5s"})), None)
            .await
            .unwrap();
        let first = IndexLifecycle::new(server.clone(), HealthStatus::Green, Duration::from_secs(1));
        let second = first.clone();

        let a = first.prepare("products", None, None, true).await.unwrap();
        let b = second.prepare("products", None, None, true).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(b.as_ref().and_then(|s| s.refresh_interval.clone()), Some(json!("5s")));

        first.finish("products", a.as_ref()).await.unwrap();
        let during = server.index_settings("products").await.unwrap();
        assert_eq!(during[REFRESH_INTERVAL], json!("-1"));

        second.finish("products", b.as_ref()).await.unwrap();
        let after = server.index_settings("products").await.unwrap();
        assert_eq!(after[REFRESH_INTERVAL], json!("5s"));
        assert!(after.get(NUMBER_OF_REPLICAS).is_none());
    }
}
