//! State store backed by documents in an index on the index server

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use super::store::{decode, suspended_patch, StateStore};
use super::{state_key, RunState};
use crate::error::Result;

/// Default index holding state documents
pub const DEFAULT_STATE_INDEX: &str = "_tributary";

/// Document calls the index-backed store needs
#[async_trait]
pub trait StateDocuments: Send + Sync {
    /// `_source` of a document, `None` when missing
    async fn get_document(&self, index: &str, id: &str) -> Result<Option<JsonValue>>;

    /// Partial update, creating the document when missing
    async fn upsert_partial(&self, index: &str, id: &str, patch: &JsonValue) -> Result<()>;

    /// `_source` of every document in the index
    async fn list_documents(&self, index: &str) -> Result<Vec<JsonValue>>;
}

/// [`StateStore`] over [`StateDocuments`]
#[derive(Clone)]
pub struct IndexStateStore {
    docs: Arc<dyn StateDocuments>,
    index: String,
}

impl IndexStateStore {
    /// Store states in `index`
    pub fn new(docs: Arc<dyn StateDocuments>, index: impl Into<String>) -> Self {
        Self {
            docs,
            index: index.into(),
        }
    }

    /// State index name
    pub fn index(&self) -> &str {
        &self.index
    }
}

impl std::fmt::Debug for IndexStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStateStore")
            .field("index", &self.index)
            .finish()
    }
}

#[async_trait]
impl StateStore for IndexStateStore {
    async fn load(&self, name: &str, task_type: &str) -> Result<Option<RunState>> {
        self.docs
            .get_document(&self.index, &state_key(name, task_type))
            .await?
            .map(decode)
            .transpose()
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        self.docs
            .upsert_partial(&self.index, &state.key(), &state.to_patch()?)
            .await
    }

    async fn set_suspended(&self, name: &str, task_type: &str, suspended: bool) -> Result<()> {
        self.docs
            .upsert_partial(
                &self.index,
                &state_key(name, task_type),
                &suspended_patch(name, task_type, suspended),
            )
            .await
    }

    async fn list(&self) -> Result<Vec<RunState>> {
        self.docs
            .list_documents(&self.index)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }
}
