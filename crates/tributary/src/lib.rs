//! tributary - Incremental relational-to-search-index feeder
//!
//! Reads rows from a relational database with SQL statements, folds them
//! into JSON documents and writes them to a search index server through its
//! bulk API. Runs are tracked so each one only picks up what changed since
//! the previous one.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   rows   ┌─────────────┐  documents  ┌─────────────┐  NDJSON  ┌──────────────┐
//! │  Database  │────────▶│ FetchEngine │────────────▶│ BulkClient  │────────▶│ Index server │
//! │ (postgres) │          │ planner +   │             │ batches,    │          │   _bulk      │
//! └────────────┘          │ row merger  │             │ backpressure│          └──────────────┘
//!                         └─────────────┘             └─────────────┘
//!                                ▲
//!                   ┌────────────┴────────────┐
//!                   │ Orchestrator            │◀── StateTracker (RunState)
//!                   │ schedules, retries      │
//!                   └─────────────────────────┘
//! ```
//!
//! # Library usage
//!
//! ```rust,ignore
//! use tributary::prelude::*;
//!
//! let config = TributaryConfig::from_file("tributary.yaml")?;
//! let registry = Arc::new(config.registry(false)?);
//! let http = Arc::new(HttpIndexClient::new(&config.index_server.http_config())?);
//! let bulk = Arc::new(BulkHandle::new(config.index_server.bulk.settings("tributary"), http.clone()));
//! let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
//!
//! let reports = Orchestrator::new(config.settings.orchestrator(), registry, factory, state, bulk)
//!     .run()
//!     .await?;
//! ```
//!
//! # CLI usage
//!
//! ```bash
//! # Run all tasks on their schedules
//! tributary -c tributary.yaml
//!
//! # Run every task once and exit
//! tributary -c tributary.yaml once
//!
//! # Pause and resume writes of a task
//! tributary -c tributary.yaml suspend products
//! tributary -c tributary.yaml resume products
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bulk;
pub mod config;
pub mod document;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod orchestrator;
pub mod planner;
pub mod sql;
pub mod state;
pub mod testing;
pub mod types;

pub use error::{Error, Result};
pub use types::SensitiveString;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bulk::{
        BulkClient, BulkSettings, BulkStats, BulkTransport, HealthStatus, HttpIndexClient,
        IndexAdmin, IndexLifecycle, OverflowPolicy,
    };
    pub use crate::config::TributaryConfig;
    pub use crate::document::{Document, DocumentMeta, OpType};
    pub use crate::error::{Error, Result};
    pub use crate::fetch::{DocumentSink, FetchEngine, FetchSettings, Strategy, Submit};
    pub use crate::merge::RowMerger;
    pub use crate::orchestrator::{
        BulkHandle, Orchestrator, OrchestratorSettings, Registration, Schedule, TaskDefinition,
        TaskGroup, TaskRegistry,
    };
    pub use crate::planner::{ChangeColumns, Planner};
    pub use crate::sql::{SqlCommand, SqlParameter};
    pub use crate::state::{IndexStateStore, MemoryStateStore, RunState, StateStore, StateTracker};
    pub use crate::types::SensitiveString;
    pub use std::sync::Arc;
}
