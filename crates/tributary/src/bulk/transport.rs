//! Index server seams
//!
//! [`BulkTransport`] carries bulk requests, [`IndexAdmin`] covers the index
//! lifecycle. The HTTP client in [`super::http`] implements both.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::action::{BulkRequest, BulkResponse};
use crate::error::{Error, Result};

/// Sends bulk requests
#[async_trait]
pub trait BulkTransport: Send + Sync {
    /// Send one request
    ///
    /// An `Err` means the request as a whole failed. Per-item failures are
    /// reported in the response.
    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse>;
}

/// Cluster health level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Some primary shards unassigned
    Red,
    /// All primaries assigned
    #[default]
    Yellow,
    /// All shards assigned
    Green,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Red => write!(f, "red"),
            Self::Yellow => write!(f, "yellow"),
            Self::Green => write!(f, "green"),
        }
    }
}

impl FromStr for HealthStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(Self::Red),
            "yellow" => Ok(Self::Yellow),
            "green" => Ok(Self::Green),
            other => Err(Error::IndexServer(format!("unknown health status: {}", other))),
        }
    }
}

/// Index administration
#[async_trait]
pub trait IndexAdmin: Send + Sync {
    /// Wait until the cluster reaches `status`, or fail after `timeout`
    async fn wait_for_health(&self, status: HealthStatus, timeout: Duration) -> Result<()>;

    /// Whether the index exists
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create an index with optional settings and mappings
    async fn create_index(
        &self,
        index: &str,
        settings: Option<&JsonValue>,
        mappings: Option<&JsonValue>,
    ) -> Result<()>;

    /// Current settings as a flat object (`{"index.refresh_interval": "1s"}`)
    async fn index_settings(&self, index: &str) -> Result<JsonValue>;

    /// Update dynamic settings given as a flat object
    async fn update_settings(&self, index: &str, settings: &JsonValue) -> Result<()>;

    /// Make recent writes searchable
    async fn refresh(&self, index: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_order() {
        assert!(HealthStatus::Green > HealthStatus::Yellow);
        assert!(HealthStatus::Yellow > HealthStatus::Red);
    }

    #[test]
    fn test_health_status_parse() {
        assert_eq!("GREEN".parse::<HealthStatus>().unwrap(), HealthStatus::Green);
        assert!("blue".parse::<HealthStatus>().is_err());
        assert_eq!(HealthStatus::default().to_string(), "yellow");
    }
}
