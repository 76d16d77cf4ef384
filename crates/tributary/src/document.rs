//! Documents produced from result rows
//!
//! A [`Document`] is a JSON source object plus the metadata taken from the
//! control columns of its row group. The operation type is fixed when the
//! document is built.

use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Bulk operation a document is submitted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    /// Index only if absent (`op_type=create`)
    Create,
    /// Index, overwriting an existing document
    Index,
    /// Delete by id
    Delete,
}

impl OpType {
    /// Name used in bulk action lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Index => "index",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried by the control columns `_index`, `_type`, `_id`,
/// `_routing` and `_parent`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMeta {
    /// Target index, overrides the task's index
    pub index: Option<String>,
    /// Mapping type (legacy servers only)
    pub doc_type: Option<String>,
    /// Document id
    pub id: Option<String>,
    /// Shard routing key
    pub routing: Option<String>,
    /// Parent document id
    pub parent: Option<String>,
}

/// A document ready to be submitted to the index server
#[derive(Debug, Clone)]
pub struct Document {
    op: OpType,
    meta: DocumentMeta,
    source: Map<String, JsonValue>,
}

impl Document {
    /// Create a document with its operation type
    pub fn new(op: OpType, meta: DocumentMeta, source: Map<String, JsonValue>) -> Self {
        Self { op, meta, source }
    }

    /// Operation type
    #[inline]
    pub fn op(&self) -> OpType {
        self.op
    }

    /// Metadata from control columns
    #[inline]
    pub fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    /// Document id, if any
    pub fn id(&self) -> Option<&str> {
        self.meta.id.as_deref()
    }

    /// JSON source object
    #[inline]
    pub fn source(&self) -> &Map<String, JsonValue> {
        &self.source
    }

    /// Whether the document carries no source fields
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Index this document is written to, given the task's default index
    pub fn index_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.meta.index.as_deref().unwrap_or(default)
    }
}

/// Documents are identified by (`_index`, `_id`); documents without an id
/// compare by content
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        match (&self.meta.id, &other.meta.id) {
            (Some(a), Some(b)) => a == b && self.meta.index == other.meta.index,
            (None, None) => self.meta == other.meta && self.source == other.source,
            _ => false,
        }
    }
}
