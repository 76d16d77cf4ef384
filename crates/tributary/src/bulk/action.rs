//! Bulk actions and responses in the NDJSON `_bulk` format
//!
//! Every action is one metadata line, followed by a source line for
//! `create` and `index`:
//!
//! ```text
//! {"create":{"_index":"products","_id":"1"}}
//! {"name":"widget"}
//! {"delete":{"_index":"products","_id":"2"}}
//! ```

use serde_json::{Map, Value as JsonValue};

use crate::document::{Document, OpType};
use crate::error::{Error, Result};

/// One bulk operation, already rendered to its NDJSON lines
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    op: OpType,
    index: String,
    id: Option<String>,
    lines: String,
}

impl BulkAction {
    /// Render a document; `default_index` applies when it has no `_index`
    pub fn from_document(doc: &Document, default_index: &str) -> Result<Self> {
        let meta = doc.meta();
        let index = doc.index_or(default_index).to_string();

        let mut header = Map::new();
        header.insert("_index".into(), JsonValue::String(index.clone()));
        if let Some(id) = &meta.id {
            header.insert("_id".into(), JsonValue::String(id.clone()));
        }
        if let Some(doc_type) = &meta.doc_type {
            header.insert("_type".into(), JsonValue::String(doc_type.clone()));
        }
        if let Some(routing) = &meta.routing {
            header.insert("routing".into(), JsonValue::String(routing.clone()));
        }
        if let Some(parent) = &meta.parent {
            header.insert("parent".into(), JsonValue::String(parent.clone()));
        }

        if doc.op() == OpType::Delete && meta.id.is_none() {
            return Err(Error::invalid_document("delete action requires an _id"));
        }

        let mut action = Map::new();
        action.insert(doc.op().as_str().into(), JsonValue::Object(header));
        let mut lines = serde_json::to_string(&action)?;
        lines.push('\n');
        if doc.op() != OpType::Delete {
            lines.push_str(&serde_json::to_string(doc.source())?);
            lines.push('\n');
        }

        Ok(Self {
            op: doc.op(),
            index,
            id: meta.id.clone(),
            lines,
        })
    }

    /// Operation type
    pub fn op(&self) -> OpType {
        self.op
    }

    /// Target index
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Document id
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Rendered NDJSON lines, newline terminated
    pub fn lines(&self) -> &str {
        &self.lines
    }

    /// Size on the wire in bytes
    pub fn size(&self) -> usize {
        self.lines.len()
    }
}

/// A batch of actions sent as one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkRequest {
    actions: Vec<BulkAction>,
    bytes: usize,
}

impl BulkRequest {
    /// Empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action
    pub fn push(&mut self, action: BulkAction) {
        self.bytes += action.size();
        self.actions.push(action);
    }

    /// Actions in insertion order
    pub fn actions(&self) -> &[BulkAction] {
        &self.actions
    }

    /// Number of actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the request holds no actions
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Payload size in bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// NDJSON request body
    pub fn body(&self) -> String {
        let mut body = String::with_capacity(self.bytes);
        for action in &self.actions {
            body.push_str(action.lines());
        }
        body
    }
}

/// Result of one action in a bulk response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    /// Operation name as returned by the server
    pub op: String,
    /// Document id
    pub id: Option<String>,
    /// HTTP-style status of the item
    pub status: u16,
    /// Error reason for failed items
    pub error: Option<String>,
}

impl ItemResult {
    /// Whether the item failed
    ///
    /// A delete of a missing document is not a failure.
    pub fn is_failure(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        self.status >= 300 && !(self.op == "delete" && self.status == 404)
    }
}

/// Parsed bulk response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    /// Server-side processing time
    pub took_ms: u64,
    /// Per-item results in request order
    pub items: Vec<ItemResult>,
}

impl BulkResponse {
    /// Response where every action succeeded
    pub fn success(request: &BulkRequest) -> Self {
        Self {
            took_ms: 0,
            items: request
                .actions()
                .iter()
                .map(|a| ItemResult {
                    op: a.op().as_str().to_string(),
                    id: a.id().map(String::from),
                    status: if a.op() == OpType::Index { 200 } else { 201 },
                    error: None,
                })
                .collect(),
        }
    }

    /// Parse the JSON body of a `_bulk` response
    pub fn from_json(body: &JsonValue) -> Result<Self> {
        let items = body
            .get("items")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| Error::transport("bulk response without items"))?;

        let items = items.iter().map(parse_item).collect();

        Ok(Self {
            took_ms: body.get("took").and_then(JsonValue::as_u64).unwrap_or(0),
            items,
        })
    }

    /// Number of failed items
    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.is_failure()).count()
    }

    /// Number of successful items
    pub fn succeeded(&self) -> usize {
        self.items.len() - self.failed()
    }
}

/// One `items` entry; an entry of unexpected shape counts as a failed item
fn parse_item(item: &JsonValue) -> ItemResult {
    let Some((op, result)) = item.as_object().and_then(|o| o.iter().next()) else {
        return ItemResult {
            op: "unknown".to_string(),
            id: None,
            status: 500,
            error: Some(format!("malformed bulk item: {}", item)),
        };
    };
    ItemResult {
        op: op.clone(),
        id: result.get("_id").and_then(JsonValue::as_str).map(String::from),
        status: result
            .get("status")
            .and_then(JsonValue::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500),
        error: result.get("error").map(|e| match e.get("reason") {
            Some(JsonValue::String(reason)) => reason.clone(),
            _ => e.to_string(),
        }),
    }
}
