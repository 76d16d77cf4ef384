//! Row merger
//!
//! Folds the rows of a result set into documents. Consecutive rows sharing
//! the same `_id` form one row group and become one document, so a
//! one-to-many join can be flattened by a single query:
//!
//! ```text
//! _id | name   | tags
//! 1   | widget | red      ->  id 1: {"name": "widget", "tags": ["red", "blue"]}
//! 1   | widget | blue
//! 2   | gadget | NULL     ->  id 2: {"name": "gadget"}
//! ```
//!
//! Dotted column labels (`customer.name`) build nested objects. NULLs are
//! dropped. A row group that ends up with no fields is not emitted.

use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use tributary_rdbc::{Row, Value};

use crate::document::{Document, DocumentMeta, OpType};
use crate::error::Result;

/// Column holding the document id, also the row group boundary
pub const ID_COLUMN: &str = "_id";
const INDEX_COLUMN: &str = "_index";
const TYPE_COLUMN: &str = "_type";
const ROUTING_COLUMN: &str = "_routing";
const PARENT_COLUMN: &str = "_parent";
const OPTYPE_COLUMN: &str = "_optype";

/// Field tree of the document under construction
///
/// Leaves collect every distinct value seen for a key; a single value stays
/// scalar on output, several become an array.
#[derive(Debug, Default)]
struct Fields(Vec<(String, Node)>);

#[derive(Debug)]
enum Node {
    Values(Vec<JsonValue>),
    Object(Fields),
}

impl Fields {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn entry(&mut self, key: &str) -> Option<&mut Node> {
        self.0.iter_mut().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    fn insert(&mut self, path: &[&str], value: JsonValue) {
        let Some((head, rest)) = path.split_first() else {
            return;
        };

        if rest.is_empty() {
            match self.entry(head) {
                Some(Node::Values(values)) => {
                    if !values.contains(&value) {
                        values.push(value);
                    }
                }
                Some(Node::Object(_)) => {
                    debug!(field = %head, "scalar value collides with nested object, dropped");
                }
                None => self.0.push((head.to_string(), Node::Values(vec![value]))),
            }
            return;
        }

        if self.entry(head).is_none() {
            self.0.push((head.to_string(), Node::Object(Fields::default())));
        }
        match self.entry(head) {
            Some(Node::Object(child)) => child.insert(rest, value),
            _ => debug!(field = %head, "nested value collides with scalar, dropped"),
        }
    }

    fn into_json(self) -> Map<String, JsonValue> {
        self.0
            .into_iter()
            .filter_map(|(key, node)| {
                let value = match node {
                    Node::Values(mut values) if values.len() == 1 => values.pop()?,
                    Node::Values(values) => JsonValue::Array(values),
                    Node::Object(child) if child.is_empty() => return None,
                    Node::Object(child) => JsonValue::Object(child.into_json()),
                };
                Some((key, value))
            })
            .collect()
    }
}

#[derive(Debug)]
struct Pending {
    meta: DocumentMeta,
    fields: Fields,
}

/// Builds documents from a stream of result rows
///
/// Call [`begin`](Self::begin) once per result set, [`row`](Self::row) for
/// every row and [`end`](Self::end) when the cursor is exhausted. Each call
/// returns the document a row group boundary has just closed, if any.
#[derive(Debug)]
pub struct RowMerger {
    op: OpType,
    current: Option<Pending>,
    emitted: u64,
    skipped: u64,
}

impl RowMerger {
    /// Create a merger tagging every document with `op`
    pub fn new(op: OpType) -> Self {
        Self {
            op,
            current: None,
            emitted: 0,
            skipped: 0,
        }
    }

    /// Start a new result set
    pub fn begin(&mut self) {
        self.current = None;
    }

    /// Feed one row given as column labels and values
    ///
    /// Returns the previous document when this row starts a new row group.
    /// A value without a JSON representation fails the whole row; documents
    /// returned earlier are unaffected.
    pub fn row(&mut self, columns: &[String], values: &[Value]) -> Result<Option<Document>> {
        let mut meta = DocumentMeta::default();
        let mut fields: Vec<(&str, JsonValue)> = Vec::with_capacity(columns.len());

        for (column, value) in columns.iter().zip(values) {
            if value.is_null() {
                continue;
            }
            match control_column(column) {
                Some(ControlColumn::Id) => meta.id = value.to_key_string(),
                Some(ControlColumn::Index) => meta.index = value.to_key_string(),
                Some(ControlColumn::Type) => meta.doc_type = value.to_key_string(),
                Some(ControlColumn::Routing) => meta.routing = value.to_key_string(),
                Some(ControlColumn::Parent) => meta.parent = value.to_key_string(),
                Some(ControlColumn::OpType) => {}
                None => fields.push((column.as_str(), value.to_json()?)),
            }
        }

        let same_group = matches!(
            (&self.current, &meta.id),
            (Some(pending), Some(id)) if pending.meta.id.as_deref() == Some(id.as_str())
        );

        let closed = if same_group {
            None
        } else {
            let previous = self.current.take();
            self.current = Some(Pending {
                meta,
                fields: Fields::default(),
            });
            previous.and_then(|p| self.finish(p))
        };

        if let Some(pending) = self.current.as_mut() {
            for (column, value) in fields {
                let path: Vec<&str> = column.split('.').collect();
                pending.fields.insert(&path, value);
            }
        }

        Ok(closed)
    }

    /// Feed one row
    pub fn merge_row(&mut self, row: &Row) -> Result<Option<Document>> {
        self.row(row.columns(), row.values())
    }

    /// End of the result set, returns the last open document
    pub fn end(&mut self) -> Option<Document> {
        let pending = self.current.take()?;
        self.finish(pending)
    }

    /// Documents returned so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Row groups dropped because they carried no fields
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn finish(&mut self, pending: Pending) -> Option<Document> {
        // A delete only needs the id.
        let keep = !pending.fields.is_empty()
            || (self.op == OpType::Delete && pending.meta.id.is_some());
        if !keep {
            self.skipped += 1;
            return None;
        }
        self.emitted += 1;
        Some(Document::new(self.op, pending.meta, pending.fields.into_json()))
    }
}

enum ControlColumn {
    Id,
    Index,
    Type,
    Routing,
    Parent,
    OpType,
}

fn control_column(label: &str) -> Option<ControlColumn> {
    if !label.starts_with('_') {
        return None;
    }
    let label = label.to_ascii_lowercase();
    match label.as_str() {
        ID_COLUMN => Some(ControlColumn::Id),
        INDEX_COLUMN => Some(ControlColumn::Index),
        TYPE_COLUMN => Some(ControlColumn::Type),
        ROUTING_COLUMN => Some(ControlColumn::Routing),
        PARENT_COLUMN => Some(ControlColumn::Parent),
        OPTYPE_COLUMN => Some(ControlColumn::OpType),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn run(op: OpType, columns: &[&str], rows: Vec<Vec<Value>>) -> Vec<Document> {
        let columns = cols(columns);
        let mut merger = RowMerger::new(op);
        merger.begin();
        let mut docs = Vec::new();
        for values in rows {
            docs.extend(merger.row(&columns, &values).unwrap());
        }
        docs.extend(merger.end());
        docs
    }

    #[test]
    fn test_one_document_per_id() {
        let docs = run(
            OpType::Index,
            &["_id", "name"],
            vec![
                vec![Value::Int32(1), "a".into()],
                vec![Value::Int32(2), "b".into()],
            ],
        );
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id(), Some("1"));
        assert_eq!(docs[1].source()["name"], json!("b"));
        assert!(docs.iter().all(|d| d.op() == OpType::Index));
    }

    #[test]
    fn test_repeated_keys_collapse_into_array() {
        let docs = run(
            OpType::Index,
            &["_id", "name", "tag"],
            vec![
                vec![Value::Int32(1), "widget".into(), "red".into()],
                vec![Value::Int32(1), "widget".into(), "green".into()],
                vec![Value::Int32(1), "widget".into(), "blue".into()],
            ],
        );
        assert_eq!(docs.len(), 1);
        let source = docs[0].source();
        assert_eq!(source["name"], json!("widget"));
        assert_eq!(source["tag"], json!(["red", "green", "blue"]));
    }

    #[test]
    fn test_rows_without_id_are_separate_documents() {
        let docs = run(
            OpType::Index,
            &["name"],
            vec![vec!["a".into()], vec!["a".into()]],
        );
        assert_eq!(docs.len(), 2);
        assert!(docs[0].id().is_none());
    }

    #[test]
    fn test_all_null_row_not_emitted() {
        let mut merger = RowMerger::new(OpType::Index);
        let docs = run(
            OpType::Index,
            &["_id", "name"],
            vec![
                vec![Value::Null, Value::Null],
                vec![Value::Int32(2), "b".into()],
            ],
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id(), Some("2"));

        merger.begin();
        let none = merger
            .row(&cols(&["_id", "name"]), &[Value::Int32(3), Value::Null])
            .unwrap();
        assert!(none.is_none());
        assert!(merger.end().is_none());
        assert_eq!(merger.skipped(), 1);
    }

    #[test]
    fn test_delete_keeps_id_only_document() {
        let docs = run(OpType::Delete, &["_id"], vec![vec![Value::Int32(9)]]);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].op(), OpType::Delete);
        assert!(docs[0].is_empty());
    }

    #[test]
    fn test_control_columns_become_metadata() {
        let docs = run(
            OpType::Create,
            &["_id", "_index", "_routing", "_parent", "_type", "_optype", "title"],
            vec![vec![
                "k1".into(),
                "archive".into(),
                "r".into(),
                "p".into(),
                "doc".into(),
                "delete".into(),
                "t".into(),
            ]],
        );
        let doc = &docs[0];
        assert_eq!(doc.op(), OpType::Create);
        assert_eq!(doc.meta().index.as_deref(), Some("archive"));
        assert_eq!(doc.meta().routing.as_deref(), Some("r"));
        assert_eq!(doc.meta().parent.as_deref(), Some("p"));
        assert_eq!(doc.meta().doc_type.as_deref(), Some("doc"));
        assert_eq!(doc.source().len(), 1);
    }

    #[test]
    fn test_dotted_keys_nest() {
        let docs = run(
            OpType::Index,
            &["_id", "customer.name", "customer.city", "lines.sku"],
            vec![
                vec![Value::Int32(1), "Ann".into(), "Oslo".into(), "A".into()],
                vec![Value::Int32(1), "Ann".into(), "Oslo".into(), "B".into()],
            ],
        );
        assert_eq!(
            serde_json::Value::Object(docs[0].source().clone()),
            json!({
                "customer": {"name": "Ann", "city": "Oslo"},
                "lines": {"sku": ["A", "B"]}
            })
        );
    }

    #[test]
    fn test_non_finite_value_fails_row() {
        let mut merger = RowMerger::new(OpType::Index);
        merger.begin();
        let columns = cols(&["_id", "price"]);
        let first = merger
            .row(&columns, &[Value::Int32(1), Value::Float64(1.5)])
            .unwrap();
        assert!(first.is_none());

        let err = merger
            .row(&columns, &[Value::Int32(2), Value::Float64(f64::NAN)])
            .unwrap_err();
        assert!(err.to_string().contains("cannot convert"));
    }
}
