//! Change-detection query planner
//!
//! Turns one configured statement into up to three queries, one per
//! operation, each restricted to the rows that changed since the watermark:
//!
//! | op       | condition                                         | params |
//! |----------|---------------------------------------------------|--------|
//! | `create` | `C >= ?` [`AND D IS NULL`]                        | 1      |
//! | `index`  | `U >= ? AND (C IS NULL OR C < ?)` [`AND D IS NULL`] | 2    |
//! | `delete` | `D >= ?`                                          | 1      |
//!
//! `C`, `U` and `D` are the created, updated and deleted timestamp columns.
//! A row created after the watermark and updated again is only picked up by
//! the `create` query, so it is never counted twice.

use chrono::{DateTime, Utc};
use tributary_rdbc::dialect::quote_identifier;
use tributary_rdbc::Value;

use crate::document::OpType;
use crate::error::{Error, Result};
use crate::sql::{inject_where, BoundCommand};

/// Timestamp columns used for change detection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeColumns {
    /// Row creation timestamp
    pub created: Option<String>,
    /// Last modification timestamp
    pub updated: Option<String>,
    /// Soft-delete timestamp
    pub deleted: Option<String>,
}

impl ChangeColumns {
    /// Whether any column is configured
    pub fn is_empty(&self) -> bool {
        self.created.is_none() && self.updated.is_none() && self.deleted.is_none()
    }
}

/// How timestamp comparisons are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonStyle {
    /// `col >= ?`
    #[default]
    Direct,
    /// `{fn TIMESTAMPDIFF(SQL_TSI_SECOND, ?, col)} >= 0`
    TimestampDiff,
}

/// One detected operation: its type, condition and watermark parameter count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpInfo {
    /// Operation documents are tagged with
    pub op: OpType,
    /// Condition to inject
    pub fragment: String,
    /// Number of watermark placeholders in the fragment
    pub params: usize,
}

/// A query ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedQuery {
    /// Operation documents are tagged with
    pub op: OpType,
    /// Statement text
    pub sql: String,
    /// Positional values
    pub params: Vec<Value>,
}

/// Builds the create / index / delete queries of a statement
#[derive(Debug, Clone)]
pub struct Planner {
    ops: Vec<OpInfo>,
}

impl Planner {
    /// Create a planner
    ///
    /// `quote` is the identifier quote string, empty to leave column names
    /// as written.
    pub fn new(columns: &ChangeColumns, quote: &str, style: ComparisonStyle) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::config(
                "column strategy needs at least one of created_at, updated_at, deleted_at",
            ));
        }
        let q = |c: &String| quote_identifier(c, quote);
        let created = columns.created.as_ref().map(q);
        let updated = columns.updated.as_ref().map(q);
        let deleted = columns.deleted.as_ref().map(q);

        let ge = |col: &str| match style {
            ComparisonStyle::Direct => format!("{} >= ?", col),
            ComparisonStyle::TimestampDiff => {
                format!("{{fn TIMESTAMPDIFF(SQL_TSI_SECOND, ?, {})}} >= 0", col)
            }
        };
        let lt = |col: &str| match style {
            ComparisonStyle::Direct => format!("{} < ?", col),
            ComparisonStyle::TimestampDiff => {
                format!("{{fn TIMESTAMPDIFF(SQL_TSI_SECOND, ?, {})}} < 0", col)
            }
        };
        let not_deleted = deleted
            .as_ref()
            .map(|d| format!(" AND {} IS NULL", d))
            .unwrap_or_default();

        let mut ops = Vec::with_capacity(3);
        if let Some(c) = &created {
            ops.push(OpInfo {
                op: OpType::Create,
                fragment: format!("{}{}", ge(c), not_deleted),
                params: 1,
            });
        }
        if let Some(u) = &updated {
            let (fragment, params) = match &created {
                Some(c) => (format!("{} AND ({} IS NULL OR {})", ge(u), c, lt(c)), 2),
                None => (ge(u), 1),
            };
            ops.push(OpInfo {
                op: OpType::Index,
                fragment: format!("{}{}", fragment, not_deleted),
                params,
            });
        }
        if let Some(d) = &deleted {
            ops.push(OpInfo {
                op: OpType::Delete,
                fragment: ge(d),
                params: 1,
            });
        }
        Ok(Self { ops })
    }

    /// Operations in execution order
    pub fn ops(&self) -> &[OpInfo] {
        &self.ops
    }

    /// Plan the queries of one statement against `watermark`
    ///
    /// The watermark values are bound where the condition lands; the
    /// statement's own parameters keep their relative positions around it.
    pub fn plan(&self, command: &BoundCommand, watermark: DateTime<Utc>) -> Vec<PlannedQuery> {
        self.ops
            .iter()
            .map(|info| {
                let injected = inject_where(&command.sql, &info.fragment);
                let offset = injected.param_offset.min(command.params.len());
                let mut params = Vec::with_capacity(command.params.len() + info.params);
                params.extend_from_slice(&command.params[..offset]);
                params.extend(std::iter::repeat(Value::DateTimeTz(watermark)).take(info.params));
                params.extend_from_slice(&command.params[offset..]);
                PlannedQuery {
                    op: info.op,
                    sql: injected.sql,
                    params,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn all_columns() -> ChangeColumns {
        ChangeColumns {
            created: Some("created_at".into()),
            updated: Some("updated_at".into()),
            deleted: Some("deleted_at".into()),
        }
    }

    #[test]
    fn test_fragments_with_all_columns() {
        let planner = Planner::new(&all_columns(), "\"", ComparisonStyle::Direct).unwrap();
        let ops = planner.ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].op, OpType::Create);
        assert_eq!(
            ops[0].fragment,
            "\"created_at\" >= ? AND \"deleted_at\" IS NULL"
        );
        assert_eq!(ops[1].op, OpType::Index);
        assert_eq!(
            ops[1].fragment,
            "\"updated_at\" >= ? AND (\"created_at\" IS NULL OR \"created_at\" < ?) AND \"deleted_at\" IS NULL"
        );
        assert_eq!(ops[1].params, 2);
        assert_eq!(ops[2].op, OpType::Delete);
        assert_eq!(ops[2].fragment, "\"deleted_at\" >= ?");
    }

    #[test]
    fn test_updated_only_degenerates() {
        let columns = ChangeColumns {
            updated: Some("mtime".into()),
            ..Default::default()
        };
        let planner = Planner::new(&columns, "", ComparisonStyle::Direct).unwrap();
        assert_eq!(planner.ops().len(), 1);
        assert_eq!(planner.ops()[0].fragment, "mtime >= ?");
        assert_eq!(planner.ops()[0].params, 1);
    }

    #[test]
    fn test_timestampdiff_style() {
        let columns = ChangeColumns {
            created: Some("c".into()),
            updated: Some("u".into()),
            ..Default::default()
        };
        let planner = Planner::new(&columns, "", ComparisonStyle::TimestampDiff).unwrap();
        assert_eq!(
            planner.ops()[0].fragment,
            "{fn TIMESTAMPDIFF(SQL_TSI_SECOND, ?, c)} >= 0"
        );
        assert_eq!(
            planner.ops()[1].fragment,
            "{fn TIMESTAMPDIFF(SQL_TSI_SECOND, ?, u)} >= 0 AND (c IS NULL OR {fn TIMESTAMPDIFF(SQL_TSI_SECOND, ?, c)} < 0)"
        );
    }

    #[test]
    fn test_no_columns_is_config_error() {
        let err = Planner::new(&ChangeColumns::default(), "\"", ComparisonStyle::Direct)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_watermark_bound_at_injection_point() {
        let planner = Planner::new(&all_columns(), "", ComparisonStyle::Direct).unwrap();
        let watermark = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let command = BoundCommand {
            sql: "SELECT id AS _id FROM t WHERE shop = ? AND $where".into(),
            params: vec![Value::Int64(42)],
        };

        let queries = planner.plan(&command, watermark);
        assert_eq!(queries.len(), 3);

        let index = &queries[1];
        assert_eq!(index.op, OpType::Index);
        assert_eq!(
            index.params,
            vec![
                Value::Int64(42),
                Value::DateTimeTz(watermark),
                Value::DateTimeTz(watermark),
            ]
        );
        assert!(index.sql.starts_with("SELECT id AS _id FROM t WHERE shop = ? AND (updated_at >= ?"));
    }

    #[test]
    fn test_watermark_first_when_condition_leads() {
        let planner = Planner::new(&all_columns(), "", ComparisonStyle::Direct).unwrap();
        let watermark = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let command = BoundCommand {
            sql: "SELECT id AS _id FROM t WHERE shop = ?".into(),
            params: vec![Value::Int64(42)],
        };

        let create = &planner.plan(&command, watermark)[0];
        assert_eq!(
            create.sql,
            "SELECT id AS _id FROM t WHERE (created_at >= ? AND deleted_at IS NULL) AND (shop = ?)"
        );
        assert_eq!(
            create.params,
            vec![Value::DateTimeTz(watermark), Value::Int64(42)]
        );
    }
}
