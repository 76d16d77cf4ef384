//! SQL statements and their parameters
//!
//! A [`SqlCommand`] is a configured statement with positional `?`
//! placeholders and an ordered parameter list. Parameters are literals or
//! special parameters resolved at the start of every fetch cycle.
//!
//! The module also holds the small lexer the planner uses to find top-level
//! clauses without being fooled by literals, comments or sub-queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tributary_rdbc::dialect::count_placeholders;
use tributary_rdbc::Value;

/// Placeholder marking where the change-detection condition goes
pub const WHERE_PLACEHOLDER: &str = "$where";

/// Parameters resolved per fetch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialParameter {
    /// Start of the current cycle
    Now,
    /// Watermark: start of the last successful run minus the overlap
    LastRunStart,
    /// End of the last successful run
    LastRunEnd,
    /// Run counter of the current run
    RunCounter,
    /// Name of the task
    TaskName,
}

impl SpecialParameter {
    /// Name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Now => "$now",
            Self::LastRunStart => "$last.run.start",
            Self::LastRunEnd => "$last.run.end",
            Self::RunCounter => "$run.counter",
            Self::TaskName => "$task.name",
        }
    }
}

impl FromStr for SpecialParameter {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "$now" => Ok(Self::Now),
            "$last.run.start" => Ok(Self::LastRunStart),
            "$last.run.end" => Ok(Self::LastRunEnd),
            "$run.counter" => Ok(Self::RunCounter),
            "$task.name" => Ok(Self::TaskName),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SpecialParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statement parameter as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum SqlParameter {
    /// Resolved per cycle
    Special(SpecialParameter),
    /// Bound as given
    Literal(serde_json::Value),
}

impl From<serde_json::Value> for SqlParameter {
    fn from(value: serde_json::Value) -> Self {
        if let Some(special) = value.as_str().and_then(|s| s.parse().ok()) {
            return Self::Special(special);
        }
        Self::Literal(value)
    }
}

impl From<SqlParameter> for serde_json::Value {
    fn from(param: SqlParameter) -> Self {
        match param {
            SqlParameter::Special(special) => serde_json::Value::String(special.to_string()),
            SqlParameter::Literal(value) => value,
        }
    }
}

/// Values special parameters resolve to in one cycle
#[derive(Debug, Clone)]
pub struct ParameterContext {
    /// Cycle start
    pub now: DateTime<Utc>,
    /// Watermark (epoch when there is no previous successful run)
    pub last_run_start: DateTime<Utc>,
    /// End of the last successful run (epoch when there is none)
    pub last_run_end: DateTime<Utc>,
    /// Counter of the current run
    pub counter: i64,
    /// Task name
    pub task_name: String,
}

impl ParameterContext {
    fn resolve(&self, param: &SqlParameter) -> Value {
        match param {
            SqlParameter::Special(SpecialParameter::Now) => Value::DateTimeTz(self.now),
            SqlParameter::Special(SpecialParameter::LastRunStart) => {
                Value::DateTimeTz(self.last_run_start)
            }
            SqlParameter::Special(SpecialParameter::LastRunEnd) => {
                Value::DateTimeTz(self.last_run_end)
            }
            SqlParameter::Special(SpecialParameter::RunCounter) => Value::Int64(self.counter),
            SqlParameter::Special(SpecialParameter::TaskName) => {
                Value::String(self.task_name.clone())
            }
            SqlParameter::Literal(json) => literal_value(json),
        }
    }
}

fn literal_value(json: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int64(i),
            None => n.as_f64().map(Value::Float64).unwrap_or(Value::Null),
        },
        Json::String(s) => Value::String(s.clone()),
        other => Value::Json(other.clone()),
    }
}

/// A configured statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCommand {
    /// Statement text with `?` placeholders and optionally `$where`
    pub statement: String,
    /// Ordered parameters
    #[serde(default)]
    pub parameters: Vec<SqlParameter>,
}

impl SqlCommand {
    /// Create a command without parameters
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter
    pub fn with_parameter(mut self, param: SqlParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Number of `?` placeholders in the statement
    pub fn placeholder_count(&self) -> usize {
        count_placeholders(&self.statement)
    }

    /// Resolve parameters for one cycle
    pub fn bind(&self, ctx: &ParameterContext) -> BoundCommand {
        BoundCommand {
            sql: self.statement.clone(),
            params: self.parameters.iter().map(|p| ctx.resolve(p)).collect(),
        }
    }
}

/// A statement with concrete parameter values for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCommand {
    /// Statement text
    pub sql: String,
    /// Positional values
    pub params: Vec<Value>,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

/// A word outside literals and comments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Word<'a> {
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
    /// Parenthesis nesting depth
    pub depth: usize,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '.'
}

/// Split a statement into words, skipping quoted text and comments
pub(crate) fn words(sql: &str) -> Vec<Word<'_>> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                for (_, inner) in chars.by_ref() {
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if bytes.get(i + 1) == Some(&b'-') => {
                for (_, inner) in chars.by_ref() {
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                chars.next();
                let mut prev = '\0';
                for (_, inner) in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if is_word_char(c) => {
                let mut end = i + c.len_utf8();
                while let Some(&(j, next)) = chars.peek() {
                    if !is_word_char(next) {
                        break;
                    }
                    end = j + next.len_utf8();
                    chars.next();
                }
                out.push(Word {
                    text: &sql[i..end],
                    start: i,
                    end,
                    depth,
                });
            }
            _ => {}
        }
    }
    out
}

/// Clauses that end a WHERE condition
const TRAILING_CLAUSES: &[&str] = &["GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "FETCH"];

/// A statement with a condition injected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injected {
    /// Rewritten statement
    pub sql: String,
    /// Number of statement placeholders preceding the injected condition
    pub param_offset: usize,
}

/// Inject `fragment` into `sql` as an additional condition
///
/// In order of preference: replace the `$where` placeholder, AND-combine
/// with an existing top-level `WHERE`, or add a `WHERE` clause before any
/// trailing `GROUP BY`/`HAVING`/`ORDER BY`/`LIMIT`/`OFFSET`/`FETCH`.
pub fn inject_where(sql: &str, fragment: &str) -> Injected {
    let sql = sql.trim_end().trim_end_matches(';').trim_end();
    let tokens = words(sql);

    if let Some(placeholder) = tokens
        .iter()
        .find(|w| w.text.eq_ignore_ascii_case(WHERE_PLACEHOLDER))
    {
        let head = &sql[..placeholder.start];
        return Injected {
            sql: format!("{}({}){}", head, fragment, &sql[placeholder.end..]),
            param_offset: count_placeholders(head),
        };
    }

    let top: Vec<&Word<'_>> = tokens.iter().filter(|w| w.depth == 0).collect();
    let trailing_after = |pos: usize| {
        top.iter()
            .find(|w| {
                w.start > pos
                    && TRAILING_CLAUSES
                        .iter()
                        .any(|kw| w.text.eq_ignore_ascii_case(kw))
            })
            .map(|w| w.start)
    };

    if let Some(where_kw) = top.iter().find(|w| w.text.eq_ignore_ascii_case("WHERE")) {
        let cond_start = where_kw.end;
        let cond_end = trailing_after(cond_start).unwrap_or(sql.len());
        let head = &sql[..cond_start];
        let condition = sql[cond_start..cond_end].trim();
        let tail = &sql[cond_end..];
        let sep = if tail.is_empty() { "" } else { " " };
        return Injected {
            sql: format!("{} ({}) AND ({}){}{}", head, fragment, condition, sep, tail),
            param_offset: count_placeholders(head),
        };
    }

    // Skip the select list so a column named like a clause keyword is not matched.
    let from = top
        .iter()
        .find(|w| w.text.eq_ignore_ascii_case("FROM"))
        .map(|w| w.end)
        .unwrap_or(0);
    match trailing_after(from) {
        Some(pos) => {
            let head = sql[..pos].trim_end();
            Injected {
                sql: format!("{} WHERE ({}) {}", head, fragment, &sql[pos..]),
                param_offset: count_placeholders(head),
            }
        }
        None => Injected {
            sql: format!("{} WHERE ({})", sql, fragment),
            param_offset: count_placeholders(sql),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx() -> ParameterContext {
        ParameterContext {
            now: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            last_run_start: Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap(),
            last_run_end: Utc.with_ymd_and_hms(2024, 6, 1, 11, 5, 0).unwrap(),
            counter: 7,
            task_name: "products".into(),
        }
    }

    #[test]
    fn test_special_parameter_parse() {
        let p: SqlParameter = serde_json::json!("$now").into();
        assert_eq!(p, SqlParameter::Special(SpecialParameter::Now));

        let p: SqlParameter = serde_json::json!("$nope").into();
        assert_eq!(p, SqlParameter::Literal(serde_json::json!("$nope")));

        let p: SqlParameter = serde_json::json!(3).into();
        assert_eq!(p, SqlParameter::Literal(serde_json::json!(3)));
    }

    #[test]
    fn test_bind_resolves_specials() {
        let cmd: SqlCommand = serde_json::from_value(serde_json::json!({
            "statement": "SELECT * FROM t WHERE a > ? AND b = ? AND c = ? AND d = ?",
            "parameters": ["$last.run.start", "$run.counter", "$task.name", 1.5]
        }))
        .unwrap();
        assert_eq!(cmd.placeholder_count(), 4);

        let bound = cmd.bind(&ctx());
        assert_eq!(bound.params[0], Value::DateTimeTz(ctx().last_run_start));
        assert_eq!(bound.params[1], Value::Int64(7));
        assert_eq!(bound.params[2], Value::String("products".into()));
        assert_eq!(bound.params[3], Value::Float64(1.5));
    }

    #[test]
    fn test_parameters_roundtrip_names() {
        let json = serde_json::to_value(SqlParameter::Special(SpecialParameter::LastRunEnd)).unwrap();
        assert_eq!(json, serde_json::json!("$last.run.end"));
    }

    #[test]
    fn test_words_skip_literals_and_subqueries() {
        let sql = "SELECT 'WHERE', (SELECT 1 FROM x WHERE y) FROM t -- WHERE\n";
        let top: Vec<_> = words(sql)
            .into_iter()
            .filter(|w| w.depth == 0)
            .map(|w| w.text)
            .collect();
        assert_eq!(top, vec!["SELECT", "FROM", "t"]);
    }

    #[test]
    fn test_inject_placeholder() {
        let out = inject_where("SELECT * FROM t WHERE $where AND x = ?", "a >= ?");
        assert_eq!(out.sql, "SELECT * FROM t WHERE (a >= ?) AND x = ?");
        assert_eq!(out.param_offset, 0);

        let out = inject_where("SELECT * FROM t WHERE k = ? AND $where", "a >= ?");
        assert_eq!(out.sql, "SELECT * FROM t WHERE k = ? AND (a >= ?)");
        assert_eq!(out.param_offset, 1);
    }

    #[test]
    fn test_inject_existing_where() {
        let out = inject_where(
            "SELECT * FROM t WHERE k = ? OR j = 1 ORDER BY id LIMIT 5;",
            "a >= ?",
        );
        assert_eq!(
            out.sql,
            "SELECT * FROM t WHERE (a >= ?) AND (k = ? OR j = 1) ORDER BY id LIMIT 5"
        );
        assert_eq!(out.param_offset, 0);
    }

    #[test]
    fn test_inject_without_where() {
        let out = inject_where("SELECT * FROM t", "a >= ?");
        assert_eq!(out.sql, "SELECT * FROM t WHERE (a >= ?)");

        let out = inject_where("SELECT k, count(*) FROM t GROUP BY k", "a >= ?");
        assert_eq!(out.sql, "SELECT k, count(*) FROM t WHERE (a >= ?) GROUP BY k");
    }

    #[test]
    fn test_inject_ignores_nested_where() {
        let out = inject_where(
            "SELECT * FROM (SELECT * FROM t WHERE z = ?) s ORDER BY id",
            "a >= ?",
        );
        assert_eq!(
            out.sql,
            "SELECT * FROM (SELECT * FROM t WHERE z = ?) s WHERE (a >= ?) ORDER BY id"
        );
        assert_eq!(out.param_offset, 1);
    }
}
