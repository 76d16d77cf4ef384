//! SQL dialect helpers for tributary-rdbc
//!
//! Statements are written with positional `?` placeholders. Each backend
//! renders them in its native form and quotes identifiers its own way.

use crate::connection::DatabaseType;

/// SQL dialect for vendor-specific SQL rendering
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Identifier quote string
    fn identifier_quote(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier(name, self.identifier_quote())
    }

    /// Get the placeholder for a 1-based parameter index (e.g., $1, ?)
    fn placeholder(&self, index: usize) -> String;

    /// Get current timestamp expression
    fn current_timestamp(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn identifier_quote(&self) -> &'static str {
        "\""
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }
}

/// ANSI dialect with JDBC-style `?` placeholders
#[derive(Debug, Clone, Default)]
pub struct GenericDialect;

impl SqlDialect for GenericDialect {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn identifier_quote(&self) -> &'static str {
        "\""
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }
}

/// Pick the dialect for a database type
pub fn dialect_for(db: DatabaseType) -> Box<dyn SqlDialect> {
    match db {
        DatabaseType::PostgreSQL => Box::new(PostgresDialect),
        DatabaseType::Unknown => Box::new(GenericDialect),
    }
}

/// Quote `name` with `quote`, doubling embedded quote characters
///
/// An empty quote string leaves the identifier untouched.
pub fn quote_identifier(name: &str, quote: &str) -> String {
    if quote.is_empty() {
        return name.to_string();
    }
    let escaped = name.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

/// Rewrite positional `?` placeholders into the dialect's native form
///
/// Placeholders inside quoted literals, quoted identifiers and comments are
/// left alone. `??` is an escaped literal `?` (e.g. the jsonb `?` operator).
pub fn rewrite_placeholders(sql: &str, dialect: &dyn SqlDialect) -> String {
    scan_placeholders(sql, |index| dialect.placeholder(index)).0
}

/// Count the positional `?` placeholders of a statement
pub fn count_placeholders(sql: &str) -> usize {
    scan_placeholders(sql, |_| String::new()).1
}

fn scan_placeholders(sql: &str, mut render: impl FnMut(usize) -> String) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut index = 0;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                out.push(c);
                // Doubled quotes inside a literal simply re-enter this arm.
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    out.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '?' if chars.peek() == Some(&'?') => {
                chars.next();
                out.push('?');
            }
            '?' => {
                index += 1;
                out.push_str(&render(index));
            }
            _ => out.push(c),
        }
    }
    (out, index)
}
