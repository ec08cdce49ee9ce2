//! Logical queries and their binding into driver statements

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::config::Role;
use crate::error::{Error, Result};
use crate::row::FetchMode;
use crate::value::Value;

/// Trusted SQL text spliced verbatim into the statement.
///
/// Never build an `Expression` from user input: it bypasses parameter binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expression(String);

impl Expression {
    pub fn new(sql: impl Into<String>) -> Self {
        Self(sql.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A bound parameter.
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum Param {
    /// Sent to the server through native parameter binding
    Value(Value),
    /// Spliced into the SQL text
    Raw(Expression),
}

/// Parameters of a driver statement after raw expressions were spliced.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StatementParams {
    #[default]
    Empty,
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl StatementParams {
    pub fn is_empty(&self) -> bool {
        match self {
            StatementParams::Empty => true,
            StatementParams::Positional(values) => values.is_empty(),
            StatementParams::Named(values) => values.is_empty(),
        }
    }
}

/// What a connection actually sends: final SQL plus natively bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: StatementParams,
}

impl Statement {
    /// A statement without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: StatementParams::Empty,
        }
    }
}

/// A logical query: SQL, parameters, target and execution limits.
///
/// # Example
///
/// ```ignore
/// use strand::{FetchMode, Query};
///
/// let query = Query::new("main", "SELECT * FROM users WHERE id = ?")
///     .bind(42)
///     .fetch(FetchMode::Single);
/// let user = manager.execute(query).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    connection: String,
    sql: String,
    positional: Vec<Param>,
    named: Vec<(String, Param)>,
    role: Option<Role>,
    fetch: FetchMode,
    max_execution_time: Option<Duration>,
}

impl Query {
    /// Create a query against the named connection.
    pub fn new(connection: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            sql: sql.into(),
            positional: Vec::new(),
            named: Vec::new(),
            role: None,
            fetch: FetchMode::All,
            max_execution_time: None,
        }
    }

    /// Bind a value to the next `?` placeholder.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(Param::Value(value.into()));
        self
    }

    /// Splice trusted SQL into the next `?` placeholder.
    pub fn bind_raw(mut self, expression: Expression) -> Self {
        self.positional.push(Param::Raw(expression));
        self
    }

    /// Bind a value to a `:name` placeholder.
    pub fn bind_named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.push((name.into(), Param::Value(value.into())));
        self
    }

    /// Splice trusted SQL into a `:name` placeholder.
    pub fn bind_named_raw(mut self, name: impl Into<String>, expression: Expression) -> Self {
        self.named.push((name.into(), Param::Raw(expression)));
        self
    }

    /// Force the server role. Without it, reads go to slaves and writes to the master.
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn fetch(mut self, mode: FetchMode) -> Self {
        self.fetch = mode;
        self
    }

    /// Override the configured `max_execution_time` for this query.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.max_execution_time = Some(duration);
        self
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch
    }

    pub fn max_execution_time(&self) -> Option<Duration> {
        self.max_execution_time
    }

    /// The role this query targets.
    pub fn target_role(&self) -> Role {
        self.role.unwrap_or_else(|| {
            if is_read_statement(&self.sql) {
                Role::Slave
            } else {
                Role::Master
            }
        })
    }

    /// Key identifying identical reads for in-flight de-duplication.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.connection.hash(&mut hasher);
        self.target_role().hash(&mut hasher);
        self.sql.hash(&mut hasher);
        self.positional.hash(&mut hasher);
        self.named.hash(&mut hasher);
        self.fetch.hash(&mut hasher);
        hasher.finish()
    }

    /// Bind parameters into a driver statement.
    ///
    /// Raw expressions are spliced into the SQL text; values stay as
    /// placeholders and are handed to the driver for native binding.
    /// Placeholders inside quoted strings and identifiers are ignored.
    /// A `:name` placeholder without a named binding is an error, even when
    /// nothing was bound at all.
    pub fn statement(&self) -> Result<Statement> {
        let named_style = !self.named.is_empty() || has_named_placeholder(&self.sql);
        if named_style && !self.positional.is_empty() {
            return Err(Error::Configuration(
                "cannot mix positional and named parameters".into(),
            ));
        }
        if named_style {
            self.bind_named_params()
        } else {
            self.bind_positional()
        }
    }

    fn bind_positional(&self) -> Result<Statement> {
        let mut sql = String::with_capacity(self.sql.len());
        let mut values = Vec::new();
        let mut params = self.positional.iter();
        let mut placeholders = 0usize;

        for segment in Segments::new(&self.sql) {
            match segment {
                Segment::Text(text) => {
                    let mut rest = text;
                    while let Some(pos) = rest.find('?') {
                        sql.push_str(&rest[..pos]);
                        placeholders += 1;
                        match params.next() {
                            Some(Param::Value(v)) => {
                                sql.push('?');
                                values.push(v.clone());
                            }
                            Some(Param::Raw(expr)) => sql.push_str(expr.as_str()),
                            None => {}
                        }
                        rest = &rest[pos + 1..];
                    }
                    sql.push_str(rest);
                }
                Segment::Quoted(text) => sql.push_str(text),
            }
        }

        if placeholders != self.positional.len() {
            return Err(Error::Configuration(format!(
                "query has {} placeholders but {} parameters were bound",
                placeholders,
                self.positional.len()
            )));
        }

        Ok(Statement {
            sql,
            params: if values.is_empty() {
                StatementParams::Empty
            } else {
                StatementParams::Positional(values)
            },
        })
    }

    fn bind_named_params(&self) -> Result<Statement> {
        let mut sql = String::with_capacity(self.sql.len());
        let mut values: Vec<(String, Value)> = Vec::new();

        for segment in Segments::new(&self.sql) {
            let text = match segment {
                Segment::Quoted(text) => {
                    sql.push_str(text);
                    continue;
                }
                Segment::Text(text) => text,
            };

            let mut copied = 0;
            for (start, end) in named_placeholders(text) {
                let name = &text[start + 1..end];
                let param = self
                    .named
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, p)| p)
                    .ok_or_else(|| {
                        Error::Configuration(format!("missing named parameter :{}", name))
                    })?;

                sql.push_str(&text[copied..start]);
                match param {
                    Param::Value(v) => {
                        sql.push_str(&text[start..end]);
                        if !values.iter().any(|(n, _)| n == name) {
                            values.push((name.to_string(), v.clone()));
                        }
                    }
                    Param::Raw(expr) => sql.push_str(expr.as_str()),
                }
                copied = end;
            }
            sql.push_str(&text[copied..]);
        }

        Ok(Statement {
            sql,
            params: if values.is_empty() {
                StatementParams::Empty
            } else {
                StatementParams::Named(values)
            },
        })
    }
}

/// Byte ranges of the `:name` placeholders in unquoted SQL text.
///
/// `::` casts and `:=` assignments are not placeholders.
fn named_placeholders(text: &str) -> impl Iterator<Item = (usize, usize)> + '_ {
    let bytes = text.as_bytes();
    let mut i = 0;
    std::iter::from_fn(move || {
        while i < bytes.len() {
            let starts_name = bytes[i] == b':'
                && bytes
                    .get(i + 1)
                    .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
                && (i == 0 || bytes[i - 1] != b':');
            if !starts_name {
                i += 1;
                continue;
            }
            let start = i;
            let end = bytes[i + 1..]
                .iter()
                .position(|b| !(b.is_ascii_alphanumeric() || *b == b'_'))
                .map_or(bytes.len(), |p| i + 1 + p);
            i = end;
            return Some((start, end));
        }
        None
    })
}

fn has_named_placeholder(sql: &str) -> bool {
    Segments::new(sql).any(|segment| match segment {
        Segment::Text(text) => named_placeholders(text).next().is_some(),
        Segment::Quoted(_) => false,
    })
}

/// Whether the statement only reads (and may therefore go to a slave).
pub fn is_read_statement(sql: &str) -> bool {
    let head = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    let reads = matches!(head.as_str(), "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN");
    reads && !sql.to_ascii_uppercase().contains("FOR UPDATE")
}

enum Segment<'a> {
    Text(&'a str),
    Quoted(&'a str),
}

/// Splits SQL into plain text and quoted runs ('...', "...", `...`).
struct Segments<'a> {
    sql: &'a str,
    pos: usize,
}

impl<'a> Segments<'a> {
    fn new(sql: &'a str) -> Self {
        Self { sql, pos: 0 }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.sql[self.pos..];
        if rest.is_empty() {
            return None;
        }
        let bytes = rest.as_bytes();
        let quote = bytes[0];
        if matches!(quote, b'\'' | b'"' | b'`') {
            let mut i = 1;
            let mut end = bytes.len();
            while i < bytes.len() {
                if bytes[i] == b'\\' && quote != b'`' {
                    i += 2;
                    continue;
                }
                if bytes[i] == quote {
                    // Doubled quote is an escaped quote
                    if bytes.get(i + 1) == Some(&quote) {
                        i += 2;
                        continue;
                    }
                    end = i + 1;
                    break;
                }
                i += 1;
            }
            let end = end.min(bytes.len());
            self.pos += end;
            return Some(Segment::Quoted(&rest[..end]));
        }
        let end = rest
            .find(|c| c == '\'' || c == '"' || c == '`')
            .unwrap_or(rest.len());
        self.pos += end;
        Some(Segment::Text(&rest[..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_use_native_binding() {
        let stmt = Query::new("main", "SELECT * FROM users WHERE id = ? AND name = ?")
            .bind(7)
            .bind("O'Brien")
            .statement()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM users WHERE id = ? AND name = ?");
        assert_eq!(
            stmt.params,
            StatementParams::Positional(vec![Value::I64(7), Value::String("O'Brien".into())])
        );
    }

    #[test]
    fn test_raw_expression_is_spliced() {
        let stmt = Query::new("main", "UPDATE counters SET hits = ? WHERE id = ?")
            .bind_raw(Expression::new("hits + 1"))
            .bind(3u32)
            .statement()
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE counters SET hits = hits + 1 WHERE id = ?");
        assert_eq!(stmt.params, StatementParams::Positional(vec![Value::U64(3)]));
    }

    #[test]
    fn test_placeholders_in_quotes_are_ignored() {
        let stmt = Query::new("main", "SELECT '?', `a?b`, \"it\\\"s ?\" FROM t WHERE x = ?")
            .bind(1)
            .statement()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT '?', `a?b`, \"it\\\"s ?\" FROM t WHERE x = ?");
        assert_eq!(stmt.params, StatementParams::Positional(vec![Value::I64(1)]));
    }

    #[test]
    fn test_placeholder_count_mismatch() {
        let err = Query::new("main", "SELECT ?, ?").bind(1).statement();
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_named_parameters() {
        let stmt = Query::new(
            "main",
            "SELECT * FROM logs WHERE at > :since AND level = :level AND at < :since + INTERVAL 1 DAY ORDER BY :order",
        )
        .bind_named("since", "2024-01-01")
        .bind_named("level", "warn")
        .bind_named_raw("order", Expression::new("at DESC"))
        .statement()
        .unwrap();
        assert!(stmt.sql.ends_with("ORDER BY at DESC"));
        assert_eq!(
            stmt.params,
            StatementParams::Named(vec![
                ("since".into(), Value::String("2024-01-01".into())),
                ("level".into(), Value::String("warn".into())),
            ])
        );
    }

    #[test]
    fn test_missing_named_parameter() {
        let err = Query::new("main", "SELECT :a").statement();
        assert!(matches!(err, Err(Error::Configuration(ref m)) if m.contains(":a")));

        let err = Query::new("main", "SELECT :a, :b").bind_named("a", 1).statement();
        assert!(matches!(err, Err(Error::Configuration(ref m)) if m.contains(":b")));

        let err = Query::new("main", "SELECT ? FROM t WHERE id = :id").bind(1).statement();
        assert!(matches!(err, Err(Error::Configuration(ref m)) if m.contains("mix")));
    }

    #[test]
    fn test_colons_outside_placeholders() {
        let stmt = Query::new("main", "SELECT '10:30', @n := 1, x::text FROM t")
            .statement()
            .unwrap();
        assert_eq!(stmt.sql, "SELECT '10:30', @n := 1, x::text FROM t");
        assert_eq!(stmt.params, StatementParams::Empty);
    }

    #[test]
    fn test_default_role_follows_statement_kind() {
        assert_eq!(Query::new("m", "  select 1").target_role(), Role::Slave);
        assert_eq!(Query::new("m", "(SELECT 1) UNION (SELECT 2)").target_role(), Role::Slave);
        assert_eq!(
            Query::new("m", "SELECT * FROM t FOR UPDATE").target_role(),
            Role::Master
        );
        assert_eq!(Query::new("m", "INSERT INTO t VALUES (1)").target_role(), Role::Master);
        assert_eq!(
            Query::new("m", "SELECT 1").role(Role::Master).target_role(),
            Role::Master
        );
    }

    #[test]
    fn test_fingerprint() {
        let a = Query::new("main", "SELECT ?").bind(1);
        let b = Query::new("main", "SELECT ?").bind(1);
        let c = Query::new("main", "SELECT ?").bind(2);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(
            a.fingerprint(),
            a.clone().fetch(FetchMode::Single).fingerprint()
        );
    }
}
