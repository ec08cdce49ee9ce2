//! Result rows and query results

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::value::{FromValue, Value};

/// A result row: column values in the order the server returned them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: IndexMap<String, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column. A repeated column name replaces the earlier value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// Builder form of [`Row::insert`].
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Get a raw value by column name.
    pub fn get_value(&self, column: &str) -> Result<&Value> {
        self.values
            .get(column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string()))
    }

    /// Get a typed value by column name.
    ///
    /// A NULL column read into a non-optional type reports
    /// [`Error::UnexpectedNull`] rather than a type mismatch.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.get_value(column)?;
        T::from_value(value.clone()).map_err(|e| match (value, e) {
            (Value::Null, Error::TypeConversion { .. }) => {
                Error::UnexpectedNull(column.to_string())
            }
            (_, e) => e,
        })
    }

    /// Column names in server order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Trait for types that can be decoded from a [`Row`].
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

/// Result of a statement that produced no result set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    /// Number of rows affected by the query
    pub rows_affected: u64,
    /// Last insert ID (for INSERT statements)
    pub last_insert_id: Option<u64>,
}

/// How many rows a caller wants back from a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// At most one row
    Single,
    /// Every row
    #[default]
    All,
}

/// Outcome of a query: either rows or execution metadata, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Rows(Vec<Row>),
    Execution(ExecuteResult),
}

impl QueryResult {
    /// Reduce a result set according to the fetch mode.
    pub(crate) fn apply(self, mode: FetchMode) -> Self {
        match (self, mode) {
            (QueryResult::Rows(mut rows), FetchMode::Single) => {
                rows.truncate(1);
                QueryResult::Rows(rows)
            }
            (result, _) => result,
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Execution(_) => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Execution(_) => Vec::new(),
        }
    }

    /// First row, if the statement produced one.
    pub fn first(&self) -> Option<&Row> {
        self.rows().first()
    }

    pub fn execution(&self) -> Option<&ExecuteResult> {
        match self {
            QueryResult::Execution(result) => Some(result),
            QueryResult::Rows(_) => None,
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.execution().map_or(0, |e| e.rows_affected)
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        self.execution().and_then(|e| e.last_insert_id)
    }

    /// Decode every row.
    pub fn decode<T: FromRow>(&self) -> Result<Vec<T>> {
        self.rows().iter().map(T::from_row).collect()
    }

    /// Decode the first row, if any.
    pub fn decode_optional<T: FromRow>(&self) -> Result<Option<T>> {
        self.first().map(T::from_row).transpose()
    }

    /// First column of the first row.
    pub fn scalar<T: FromValue>(&self) -> Result<T> {
        let row = self
            .first()
            .ok_or_else(|| Error::ColumnNotFound("no rows returned".into()))?;
        let column = row
            .columns()
            .next()
            .ok_or_else(|| Error::ColumnNotFound("no columns returned".into()))?
            .to_string();
        row.get(&column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Account {
        id: i64,
        email: Option<String>,
    }

    impl FromRow for Account {
        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get("id")?,
                email: row.get("email")?,
            })
        }
    }

    #[test]
    fn test_single_mode_keeps_first_row() {
        let result = QueryResult::Rows(vec![
            Row::new().with("id", 1i64),
            Row::new().with("id", 2i64),
        ])
        .apply(FetchMode::Single);
        assert_eq!(result.rows().len(), 1);
        assert_eq!(result.scalar::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_execution_is_untouched_by_fetch_mode() {
        let result = QueryResult::Execution(ExecuteResult {
            rows_affected: 3,
            last_insert_id: Some(10),
        })
        .apply(FetchMode::Single);
        assert_eq!(result.rows_affected(), 3);
        assert_eq!(result.last_insert_id(), Some(10));
        assert!(result.rows().is_empty());
    }

    #[test]
    fn test_null_into_non_optional() {
        let row = Row::new().with("id", 1i64).with("email", Value::Null);
        assert!(matches!(
            row.get::<String>("email"),
            Err(Error::UnexpectedNull(ref c)) if c == "email"
        ));
        assert!(matches!(row.get::<i64>("missing"), Err(Error::ColumnNotFound(_))));
    }

    #[test]
    fn test_decode() {
        let result = QueryResult::Rows(vec![Row::new()
            .with("id", 5i64)
            .with("email", Value::Null)]);
        let accounts: Vec<Account> = result.decode().unwrap();
        assert_eq!(accounts[0].id, 5);
        assert!(accounts[0].email.is_none());
    }
}
