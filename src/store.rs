//! Durable row store gateway
//!
//! Flattened rows live in a single SQLite table:
//! `(creation_timestamp, request_identity, col_1 .. col_n)` with payload
//! column types declared by the configured schema. The creation timestamp
//! is assigned by the store at insert time from the injected clock, never
//! by the caller. Rows are immutable after insert; the only deletion path
//! is the expiry sweeps.
//!
//! Timestamps are persisted as unix epoch milliseconds so that threshold
//! comparisons stay exact integer comparisons.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{ColumnType, GatewayConfig};
use crate::flatten::RowTuple;
use crate::identity::RequestIdentity;
use crate::token::DATE_FORMAT;

/// Errors that can occur at the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("Row store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A column value does not match the declared schema type
    #[error("Column {column} expects {expected:?}, got {value}")]
    TypeMismatch {
        column: usize,
        expected: ColumnType,
        value: String,
    },

    /// A batch insert aborted partway through
    #[error("Insert aborted after {inserted} rows: {source}")]
    PartialInsert {
        inserted: usize,
        #[source]
        source: Box<StoreError>,
    },

    /// The connection mutex was poisoned by a panicking thread
    #[error("Row store connection poisoned")]
    Poisoned,
}

/// One typed payload column value as stored and returned
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Date(NaiveDate),
    Real(f64),
    Integer(i64),
    /// Upstream sent `null` for this column
    Null,
}

impl ColumnValue {
    /// Owned SQLite value for binding into statements
    fn sql_value(&self) -> SqlValue {
        match self {
            ColumnValue::Text(s) => SqlValue::Text(s.clone()),
            ColumnValue::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
            ColumnValue::Real(f) => SqlValue::Real(*f),
            ColumnValue::Integer(i) => SqlValue::Integer(*i),
            ColumnValue::Null => SqlValue::Null,
        }
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.sql_value()))
    }
}

impl std::fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnValue::Text(s) => f.write_str(s),
            ColumnValue::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            ColumnValue::Real(v) => write!(f, "{}", v),
            ColumnValue::Integer(i) => write!(f, "{}", i),
            ColumnValue::Null => Ok(()),
        }
    }
}

/// One persisted record, as returned by queries
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Server-assigned insert time
    pub created_at: DateTime<Utc>,
    /// Identity the row is cached under
    pub identity: String,
    /// Payload columns in schema order
    pub values: Vec<ColumnValue>,
}

/// Transactional insert and query operations over the storage table
#[derive(Clone)]
pub struct RowStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    schema: Vec<ColumnType>,
    clock: Arc<dyn Clock>,
}

impl RowStore {
    /// Opens (or creates) the store at the given path
    pub fn open(
        path: impl AsRef<Path>,
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, config, clock)
    }

    /// Opens an in-memory store, mainly for tests
    pub fn open_in_memory(
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, config, clock)
    }

    fn from_connection(
        conn: Connection,
        config: &GatewayConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            table: config.table_name.clone(),
            schema: config.schema.clone(),
            clock,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates the table and identity/timestamp index if absent
    ///
    /// The table name is validated by config as a plain identifier, so
    /// interpolating it into DDL is safe.
    fn init_schema(&self) -> Result<(), StoreError> {
        let columns: Vec<String> = self
            .schema
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("col_{} {}", i + 1, ty.sql_type()))
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 creation_timestamp INTEGER NOT NULL,
                 request_identity TEXT NOT NULL,
                 {columns}
             );
             CREATE INDEX IF NOT EXISTS idx_{table}_identity
                 ON {table} (request_identity, creation_timestamp);",
            table = self.table,
            columns = columns.join(",\n                 "),
        );
        self.conn()?.execute_batch(&ddl)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Inserts a batch of rows under one identity
    ///
    /// Every row is typed against the declared schema before it is written.
    /// The batch is not atomic: a mid-batch failure leaves earlier rows in
    /// place and is reported as `PartialInsert` with the count written.
    ///
    /// # Returns
    /// * `Ok(count)` — number of rows written
    pub fn insert_all<I>(&self, identity: &RequestIdentity, rows: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = RowTuple>,
    {
        let conn = self.conn()?;
        let now = self.clock.now().timestamp_millis();
        let placeholders: Vec<String> = (1..=self.schema.len() + 2)
            .map(|i| format!("?{}", i))
            .collect();
        let sql = format!(
            "INSERT INTO {} VALUES ({})",
            self.table,
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;

        let mut inserted = 0usize;
        for row in rows {
            let typed = self
                .coerce_row(&row)
                .map_err(|e| partial(inserted, e))?;

            let mut params: Vec<SqlValue> = Vec::with_capacity(typed.len() + 2);
            params.push(SqlValue::Integer(now));
            params.push(SqlValue::Text(identity.as_str().to_string()));
            params.extend(typed.iter().map(ColumnValue::sql_value));
            stmt.execute(params_from_iter(params))
                .map_err(|e| partial(inserted, e.into()))?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Types one raw row against the declared schema
    fn coerce_row(&self, row: &RowTuple) -> Result<Vec<ColumnValue>, StoreError> {
        row.iter()
            .zip(self.schema.iter())
            .enumerate()
            .map(|(i, (value, ty))| coerce(value, *ty, i + 1))
            .collect()
    }

    /// True iff at least one row for `identity` is younger than `within`
    pub fn exists(&self, identity: &RequestIdentity, within: Duration) -> Result<bool, StoreError> {
        let threshold = (self.clock.now() - within).timestamp_millis();
        let sql = format!(
            "SELECT EXISTS(
                 SELECT 1 FROM {}
                 WHERE request_identity = ?1 AND creation_timestamp >= ?2
             )",
            self.table
        );
        let found: bool =
            self.conn()?
                .query_row(&sql, rusqlite::params![identity.as_str(), threshold], |r| {
                    r.get(0)
                })?;
        Ok(found)
    }

    /// True iff any row, under any identity, is older than `threshold`
    ///
    /// Cheap existence probe used by the global sweep's no-op fast path.
    pub fn has_rows_older_than(&self, threshold: DateTime<Utc>) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE creation_timestamp <= ?1)",
            self.table
        );
        let found: bool = self.conn()?.query_row(
            &sql,
            rusqlite::params![threshold.timestamp_millis()],
            |r| r.get(0),
        )?;
        Ok(found)
    }

    /// All rows for one identity, oldest first
    ///
    /// Ordered by creation timestamp then rowid so results are stable for
    /// rows written in the same millisecond.
    pub fn query(&self, identity: &RequestIdentity) -> Result<Vec<StoredRow>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE request_identity = ?1
             ORDER BY creation_timestamp ASC, rowid ASC",
            self.table
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let schema = self.schema.clone();
        let rows = stmt
            .query_map(rusqlite::params![identity.as_str()], |row| {
                let millis: i64 = row.get(0)?;
                let identity: String = row.get(1)?;
                let mut values = Vec::with_capacity(schema.len());
                for (i, ty) in schema.iter().enumerate() {
                    values.push(read_column(row, i + 2, *ty)?);
                }
                Ok(StoredRow {
                    created_at: DateTime::from_timestamp_millis(millis)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    identity,
                    values,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes rows older than `threshold`, optionally scoped to one identity
    ///
    /// # Returns
    /// * `Ok(count)` — number of rows deleted
    pub fn delete_older_than(
        &self,
        threshold: DateTime<Utc>,
        identity: Option<&RequestIdentity>,
    ) -> Result<usize, StoreError> {
        let millis = threshold.timestamp_millis();
        let conn = self.conn()?;
        let deleted = match identity {
            Some(id) => conn.execute(
                &format!(
                    "DELETE FROM {} WHERE request_identity = ?1 AND creation_timestamp <= ?2",
                    self.table
                ),
                rusqlite::params![id.as_str(), millis],
            )?,
            None => conn.execute(
                &format!("DELETE FROM {} WHERE creation_timestamp <= ?1", self.table),
                rusqlite::params![millis],
            )?,
        };
        Ok(deleted)
    }
}

fn partial(inserted: usize, source: StoreError) -> StoreError {
    StoreError::PartialInsert {
        inserted,
        source: Box::new(source),
    }
}

/// Types one JSON column value against its declared column type
fn coerce(value: &JsonValue, ty: ColumnType, column: usize) -> Result<ColumnValue, StoreError> {
    let mismatch = || StoreError::TypeMismatch {
        column,
        expected: ty,
        value: value.to_string(),
    };

    if value.is_null() {
        return Ok(ColumnValue::Null);
    }

    match ty {
        ColumnType::Text => value
            .as_str()
            .map(|s| ColumnValue::Text(s.to_string()))
            .ok_or_else(mismatch),
        ColumnType::Date => value
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
            .map(ColumnValue::Date)
            .ok_or_else(mismatch),
        ColumnType::Real => value
            .as_f64()
            .map(ColumnValue::Real)
            .ok_or_else(mismatch),
        ColumnType::Integer => value
            .as_i64()
            .map(ColumnValue::Integer)
            .ok_or_else(mismatch),
    }
}

/// Reads one payload column back into its typed value
fn read_column(
    row: &rusqlite::Row<'_>,
    index: usize,
    ty: ColumnType,
) -> Result<ColumnValue, rusqlite::Error> {
    let raw: SqlValue = row.get(index)?;
    Ok(match (ty, raw) {
        (_, SqlValue::Null) => ColumnValue::Null,
        (ColumnType::Text, SqlValue::Text(s)) => ColumnValue::Text(s),
        (ColumnType::Date, SqlValue::Text(s)) => NaiveDate::parse_from_str(&s, DATE_FORMAT)
            .map(ColumnValue::Date)
            .unwrap_or(ColumnValue::Text(s)),
        (ColumnType::Real, SqlValue::Real(f)) => ColumnValue::Real(f),
        (ColumnType::Real, SqlValue::Integer(i)) => ColumnValue::Real(i as f64),
        (ColumnType::Integer, SqlValue::Integer(i)) => ColumnValue::Integer(i),
        (_, other) => ColumnValue::Text(format!("{:?}", other)),
    })
}
