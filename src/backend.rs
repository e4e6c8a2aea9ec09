//! Database backend for named queries.
//!
//! [`Backend`] is the seam between the query registry and the database:
//! it turns SQL text into prepared statements and releases them again.
//! [`PgBackend`] implements it on a sqlx PostgreSQL pool and also carries
//! the execution helpers used by [`Db`](crate::db::Db), transactions and
//! batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use futures::TryStreamExt;
use sqlx::postgres::{PgArguments, PgPool, PgRow, PgStatement};
use sqlx::query::Query as SqlxQuery;
use sqlx::types::Uuid;
use sqlx::{Column, Either, Executor, Postgres, Row as _, Statement as _, TypeInfo};

use crate::error::{SqlTagError, SqlTagResult};
use crate::query::{PreparedHandle, Query};

/// Prepares and releases server-side statements.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Register `sql` as a prepared statement for the query `name`.
    ///
    /// Every call returns a handle of its own, even for a name that is
    /// already prepared, so releasing one handle never affects another.
    async fn prepare(&self, name: &str, sql: &str) -> SqlTagResult<PreparedHandle>;

    /// Release a statement previously returned by [`Backend::prepare`].
    async fn deallocate(&self, handle: &PreparedHandle) -> SqlTagResult<()>;

    /// Release any connections held by the backend.
    async fn close(&self) {}
}

/// PostgreSQL backend on a sqlx connection pool.
///
/// Prepared statements are described once by the server and cached under
/// a handle of the form `name_N`, unique per preparation. sqlx re-prepares
/// them transparently on whichever pooled connection ends up executing
/// them.
///
/// [`Backend::deallocate`] only evicts the cached description. Connections
/// that already ran the statement keep it in sqlx's per-connection
/// statement cache until that cache evicts it or the connection closes.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    statements: Arc<DashMap<String, PgStatement<'static>>>,
    serial: Arc<AtomicU64>,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statements: Arc::new(DashMap::new()),
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn next_handle(&self, name: &str) -> PreparedHandle {
        let n = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
        PreparedHandle::new(format!("{}_{}", name, n))
    }

    /// The cached statement behind a query's handle. A handle that has
    /// been released falls back to the raw SQL.
    fn statement(&self, query: &Query) -> Option<PgStatement<'static>> {
        let handle = query.prepared()?;
        self.statements
            .get(handle.name())
            .map(|entry| entry.value().clone())
    }

    /// Have the server describe `sql` over `executor` and cache the
    /// statement under a fresh handle.
    pub(crate) async fn prepare_on<'c, E>(
        &self,
        executor: E,
        name: &str,
        sql: &str,
    ) -> SqlTagResult<PreparedHandle>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let statement = executor
            .prepare(sql)
            .await
            .map_err(|e| SqlTagError::prepare(name, e.to_string()))?;
        let handle = self.next_handle(name);
        self.statements.insert(
            handle.name().to_string(),
            sqlx::Statement::to_owned(&statement),
        );
        tracing::debug!("Prepared statement '{}' as {}", name, handle);
        Ok(handle)
    }

    /// Fetch all rows of a query.
    pub(crate) async fn fetch_all<'c, E>(
        &self,
        executor: E,
        query: &Query,
        args: &[SqlValue],
    ) -> SqlTagResult<Vec<PgRow>>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let statement = self.statement(query);
        let sqlx_query = match &statement {
            Some(statement) => statement.query(),
            None => sqlx::query(query.raw_sql()),
        };
        bind_all(sqlx_query, args)
            .fetch_all(executor)
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))
    }

    /// Fetch exactly one row.
    pub(crate) async fn fetch_one<'c, E>(
        &self,
        executor: E,
        query: &Query,
        args: &[SqlValue],
    ) -> SqlTagResult<PgRow>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let statement = self.statement(query);
        let sqlx_query = match &statement {
            Some(statement) => statement.query(),
            None => sqlx::query(query.raw_sql()),
        };
        bind_all(sqlx_query, args)
            .fetch_one(executor)
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))
    }

    /// Execute a statement, returning the number of affected rows.
    pub(crate) async fn execute<'c, E>(
        &self,
        executor: E,
        query: &Query,
        args: &[SqlValue],
    ) -> SqlTagResult<u64>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let statement = self.statement(query);
        let sqlx_query = match &statement {
            Some(statement) => statement.query(),
            None => sqlx::query(query.raw_sql()),
        };
        let result = bind_all(sqlx_query, args)
            .execute(executor)
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Run a statement keeping both its rows and its affected-row count.
    pub(crate) async fn fetch_results<'c, E>(
        &self,
        executor: E,
        query: &Query,
        args: &[SqlValue],
    ) -> SqlTagResult<(u64, Vec<PgRow>)>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let statement = self.statement(query);
        let sqlx_query = match &statement {
            Some(statement) => statement.query(),
            None => sqlx::query(query.raw_sql()),
        };
        let mut stream = bind_all(sqlx_query, args).fetch_many(executor);

        let mut affected = 0;
        let mut rows = Vec::new();
        while let Some(step) = stream
            .try_next()
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))?
        {
            match step {
                Either::Left(done) => affected += done.rows_affected(),
                Either::Right(row) => rows.push(row),
            }
        }
        Ok((affected, rows))
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn prepare(&self, name: &str, sql: &str) -> SqlTagResult<PreparedHandle> {
        self.prepare_on(&self.pool, name, sql).await
    }

    async fn deallocate(&self, handle: &PreparedHandle) -> SqlTagResult<()> {
        match self.statements.remove(handle.name()) {
            Some(_) => Ok(()),
            None => Err(SqlTagError::Deallocation(format!(
                "prepared statement '{}' does not exist",
                handle
            ))),
        }
    }

    async fn close(&self) {
        self.statements.clear();
        self.pool.close().await;
        tracing::info!("Connection pool closed");
    }
}

/// Dynamic value type for positional query arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

fn bind_all<'q>(
    mut query: SqlxQuery<'q, Postgres, PgArguments>,
    args: &[SqlValue],
) -> SqlxQuery<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Float(v) => query.bind(*v),
            SqlValue::String(v) => query.bind(v.clone()),
        };
    }
    query
}

/// A result row as column name → JSON value.
pub type Row = HashMap<String, serde_json::Value>;

/// Convert a PgRow to a [`Row`].
pub fn row_to_map(row: &PgRow) -> Row {
    let mut map = HashMap::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();

        let value: Option<serde_json::Value> = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(Into::into),
            "INT2" => row.try_get::<Option<i16>, _>(i).ok().flatten().map(Into::into),
            "INT4" => row.try_get::<Option<i32>, _>(i).ok().flatten().map(Into::into),
            "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(Into::into),
            "FLOAT4" => row.try_get::<Option<f32>, _>(i).ok().flatten().map(Into::into),
            "FLOAT8" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(Into::into),
            "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(i).ok().flatten(),
            "UUID" => row
                .try_get::<Option<Uuid>, _>(i)
                .ok()
                .flatten()
                .map(|v| v.to_string().into()),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)
                .ok()
                .flatten()
                .map(|v| v.to_rfc3339().into()),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(i)
                .ok()
                .flatten()
                .map(|v| v.to_string().into()),
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(i)
                .ok()
                .flatten()
                .map(|v| v.to_string().into()),
            _ => row.try_get::<Option<String>, _>(i).ok().flatten().map(Into::into),
        };

        map.insert(name, value.unwrap_or(serde_json::Value::Null));
    }

    map
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

impl SqlValue {
    /// Interpret a command-line argument: integers, floats and booleans
    /// are recognized, `null` maps to NULL, anything else is a string.
    pub fn parse_arg(arg: &str) -> SqlValue {
        if let Ok(n) = arg.parse::<i64>() {
            SqlValue::Int(n)
        } else if let Ok(f) = arg.parse::<f64>() {
            SqlValue::Float(f)
        } else {
            match arg {
                "true" => SqlValue::Bool(true),
                "false" => SqlValue::Bool(false),
                "null" => SqlValue::Null,
                _ => SqlValue::String(arg.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_from() {
        assert_eq!(SqlValue::from(true), SqlValue::Bool(true));
        assert_eq!(SqlValue::from(42i32), SqlValue::Int(42));
        assert_eq!(SqlValue::from(2.5f64), SqlValue::Float(2.5));
        assert_eq!(SqlValue::from("hello"), SqlValue::String("hello".into()));
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(7i64)), SqlValue::Int(7));
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(SqlValue::parse_arg("42"), SqlValue::Int(42));
        assert_eq!(SqlValue::parse_arg("1.5"), SqlValue::Float(1.5));
        assert_eq!(SqlValue::parse_arg("false"), SqlValue::Bool(false));
        assert_eq!(SqlValue::parse_arg("null"), SqlValue::Null);
        assert_eq!(
            SqlValue::parse_arg("foo@bar.com"),
            SqlValue::String("foo@bar.com".into())
        );
    }

    #[tokio::test]
    async fn test_deallocate_unknown_statement_fails() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/sqltag")
            .unwrap();
        let backend = PgBackend::new(pool);
        let err = backend
            .deallocate(&PreparedHandle::new("never-prepared"))
            .await
            .unwrap_err();
        assert!(matches!(err, SqlTagError::Deallocation(_)));
    }

    #[tokio::test]
    async fn test_each_preparation_gets_its_own_handle() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/sqltag")
            .unwrap();
        let backend = PgBackend::new(pool);
        let first = backend.next_handle("one");
        let second = backend.clone().next_handle("one");
        assert_eq!(first.name(), "one_1");
        assert_eq!(second.name(), "one_2");

        // A released handle falls back to the raw SQL.
        let mut query = Query::new("select 1;");
        query.set_prepared(first);
        assert!(backend.statement(&query).is_none());
    }
}
