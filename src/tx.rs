//! Transactions over named queries.

use sqlx::{Postgres, Transaction};

use crate::backend::{PgBackend, Row, SqlValue, row_to_map};
use crate::batch::{Batch, BatchResult};
use crate::db::Db;
use crate::error::{SqlTagError, SqlTagResult};
use crate::query::PreparedHandle;

/// A database transaction that resolves query names through its [`Db`].
///
/// Dropping a `Tx` without committing rolls it back.
pub struct Tx<'a> {
    db: &'a Db<PgBackend>,
    inner: Transaction<'static, Postgres>,
}

impl Db<PgBackend> {
    /// Begin a transaction.
    pub async fn begin(&self) -> SqlTagResult<Tx<'_>> {
        let inner = self
            .pool()
            .begin()
            .await
            .map_err(|e| SqlTagError::Connection(e.to_string()))?;
        Ok(Tx { db: self, inner })
    }
}

impl<'a> Tx<'a> {
    /// Prepare the named query on this transaction's connection.
    ///
    /// The handle is recorded in the shared registry, so later executions
    /// outside the transaction use it too.
    pub async fn prepare(&mut self, name: &str) -> SqlTagResult<PreparedHandle> {
        let query = self.db.get_query(name).await?;
        if let Some(handle) = query.prepared() {
            return Ok(handle.clone());
        }
        let handle = self
            .db
            .backend()
            .prepare_on(&mut *self.inner, name, query.raw_sql())
            .await?;
        self.db.adopt(name, query.raw_sql(), handle).await
    }

    /// Run the named query, returning all rows.
    pub async fn query(&mut self, name: &str, args: &[SqlValue]) -> SqlTagResult<Vec<Row>> {
        let query = self.db.get_query(name).await?;
        let rows = self
            .db
            .backend()
            .fetch_all(&mut *self.inner, &query, args)
            .await?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    /// Run the named query, returning exactly one row.
    pub async fn query_row(&mut self, name: &str, args: &[SqlValue]) -> SqlTagResult<Row> {
        let query = self.db.get_query(name).await?;
        let row = self
            .db
            .backend()
            .fetch_one(&mut *self.inner, &query, args)
            .await?;
        Ok(row_to_map(&row))
    }

    /// Execute the named query, returning the number of affected rows.
    pub async fn exec(&mut self, name: &str, args: &[SqlValue]) -> SqlTagResult<u64> {
        let query = self.db.get_query(name).await?;
        self.db
            .backend()
            .execute(&mut *self.inner, &query, args)
            .await
    }

    /// Start a batch whose queries resolve against the same registry.
    pub fn batch(&self) -> Batch<'a> {
        self.db.batch()
    }

    /// Send a batch inside this transaction, returning one result per
    /// queued statement.
    pub async fn send_batch(&mut self, batch: Batch<'_>) -> SqlTagResult<Vec<BatchResult>> {
        batch.run(&mut self.inner).await
    }

    pub async fn commit(self) -> SqlTagResult<()> {
        self.inner
            .commit()
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))
    }

    pub async fn rollback(self) -> SqlTagResult<()> {
        self.inner
            .rollback()
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))
    }
}
