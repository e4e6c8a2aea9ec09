//! Batches of named queries, sent as one unit.
//!
//! Names are resolved when queued, so later changes to the registry do not
//! affect a batch that is already built.

use sqlx::PgConnection;

use crate::backend::{PgBackend, Row, SqlValue, row_to_map};
use crate::db::Db;
use crate::error::{SqlTagError, SqlTagResult};
use crate::query::Query;

/// Queued statements waiting to be sent.
pub struct Batch<'a> {
    db: &'a Db<PgBackend>,
    queued: Vec<(Query, Vec<SqlValue>)>,
}

/// What one statement of a sent batch produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    rows_affected: u64,
    rows: Vec<Row>,
}

impl BatchResult {
    pub fn new(rows_affected: u64, rows: Vec<Row>) -> Self {
        Self { rows_affected, rows }
    }

    /// Affected-row count reported by the server.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Rows returned by the statement, empty for plain commands.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// The first returned row, as when the statement is run for one row.
    pub fn row(&self) -> SqlTagResult<&Row> {
        self.rows
            .first()
            .ok_or_else(|| SqlTagError::Execution("no rows returned".to_string()))
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl Db<PgBackend> {
    /// Start a new, empty batch.
    pub fn batch(&self) -> Batch<'_> {
        Batch {
            db: self,
            queued: Vec::new(),
        }
    }
}

impl<'a> Batch<'a> {
    /// Queue the named query with its arguments.
    pub async fn queue(&mut self, name: &str, args: Vec<SqlValue>) -> SqlTagResult<()> {
        let query = self.db.get_query(name).await?;
        self.queued.push((query, args));
        Ok(())
    }

    /// Queue every registered query, sorted by name, without arguments.
    ///
    /// Auto-numbered queries sort in the order they were parsed, which makes
    /// this suitable for running a directory of migrations.
    pub async fn queue_all(&mut self) {
        let registry = self.db.registry().await;
        let mut queries: Vec<_> = registry.queries().iter().collect();
        queries.sort_by(|a, b| a.0.cmp(b.0));
        self.queued
            .extend(queries.into_iter().map(|(_, query)| (query.clone(), Vec::new())));
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Text to send for each queued statement, in queue order.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.queued.iter().map(|(query, _)| query.sql())
    }

    /// Send every queued statement in a single transaction, returning one
    /// result per statement in queue order.
    pub async fn send(self) -> SqlTagResult<Vec<BatchResult>> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| SqlTagError::Connection(e.to_string()))?;
        let results = self.run(&mut tx).await?;
        tx.commit()
            .await
            .map_err(|e| SqlTagError::Execution(e.to_string()))?;
        Ok(results)
    }

    pub(crate) async fn run(self, conn: &mut PgConnection) -> SqlTagResult<Vec<BatchResult>> {
        let backend = self.db.backend();
        let mut results = Vec::with_capacity(self.queued.len());
        for (query, args) in &self.queued {
            let (affected, rows) = backend.fetch_results(&mut *conn, query, args).await?;
            results.push(BatchResult::new(affected, rows.iter().map(row_to_map).collect()));
        }
        tracing::debug!("Sent batch of {} statements", results.len());
        Ok(results)
    }
}
