//! The `Db` facade: owns the live query registry and a [`Backend`].
//!
//! Loading (see [`crate::loader`]) and maintenance operations take the
//! registry's write lock only to install or remove entries; talking to the
//! backend always happens with the lock released.

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::FromRow;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

use crate::backend::{Backend, PgBackend, Row, SqlValue, row_to_map};
use crate::config::DbConfig;
use crate::error::{SqlTagError, SqlTagResult};
use crate::query::{PreparedHandle, Query};
use crate::registry::Registry;

/// Named queries bound to a database backend.
pub struct Db<B: Backend = PgBackend> {
    backend: B,
    registry: RwLock<Registry>,
    /// Serializes loaders so the auto-name counter is threaded in order.
    pub(crate) loading: Mutex<()>,
}

impl<B: Backend> Db<B> {
    /// Create a facade with an empty registry.
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            registry: RwLock::new(Registry::new()),
            loading: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Shared read access for helpers that resolve names.
    pub(crate) async fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().await
    }

    pub(crate) fn registry_lock(&self) -> &RwLock<Registry> {
        &self.registry
    }

    /// True if at least one query is registered.
    pub async fn has_queries(&self) -> bool {
        !self.registry.read().await.queries().is_empty()
    }

    /// All registered query names, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.registry.read().await.queries().sorted()
    }

    /// A copy of the query registered under `name`.
    pub async fn get_query(&self, name: &str) -> SqlTagResult<Query> {
        self.registry
            .read()
            .await
            .queries()
            .get_query(name)
            .cloned()
    }

    /// The text to send for `name`: its prepared statement name if
    /// prepared, otherwise its SQL.
    pub async fn sql(&self, name: &str) -> SqlTagResult<String> {
        self.registry
            .read()
            .await
            .queries()
            .get_query(name)
            .map(|query| query.sql().to_string())
    }

    /// Remove a query, deallocating its prepared statement first if it has
    /// one. The query is removed even when deallocation fails; the failure
    /// is still returned.
    pub async fn drop_query(&self, name: &str) -> SqlTagResult<()> {
        let removed = self.registry.write().await.take(name);
        let failures = self.release(removed.map(|query| (name.to_string(), query))).await;
        SqlTagError::deallocation(failures).map_or(Ok(()), Err)
    }

    /// Remove every query and reset the auto-name counter.
    ///
    /// Every prepared statement is deallocated; failures do not stop the
    /// sweep and are returned together.
    pub async fn clear(&self) -> SqlTagResult<()> {
        let drained = self.registry.write().await.drain();
        let failures = self.release(drained).await;
        SqlTagError::deallocation(failures).map_or(Ok(()), Err)
    }

    /// Deallocate the prepared statements of removed queries, returning
    /// one message per failure.
    pub(crate) async fn release<I>(&self, removed: I) -> Vec<String>
    where
        I: IntoIterator<Item = (String, Query)>,
    {
        let mut failures = Vec::new();
        for (name, mut query) in removed {
            if let Some(handle) = query.take_prepared() {
                if let Err(e) = self.backend.deallocate(&handle).await {
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        failures
    }

    /// Prepare the query registered under `name`.
    ///
    /// Returns the existing handle if the query is already prepared.
    pub async fn prepare(&self, name: &str) -> SqlTagResult<PreparedHandle> {
        let query = self.get_query(name).await?;
        if let Some(handle) = query.prepared() {
            return Ok(handle.clone());
        }
        let handle = self.backend.prepare(name, query.raw_sql()).await?;
        self.adopt(name, query.raw_sql(), handle).await
    }

    /// Attach a freshly prepared handle to the query it was prepared from.
    ///
    /// If the query was prepared concurrently the earlier handle wins. If
    /// it was replaced or dropped meanwhile, preparing fails. Either way the
    /// fresh handle is released.
    pub(crate) async fn adopt(
        &self,
        name: &str,
        sql: &str,
        handle: PreparedHandle,
    ) -> SqlTagResult<PreparedHandle> {
        let mut registry = self.registry.write().await;
        let existing = match registry.queries_mut().get_mut(name) {
            Some(query) if query.raw_sql() == sql => match query.prepared() {
                Some(existing) => Some(existing.clone()),
                None => {
                    query.set_prepared(handle.clone());
                    return Ok(handle);
                }
            },
            _ => None,
        };
        drop(registry);

        let released = self.backend.deallocate(&handle).await;
        match existing {
            Some(existing) => {
                if let Err(e) = released {
                    tracing::warn!("Releasing duplicate statement {}: {}", handle, e);
                }
                Ok(existing)
            }
            None => {
                let mut message = "query changed while preparing".to_string();
                if let Err(e) = released {
                    message = format!("{}; {}", message, e);
                }
                Err(SqlTagError::prepare(name, message))
            }
        }
    }

    /// Prepare every registered query, in sorted order.
    ///
    /// Does not stop at the first failure; all failures are reported in a
    /// single error once every query has been attempted.
    pub async fn prepare_all(&self) -> SqlTagResult<Vec<PreparedHandle>> {
        let mut handles = Vec::new();
        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for name in self.list().await {
            match self.prepare(&name).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    messages.push(e.to_string());
                    failed.push(name);
                }
            }
        }
        if failed.is_empty() {
            Ok(handles)
        } else {
            Err(SqlTagError::prepare(failed.join(", "), messages.join("\n")))
        }
    }

    /// Clear the registry and close the backend. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Err(e) = self.clear().await {
            tracing::warn!("Ignoring errors while closing: {}", e);
        }
        self.backend.close().await;
    }
}

impl Db<PgBackend> {
    /// Connect to PostgreSQL using the given configuration.
    pub async fn connect(config: &DbConfig) -> SqlTagResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| SqlTagError::Connection(e.to_string()))?;
        tracing::info!("Connected to database '{}'", config.name);
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing connection pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self::with_backend(PgBackend::new(pool))
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        self.backend.pool()
    }

    /// Run the named query, returning all rows.
    pub async fn query(&self, name: &str, args: &[SqlValue]) -> SqlTagResult<Vec<Row>> {
        let query = self.get_query(name).await?;
        let rows = self.backend.fetch_all(self.pool(), &query, args).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }

    /// Run the named query, returning exactly one row.
    pub async fn query_row(&self, name: &str, args: &[SqlValue]) -> SqlTagResult<Row> {
        let query = self.get_query(name).await?;
        let row = self.backend.fetch_one(self.pool(), &query, args).await?;
        Ok(row_to_map(&row))
    }

    /// Run the named query, decoding every row into `T`.
    pub async fn query_as<T>(&self, name: &str, args: &[SqlValue]) -> SqlTagResult<Vec<T>>
    where
        T: for<'r> FromRow<'r, PgRow>,
    {
        let query = self.get_query(name).await?;
        let rows = self.backend.fetch_all(self.pool(), &query, args).await?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(|e| SqlTagError::Execution(e.to_string())))
            .collect()
    }

    /// Execute the named query, returning the number of affected rows.
    pub async fn exec(&self, name: &str, args: &[SqlValue]) -> SqlTagResult<u64> {
        let query = self.get_query(name).await?;
        self.backend.execute(self.pool(), &query, args).await
    }
}

/// Connect and load every `.sql` file from `config.sql_path`, if set.
pub async fn init_db(config: &DbConfig) -> SqlTagResult<Db> {
    let db = Db::connect(config).await?;
    if let Some(path) = &config.sql_path {
        db.load_dir(path).await?;
        tracing::debug!("Loaded sql: {:?}", db.list().await);
    }
    Ok(db)
}
