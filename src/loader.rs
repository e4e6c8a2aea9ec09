//! Loading tagged SQL sources into a [`Db`].
//!
//! Every call parses all of its sources before touching the registry, so a
//! failing source leaves the registry exactly as it was.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::backend::Backend;
use crate::db::Db;
use crate::error::{SqlTagError, SqlTagResult};
use crate::parser;
use crate::registry::QueryMap;

/// Suffix of SQL sources picked up by [`Db::load_dir`].
pub const SQL_SUFFIX: &str = "sql";

impl<B: Backend> Db<B> {
    /// Parse queries from a reader and merge them into the registry.
    ///
    /// Queries without a `-- name:` tag are numbered from the facade's
    /// counter, which keeps counting across calls until [`Db::clear`].
    pub async fn load_sql<R: BufRead + Send>(&self, reader: R) -> SqlTagResult<()> {
        let _loading = self.loading.lock().await;
        let serial = self.registry().await.serial();
        let (fragment, serial) = parser::parse(reader, serial)?;
        self.install(fragment, serial).await
    }

    /// Parse one or more files, in order, and merge them into the registry.
    ///
    /// Stops at the first file that cannot be read or parsed.
    pub async fn load_files<P: AsRef<Path>>(&self, paths: &[P]) -> SqlTagResult<()> {
        if paths.is_empty() {
            return Err(SqlTagError::NoFiles);
        }

        let _loading = self.loading.lock().await;
        let mut serial = self.registry().await.serial();
        let mut fragments = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let source = tokio::fs::read(path)
                .await
                .map_err(|e| SqlTagError::read(path, e))?;
            let (fragment, next) = parser::parse(source.as_slice(), serial)?;
            tracing::debug!("Parsed {} queries from {}", fragment.len(), path.display());
            fragments.push(fragment);
            serial = next;
        }

        self.install(QueryMap::merge(fragments), serial).await
    }

    /// Load every file matching a glob pattern.
    pub async fn load_glob(&self, pattern: &str) -> SqlTagResult<()> {
        let paths = expand_glob(pattern)?;
        self.load_files(&paths).await
    }

    /// Load every `.sql` file in a directory.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> SqlTagResult<()> {
        self.load_glob(&dir_pattern(dir.as_ref())).await
    }

    /// Merge a parsed fragment into the registry, then release the prepared
    /// statements of the queries it displaced.
    async fn install(&self, fragment: QueryMap, serial: usize) -> SqlTagResult<()> {
        let displaced = self.registry_lock().write().await.install(fragment, serial);
        let failures = self.release(displaced).await;
        SqlTagError::deallocation(failures).map_or(Ok(()), Err)
    }
}

/// Expand a glob pattern into the matching paths, in sorted order.
pub fn expand_glob(pattern: &str) -> SqlTagResult<Vec<PathBuf>> {
    glob::glob(pattern)?
        .map(|entry| {
            entry.map_err(|e| {
                let path = e.path().to_path_buf();
                SqlTagError::read(path, e.into_error())
            })
        })
        .collect()
}

/// The glob pattern matching every SQL source directly inside `dir`.
pub fn dir_pattern(dir: &Path) -> String {
    let dir = glob::Pattern::escape(&dir.to_string_lossy());
    format!("{}/*.{}", dir.trim_end_matches('/'), SQL_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::RecordingBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dir_pattern() {
        assert_eq!(dir_pattern(Path::new("queries")), "queries/*.sql");
        assert_eq!(dir_pattern(Path::new("queries/")), "queries/*.sql");
        assert_eq!(dir_pattern(Path::new("q[1]")), "q[[]1[]]/*.sql");
    }

    #[test]
    fn test_malformed_glob() {
        assert!(matches!(expand_glob("queries/***.sql"), Err(SqlTagError::Glob(_))));
    }

    #[tokio::test]
    async fn test_load_files_requires_paths() {
        let db = Db::with_backend(RecordingBackend::default());
        let none: [&str; 0] = [];
        assert!(matches!(db.load_files(&none).await, Err(SqlTagError::NoFiles)));
    }

    #[tokio::test]
    async fn test_counter_continues_across_loads() {
        let db = Db::with_backend(RecordingBackend::default());
        db.load_sql("select 1;\nselect 2;\n".as_bytes()).await.unwrap();
        db.load_sql("select 3;\n".as_bytes()).await.unwrap();
        assert_eq!(db.list().await, vec!["000000", "000001", "000002"]);
        assert_eq!(db.sql("000002").await.unwrap(), "select 3;");
    }

    #[tokio::test]
    async fn test_empty_source_leaves_registry_untouched() {
        let db = Db::with_backend(RecordingBackend::default());
        db.load_sql("-- name: one\nselect 1;\n".as_bytes()).await.unwrap();
        assert!(matches!(
            db.load_sql("-- only a comment\n".as_bytes()).await,
            Err(SqlTagError::EmptyInput)
        ));
        assert_eq!(db.list().await, vec!["one"]);
    }

    #[tokio::test]
    async fn test_redeclared_tag_releases_prepared_statement() {
        let db = Db::with_backend(RecordingBackend::default());
        db.load_sql("-- name: one\nselect 1;\n".as_bytes()).await.unwrap();
        db.prepare("one").await.unwrap();

        db.load_sql("-- name: one\nselect uno;\n".as_bytes()).await.unwrap();

        assert_eq!(db.backend().deallocated(), vec!["one"]);
        let query = db.get_query("one").await.unwrap();
        assert!(!query.is_prepared());
        assert_eq!(query.sql(), "select uno;");
        assert_eq!(db.list().await, vec!["one"]);
    }

    #[tokio::test]
    async fn test_redeclared_tag_reports_failed_release() {
        let db = Db::with_backend(RecordingBackend::failing(&["one"]));
        db.load_sql("-- name: one\nselect 1;\n".as_bytes()).await.unwrap();
        db.prepare("one").await.unwrap();

        let err = db
            .load_sql("-- name: one\nselect uno;\n".as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, SqlTagError::Deallocation(_)));
        assert_eq!(db.sql("one").await.unwrap(), "select uno;");
    }
}
