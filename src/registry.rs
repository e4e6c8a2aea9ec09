//! Name → query storage.
//!
//! [`QueryMap`] is the plain associative store produced by the parser (a
//! "fragment") and merged into the live [`Registry`] owned by the
//! [`Db`](crate::db::Db) facade. The registry also carries the counter used
//! to mint names for untagged statements.

use std::collections::HashMap;
use std::collections::hash_map;

use crate::error::{SqlTagError, SqlTagResult};
use crate::query::Query;

/// Queries keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    queries: HashMap<String, Query>,
}

impl QueryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge maps into a new one. Names declared more than once keep the
    /// value of their last occurrence.
    pub fn merge<I>(maps: I) -> QueryMap
    where
        I: IntoIterator<Item = QueryMap>,
    {
        let mut merged = QueryMap::new();
        for map in maps {
            merged.queries.extend(map.queries);
        }
        merged
    }

    /// Look up a query by name.
    pub fn get_query(&self, name: &str) -> SqlTagResult<&Query> {
        self.queries
            .get(name)
            .ok_or_else(|| SqlTagError::UnknownQuery(name.to_string()))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Query> {
        self.queries.get_mut(name)
    }

    /// The query stored under `name`, created empty if absent.
    pub(crate) fn entry(&mut self, name: &str) -> &mut Query {
        self.queries.entry(name.to_string()).or_default()
    }

    /// All names in ascending lexicographic order.
    pub fn sorted(&self) -> Vec<String> {
        let mut index: Vec<String> = self.queries.keys().cloned().collect();
        index.sort();
        index
    }

    /// Insert a query, returning whatever was stored under that name before.
    pub fn insert(&mut self, name: impl Into<String>, query: Query) -> Option<Query> {
        self.queries.insert(name.into(), query)
    }

    pub fn remove(&mut self, name: &str) -> Option<Query> {
        self.queries.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, Query> {
        self.queries.iter()
    }
}

impl<K: Into<String>, Q: Into<Query>> FromIterator<(K, Q)> for QueryMap {
    fn from_iter<T: IntoIterator<Item = (K, Q)>>(iter: T) -> Self {
        Self {
            queries: iter
                .into_iter()
                .map(|(name, query)| (name.into(), query.into()))
                .collect(),
        }
    }
}

impl IntoIterator for QueryMap {
    type Item = (String, Query);
    type IntoIter = hash_map::IntoIter<String, Query>;

    fn into_iter(self) -> Self::IntoIter {
        self.queries.into_iter()
    }
}

/// The live registry: every loaded query plus the auto-name counter.
#[derive(Debug, Default)]
pub struct Registry {
    queries: QueryMap,
    serial: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queries(&self) -> &QueryMap {
        &self.queries
    }

    pub(crate) fn queries_mut(&mut self) -> &mut QueryMap {
        &mut self.queries
    }

    /// Next value used to name an untagged statement.
    pub fn serial(&self) -> usize {
        self.serial
    }

    /// Fold a parsed fragment in, advancing the counter to `serial`.
    ///
    /// Returns the displaced records that still hold a prepared handle; the
    /// caller is responsible for releasing them.
    pub fn install(&mut self, fragment: QueryMap, serial: usize) -> Vec<(String, Query)> {
        let mut displaced = Vec::new();
        for (name, query) in fragment {
            if let Some(old) = self.queries.insert(name.clone(), query) {
                if old.is_prepared() {
                    displaced.push((name, old));
                }
            }
        }
        self.serial = self.serial.max(serial);
        displaced
    }

    /// Remove a single query.
    pub fn take(&mut self, name: &str) -> Option<Query> {
        self.queries.remove(name)
    }

    /// Remove every query and reset the counter to zero.
    pub fn drain(&mut self) -> QueryMap {
        self.serial = 0;
        std::mem::take(&mut self.queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::PreparedHandle;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_last_occurrence_wins() {
        let first: QueryMap = [("one", "select 1;"), ("two", "select old;")]
            .into_iter()
            .collect();
        let second: QueryMap = [("two", "select 2"), ("three", "select 3")]
            .into_iter()
            .collect();

        let merged = QueryMap::merge([first, second]);

        let expected: QueryMap = [
            ("one", "select 1;"),
            ("two", "select 2"),
            ("three", "select 3"),
        ]
        .into_iter()
        .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_get_query_unknown() {
        let map = QueryMap::new();
        match map.get_query("missing") {
            Err(SqlTagError::UnknownQuery(name)) => assert_eq!(name, "missing"),
            other => panic!("expected UnknownQuery, got {:?}", other),
        }
    }

    #[test]
    fn test_sorted_is_lexicographic() {
        let map: QueryMap = [("b", ""), ("a", ""), ("000000", "")].into_iter().collect();
        assert_eq!(map.sorted(), vec!["000000", "a", "b"]);
    }

    #[test]
    fn test_install_reports_displaced_prepared() {
        let mut registry = Registry::new();
        let mut prepared = Query::new("select old;");
        prepared.set_prepared(PreparedHandle::new("two"));
        registry.queries_mut().insert("two", prepared);
        registry.queries_mut().insert("one", Query::new("select 1;"));

        let fragment: QueryMap = [("one", "select uno;"), ("two", "select 2;")]
            .into_iter()
            .collect();
        let displaced = registry.install(fragment, 3);

        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].0, "two");
        assert_eq!(displaced[0].1.raw_sql(), "select old;");
        assert_eq!(registry.queries().get_query("two").unwrap().sql(), "select 2;");
        assert_eq!(registry.serial(), 3);
    }

    #[test]
    fn test_drain_resets_serial() {
        let mut registry = Registry::new();
        registry.install([("000000", "select 1;")].into_iter().collect(), 1);
        assert_eq!(registry.serial(), 1);

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.queries().is_empty());
        assert_eq!(registry.serial(), 0);
    }
}
