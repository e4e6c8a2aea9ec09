//! A single named statement and its prepared state.

use std::fmt;

/// Opaque identifier of a server-side prepared statement.
///
/// Handed out by a [`Backend`](crate::backend::Backend) when it prepares a
/// statement, and handed back to it to deallocate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreparedHandle(String);

impl PreparedHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The statement name registered on the server.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreparedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The SQL text of one logical statement, plus its prepared handle once
/// the backend has prepared it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    sql: String,
    prepared: Option<PreparedHandle>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            prepared: None,
        }
    }

    /// The raw, normalized SQL text.
    pub fn raw_sql(&self) -> &str {
        &self.sql
    }

    pub fn prepared(&self) -> Option<&PreparedHandle> {
        self.prepared.as_ref()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// The text to send to the server: the prepared statement name when
    /// prepared, otherwise the raw SQL.
    pub fn sql(&self) -> &str {
        match &self.prepared {
            Some(handle) => handle.name(),
            None => &self.sql,
        }
    }

    /// Append one line fragment, joined to the existing body by a single space.
    pub(crate) fn push_fragment(&mut self, fragment: &str) {
        if self.sql.is_empty() {
            self.sql.push_str(fragment);
        } else {
            self.sql.push(' ');
            self.sql.push_str(fragment);
        }
    }

    pub(crate) fn set_prepared(&mut self, handle: PreparedHandle) {
        self.prepared = Some(handle);
    }

    /// Detach the prepared handle, leaving the query unprepared.
    pub(crate) fn take_prepared(&mut self) -> Option<PreparedHandle> {
        self.prepared.take()
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::new(sql)
    }
}
