//! # sqltag: named SQL from tagged `.sql` files
//!
//! Write SQL in plain files, name each statement with a tag comment, and
//! run it by name.
//!
//! ```sql
//! -- name: find-peer-by-email
//! SELECT name, email FROM peers
//! WHERE email = $1;
//!
//! -- name: create-peer
//! INSERT INTO peers (name, email) VALUES ($1, $2);
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use sqltag::prelude::*;
//!
//! let db = Db::connect(&DbConfig::default()).await?;
//! db.load_dir("queries").await?;
//!
//! db.exec("create-peer", &["Foo Bar".into(), "foo@bar.com".into()]).await?;
//! let peer = db.query_row("find-peer-by-email", &["foo@bar.com".into()]).await?;
//! ```
//!
//! ## Source format
//!
//! | Line                    | Meaning                                   |
//! |-------------------------|-------------------------------------------|
//! | `-- name: <tag>`        | Starts the statement called `<tag>`       |
//! | `-- ...`                | Comment, ignored                          |
//! | `/*` .. `*/`            | Block comment, ignored                    |
//! | `... ;`                 | Ends the current statement                |
//! | `$$` .. `$$`            | Function body, `;` does not end it        |
//!
//! Statements without a tag are numbered `000000`, `000001`, ... in the
//! order they are loaded.

pub mod backend;
pub mod batch;
pub mod config;
pub mod db;
pub mod error;
pub mod loader;
pub mod parser;
pub mod query;
pub mod registry;
pub mod tx;

pub mod prelude {
    pub use crate::backend::{Backend, PgBackend, Row, SqlValue};
    pub use crate::batch::{Batch, BatchResult};
    pub use crate::config::DbConfig;
    pub use crate::db::{Db, init_db};
    pub use crate::error::*;
    pub use crate::parser::{parse, parse_str};
    pub use crate::query::{PreparedHandle, Query};
    pub use crate::registry::{QueryMap, Registry};
    pub use crate::tx::Tx;
}

/// Parse tagged SQL text into a map of named queries.
///
/// # Example
///
/// ```
/// let queries = sqltag::parse("-- name: one\nselect 1;\nselect 2;\n").unwrap();
/// assert_eq!(queries.sorted(), vec!["000000", "one"]);
/// assert_eq!(queries.get_query("one").unwrap().sql(), "select 1;");
/// ```
pub fn parse(input: &str) -> Result<registry::QueryMap, error::SqlTagError> {
    parser::parse_str(input, 0).map(|(queries, _)| queries)
}
