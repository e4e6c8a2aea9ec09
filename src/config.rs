//! Connection configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::error::{SqlTagError, SqlTagResult};

/// Database configuration, usually read from `config.toml`.
///
/// ```toml
/// name = "app"
/// host = "/run/postgresql"
/// user = "postgres"
/// max_connections = 10
/// sql_path = "queries"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Full connection URL; overrides the discrete fields below when set.
    pub database_url: Option<String>,
    /// PostgreSQL database name
    pub name: String,
    /// PostgreSQL host (or unix socket directory)
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Maximum connection pool size
    pub max_connections: u32,
    /// Application name reported to PostgreSQL
    pub application_name: Option<String>,
    /// Directory of `.sql` files loaded by [`init_db`](crate::db::init_db)
    pub sql_path: Option<PathBuf>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            name: "sqltag".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            max_connections: 5,
            application_name: Some("sqltag".to_string()),
            sql_path: None,
        }
    }
}

impl DbConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> SqlTagResult<Self> {
        toml::from_str(content)
            .map_err(|e| SqlTagError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Read a configuration file.
    pub fn load(path: impl AsRef<Path>) -> SqlTagResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SqlTagError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// `<config dir>/sqltag/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sqltag").join("config.toml"))
    }

    /// sqlx connection options for this configuration.
    pub fn connect_options(&self) -> SqlTagResult<PgConnectOptions> {
        let mut options = match &self.database_url {
            Some(url) => url
                .parse::<PgConnectOptions>()
                .map_err(|e| SqlTagError::Config(format!("Invalid database URL: {}", e)))?,
            None => {
                let mut options = PgConnectOptions::new()
                    .host(&self.host)
                    .port(self.port)
                    .username(&self.user)
                    .database(&self.name);
                if let Some(password) = &self.password {
                    options = options.password(password);
                }
                options
            }
        };
        if let Some(application_name) = &self.application_name {
            options = options.application_name(application_name);
        }
        Ok(options)
    }
}
