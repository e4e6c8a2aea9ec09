//! sqltag: inspect and run tagged SQL files.
//!
//! # Usage
//!
//! ```bash
//! # List the queries in a directory of .sql files
//! sqltag list queries/
//!
//! # Show the normalized SQL of one query
//! sqltag show queries/peers.sql find-peer-by-email
//!
//! # Run a query
//! sqltag exec queries/ find-peer-by-email --bind foo@bar.com
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use sqltag::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqltag")]
#[command(version)]
#[command(about = "Named SQL statements from tagged .sql files", long_about = None)]
#[command(after_help = "EXAMPLES:
    sqltag list queries/
    sqltag show 'queries/*.sql' find-peer-by-email
    sqltag exec queries/ find-peer-by-email --bind foo@bar.com --format json")]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List the query names found in a file, directory, or glob
    List {
        /// A .sql file, a directory of .sql files, or a glob pattern
        source: String,
    },
    /// Print the SQL of a single query
    Show {
        source: String,
        /// Query name
        name: String,
    },
    /// Execute a single query
    Exec {
        source: String,
        /// Query name
        name: String,

        /// Positional arguments ($1, $2, etc.)
        #[arg(short, long, value_delimiter = ',')]
        bind: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,

        /// Database connection URL
        #[arg(long, env = "SQLTAG_DATABASE_URL")]
        database_url: Option<String>,

        /// Configuration file (defaults to the user config dir)
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::List { source } => {
            let queries = load_source(&source).await?;
            for name in queries.sorted() {
                println!("{}", name.cyan());
            }
            println!();
            println!("{} query(s) loaded", queries.len().to_string().cyan());
        }
        Commands::Show { source, name } => {
            let queries = load_source(&source).await?;
            let query = queries.get_query(&name)?;
            println!("{} {}", "--".dimmed(), format!("name: {}", name).dimmed());
            println!("{}", query.sql().white());
        }
        Commands::Exec {
            source,
            name,
            bind,
            format,
            database_url,
            config,
        } => {
            let mut db_config = match config {
                Some(path) => DbConfig::load(&path)?,
                None => match DbConfig::default_path().filter(|path| path.exists()) {
                    Some(path) => DbConfig::load(&path)?,
                    None => DbConfig::default(),
                },
            };
            if database_url.is_some() {
                db_config.database_url = database_url;
            }

            let db = Db::connect(&db_config).await?;
            load_into(&db, &source).await?;

            let args: Vec<SqlValue> = bind.iter().map(|arg| SqlValue::parse_arg(arg)).collect();
            if cli.verbose {
                println!("{} {}", "SQL:".dimmed(), db.sql(&name).await?.yellow());
            }

            let mut batch = db.batch();
            batch.queue(&name, args).await?;
            let sent = batch.send().await;
            db.close().await;
            for result in sent? {
                print_result(result, &format);
            }
        }
    }
    Ok(())
}

/// Parse a source without a database connection.
async fn load_source(source: &str) -> Result<QueryMap> {
    let db = Db::with_backend(Offline);
    load_into(&db, source).await?;
    let mut queries = QueryMap::new();
    for name in db.list().await {
        queries.insert(name.clone(), db.get_query(&name).await?);
    }
    Ok(queries)
}

async fn load_into<B: Backend>(db: &Db<B>, source: &str) -> Result<()> {
    let path = Path::new(source);
    let loaded = if path.is_dir() {
        db.load_dir(path).await
    } else if path.is_file() {
        db.load_files(&[path]).await
    } else {
        db.load_glob(source).await
    };
    loaded.with_context(|| format!("loading {}", source))
}

/// Backend used when only parsing; nothing is ever prepared.
struct Offline;

#[async_trait::async_trait]
impl Backend for Offline {
    async fn prepare(&self, name: &str, _sql: &str) -> SqlTagResult<PreparedHandle> {
        Err(SqlTagError::prepare(name, "no database connection"))
    }

    async fn deallocate(&self, _handle: &PreparedHandle) -> SqlTagResult<()> {
        Ok(())
    }
}

fn print_result(result: BatchResult, format: &OutputFormat) {
    let affected = result.rows_affected();
    let rows = result.into_rows();
    if rows.is_empty() {
        println!("{} {} rows affected", "✓".green(), affected);
        return;
    }
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(&rows) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} {}", "Error:".red().bold(), e),
        },
        OutputFormat::Table => {
            let table = Table::new(&rows);
            println!("{}", table.header().white().bold());
            println!("{}", table.rule().dimmed());
            for line in table.lines() {
                println!("{}", line);
            }
            println!();
            println!("{} row(s) returned", rows.len().to_string().cyan());
        }
    }
}

/// Rows laid out in aligned text columns, ordered by column name.
struct Table {
    columns: Vec<String>,
    widths: Vec<usize>,
    cells: Vec<Vec<String>>,
}

impl Table {
    fn new(rows: &[Row]) -> Self {
        let columns: Vec<String> = rows
            .iter()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let cells: Vec<Vec<String>> = rows
            .iter()
            .map(|row| columns.iter().map(|col| cell(row.get(col))).collect())
            .collect();
        let widths = columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                cells
                    .iter()
                    .map(|line| line[i].chars().count())
                    .chain([col.chars().count()])
                    .max()
                    .unwrap_or_default()
            })
            .collect();

        Self {
            columns,
            widths,
            cells,
        }
    }

    fn pad(&self, values: &[String]) -> String {
        values
            .iter()
            .zip(&self.widths)
            .map(|(value, width)| format!("{:width$}", value, width = *width))
            .collect::<Vec<_>>()
            .join(" │ ")
    }

    fn header(&self) -> String {
        self.pad(&self.columns)
    }

    fn rule(&self) -> String {
        self.widths
            .iter()
            .map(|width| "─".repeat(*width))
            .collect::<Vec<_>>()
            .join("─┼─")
    }

    fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.cells.iter().map(|line| self.pad(line))
    }
}

fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "NULL".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
