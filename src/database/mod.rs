use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::errors::{DbError, DomainResult};

/// Default number of pooled connections for the server process
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Open (creating if necessary) the SQLite database at `database_url`.
pub async fn connect(database_url: &str) -> DomainResult<SqlitePool> {
    connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
}

pub async fn connect_with(database_url: &str, max_connections: u32) -> DomainResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(DbError::from)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(DbError::from)?;

    Ok(pool)
}
