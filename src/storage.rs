use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::result::{ConnectionError, ConnectionResult};
use diesel::sqlite::SqliteConnection;

use crate::error::ApiError;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY NOT NULL,
    document TEXT NOT NULL,
    snapshot TEXT,
    review_submitted_at TIMESTAMP,
    created_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS review_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    order_id TEXT NOT NULL,
    user_id TEXT,
    recipient TEXT,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMP NOT NULL,
    delivered_at TIMESTAMP NOT NULL,
    send_at TIMESTAMP NOT NULL,
    expires_at TIMESTAMP NOT NULL,
    sent_at TIMESTAMP,
    used_at TIMESTAMP,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_review_jobs_due ON review_jobs (status, send_at);

CREATE TABLE IF NOT EXISTS reviews (
    id TEXT PRIMARY KEY NOT NULL,
    order_id TEXT NOT NULL,
    user_id TEXT,
    rating INTEGER NOT NULL,
    comment TEXT,
    source TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL
);
";

pub fn establish_connection(database_url: &str) -> ConnectionResult<SqliteConnection> {
    let mut connection = SqliteConnection::establish(database_url)?;

    // The sweep worker and the HTTP handlers each open their own
    // connection; without a busy timeout a write racing another write
    // surfaces as SQLITE_BUSY instead of waiting for the lock.
    connection
        .batch_execute("PRAGMA busy_timeout = 5000;")
        .map_err(ConnectionError::CouldntSetupConfiguration)?;

    Ok(connection)
}

/// Opens a connection for a single request, mapping failures to the
/// generic internal error so nothing about the database leaks outward.
pub fn request_connection(database_url: &str) -> Result<SqliteConnection, ApiError> {
    establish_connection(database_url).map_err(|e| {
        log::error!("Failed to open database connection. {}", e);
        ApiError::Internal
    })
}

pub fn ensure_schema(connection: &mut SqliteConnection) -> QueryResult<()> {
    connection.batch_execute(SCHEMA_SQL)
}

#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
    let mut connection =
        establish_connection(":memory:").expect("in-memory sqlite is always available");
    ensure_schema(&mut connection).expect("schema applies cleanly");
    connection
}
