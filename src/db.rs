//! SQLite pool setup and in-code schema bootstrap.
//!
//! The schema is created with `CREATE TABLE IF NOT EXISTS` at startup; there
//! is no external migration tooling. Timestamps are stored as fixed-width
//! RFC 3339 UTC strings (microsecond precision, `Z` suffix) so that SQL
//! comparisons and ordering match chronological order. UUIDs are stored as
//! their canonical text form.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

/// Format a timestamp in the canonical stored representation.
///
/// Fixed-width microsecond precision with a `Z` suffix: lexicographic
/// ordering of stored values equals chronological ordering.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into a [`DateTime<Utc>`].
///
/// # Errors
///
/// Returns an error when the value is not valid RFC 3339.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Open a SQLite pool for the given database URL, creating the file if needed.
///
/// # Errors
///
/// Returns an error when the URL is malformed or the database cannot be opened.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));
    // An in-memory database exists per connection; cap the pool at one so
    // every query sees the same database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create all tables and indexes if they do not exist yet.
///
/// # Errors
///
/// Returns an error when any DDL statement fails.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    info!("database schema ready");
    Ok(())
}

/// Record a successful login, inserting or refreshing the user row.
///
/// Best-effort: callers treat a failure as non-fatal and log it.
///
/// # Errors
///
/// Returns the underlying database error.
pub async fn upsert_user(
    pool: &SqlitePool,
    user_id: Uuid,
    email: &str,
    name: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = fmt_ts(Utc::now());
    sqlx::query(
        "INSERT INTO users (user_id, email, full_name, created_at, last_login) \
         VALUES (?1, ?2, ?3, ?4, ?4) \
         ON CONFLICT(user_id) DO UPDATE SET email = ?2, full_name = ?3, last_login = ?4",
    )
    .bind(user_id.to_string())
    .bind(email)
    .bind(name)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a login without failing the caller; errors are logged.
pub async fn record_login(pool: &SqlitePool, user_id: Uuid, email: &str, name: Option<&str>) {
    if let Err(err) = upsert_user(pool, user_id, email, name).await {
        warn!(user = %user_id, error = %err, "user upsert failed (non-fatal)");
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
    user_id     TEXT PRIMARY KEY,
    email       TEXT NOT NULL UNIQUE,
    full_name   TEXT,
    created_at  TEXT NOT NULL,
    last_login  TEXT
);

CREATE TABLE IF NOT EXISTS group_mappings (
    group_id         TEXT PRIMARY KEY,
    role_name        TEXT NOT NULL,
    allowed_projects TEXT NOT NULL DEFAULT '[]',
    description      TEXT
);

CREATE TABLE IF NOT EXISTS vault_secrets (
    secret_id     TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL,
    service_name  TEXT NOT NULL,
    sealed_value  TEXT NOT NULL,
    key_version   TEXT NOT NULL DEFAULT 'v1',
    created_by    TEXT,
    created_at    TEXT NOT NULL,
    UNIQUE (project_id, service_name)
);

CREATE TABLE IF NOT EXISTS drafts (
    draft_id        TEXT PRIMARY KEY,
    owner_id        TEXT,
    project_id      TEXT NOT NULL,
    title           TEXT NOT NULL,
    content         TEXT NOT NULL DEFAULT '{}',
    runtime_env     TEXT,
    status          TEXT NOT NULL DEFAULT 'DRAFT'
                    CHECK (status IN ('DRAFT', 'PENDING', 'APPROVED', 'REJECTED')),
    locked_by       TEXT,
    lock_expires_at TEXT,
    is_deleted      INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    CHECK ((locked_by IS NULL) = (lock_expires_at IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_drafts_project ON drafts (project_id, updated_at);

CREATE TABLE IF NOT EXISTS telemetry_logs (
    record_id        TEXT PRIMARY KEY,
    timestamp        TEXT NOT NULL,
    user_id          TEXT,
    project_id       TEXT,
    model_name       TEXT,
    request_payload  TEXT,
    response_payload TEXT,
    cost_micros      INTEGER NOT NULL DEFAULT 0,
    latency_ms       INTEGER NOT NULL DEFAULT 0,
    outcome          TEXT NOT NULL DEFAULT 'ok'
);
CREATE INDEX IF NOT EXISTS idx_telemetry_time ON telemetry_logs (timestamp);

CREATE TABLE IF NOT EXISTS telemetry_dead_letters (
    record_id   TEXT PRIMARY KEY,
    payload     TEXT NOT NULL,
    error       TEXT NOT NULL,
    failed_at   TEXT NOT NULL
);
";
