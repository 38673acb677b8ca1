//! Shared SQLite plumbing for the persistent-store crates (RelayStore,
//! ValidStore, PendingSerials, XreqStore, ProcessQueue).
//!
//! The node core keeps one `SqlitePool` per on-disk database file, capped
//! at a single connection: SQLite only ever allows one writer, so a larger
//! pool would just serialize at the database lock anyway while adding
//! contention and surprising "database is locked" errors at the pool layer
//! instead of at a place callers can reason about.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Opens (creating if needed) a single-writer SQLite pool tuned for the
/// node's embedded-database usage: WAL journaling so readers never block
/// behind a writer, and a busy timeout so transient lock contention between
/// the pipeline threads resolves with a wait rather than an immediate error.
pub async fn open(path: impl AsRef<Path>) -> cc_error::Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

/// Opens an in-memory pool, for tests.
pub async fn open_in_memory() -> cc_error::Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(opts).await?;
    Ok(pool)
}

/// Runs `body` inside a transaction, committing on `Ok` and rolling back on
/// `Err` or panic. Every store mutation that touches more than one table
/// (insert a row then update a counter, delete-then-reinsert on a status
/// transition, ...) goes through this so a crash mid-update can never leave
/// the database in a state the in-memory pipeline no longer agrees with.
pub async fn with_txn<'p, F, Fut, T>(pool: &'p SqlitePool, body: F) -> cc_error::Result<T>
where
    F: FnOnce(Transaction<'p, Sqlite>) -> Fut,
    Fut: std::future::Future<Output = cc_error::Result<(Transaction<'p, Sqlite>, T)>>,
{
    let txn = pool.begin().await?;
    let (txn, value) = body(txn).await?;
    txn.commit().await?;
    Ok(value)
}
