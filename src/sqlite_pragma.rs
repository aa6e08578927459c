//! Shared SQLite connection tuning
//!
//! Every handle opened by the stores goes through `apply_optimized_pragmas` so the
//! query log and the results table see the same journal and locking behaviour.

use rusqlite::Connection;
use std::time::Duration;

/// Busy timeout for writers waiting on another connection's transaction
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply WAL, NORMAL sync, in-memory temp store, mmap, page cache and autocheckpoint
///
/// In-memory databases ignore the journal mode (SQLite reports `memory`), which is fine.
pub fn apply_optimized_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -16_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    Ok(())
}
