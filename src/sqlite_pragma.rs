//! Connection PRAGMAs shared by every rollup connection

use rusqlite::Connection;
use std::time::Duration;

/// Apply WAL journaling and related tuning to a fresh connection
///
/// - `journal_mode = WAL`: readers never block the single writer
/// - `synchronous = NORMAL`: safe with WAL, fewer fsyncs
/// - `temp_store = MEMORY`
/// - `wal_autocheckpoint = 1000` pages
/// - `busy_timeout`: how long a writer waits for the write lock before
///   SQLITE_BUSY surfaces
pub fn apply_optimized_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    log::debug!("SQLite journal_mode = {}", mode);
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    let _: i64 = conn.pragma_update_and_check(None, "wal_autocheckpoint", 1000, |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_pragmas_enable_wal() {
        let file = NamedTempFile::new().unwrap();
        let conn = Connection::open(file.path()).unwrap();
        apply_optimized_pragmas(&conn, Duration::from_millis(250)).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 250);
    }
}
