//! Local SQLite database layer for the dispenser gateway.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! and the shared connection handle used by the credit ledger and the
//! configuration loader.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/dispenser.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. The credit log is an audit trail, so
/// unlike a cache it is never deleted to recover from an open failure.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("dispenser.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Database open failed ({first_err}), retrying once");
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a private in-memory database with the full schema applied.
pub fn open_in_memory() -> Result<DbState, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings store and the credit log.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- credit_log (append-mostly; rows are never deleted)
        CREATE TABLE IF NOT EXISTS credit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_ref TEXT NOT NULL,
            employee_ref TEXT,
            session_ref TEXT NOT NULL,
            order_line_ref TEXT,
            product_name TEXT NOT NULL DEFAULT '',
            plu_no TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            server_no INTEGER NOT NULL,
            success INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            response_payload TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_credit_log_session ON credit_log(session_ref);
        CREATE INDEX IF NOT EXISTS idx_credit_log_line ON credit_log(order_line_ref);
        CREATE INDEX IF NOT EXISTS idx_credit_log_created_at ON credit_log(created_at);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: credit lifecycle and cancellation tracking.
///
/// Rows written before v2 have no status; successful ones are backfilled as
/// `sent` so they remain reversible.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        ALTER TABLE credit_log ADD COLUMN status TEXT
            CHECK (status IS NULL OR status IN ('sent', 'served', 'cancelled', 'refunded'));
        ALTER TABLE credit_log ADD COLUMN credit_id TEXT;
        ALTER TABLE credit_log ADD COLUMN is_cancellation INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE credit_log ADD COLUMN cancelled_at TEXT;
        ALTER TABLE credit_log ADD COLUMN cancelled_by TEXT;
        ALTER TABLE credit_log ADD COLUMN cancellation_response TEXT;

        UPDATE credit_log SET status = 'sent' WHERE status IS NULL AND success = 1;

        CREATE INDEX IF NOT EXISTS idx_credit_log_status ON credit_log(status);
        CREATE INDEX IF NOT EXISTS idx_credit_log_credit_id ON credit_log(credit_id);
        CREATE INDEX IF NOT EXISTS idx_credit_log_plu_session ON credit_log(plu_no, session_ref);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (credit lifecycle columns)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        assert!(tables.contains(&"local_settings".to_string()));
        assert!(tables.contains(&"credit_log".to_string()));

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run is a no-op");
    }

    #[test]
    fn test_migration_v2_backfills_legacy_rows() {
        let conn = test_db();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TEXT);",
        )
        .unwrap();
        migrate_v1(&conn).expect("v1");

        conn.execute(
            "INSERT INTO credit_log (user_ref, session_ref, plu_no, server_no, success, created_at)
             VALUES ('u1', 's1', '7', 3, 1, '2026-01-01T10:00:00Z'),
                    ('u1', 's1', '8', 3, 0, '2026-01-01T10:00:01Z')",
            [],
        )
        .unwrap();

        run_migrations(&conn).expect("v2 over legacy data");

        let statuses: Vec<Option<String>> = conn
            .prepare("SELECT status FROM credit_log ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(statuses, vec![Some("sent".to_string()), None]);
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        let bad = conn.execute(
            "INSERT INTO credit_log (user_ref, session_ref, plu_no, server_no, success, status, created_at)
             VALUES ('u1', 's1', '7', 3, 1, 'lost', '2026-01-01T10:00:00Z')",
            [],
        );
        assert!(bad.is_err(), "status outside the closed set must be rejected");
    }

    #[test]
    fn test_settings_upsert() {
        let conn = test_db();
        run_migrations(&conn).unwrap();

        set_setting(&conn, "dispenser", "server_no", "2").expect("set");
        assert_eq!(
            get_setting(&conn, "dispenser", "server_no"),
            Some("2".to_string())
        );

        set_setting(&conn, "dispenser", "server_no", "4").expect("update");
        assert_eq!(
            get_setting(&conn, "dispenser", "server_no"),
            Some("4".to_string())
        );
        assert!(get_setting(&conn, "dispenser", "missing").is_none());
    }

    #[test]
    fn test_init_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = init(dir.path()).expect("init");
        assert!(state.db_path.ends_with("dispenser.db"));
        assert!(state.db_path.exists());
    }
}
