use chrono::Utc;
use rusqlite::Error::InvalidParameterName;
use rusqlite::{params, Connection, Result as SqliteResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Extra diagnostics for I/O failures on settings writes; the error itself
/// is still returned to the caller.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!("[DB] {}: Disk full. Settings cannot be persisted.", context);
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check the profile directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Хранилище настроек расширения (SQLite)
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Poisoned mutex is reported as a storage error
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, throwaway profiles)
    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SqliteResult<Self> {
        // Повреждённый профиль: отказываемся открывать, а не читаем мусор
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        // WAL переживает аварийное завершение процесса без порчи файла
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[DB] WAL unavailable ({}), settings use the default journal",
                    e
                );
            })
            .ok();
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Stored in PRAGMA user_version
    const SCHEMA_VERSION: i32 = 2;

    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
                [],
            )?;
        }

        // Migration 2: updated_at (idempotent ALTER)
        if current < 2 {
            let _ = conn.execute(
                "ALTER TABLE settings ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0",
                [],
            );
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Записать настройку (JSON-текст значения)
    /// GUARD: транзакция, чтобы не оставить частичную запись
    pub fn save_setting(&self, key: &str, value_json: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp_millis();

        conn.execute("BEGIN IMMEDIATE TRANSACTION", [])
            .map_err(|e| {
                log_io_error_if_any("save_setting begin", &e);
                error!("[DB] Failed to begin transaction: {}", e);
                e
            })?;

        let result = conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value_json, now],
        );

        match result {
            Ok(_) => {
                conn.execute("COMMIT", []).map_err(|e| {
                    log_io_error_if_any("save_setting commit", &e);
                    error!("[DB] Failed to commit transaction: {}", e);
                    let _ = conn.execute("ROLLBACK", []);
                    e
                })?;
                Ok(())
            }
            Err(e) => {
                log_io_error_if_any("save_setting", &e);
                error!("[DB] Failed to save setting '{}': {}. Rolling back.", key, e);
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    #[cfg(test)]
    pub fn load_setting(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(row.get(0)?));
        }
        Ok(None)
    }

    pub fn load_settings(&self) -> SqliteResult<HashMap<String, String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect()
    }
}
