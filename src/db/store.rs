//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create the store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Target state ---

    /// Insert or replace the state of a target.
    pub fn save_target_state(&self, state: &TargetState) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO targets (id, target_type, endpoint, max_delay, next_run_date, base_run_date, is_glpi_server, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                target_type=excluded.target_type, endpoint=excluded.endpoint, max_delay=excluded.max_delay,
                next_run_date=excluded.next_run_date, base_run_date=excluded.base_run_date,
                is_glpi_server=excluded.is_glpi_server, updated_at=CURRENT_TIMESTAMP",
            params![
                state.id,
                state.target_type,
                state.endpoint,
                state.max_delay as i64,
                state.next_run_date,
                state.base_run_date,
                state.is_glpi_server,
            ],
        )?;
        Ok(())
    }

    /// Get the stored state of a target, if any.
    pub fn get_target_state(&self, id: &str) -> Result<Option<TargetState>, DbError> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT id, target_type, endpoint, max_delay, next_run_date, base_run_date, is_glpi_server, updated_at FROM targets WHERE id = ?1",
                params![id],
                row_to_state,
            )
            .optional()?;
        Ok(state)
    }

    /// Get every stored target state.
    pub fn get_target_states(&self) -> Result<Vec<TargetState>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_type, endpoint, max_delay, next_run_date, base_run_date, is_glpi_server, updated_at FROM targets ORDER BY id",
        )?;
        let states = stmt.query_map([], row_to_state)?.collect::<SqlResult<Vec<_>>>()?;
        Ok(states)
    }

    pub fn delete_target_state(&self, id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Agent identity ---

    pub fn get_agent_value(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM agent WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_agent_value(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO agent (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Stored device id, created from the host name on first use.
    pub fn deviceid(&self) -> Result<String, DbError> {
        if let Some(id) = self.get_agent_value("deviceid")? {
            return Ok(id);
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let host = host.split('.').next().unwrap_or("localhost").to_string();
        let id = format!("{}-{}", host, Utc::now().format("%Y-%m-%d-%H-%M-%S"));
        self.set_agent_value("deviceid", &id)?;
        tracing::info!("Store: new device id {}", id);
        Ok(id)
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> SqlResult<TargetState> {
    let updated_at: Option<String> = row.get(7)?;
    Ok(TargetState {
        id: row.get(0)?,
        target_type: row.get(1)?,
        endpoint: row.get(2)?,
        max_delay: row.get::<_, i64>(3)?.max(0) as u64,
        next_run_date: row.get(4)?,
        base_run_date: row.get(5)?,
        is_glpi_server: row.get(6)?,
        updated_at: updated_at.as_deref().and_then(parse_db_time),
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_target_state_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut state = TargetState {
            id: "server0".to_string(),
            endpoint: "https://glpi.example.com/".to_string(),
            max_delay: 7200,
            next_run_date: 1_700_000_000,
            base_run_date: 1_699_990_000,
            is_glpi_server: true,
            ..Default::default()
        };
        store.save_target_state(&state).unwrap();

        let fetched = store.get_target_state("server0").unwrap().unwrap();
        assert_eq!(fetched.max_delay, 7200);
        assert!(fetched.is_glpi_server);
        assert!(fetched.updated_at.is_some());

        state.next_run_date += 3600;
        store.save_target_state(&state).unwrap();
        let states = store.get_target_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].next_run_date, 1_700_003_600);

        store.delete_target_state("server0").unwrap();
        assert!(store.get_target_state("server0").unwrap().is_none());
    }

    #[test]
    fn test_deviceid_is_stable() {
        let tmp = NamedTempFile::new().unwrap();
        let first = Store::new(tmp.path()).unwrap().deviceid().unwrap();
        let second = Store::new(tmp.path()).unwrap().deviceid().unwrap();
        assert_eq!(first, second);
        assert!(first.len() > 20);
    }

    #[test]
    fn test_parse_db_time() {
        assert!(parse_db_time("2024-01-02 03:04:05").is_some());
        assert!(parse_db_time("2024-01-02T03:04:05Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
