use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use credprobe_types::{ConnectionRecord, ProbeStatus, Protocol};
use rusqlite::{params, Connection, Row};
use tracing::debug;

use crate::error::DbError;
use crate::schema;

/// Persistence contract the engine works against.
pub trait RecordStore: Send + Sync {
    fn get(&self, id: &str) -> Result<ConnectionRecord, DbError>;
    fn upsert(&self, record: &ConnectionRecord) -> Result<(), DbError>;
    fn list(&self) -> Result<Vec<ConnectionRecord>, DbError>;
    fn list_by_type(&self, protocol: Protocol) -> Result<Vec<ConnectionRecord>, DbError>;
    fn delete(&self, id: &str) -> Result<bool, DbError>;

    /// Mark records that were still pending (a probe interrupted by a crash
    /// or shutdown) as failed. Returns how many rows changed.
    fn reset_all_pending(&self) -> Result<usize, DbError>;
}

/// Connection-record database backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn default_db_path() -> PathBuf {
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("credprobe").join("credprobe.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".credprobe").join("credprobe.db")
    }
}

fn parse_status(s: &str) -> Result<ProbeStatus, DbError> {
    match s {
        "pending" => Ok(ProbeStatus::Pending),
        "success" => Ok(ProbeStatus::Success),
        "failed" => Ok(ProbeStatus::Failed),
        other => Err(DbError::Other(format!("unknown status in db: {other}"))),
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::Other(format!("timestamp out of range: {secs}")))
}

fn row_to_record(row: &Row<'_>) -> Result<ConnectionRecord, DbError> {
    let protocol: String = row.get(1)?;
    let status: String = row.get(6)?;
    let log_json: String = row.get(9)?;
    let created_at: i64 = row.get(10)?;
    let connected_at: Option<i64> = row.get(11)?;

    Ok(ConnectionRecord {
        id: row.get(0)?,
        protocol: protocol
            .parse()
            .map_err(|e: credprobe_types::ProtocolParseError| DbError::Other(e.to_string()))?,
        host: row.get(2)?,
        port: row.get::<_, i64>(3)? as u16,
        username: row.get(4)?,
        password: row.get(5)?,
        status: parse_status(&status)?,
        message: row.get(7)?,
        evidence: row.get(8)?,
        log: serde_json::from_str(&log_json)?,
        created_at: timestamp(created_at)?,
        connected_at: connected_at.map(timestamp).transpose()?,
    })
}

const SELECT_COLUMNS: &str = "id, protocol, host, port, username, password, status, message, \
     evidence, log_json, created_at, connected_at";

impl SqliteStore {
    pub fn open_default() -> Result<Self, DbError> {
        Self::open(&default_db_path())
    }

    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Other(format!(
                    "failed to create db directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        debug!(path = %path.display(), "record database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Other("database lock poisoned".into()))
    }
}

impl RecordStore for SqliteStore {
    fn get(&self, id: &str) -> Result<ConnectionRecord, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM connections WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => row_to_record(row),
            None => Err(DbError::NotFound(id.to_string())),
        }
    }

    fn upsert(&self, record: &ConnectionRecord) -> Result<(), DbError> {
        let log_json = serde_json::to_string(&record.log)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO connections \
             (id, protocol, host, port, username, password, status, message, evidence, \
              log_json, created_at, connected_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.protocol.to_string(),
                record.host,
                record.port as i64,
                record.username,
                record.password,
                record.status.to_string(),
                record.message,
                record.evidence,
                log_json,
                record.created_at.timestamp(),
                record.connected_at.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<ConnectionRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM connections ORDER BY created_at DESC, id"
        ))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    fn list_by_type(&self, protocol: Protocol) -> Result<Vec<ConnectionRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM connections WHERE protocol = ?1 \
             ORDER BY created_at DESC, id"
        ))?;
        let mut rows = stmt.query(params![protocol.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }

    fn delete(&self, id: &str) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM connections WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn reset_all_pending(&self) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE connections SET status = 'failed', message = 'probe interrupted' \
             WHERE status = 'pending'",
            [],
        )?;
        if changed > 0 {
            debug!(count = changed, "interrupted pending records reset");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credprobe_types::{ProbeOutcome, Target};

    fn record(protocol: Protocol, host: &str) -> ConnectionRecord {
        ConnectionRecord::new(
            &Target::new(protocol, host, protocol.default_port())
                .with_credentials(Some("root".into()), None),
        )
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut rec = record(Protocol::Redis, "10.0.0.1");
        rec.begin_probe();
        let mut outcome = ProbeOutcome::success("redis access verified", "keyspace: db0");
        outcome.log = vec!["[10:00:00] connecting".into(), "[10:00:01] PONG".into()];
        rec.apply_outcome(outcome);
        store.upsert(&rec).unwrap();

        let loaded = store.get(&rec.id).unwrap();
        assert_eq!(loaded.protocol, Protocol::Redis);
        assert_eq!(loaded.status, ProbeStatus::Success);
        assert_eq!(loaded.evidence, "keyspace: db0");
        assert_eq!(loaded.log.len(), 2);
        assert_eq!(loaded.username.as_deref(), Some("root"));
        assert!(loaded.connected_at.is_some());
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        match store.get("nope") {
            Err(DbError::NotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut rec = record(Protocol::Ftp, "192.168.1.5");
        store.upsert(&rec).unwrap();

        rec.begin_probe();
        rec.apply_outcome(ProbeOutcome::failed("connection refused"));
        store.upsert(&rec).unwrap();

        let loaded = store.get(&rec.id).unwrap();
        assert_eq!(loaded.status, ProbeStatus::Failed);
        assert_eq!(loaded.message, "connection refused");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn list_by_type_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert(&record(Protocol::Redis, "a")).unwrap();
        store.upsert(&record(Protocol::Redis, "b")).unwrap();
        store.upsert(&record(Protocol::MySql, "c")).unwrap();

        assert_eq!(store.list().unwrap().len(), 3);
        assert_eq!(store.list_by_type(Protocol::Redis).unwrap().len(), 2);
        assert_eq!(store.list_by_type(Protocol::Vnc).unwrap().len(), 0);
    }

    #[test]
    fn delete_reports_whether_a_row_went_away() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record(Protocol::Smb, "10.1.1.1");
        store.upsert(&rec).unwrap();
        assert!(store.delete(&rec.id).unwrap());
        assert!(!store.delete(&rec.id).unwrap());
    }

    #[test]
    fn interrupted_pending_records_become_failed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut stuck = record(Protocol::Ssh, "10.2.2.2");
        stuck.begin_probe();
        store.upsert(&stuck).unwrap();
        let mut done = record(Protocol::Ssh, "10.2.2.3");
        done.begin_probe();
        done.apply_outcome(ProbeOutcome::success("ok", "proof"));
        store.upsert(&done).unwrap();

        assert_eq!(store.reset_all_pending().unwrap(), 1);
        assert_eq!(store.get(&stuck.id).unwrap().status, ProbeStatus::Failed);
        assert_eq!(store.get(&stuck.id).unwrap().message, "probe interrupted");
        assert_eq!(store.get(&done.id).unwrap().status, ProbeStatus::Success);
    }
}
