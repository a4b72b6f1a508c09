use crate::error::DbError;

const SCHEMA_SQL: &str = r#"
-- One row per saved target; probe history folds into message/evidence/log.
CREATE TABLE IF NOT EXISTS connections (
    id           TEXT PRIMARY KEY,
    protocol     TEXT NOT NULL,
    host         TEXT NOT NULL,
    port         INTEGER NOT NULL,
    username     TEXT,
    password     TEXT,
    status       TEXT NOT NULL,
    message      TEXT NOT NULL,
    evidence     TEXT NOT NULL DEFAULT '',
    log_json     TEXT NOT NULL DEFAULT '[]',
    created_at   INTEGER NOT NULL,
    connected_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_connections_protocol ON connections(protocol);
CREATE INDEX IF NOT EXISTS idx_connections_status ON connections(status);
"#;

pub fn initialize(conn: &rusqlite::Connection) -> Result<(), DbError> {
    // WAL before DDL for crash safety.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
