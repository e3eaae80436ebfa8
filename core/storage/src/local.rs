//! SQLite-backed local store.
//!
//! Persists application rows, the sync log, devices, conflict audits and the
//! scheduler queue in a single database file so pending sync work survives a
//! restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use buddy_common::{
    ConflictAudit, ConflictStrategy, ConnectionState, DeviceInfo, Error, OperationType, RecordKey,
    Result, SyncOperation, SyncRecord, SyncStatus,
};

use crate::provider::{LocalStore, StoredRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    data TEXT NOT NULL,
    sync_version INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, record_id)
);

CREATE TABLE IF NOT EXISTS sync_log (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp_utc TEXT NOT NULL,
    sync_version INTEGER NOT NULL,
    status TEXT NOT NULL,
    checksum TEXT NOT NULL,
    error_message TEXT,
    retry_count INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_log_key ON sync_log(table_name, record_id);
CREATE INDEX IF NOT EXISTS idx_sync_log_status ON sync_log(status);

CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_type TEXT NOT NULL,
    device_name TEXT NOT NULL,
    capabilities TEXT NOT NULL,
    last_sync_utc TEXT,
    sync_version INTEGER NOT NULL,
    is_active INTEGER NOT NULL,
    connection_state TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conflict_audit (
    id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    local_version INTEGER NOT NULL,
    remote_version INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    resolved_data TEXT,
    resolver_device_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    priority_rank INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    operation TEXT NOT NULL
);
"#;

const SYNC_LOG_COLUMNS: &str = "id, user_id, device_id, table_name, record_id, operation, data, \
     timestamp_utc, sync_version, status, checksum, error_message, retry_count";

const AUDIT_COLUMNS: &str = "id, table_name, record_id, local_version, remote_version, strategy, \
     resolved_data, resolver_device_id, created_at, resolved_at";

/// Local store backed by SQLite.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
}

impl SqliteLocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        info!("Local sync store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::Database(err.to_string())
}

fn to_sql_err<E: std::error::Error + Send + Sync + 'static>(idx: usize, err: E) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| to_sql_err(idx, e))
}

fn parse_opt_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(idx, v)).transpose()
}

fn parse_json(idx: usize, value: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&value).map_err(|e| to_sql_err(idx, e))
}

fn parse_enum<T: std::str::FromStr<Err = Error>>(idx: usize, value: String) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| to_sql_err(idx, e))
}

fn sync_record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    Ok(SyncRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        device_id: row.get(2)?,
        table_name: row.get(3)?,
        record_id: row.get(4)?,
        operation: parse_enum::<OperationType>(5, row.get(5)?)?,
        data: parse_json(6, row.get(6)?)?,
        timestamp: parse_time(7, row.get(7)?)?,
        sync_version: row.get::<_, i64>(8)? as u64,
        status: parse_enum::<SyncStatus>(9, row.get(9)?)?,
        checksum: row.get(10)?,
        error_message: row.get(11)?,
        retry_count: row.get::<_, i64>(12)? as u32,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceInfo> {
    let capabilities: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(4)?).map_err(|e| to_sql_err(4, e))?;
    let connection_state = match row.get::<_, String>(8)?.as_str() {
        "online" => ConnectionState::Online,
        _ => ConnectionState::Offline,
    };
    Ok(DeviceInfo {
        device_id: row.get(0)?,
        user_id: row.get(1)?,
        device_type: parse_enum(2, row.get(2)?)?,
        device_name: row.get(3)?,
        capabilities,
        last_sync: parse_opt_time(5, row.get(5)?)?,
        sync_version: row.get::<_, i64>(6)? as u64,
        is_active: row.get::<_, i32>(7)? != 0,
        connection_state,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictAudit> {
    Ok(ConflictAudit {
        id: row.get(0)?,
        table_name: row.get(1)?,
        record_id: row.get(2)?,
        local_version: row.get::<_, i64>(3)? as u64,
        remote_version: row.get::<_, i64>(4)? as u64,
        strategy: parse_enum::<ConflictStrategy>(5, row.get(5)?)?,
        resolved_data: row
            .get::<_, Option<String>>(6)?
            .map(|v| parse_json(6, v))
            .transpose()?,
        resolver_device_id: row.get(7)?,
        created_at: parse_time(8, row.get(8)?)?,
        resolved_at: parse_opt_time(9, row.get(9)?)?,
    })
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get_record(&self, key: &RecordKey) -> Result<Option<StoredRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT data, sync_version, updated_at FROM records WHERE table_name = ?1 AND record_id = ?2",
            params![key.table_name, key.record_id],
            |row| {
                Ok(StoredRecord {
                    data: parse_json(0, row.get(0)?)?,
                    sync_version: row.get::<_, i64>(1)? as u64,
                    updated_at: parse_time(2, row.get(2)?)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    async fn upsert_record(&self, key: &RecordKey, data: &Value, sync_version: u64) -> Result<()> {
        let data = serde_json::to_string(data)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO records (table_name, record_id, data, sync_version, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                key.table_name,
                key.record_id,
                data,
                sync_version as i64,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM records WHERE table_name = ?1 AND record_id = ?2",
            params![key.table_name, key.record_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_sync_log(&self, record: &SyncRecord) -> Result<()> {
        debug!("Appending sync log row for {}", record.key());
        let data = serde_json::to_string(&record.data)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_log ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                SYNC_LOG_COLUMNS
            ),
            params![
                record.id,
                record.user_id,
                record.device_id,
                record.table_name,
                record.record_id,
                record.operation.as_str(),
                data,
                record.timestamp.to_rfc3339(),
                record.sync_version as i64,
                record.status.as_str(),
                record.checksum,
                record.error_message,
                record.retry_count as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_sync_log(&self, record: &SyncRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        let conn = self.conn()?;
        let changed = conn
            .execute(
                r#"
                UPDATE sync_log SET operation = ?2, data = ?3, timestamp_utc = ?4,
                    sync_version = ?5, status = ?6, checksum = ?7, error_message = ?8,
                    retry_count = ?9
                WHERE id = ?1
                "#,
                params![
                    record.id,
                    record.operation.as_str(),
                    data,
                    record.timestamp.to_rfc3339(),
                    record.sync_version as i64,
                    record.status.as_str(),
                    record.checksum,
                    record.error_message,
                    record.retry_count as i64,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Sync record not found: {}", record.id)));
        }
        Ok(())
    }

    async fn get_sync_record(&self, key: &RecordKey) -> Result<Option<SyncRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM sync_log WHERE table_name = ?1 AND record_id = ?2 \
                 ORDER BY timestamp_utc DESC LIMIT 1",
                SYNC_LOG_COLUMNS
            ),
            params![key.table_name, key.record_id],
            sync_record_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn list_pending(&self, table: Option<&str>) -> Result<Vec<SyncRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_log WHERE status IN ('PENDING', 'SYNCING') \
                 AND (?1 IS NULL OR table_name = ?1) ORDER BY timestamp_utc",
                SYNC_LOG_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![table], sync_record_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn list_sync_log(&self, status: Option<SyncStatus>) -> Result<Vec<SyncRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_log WHERE (?1 IS NULL OR status = ?1) ORDER BY timestamp_utc",
                SYNC_LOG_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], sync_record_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn persist_device_info(&self, info: &DeviceInfo) -> Result<()> {
        let capabilities = serde_json::to_string(&info.capabilities)?;
        let connection_state = if info.connection_state.is_online() {
            "online"
        } else {
            "offline"
        };
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO devices
            (device_id, user_id, device_type, device_name, capabilities, last_sync_utc,
             sync_version, is_active, connection_state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                info.device_id,
                info.user_id,
                info.device_type.as_str(),
                info.device_name,
                capabilities,
                info.last_sync.map(|t| t.to_rfc3339()),
                info.sync_version as i64,
                info.is_active as i32,
                connection_state,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_devices(&self) -> Result<Vec<DeviceInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT device_id, user_id, device_type, device_name, capabilities,
                       last_sync_utc, sync_version, is_active, connection_state
                FROM devices
                "#,
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], device_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn append_conflict_audit(&self, audit: &ConflictAudit) -> Result<()> {
        let resolved = audit
            .resolved_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO conflict_audit ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                AUDIT_COLUMNS
            ),
            params![
                audit.id,
                audit.table_name,
                audit.record_id,
                audit.local_version as i64,
                audit.remote_version as i64,
                audit.strategy.as_str(),
                resolved,
                audit.resolver_device_id,
                audit.created_at.to_rfc3339(),
                audit.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_conflict_audits(&self, key: Option<&RecordKey>) -> Result<Vec<ConflictAudit>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM conflict_audit \
                 WHERE (?1 IS NULL OR (table_name = ?1 AND record_id = ?2)) ORDER BY created_at",
                AUDIT_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![key.map(|k| k.table()), key.map(|k| k.id())],
                audit_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn save_queued_operation(&self, op: &SyncOperation) -> Result<()> {
        let encoded = serde_json::to_string(op)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO sync_queue (id, priority_rank, created_at, operation)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                op.id,
                op.priority.index() as i64,
                op.created_at.to_rfc3339(),
                encoded
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_queued_operation(&self, op_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![op_id])
            .map_err(db_err)?;
        Ok(())
    }

    async fn load_queued_operations(&self) -> Result<Vec<SyncOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT operation FROM sync_queue ORDER BY priority_rank, created_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let encoded: String = row.get(0)?;
                serde_json::from_str::<SyncOperation>(&encoded).map_err(|e| to_sql_err(0, e))
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
