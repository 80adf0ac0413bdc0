//! `SQLite`-backed storage engine shared by every namespace in a process.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{sql, ListOptions, Partition};
use crate::types::{Error, InstanceId, Result, StorageConfig};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// One persisted alarm row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmRow {
    pub partition: Partition,
    pub fire_time: DateTime<Utc>,
}

/// Stored-key count of one instance, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub keys: u64,
}

/// Embedded transactional store holding every partition's rows.
///
/// Cloning is cheap; clones share one connection. Two engines opened on the
/// same file see each other's committed writes.
#[derive(Debug, Clone)]
pub struct StorageEngine {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl StorageEngine {
    /// Opens or creates a store at the specified path with WAL journaling.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, StorageConfig::default().busy_timeout)
    }

    fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("storage_opened: path={} journal_mode={}", path.display(), mode);

        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store (tests, ephemeral runs).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open_with_timeout(path, config.busy_timeout),
            None => Self::in_memory(),
        }
    }

    fn initialize_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn partition(&self, namespace: &str, instance: &InstanceId) -> Partition {
        Partition::new(namespace, instance.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another caller panicked mid-statement;
        // SQLite itself rolled back anything uncommitted.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let mut conn = self.lock();
        f(&mut conn)
    }

    // =========================================================================
    // Alarm rows
    // =========================================================================

    pub fn get_alarm(&self, partition: &Partition) -> Result<Option<DateTime<Utc>>> {
        let millis = sql::get_alarm(&self.lock(), partition)?;
        millis.map(from_millis).transpose()
    }

    pub fn put_alarm(&self, partition: &Partition, fire_time: DateTime<Utc>) -> Result<()> {
        sql::put_alarm(&self.lock(), partition, fire_time.timestamp_millis())
    }

    /// Returns whether a row existed.
    pub fn delete_alarm(&self, partition: &Partition) -> Result<bool> {
        sql::delete_alarm(&self.lock(), partition)
    }

    /// Every persisted alarm, optionally limited to one namespace, earliest first.
    pub fn list_alarms(&self, namespace: Option<&str>) -> Result<Vec<AlarmRow>> {
        let rows = sql::list_alarms(&self.lock(), namespace)?;
        rows.into_iter()
            .map(|(namespace, instance_id, millis)| {
                let instance = InstanceId::from_string(instance_id)
                    .map_err(|e| Error::internal(format!("corrupt alarm row: {}", e)))?;
                Ok(AlarmRow {
                    partition: Partition::new(namespace, instance),
                    fire_time: from_millis(millis)?,
                })
            })
            .collect()
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Namespaces owning at least one key or alarm.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        sql::namespaces(&self.lock())
    }

    /// Raw `(key, json)` rows of one partition.
    pub fn list_raw(&self, partition: &Partition, options: &ListOptions) -> Result<Vec<(String, String)>> {
        sql::list_values(&self.lock(), partition, options)
    }

    /// Instances of `namespace` owning at least one key.
    pub fn instances(&self, namespace: &str) -> Result<Vec<InstanceSummary>> {
        let rows = sql::instances(&self.lock(), namespace)?;
        Ok(rows
            .into_iter()
            .map(|(instance_id, keys)| InstanceSummary { instance_id, keys })
            .collect())
    }
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| Error::internal(format!("fire time out of range: {}", millis)))
}
