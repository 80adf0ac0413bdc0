//! Per-instance storage API handed to actor code.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use super::{sql, ListOptions, Partition, StorageEngine};
use crate::alarms::AlarmScheduler;
use crate::executor::protocol::FromExecutor;
use crate::types::{Error, Result};

/// Where alarm changes go besides the persisted row.
#[derive(Debug, Clone)]
pub(crate) enum AlarmControl {
    /// In-process: the scheduler persists and arms timers itself.
    Scheduler(AlarmScheduler),
    /// Inside an executor thread: persist here, tell the initiator to arm.
    Bridged(mpsc::UnboundedSender<FromExecutor>),
}

/// Storage view of one instance. Every operation is confined to its partition.
///
/// Operations complete synchronously against the embedded store but are
/// exposed as `async` so actor code reads the same in-process and isolated.
#[derive(Debug, Clone)]
pub struct ActorStorage {
    partition: Partition,
    engine: StorageEngine,
    alarms: AlarmControl,
}

impl ActorStorage {
    pub(crate) fn new(partition: Partition, engine: StorageEngine, alarms: AlarmControl) -> Self {
        Self {
            partition,
            engine,
            alarms,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self
            .engine
            .with_conn(|conn| sql::get_value(conn, &self.partition, key))?;
        raw.map(|text| decode(&text)).transpose()
    }

    /// Only keys that exist appear in the result.
    pub async fn get_many<K, T>(&self, keys: &[K]) -> Result<BTreeMap<String, T>>
    where
        K: AsRef<str> + Sync,
        T: DeserializeOwned,
    {
        let raw = self.engine.with_conn(|conn| {
            let mut found = Vec::new();
            for key in keys {
                if let Some(value) = sql::get_value(conn, &self.partition, key.as_ref())? {
                    found.push((key.as_ref().to_string(), value));
                }
            }
            Ok(found)
        })?;
        raw.into_iter()
            .map(|(key, text)| Ok((key, decode(&text)?)))
            .collect()
    }

    pub async fn put<T: Serialize + ?Sized + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.engine
            .with_conn(|conn| sql::put_value(conn, &self.partition, key, &text))
    }

    /// Upsert every entry in one transaction.
    pub async fn put_many<K, V, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)> + Send,
        K: Into<String>,
        V: Serialize,
    {
        let encoded = entries
            .into_iter()
            .map(|(key, value)| Ok((key.into(), serde_json::to_string(&value)?)))
            .collect::<Result<Vec<(String, String)>>>()?;
        self.engine.with_conn(|conn| {
            let tx = conn.transaction()?;
            for (key, text) in &encoded {
                sql::put_value(&tx, &self.partition, key, text)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.engine
            .with_conn(|conn| sql::delete_key(conn, &self.partition, key))
    }

    /// Returns how many of `keys` existed.
    pub async fn delete_many<K: AsRef<str> + Sync>(&self, keys: &[K]) -> Result<usize> {
        self.engine.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for key in keys {
                if sql::delete_key(&tx, &self.partition, key.as_ref())? {
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    /// Remove every key of this instance. The alarm row is left alone.
    pub async fn delete_all(&self) -> Result<usize> {
        self.engine
            .with_conn(|conn| sql::delete_partition(conn, &self.partition))
    }

    pub async fn list<T: DeserializeOwned>(&self, options: ListOptions) -> Result<Vec<(String, T)>> {
        let rows = self
            .engine
            .with_conn(|conn| sql::list_values(conn, &self.partition, &options))?;
        rows.into_iter()
            .map(|(key, text)| Ok((key, decode(&text)?)))
            .collect()
    }

    /// Run `f` against a transactional view. Writes commit together when `f`
    /// returns `Ok`; any error rolls every write back.
    pub async fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StorageTransaction<'_>) -> Result<R> + Send,
    {
        self.engine.with_conn(|conn| {
            let tx = conn.transaction()?;
            let outcome = {
                let mut view = StorageTransaction {
                    conn: &tx,
                    partition: &self.partition,
                };
                f(&mut view)
            };
            match outcome {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    tx.rollback()?;
                    tracing::debug!("transaction_rolled_back: partition={} error={}", self.partition, e);
                    Err(e)
                }
            }
        })
    }

    // =========================================================================
    // Alarm
    // =========================================================================

    pub async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>> {
        self.engine.get_alarm(&self.partition)
    }

    /// Persist `time` as the pending alarm and (re)arm its timer. The latest
    /// call wins.
    pub async fn set_alarm(&self, time: DateTime<Utc>) -> Result<()> {
        match &self.alarms {
            AlarmControl::Scheduler(scheduler) => scheduler.set_alarm(&self.partition, time),
            AlarmControl::Bridged(outbound) => {
                self.engine.put_alarm(&self.partition, time)?;
                outbound
                    .send(FromExecutor::AlarmSet { time: Some(time) })
                    .map_err(|_| Error::executor_terminated("initiator channel closed"))
            }
        }
    }

    /// Remove the pending alarm, if any. Idempotent.
    pub async fn delete_alarm(&self) -> Result<()> {
        match &self.alarms {
            AlarmControl::Scheduler(scheduler) => scheduler.delete_alarm(&self.partition),
            AlarmControl::Bridged(outbound) => {
                self.engine.delete_alarm(&self.partition)?;
                outbound
                    .send(FromExecutor::AlarmSet { time: None })
                    .map_err(|_| Error::executor_terminated("initiator channel closed"))
            }
        }
    }
}

/// Transactional view passed to [`ActorStorage::transaction`].
#[derive(Debug)]
pub struct StorageTransaction<'a> {
    conn: &'a Connection,
    partition: &'a Partition,
}

impl StorageTransaction<'_> {
    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        sql::get_value(self.conn, self.partition, key)?
            .map(|text| decode(&text))
            .transpose()
    }

    pub fn put<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        sql::put_value(self.conn, self.partition, key, &text)
    }

    pub fn delete(&mut self, key: &str) -> Result<bool> {
        sql::delete_key(self.conn, self.partition, key)
    }

    pub fn list<T: DeserializeOwned>(&mut self, options: &ListOptions) -> Result<Vec<(String, T)>> {
        sql::list_values(self.conn, self.partition, options)?
            .into_iter()
            .map(|(key, text)| Ok((key, decode(&text)?)))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}
