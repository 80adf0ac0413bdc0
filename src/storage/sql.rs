//! SQL statements shared by direct calls and transactions.
//!
//! Every function takes a plain `&Connection` so it runs the same way on the
//! engine's connection and inside a `rusqlite::Transaction`.

// SQLite returns i64 for counts, but they're always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{ListOptions, Partition};
use crate::types::{Error, Result};

pub(crate) fn get_value(conn: &Connection, partition: &Partition, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM instance_storage
             WHERE namespace = ?1 AND instance_id = ?2 AND key = ?3",
            params![partition.namespace, partition.instance.as_str(), key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

pub(crate) fn put_value(conn: &Connection, partition: &Partition, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO instance_storage (namespace, instance_id, key, value)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (namespace, instance_id, key) DO UPDATE SET value = excluded.value",
        params![partition.namespace, partition.instance.as_str(), key, value],
    )?;
    Ok(())
}

pub(crate) fn delete_key(conn: &Connection, partition: &Partition, key: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM instance_storage
         WHERE namespace = ?1 AND instance_id = ?2 AND key = ?3",
        params![partition.namespace, partition.instance.as_str(), key],
    )?;
    Ok(removed > 0)
}

pub(crate) fn delete_partition(conn: &Connection, partition: &Partition) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM instance_storage WHERE namespace = ?1 AND instance_id = ?2",
        params![partition.namespace, partition.instance.as_str()],
    )?;
    Ok(removed)
}

pub(crate) fn list_values(
    conn: &Connection,
    partition: &Partition,
    options: &ListOptions,
) -> Result<Vec<(String, String)>> {
    if options.limit == Some(0) {
        return Err(Error::validation("list limit must be positive"));
    }

    let mut sql = String::from(
        "SELECT key, value FROM instance_storage WHERE namespace = ?1 AND instance_id = ?2",
    );
    let mut args: Vec<SqlValue> = vec![
        SqlValue::Text(partition.namespace.clone()),
        SqlValue::Text(partition.instance.as_str().to_string()),
    ];

    if let Some(prefix) = &options.prefix {
        args.push(SqlValue::Text(prefix.clone()));
        let n = args.len();
        // Byte-exact, unlike LIKE which folds ASCII case.
        sql.push_str(&format!(" AND substr(key, 1, length(?{n})) = ?{n}"));
    }
    if let Some(start) = &options.start {
        args.push(SqlValue::Text(start.clone()));
        sql.push_str(&format!(" AND key >= ?{}", args.len()));
    }
    if let Some(end) = &options.end {
        args.push(SqlValue::Text(end.clone()));
        sql.push_str(&format!(" AND key < ?{}", args.len()));
    }

    sql.push_str(if options.reverse {
        " ORDER BY key DESC"
    } else {
        " ORDER BY key ASC"
    });

    if let Some(limit) = options.limit {
        args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn get_alarm(conn: &Connection, partition: &Partition) -> Result<Option<i64>> {
    let fire_time = conn
        .query_row(
            "SELECT fire_time FROM instance_alarms WHERE namespace = ?1 AND instance_id = ?2",
            params![partition.namespace, partition.instance.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(fire_time)
}

pub(crate) fn put_alarm(conn: &Connection, partition: &Partition, fire_time_ms: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO instance_alarms (namespace, instance_id, fire_time)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (namespace, instance_id) DO UPDATE SET fire_time = excluded.fire_time",
        params![partition.namespace, partition.instance.as_str(), fire_time_ms],
    )?;
    Ok(())
}

pub(crate) fn delete_alarm(conn: &Connection, partition: &Partition) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM instance_alarms WHERE namespace = ?1 AND instance_id = ?2",
        params![partition.namespace, partition.instance.as_str()],
    )?;
    Ok(removed > 0)
}

pub(crate) fn list_alarms(conn: &Connection, namespace: Option<&str>) -> Result<Vec<(String, String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT namespace, instance_id, fire_time FROM instance_alarms
         WHERE ?1 IS NULL OR namespace = ?1
         ORDER BY fire_time ASC",
    )?;
    let rows = stmt
        .query_map(params![namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn namespaces(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT namespace FROM instance_storage
         UNION
         SELECT namespace FROM instance_alarms
         ORDER BY namespace",
    )?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn instances(conn: &Connection, namespace: &str) -> Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT instance_id, COUNT(*) FROM instance_storage
         WHERE namespace = ?1
         GROUP BY instance_id
         ORDER BY instance_id",
    )?;
    let rows = stmt
        .query_map(params![namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
