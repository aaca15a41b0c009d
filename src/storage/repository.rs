use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::date_util::{format_ts, parse_ts};
use crate::error::Error;
use crate::sync::record::Record;
use crate::sync::DataType;

// ── Records ────────────────────────────────────────────────────────

/// Outcome of one `upsert_batch`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Write a batch of records in one transaction, keyed on
/// `(data_type, source_id)`. A record whose timestamp and payload match the
/// stored row is left untouched. Nothing is visible unless every row succeeds.
pub fn upsert_batch(
    conn: &mut Connection,
    data_type: DataType,
    records: &[Record],
    now: DateTime<Utc>,
) -> crate::Result<UpsertCounts> {
    let now = format_ts(now);
    let tx = conn.transaction()?;
    let mut counts = UpsertCounts::default();
    {
        let mut select = tx.prepare_cached(
            "SELECT timestamp, payload FROM records WHERE data_type = ?1 AND source_id = ?2",
        )?;
        let mut insert = tx.prepare_cached(
            "INSERT INTO records
                 (data_type, source_id, timestamp, payload, raw_json, fetched_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )?;
        let mut update = tx.prepare_cached(
            "UPDATE records SET timestamp = ?3, payload = ?4, raw_json = ?5, updated_at = ?6
             WHERE data_type = ?1 AND source_id = ?2",
        )?;

        for record in records {
            if record.data_type != data_type {
                return Err(Error::StorageWrite(format!(
                    "record {} is {} but the batch is {data_type}",
                    record.source_id, record.data_type
                )));
            }
            let timestamp = format_ts(record.timestamp);
            let payload = record.payload.to_json()?;
            let raw = serde_json::to_string(&record.raw)?;

            let existing: Option<(String, String)> = select
                .query_row(params![data_type.as_str(), record.source_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;

            match existing {
                None => {
                    insert.execute(params![
                        data_type.as_str(),
                        record.source_id,
                        timestamp,
                        payload,
                        raw,
                        now
                    ])?;
                    counts.inserted += 1;
                }
                Some((ts, p)) if ts == timestamp && p == payload => counts.unchanged += 1,
                Some(_) => {
                    update.execute(params![
                        data_type.as_str(),
                        record.source_id,
                        timestamp,
                        payload,
                        raw,
                        now
                    ])?;
                    counts.updated += 1;
                }
            }
        }
    }
    tx.commit()?;
    Ok(counts)
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordStats {
    pub data_type: String,
    pub count: i64,
    pub first: Option<String>,
    pub last: Option<String>,
}

pub fn record_stats(conn: &Connection) -> Result<Vec<RecordStats>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT data_type, COUNT(*), MIN(timestamp), MAX(timestamp)
         FROM records GROUP BY data_type ORDER BY data_type",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(RecordStats {
            data_type: row.get(0)?,
            count: row.get(1)?,
            first: row.get(2)?,
            last: row.get(3)?,
        })
    })?;
    rows.collect()
}

// ── Sync cursors ───────────────────────────────────────────────────

pub fn get_cursor(
    conn: &Connection,
    data_type: DataType,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    // No row and a row with a NULL cursor (run status only) look the same.
    let stored: Option<Option<String>> = conn
        .query_row(
            "SELECT last_synced_at FROM sync_cursors WHERE data_type = ?1",
            params![data_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.flatten().as_deref().and_then(parse_ts))
}

/// Move the cursor forward. Returns false (and changes nothing) when `to`
/// is not later than the stored value.
pub fn advance_cursor(
    conn: &Connection,
    data_type: DataType,
    to: DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "INSERT INTO sync_cursors (data_type, last_synced_at) VALUES (?1, ?2)
         ON CONFLICT(data_type) DO UPDATE SET last_synced_at = excluded.last_synced_at
         WHERE sync_cursors.last_synced_at IS NULL
            OR excluded.last_synced_at > sync_cursors.last_synced_at",
        params![data_type.as_str(), format_ts(to)],
    )?;
    Ok(changed > 0)
}

/// Store the outcome of the latest run without touching the cursor.
pub fn record_run_status(
    conn: &Connection,
    data_type: DataType,
    status: &str,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_cursors (data_type, last_run_status, last_run_at, last_error)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(data_type) DO UPDATE SET
            last_run_status = excluded.last_run_status,
            last_run_at = excluded.last_run_at,
            last_error = excluded.last_error",
        params![data_type.as_str(), status, format_ts(at), error],
    )?;
    Ok(())
}

pub fn reset_cursor(conn: &Connection, data_type: DataType) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "DELETE FROM sync_cursors WHERE data_type = ?1",
        params![data_type.as_str()],
    )?;
    Ok(n > 0)
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorRow {
    pub data_type: String,
    pub last_synced_at: Option<String>,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<String>,
    pub last_error: Option<String>,
}

pub fn list_cursors(conn: &Connection) -> Result<Vec<CursorRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT data_type, last_synced_at, last_run_status, last_run_at, last_error
         FROM sync_cursors ORDER BY data_type",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CursorRow {
            data_type: row.get(0)?,
            last_synced_at: row.get(1)?,
            last_run_status: row.get(2)?,
            last_run_at: row.get(3)?,
            last_error: row.get(4)?,
        })
    })?;
    rows.collect()
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let n = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(n > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::sync::record::Payload;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn heart(id: &str, bpm: f64) -> Record {
        Record {
            data_type: DataType::HeartRate,
            source_id: id.to_string(),
            timestamp: ts(2024, 6, 1),
            payload: Payload::HeartRate {
                bpm,
                device_id: None,
                group_id: 1,
            },
            raw: serde_json::json!({"grpid": id}),
        }
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "sync.rate_limit", "60")?;
                let val = get_config(conn, "sync.rate_limit")?;
                assert_eq!(val, Some("60".to_string()));

                let missing = get_config(conn, "nonexistent")?;
                assert_eq!(missing, None);

                assert!(delete_config(conn, "sync.rate_limit")?);
                assert!(!delete_config(conn, "sync.rate_limit")?);
                assert!(list_config(conn)?.is_empty());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_batch_is_idempotent() {
        let db = Database::open_memory().await.unwrap();

        let (first, second, rows) = db
            .writer()
            .call(|conn| {
                let batch = vec![heart("1", 60.0), heart("2", 61.0), heart("3", 62.0)];
                let first = upsert_batch(conn, DataType::HeartRate, &batch, ts(2025, 1, 1))?;
                let second = upsert_batch(conn, DataType::HeartRate, &batch, ts(2025, 1, 2))?;
                let rows: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
                Ok::<_, Error>((first, second, rows))
            })
            .await
            .unwrap();

        assert_eq!(first, UpsertCounts { inserted: 3, updated: 0, unchanged: 0 });
        assert_eq!(second, UpsertCounts { inserted: 0, updated: 0, unchanged: 3 });
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_changed_values_update_in_place() {
        let db = Database::open_memory().await.unwrap();

        let (counts, bpm_json, rows) = db
            .writer()
            .call(|conn| {
                upsert_batch(conn, DataType::HeartRate, &[heart("1", 60.0)], ts(2025, 1, 1))?;
                let counts = upsert_batch(
                    conn,
                    DataType::HeartRate,
                    &[heart("1", 75.0), heart("2", 80.0)],
                    ts(2025, 1, 2),
                )?;
                let payload: String = conn.query_row(
                    "SELECT payload FROM records WHERE source_id = '1'",
                    [],
                    |r| r.get(0),
                )?;
                let rows: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
                Ok::<_, Error>((counts, payload, rows))
            })
            .await
            .unwrap();

        assert_eq!(counts, UpsertCounts { inserted: 1, updated: 1, unchanged: 0 });
        assert!(bpm_json.contains("75.0"));
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_same_source_id_in_other_type_is_distinct() {
        let db = Database::open_memory().await.unwrap();

        let rows = db
            .writer()
            .call(|conn| {
                upsert_batch(conn, DataType::HeartRate, &[heart("1", 60.0)], ts(2025, 1, 1))?;
                let mut other = heart("1", 60.0);
                other.data_type = DataType::Measurement;
                upsert_batch(conn, DataType::Measurement, &[other], ts(2025, 1, 1))?;
                let rows: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
                Ok::<_, Error>(rows)
            })
            .await
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_nothing_behind() {
        let db = Database::open_memory().await.unwrap();

        let (result, rows) = db
            .writer()
            .call(|conn| {
                let mut stray = heart("2", 61.0);
                stray.data_type = DataType::Sleep;
                let batch = [heart("1", 60.0), stray];
                let result = upsert_batch(conn, DataType::HeartRate, &batch, ts(2025, 1, 1));
                let rows: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
                Ok::<_, Error>((result, rows))
            })
            .await
            .unwrap();

        assert!(matches!(result, Err(Error::StorageWrite(_))));
        assert_eq!(rows, 0, "the partial batch must roll back");
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let db = Database::open_memory().await.unwrap();

        let (moved_back, cursor) = db
            .writer()
            .call(|conn| {
                assert_eq!(get_cursor(conn, DataType::Sleep)?, None);
                assert!(advance_cursor(conn, DataType::Sleep, ts(2024, 6, 1))?);
                let moved_back = advance_cursor(conn, DataType::Sleep, ts(2024, 1, 1))?;
                let cursor = get_cursor(conn, DataType::Sleep)?;
                Ok::<_, rusqlite::Error>((moved_back, cursor))
            })
            .await
            .unwrap();

        assert!(!moved_back);
        assert_eq!(cursor, Some(ts(2024, 6, 1)));
    }

    #[tokio::test]
    async fn test_run_status_does_not_touch_cursor() {
        let db = Database::open_memory().await.unwrap();

        let rows = db
            .writer()
            .call(|conn| {
                let at = ts(2025, 1, 1);
                record_run_status(conn, DataType::Activity, "failed", Some("boom"), at)?;
                assert_eq!(get_cursor(conn, DataType::Activity)?, None);
                advance_cursor(conn, DataType::Activity, ts(2024, 12, 1))?;
                record_run_status(conn, DataType::Activity, "success", None, ts(2025, 1, 2))?;
                assert_eq!(get_cursor(conn, DataType::Activity)?, Some(ts(2024, 12, 1)));
                list_cursors(conn)
            })
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_run_status.as_deref(), Some("success"));
        assert_eq!(rows[0].last_error, None);
    }

    #[tokio::test]
    async fn test_reset_cursor() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                advance_cursor(conn, DataType::Measurement, ts(2024, 6, 1))?;
                assert!(reset_cursor(conn, DataType::Measurement)?);
                assert_eq!(get_cursor(conn, DataType::Measurement)?, None);
                assert!(!reset_cursor(conn, DataType::Measurement)?);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }
}
