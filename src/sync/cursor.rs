use chrono::{DateTime, NaiveDate, Utc};

use crate::date_util::start_of_day;
use crate::error::{Error, Result};
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::{DataType, SyncStatus};

/// How a data type's fetch range was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// No cursor (or `--full`): start from the epoch or the explicit start.
    Historical,
    /// Resume from the stored cursor.
    Incremental,
}

/// Pick the lower bound of a fetch.
///
/// Without a cursor (or when `full` is set) the explicit start wins, falling
/// back to the epoch. Otherwise the later of cursor and explicit start.
pub fn effective_start(
    cursor: Option<DateTime<Utc>>,
    requested: Option<DateTime<Utc>>,
    epoch: NaiveDate,
    full: bool,
) -> (SyncMode, DateTime<Utc>) {
    match cursor {
        Some(cursor) if !full => {
            let start = requested.map_or(cursor, |r| r.max(cursor));
            (SyncMode::Incremental, start)
        }
        _ => (
            SyncMode::Historical,
            requested.unwrap_or_else(|| start_of_day(epoch)),
        ),
    }
}

/// Per-type high-water marks, stored in `sync_cursors`.
#[derive(Clone)]
pub struct CursorTracker {
    db: Database,
}

impl CursorTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_cursor(&self, data_type: DataType) -> Result<Option<DateTime<Utc>>> {
        let cursor = self
            .db
            .reader()
            .call(move |conn| repository::get_cursor(conn, data_type))
            .await?;
        Ok(cursor)
    }

    /// Move the cursor to `to`. Call only once the records up to `to` are
    /// committed. An earlier timestamp leaves the cursor where it is.
    pub async fn advance(&self, data_type: DataType, to: DateTime<Utc>) -> Result<bool> {
        let moved = self
            .db
            .writer()
            .call(move |conn| repository::advance_cursor(conn, data_type, to))
            .await
            .map_err(|e| Error::StorageWrite(e.to_string()))?;
        if !moved {
            log::debug!("Cursor for {data_type} already at or past {to}");
        }
        Ok(moved)
    }

    pub async fn record_run_status(
        &self,
        data_type: DataType,
        status: SyncStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.db
            .writer()
            .call(move |conn| {
                let error = error.as_deref();
                repository::record_run_status(conn, data_type, status.as_str(), error, at)
            })
            .await?;
        Ok(())
    }

    /// Forget the cursor so the next run re-imports from the epoch.
    pub async fn reset(&self, data_type: DataType) -> Result<bool> {
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::reset_cursor(conn, data_type))
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn epoch() -> NaiveDate {
        NaiveDate::from_ymd_opt(2010, 1, 1).unwrap()
    }

    #[test]
    fn test_no_cursor_no_start_is_historical_from_epoch() {
        let (mode, start) = effective_start(None, None, epoch(), false);
        assert_eq!(mode, SyncMode::Historical);
        assert_eq!(start, ts(2010, 1, 1));
    }

    #[test]
    fn test_no_cursor_with_start_uses_start() {
        let (mode, start) = effective_start(None, Some(ts(2020, 3, 1)), epoch(), false);
        assert_eq!(mode, SyncMode::Historical);
        assert_eq!(start, ts(2020, 3, 1));
    }

    #[test]
    fn test_cursor_wins_over_earlier_start() {
        let (mode, start) =
            effective_start(Some(ts(2024, 6, 1)), Some(ts(2024, 1, 1)), epoch(), false);
        assert_eq!(mode, SyncMode::Incremental);
        assert_eq!(start, ts(2024, 6, 1));
    }

    #[test]
    fn test_later_start_wins_over_cursor() {
        let (_, start) =
            effective_start(Some(ts(2024, 6, 1)), Some(ts(2024, 9, 1)), epoch(), false);
        assert_eq!(start, ts(2024, 9, 1));
    }

    #[test]
    fn test_full_ignores_cursor() {
        let (mode, start) = effective_start(Some(ts(2024, 6, 1)), None, epoch(), true);
        assert_eq!(mode, SyncMode::Historical);
        assert_eq!(start, ts(2010, 1, 1));
    }

    #[tokio::test]
    async fn test_tracker_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let tracker = CursorTracker::new(db);

        assert_eq!(tracker.get_cursor(DataType::Sleep).await.unwrap(), None);
        assert!(tracker.advance(DataType::Sleep, ts(2024, 6, 1)).await.unwrap());
        assert!(!tracker.advance(DataType::Sleep, ts(2024, 5, 1)).await.unwrap());
        assert_eq!(
            tracker.get_cursor(DataType::Sleep).await.unwrap(),
            Some(ts(2024, 6, 1))
        );

        tracker
            .record_run_status(
                DataType::Sleep,
                SyncStatus::Failed,
                Some("boom".into()),
                ts(2024, 7, 1),
            )
            .await
            .unwrap();
        assert_eq!(
            tracker.get_cursor(DataType::Sleep).await.unwrap(),
            Some(ts(2024, 6, 1))
        );

        assert!(tracker.reset(DataType::Sleep).await.unwrap());
        assert_eq!(tracker.get_cursor(DataType::Sleep).await.unwrap(), None);
    }
}
