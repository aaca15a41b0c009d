pub mod chunk;
pub mod cursor;
pub mod fetcher;
pub mod lock;
pub mod rate_limit;
pub mod record;
pub mod syncer;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::date_util::start_of_day;
use crate::error::Error;
use crate::storage::repository::UpsertCounts;
use chunk::DateRange;

/// Kinds of health data pulled from the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Measurement,
    Activity,
    Sleep,
    HeartRate,
}

impl DataType {
    pub const ALL: [DataType; 4] = [
        DataType::Measurement,
        DataType::Activity,
        DataType::Sleep,
        DataType::HeartRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Measurement => "measurement",
            DataType::Activity => "activity",
            DataType::Sleep => "sleep",
            DataType::HeartRate => "heart_rate",
        }
    }

    /// Widest range the vendor accepts in one request for this type.
    pub fn max_span(&self) -> Duration {
        match self {
            DataType::Measurement | DataType::HeartRate => Duration::days(365),
            DataType::Activity | DataType::Sleep => Duration::days(200),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "measurement" | "measurements" => Ok(DataType::Measurement),
            "activity" | "activities" => Ok(DataType::Activity),
            "sleep" => Ok(DataType::Sleep),
            "heart_rate" | "heartrate" => Ok(DataType::HeartRate),
            other => Err(Error::InvalidDataType(format!(
                "'{other}' (expected one of measurement, activity, sleep, heart_rate)"
            ))),
        }
    }
}

/// Options controlling a sync operation.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub days: Option<u32>,
    /// Ignore stored cursors and re-import from `start` (or the epoch).
    pub full: bool,
}

impl SyncOptions {
    /// Explicit lower bound: `days` wins over `start`.
    pub fn requested_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(days) = self.days {
            Some(now - Duration::days(days as i64))
        } else {
            self.start.map(start_of_day)
        }
    }

    /// Exclusive upper bound: the day after `end`, never later than `now`.
    pub fn requested_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.end {
            Some(end) => (start_of_day(end) + Duration::days(1)).min(now),
            None => now,
        }
    }
}

/// Outcome of one data type within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
    Cancelled,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
            SyncStatus::Skipped => "skipped",
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Cancelled,
    RequiresReauth,
}

/// Per-type section of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct TypeReport {
    pub data_type: DataType,
    pub status: SyncStatus,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Records dropped because they could not be decoded.
    pub failed: u64,
    pub chunks_completed: u32,
    pub chunks_total: u32,
    pub cursor_before: Option<DateTime<Utc>>,
    pub cursor_after: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TypeReport {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            status: SyncStatus::Success,
            range_start: None,
            range_end: None,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            chunks_completed: 0,
            chunks_total: 0,
            cursor_before: None,
            cursor_after: None,
            error: None,
        }
    }

    pub fn skipped(data_type: DataType, reason: &str) -> Self {
        Self {
            status: SyncStatus::Skipped,
            error: Some(reason.to_string()),
            ..Self::new(data_type)
        }
    }

    pub fn add_counts(&mut self, counts: &UpsertCounts) {
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.unchanged += counts.unchanged;
    }

    /// Mark the type as failed, keeping partial progress visible.
    pub fn fail(&mut self, error: &Error) {
        self.status = if self.chunks_completed > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        };
        self.error = Some(error.to_string());
    }
}

/// Summary of one sync run. Not persisted beyond logs.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub types: Vec<TypeReport>,
}

impl SyncRun {
    pub fn report(&self, data_type: DataType) -> Option<&TypeReport> {
        self.types.iter().find(|t| t.data_type == data_type)
    }

    pub fn requires_reauth(&self) -> bool {
        self.status == RunStatus::RequiresReauth
    }

    pub fn all_succeeded(&self) -> bool {
        self.status == RunStatus::Done
            && self.types.iter().all(|t| t.status == SyncStatus::Success)
    }
}

/// Progress callbacks for long historical imports.
pub trait SyncProgress {
    fn on_type_start(&self, _data_type: DataType, _index: usize, _total: usize) {}

    fn on_chunk_written(&self, _data_type: DataType, _range: &DateRange, _counts: &UpsertCounts) {}

    fn on_type_complete(&self, _report: &TypeReport) {}
}

pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// Cooperative cancellation, observed at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_data_type_parse_accepts_aliases() {
        assert_eq!("measurements".parse::<DataType>().unwrap(), DataType::Measurement);
        assert_eq!("heart-rate".parse::<DataType>().unwrap(), DataType::HeartRate);
        assert_eq!(" Sleep ".parse::<DataType>().unwrap(), DataType::Sleep);
        assert!("steps".parse::<DataType>().is_err());
    }

    #[test]
    fn test_days_takes_precedence_over_start() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let options = SyncOptions {
            start: NaiveDate::from_ymd_opt(2010, 1, 1),
            days: Some(30),
            ..Default::default()
        };
        assert_eq!(
            options.requested_start(now),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_requested_end_is_exclusive_and_capped() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let past = SyncOptions {
            end: NaiveDate::from_ymd_opt(2024, 12, 31),
            ..Default::default()
        };
        assert_eq!(
            past.requested_end(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );

        let today = SyncOptions {
            end: NaiveDate::from_ymd_opt(2025, 1, 31),
            ..Default::default()
        };
        assert_eq!(today.requested_end(now), now);
        assert_eq!(SyncOptions::default().requested_end(now), now);
    }

    #[test]
    fn test_fail_distinguishes_partial_progress() {
        let err = Error::StorageWrite("disk full".into());

        let mut untouched = TypeReport::new(DataType::Sleep);
        untouched.fail(&err);
        assert_eq!(untouched.status, SyncStatus::Failed);

        let mut partial = TypeReport::new(DataType::Sleep);
        partial.chunks_completed = 2;
        partial.fail(&err);
        assert_eq!(partial.status, SyncStatus::PartialFailure);
        assert!(partial.error.as_deref().unwrap().contains("disk full"));
    }
}
