use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::date_util::format_ts;

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_ts(self.start), format_ts(self.end))
    }
}

/// Split `[start, end)` into consecutive, non-overlapping chunks no wider
/// than `max_span`. Only the last chunk may be shorter.
pub fn split_range(start: DateTime<Utc>, end: DateTime<Utc>, max_span: Duration) -> Vec<DateRange> {
    if start >= end || max_span <= Duration::zero() {
        return vec![];
    }

    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let chunk_end = (cursor + max_span).min(end);
        chunks.push(DateRange::new(cursor, chunk_end));
        cursor = chunk_end;
    }
    chunks
}
