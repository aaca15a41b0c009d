use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::Credential;
use crate::storage::repository::{CursorRow, RecordStats};
use crate::sync::DataType;

/// Per-type view for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct TypeStatus {
    pub data_type: DataType,
    pub enabled: bool,
    pub last_synced_at: Option<String>,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<String>,
    pub last_error: Option<String>,
    pub records: i64,
    pub first_record: Option<String>,
    pub last_record: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub user_id: Option<String>,
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub database: String,
    pub credential: Option<CredentialStatus>,
    pub types: Vec<TypeStatus>,
}

impl StatusReport {
    pub fn build(
        database: String,
        enabled: &[DataType],
        cursors: &[CursorRow],
        stats: &[RecordStats],
        credential: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> Self {
        let types = DataType::ALL
            .iter()
            .map(|&dt| {
                let cursor = cursors.iter().find(|c| c.data_type == dt.as_str());
                let stat = stats.iter().find(|s| s.data_type == dt.as_str());
                TypeStatus {
                    data_type: dt,
                    enabled: enabled.contains(&dt),
                    last_synced_at: cursor.and_then(|c| c.last_synced_at.clone()),
                    last_run_status: cursor.and_then(|c| c.last_run_status.clone()),
                    last_run_at: cursor.and_then(|c| c.last_run_at.clone()),
                    last_error: cursor.and_then(|c| c.last_error.clone()),
                    records: stat.map_or(0, |s| s.count),
                    first_record: stat.and_then(|s| s.first.clone()),
                    last_record: stat.and_then(|s| s.last.clone()),
                }
            })
            .collect();

        Self {
            database,
            credential: credential.map(|c| CredentialStatus {
                user_id: c.user_id.clone(),
                scope: c.scope.clone(),
                expires_at: c.expires_at,
                expired: c.expires_at <= now,
            }),
            types,
        }
    }

    pub fn total_records(&self) -> i64 {
        self.types.iter().map(|t| t.records).sum()
    }
}
