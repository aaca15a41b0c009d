use chrono::{DateTime, Utc};

use crate::api::HttpClient;
use crate::auth::TokenStore;
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::storage::repository::{self, UpsertCounts};
use crate::storage::Database;
use crate::sync::chunk::DateRange;
use crate::sync::cursor::{effective_start, CursorTracker, SyncMode};
use crate::sync::fetcher::ChunkedFetcher;
use crate::sync::record::Record;
use crate::sync::{
    CancelFlag, DataType, RunStatus, SyncOptions, SyncProgress, SyncRun, SyncStatus, TypeReport,
};

/// Where a run currently is. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Authenticating,
    Fetching(DataType),
    Writing(DataType),
    CursorAdvance(DataType),
    Summarizing,
    Done,
    Cancelled,
    RequiresReauth,
}

enum TypeOutcome {
    Completed,
    Cancelled,
}

/// One sync run. Built fresh for every run with its own token store, rate
/// limiter and fetcher.
pub struct SyncEngine<H: HttpClient, C: Clock> {
    db: Database,
    clock: C,
    settings: SyncSettings,
    tokens: TokenStore<H, C>,
    fetcher: ChunkedFetcher<H, C>,
    cursors: CursorTracker,
    state: RunState,
}

impl<H: HttpClient, C: Clock> SyncEngine<H, C> {
    pub fn new(
        db: Database,
        clock: C,
        settings: SyncSettings,
        tokens: TokenStore<H, C>,
        fetcher: ChunkedFetcher<H, C>,
    ) -> Self {
        Self {
            cursors: CursorTracker::new(db.clone()),
            db,
            clock,
            settings,
            tokens,
            fetcher,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Sync every enabled data type in order.
    ///
    /// A failing type is recorded and the run moves on; only an expired
    /// authorization stops it. The caller holds the run lock.
    pub async fn run(
        &mut self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
        cancel: &CancelFlag,
    ) -> Result<SyncRun> {
        let started_at = self.clock.now();
        let end = options.requested_end(started_at);
        let requested_start = options.requested_start(started_at);
        let types = self.settings.data_types.clone();
        let mut status = RunStatus::Done;
        let mut reports = Vec::with_capacity(types.len());

        transition(&mut self.state, RunState::Authenticating);
        match self.tokens.get_valid_token(self.fetcher.limiter()).await {
            Ok(_) => {}
            Err(e @ Error::AuthExpired(_)) => {
                log::error!("{e}");
                status = RunStatus::RequiresReauth;
            }
            // Each request checks the token again; let the types fail on their own.
            Err(e) => log::warn!("Could not confirm credential: {e}"),
        }

        for (index, &data_type) in types.iter().enumerate() {
            if status == RunStatus::Done && cancel.is_cancelled() {
                log::info!("Cancellation requested, stopping before {data_type}");
                status = RunStatus::Cancelled;
            }
            match status {
                RunStatus::RequiresReauth => {
                    reports.push(TypeReport::skipped(data_type, "authorization expired"));
                    continue;
                }
                RunStatus::Cancelled => {
                    reports.push(TypeReport::skipped(data_type, "run cancelled"));
                    continue;
                }
                RunStatus::Done => {}
            }

            progress.on_type_start(data_type, index, types.len());
            let mut report = TypeReport::new(data_type);
            let outcome = self
                .sync_type(&mut report, requested_start, end, options.full, progress, cancel)
                .await;

            match outcome {
                Ok(TypeOutcome::Completed) => {
                    log::info!(
                        "{data_type}: {} fetched, {} inserted, {} updated, {} unchanged",
                        report.fetched,
                        report.inserted,
                        report.updated,
                        report.unchanged
                    );
                }
                Ok(TypeOutcome::Cancelled) => {
                    report.status = SyncStatus::Cancelled;
                    status = RunStatus::Cancelled;
                }
                Err(e) => {
                    log::warn!("{data_type}: {e}");
                    report.fail(&e);
                    if e.is_fatal() {
                        status = RunStatus::RequiresReauth;
                    }
                }
            }

            if let Err(e) = self
                .cursors
                .record_run_status(data_type, report.status, report.error.clone(), self.clock.now())
                .await
            {
                log::warn!("Could not record run status for {data_type}: {e}");
            }
            progress.on_type_complete(&report);
            reports.push(report);
        }

        transition(&mut self.state, RunState::Summarizing);
        let run = SyncRun {
            started_at,
            finished_at: self.clock.now(),
            status,
            types: reports,
        };
        transition(
            &mut self.state,
            match status {
                RunStatus::Done => RunState::Done,
                RunStatus::Cancelled => RunState::Cancelled,
                RunStatus::RequiresReauth => RunState::RequiresReauth,
            },
        );
        Ok(run)
    }

    async fn sync_type(
        &mut self,
        report: &mut TypeReport,
        requested_start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
        full: bool,
        progress: &dyn SyncProgress,
        cancel: &CancelFlag,
    ) -> Result<TypeOutcome> {
        let data_type = report.data_type;
        let cursor = self.cursors.get_cursor(data_type).await?;
        report.cursor_before = cursor;
        report.cursor_after = cursor;

        let (mode, start) =
            effective_start(cursor, requested_start, self.settings.historical_epoch, full);
        report.range_start = Some(start);
        report.range_end = Some(end);
        if start >= end {
            log::info!("{data_type}: already up to date");
            return Ok(TypeOutcome::Completed);
        }
        match mode {
            SyncMode::Historical => log::info!(
                "{data_type}: historical import over {}",
                DateRange::new(start, end)
            ),
            SyncMode::Incremental => log::info!(
                "{data_type}: incremental sync over {}",
                DateRange::new(start, end)
            ),
        }

        let mut chunks = self.fetcher.fetch(&mut self.tokens, data_type, start, end);
        report.chunks_total = chunks.total() as u32;

        loop {
            if cancel.is_cancelled() {
                log::info!(
                    "{data_type}: cancelled after {}/{} chunk(s)",
                    report.chunks_completed,
                    report.chunks_total
                );
                return Ok(TypeOutcome::Cancelled);
            }

            transition(&mut self.state, RunState::Fetching(data_type));
            let Some(chunk) = chunks.next().await else {
                break;
            };
            let chunk = chunk?;
            report.fetched += chunk.records.len() as u64;
            report.failed += chunk.decode_failures;

            transition(&mut self.state, RunState::Writing(data_type));
            let counts = write_chunk(&self.db, data_type, chunk.records, self.clock.now()).await?;
            report.add_counts(&counts);

            // Only once the batch is committed.
            transition(&mut self.state, RunState::CursorAdvance(data_type));
            if self.cursors.advance(data_type, chunk.range.end).await? {
                report.cursor_after = Some(chunk.range.end);
            }
            report.chunks_completed += 1;
            progress.on_chunk_written(data_type, &chunk.range, &counts);
        }

        Ok(TypeOutcome::Completed)
    }
}

fn transition(state: &mut RunState, next: RunState) {
    log::trace!("Sync state {state:?} -> {next:?}");
    *state = next;
}

async fn write_chunk(
    db: &Database,
    data_type: DataType,
    records: Vec<Record>,
    now: DateTime<Utc>,
) -> Result<UpsertCounts> {
    if records.is_empty() {
        return Ok(UpsertCounts::default());
    }
    db.writer()
        .call(move |conn| repository::upsert_batch(conn, data_type, &records, now))
        .await
        .map_err(|e| Error::StorageWrite(e.to_string()))
}
