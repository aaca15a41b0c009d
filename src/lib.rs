pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod date_util;
pub mod error;
pub mod status;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::{HttpClient, ReqwestHttp};
pub use auth::Credential;
pub use clock::{Clock, SystemClock};
pub use config::{OAuthApp, Paths, SyncSettings};
pub use error::{Error, Result};
pub use status::StatusReport;
pub use storage::Database;
pub use sync::{
    CancelFlag, DataType, NoopProgress, RunStatus, SyncOptions, SyncProgress, SyncRun,
    SyncStatus, TypeReport,
};

use auth::TokenStore;
use storage::repository;
use sync::cursor::CursorTracker;
use sync::fetcher::ChunkedFetcher;
use sync::lock::RunLock;
use sync::rate_limit::{RateLimiter, RetryPolicy};
use sync::syncer::SyncEngine;

/// Main entry point for the Withings sync engine.
pub struct HealthSync<H: HttpClient, C: Clock> {
    db: Database,
    http: H,
    clock: C,
    paths: Paths,
    app: Option<OAuthApp>,
}

impl<H: HttpClient, C: Clock> HealthSync<H, C> {
    pub fn new(db: Database, http: H, clock: C, paths: Paths) -> Self {
        Self {
            db,
            http,
            clock,
            paths,
            app: None,
        }
    }

    /// Attach the OAuth application used for token requests.
    pub fn with_app(mut self, app: OAuthApp) -> Self {
        self.app = Some(app);
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Current settings from `app_config`, defaults filled in.
    pub async fn settings(&self) -> Result<SyncSettings> {
        let pairs = self.config_list().await?;
        SyncSettings::from_pairs(&pairs)
    }

    // ── Sync ───────────────────────────────────────────────────────

    /// Run one sync under the run lock. Fails fast with `AlreadyRunning`
    /// if another process holds it.
    pub async fn sync(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
        cancel: &CancelFlag,
    ) -> Result<SyncRun> {
        let _lock = RunLock::acquire(&self.paths.lock_file)?;
        let settings = self.settings().await?;
        log::info!(
            "Syncing {} (rate limit {}/min)",
            settings
                .data_types
                .iter()
                .map(DataType::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            settings.rate_limit
        );

        let tokens = self.token_store(&settings)?;
        let fetcher = ChunkedFetcher::new(
            self.http.clone(),
            self.clock.clone(),
            RateLimiter::new(settings.rate_limit, self.clock.clone()),
            RetryPolicy::new(settings.max_attempts),
        );
        let mut engine = SyncEngine::new(
            self.db.clone(),
            self.clock.clone(),
            settings,
            tokens,
            fetcher,
        );
        engine.run(options, progress, cancel).await
    }

    pub async fn get_status(&self) -> Result<StatusReport> {
        let settings = self.settings().await?;
        let (cursors, stats) = self
            .db
            .reader()
            .call(|conn| {
                let cursors = repository::list_cursors(conn)?;
                let stats = repository::record_stats(conn)?;
                Ok::<_, rusqlite::Error>((cursors, stats))
            })
            .await?;
        let credential = auth::load_credential(&self.paths.credentials)?;

        Ok(StatusReport::build(
            self.paths.database.display().to_string(),
            &settings.data_types,
            &cursors,
            &stats,
            credential.as_ref(),
            self.clock.now(),
        ))
    }

    /// Drop a type's cursor so its next sync is a full historical import.
    pub async fn reset_cursor(&self, data_type: DataType) -> Result<bool> {
        let _lock = RunLock::acquire(&self.paths.lock_file)?;
        CursorTracker::new(self.db.clone()).reset(data_type).await
    }

    // ── Auth commands ──────────────────────────────────────────────

    pub async fn authorize_url(&self, state: Option<&str>) -> Result<(String, String)> {
        let settings = self.settings().await?;
        self.token_store(&settings)?.authorize_url(state)
    }

    /// Trade an authorization code for a credential. Takes the run lock so
    /// a running sync keeps the only writer of `credentials.json`.
    pub async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let _lock = RunLock::acquire(&self.paths.lock_file)?;
        let settings = self.settings().await?;
        let mut limiter = RateLimiter::new(settings.rate_limit, self.clock.clone());
        self.token_store(&settings)?
            .exchange_code(&mut limiter, code)
            .await
    }

    pub async fn refresh_token(&self) -> Result<Credential> {
        let _lock = RunLock::acquire(&self.paths.lock_file)?;
        let settings = self.settings().await?;
        let mut limiter = RateLimiter::new(settings.rate_limit, self.clock.clone());
        self.token_store(&settings)?.refresh(&mut limiter).await
    }

    fn token_store(&self, settings: &SyncSettings) -> Result<TokenStore<H, C>> {
        let app = self.app.clone().ok_or_else(|| {
            Error::Config(
                "OAuth app not configured: set WITHINGS_CLIENT_ID and WITHINGS_CLIENT_SECRET"
                    .into(),
            )
        })?;
        TokenStore::open(
            self.http.clone(),
            self.clock.clone(),
            app,
            &self.paths.credentials,
            settings.refresh_margin,
            RetryPolicy::new(settings.max_attempts),
        )
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Store a setting after checking it parses.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        SyncSettings::validate(key, value)?;
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.trim().to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_unset(&self, key: &str) -> Result<bool> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                move |conn| repository::delete_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok, test_app, token_store, Call, ManualClock, MockHttp};
    use chrono::TimeZone;
    use serde_json::json;

    fn vendor(call: &Call) -> Result<api::HttpResponse> {
        match call.param("action") {
            Some("getmeas") if call.param("meastype").is_none() => ok(json!({
                "measuregrps": [{
                    "grpid": 1,
                    "date": 1_700_000_000,
                    "measures": [{"value": 70, "type": 1, "unit": 0}],
                }],
                "more": 0,
            })),
            Some("getmeas") => ok(json!({"measuregrps": [], "more": 0})),
            Some("getactivity") => ok(json!({"activities": [], "more": 0})),
            _ => ok(json!({"series": [], "more": 0})),
        }
    }

    async fn setup(dir: &tempfile::TempDir) -> HealthSync<MockHttp, ManualClock> {
        let clock = ManualClock::at(2025, 1, 1);
        let http = MockHttp::new(vendor);
        // Seeds credentials.json in the data dir.
        token_store(dir.path(), http.clone(), clock.clone());
        let db = Database::open_memory().await.unwrap();
        HealthSync::new(db, http, clock, Paths::new(dir.path())).with_app(test_app())
    }

    #[tokio::test]
    async fn test_sync_while_locked_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let hs = setup(&dir).await;

        let held = RunLock::acquire(&hs.paths().lock_file).unwrap();
        let err = hs
            .sync(&SyncOptions::default(), &NoopProgress, &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)), "{err:?}");

        let status = hs.get_status().await.unwrap();
        assert!(status.types.iter().all(|t| t.last_synced_at.is_none()));
        drop(held);

        let run = hs
            .sync(&SyncOptions::default(), &NoopProgress, &CancelFlag::new())
            .await
            .unwrap();
        assert!(run.all_succeeded());
    }

    #[tokio::test]
    async fn test_status_after_sync() {
        let dir = tempfile::tempdir().unwrap();
        let hs = setup(&dir).await;
        hs.config_set("sync.data_types", "measurement,sleep").await.unwrap();

        let run = hs
            .sync(&SyncOptions::default(), &NoopProgress, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(run.types.len(), 2);

        let status = hs.get_status().await.unwrap();
        let measurement = status
            .types
            .iter()
            .find(|t| t.data_type == DataType::Measurement)
            .unwrap();
        assert!(measurement.enabled);
        assert_eq!(measurement.records, 1);
        assert_eq!(measurement.last_run_status.as_deref(), Some("success"));
        assert_eq!(measurement.last_synced_at.as_deref(), Some("2025-01-01T00:00:00Z"));

        let activity = status
            .types
            .iter()
            .find(|t| t.data_type == DataType::Activity)
            .unwrap();
        assert!(!activity.enabled);
        assert_eq!(activity.last_synced_at, None);

        let cred = status.credential.as_ref().unwrap();
        assert_eq!(cred.user_id.as_deref(), Some("4242"));
        assert!(!cred.expired);
        assert_eq!(status.total_records(), 1);
    }

    #[tokio::test]
    async fn test_reset_cursor_forces_historical_import() {
        let dir = tempfile::tempdir().unwrap();
        let hs = setup(&dir).await;
        hs.config_set("sync.data_types", "activity").await.unwrap();
        hs.sync(&SyncOptions::default(), &NoopProgress, &CancelFlag::new())
            .await
            .unwrap();

        assert!(hs.reset_cursor(DataType::Activity).await.unwrap());
        let run = hs
            .sync(&SyncOptions::default(), &NoopProgress, &CancelFlag::new())
            .await
            .unwrap();
        let activity = run.report(DataType::Activity).unwrap();
        assert_eq!(activity.cursor_before, None);
        assert_eq!(
            activity.range_start,
            Some(chrono::Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_config_set_validates() {
        let dir = tempfile::tempdir().unwrap();
        let hs = setup(&dir).await;

        assert!(hs.config_set("sync.rate_limit", "zero").await.is_err());
        assert!(hs.config_set("sync.unknown", "1").await.is_err());
        hs.config_set("sync.rate_limit", " 60 ").await.unwrap();
        assert_eq!(hs.config_get("sync.rate_limit").await.unwrap().as_deref(), Some("60"));
        assert_eq!(hs.settings().await.unwrap().rate_limit, 60);

        assert!(hs.config_unset("sync.rate_limit").await.unwrap());
        assert_eq!(hs.settings().await.unwrap().rate_limit, 120);
    }

    #[tokio::test]
    async fn test_token_writes_wait_for_a_running_sync() {
        let dir = tempfile::tempdir().unwrap();
        let hs = setup(&dir).await;

        let held = RunLock::acquire(&hs.paths().lock_file).unwrap();
        let err = hs.refresh_token().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)), "{err:?}");
        let err = hs.exchange_code("code-1").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)), "{err:?}");
        assert!(hs.http.calls().is_empty());

        let cred = auth::load_credential(&hs.paths().credentials).unwrap().unwrap();
        assert_eq!(cred.access_token, "access-1");
        drop(held);
    }

    #[tokio::test]
    async fn test_token_commands_need_an_app() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().await.unwrap();
        let hs = HealthSync::new(
            db,
            MockHttp::new(vendor),
            ManualClock::at(2025, 1, 1),
            Paths::new(dir.path()),
        );

        assert!(matches!(hs.authorize_url(None).await, Err(Error::Config(_))));
        assert!(matches!(hs.refresh_token().await, Err(Error::Config(_))));
    }
}
