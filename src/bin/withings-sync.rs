use std::time::Duration;

use clap::{Parser, Subcommand};

use withings_sync::{
    CancelFlag, DataType, HealthSync, OAuthApp, Paths, ReqwestHttp, RunStatus, SyncOptions,
    SyncRun, SyncStatus, SystemClock,
};

type Engine = HealthSync<ReqwestHttp, SystemClock>;

#[derive(Parser)]
#[command(name = "withings-sync", about = "Sync Withings health data into SQLite")]
struct Cli {
    /// Data directory (default: ~/.withings)
    #[arg(long)]
    data_dir: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl withings_sync::SyncProgress for StderrProgress {
    fn on_type_start(&self, data_type: DataType, index: usize, total: usize) {
        eprintln!("[{}/{}] Syncing {}...", index + 1, total, data_type);
    }

    fn on_chunk_written(
        &self,
        data_type: DataType,
        range: &withings_sync::sync::chunk::DateRange,
        counts: &withings_sync::storage::repository::UpsertCounts,
    ) {
        eprintln!(
            "  {} {} .. {}: {} new, {} updated, {} unchanged",
            data_type,
            range.start.format("%Y-%m-%d"),
            range.end.format("%Y-%m-%d"),
            counts.inserted,
            counts.updated,
            counts.unchanged
        );
    }

    fn on_type_complete(&self, report: &withings_sync::TypeReport) {
        eprintln!(
            "  Done: {} ({}/{} chunks)",
            report.status.as_str(),
            report.chunks_completed,
            report.chunks_total
        );
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new data from Withings
    Sync {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Show cursors, last run results and record counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sync repeatedly on a fixed interval until interrupted
    Watch {
        /// Seconds between runs (default: sync.interval, 3600)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Manage the OAuth credential
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Manage per-type sync cursors
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct RangeArgs {
    /// Only look back this many days
    #[arg(long, conflicts_with = "start_date")]
    days: Option<u32>,
    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,
    /// End date, inclusive (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<String>,
    /// Ignore stored cursors and re-import from the start date or epoch
    #[arg(long)]
    full: bool,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Print the authorization URL to open in a browser
    Url {
        /// State value to embed (random if omitted)
        #[arg(long)]
        state: Option<String>,
    },
    /// Exchange the code from the redirect for a credential
    Exchange {
        /// Authorization code
        code: String,
    },
    /// Refresh the stored credential now
    Refresh,
}

#[derive(Subcommand)]
enum CursorAction {
    /// Forget a type's cursor so the next sync re-imports its history
    Reset {
        /// measurement, activity, sleep or heart_rate
        data_type: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// Remove a config value (revert to default)
    Unset { key: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let paths = match &cli.data_dir {
        Some(dir) => Paths::new(dir),
        None => Paths::default_location()?,
    };
    paths.ensure_dir()?;

    let db = withings_sync::Database::open_at(&paths.database).await?;
    let mut engine = HealthSync::new(db, ReqwestHttp::new()?, SystemClock, paths.clone());
    match OAuthApp::from_env(&paths) {
        Ok(app) => engine = engine.with_app(app),
        Err(e) => log::debug!("OAuth app unavailable: {e}"),
    }

    match cli.command {
        Commands::Sync { range } => {
            let options = make_sync_options(&range)?;
            let cancel = cancel_on_ctrl_c().0;
            let run = engine.sync(&options, &StderrProgress, &cancel).await?;
            print_sync_run(&run);
            std::process::exit(exit_code(&run));
        }
        Commands::Status { json } => {
            print_status(&engine, json).await?;
        }
        Commands::Watch { interval } => {
            handle_watch(&engine, interval).await?;
        }
        Commands::Auth { action } => {
            handle_auth(&engine, action).await?;
        }
        Commands::Cursor { action } => match action {
            CursorAction::Reset { data_type } => {
                let data_type: DataType = data_type.parse()?;
                if engine.reset_cursor(data_type).await? {
                    println!("Cursor for {data_type} reset; next sync re-imports its history.");
                } else {
                    println!("No cursor stored for {data_type}.");
                }
            }
        },
        Commands::Config { action } => {
            handle_config(&engine, action).await?;
        }
    }

    Ok(())
}

fn make_sync_options(range: &RangeArgs) -> anyhow::Result<SyncOptions> {
    let start = range
        .start_date
        .as_deref()
        .map(withings_sync::date_util::parse_date)
        .transpose()?;
    let end = range
        .end_date
        .as_deref()
        .map(withings_sync::date_util::parse_date)
        .transpose()?;
    if let (Some(s), Some(e)) = (start, end) {
        anyhow::ensure!(s <= e, "--start-date {s} is after --end-date {e}");
    }
    Ok(SyncOptions {
        start,
        end,
        days: range.days,
        full: range.full,
    })
}

/// A cancel flag tripped by the first Ctrl-C; a second one exits at once.
fn cancel_on_ctrl_c() -> (CancelFlag, tokio::sync::watch::Receiver<bool>) {
    let cancel = CancelFlag::new();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted: finishing the current chunk (Ctrl-C again to abort)");
            flag.cancel();
            let _ = tx.send(true);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });
    (cancel, rx)
}

fn exit_code(run: &SyncRun) -> i32 {
    match run.status {
        RunStatus::RequiresReauth => 2,
        RunStatus::Cancelled => 130,
        RunStatus::Done if run.all_succeeded() => 0,
        RunStatus::Done => 1,
    }
}

async fn handle_watch(engine: &Engine, interval: Option<u64>) -> anyhow::Result<()> {
    let interval = match interval {
        Some(secs) if secs > 0 => Duration::from_secs(secs),
        Some(_) => anyhow::bail!("--interval must be positive"),
        None => engine.settings().await?.watch_interval,
    };
    let (cancel, mut stop) = cancel_on_ctrl_c();
    eprintln!("Syncing every {}s. Ctrl-C to stop.", interval.as_secs());

    loop {
        match engine
            .sync(&SyncOptions::default(), &StderrProgress, &cancel)
            .await
        {
            Ok(run) => {
                print_sync_run(&run);
                if run.requires_reauth() {
                    anyhow::bail!(
                        "authorization expired; run `withings-sync auth url` and try again"
                    );
                }
            }
            Err(e @ withings_sync::Error::AlreadyRunning(_)) => {
                log::warn!("Skipping this round: {e}")
            }
            Err(e) => log::error!("Sync failed: {e}"),
        }

        if cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }
    }
    eprintln!("Stopped.");
    Ok(())
}

async fn handle_auth(engine: &Engine, action: AuthAction) -> anyhow::Result<()> {
    match action {
        AuthAction::Url { state } => {
            let (url, state) = engine.authorize_url(state.as_deref()).await?;
            println!("Open this URL and approve access:\n\n  {url}\n");
            println!("State: {state}");
            println!("Then run: withings-sync auth exchange <CODE>");
        }
        AuthAction::Exchange { code } => {
            let cred = engine.exchange_code(&code).await?;
            println!(
                "Authorized user {} (token valid until {}).",
                cred.user_id.as_deref().unwrap_or("unknown"),
                cred.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        AuthAction::Refresh => {
            let cred = engine.refresh_token().await?;
            println!(
                "Token refreshed, valid until {}.",
                cred.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }
    Ok(())
}

async fn print_status(engine: &Engine, json: bool) -> anyhow::Result<()> {
    let status = engine.get_status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Withings Sync Status");
    println!("  Database: {}", status.database);
    match &status.credential {
        Some(c) => println!(
            "  Auth:     user {} ({} {})",
            c.user_id.as_deref().unwrap_or("unknown"),
            if c.expired { "expired" } else { "valid until" },
            c.expires_at.format("%Y-%m-%d %H:%M UTC")
        ),
        None => println!("  Auth:     not authorized (run: withings-sync auth url)"),
    }
    println!("  Records:  {}", status.total_records());
    println!();
    for t in &status.types {
        println!(
            "  {:<12} {:>7} records  synced to {}{}",
            t.data_type.as_str(),
            t.records,
            t.last_synced_at.as_deref().unwrap_or("never"),
            if t.enabled { "" } else { "  (disabled)" }
        );
        if let Some(ref s) = t.last_run_status {
            println!(
                "  {:<12} last run {} at {}",
                "",
                s,
                t.last_run_at.as_deref().unwrap_or("?")
            );
        }
        if let Some(ref err) = t.last_error {
            println!("  {:<12} error: {err}", "");
        }
    }
    Ok(())
}

async fn handle_config(engine: &Engine, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match engine.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            engine.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::Unset { key } => {
            if engine.config_unset(&key).await? {
                println!("{key} removed.");
            } else {
                println!("{key} is not set");
            }
        }
        ConfigAction::List => {
            let items = engine.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

fn print_sync_run(run: &SyncRun) {
    let elapsed = run.finished_at - run.started_at;
    println!("Sync {:?} in {}s", run.status, elapsed.num_seconds());
    for t in &run.types {
        println!("  {}: {}", t.data_type, t.status.as_str());
        if t.status != SyncStatus::Skipped {
            println!(
                "    Fetched: {} ({} inserted, {} updated, {} unchanged, {} undecodable)",
                t.fetched, t.inserted, t.updated, t.unchanged, t.failed
            );
            println!("    Chunks:  {}/{}", t.chunks_completed, t.chunks_total);
            if let Some(cursor) = t.cursor_after {
                println!("    Cursor:  {}", cursor.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        if let Some(ref err) = t.error {
            println!("    Error:   {err}");
        }
    }
    if run.requires_reauth() {
        println!("Authorization expired. Run: withings-sync auth url");
    }
}
