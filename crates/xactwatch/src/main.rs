//! xw: long-transaction watchdog CLI for PostgreSQL.
//!
//! One invocation is one scan. Scheduling (cron, systemd timers, a shell
//! loop) is the caller's concern; the tool keeps no state between runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xactwatch_core::config::{FileConfig, ScanParams, parse_duration};
use xactwatch_core::db::PgDatabase;
use xactwatch_core::report::ReportMode;
use xactwatch_core::watchdog::Watchdog;

/// Scan a PostgreSQL database for long-running transactions, report them,
/// and optionally cancel or terminate the offending backends.
#[derive(Debug, Parser)]
#[command(name = "xw", version, about)]
struct Cli {
    /// Server host
    #[arg(long, env = "PGHOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, env = "PGPORT")]
    port: Option<u16>,

    /// User to connect as
    #[arg(long, env = "PGUSER")]
    user: Option<String>,

    /// Database to scan (defaults to the user name)
    #[arg(long, env = "PGDATABASE")]
    dbname: Option<String>,

    /// TOML config file ([connection] and [watchdog] tables)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Report transactions older than this (e.g. 750ms, 30s, 10m)
    #[arg(long, value_name = "DURATION")]
    min_duration: Option<String>,

    /// Also resolve and report the session blocking each waiter
    #[arg(long)]
    report_blockers: bool,

    /// One of debug/log/info/notice/warning for live emission; anything
    /// else returns rows on stdout
    #[arg(long, value_name = "MODE")]
    report_mode: Option<String>,

    /// Start attempting cancellation past this age
    #[arg(long, value_name = "DURATION")]
    cancel_after: Option<String>,

    /// Start attempting termination past this age (after a failed cancel)
    #[arg(long, value_name = "DURATION")]
    terminate_after: Option<String>,

    /// Touch every qualifying transaction instead of at most one per run
    #[arg(long)]
    cancel_all: bool,

    /// How to print rows-mode output
    #[arg(long, value_parser = ["plain", "json"], default_value = "plain")]
    format: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Merge CLI flags over file config into scan parameters.
/// Precedence: flag > file > built-in default.
fn build_params(cli: &Cli, file: &FileConfig) -> anyhow::Result<ScanParams> {
    let min_duration = match &cli.min_duration {
        Some(raw) => parse_duration(raw)?,
        None => file.watchdog.min_duration.ok_or_else(|| {
            xactwatch_core::Error::Config(
                "--min-duration is required (flag or config file)".to_string(),
            )
        })?,
    };

    let mut params = ScanParams::new(min_duration);
    params.report_blockers = cli.report_blockers || file.watchdog.report_blockers.unwrap_or(false);
    params.cancel_all = cli.cancel_all || file.watchdog.cancel_all.unwrap_or(false);

    let mode = cli
        .report_mode
        .as_deref()
        .or(file.watchdog.report_mode.as_deref());
    if let Some(mode) = mode {
        params.report_mode = ReportMode::from(mode);
    }

    params.cancel_after = match &cli.cancel_after {
        Some(raw) => Some(parse_duration(raw)?),
        None => file.watchdog.cancel_after,
    };
    params.terminate_after = match &cli.terminate_after {
        Some(raw) => Some(parse_duration(raw)?),
        None => file.watchdog.terminate_after,
    };

    Ok(params)
}

/// Build the connection config. Password comes from `PGPASSWORD` only.
fn build_pg_config(cli: &Cli, file: &FileConfig) -> tokio_postgres::Config {
    let conn = &file.connection;
    let host = cli
        .host
        .clone()
        .or_else(|| conn.host.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let user = cli
        .user
        .clone()
        .or_else(|| conn.user.clone())
        .unwrap_or_else(|| "postgres".to_string());
    let dbname = cli
        .dbname
        .clone()
        .or_else(|| conn.dbname.clone())
        .unwrap_or_else(|| user.clone());

    let mut config = tokio_postgres::Config::new();
    config
        .host(&host)
        .port(cli.port.or(conn.port).unwrap_or(5432))
        .dbname(&dbname)
        .user(&user)
        .application_name("xactwatch")
        .connect_timeout(Duration::from_secs(10));

    if let Ok(password) = std::env::var("PGPASSWORD") {
        config.password(password);
    }
    config
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = match &cli.config {
        Some(path) => {
            FileConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let params = build_params(&cli, &file)?;
    params.validate()?;

    let pg_config = build_pg_config(&cli, &file);
    let db = PgDatabase::connect(&pg_config)
        .await
        .context("connecting to server")?;

    let watchdog = Watchdog::new(Arc::new(db));
    let rows = watchdog.run(&params).await.context("scan failed")?;

    if params.report_mode == ReportMode::Rows {
        if cli.format == "json" {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            for row in &rows {
                println!("{row}");
            }
        }
    }
    Ok(())
}

/// Exit codes: 0 success, 1 configuration error, 2 scan/connection failure.
fn classify(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(core) = cause.downcast_ref::<xactwatch_core::Error>() {
            return match core {
                xactwatch_core::Error::Config(_) | xactwatch_core::Error::Io(_) => 1,
                _ => 2,
            };
        }
    }
    2
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "run failed");
            eprintln!("xw: {err:#}");
            ExitCode::from(classify(&err))
        }
    }
}
