pub mod cancel;
pub mod capture;
pub mod compare;
pub mod config;
pub mod db_reset;
pub mod errors;
pub mod fixture;
pub mod fsm;
pub mod log_retention;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod relay;
pub mod report;
pub mod runtime;
pub mod sniff;
pub mod supervisor;
pub mod tui;
pub mod types;

use cancel::CancelSignal;
use capture::{CaptureStore, IgnoreList};
use clap::{error::ErrorKind, Parser, ValueEnum};
use config::{load_config, require_run_inputs, CliOverrides, GraderConfig, RunInputs};
use db_reset::SqliteDatabaseReset;
use errors::GraderError;
use fixture::{DirectoryFixtureStore, FixtureStore};
use logging::{append_run_log, init_run_logger, JsonlLogger};
use orchestrator::{GradingOrchestrator, OrchestratorSettings, RunOutcome, RunStatus};
use relay::TrafficRelay;
use report::FileReportSink;
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use supervisor::ProcessSupervisor;
use types::Protocol;

pub const EXIT_ALL_PASSED: i32 = 0;
pub const EXIT_RUN_FAILED: i32 = 1;
pub const EXIT_CASES_FAILED: i32 = 2;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Parser)]
#[command(name = "grader", version)]
#[command(about = "Grades a client/server pair against scripted fixture suites")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub client: Option<PathBuf>,
    #[arg(long)]
    pub server: Option<PathBuf>,
    #[arg(long)]
    pub suite: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub protocol: Option<CliProtocol>,
    #[arg(long)]
    pub results_dir: Option<PathBuf>,
    #[arg(long)]
    pub ignore_file: Option<PathBuf>,
    /// Check configuration and fixtures, then exit without grading.
    #[arg(long, default_value_t = false)]
    pub validate_only: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliProtocol {
    Http,
    Tcp,
}

impl From<CliProtocol> for Protocol {
    fn from(value: CliProtocol) -> Self {
        match value {
            CliProtocol::Http => Protocol::Http,
            CliProtocol::Tcp => Protocol::Tcp,
        }
    }
}

pub fn run() -> Result<i32, GraderError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| GraderError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, GraderError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(EXIT_ALL_PASSED);
            }
            _ => return Err(GraderError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        client: cli.client.clone(),
        server: cli.server.clone(),
        suite: cli.suite.clone(),
        protocol: cli.protocol.map(Into::into),
        results_dir: cli.results_dir.clone(),
        ignore_file: cli.ignore_file.clone(),
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    let inputs = require_run_inputs(&cfg, runtime.file_system.as_ref())?;

    init_run_logger(JsonlLogger {
        budget_bytes: cfg.logging.budget_bytes,
        ..JsonlLogger::new(cwd.join(&cfg.logging.path))
    });
    append_run_log(
        "info",
        "run.config.loaded",
        json!({
            "client": inputs.client.display().to_string(),
            "server": inputs.server.display().to_string(),
            "suite": inputs.suite.display().to_string(),
            "validate_only": cli.validate_only,
        }),
    );

    if cli.validate_only {
        return validate_suite(&inputs, &cfg, runtime);
    }

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| GraderError::Io(e.to_string()))?;
    let outcome = tokio_runtime.block_on(grade_suite(&cfg, &inputs))?;
    tui::present_outcome(runtime.terminal.as_ref(), &outcome)?;
    Ok(exit_code(&outcome))
}

pub fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome.status {
        RunStatus::Cancelled => EXIT_CANCELLED,
        RunStatus::Failed => EXIT_RUN_FAILED,
        RunStatus::Completed if outcome.summary.all_passed() => EXIT_ALL_PASSED,
        RunStatus::Completed => EXIT_CASES_FAILED,
    }
}

/// Loads the suite and every case without launching anything.
fn validate_suite(
    inputs: &RunInputs,
    cfg: &GraderConfig,
    runtime: &ProductionRuntime,
) -> Result<i32, GraderError> {
    let store = DirectoryFixtureStore::new(&inputs.suite);
    let suite = store
        .load_suite()
        .map_err(|e| GraderError::Configuration(e.to_string()))?;
    for definition in &suite.cases {
        store.load_case(&suite, definition)?;
    }
    let protocol = cfg.suite.protocol.unwrap_or(suite.protocol);
    runtime.terminal.write_line(&format!(
        "suite ok: {} cases, protocol {}",
        suite.cases.len(),
        protocol.as_str()
    ))?;
    Ok(EXIT_ALL_PASSED)
}

fn suite_root(suite: &Path) -> PathBuf {
    if suite.is_file() {
        suite.parent().map(Path::to_path_buf).unwrap_or_default()
    } else {
        suite.to_path_buf()
    }
}

async fn grade_suite(cfg: &GraderConfig, inputs: &RunInputs) -> Result<RunOutcome, GraderError> {
    let ignore = match &cfg.grading.ignore_file {
        Some(path) => IgnoreList::load(path)?,
        None => IgnoreList::default(),
    };
    let capture = CaptureStore::new(ignore);
    let cancel = CancelSignal::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            append_run_log("warn", "run.interrupted", json!({}));
            on_interrupt.cancel();
        }
    });

    let results_base = cfg
        .grading
        .results_dir
        .clone()
        .unwrap_or_else(|| suite_root(&inputs.suite).join("GradeResults"));
    let settings = OrchestratorSettings {
        client_executable: inputs.client.clone(),
        server_executable: inputs.server.clone(),
        protocol_override: cfg.suite.protocol,
        stage_timeout: Duration::from_millis(cfg.timing.stage_timeout_ms),
        poll_interval: Duration::from_millis(cfg.timing.poll_interval_ms),
        startup_wait: Duration::from_millis(cfg.timing.startup_wait_ms),
    };

    let mut orchestrator = GradingOrchestrator::new(
        ProcessSupervisor::new(cfg.supervisor_settings()),
        TrafficRelay::new(cfg.relay_settings()?, capture.clone()),
        Box::new(DirectoryFixtureStore::new(&inputs.suite)),
        Box::new(FileReportSink::new(&results_base)),
        capture,
        cancel,
        settings,
    );
    if let Some(settings_path) = &cfg.database.settings_path {
        orchestrator = orchestrator.with_database_reset(Box::new(SqliteDatabaseReset::new(
            settings_path,
            cfg.database.connection_key.clone(),
            cfg.database.script_path.clone(),
        )));
    }
    Ok(orchestrator.run().await)
}
