//! Drives every case of a suite through its stages and grades the captures.

use crate::capture::CaptureStore;
use crate::cancel::CancelSignal;
use crate::compare::compare_stage;
use crate::db_reset::DatabaseReset;
use crate::errors::GraderError;
use crate::fixture::FixtureStore;
use crate::fsm::{RunSnapshot, RunState};
use crate::logging::append_run_log;
use crate::report::{CaseReport, CaseSummary, ReportSink, StageResult, SuiteSummary};
use crate::runtime::{ProcessControl, RelayControl};
use crate::types::{
    CaseDefinition, Protocol, RelayMode, Side, StageAction, StageActionKind, TestCase, TestSuite,
    Verdict,
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

const STARTUP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub client_executable: PathBuf,
    pub server_executable: PathBuf,
    pub protocol_override: Option<Protocol>,
    pub stage_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_wait: Duration,
}

impl OrchestratorSettings {
    pub fn new(client_executable: impl Into<PathBuf>, server_executable: impl Into<PathBuf>) -> Self {
        Self {
            client_executable: client_executable.into(),
            server_executable: server_executable.into(),
            protocol_override: None,
            stage_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
            startup_wait: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub summary: SuiteSummary,
    pub summary_path: Option<PathBuf>,
    pub failure: Option<String>,
}

/// Failures that belong to the case under test rather than to the harness.
fn is_case_failure(error: &GraderError) -> bool {
    matches!(
        error,
        GraderError::NotFound(_)
            | GraderError::ProcessLaunch(_)
            | GraderError::Fixture(_)
            | GraderError::Database(_)
    )
}

#[derive(Debug, Default)]
struct CaseProgress {
    steps: Vec<StageResult>,
    verdicts: Vec<Verdict>,
}

enum CaseEnd {
    Finished(CaseSummary),
    Errored(CaseSummary),
    Cancelled,
}

pub struct GradingOrchestrator<P: ProcessControl, R: RelayControl> {
    processes: P,
    relay: R,
    fixtures: Box<dyn FixtureStore>,
    reports: Box<dyn ReportSink>,
    database: Option<Box<dyn DatabaseReset>>,
    capture: CaptureStore,
    cancel: CancelSignal,
    settings: OrchestratorSettings,
    run: RunSnapshot,
}

impl<P: ProcessControl, R: RelayControl> GradingOrchestrator<P, R> {
    pub fn new(
        processes: P,
        relay: R,
        fixtures: Box<dyn FixtureStore>,
        reports: Box<dyn ReportSink>,
        capture: CaptureStore,
        cancel: CancelSignal,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            processes,
            relay,
            fixtures,
            reports,
            database: None,
            capture,
            cancel,
            settings,
            run: RunSnapshot::default(),
        }
    }

    pub fn with_database_reset(mut self, database: Box<dyn DatabaseReset>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn snapshot(&self) -> &RunSnapshot {
        &self.run
    }

    pub async fn run(&mut self) -> RunOutcome {
        if let Err(error) = self.run.transition(RunState::Validating) {
            return self.abort(error.to_string());
        }
        let suite = match self.fixtures.load_suite() {
            Ok(suite) => suite,
            Err(error) => {
                let error = GraderError::Configuration(error.to_string());
                return self.abort(error.to_string());
            }
        };
        let protocol = self.settings.protocol_override.unwrap_or(suite.protocol);
        append_run_log(
            "info",
            "orchestrator.run.started",
            json!({
                "cases": suite.cases.len(),
                "protocol": protocol.as_str(),
                "root": suite.root.display().to_string(),
            }),
        );

        let mut summary = SuiteSummary::default();
        let mut errored = false;
        for definition in &suite.cases {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(summary);
            }
            match self.run_case(&suite, definition, protocol.relay_mode()).await {
                CaseEnd::Finished(case) => summary.cases.push(case),
                CaseEnd::Errored(case) => {
                    errored = true;
                    summary.cases.push(case);
                }
                CaseEnd::Cancelled => return self.finish_cancelled(summary),
            }
        }

        if let Err(error) = self.run.transition(RunState::Summarizing) {
            return self.abort(error.to_string());
        }
        let summary_path = self.write_summary(&summary);
        let (status, failure) = if errored {
            let reason = "one or more cases raised an internal error".to_string();
            let _ = self.run.fail(reason.clone());
            (RunStatus::Failed, Some(reason))
        } else {
            let _ = self.run.transition(RunState::Done);
            (RunStatus::Completed, None)
        };
        append_run_log(
            "info",
            "orchestrator.run.finished",
            json!({
                "status": status.as_str(),
                "passed": summary.passed_count(),
                "failed": summary.failed_count(),
            }),
        );
        RunOutcome {
            status,
            summary,
            summary_path,
            failure,
        }
    }

    fn abort(&mut self, reason: String) -> RunOutcome {
        append_run_log(
            "error",
            "orchestrator.run.failed",
            json!({ "reason": reason }),
        );
        let _ = self.run.fail(reason.clone());
        RunOutcome {
            status: RunStatus::Failed,
            summary: SuiteSummary::default(),
            summary_path: None,
            failure: Some(reason),
        }
    }

    fn finish_cancelled(&mut self, summary: SuiteSummary) -> RunOutcome {
        let _ = self.run.transition(RunState::Cancelled);
        append_run_log(
            "warn",
            "orchestrator.run.cancelled",
            json!({ "completed_cases": summary.cases.len() }),
        );
        let summary_path = self.write_summary(&summary);
        RunOutcome {
            status: RunStatus::Cancelled,
            summary,
            summary_path,
            failure: None,
        }
    }

    fn write_summary(&self, summary: &SuiteSummary) -> Option<PathBuf> {
        match self.reports.write_summary(summary) {
            Ok(path) => Some(path),
            Err(error) => {
                append_run_log(
                    "error",
                    "orchestrator.summary.write_failed",
                    json!({ "error": error.to_string() }),
                );
                None
            }
        }
    }

    async fn run_case(
        &mut self,
        suite: &TestSuite,
        definition: &CaseDefinition,
        mode: RelayMode,
    ) -> CaseEnd {
        append_run_log(
            "info",
            "orchestrator.case.started",
            json!({ "case": definition.name, "mark": definition.mark }),
        );
        let mut progress = CaseProgress::default();
        let outcome = self.drive_case(suite, definition, mode, &mut progress).await;
        self.shutdown_case().await;

        let (failure, partial) = match outcome {
            Ok(()) => (None, false),
            Err(GraderError::Cancelled) => return CaseEnd::Cancelled,
            Err(error) if is_case_failure(&error) => {
                append_run_log(
                    "warn",
                    "orchestrator.case.failed",
                    json!({ "case": definition.name, "error": error.to_string() }),
                );
                (Some(error.to_string()), false)
            }
            Err(error) => {
                append_run_log(
                    "error",
                    "orchestrator.case.errored",
                    json!({
                        "case": definition.name,
                        "state": self.run.state.as_str(),
                        "stage": self.run.stage,
                        "error": error.to_string(),
                    }),
                );
                (Some(format!("internal error: {error}")), true)
            }
        };

        let mut reasons = progress
            .verdicts
            .iter()
            .flat_map(|verdict| verdict.issues.iter().cloned())
            .collect::<Vec<_>>();
        if let Some(failure) = &failure {
            reasons.push(failure.clone());
        }
        let passed = failure.is_none() && progress.verdicts.iter().all(|verdict| verdict.passed);

        let report = CaseReport {
            case: definition.name.clone(),
            mark: definition.mark,
            passed,
            partial,
            steps: progress.steps,
            captured_client: self.capture.records(Side::Client),
            captured_server: self.capture.records(Side::Server),
        };
        let result_file = match self.reports.write_case(&report) {
            Ok(path) => Some(path),
            Err(error) => {
                append_run_log(
                    "error",
                    "orchestrator.report.write_failed",
                    json!({ "case": definition.name, "error": error.to_string() }),
                );
                None
            }
        };
        append_run_log(
            "info",
            "orchestrator.case.finished",
            json!({ "case": definition.name, "passed": passed, "issues": reasons.len() }),
        );

        let summary = CaseSummary {
            name: definition.name.clone(),
            mark: definition.mark,
            passed,
            result_file,
            reasons,
        };
        if partial {
            CaseEnd::Errored(summary)
        } else {
            CaseEnd::Finished(summary)
        }
    }

    async fn drive_case(
        &mut self,
        suite: &TestSuite,
        definition: &CaseDefinition,
        mode: RelayMode,
        progress: &mut CaseProgress,
    ) -> Result<(), GraderError> {
        self.run.enter_case(&definition.name)?;
        // Stragglers from the previous case's processes must not leak in.
        let _ = self.processes.drain_events();
        self.capture.reset();

        let case = self.fixtures.load_case(suite, definition)?;
        progress.steps = case
            .actions
            .iter()
            .map(|action| StageResult::pending(action.stage, action.describe()))
            .collect();
        if let Some(first) = case.first_meaningful_stage() {
            if !case.actions.iter().any(|action| action.stage == first) {
                return Err(GraderError::Fixture(format!(
                    "case {}: stage {first} is expected but has no scripted step",
                    case.name
                )));
            }
        }

        let client = self.settings.client_executable.clone();
        let server = self.settings.server_executable.clone();
        self.processes.configure(Side::Client, &client)?;
        self.processes.configure(Side::Server, &server)?;

        if let Some(database) = &self.database {
            database.reset()?;
        }

        for (index, action) in case.actions.iter().enumerate() {
            self.cancel.check()?;
            self.run.enter_stage(action.stage)?;
            self.pump_events();
            self.capture.advance_stage(action.stage);
            append_run_log(
                "debug",
                "orchestrator.stage.started",
                json!({
                    "case": case.name,
                    "stage": action.stage,
                    "action": action.kind.as_str(),
                }),
            );

            if index == 0 {
                self.launch(mode).await?;
            }

            self.run.transition(RunState::ExecutingAction)?;
            let mut issues = self.execute_action(action, mode).await?;

            self.run.transition(RunState::AwaitingCapture)?;
            self.await_capture(&case, action.stage).await?;

            self.run.transition(RunState::Evaluating)?;
            self.pump_events();
            issues.extend(self.evaluate(&case, action));
            if let Some(step) = progress.steps.get_mut(index) {
                step.settle(&issues);
            }
            progress.verdicts.push(Verdict::from_issues(action.stage, issues));
        }
        Ok(())
    }

    /// Routes queued console lines and exit notices into the current stage.
    fn pump_events(&mut self) {
        for event in self.processes.drain_events() {
            self.capture
                .append_console_output(event.side(), &event.console_text());
        }
    }

    async fn wait_for_server(&mut self) -> Result<(), GraderError> {
        let deadline = Instant::now() + self.settings.startup_wait;
        while !self.processes.is_running(Side::Server) {
            if Instant::now() >= deadline {
                append_run_log(
                    "warn",
                    "orchestrator.server.not_running",
                    json!({ "waited_ms": self.settings.startup_wait.as_millis() as u64 }),
                );
                return Ok(());
            }
            self.cancel.sleep(STARTUP_POLL).await?;
        }
        Ok(())
    }

    async fn ensure_server_and_relay(&mut self, mode: RelayMode) -> Result<(), GraderError> {
        if !self.processes.is_running(Side::Server) {
            self.processes.start(Side::Server).await?;
            self.wait_for_server().await?;
        }
        self.relay.start(mode).await
    }

    async fn launch(&mut self, mode: RelayMode) -> Result<(), GraderError> {
        self.ensure_server_and_relay(mode).await?;
        self.processes.start(Side::Client).await
    }

    /// Action failures become stage issues; only cancellation escapes.
    async fn execute_action(
        &mut self,
        action: &StageAction,
        mode: RelayMode,
    ) -> Result<Vec<String>, GraderError> {
        let result = match action.kind {
            StageActionKind::ClientInput => {
                self.processes
                    .send_input(Side::Client, &action.payload)
                    .await
            }
            StageActionKind::ClientClose => {
                let stopped = self.processes.hard_stop(Side::Client).await;
                self.relay.stop().await;
                stopped
            }
            StageActionKind::ServerClose => {
                let stopped = self.processes.hard_stop(Side::Server).await;
                self.relay.stop().await;
                stopped
            }
            StageActionKind::ClientStart => match self.ensure_server_and_relay(mode).await {
                Ok(()) => self.processes.start(Side::Client).await,
                Err(error) => Err(error),
            },
            StageActionKind::ServerStart => self.processes.start(Side::Server).await,
            StageActionKind::Noop => Ok(()),
        };
        match result {
            Ok(()) => Ok(Vec::new()),
            Err(GraderError::Cancelled) => Err(GraderError::Cancelled),
            Err(error) => {
                append_run_log(
                    "warn",
                    "orchestrator.action.failed",
                    json!({
                        "stage": action.stage,
                        "action": action.kind.as_str(),
                        "error": error.to_string(),
                    }),
                );
                Ok(vec![format!(
                    "Stage {}: {} failed: {error}",
                    action.stage,
                    action.kind.as_str()
                )])
            }
        }
    }

    /// Returns once every side with a meaningful expectation has meaningful
    /// capture, or when the stage timeout runs out.
    async fn await_capture(&mut self, case: &TestCase, stage: u32) -> Result<(), GraderError> {
        let sides = [Side::Client, Side::Server]
            .into_iter()
            .filter(|side| {
                case.expectation(*side, stage)
                    .is_some_and(|expectation| expectation.is_meaningful())
            })
            .collect::<Vec<_>>();
        if sides.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.settings.stage_timeout;
        loop {
            self.cancel.check()?;
            self.pump_events();
            if sides
                .iter()
                .all(|side| self.capture.has_meaningful(*side, stage))
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                append_run_log(
                    "warn",
                    "orchestrator.stage.timeout",
                    json!({
                        "case": case.name,
                        "stage": stage,
                        "timeout_ms": self.settings.stage_timeout.as_millis() as u64,
                    }),
                );
                return Ok(());
            }
            self.cancel.sleep(self.settings.poll_interval).await?;
        }
    }

    fn evaluate(&self, case: &TestCase, action: &StageAction) -> Vec<String> {
        let mut issues = Vec::new();
        for side in [Side::Client, Side::Server] {
            let actual = self.capture.snapshot(side, action.stage);
            issues.extend(compare_stage(
                action.stage,
                side,
                case.expectation(side, action.stage),
                actual.as_ref(),
                &action.declared_type,
            ));
        }
        issues
    }

    async fn shutdown_case(&mut self) {
        if let Err(error) = self.processes.stop_all().await {
            append_run_log(
                "warn",
                "orchestrator.shutdown.failed",
                json!({ "error": error.to_string() }),
            );
        }
        self.relay.stop().await;
    }
}
