use grader::cancel::CancelSignal;
use grader::capture::{CaptureStore, TrafficUpdate};
use grader::db_reset::{DatabaseReset, ResetOutcome};
use grader::errors::GraderError;
use grader::fixture::MemoryFixtureStore;
use grader::fsm::RunState;
use grader::orchestrator::{GradingOrchestrator, OrchestratorSettings, RunStatus};
use grader::report::MemoryReportSink;
use grader::runtime::{
    FakeCallLog, FakeProcessControl, FakeRelay, RelayControl, ScriptedReaction,
};
use grader::types::{Expectation, Protocol, RelayMode, Side, StageAction, StageActionKind, TestCase};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

fn input(stage: u32, text: &str) -> StageAction {
    StageAction {
        stage,
        kind: StageActionKind::ClientInput,
        payload: text.to_string(),
        declared_type: "String".to_string(),
    }
}

fn test_case(name: &str, actions: Vec<StageAction>, client: Vec<Expectation>, server: Vec<Expectation>) -> TestCase {
    TestCase {
        name: name.to_string(),
        mark: 2.0,
        actions,
        expected_client: client.into_iter().map(|e| (e.stage, e)).collect::<BTreeMap<_, _>>(),
        expected_server: server.into_iter().map(|e| (e.stage, e)).collect::<BTreeMap<_, _>>(),
    }
}

fn http(method: &str, body: &str, status: Option<&str>) -> TrafficUpdate {
    TrafficUpdate {
        method: method.to_string(),
        payload: body.to_string(),
        byte_size: body.len() as u64,
        status_code: status.map(str::to_string),
        data_type: "JSON".to_string(),
    }
}

/// Stage 1 expects a 200 back to the client and a GET at the server; stage 2
/// expects a 10 byte response.
fn two_stage_case() -> TestCase {
    let mut client_ok = Expectation::new(1);
    client_ok.status_code = Some("200".to_string());
    let mut server_get = Expectation::new(1);
    server_get.method = "GET".to_string();
    let mut client_size = Expectation::new(2);
    client_size.byte_size = 10;
    test_case(
        "orders",
        vec![input(1, "1"), input(2, "2")],
        vec![client_ok, client_size],
        vec![server_get],
    )
}

struct Harness {
    orchestrator: GradingOrchestrator<FakeProcessControl, FakeRelay>,
    processes: FakeProcessControl,
    reports: MemoryReportSink,
    log: FakeCallLog,
    cancel: CancelSignal,
}

fn harness(fixtures: MemoryFixtureStore) -> Harness {
    let capture = CaptureStore::default();
    let log = FakeCallLog::default();
    let processes = FakeProcessControl::new(capture.clone(), RelayMode::Message, log.clone());
    let reports = MemoryReportSink::default();
    let cancel = CancelSignal::new();
    let orchestrator = GradingOrchestrator::new(
        processes.clone(),
        FakeRelay::new(log.clone()),
        Box::new(fixtures),
        Box::new(reports.clone()),
        capture,
        cancel.clone(),
        OrchestratorSettings::new("/bin/client", "/bin/server"),
    );
    Harness {
        orchestrator,
        processes,
        reports,
        log,
        cancel,
    }
}

#[tokio::test(start_paused = true)]
async fn matching_two_stage_case_passes() {
    let mut h = harness(MemoryFixtureStore::new(Protocol::Http).with_case(two_stage_case()));
    h.processes.react(
        ScriptedReaction::at_stage(1)
            .traffic(Side::Server, http("GET", "", None))
            .traffic(Side::Client, http("GET", r#"{"items":[]}"#, Some("200"))),
    );
    h.processes.react(
        ScriptedReaction::at_stage(2).traffic(Side::Client, http("GET", "0123456789", Some("200"))),
    );

    let outcome = h.orchestrator.run().await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.summary.all_passed(), "{:?}", outcome.summary);
    let report = &h.reports.cases()[0];
    assert!(report.passed);
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|step| step.result == "PASS"));
    assert_eq!(report.captured_client.len(), 2);
    assert_eq!(report.captured_server[0].method, "GET");
    assert_eq!(h.reports.summaries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn byte_size_mismatch_in_stage_two_fails_with_one_issue() {
    let mut h = harness(MemoryFixtureStore::new(Protocol::Http).with_case(two_stage_case()));
    h.processes.react(
        ScriptedReaction::at_stage(1)
            .traffic(Side::Server, http("GET", "", None))
            .traffic(Side::Client, http("GET", "[]", Some("200"))),
    );
    h.processes.react(
        ScriptedReaction::at_stage(2).traffic(Side::Client, http("GET", "0123456789AB", Some("200"))),
    );

    let outcome = h.orchestrator.run().await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let case = &outcome.summary.cases[0];
    assert!(!case.passed);
    assert_eq!(
        case.reasons,
        vec!["Stage 2: Client byte size expected 10, actual 12."]
    );
    let report = &h.reports.cases()[0];
    assert_eq!(report.steps[0].result, "PASS");
    assert_eq!(
        report.steps[1].result,
        "Stage 2: Client byte size expected 10, actual 12."
    );
}

#[tokio::test(start_paused = true)]
async fn unmeaningful_expectations_are_neither_awaited_nor_compared() {
    let case = test_case(
        "quiet",
        vec![input(1, "x")],
        vec![Expectation::new(1)],
        vec![Expectation::new(1)],
    );
    let mut h = harness(MemoryFixtureStore::new(Protocol::Http).with_case(case));

    let started = Instant::now();
    let outcome = h.orchestrator.run().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(outcome.summary.all_passed());
    assert!(outcome.summary.cases[0].reasons.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_capture_wait_reports_cancelled_and_stops_processes() {
    let mut expected = Expectation::new(1);
    expected.method = "GET".to_string();
    let case = test_case("slow", vec![input(1, "go")], Vec::new(), vec![expected]);
    let second = test_case("never", vec![input(1, "go")], Vec::new(), Vec::new());
    let mut h = harness(
        MemoryFixtureStore::new(Protocol::Http)
            .with_case(case)
            .with_case(second),
    );

    let cancel = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    });
    let outcome = h.orchestrator.run().await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(h.orchestrator.snapshot().state, RunState::Cancelled);
    assert!(!h.processes.running(Side::Client));
    assert!(!h.processes.running(Side::Server));
    assert_eq!(h.log.count("stop_all"), 1);
    assert_eq!(h.log.count("relay_stop"), 1);
    assert!(h.reports.cases().is_empty());
    assert!(outcome.summary.cases.is_empty());
}

struct BrokenRelay;

impl RelayControl for BrokenRelay {
    async fn start(&mut self, _mode: RelayMode) -> Result<(), GraderError> {
        Err(GraderError::Relay("address in use".to_string()))
    }

    async fn stop(&mut self) {}

    fn is_listening(&self) -> bool {
        false
    }
}

#[tokio::test(start_paused = true)]
async fn internal_error_keeps_going_and_fails_the_run() {
    let capture = CaptureStore::default();
    let log = FakeCallLog::default();
    let processes = FakeProcessControl::new(capture.clone(), RelayMode::Message, log.clone());
    let reports = MemoryReportSink::default();
    let fixtures = MemoryFixtureStore::new(Protocol::Http)
        .with_case(test_case("first", vec![input(1, "a")], Vec::new(), Vec::new()))
        .with_case(test_case("second", vec![input(1, "b")], Vec::new(), Vec::new()));
    let mut orchestrator = GradingOrchestrator::new(
        processes.clone(),
        BrokenRelay,
        Box::new(fixtures),
        Box::new(reports.clone()),
        capture,
        CancelSignal::new(),
        OrchestratorSettings::new("/bin/client", "/bin/server"),
    );

    let outcome = orchestrator.run().await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(orchestrator.snapshot().state, RunState::Failed);
    assert_eq!(outcome.summary.cases.len(), 2);
    assert!(reports.cases().iter().all(|report| report.partial && !report.passed));
    assert!(outcome.summary.cases[0].reasons[0].contains("address in use"));
    assert_eq!(log.count("stop_all"), 2);
    assert!(!processes.running(Side::Server));
}

struct FailingReset;

impl DatabaseReset for FailingReset {
    fn reset(&self) -> Result<ResetOutcome, GraderError> {
        Err(GraderError::Database("script failed".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn database_reset_failure_fails_the_case_only() {
    let case = test_case("db", vec![input(1, "a")], Vec::new(), Vec::new());
    let h = harness(MemoryFixtureStore::new(Protocol::Http).with_case(case));
    let mut orchestrator = h.orchestrator.with_database_reset(Box::new(FailingReset));

    let outcome = orchestrator.run().await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(!outcome.summary.cases[0].passed);
    assert!(outcome.summary.cases[0].reasons[0].contains("script failed"));
    assert_eq!(h.log.count("start:server"), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_executable_fails_the_case_and_the_next_case_still_runs() {
    let fixtures = MemoryFixtureStore::new(Protocol::Tcp)
        .with_case(test_case("one", vec![input(1, "a")], Vec::new(), Vec::new()))
        .with_case(test_case("two", vec![input(1, "b")], Vec::new(), Vec::new()));
    let mut h = harness(fixtures);
    h.processes.missing_executable(Side::Client);

    let outcome = h.orchestrator.run().await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.summary.cases.len(), 2);
    assert!(outcome.summary.cases.iter().all(|case| !case.passed));
    assert!(outcome.summary.cases[0].reasons[0].contains("executable not found"));
}
