//! Per-case result files and the suite summary.

use crate::errors::GraderError;
use crate::logging::append_run_log;
use crate::types::{CapturedExchange, Side};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PENDING: &str = "Pending";
pub const PASS: &str = "PASS";
pub const CASE_RESULT_FILE: &str = "graderesult.json";
pub const CAPTURES_FILE: &str = "captures.jsonl";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const FAILED_CASE_SUFFIX: &str = "FailedCase";

const LARGE_PAYLOAD_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub step: u32,
    pub description: String,
    /// `Pending`, `PASS`, or the stage's issues joined by newlines.
    pub result: String,
}

impl StageResult {
    pub fn pending(step: u32, description: impl Into<String>) -> Self {
        Self {
            step,
            description: description.into(),
            result: PENDING.to_string(),
        }
    }

    pub fn settle(&mut self, issues: &[String]) {
        self.result = if issues.is_empty() {
            PASS.to_string()
        } else {
            issues.join("\n")
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case: String,
    pub mark: f64,
    pub passed: bool,
    /// Set when the case errored and this is whatever was gathered so far.
    pub partial: bool,
    pub steps: Vec<StageResult>,
    pub captured_client: Vec<CapturedExchange>,
    pub captured_server: Vec<CapturedExchange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub name: String,
    pub mark: f64,
    pub passed: bool,
    pub result_file: Option<PathBuf>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub cases: Vec<CaseSummary>,
}

impl SuiteSummary {
    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|case| case.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.cases.len() - self.passed_count()
    }

    pub fn earned_mark(&self) -> f64 {
        self.cases
            .iter()
            .filter(|case| case.passed)
            .map(|case| case.mark)
            .sum()
    }

    pub fn total_mark(&self) -> f64 {
        self.cases.iter().map(|case| case.mark).sum()
    }

    pub fn all_passed(&self) -> bool {
        self.cases.iter().all(|case| case.passed)
    }
}

pub fn render_summary(summary: &SuiteSummary) -> String {
    let mut lines = vec![
        "Test Case Summary".to_string(),
        "=".repeat(18),
        String::new(),
    ];
    for case in &summary.cases {
        let status = if case.passed { PASS } else { "FAIL" };
        lines.push(format!("{} - {status} (Mark: {})", case.name, case.mark));
        let file = case
            .result_file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "(not exported)".to_string());
        lines.push(format!("Result File: {file}"));
        if !case.passed {
            for reason in &case.reasons {
                lines.push(format!("  - {reason}"));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

pub trait ReportSink: Send + Sync {
    /// Returns where the case report was written.
    fn write_case(&self, report: &CaseReport) -> Result<PathBuf, GraderError>;
    fn write_summary(&self, summary: &SuiteSummary) -> Result<PathBuf, GraderError>;
}

/// One line of `captures.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEntry {
    Exchange(CaptureLine),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureLine {
    pub side: Side,
    pub stage: u32,
    pub method: String,
    /// Full payload, or `<hash:sha256:...>` above 64 KiB.
    pub payload: String,
    #[serde(default)]
    pub payload_truncated: bool,
    pub byte_size: u64,
    pub status_code: Option<String>,
    pub data_type: String,
    pub console_output: String,
}

impl CaptureLine {
    pub fn from_exchange(side: Side, exchange: &CapturedExchange) -> Self {
        let (payload, payload_truncated) = if exchange.payload.len() > LARGE_PAYLOAD_THRESHOLD {
            use sha2::{Digest, Sha256};
            let hash = Sha256::digest(exchange.payload.as_bytes());
            (format!("<hash:sha256:{}>", hex_bytes(&hash[..8])), true)
        } else {
            (exchange.payload.clone(), false)
        };
        Self {
            side,
            stage: exchange.stage,
            method: exchange.method.clone(),
            payload,
            payload_truncated,
            byte_size: exchange.byte_size,
            status_code: exchange.status_code.clone(),
            data_type: exchange.data_type.clone(),
            console_output: exchange.console_output.clone(),
        }
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Keeps the directory name portable.
fn sanitize_case_name(name: &str) -> String {
    let cleaned = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.is_empty() {
        "case".to_string()
    } else {
        cleaned
    }
}

/// Writes everything for one run under `<base>/GradeResults_<unix-seconds>/`.
pub struct FileReportSink {
    run_dir: PathBuf,
}

impl FileReportSink {
    pub fn new(base_dir: &Path) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        Self::at(base_dir.join(format!("GradeResults_{stamp}")))
    }

    pub fn at(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn write(path: &Path, contents: &str) -> Result<(), GraderError> {
        std::fs::write(path, contents)
            .map_err(|e| GraderError::Report(format!("{}: {e}", path.display())))
    }
}

impl ReportSink for FileReportSink {
    fn write_case(&self, report: &CaseReport) -> Result<PathBuf, GraderError> {
        let mut dir_name = sanitize_case_name(&report.case);
        if report.partial {
            dir_name.push('_');
            dir_name.push_str(FAILED_CASE_SUFFIX);
        }
        let case_dir = self.run_dir.join(dir_name);
        std::fs::create_dir_all(&case_dir)
            .map_err(|e| GraderError::Report(format!("{}: {e}", case_dir.display())))?;

        let result_path = case_dir.join(CASE_RESULT_FILE);
        let body = serde_json::to_string_pretty(report)
            .map_err(|e| GraderError::Report(e.to_string()))?;
        Self::write(&result_path, &body)?;

        let mut captures = String::new();
        let tables = [
            (Side::Client, &report.captured_client),
            (Side::Server, &report.captured_server),
        ];
        for (side, records) in tables {
            for exchange in records {
                let entry = CaptureEntry::Exchange(CaptureLine::from_exchange(side, exchange));
                let line =
                    serde_json::to_string(&entry).map_err(|e| GraderError::Report(e.to_string()))?;
                captures.push_str(&line);
                captures.push('\n');
            }
        }
        Self::write(&case_dir.join(CAPTURES_FILE), &captures)?;

        append_run_log(
            "info",
            "report.case.written",
            json!({
                "case": report.case,
                "passed": report.passed,
                "partial": report.partial,
                "path": result_path.display().to_string(),
            }),
        );
        Ok(result_path)
    }

    fn write_summary(&self, summary: &SuiteSummary) -> Result<PathBuf, GraderError> {
        std::fs::create_dir_all(&self.run_dir)
            .map_err(|e| GraderError::Report(format!("{}: {e}", self.run_dir.display())))?;
        let path = self.run_dir.join(SUMMARY_FILE);
        Self::write(&path, &render_summary(summary))?;
        append_run_log(
            "info",
            "report.summary.written",
            json!({ "path": path.display().to_string(), "cases": summary.cases.len() }),
        );
        Ok(path)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryReportSink {
    cases: Arc<Mutex<Vec<CaseReport>>>,
    summaries: Arc<Mutex<Vec<SuiteSummary>>>,
}

impl MemoryReportSink {
    pub fn cases(&self) -> Vec<CaseReport> {
        self.cases.lock().expect("cases lock").clone()
    }

    pub fn summaries(&self) -> Vec<SuiteSummary> {
        self.summaries.lock().expect("summaries lock").clone()
    }
}

impl ReportSink for MemoryReportSink {
    fn write_case(&self, report: &CaseReport) -> Result<PathBuf, GraderError> {
        self.cases
            .lock()
            .expect("cases lock")
            .push(report.clone());
        Ok(PathBuf::from(format!("memory://{}", report.case)))
    }

    fn write_summary(&self, summary: &SuiteSummary) -> Result<PathBuf, GraderError> {
        self.summaries
            .lock()
            .expect("summaries lock")
            .push(summary.clone());
        Ok(PathBuf::from("memory://summary"))
    }
}
