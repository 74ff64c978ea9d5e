//! Loads suites and cases from a directory of TOML files.
//!
//! ```toml
//! # suite.toml
//! protocol = "HTTP"
//! [[cases]]
//! name = "login"
//! mark = 2.5
//!
//! # login/case.toml
//! [[steps]]
//! stage = 1
//! action = "client input"
//! input = "1"
//! data_type = "String"
//!
//! [[client]]
//! stage = 1
//! status_code = 200
//! payload = '{"ok":true}'
//! data_type = "JSON"
//! ```

use crate::errors::GraderError;
use crate::types::{
    CaseDefinition, Expectation, Protocol, StageAction, StageActionKind, TestCase, TestSuite,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SUITE_FILE: &str = "suite.toml";
pub const CASE_FILE: &str = "case.toml";

pub trait FixtureStore: Send + Sync {
    fn load_suite(&self) -> Result<TestSuite, GraderError>;
    fn load_case(&self, suite: &TestSuite, case: &CaseDefinition) -> Result<TestCase, GraderError>;
}

#[derive(Debug, Deserialize)]
struct SuiteFile {
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    cases: Vec<CaseDefinition>,
}

#[derive(Debug, Deserialize)]
struct CaseFile {
    #[serde(default)]
    steps: Vec<StepRow>,
    #[serde(default)]
    client: Vec<ExpectationRow>,
    #[serde(default)]
    server: Vec<ExpectationRow>,
}

#[derive(Debug, Deserialize)]
struct StepRow {
    stage: u32,
    #[serde(default)]
    action: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    data_type: String,
}

/// Authors write status codes both as `200` and `"200"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusField {
    Number(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct ExpectationRow {
    stage: u32,
    #[serde(default)]
    method: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    byte_size: u64,
    #[serde(default)]
    status_code: Option<StatusField>,
    #[serde(default)]
    data_type: String,
    #[serde(default)]
    console_output: String,
}

impl ExpectationRow {
    fn into_expectation(self) -> Expectation {
        Expectation {
            stage: self.stage,
            method: self.method,
            payload: self.payload,
            byte_size: self.byte_size,
            status_code: self.status_code.map(|status| match status {
                StatusField::Number(code) => code.to_string(),
                StatusField::Text(code) => code,
            }),
            data_type: self.data_type,
            console_output: self.console_output,
        }
    }
}

pub struct DirectoryFixtureStore {
    suite_path: PathBuf,
}

impl DirectoryFixtureStore {
    /// `suite_path` is either the header file or the directory holding it.
    pub fn new(suite_path: impl Into<PathBuf>) -> Self {
        Self {
            suite_path: suite_path.into(),
        }
    }

    fn resolve_header(&self) -> Result<(PathBuf, PathBuf), GraderError> {
        if self.suite_path.is_file() {
            let root = self
                .suite_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            return Ok((root, self.suite_path.clone()));
        }
        if !self.suite_path.is_dir() {
            return Err(GraderError::Fixture(format!(
                "suite not found: {}",
                self.suite_path.display()
            )));
        }
        let header = find_toml(&self.suite_path, SUITE_FILE, "header")?.ok_or_else(|| {
            GraderError::Fixture(format!(
                "no {SUITE_FILE} or *header*.toml in {}",
                self.suite_path.display()
            ))
        })?;
        Ok((self.suite_path.clone(), header))
    }
}

/// Prefers the exact file name, then the first `.toml` (sorted) whose name
/// contains `marker`.
fn find_toml(dir: &Path, exact: &str, marker: &str) -> Result<Option<PathBuf>, GraderError> {
    let direct = dir.join(exact);
    if direct.is_file() {
        return Ok(Some(direct));
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| GraderError::Fixture(format!("{}: {e}", dir.display())))?;
    let mut candidates = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "toml")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.to_ascii_lowercase().contains(marker))
        })
        .collect::<Vec<_>>();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, GraderError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| GraderError::Fixture(format!("{}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| GraderError::Fixture(format!("{}: {e}", path.display())))
}

fn parse_actions(steps: Vec<StepRow>, case: &str) -> Result<Vec<StageAction>, GraderError> {
    let mut actions = Vec::new();
    for step in steps {
        if step.action.trim().is_empty() {
            continue;
        }
        let kind = StageActionKind::parse(&step.action).ok_or_else(|| {
            GraderError::Fixture(format!(
                "case {case}: stage {} has unknown action '{}'",
                step.stage, step.action
            ))
        })?;
        if step.stage == 0 {
            return Err(GraderError::Fixture(format!(
                "case {case}: stage numbers start at 1"
            )));
        }
        if let Some(previous) = actions.last().map(|action: &StageAction| action.stage) {
            if step.stage <= previous {
                return Err(GraderError::Fixture(format!(
                    "case {case}: stage {} follows stage {previous}",
                    step.stage
                )));
            }
        }
        actions.push(StageAction {
            stage: step.stage,
            kind,
            payload: step.input,
            declared_type: step.data_type,
        });
    }
    Ok(actions)
}

fn index_expectations(
    rows: Vec<ExpectationRow>,
    case: &str,
    table: &str,
) -> Result<BTreeMap<u32, Expectation>, GraderError> {
    let mut indexed = BTreeMap::new();
    for row in rows {
        let stage = row.stage;
        if indexed.insert(stage, row.into_expectation()).is_some() {
            return Err(GraderError::Fixture(format!(
                "case {case}: {table} table repeats stage {stage}"
            )));
        }
    }
    Ok(indexed)
}

impl FixtureStore for DirectoryFixtureStore {
    fn load_suite(&self) -> Result<TestSuite, GraderError> {
        let (root, header) = self.resolve_header()?;
        let file: SuiteFile = read_toml(&header)?;
        if file.cases.is_empty() {
            return Err(GraderError::Fixture(format!(
                "{} lists no cases",
                header.display()
            )));
        }
        Ok(TestSuite {
            protocol: Protocol::parse(file.protocol.as_deref().unwrap_or("HTTP")),
            cases: file.cases,
            root,
        })
    }

    fn load_case(&self, suite: &TestSuite, case: &CaseDefinition) -> Result<TestCase, GraderError> {
        let dir = suite.root.join(&case.name);
        if !dir.is_dir() {
            return Err(GraderError::Fixture(format!(
                "case directory not found: {}",
                dir.display()
            )));
        }
        let path = find_toml(&dir, CASE_FILE, "detail")?.ok_or_else(|| {
            GraderError::Fixture(format!(
                "no {CASE_FILE} or *detail*.toml in {}",
                dir.display()
            ))
        })?;
        let file: CaseFile = read_toml(&path)?;
        Ok(TestCase {
            name: case.name.clone(),
            mark: case.mark,
            actions: parse_actions(file.steps, &case.name)?,
            expected_client: index_expectations(file.client, &case.name, "client")?,
            expected_server: index_expectations(file.server, &case.name, "server")?,
        })
    }
}

/// Serves pre-built cases.
#[derive(Debug, Clone)]
pub struct MemoryFixtureStore {
    protocol: Protocol,
    cases: Vec<TestCase>,
}

impl MemoryFixtureStore {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            cases: Vec::new(),
        }
    }

    pub fn with_case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }
}

impl FixtureStore for MemoryFixtureStore {
    fn load_suite(&self) -> Result<TestSuite, GraderError> {
        if self.cases.is_empty() {
            return Err(GraderError::Fixture("suite lists no cases".to_string()));
        }
        Ok(TestSuite {
            protocol: self.protocol,
            cases: self
                .cases
                .iter()
                .map(|case| CaseDefinition {
                    name: case.name.clone(),
                    mark: case.mark,
                })
                .collect(),
            root: PathBuf::new(),
        })
    }

    fn load_case(&self, _suite: &TestSuite, case: &CaseDefinition) -> Result<TestCase, GraderError> {
        self.cases
            .iter()
            .find(|candidate| candidate.name == case.name)
            .cloned()
            .ok_or_else(|| GraderError::Fixture(format!("unknown case {}", case.name)))
    }
}
