use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Which managed process a record or action belongs to. For traffic the client
/// side holds what the server sent back, the server side holds what the client
/// sent out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Client => "Client",
            Self::Server => "Server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

impl Protocol {
    /// Anything other than `TCP` selects HTTP.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("tcp") {
            Self::Tcp
        } else {
            Self::Http
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Tcp => "TCP",
        }
    }

    pub fn relay_mode(self) -> RelayMode {
        match self {
            Self::Http => RelayMode::Message,
            Self::Tcp => RelayMode::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Message,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageActionKind {
    ClientInput,
    ClientStart,
    ClientClose,
    ServerStart,
    ServerClose,
    Noop,
}

impl StageActionKind {
    /// Accepts the spellings fixture authors use: `client input`, `ClientClose`,
    /// `server_start`, `wait`.
    pub fn parse(value: &str) -> Option<Self> {
        let key = value
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "clientinput" | "input" => Some(Self::ClientInput),
            "clientstart" => Some(Self::ClientStart),
            "clientclose" | "clientstop" => Some(Self::ClientClose),
            "serverstart" => Some(Self::ServerStart),
            "serverclose" | "serverstop" => Some(Self::ServerClose),
            "noop" | "none" | "wait" => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientInput => "client input",
            Self::ClientStart => "client start",
            Self::ClientClose => "client close",
            Self::ServerStart => "server start",
            Self::ServerClose => "server close",
            Self::Noop => "noop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAction {
    pub stage: u32,
    pub kind: StageActionKind,
    pub payload: String,
    pub declared_type: String,
}

impl StageAction {
    pub fn describe(&self) -> String {
        let mut parts = vec![self.kind.as_str().to_string()];
        if !self.payload.trim().is_empty() {
            parts.push(format!("Input: {}", self.payload.trim()));
        }
        if !self.declared_type.trim().is_empty() {
            parts.push(format!("Type: {}", self.declared_type.trim()));
        }
        parts.join(" | ")
    }
}

/// One stage-and-side record. Captures and expectations share the shape; on an
/// expectation every empty or zero field is unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub stage: u32,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub byte_size: u64,
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub console_output: String,
}

pub type CapturedExchange = ExchangeRecord;
pub type Expectation = ExchangeRecord;

impl ExchangeRecord {
    pub fn new(stage: u32) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    /// Status codes of `""` and `"0"` are both treated as absent.
    pub fn constrained_status(&self) -> Option<&str> {
        self.status_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty() && *code != "0")
    }

    pub fn is_meaningful(&self) -> bool {
        !self.method.trim().is_empty()
            || !self.payload.trim().is_empty()
            || !self.console_output.trim().is_empty()
            || !self.data_type.trim().is_empty()
            || self.byte_size != 0
            || self.constrained_status().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub name: String,
    pub mark: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub mark: f64,
    pub actions: Vec<StageAction>,
    pub expected_client: BTreeMap<u32, Expectation>,
    pub expected_server: BTreeMap<u32, Expectation>,
}

impl TestCase {
    pub fn expectation(&self, side: Side, stage: u32) -> Option<&Expectation> {
        match side {
            Side::Client => self.expected_client.get(&stage),
            Side::Server => self.expected_server.get(&stage),
        }
    }

    /// Lowest stage number carrying a meaningful expectation on either side.
    pub fn first_meaningful_stage(&self) -> Option<u32> {
        self.expected_client
            .values()
            .chain(self.expected_server.values())
            .filter(|expectation| expectation.is_meaningful())
            .map(|expectation| expectation.stage)
            .min()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestSuite {
    pub protocol: Protocol,
    pub cases: Vec<CaseDefinition>,
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub stage: u32,
    pub passed: bool,
    pub issues: Vec<String>,
}

impl Verdict {
    pub fn from_issues(stage: u32, issues: Vec<String>) -> Self {
        Self {
            stage,
            passed: issues.is_empty(),
            issues,
        }
    }
}
