use crate::errors::GraderError;
use crate::relay::RelaySettings;
use crate::runtime::FileSystem;
use crate::supervisor::SupervisorSettings;
use crate::types::Protocol;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub client: Option<PathBuf>,
    pub server: Option<PathBuf>,
    pub suite: Option<PathBuf>,
    pub protocol: Option<Protocol>,
    pub results_dir: Option<PathBuf>,
    pub ignore_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraderConfig {
    pub executables: ExecutablesConfig,
    pub suite: SuiteConfig,
    pub relay: RelayConfig,
    pub timing: TimingConfig,
    pub grading: GradingConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutablesConfig {
    pub client: Option<PathBuf>,
    pub server: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteConfig {
    pub path: Option<PathBuf>,
    /// Overrides the protocol the suite declares.
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub forward_timeout_ms: u64,
    pub connect_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    pub stage_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub startup_wait_ms: u64,
    pub debounce_ms: u64,
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GradingConfig {
    pub ignore_file: Option<PathBuf>,
    pub results_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub settings_path: Option<PathBuf>,
    pub connection_key: String,
    pub script_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: String,
    pub budget_bytes: u64,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            executables: ExecutablesConfig::default(),
            suite: SuiteConfig::default(),
            relay: RelayConfig {
                listen_addr: "127.0.0.1:5000".to_string(),
                upstream_addr: "127.0.0.1:5001".to_string(),
                forward_timeout_ms: 10_000,
                connect_retry_ms: 2_000,
            },
            timing: TimingConfig {
                stage_timeout_ms: 10_000,
                poll_interval_ms: 200,
                startup_wait_ms: 2_000,
                debounce_ms: 100,
                grace_period_ms: 2_000,
            },
            grading: GradingConfig::default(),
            database: DatabaseConfig {
                settings_path: None,
                connection_key: "MyCnn".to_string(),
                script_path: None,
            },
            logging: LoggingConfig {
                path: ".cache/grader/run.jsonl".to_string(),
                budget_bytes: 50 * 1024 * 1024,
            },
        }
    }
}

impl GraderConfig {
    pub fn relay_settings(&self) -> Result<RelaySettings, GraderError> {
        Ok(RelaySettings {
            listen_addr: parse_addr("relay.listen_addr", &self.relay.listen_addr)?,
            upstream_addr: parse_addr("relay.upstream_addr", &self.relay.upstream_addr)?,
            forward_timeout: Duration::from_millis(self.relay.forward_timeout_ms),
            connect_retry: Duration::from_millis(self.relay.connect_retry_ms),
        })
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            grace_period: Duration::from_millis(self.timing.grace_period_ms),
            debounce: Duration::from_millis(self.timing.debounce_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialGraderConfig {
    executables: Option<PartialExecutablesConfig>,
    suite: Option<PartialSuiteConfig>,
    relay: Option<PartialRelayConfig>,
    timing: Option<PartialTimingConfig>,
    grading: Option<PartialGradingConfig>,
    database: Option<PartialDatabaseConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialExecutablesConfig {
    client: Option<PathBuf>,
    server: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSuiteConfig {
    path: Option<PathBuf>,
    protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRelayConfig {
    listen_addr: Option<String>,
    upstream_addr: Option<String>,
    forward_timeout_ms: Option<u64>,
    connect_retry_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTimingConfig {
    stage_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    startup_wait_ms: Option<u64>,
    debounce_ms: Option<u64>,
    grace_period_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialGradingConfig {
    ignore_file: Option<PathBuf>,
    results_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialDatabaseConfig {
    settings_path: Option<PathBuf>,
    connection_key: Option<String>,
    script_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<String>,
    budget_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<GraderConfig, GraderError> {
    let mut cfg = GraderConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        let partial: PartialGraderConfig = toml::from_str(&file_contents)
            .map_err(|e| GraderError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    absolutize_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn parse_protocol(value: &str) -> Result<Protocol, GraderError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "http" => Ok(Protocol::Http),
        "tcp" => Ok(Protocol::Tcp),
        other => Err(GraderError::InvalidConfig(format!(
            "suite.protocol must be http or tcp, got '{other}'"
        ))),
    }
}

fn merge_partial_config(cfg: &mut GraderConfig, partial: PartialGraderConfig) -> Result<(), GraderError> {
    if let Some(executables) = partial.executables {
        if let Some(client) = executables.client {
            cfg.executables.client = Some(client);
        }
        if let Some(server) = executables.server {
            cfg.executables.server = Some(server);
        }
    }

    if let Some(suite) = partial.suite {
        if let Some(path) = suite.path {
            cfg.suite.path = Some(path);
        }
        if let Some(protocol) = suite.protocol {
            cfg.suite.protocol = Some(parse_protocol(&protocol)?);
        }
    }

    if let Some(relay) = partial.relay {
        if let Some(value) = relay.listen_addr {
            cfg.relay.listen_addr = value;
        }
        if let Some(value) = relay.upstream_addr {
            cfg.relay.upstream_addr = value;
        }
        if let Some(value) = relay.forward_timeout_ms {
            cfg.relay.forward_timeout_ms = value;
        }
        if let Some(value) = relay.connect_retry_ms {
            cfg.relay.connect_retry_ms = value;
        }
    }

    if let Some(timing) = partial.timing {
        if let Some(value) = timing.stage_timeout_ms {
            cfg.timing.stage_timeout_ms = value;
        }
        if let Some(value) = timing.poll_interval_ms {
            cfg.timing.poll_interval_ms = value;
        }
        if let Some(value) = timing.startup_wait_ms {
            cfg.timing.startup_wait_ms = value;
        }
        if let Some(value) = timing.debounce_ms {
            cfg.timing.debounce_ms = value;
        }
        if let Some(value) = timing.grace_period_ms {
            cfg.timing.grace_period_ms = value;
        }
    }

    if let Some(grading) = partial.grading {
        if let Some(value) = grading.ignore_file {
            cfg.grading.ignore_file = Some(value);
        }
        if let Some(value) = grading.results_dir {
            cfg.grading.results_dir = Some(value);
        }
    }

    if let Some(database) = partial.database {
        if let Some(value) = database.settings_path {
            cfg.database.settings_path = Some(value);
        }
        if let Some(value) = database.connection_key {
            cfg.database.connection_key = value;
        }
        if let Some(value) = database.script_path {
            cfg.database.script_path = Some(value);
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
    Ok(())
}

fn apply_cli_overrides(cfg: &mut GraderConfig, overrides: &CliOverrides) {
    if let Some(client) = &overrides.client {
        cfg.executables.client = Some(client.clone());
    }
    if let Some(server) = &overrides.server {
        cfg.executables.server = Some(server.clone());
    }
    if let Some(suite) = &overrides.suite {
        cfg.suite.path = Some(suite.clone());
    }
    if let Some(protocol) = overrides.protocol {
        cfg.suite.protocol = Some(protocol);
    }
    if let Some(results_dir) = &overrides.results_dir {
        cfg.grading.results_dir = Some(results_dir.clone());
    }
    if let Some(ignore_file) = &overrides.ignore_file {
        cfg.grading.ignore_file = Some(ignore_file.clone());
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn absolutize_paths(cfg: &mut GraderConfig, base: &Path) {
    let slots = [
        &mut cfg.executables.client,
        &mut cfg.executables.server,
        &mut cfg.suite.path,
        &mut cfg.grading.ignore_file,
        &mut cfg.grading.results_dir,
        &mut cfg.database.settings_path,
        &mut cfg.database.script_path,
    ];
    for slot in slots {
        if let Some(path) = slot.as_mut() {
            *path = absolutize_path(base, path);
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, GraderError> {
    value
        .trim()
        .parse()
        .map_err(|_| GraderError::InvalidConfig(format!("{field} is not a socket address: '{value}'")))
}

fn validate_config(cfg: &GraderConfig) -> Result<(), GraderError> {
    let durations = [
        ("relay.forward_timeout_ms", cfg.relay.forward_timeout_ms),
        ("timing.stage_timeout_ms", cfg.timing.stage_timeout_ms),
        ("timing.poll_interval_ms", cfg.timing.poll_interval_ms),
        ("timing.debounce_ms", cfg.timing.debounce_ms),
        ("timing.grace_period_ms", cfg.timing.grace_period_ms),
    ];
    for (field, value) in durations {
        if value == 0 {
            return Err(GraderError::InvalidConfig(format!(
                "{field} must be greater than zero"
            )));
        }
    }
    cfg.relay_settings()?;
    if cfg.database.connection_key.trim().is_empty() {
        return Err(GraderError::InvalidConfig(
            "database.connection_key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Paths a run cannot start without, checked before any case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInputs {
    pub client: PathBuf,
    pub server: PathBuf,
    pub suite: PathBuf,
}

pub fn require_run_inputs(cfg: &GraderConfig, fs: &dyn FileSystem) -> Result<RunInputs, GraderError> {
    let required = |label: &str, value: &Option<PathBuf>| -> Result<PathBuf, GraderError> {
        let path = value
            .clone()
            .ok_or_else(|| GraderError::Configuration(format!("{label} path is not set")))?;
        if !fs.exists(&path) {
            return Err(GraderError::Configuration(format!(
                "{label} path does not exist: {}",
                path.display()
            )));
        }
        Ok(path)
    };
    Ok(RunInputs {
        client: required("client executable", &cfg.executables.client)?,
        server: required("server executable", &cfg.executables.server)?,
        suite: required("suite", &cfg.suite.path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn defaults_match_relay_and_timing_constants() {
        let cfg = GraderConfig::default();
        let relay = cfg.relay_settings().expect("relay");
        assert_eq!(relay.listen_addr.port(), 5000);
        assert_eq!(relay.upstream_addr.port(), 5001);
        assert_eq!(cfg.timing.stage_timeout_ms, 10_000);
        assert_eq!(cfg.timing.poll_interval_ms, 200);
        assert_eq!(cfg.supervisor_settings().debounce, Duration::from_millis(100));
    }

    #[test]
    fn file_values_merge_and_cli_wins() {
        let fs = FakeFileSystem::with_file(
            "/work/grader.toml",
            r#"
[executables]
client = "bin/client"
server = "bin/server"

[suite]
path = "suite"
protocol = "TCP"

[timing]
stage_timeout_ms = 500
"#,
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/work/grader.toml")),
            server: Some(PathBuf::from("/opt/server")),
            protocol: Some(Protocol::Http),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/work"), &fs).expect("config");
        assert_eq!(cfg.executables.client, Some(PathBuf::from("/work/bin/client")));
        assert_eq!(cfg.executables.server, Some(PathBuf::from("/opt/server")));
        assert_eq!(cfg.suite.protocol, Some(Protocol::Http));
        assert_eq!(cfg.timing.stage_timeout_ms, 500);
        assert_eq!(cfg.timing.poll_interval_ms, 200);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let fs = FakeFileSystem::with_file("/c.toml", "[timing]\npoll_interval_ms = 0\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/c.toml")),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, Path::new("/"), &fs).expect_err("zero");
        assert!(matches!(err, GraderError::InvalidConfig(_)));

        let fs = FakeFileSystem::with_file("/c.toml", "[relay]\nlisten_addr = \"nowhere\"\n");
        let err = load_config(&overrides, Path::new("/"), &fs).expect_err("addr");
        assert!(matches!(err, GraderError::InvalidConfig(message) if message.contains("relay.listen_addr")));

        let fs = FakeFileSystem::with_file("/c.toml", "[suite]\nprotocol = \"udp\"\n");
        assert!(load_config(&overrides, Path::new("/"), &fs).is_err());

        let fs = FakeFileSystem::with_file("/c.toml", "[timing\n");
        let err = load_config(&overrides, Path::new("/"), &fs).expect_err("parse");
        assert!(matches!(err, GraderError::ConfigParse(_)));
    }

    #[test]
    fn run_inputs_must_exist() {
        let fs = FakeFileSystem::with_file("/bin/client", "");
        let mut cfg = GraderConfig::default();
        cfg.executables.client = Some(PathBuf::from("/bin/client"));
        cfg.executables.server = Some(PathBuf::from("/bin/server"));
        let err = require_run_inputs(&cfg, &fs).expect_err("server missing");
        assert!(matches!(err, GraderError::Configuration(message) if message.contains("server executable")));

        cfg.executables.server = None;
        let err = require_run_inputs(&cfg, &fs).expect_err("server unset");
        assert!(matches!(err, GraderError::Configuration(message) if message.contains("not set")));

        fs.add_file("/bin/server", "");
        fs.add_file("/suite", "");
        cfg.executables.server = Some(PathBuf::from("/bin/server"));
        cfg.suite.path = Some(PathBuf::from("/suite"));
        let inputs = require_run_inputs(&cfg, &fs).expect("inputs");
        assert_eq!(inputs.suite, PathBuf::from("/suite"));
    }
}
