use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraderError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("process launch error: {0}")]
    ProcessLaunch(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("fixture error: {0}")]
    Fixture(String),
    #[error("report error: {0}")]
    Report(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("run cancelled")]
    Cancelled,
}
