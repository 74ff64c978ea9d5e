use crate::errors::GraderError;
use crate::types::{RelayMode, Side};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub mod scripted;

pub use scripted::{FakeCallLog, FakeProcessControl, FakeRelay, ScriptedReaction};

/// Output observed on a managed process, delivered over the supervisor's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Line { side: Side, text: String },
    Exited { side: Side, code: Option<i32> },
}

impl ProcessEvent {
    pub fn side(&self) -> Side {
        match self {
            Self::Line { side, .. } | Self::Exited { side, .. } => *side,
        }
    }

    /// The text recorded as console output for this event.
    pub fn console_text(&self) -> String {
        match self {
            Self::Line { text, .. } => text.clone(),
            Self::Exited { side, .. } => format!("[{}] exited.", side.label()),
        }
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, GraderError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn stdout_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), GraderError>;
    fn draw(&self, frame: &str) -> Result<(), GraderError>;
}

/// Lifecycle control over the client and server executables.
#[allow(async_fn_in_trait)]
pub trait ProcessControl {
    fn configure(&mut self, side: Side, executable: &Path) -> Result<(), GraderError>;
    async fn start(&mut self, side: Side) -> Result<(), GraderError>;
    fn is_running(&mut self, side: Side) -> bool;
    async fn send_input(&mut self, side: Side, text: &str) -> Result<(), GraderError>;
    /// Closes input, waits out the grace period, then kills what is left.
    async fn stop(&mut self, side: Side) -> Result<(), GraderError>;
    /// Kills the process tree immediately.
    async fn hard_stop(&mut self, side: Side) -> Result<(), GraderError>;
    async fn stop_all(&mut self) -> Result<(), GraderError>;
    /// Console lines and exit notices produced since the previous drain.
    fn drain_events(&mut self) -> Vec<ProcessEvent>;
}

#[allow(async_fn_in_trait)]
pub trait RelayControl {
    /// No-op when already listening.
    async fn start(&mut self, mode: RelayMode) -> Result<(), GraderError>;
    /// Safe to call when not started.
    async fn stop(&mut self);
    fn is_listening(&self) -> bool;
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, GraderError> {
        std::fs::read_to_string(path).map_err(|e| GraderError::Io(format!("{}: {e}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdout_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdout())
    }

    fn write_line(&self, line: &str) -> Result<(), GraderError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| GraderError::Io(e.to_string()))
    }

    fn draw(&self, frame: &str) -> Result<(), GraderError> {
        self.write_line(frame)
    }
}

pub struct ProductionRuntime {
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, GraderError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| GraderError::Io(format!("missing file {}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
    draws: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn drawn_frames(&self) -> Vec<String> {
        self.draws.lock().expect("draw lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdout_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), GraderError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn draw(&self, frame: &str) -> Result<(), GraderError> {
        self.draws
            .lock()
            .expect("draw lock")
            .push(frame.to_string());
        Ok(())
    }
}
