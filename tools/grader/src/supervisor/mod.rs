pub mod tokenizer;

use crate::errors::GraderError;
use crate::logging::append_run_log;
use crate::runtime::{ProcessControl, ProcessEvent};
use crate::types::Side;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokenizer::{LineTokenizer, StreamKind};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// How long a reaped process's readers may keep draining pipes held open by
/// orphaned grandchildren.
const READER_DRAIN: Duration = Duration::from_millis(500);
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub grace_period: Duration,
    pub debounce: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            debounce: Duration::from_millis(100),
        }
    }
}

struct RunningProcess {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
}

impl RunningProcess {
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

struct ManagedProcess {
    executable: PathBuf,
    running: Option<RunningProcess>,
}

/// Owns the client and server executables for one run.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    slots: BTreeMap<Side, ManagedProcess>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    events_rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            slots: BTreeMap::new(),
            events_tx,
            events_rx,
        }
    }

    fn take_running(&mut self, side: Side) -> Option<RunningProcess> {
        self.slots
            .get_mut(&side)
            .and_then(|slot| slot.running.take())
    }

    fn spawn(&self, side: Side, executable: &Path) -> Result<RunningProcess, GraderError> {
        let mut command = Command::new(executable);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = executable.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            GraderError::ProcessLaunch(format!("{}: {e}", executable.display()))
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tokenizer = LineTokenizer::new(
                side,
                StreamKind::Stdout,
                self.settings.debounce,
                self.events_tx.clone(),
            );
            readers.push(tokio::spawn(tokenizer.run(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tokenizer = LineTokenizer::new(
                side,
                StreamKind::Stderr,
                self.settings.debounce,
                self.events_tx.clone(),
            );
            readers.push(tokio::spawn(tokenizer.run(stderr)));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let monitor = tokio::spawn(monitor_child(
            side,
            child,
            kill_rx,
            readers,
            Arc::clone(&exited),
            self.events_tx.clone(),
        ));

        append_run_log(
            "info",
            "process.started",
            json!({
                "side": side.as_str(),
                "executable": executable.display().to_string(),
                "pid": pid,
            }),
        );

        Ok(RunningProcess {
            pid,
            stdin,
            kill: Some(kill_tx),
            exited,
            monitor,
        })
    }
}

async fn monitor_child(
    side: Side,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    exited: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };
    let _ = tokio::time::timeout(READER_DRAIN, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;

    exited.store(true, Ordering::SeqCst);
    let code = status.and_then(|status| status.code());
    append_run_log(
        "info",
        "process.exited",
        json!({ "side": side.as_str(), "code": code }),
    );
    let _ = events.send(ProcessEvent::Exited { side, code });
}

/// Kills the whole tree rooted at `pid`, including anything the process spawned.
async fn kill_tree(pid: u32) {
    #[cfg(unix)]
    let mut command = {
        let mut command = Command::new("kill");
        command.arg("-9").arg(format!("-{pid}"));
        command
    };
    #[cfg(windows)]
    let mut command = {
        let mut command = Command::new("taskkill");
        command.args(["/F", "/T", "/PID", &pid.to_string()]);
        command
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match tokio::time::timeout(KILL_WAIT, command.status()).await {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => append_run_log(
            "warn",
            "process.kill_tree.failed",
            json!({ "pid": pid, "error": error.to_string() }),
        ),
        Err(_) => append_run_log("warn", "process.kill_tree.timeout", json!({ "pid": pid })),
    }
}

async fn force_kill(side: Side, mut running: RunningProcess) {
    if let Some(pid) = running.pid {
        kill_tree(pid).await;
    }
    if let Some(kill) = running.kill.take() {
        let _ = kill.send(());
    }
    if tokio::time::timeout(KILL_WAIT, &mut running.monitor).await.is_err() {
        append_run_log(
            "error",
            "process.stop.unresponsive",
            json!({ "side": side.as_str(), "pid": running.pid }),
        );
        running.monitor.abort();
    }
}

async fn graceful_stop(side: Side, mut running: RunningProcess, grace: Duration) {
    drop(running.stdin.take());
    if running.has_exited() {
        let _ = (&mut running.monitor).await;
        return;
    }
    let finished = tokio::time::timeout(grace, &mut running.monitor).await.is_ok();
    if !finished {
        append_run_log(
            "warn",
            "process.stop.grace_expired",
            json!({ "side": side.as_str(), "grace_ms": grace.as_millis() as u64 }),
        );
        force_kill(side, running).await;
    }
}

async fn stop_slot(side: Side, running: Option<RunningProcess>, grace: Duration) {
    if let Some(running) = running {
        graceful_stop(side, running, grace).await;
    }
}

impl ProcessControl for ProcessSupervisor {
    fn configure(&mut self, side: Side, executable: &Path) -> Result<(), GraderError> {
        if !executable.is_file() {
            return Err(GraderError::NotFound(format!(
                "{} executable not found: {}",
                side.as_str(),
                executable.display()
            )));
        }
        let slot = self.slots.entry(side).or_insert_with(|| ManagedProcess {
            executable: executable.to_path_buf(),
            running: None,
        });
        slot.executable = executable.to_path_buf();
        Ok(())
    }

    async fn start(&mut self, side: Side) -> Result<(), GraderError> {
        let Some(slot) = self.slots.get(&side) else {
            return Err(GraderError::InvalidState(format!(
                "{} process not configured",
                side.as_str()
            )));
        };
        if slot.running.as_ref().is_some_and(|running| !running.has_exited()) {
            return Ok(());
        }
        let executable = slot.executable.clone();
        if let Some(previous) = self.take_running(side) {
            let _ = previous.monitor.await;
        }
        let running = self.spawn(side, &executable)?;
        if let Some(slot) = self.slots.get_mut(&side) {
            slot.running = Some(running);
        }
        Ok(())
    }

    fn is_running(&mut self, side: Side) -> bool {
        self.slots
            .get(&side)
            .and_then(|slot| slot.running.as_ref())
            .is_some_and(|running| !running.has_exited())
    }

    async fn send_input(&mut self, side: Side, text: &str) -> Result<(), GraderError> {
        let Some(running) = self.slots.get_mut(&side).and_then(|slot| slot.running.as_mut()) else {
            return Ok(());
        };
        if running.has_exited() {
            return Ok(());
        }
        let Some(stdin) = running.stdin.as_mut() else {
            return Ok(());
        };
        let line = format!("{text}\n");
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(error) = written {
            // The process went away between the liveness check and the write.
            append_run_log(
                "warn",
                "process.input.dropped",
                json!({ "side": side.as_str(), "error": error.to_string() }),
            );
        }
        Ok(())
    }

    async fn stop(&mut self, side: Side) -> Result<(), GraderError> {
        let running = self.take_running(side);
        stop_slot(side, running, self.settings.grace_period).await;
        Ok(())
    }

    async fn hard_stop(&mut self, side: Side) -> Result<(), GraderError> {
        if let Some(running) = self.take_running(side) {
            force_kill(side, running).await;
        }
        Ok(())
    }

    async fn stop_all(&mut self) -> Result<(), GraderError> {
        let client = self.take_running(Side::Client);
        let server = self.take_running(Side::Server);
        let grace = self.settings.grace_period;
        tokio::join!(
            stop_slot(Side::Client, client, grace),
            stop_slot(Side::Server, server, grace)
        );
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            grace_period: Duration::from_millis(300),
            debounce: Duration::from_millis(50),
        }
    }

    async fn collect_until_exit(supervisor: &mut ProcessSupervisor, side: Side) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..100 {
            for event in supervisor.drain_events() {
                let exited = matches!(event, ProcessEvent::Exited { side: s, .. } if s == side);
                lines.push(event.console_text());
                if exited {
                    return lines;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        lines
    }

    #[test]
    fn configure_rejects_missing_executable() {
        let mut supervisor = ProcessSupervisor::new(settings());
        let err = supervisor
            .configure(Side::Client, Path::new("/definitely/not/here"))
            .expect_err("missing");
        assert!(matches!(err, GraderError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_without_configure_is_invalid_state() {
        let mut supervisor = ProcessSupervisor::new(settings());
        let err = supervisor.start(Side::Server).await.expect_err("unconfigured");
        assert!(matches!(err, GraderError::InvalidState(_)));
    }

    #[tokio::test]
    async fn echoes_input_and_reports_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = script(
            dir.path(),
            "client.sh",
            "read line\necho \"got $line\"\necho oops 1>&2",
        );
        let mut supervisor = ProcessSupervisor::new(settings());
        supervisor.configure(Side::Client, &exe).expect("configure");
        supervisor.start(Side::Client).await.expect("start");
        assert!(supervisor.is_running(Side::Client));
        supervisor.send_input(Side::Client, "hello").await.expect("input");

        let lines = collect_until_exit(&mut supervisor, Side::Client).await;
        assert!(lines.contains(&"got hello".to_string()), "{lines:?}");
        assert!(lines.contains(&"[ERR] oops".to_string()), "{lines:?}");
        assert_eq!(lines.last().map(String::as_str), Some("[Client] exited."));
        assert!(!supervisor.is_running(Side::Client));

        supervisor.send_input(Side::Client, "ignored").await.expect("no-op");
    }

    #[tokio::test]
    async fn stop_kills_processes_that_ignore_closed_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = script(dir.path(), "server.sh", "trap '' TERM\nwhile true; do sleep 1; done");
        let mut supervisor = ProcessSupervisor::new(settings());
        supervisor.configure(Side::Server, &exe).expect("configure");
        supervisor.start(Side::Server).await.expect("start");
        supervisor.start(Side::Server).await.expect("idempotent");

        supervisor.stop_all().await.expect("stop");
        assert!(!supervisor.is_running(Side::Server));
        let events = supervisor.drain_events();
        assert!(events
            .iter()
            .any(|event| matches!(event, ProcessEvent::Exited { side: Side::Server, .. })));
    }

    #[tokio::test]
    async fn hard_stop_is_immediate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = script(dir.path(), "client.sh", "while true; do sleep 1; done");
        let mut supervisor = ProcessSupervisor::new(SupervisorSettings {
            grace_period: Duration::from_secs(30),
            debounce: Duration::from_millis(50),
        });
        supervisor.configure(Side::Client, &exe).expect("configure");
        supervisor.start(Side::Client).await.expect("start");

        let started = std::time::Instant::now();
        supervisor.hard_stop(Side::Client).await.expect("hard stop");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!supervisor.is_running(Side::Client));
    }
}
