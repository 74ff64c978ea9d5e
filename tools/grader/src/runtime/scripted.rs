//! In-memory stand-ins for the process supervisor and relay. Instead of
//! spawning executables they replay scripted traffic into a `CaptureStore`
//! and scripted console lines into the event queue, for whatever stage is
//! current when an action fires.

use super::{ProcessControl, ProcessEvent, RelayControl};
use crate::capture::{CaptureStore, TrafficUpdate};
use crate::errors::GraderError;
use crate::types::{RelayMode, Side};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
pub struct FakeCallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeCallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|entry| entry.as_str() == call)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedReaction {
    pub stage: u32,
    pub traffic: Vec<(Side, TrafficUpdate)>,
    pub console: Vec<(Side, String)>,
}

impl ScriptedReaction {
    pub fn at_stage(stage: u32) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    pub fn traffic(mut self, side: Side, update: TrafficUpdate) -> Self {
        self.traffic.push((side, update));
        self
    }

    pub fn console(mut self, side: Side, line: impl Into<String>) -> Self {
        self.console.push((side, line.into()));
        self
    }
}

#[derive(Debug, Default)]
struct FakeProcessState {
    configured: BTreeMap<Side, PathBuf>,
    running: BTreeSet<Side>,
    missing: BTreeSet<Side>,
    launch_failures: BTreeSet<Side>,
    reactions: Vec<ScriptedReaction>,
    applied: BTreeSet<usize>,
    pending: Vec<ProcessEvent>,
}

#[derive(Clone)]
pub struct FakeProcessControl {
    state: Arc<Mutex<FakeProcessState>>,
    capture: CaptureStore,
    mode: RelayMode,
    log: FakeCallLog,
}

impl FakeProcessControl {
    pub fn new(capture: CaptureStore, mode: RelayMode, log: FakeCallLog) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProcessState::default())),
            capture,
            mode,
            log,
        }
    }

    pub fn react(&self, reaction: ScriptedReaction) {
        self.state
            .lock()
            .expect("fake process lock")
            .reactions
            .push(reaction);
    }

    pub fn missing_executable(&self, side: Side) {
        self.state
            .lock()
            .expect("fake process lock")
            .missing
            .insert(side);
    }

    pub fn fail_launch(&self, side: Side) {
        self.state
            .lock()
            .expect("fake process lock")
            .launch_failures
            .insert(side);
    }

    pub fn running(&self, side: Side) -> bool {
        self.state
            .lock()
            .expect("fake process lock")
            .running
            .contains(&side)
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.calls()
    }

    fn exit(&self, side: Side) {
        let mut state = self.state.lock().expect("fake process lock");
        if state.running.remove(&side) {
            state.pending.push(ProcessEvent::Exited {
                side,
                code: Some(0),
            });
        }
    }

    fn fire_reactions(&self) {
        let Some(stage) = self.capture.current_stage() else {
            return;
        };
        let due = {
            let mut state = self.state.lock().expect("fake process lock");
            let indexes = state
                .reactions
                .iter()
                .enumerate()
                .filter(|(index, reaction)| reaction.stage == stage && !state.applied.contains(index))
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            let mut due = Vec::new();
            for index in indexes {
                state.applied.insert(index);
                due.push(state.reactions[index].clone());
            }
            due
        };
        for reaction in due {
            {
                let mut state = self.state.lock().expect("fake process lock");
                for (side, text) in reaction.console {
                    state.pending.push(ProcessEvent::Line { side, text });
                }
            }
            for (side, update) in reaction.traffic {
                self.capture.record_exchange(side, update, self.mode);
            }
        }
    }
}

impl ProcessControl for FakeProcessControl {
    fn configure(&mut self, side: Side, executable: &Path) -> Result<(), GraderError> {
        self.log.push(format!("configure:{}", side.as_str()));
        let mut state = self.state.lock().expect("fake process lock");
        if state.missing.contains(&side) {
            return Err(GraderError::NotFound(format!(
                "executable not found: {}",
                executable.display()
            )));
        }
        state.configured.insert(side, executable.to_path_buf());
        Ok(())
    }

    async fn start(&mut self, side: Side) -> Result<(), GraderError> {
        self.log.push(format!("start:{}", side.as_str()));
        {
            let mut state = self.state.lock().expect("fake process lock");
            if !state.configured.contains_key(&side) {
                return Err(GraderError::InvalidState(format!(
                    "{} process not configured",
                    side.as_str()
                )));
            }
            if state.launch_failures.contains(&side) {
                return Err(GraderError::ProcessLaunch(format!(
                    "{} failed to launch",
                    side.as_str()
                )));
            }
            state.running.insert(side);
        }
        self.fire_reactions();
        Ok(())
    }

    fn is_running(&mut self, side: Side) -> bool {
        self.running(side)
    }

    async fn send_input(&mut self, side: Side, text: &str) -> Result<(), GraderError> {
        if !self.running(side) {
            return Ok(());
        }
        self.log.push(format!("input:{}:{text}", side.as_str()));
        self.fire_reactions();
        Ok(())
    }

    async fn stop(&mut self, side: Side) -> Result<(), GraderError> {
        self.log.push(format!("stop:{}", side.as_str()));
        self.exit(side);
        Ok(())
    }

    async fn hard_stop(&mut self, side: Side) -> Result<(), GraderError> {
        self.log.push(format!("hard_stop:{}", side.as_str()));
        self.exit(side);
        self.fire_reactions();
        Ok(())
    }

    /// Also rewinds the script so the next case replays it.
    async fn stop_all(&mut self) -> Result<(), GraderError> {
        self.log.push("stop_all");
        self.exit(Side::Client);
        self.exit(Side::Server);
        self.state.lock().expect("fake process lock").applied.clear();
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<ProcessEvent> {
        std::mem::take(&mut self.state.lock().expect("fake process lock").pending)
    }
}

#[derive(Clone)]
pub struct FakeRelay {
    listening: Arc<Mutex<Option<RelayMode>>>,
    log: FakeCallLog,
}

impl FakeRelay {
    pub fn new(log: FakeCallLog) -> Self {
        Self {
            listening: Arc::new(Mutex::new(None)),
            log,
        }
    }
}

impl RelayControl for FakeRelay {
    async fn start(&mut self, mode: RelayMode) -> Result<(), GraderError> {
        let mut listening = self.listening.lock().expect("relay lock");
        if listening.is_none() {
            self.log.push(format!("relay_start:{mode:?}").to_lowercase());
            *listening = Some(mode);
        }
        Ok(())
    }

    async fn stop(&mut self) {
        let mut listening = self.listening.lock().expect("relay lock");
        if listening.take().is_some() {
            self.log.push("relay_stop");
        }
    }

    fn is_listening(&self) -> bool {
        self.listening.lock().expect("relay lock").is_some()
    }
}
