use crate::errors::GraderError;
use crate::logging::append_run_log;
use crate::types::{CapturedExchange, RelayMode, Side};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Case-insensitive substrings whose console lines are never recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    needles: Vec<String>,
}

impl IgnoreList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut needles = Vec::new();
        for entry in entries {
            let needle = entry.as_ref().trim().to_lowercase();
            if !needle.is_empty() && !needles.contains(&needle) {
                needles.push(needle);
            }
        }
        Self { needles }
    }

    /// One entry per line; blank lines and `#` comments are skipped. A missing
    /// file is an empty list.
    pub fn load(path: &Path) -> Result<Self, GraderError> {
        if !path.exists() {
            append_run_log(
                "warn",
                "capture.ignore_list.missing",
                json!({ "path": path.display().to_string() }),
            );
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| GraderError::Io(e.to_string()))?;
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.starts_with('#')),
        ))
    }

    pub fn len(&self) -> usize {
        self.needles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn matches(&self, line: &str) -> bool {
        if self.needles.is_empty() {
            return false;
        }
        let haystack = line.to_lowercase();
        self.needles.iter().any(|needle| haystack.contains(needle))
    }
}

/// Traffic fields observed for one relayed message or chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficUpdate {
    pub method: String,
    pub payload: String,
    pub byte_size: u64,
    pub status_code: Option<String>,
    pub data_type: String,
}

#[derive(Debug, Default)]
struct CaptureState {
    current_stage: Option<u32>,
    client: BTreeMap<u32, CapturedExchange>,
    server: BTreeMap<u32, CapturedExchange>,
    ignore: IgnoreList,
}

impl CaptureState {
    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<u32, CapturedExchange> {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn side(&self, side: Side) -> &BTreeMap<u32, CapturedExchange> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }
}

/// Stage-indexed record of everything observed during one test case. Clones
/// share the same underlying store.
#[derive(Debug, Clone, Default)]
pub struct CaptureStore {
    inner: Arc<Mutex<CaptureState>>,
}

impl CaptureStore {
    pub fn new(ignore: IgnoreList) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureState {
                ignore,
                ..CaptureState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops every record and forgets the current stage. The ignore list stays.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.current_stage = None;
        state.client.clear();
        state.server.clear();
    }

    pub fn advance_stage(&self, stage: u32) {
        let mut state = self.lock();
        if let Some(current) = state.current_stage {
            if stage <= current {
                append_run_log(
                    "warn",
                    "capture.stage.not_increasing",
                    json!({ "current": current, "requested": stage }),
                );
                return;
            }
        }
        state.current_stage = Some(stage);
    }

    pub fn current_stage(&self) -> Option<u32> {
        self.lock().current_stage
    }

    /// Returns the stage the line was attributed to, or `None` when it was
    /// ignored or no stage has been announced yet.
    pub fn append_console_output(&self, side: Side, text: &str) -> Option<u32> {
        let mut state = self.lock();
        if state.ignore.matches(text) {
            return None;
        }
        let stage = state.current_stage?;
        let record = state
            .side_mut(side)
            .entry(stage)
            .or_insert_with(|| CapturedExchange::new(stage));
        record.console_output.push_str(text);
        record.console_output.push('\n');
        Some(stage)
    }

    /// Message mode replaces the traffic fields of the stage record and keeps its
    /// console output. Stream mode sums sizes and concatenates payloads.
    pub fn record_exchange(&self, side: Side, update: TrafficUpdate, mode: RelayMode) -> Option<u32> {
        let mut state = self.lock();
        let Some(stage) = state.current_stage else {
            append_run_log(
                "debug",
                "capture.exchange.dropped",
                json!({ "side": side.as_str(), "byte_size": update.byte_size }),
            );
            return None;
        };
        let record = state
            .side_mut(side)
            .entry(stage)
            .or_insert_with(|| CapturedExchange::new(stage));
        match mode {
            RelayMode::Message => {
                record.method = update.method;
                record.payload = update.payload;
                record.byte_size = update.byte_size;
                record.status_code = update.status_code;
                record.data_type = update.data_type;
            }
            RelayMode::Stream => {
                record.byte_size = record.byte_size.saturating_add(update.byte_size);
                record.payload.push_str(&update.payload);
                record.method = update.method;
                record.data_type = update.data_type;
                if update.status_code.is_some() {
                    record.status_code = update.status_code;
                }
            }
        }
        Some(stage)
    }

    pub fn snapshot(&self, side: Side, stage: u32) -> Option<CapturedExchange> {
        self.lock().side(side).get(&stage).cloned()
    }

    pub fn has_meaningful(&self, side: Side, stage: u32) -> bool {
        self.lock()
            .side(side)
            .get(&stage)
            .is_some_and(CapturedExchange::is_meaningful)
    }

    /// All records for one side in stage order.
    pub fn records(&self, side: Side) -> Vec<CapturedExchange> {
        self.lock().side(side).values().cloned().collect()
    }
}
