//! Intercepting proxy between the client and the real server.

pub mod http;
pub mod tcp;

use crate::capture::{CaptureStore, TrafficUpdate};
use crate::errors::GraderError;
use crate::logging::append_run_log;
use crate::runtime::RelayControl;
use crate::sniff::sniff;
use crate::types::{RelayMode, Side};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// Marker status recorded when the real server could not be reached.
pub const FORWARD_FAILED_STATUS: &str = "-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub forward_timeout: Duration,
    pub connect_retry: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            upstream_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            forward_timeout: Duration::from_secs(10),
            connect_retry: Duration::from_secs(2),
        }
    }
}

/// Shared by every connection worker of one listening session.
pub(crate) struct RelayContext {
    pub(crate) capture: CaptureStore,
    pub(crate) settings: RelaySettings,
    pub(crate) mode: RelayMode,
    pub(crate) forwarder: http::Forwarder,
}

impl RelayContext {
    /// Records one relayed unit against whatever stage is current right now.
    pub(crate) fn record(&self, side: Side, method: &str, bytes: &[u8], status_code: Option<String>) {
        let update = TrafficUpdate {
            method: method.to_string(),
            payload: String::from_utf8_lossy(bytes).into_owned(),
            byte_size: bytes.len() as u64,
            status_code,
            data_type: sniff(bytes).as_str().to_string(),
        };
        let stage = self.capture.record_exchange(side, update, self.mode);
        append_run_log(
            "debug",
            "relay.exchange.recorded",
            json!({
                "side": side.as_str(),
                "method": method,
                "byte_size": bytes.len(),
                "stage": stage,
            }),
        );
    }

    /// Records a synthetic failed exchange so a broken upstream shows up in
    /// the capture instead of as silence.
    pub(crate) fn record_failure(&self, method: &str, error: &str) {
        append_run_log(
            "warn",
            "relay.forward.failed",
            json!({
                "method": method,
                "upstream": self.settings.upstream_addr.to_string(),
                "error": error,
            }),
        );
        let update = TrafficUpdate {
            method: method.to_string(),
            payload: error.to_string(),
            byte_size: 0,
            status_code: Some(FORWARD_FAILED_STATUS.to_string()),
            data_type: sniff(error.as_bytes()).as_str().to_string(),
        };
        self.capture.record_exchange(Side::Client, update, self.mode);
    }
}

struct ActiveRelay {
    mode: RelayMode,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

pub struct TrafficRelay {
    settings: RelaySettings,
    capture: CaptureStore,
    active: Option<ActiveRelay>,
}

impl TrafficRelay {
    pub fn new(settings: RelaySettings, capture: CaptureStore) -> Self {
        Self {
            settings,
            capture,
            active: None,
        }
    }

    /// Address actually bound, which differs from the configured one when
    /// listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.local_addr)
    }

    pub fn mode(&self) -> Option<RelayMode> {
        self.active.as_ref().map(|active| active.mode)
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<RelayContext>) {
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    append_run_log(
                        "debug",
                        "relay.connection.accepted",
                        json!({ "peer": peer.to_string() }),
                    );
                    workers.spawn(handle_connection(stream, Arc::clone(&context)));
                }
                Err(error) => {
                    append_run_log(
                        "warn",
                        "relay.accept.failed",
                        json!({ "error": error.to_string() }),
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = workers.join_next(), if !workers.is_empty() => {}
        }
    }
}

async fn handle_connection(stream: TcpStream, context: Arc<RelayContext>) {
    match context.mode {
        RelayMode::Message => http::serve_connection(stream, context).await,
        RelayMode::Stream => tcp::relay_connection(stream, context).await,
    }
}

impl RelayControl for TrafficRelay {
    async fn start(&mut self, mode: RelayMode) -> Result<(), GraderError> {
        if self.active.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(self.settings.listen_addr)
            .await
            .map_err(|e| GraderError::Relay(format!("bind {}: {e}", self.settings.listen_addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GraderError::Relay(e.to_string()))?;
        let context = Arc::new(RelayContext {
            capture: self.capture.clone(),
            settings: self.settings,
            mode,
            forwarder: http::Forwarder::new(),
        });
        let accept_task = tokio::spawn(accept_loop(listener, context));
        append_run_log(
            "info",
            "relay.started",
            json!({
                "mode": format!("{mode:?}").to_lowercase(),
                "listen": local_addr.to_string(),
                "upstream": self.settings.upstream_addr.to_string(),
            }),
        );
        self.active = Some(ActiveRelay {
            mode,
            local_addr,
            accept_task,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        // Dropping the accept task's JoinSet aborts every connection worker.
        active.accept_task.abort();
        let _ = active.accept_task.await;
        append_run_log(
            "info",
            "relay.stopped",
            json!({ "listen": active.local_addr.to_string() }),
        );
    }

    fn is_listening(&self) -> bool {
        self.active.is_some()
    }
}
