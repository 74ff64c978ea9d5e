use crate::errors::GraderError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation shared by everything that sleeps during a run.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<(), GraderError> {
        if self.is_cancelled() {
            return Err(GraderError::Cancelled);
        }
        Ok(())
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of this signal, so this only
        // returns once the flag flips.
        let _ = rx.wait_for(|flag| *flag).await;
    }

    /// Sleeps for `duration` unless cancellation arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), GraderError> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(GraderError::Cancelled),
        }
    }
}
