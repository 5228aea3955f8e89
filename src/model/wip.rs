//! Progress and cancellation signal for one long-running operation.
//!
//! The operation reports progress through [`WorkInProgressMonitor::set_progress`]
//! and polls [`WorkInProgressMonitor::is_cancelled`] (or awaits
//! [`WorkInProgressMonitor::cancelled`]) to stop early. Observers such as the
//! CLI spinner subscribe to progress updates.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A progress update published by a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub name: String,
    /// Percentage in `0.0..=100.0`.
    pub percent: f64,
}

#[derive(Debug)]
pub struct WorkInProgressMonitor {
    name: String,
    cancel: CancellationToken,
    progress: watch::Sender<Progress>,
}

impl WorkInProgressMonitor {
    /// A monitor that is never cancelled from the outside.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    pub fn with_token(name: impl Into<String>, cancel: CancellationToken) -> Self {
        let name = name.into();
        let (progress, _) = watch::channel(Progress {
            name: name.clone(),
            percent: 0.0,
        });
        Self {
            name,
            cancel,
            progress,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn percent(&self) -> f64 {
        self.progress.borrow().percent
    }

    /// Clamps to `0..=100` and notifies subscribers.
    pub fn set_progress(&self, percent: f64) {
        let percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        self.progress.send_replace(Progress {
            name: self.name.clone(),
            percent,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests cancellation of the monitored operation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
