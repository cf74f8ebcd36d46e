//! Graceful shutdown
//!
//! Turns a termination request into one orderly drain: stop admitting,
//! have the ChatServer notify and close every client, then wait (bounded)
//! for the connection tasks to finish.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::server::ChatEvent;

/// Shutdown lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Accepting and serving clients
    Running,
    /// Notifying and closing clients
    Draining,
    /// Drain finished (or timed out)
    Stopped,
}

/// Outcome of a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Clients that were sent the shutdown notice
    pub notified: usize,
    /// Whether every connection task finished within the grace period
    pub completed: bool,
}

/// Drives Running -> Draining -> Stopped exactly once
pub struct ShutdownCoordinator {
    state: ShutdownState,
    /// Process-wide shutdown signal, never reset once cancelled
    signal: CancellationToken,
    /// Coordinator event channel
    events: mpsc::Sender<ChatEvent>,
    /// Every connection task spawned by the accept loop
    tracker: TaskTracker,
    /// Upper bound on the wait for tracked tasks
    grace_period: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the Running state
    ///
    /// `signal` is cancelled when the drain starts; `tracker` must hold every
    /// connection task the drain should wait for.
    pub fn new(
        signal: CancellationToken,
        events: mpsc::Sender<ChatEvent>,
        tracker: TaskTracker,
        grace_period: Duration,
    ) -> Self {
        Self {
            state: ShutdownState::Running,
            signal,
            events,
            tracker,
            grace_period,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShutdownState {
        self.state
    }

    /// Run the drain
    ///
    /// Only the first call does any work; later calls return an empty
    /// report.
    pub async fn drain(&mut self) -> DrainReport {
        if self.state != ShutdownState::Running {
            return DrainReport::default();
        }

        self.state = ShutdownState::Draining;
        self.signal.cancel();
        info!("Shutting down server gracefully...");

        let (reply_tx, reply_rx) = oneshot::channel();
        let notified = match self.events.send(ChatEvent::Drain { reply: reply_tx }).await {
            Ok(()) => reply_rx.await.unwrap_or(0),
            Err(_) => {
                warn!("ChatServer already stopped, nothing to drain");
                0
            }
        };

        self.tracker.close();
        let completed = tokio::time::timeout(self.grace_period, self.tracker.wait())
            .await
            .is_ok();
        if !completed {
            warn!(
                "{} connections still open after {:?}, giving up on them",
                self.tracker.len(),
                self.grace_period
            );
        }

        self.state = ShutdownState::Stopped;
        info!("Server shutdown complete ({} clients notified)", notified);

        DrainReport {
            notified,
            completed,
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
///
/// A signal source that cannot be installed is logged and ignored.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to install Ctrl-C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
