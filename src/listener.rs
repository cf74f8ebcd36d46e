//! TCP accept loop
//!
//! Wires a bound listener to the ChatServer actor: one tracked handler task
//! per accepted socket, until the shutdown future resolves. A failed accept
//! is logged and the loop keeps going; only shutdown drains the clients.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::handler::handle_connection;
use crate::server::ChatServer;
use crate::shutdown::{DrainReport, ShutdownCoordinator};

/// Pause after an accept error that will not clear by itself right away
/// (out of file descriptors, out of memory)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serve clients until `shutdown` resolves, then drain them
pub async fn serve<F>(listener: TcpListener, config: ServerConfig, shutdown: F) -> DrainReport
where
    F: Future<Output = ()>,
{
    // Create ChatServer actor channel and start
    let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
    tokio::spawn(ChatServer::new(events_rx, config.max_clients).run());

    let signal = CancellationToken::new();
    let tracker = TaskTracker::new();
    let session = config.session();

    tokio::pin!(shutdown);

    // Connection accept loop
    loop {
        let accepted = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let events_tx = events_tx.clone();
                let signal = signal.clone();
                let session = session.clone();

                // Spawn handler task for each connection
                tracker.spawn(async move {
                    let peer_addr = addr.to_string();
                    if let Err(e) = handle_connection(stream, peer_addr, events_tx, signal, session).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => match accept_backoff(&e) {
                None => warn!("Failed to accept connection: {}", e),
                Some(delay) => {
                    error!("Failed to accept connection: {} (retrying in {:?})", e, delay);
                    tokio::time::sleep(delay).await;
                }
            },
        }
    }

    // Stop taking connections before the drain starts
    drop(listener);

    let mut coordinator =
        ShutdownCoordinator::new(signal, events_tx, tracker, config.grace_period());
    let report = coordinator.drain().await;
    info!(
        "Drain finished: {} notified, all closed: {}",
        report.notified, report.completed
    );
    report
}

/// How long to wait before the next accept after `error`
///
/// Errors tied to the one connection being accepted retry at once; anything
/// else gets a short pause so a persistent failure does not spin.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}
