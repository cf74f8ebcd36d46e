//! Connection handler
//!
//! Runs the command interpreter for one accepted connection: welcome banner,
//! name handshake, registration with the ChatServer, then the line loop.
//!
//! The read side stays in the handler task. The write side belongs to a
//! spawned writer task fed by an unbounded channel, so the coordinator can
//! queue lines without ever waiting on a slow socket. Once a client has
//! joined, every way out of the loop funnels into a single Leave event.

use std::time::Duration;

use chrono::Local;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::SessionConfig;
use crate::error::AppError;
use crate::message::{self, Command, Outbound};
use crate::server::{ChatEvent, JoinOutcome};
use crate::types::ClientId;

/// How long a closing connection may take to flush its last lines
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection stopped reading
#[derive(Debug)]
enum SessionEnd {
    /// Client sent `quit`
    Quit,
    /// Stream reached EOF
    Disconnected,
    /// Read failed, bad UTF-8, or line too long
    ReadError(LinesCodecError),
    /// Nothing received within the idle timeout
    IdleTimeout,
    /// Writer stopped (server closed us, or the socket failed) or the
    /// coordinator is gone
    Closed,
    /// Shutdown signalled before the client joined
    ShuttingDown,
}

impl SessionEnd {
    /// Last line written before closing, if any
    fn notice(&self) -> Option<&'static str> {
        match self {
            SessionEnd::Quit => Some(message::FAREWELL),
            SessionEnd::IdleTimeout => Some(message::IDLE_NOTICE),
            SessionEnd::ShuttingDown => Some(message::SHUTDOWN_NOTICE),
            _ => None,
        }
    }
}

/// Handle one accepted connection
///
/// Generic over the stream so that anything byte-oriented (a TCP socket, an
/// in-memory duplex pipe) can be served. `peer_addr` doubles as the display
/// name when the client sends an empty one.
pub async fn handle_connection<S>(
    stream: S,
    peer_addr: String,
    events: mpsc::Sender<ChatEvent>,
    shutdown: CancellationToken,
    config: SessionConfig,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(config.max_line_length));

    let client_id = ClientId::new();
    debug!("Connection {} from {}", client_id.short(), peer_addr);

    // Create channel for server -> client lines
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let write_task = tokio::spawn(write_lines(writer, out_rx, client_id));

    queue_lines(&out_tx, message::welcome(&config.server_name, &Local::now()));
    let _ = out_tx.send(Outbound::line(message::NAME_PROMPT));

    let name = tokio::select! {
        line = read_line(&mut lines, config.idle_timeout) => line,
        _ = shutdown.cancelled() => Err(SessionEnd::ShuttingDown),
        _ = out_tx.closed() => Err(SessionEnd::Closed),
    };
    let name = match name {
        Ok(line) => match line.trim() {
            "" => peer_addr.clone(),
            name => name.to_string(),
        },
        Err(end) => {
            debug!("Connection from {} ended before joining: {:?}", peer_addr, end);
            close_connection(out_tx, write_task, end.notice()).await;
            return Ok(());
        }
    };

    // Register with ChatServer
    let client = Client::new(client_id, name.clone(), peer_addr.clone(), out_tx.clone());
    let (reply_tx, reply_rx) = oneshot::channel();
    let outcome = match events
        .send(ChatEvent::Join {
            client,
            reply: reply_tx,
        })
        .await
    {
        Ok(()) => reply_rx.await.ok(),
        Err(_) => None,
    };

    match outcome {
        Some(JoinOutcome::Accepted) => {}
        Some(JoinOutcome::ShuttingDown) => {
            debug!("Turning away '{}' ({}) - shutting down", name, peer_addr);
            close_connection(out_tx, write_task, Some(message::SHUTDOWN_NOTICE)).await;
            return Ok(());
        }
        Some(JoinOutcome::Full) => {
            close_connection(out_tx, write_task, Some(message::SERVER_FULL_NOTICE)).await;
            return Ok(());
        }
        Some(JoinOutcome::DuplicateId) => {
            warn!("Connection {} from {} refused - id in use", client_id.short(), peer_addr);
            close_connection(out_tx, write_task, None).await;
            return Ok(());
        }
        None => {
            error!("Failed to register client {} - server closed", peer_addr);
            close_connection(out_tx, write_task, Some(message::SHUTDOWN_NOTICE)).await;
            return Err(AppError::ChannelSend);
        }
    }

    let end = run_session(&mut lines, &out_tx, &events, &name, config.idle_timeout).await;

    // The one and only Leave for this connection. Sent before waiting on the
    // writer, which may be stuck on a peer that stopped reading.
    let _ = events.send(ChatEvent::Leave { client_id }).await;

    close_connection(out_tx, write_task, end.notice()).await;

    match end {
        SessionEnd::Quit => info!("Client '{}' ({}) quit", name, peer_addr),
        SessionEnd::Disconnected => info!("Client '{}' ({}) disconnected", name, peer_addr),
        SessionEnd::ReadError(e) => warn!("Read error from '{}' ({}): {}", name, peer_addr, e),
        SessionEnd::IdleTimeout => info!("Client '{}' ({}) timed out", name, peer_addr),
        SessionEnd::Closed | SessionEnd::ShuttingDown => {
            debug!("Connection for '{}' ({}) closed", name, peer_addr)
        }
    }

    Ok(())
}

/// Command loop for a joined client
async fn run_session<R>(
    lines: &mut FramedRead<R, LinesCodec>,
    out: &mpsc::UnboundedSender<Outbound>,
    events: &mpsc::Sender<ChatEvent>,
    name: &str,
    idle_timeout: Option<Duration>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = tokio::select! {
            line = read_line(lines, idle_timeout) => line,
            _ = out.closed() => Err(SessionEnd::Closed),
        };
        let line = match line {
            Ok(line) => line,
            Err(end) => return end,
        };

        match Command::parse(&line) {
            Command::Empty => {}
            Command::Help => queue_lines(out, message::help()),
            Command::Time => queue_lines(out, message::time_reply(&Local::now())),
            Command::Clients => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if events
                    .send(ChatEvent::ListClients { reply: reply_tx })
                    .await
                    .is_err()
                {
                    return SessionEnd::Closed;
                }
                match reply_rx.await {
                    Ok(names) => queue_lines(out, message::client_list(&names)),
                    Err(_) => return SessionEnd::Closed,
                }
            }
            Command::Quit => return SessionEnd::Quit,
            Command::Chat(text) => {
                let event = ChatEvent::Message {
                    name: name.to_string(),
                    text: text.to_string(),
                    sent_at: Local::now(),
                };
                if events.send(event).await.is_err() {
                    debug!("Server closed, ending session for '{}'", name);
                    return SessionEnd::Closed;
                }
            }
        }
    }
}

/// Read the next input line, honouring the idle timeout
async fn read_line<R>(
    lines: &mut FramedRead<R, LinesCodec>,
    idle_timeout: Option<Duration>,
) -> Result<String, SessionEnd>
where
    R: AsyncRead + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, lines.next())
            .await
            .map_err(|_| SessionEnd::IdleTimeout)?,
        None => lines.next().await,
    };

    match next {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(SessionEnd::ReadError(e)),
        None => Err(SessionEnd::Disconnected),
    }
}

/// Queue a block of lines for this connection's writer
///
/// A closed writer is not an error here; the loop notices it through
/// `closed()` on its next turn.
fn queue_lines(out: &mpsc::UnboundedSender<Outbound>, lines: Vec<String>) {
    let _ = out.send(Outbound::Block(lines));
}

/// Write an optional last line, close the stream, wait for the writer
///
/// The wait is bounded by `WRITER_CLOSE_TIMEOUT`; a writer still blocked on
/// the socket after that is aborted.
async fn close_connection(
    out: mpsc::UnboundedSender<Outbound>,
    mut write_task: JoinHandle<()>,
    notice: Option<&str>,
) {
    if let Some(notice) = notice {
        let _ = out.send(Outbound::line(notice));
    }
    let _ = out.send(Outbound::Close);
    drop(out);

    match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut write_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Writer task failed: {}", e),
        Err(_) => {
            debug!("Writer did not finish in {:?}, aborting", WRITER_CLOSE_TIMEOUT);
            write_task.abort();
        }
    }
}

/// Writer task: drain the outbound channel into the socket
async fn write_lines<W>(writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>, client_id: ClientId)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    while let Some(msg) = outbound.recv().await {
        let text = match msg {
            Outbound::Line(line) => line,
            Outbound::Block(lines) if lines.is_empty() => continue,
            // The codec terminates the last line; the joins terminate the rest
            Outbound::Block(lines) => lines.join("\n"),
            Outbound::Close => break,
        };
        if let Err(e) = sink.send(text).await {
            debug!("Write to {} failed: {}", client_id.short(), e);
            break;
        }
    }

    if let Err(e) = sink.into_inner().shutdown().await {
        debug!("Shutdown of {} failed: {}", client_id.short(), e);
    }
    debug!("Writer ended for {}", client_id.short());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    const PEER: &str = "127.0.0.1:5000";
    const WAIT: Duration = Duration::from_secs(5);

    struct TestPeer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestPeer {
        async fn next_line(&mut self) -> Option<String> {
            tokio::time::timeout(WAIT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap_or(None)
        }

        async fn expect_line(&mut self) -> String {
            self.next_line().await.expect("connection closed early")
        }

        async fn expect_eof(&mut self) {
            assert_eq!(self.next_line().await, None);
        }

        async fn send(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn skip_banner(&mut self) {
            while self.expect_line().await != message::NAME_PROMPT {}
        }
    }

    fn spawn_handler(
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> (TestPeer, mpsc::Receiver<ChatEvent>, JoinHandle<Result<(), AppError>>) {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (events_tx, events_rx) = mpsc::channel(16);
        let handle = tokio::spawn(handle_connection(
            server_side,
            PEER.to_string(),
            events_tx,
            shutdown,
            config,
        ));
        let (read, writer) = tokio::io::split(client_side);
        let peer = TestPeer {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (peer, events_rx, handle)
    }

    async fn next_event(events: &mut mpsc::Receiver<ChatEvent>) -> Option<ChatEvent> {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
    }

    async fn answer_join(events: &mut mpsc::Receiver<ChatEvent>, outcome: JoinOutcome) -> Client {
        match next_event(events).await {
            Some(ChatEvent::Join { client, reply }) => {
                reply.send(outcome).unwrap();
                client
            }
            other => panic!("expected join, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_banner_and_name_handshake() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());

        assert_eq!(peer.expect_line().await, "Welcome to RISC-V Network Server!");
        assert!(peer.expect_line().await.starts_with("Server time: "));
        assert_eq!(peer.expect_line().await, "Type 'help' for commands.");
        assert_eq!(peer.expect_line().await, "");
        assert_eq!(peer.expect_line().await, message::NAME_PROMPT);

        peer.send("  Alice  ").await;
        let client = answer_join(&mut events, JoinOutcome::Accepted).await;
        assert_eq!(client.name, "Alice");
        assert_eq!(client.peer_addr, PEER);

        drop(peer);
        assert!(matches!(next_event(&mut events).await, Some(ChatEvent::Leave { .. })));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_name_falls_back_to_address() {
        let (mut peer, mut events, _handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;

        peer.send("   ").await;
        let client = answer_join(&mut events, JoinOutcome::Accepted).await;
        assert_eq!(client.name, PEER);
    }

    #[tokio::test]
    async fn test_quit_sends_farewell_and_exactly_one_leave() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        let client = answer_join(&mut events, JoinOutcome::Accepted).await;

        peer.send("QUIT").await;
        assert_eq!(peer.expect_line().await, message::FAREWELL);
        peer.expect_eof().await;

        match next_event(&mut events).await {
            Some(ChatEvent::Leave { client_id }) => assert_eq!(client_id, client.id),
            other => panic!("expected leave, got {:?}", other),
        }
        handle.await.unwrap().unwrap();
        // Handler has dropped its sender: no second Leave can follow
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_message_before_quit_precedes_leave() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        answer_join(&mut events, JoinOutcome::Accepted).await;

        peer.send("last words").await;
        peer.send("quit").await;

        match next_event(&mut events).await {
            Some(ChatEvent::Message { name, text, .. }) => {
                assert_eq!(name, "Alice");
                assert_eq!(text, "last words");
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(matches!(next_event(&mut events).await, Some(ChatEvent::Leave { .. })));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_emits_leave() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Bob").await;
        let client = answer_join(&mut events, JoinOutcome::Accepted).await;

        drop(peer);

        match next_event(&mut events).await {
            Some(ChatEvent::Leave { client_id }) => assert_eq!(client_id, client.id),
            other => panic!("expected leave, got {:?}", other),
        }
        handle.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_local_commands_emit_no_events() {
        let (mut peer, mut events, _handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        answer_join(&mut events, JoinOutcome::Accepted).await;

        peer.send("").await;
        peer.send("Help").await;
        for expected in message::help() {
            assert_eq!(peer.expect_line().await, expected);
        }

        peer.send("time").await;
        let reply = peer.expect_line().await;
        let stamp = reply.strip_prefix("Current server time: ").unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert_eq!(peer.expect_line().await, "");

        peer.send("  hello there  ").await;
        match next_event(&mut events).await {
            Some(ChatEvent::Message { text, .. }) => assert_eq!(text, "hello there"),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clients_queries_coordinator() {
        let (mut peer, mut events, _handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        answer_join(&mut events, JoinOutcome::Accepted).await;

        peer.send("clients").await;
        match next_event(&mut events).await {
            Some(ChatEvent::ListClients { reply }) => {
                reply.send(vec!["Alice".to_string()]).unwrap();
            }
            other => panic!("expected client list query, got {:?}", other),
        }

        assert_eq!(peer.expect_line().await, "Connected clients (1):");
        assert_eq!(peer.expect_line().await, "  - Alice");
        assert_eq!(peer.expect_line().await, "");
    }

    #[tokio::test]
    async fn test_shutdown_during_name_prompt() {
        let shutdown = CancellationToken::new();
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), shutdown.clone());
        peer.skip_banner().await;

        shutdown.cancel();

        assert_eq!(peer.expect_line().await, message::SHUTDOWN_NOTICE);
        peer.expect_eof().await;
        handle.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_join_refused_while_draining() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Late").await;
        answer_join(&mut events, JoinOutcome::ShuttingDown).await;

        assert_eq!(peer.expect_line().await, message::SHUTDOWN_NOTICE);
        peer.expect_eof().await;
        handle.await.unwrap().unwrap();
        // Never joined, so no Leave
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_join_refused_when_full() {
        let (mut peer, mut events, _handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Extra").await;
        answer_join(&mut events, JoinOutcome::Full).await;

        assert_eq!(peer.expect_line().await, message::SERVER_FULL_NOTICE);
        peer.expect_eof().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_closes_without_leave() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        answer_join(&mut events, JoinOutcome::DuplicateId).await;

        peer.expect_eof().await;
        handle.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_server_side_close_ends_session() {
        let (mut peer, mut events, handle) =
            spawn_handler(SessionConfig::default(), CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        let client = answer_join(&mut events, JoinOutcome::Accepted).await;

        client.send_line(message::SHUTDOWN_NOTICE).unwrap();
        client.close().unwrap();

        assert_eq!(peer.expect_line().await, message::SHUTDOWN_NOTICE);
        peer.expect_eof().await;
        assert!(matches!(next_event(&mut events).await, Some(ChatEvent::Leave { .. })));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leave_not_held_up_by_peer_that_stops_reading() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = tokio::spawn(handle_connection(
            server_side,
            PEER.to_string(),
            events_tx,
            CancellationToken::new(),
            SessionConfig::default(),
        ));
        let (read, writer) = tokio::io::split(client_side);
        let mut peer = TestPeer {
            lines: BufReader::new(read).lines(),
            writer,
        };
        peer.skip_banner().await;
        peer.send("Alice").await;
        let client = answer_join(&mut events, JoinOutcome::Accepted).await;

        // Far more than the pipe holds; the writer blocks on the full pipe
        for _ in 0..100 {
            client.send_line("x".repeat(100)).unwrap();
        }
        peer.send("quit").await;

        match tokio::time::timeout(Duration::from_secs(3), events.recv()).await {
            Ok(Some(ChatEvent::Leave { client_id })) => assert_eq!(client_id, client.id),
            other => panic!("expected prompt leave, got {:?}", other),
        }

        drop(peer);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout_disconnects() {
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(300)),
            ..SessionConfig::default()
        };
        let (mut peer, mut events, handle) = spawn_handler(config, CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Sleepy").await;
        answer_join(&mut events, JoinOutcome::Accepted).await;

        assert_eq!(peer.expect_line().await, message::IDLE_NOTICE);
        peer.expect_eof().await;
        assert!(matches!(next_event(&mut events).await, Some(ChatEvent::Leave { .. })));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_overlong_line_ends_session() {
        let config = SessionConfig {
            max_line_length: 16,
            ..SessionConfig::default()
        };
        let (mut peer, mut events, handle) = spawn_handler(config, CancellationToken::new());
        peer.skip_banner().await;
        peer.send("Alice").await;
        answer_join(&mut events, JoinOutcome::Accepted).await;

        peer.send(&"x".repeat(100)).await;

        peer.expect_eof().await;
        assert!(matches!(next_event(&mut events).await, Some(ChatEvent::Leave { .. })));
        handle.await.unwrap().unwrap();
    }
}
