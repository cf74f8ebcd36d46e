//! Line protocol definitions
//!
//! Plain newline-delimited text in both directions. Client lines are parsed
//! into a [`Command`]; everything the server writes is an [`Outbound`] item
//! whose text is produced by the formatting helpers below. The line codec
//! appends the `\n`, so none of these strings carry one.

use chrono::{DateTime, Local, SecondsFormat};

/// Prompt sent right after the welcome banner
pub const NAME_PROMPT: &str = "Enter your name:";

/// Reply to `quit`
pub const FAREWELL: &str = "Goodbye!";

/// Written to every connection during the drain
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down. Goodbye!";

/// Written when the admission limit rejects a join
pub const SERVER_FULL_NOTICE: &str = "Server is full. Try again later.";

/// Written before an idle connection is dropped
pub const IDLE_NOTICE: &str = "Disconnected after being idle too long.";

const HELP_LINES: [&str; 7] = [
    "Available commands:",
    "  help    - Show this help",
    "  time    - Get current server time",
    "  clients - List connected clients",
    "  quit    - Disconnect from server",
    "  <text>  - Send message to all clients",
    "",
];

/// Client → Server input
///
/// One trimmed input line, classified case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Show the command summary
    Help,
    /// Show the current server time
    Time,
    /// List registered clients
    Clients,
    /// Say goodbye and disconnect
    Quit,
    /// Blank line, ignored
    Empty,
    /// Anything else is broadcast
    Chat(&'a str),
}

impl<'a> Command<'a> {
    /// Classify one input line
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }

        if line.eq_ignore_ascii_case("help") {
            Command::Help
        } else if line.eq_ignore_ascii_case("time") {
            Command::Time
        } else if line.eq_ignore_ascii_case("clients") {
            Command::Clients
        } else if line.eq_ignore_ascii_case("quit") {
            Command::Quit
        } else {
            Command::Chat(line)
        }
    }
}

/// Server → Client output
///
/// Queued on a connection's outbound channel and written by its writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One text line (newline added on the wire)
    Line(String),
    /// Consecutive lines written together, so no broadcast lands in between
    Block(Vec<String>),
    /// Flush, shut down the write side, stop the writer
    Close,
}

impl Outbound {
    /// Shorthand for `Outbound::Line`
    pub fn line(text: impl Into<String>) -> Self {
        Outbound::Line(text.into())
    }
}

/// Server time in a fixed, machine-parseable form (RFC 3339, seconds)
pub fn server_time(now: &DateTime<Local>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Banner sent on connect
pub fn welcome(server_name: &str, now: &DateTime<Local>) -> Vec<String> {
    vec![
        format!("Welcome to {}!", server_name),
        format!("Server time: {}", server_time(now)),
        "Type 'help' for commands.".to_string(),
        String::new(),
    ]
}

/// Static command summary
pub fn help() -> Vec<String> {
    HELP_LINES.iter().map(|line| line.to_string()).collect()
}

/// Reply to `time`
pub fn time_reply(now: &DateTime<Local>) -> Vec<String> {
    vec![format!("Current server time: {}", server_time(now)), String::new()]
}

/// Reply to `clients`
pub fn client_list(names: &[String]) -> Vec<String> {
    let mut lines = Vec::with_capacity(names.len() + 2);
    lines.push(format!("Connected clients ({}):", names.len()));
    lines.extend(names.iter().map(|name| format!("  - {}", name)));
    lines.push(String::new());
    lines
}

/// Broadcast chat line: `[HH:MM:SS] name: text`
pub fn chat_line(name: &str, text: &str, sent_at: &DateTime<Local>) -> String {
    format!("[{}] {}: {}", sent_at.format("%H:%M:%S"), name, text)
}

/// Join announcement
pub fn joined(name: &str) -> String {
    format!("{} joined the chat", name)
}

/// Leave announcement
pub fn left(name: &str) -> String {
    format!("{} left the chat", name)
}
