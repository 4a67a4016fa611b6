// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group communication wire protocol.
//!
//! Newline-delimited text protocol, one message per line. Message content is
//! escaped so a single message always fits on one line.
//!
//! Wire format:
//! ```text
//! KIND|SENDER|RECIPIENT|CONTENT
//! ```
//!
//! `CONTENT` is the remainder of the line and may itself contain `|`.
//!
//! Join handshake (server lines in upper case):
//! ```text
//! S: SUBMITID
//! C: alice
//! S: ACCEPTED|alice|true        (or ERROR|<reason>)
//! ```

use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field delimiter. Never allowed inside member ids.
pub const DELIMITER: char = '|';

/// Sender id used for notifications generated by the group itself.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// Sender id used for heartbeat probes.
pub const SERVER_SENDER: &str = "SERVER";

/// Protocol error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid member id: {0}")]
    InvalidMemberId(String),
}

/// Message intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Delivered to every member.
    Broadcast,
    /// Delivered to a single recipient.
    Private,
    /// Notification generated by the group.
    System,
    /// Liveness probe sent by the heartbeat monitor.
    Ping,
    /// Liveness answer sent by a member.
    Pong,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "BROADCAST",
            Self::Private => "PRIVATE",
            Self::System => "SYSTEM",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BROADCAST" => Ok(Self::Broadcast),
            "PRIVATE" => Ok(Self::Private),
            "SYSTEM" => Ok(Self::System),
            "PING" => Ok(Self::Ping),
            "PONG" => Ok(Self::Pong),
            other => Err(ProtocolError::MalformedMessage(format!(
                "unknown message kind '{}'",
                other
            ))),
        }
    }
}

/// A group message.
///
/// The timestamp is local to the process that created the message and is
/// never transmitted, so it takes no part in equality.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.sender == other.sender
            && self.recipient == other.recipient
            && self.content == other.content
    }
}

impl Eq for Message {}

impl Message {
    pub fn new(
        kind: MessageKind,
        sender: Option<String>,
        recipient: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            sender,
            recipient,
            content: content.into(),
            timestamp: Local::now(),
        }
    }

    /// Message for every member of the group.
    pub fn broadcast(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Broadcast, Some(sender.into()), None, content)
    }

    /// Message for a single member.
    pub fn private(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            MessageKind::Private,
            Some(sender.into()),
            Some(recipient.into()),
            content,
        )
    }

    /// Group notification.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(
            MessageKind::System,
            Some(SYSTEM_SENDER.to_string()),
            None,
            content,
        )
    }

    /// Group notification addressed to one member.
    pub fn system_to(recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            MessageKind::System,
            Some(SYSTEM_SENDER.to_string()),
            Some(recipient.into()),
            content,
        )
    }

    pub fn ping() -> Self {
        Self::new(
            MessageKind::Ping,
            Some(SERVER_SENDER.to_string()),
            None,
            "PING",
        )
    }

    pub fn pong(sender: impl Into<String>) -> Self {
        Self::new(MessageKind::Pong, Some(sender.into()), None, "PONG")
    }

    /// Sender id, or an empty string for anonymous messages.
    pub fn sender_id(&self) -> &str {
        self.sender.as_deref().unwrap_or("")
    }

    /// Creation time as `HH:MM:SS`.
    pub fn formatted_timestamp(&self) -> String {
        self.timestamp.format("%H:%M:%S").to_string()
    }

    /// Human readable rendering used in logs.
    pub fn display_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.formatted_timestamp(),
            self.sender_id(),
            self.content
        )
    }

    /// Encode to a single wire line (without the trailing newline).
    pub fn encode(&self) -> String {
        encode(self)
    }
}

/// Encode a message as `KIND|SENDER|RECIPIENT|CONTENT`.
pub fn encode(msg: &Message) -> String {
    format!(
        "{}{d}{}{d}{}{d}{}",
        msg.kind,
        msg.sender.as_deref().unwrap_or(""),
        msg.recipient.as_deref().unwrap_or(""),
        escape_content(&msg.content),
        d = DELIMITER
    )
}

/// Decode a wire line.
///
/// Only the first three delimiters split fields; the content keeps the rest.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let mut parts = line.splitn(4, DELIMITER);
    let (Some(kind), Some(sender), Some(recipient), Some(content)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::MalformedMessage(format!(
            "expected 4 fields in '{}'",
            line
        )));
    };

    Ok(Message::new(
        kind.parse()?,
        non_empty(sender),
        non_empty(recipient),
        unescape_content(content),
    ))
}

fn non_empty(field: &str) -> Option<String> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// Escape line breaks so content stays on one line.
pub fn escape_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_content`]. Unknown escapes are kept verbatim.
pub fn unescape_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Check a proposed member id.
pub fn validate_member_id(id: &str, max_len: usize) -> Result<(), ProtocolError> {
    if id.is_empty() {
        return Err(ProtocolError::InvalidMemberId("ID cannot be empty".into()));
    }
    if id.chars().count() > max_len {
        return Err(ProtocolError::InvalidMemberId(format!(
            "ID cannot be longer than {} characters",
            max_len
        )));
    }
    if id.contains(DELIMITER) {
        return Err(ProtocolError::InvalidMemberId(format!(
            "ID cannot contain '{}'",
            DELIMITER
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidMemberId(
            "ID cannot contain control characters".into(),
        ));
    }
    if id == SYSTEM_SENDER || id == SERVER_SENDER {
        return Err(ProtocolError::InvalidMemberId(format!("ID {} is reserved", id)));
    }
    Ok(())
}

/// Join handshake lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Server asks the client for its member id.
    SubmitId,
    /// Registration succeeded.
    Accepted { id: String, is_coordinator: bool },
    /// Registration rejected.
    Error(String),
}

impl HandshakeReply {
    pub fn to_line(&self) -> String {
        match self {
            Self::SubmitId => "SUBMITID".to_string(),
            Self::Accepted { id, is_coordinator } => {
                format!("ACCEPTED{d}{}{d}{}", id, is_coordinator, d = DELIMITER)
            }
            Self::Error(reason) => format!("ERROR{}{}", DELIMITER, reason),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if line == "SUBMITID" {
            return Ok(Self::SubmitId);
        }
        match line.split_once(DELIMITER) {
            Some(("ERROR", reason)) => return Ok(Self::Error(reason.to_string())),
            Some(("ACCEPTED", rest)) => {
                if let Some((id, flag)) = rest.rsplit_once(DELIMITER) {
                    let is_coordinator = flag.parse::<bool>().map_err(|_| {
                        ProtocolError::MalformedMessage(format!("bad coordinator flag '{}'", flag))
                    })?;
                    return Ok(Self::Accepted {
                        id: id.to_string(),
                        is_coordinator,
                    });
                }
            }
            _ => {}
        }
        Err(ProtocolError::MalformedMessage(format!(
            "not a handshake line: '{}'",
            line
        )))
    }
}

/// Slash commands understood by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/who` or `/list`
    Who,
    /// `/quit` or `/exit`
    Quit,
    /// `/help`
    Help,
    Unknown(String),
}

/// A line received from a joined member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Command(Command),
    /// `@name content`
    Private { recipient: String, content: String },
    /// A line that decoded as a wire message.
    Message(Message),
    /// Free text for everyone. Undecodable wire lines also land here.
    Broadcast(String),
}

impl ClientInput {
    /// Classify a raw line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        if line.trim().is_empty() {
            return None;
        }

        if line.starts_with('/') {
            let cmd = line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_lowercase();
            let command = match cmd.as_str() {
                "/who" | "/list" => Command::Who,
                "/quit" | "/exit" => Command::Quit,
                "/help" => Command::Help,
                _ => Command::Unknown(cmd),
            };
            return Some(Self::Command(command));
        }

        if let Some(rest) = line.strip_prefix('@') {
            if let Some((recipient, content)) = rest.split_once(' ') {
                if !recipient.is_empty() {
                    return Some(Self::Private {
                        recipient: recipient.to_string(),
                        content: content.to_string(),
                    });
                }
            }
        }

        if line.contains(DELIMITER) {
            if let Ok(msg) = decode(line) {
                return Some(Self::Message(msg));
            }
        }

        Some(Self::Broadcast(line.to_string()))
    }
}

pub const HELP_TEXT: &str = "Available commands:\n\
/who or /list - Show all group members\n\
/quit or /exit - Leave the group\n\
/help - Show this help\n\
@username message - Send private message\n\
Regular text - Broadcast to all members";
