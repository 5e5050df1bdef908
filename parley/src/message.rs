use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an [`Output`] should be delivered.
///
/// The value is opaque to the runtime; adapters decide what it means (a channel id,
/// a chat id, a user id...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(String);

impl Destination {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How the runner should treat an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    /// Ordinary message: routed to a stored continuation or a matching command.
    #[default]
    Message,
    /// Ask for the list of command instructions.
    Help,
    /// Drop the sender's pending conversation.
    Abort,
}

/// One inbound message produced by a bot.
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    sender_key: String,
    message: String,
    sent_at: DateTime<Utc>,
    reply_to: Destination,
    kind: InputKind,
}

impl Input {
    /// `sender_key` must be unique per platform and user; it keys the user context store.
    pub fn new(
        sender_key: impl Into<String>,
        message: impl Into<String>,
        reply_to: impl Into<Destination>,
    ) -> Self {
        Self {
            sender_key: sender_key.into(),
            message: message.into(),
            sent_at: Utc::now(),
            reply_to: reply_to.into(),
            kind: InputKind::Message,
        }
    }

    pub fn help(sender_key: impl Into<String>, reply_to: impl Into<Destination>) -> Self {
        Self::new(sender_key, "", reply_to).kind(InputKind::Help)
    }

    pub fn abort(sender_key: impl Into<String>, reply_to: impl Into<Destination>) -> Self {
        Self::new(sender_key, "", reply_to).kind(InputKind::Abort)
    }

    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }

    pub fn kind(mut self, kind: InputKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn reply_to(&self) -> &Destination {
        &self.reply_to
    }

    pub fn input_kind(&self) -> InputKind {
        self.kind
    }

    /// Returns the text after `prefix` when the first token of the message is exactly
    /// `prefix`.
    ///
    /// `".echo hi"` with prefix `".echo"` yields `Some("hi")`, `".echoes"` yields `None`.
    pub fn strip_prefix(&self, prefix: &str) -> Option<&str> {
        let trimmed = self.message.trim_start();
        let rest = trimmed.strip_prefix(prefix)?;
        if rest.is_empty() {
            return Some("");
        }
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        Some(rest.trim())
    }
}

/// One line of the help listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandHelp {
    pub identifier: String,
    pub instruction: String,
}

/// Payload of an [`Output`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutputContent {
    Text(String),
    Help(Vec<CommandHelp>),
    Json(serde_json::Value),
}

impl OutputContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutputContent::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for OutputContent {
    fn from(value: String) -> Self {
        OutputContent::Text(value)
    }
}

impl From<&str> for OutputContent {
    fn from(value: &str) -> Self {
        OutputContent::Text(value.to_string())
    }
}

impl From<serde_json::Value> for OutputContent {
    fn from(value: serde_json::Value) -> Self {
        OutputContent::Json(value)
    }
}

impl fmt::Display for OutputContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputContent::Text(text) => f.write_str(text),
            OutputContent::Help(helps) => {
                for (idx, help) in helps.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{}: {}", help.identifier, help.instruction)?;
                }
                Ok(())
            }
            OutputContent::Json(value) => write!(f, "{}", value),
        }
    }
}

/// A message the runtime asks a bot to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    destination: Destination,
    content: OutputContent,
}

impl Output {
    pub fn new(destination: impl Into<Destination>, content: impl Into<OutputContent>) -> Self {
        Self {
            destination: destination.into(),
            content: content.into(),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn content(&self) -> &OutputContent {
        &self.content
    }

    pub fn into_parts(self) -> (Destination, OutputContent) {
        (self.destination, self.content)
    }
}
