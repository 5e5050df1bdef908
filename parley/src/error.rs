//! Error types for the runtime.

use std::path::PathBuf;

use thiserror::Error;

use crate::bot::BotType;

/// Errors surfaced by a [`ConfigWatcher`](crate::watcher::ConfigWatcher).
#[derive(Debug, Error)]
pub enum WatchError {
    /// No configuration file exists for the identifier. Callers keep their defaults.
    #[error("no configuration file for {bot_type}/{identifier}")]
    NotFound {
        bot_type: BotType,
        identifier: String,
    },

    #[error("already subscribing to {bot_type}/{identifier}")]
    AlreadySubscribing {
        bot_type: BotType,
        identifier: String,
    },

    /// The supervising loop has stopped; the watcher must not be used any more.
    #[error("config watcher is not running")]
    NotRunning,

    #[error("IO error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode '{}': {message}", path.display())]
    Decode { path: PathBuf, message: String },

    #[error("file watch error: {0}")]
    Notify(#[from] notify::Error),
}

impl WatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WatchError::NotFound { .. })
    }
}

/// Errors raised while building commands and scheduled tasks.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("insufficient build arguments: {0} is required")]
    InsufficientArguments(&'static str),

    #[error("invalid schedule `{expr}`: {message}")]
    InvalidSchedule { expr: String, message: String },

    #[error("{kind} '{identifier}' is already registered for {bot_type}")]
    Duplicate {
        kind: &'static str,
        bot_type: BotType,
        identifier: String,
    },

    #[error("invalid schedule `{expr}` in configuration: {message}")]
    ConfiguredSchedule { expr: String, message: String },

    #[error("configuration error: {0}")]
    Config(#[from] WatchError),
}

impl BuildError {
    /// Whether the error comes from a missing or malformed mandatory argument.
    ///
    /// These are programmer errors and abort startup; configuration errors do not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BuildError::Config(_) | BuildError::ConfiguredSchedule { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
}

/// Errors reported by a [`Bot`](crate::bot::Bot) through its
/// [`ErrorNotifier`](crate::bot::ErrorNotifier).
#[derive(Debug, Error)]
pub enum BotError {
    /// Logged; the bot keeps running.
    #[error("{0:#}")]
    Continuable(anyhow::Error),

    /// Alerts every registered alerter, then stops the bot's run loop.
    #[error("critical: {0:#}")]
    Critical(anyhow::Error),
}

impl BotError {
    pub fn continuable(err: impl Into<anyhow::Error>) -> Self {
        BotError::Continuable(err.into())
    }

    pub fn critical(err: impl Into<anyhow::Error>) -> Self {
        BotError::Critical(err.into())
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, BotError::Critical(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no bot is registered")]
    NoBots,

    #[error("bot type {0} is registered more than once")]
    DuplicateBot(BotType),

    #[error("failed to build commands or tasks: {0}")]
    Build(#[from] BuildError),

    #[error("config watcher error: {0}")]
    Watch(#[from] WatchError),
}
