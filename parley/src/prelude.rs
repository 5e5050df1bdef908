//! Convenience re-exports: `use parley::prelude::*;`

pub use crate::bot::{Alerter, Bot, BotType, ErrorNotifier};
pub use crate::command::{
    Command, CommandProps, CommandPropsBuilder, CommandResponse, Matcher, UserContext,
};
pub use crate::config::RunnerConfig;
pub use crate::context::Context;
pub use crate::error::{BotError, BuildError, PoolError, RunnerError, WatchError};
pub use crate::message::{CommandHelp, Destination, Input, InputKind, Output, OutputContent};
pub use crate::registry::Registry;
pub use crate::runner::{Runner, RunnerState, Status, StatusHandle};
pub use crate::task::{Schedule, ScheduledTask, TaskConfig, TaskProps, TaskResult};
pub use crate::watcher::{ConfigWatcher, FileWatcher, NullWatcher};

pub use async_trait::async_trait;
