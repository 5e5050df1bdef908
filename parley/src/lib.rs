//! Parley
//!
//! A runtime that connects chat-service bots to commands and scheduled tasks: inputs
//! are routed onto a bounded worker pool, multi-turn conversations are kept per sender,
//! and command configuration is reloaded from disk while the runner is live.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod bot;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod observability;
pub mod prelude;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod user_context;
pub mod watcher;
pub mod worker;

pub use crate::registry::Registry;
pub use crate::runner::{Runner, RunnerBuilder};

// Re-export async_trait for Bot and Command impls
pub use async_trait::async_trait;
