//! Built-in bots.

pub mod console;
pub mod mock;

pub use console::ConsoleBot;
pub use mock::{MockBot, MockHandle};
