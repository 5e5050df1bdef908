//! Registered command and task templates, and the live instances built from them.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bot::BotType;
use crate::command::{Command, CommandProps, CommandSet};
use crate::error::BuildError;
use crate::scheduler::TaskKey;
use crate::task::{ScheduledTask, TaskProps};
use crate::watcher::{ConfigWatcher, WatchCallback};

/// Explicit registry handed to the runner.
///
/// Templates are added up front with [`add_command`](Self::add_command) and
/// [`add_task`](Self::add_task). [`build_all`](Self::build_all) then builds every live
/// instance once and subscribes configurable templates to their configuration file;
/// a change rebuilds a fresh instance and swaps it in.
#[derive(Default)]
pub struct Registry {
    commands: Vec<CommandProps>,
    tasks: Vec<TaskProps>,
    live_commands: DashMap<BotType, Arc<CommandSet>>,
    live_tasks: DashMap<TaskKey, Arc<ScheduledTask>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, props: CommandProps) -> Result<(), BuildError> {
        if self
            .commands
            .iter()
            .any(|p| p.bot_type() == props.bot_type() && p.identifier() == props.identifier())
        {
            return Err(BuildError::Duplicate {
                kind: "command",
                bot_type: props.bot_type().clone(),
                identifier: props.identifier().to_string(),
            });
        }
        self.commands.push(props);
        Ok(())
    }

    pub fn add_task(&mut self, props: TaskProps) -> Result<(), BuildError> {
        if self
            .tasks
            .iter()
            .any(|p| p.bot_type() == props.bot_type() && p.identifier() == props.identifier())
        {
            return Err(BuildError::Duplicate {
                kind: "task",
                bot_type: props.bot_type().clone(),
                identifier: props.identifier().to_string(),
            });
        }
        self.tasks.push(props);
        Ok(())
    }

    /// Bot types that have at least one command or task registered.
    pub fn bot_types(&self) -> Vec<BotType> {
        let mut types: Vec<BotType> = self
            .commands
            .iter()
            .map(|p| p.bot_type().clone())
            .chain(self.tasks.iter().map(|p| p.bot_type().clone()))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// The live command set of `bot_type`; empty when nothing is registered for it.
    pub fn command_set(&self, bot_type: &BotType) -> Arc<CommandSet> {
        self.live_commands
            .entry(bot_type.clone())
            .or_insert_with(|| Arc::new(CommandSet::new(bot_type.clone())))
            .clone()
    }

    pub fn task(&self, key: &TaskKey) -> Option<Arc<ScheduledTask>> {
        self.live_tasks.get(key).map(|t| t.value().clone())
    }

    pub fn live_tasks(&self) -> Vec<Arc<ScheduledTask>> {
        self.live_tasks.iter().map(|t| t.value().clone()).collect()
    }

    /// Builds every command and task, and subscribes configurable ones to changes.
    ///
    /// Built tasks, initially and after every rebuild, are sent to `task_tx` for
    /// scheduling. Only missing or malformed mandatory arguments fail the call; an
    /// unreadable configuration file is logged and the template stays subscribed so a
    /// fixed file brings it up.
    pub async fn build_all(
        self: &Arc<Self>,
        watcher: Arc<dyn ConfigWatcher>,
        task_tx: mpsc::UnboundedSender<Arc<ScheduledTask>>,
    ) -> Result<(), BuildError> {
        for (idx, props) in self.commands.iter().enumerate() {
            match props.build(watcher.as_ref()) {
                Ok(command) => self.place_command(props.bot_type(), command),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    bot_type = %props.bot_type(),
                    command = props.identifier(),
                    "command not built: {}", e
                ),
            }

            if props.is_configurable() {
                let callback = command_rebuilder(Arc::downgrade(self), idx, watcher.clone());
                if let Err(e) = watcher
                    .watch(props.bot_type(), props.identifier(), callback)
                    .await
                {
                    warn!(
                        bot_type = %props.bot_type(),
                        command = props.identifier(),
                        "config changes will not be picked up: {}", e
                    );
                }
            }
        }

        for (idx, props) in self.tasks.iter().enumerate() {
            match props.build(watcher.as_ref()) {
                Ok(task) => self.publish_task(task, &task_tx),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    bot_type = %props.bot_type(),
                    task = props.identifier(),
                    "task not built: {}", e
                ),
            }

            if props.is_configurable() {
                let callback =
                    task_rebuilder(Arc::downgrade(self), idx, watcher.clone(), task_tx.clone());
                if let Err(e) = watcher
                    .watch(props.bot_type(), props.identifier(), callback)
                    .await
                {
                    warn!(
                        bot_type = %props.bot_type(),
                        task = props.identifier(),
                        "config changes will not be picked up: {}", e
                    );
                }
            }
        }

        info!(
            commands = self.commands.len(),
            tasks = self.tasks.len(),
            "registry built"
        );
        Ok(())
    }

    /// Rebuilds the command at `idx`. A failed build keeps the previous instance live.
    pub fn rebuild_command(&self, idx: usize, watcher: &dyn ConfigWatcher) {
        let Some(props) = self.commands.get(idx) else {
            return;
        };

        match props.build(watcher) {
            Ok(command) => {
                self.place_command(props.bot_type(), command);
                info!(
                    bot_type = %props.bot_type(),
                    command = props.identifier(),
                    "command rebuilt"
                );
            }
            Err(e) => warn!(
                bot_type = %props.bot_type(),
                command = props.identifier(),
                "rebuild failed, keeping previous instance: {}", e
            ),
        }
    }

    /// Rebuilds the task at `idx` and hands it to `task_tx` for rescheduling.
    pub fn rebuild_task(
        &self,
        idx: usize,
        watcher: &dyn ConfigWatcher,
        task_tx: &mpsc::UnboundedSender<Arc<ScheduledTask>>,
    ) {
        let Some(props) = self.tasks.get(idx) else {
            return;
        };

        match props.build(watcher) {
            Ok(task) => {
                self.publish_task(task, task_tx);
                info!(
                    bot_type = %props.bot_type(),
                    task = props.identifier(),
                    "task rebuilt"
                );
            }
            Err(e) => warn!(
                bot_type = %props.bot_type(),
                task = props.identifier(),
                "rebuild failed, keeping previous instance: {}", e
            ),
        }
    }

    /// Swaps `command` into its bot type's set, in registration order.
    fn place_command(&self, bot_type: &BotType, command: Arc<dyn Command>) {
        let registered: Vec<&str> = self
            .commands
            .iter()
            .filter(|p| p.bot_type() == bot_type)
            .map(|p| p.identifier())
            .collect();

        self.command_set(bot_type).update(|current| {
            registered
                .iter()
                .filter_map(|id| {
                    if *id == command.identifier() {
                        Some(command.clone())
                    } else {
                        current.iter().find(|c| c.identifier() == *id).cloned()
                    }
                })
                .collect()
        });
    }

    fn publish_task(
        &self,
        task: Arc<ScheduledTask>,
        task_tx: &mpsc::UnboundedSender<Arc<ScheduledTask>>,
    ) {
        self.live_tasks.insert(TaskKey::of(&task), task.clone());
        if task_tx.send(task).is_err() {
            warn!("task scheduler is gone, task will not run");
        }
    }
}

fn command_rebuilder(
    registry: Weak<Registry>,
    idx: usize,
    watcher: Arc<dyn ConfigWatcher>,
) -> WatchCallback {
    Arc::new(move || {
        if let Some(registry) = registry.upgrade() {
            registry.rebuild_command(idx, watcher.as_ref());
        }
    })
}

fn task_rebuilder(
    registry: Weak<Registry>,
    idx: usize,
    watcher: Arc<dyn ConfigWatcher>,
    task_tx: mpsc::UnboundedSender<Arc<ScheduledTask>>,
) -> WatchCallback {
    Arc::new(move || {
        if let Some(registry) = registry.upgrade() {
            registry.rebuild_task(idx, watcher.as_ref(), &task_tx);
        }
    })
}
