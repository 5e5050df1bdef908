//! Configuration files and change notification.
//!
//! Files live at `<base>/<lowercased bot type>/<identifier>.{yaml,yml,json}`. The
//! [`FileWatcher`] owns a single supervising loop that holds the OS-level watch; every
//! subscription goes through it, and each directory is watched once no matter how many
//! identifiers subscribe to it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bot::BotType;
use crate::config::merge_values;
use crate::error::WatchError;

/// Invoked after the subscribed identifier's file changed.
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Formats and destinations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Supported extensions, in lookup priority order.
    pub const EXTENSIONS: [(&'static str, ConfigFormat); 3] = [
        ("yaml", ConfigFormat::Yaml),
        ("yml", ConfigFormat::Yaml),
        ("json", ConfigFormat::Json),
    ];

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::EXTENSIONS
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
            .map(|(_, format)| *format)
    }

    fn decode(self, content: &str) -> Result<serde_json::Value, String> {
        match self {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        }
    }
}

/// A value a configuration file can be decoded into.
///
/// Decoding overlays the file on the current value: keys missing from the file keep what
/// the destination already held. On error the destination is left untouched.
pub trait ConfigDestination: Send {
    fn overlay(&mut self, value: serde_json::Value) -> Result<(), serde_json::Error>;
}

impl<T> ConfigDestination for T
where
    T: Serialize + DeserializeOwned + Send,
{
    fn overlay(&mut self, value: serde_json::Value) -> Result<(), serde_json::Error> {
        if value.is_null() {
            return Ok(());
        }
        let mut base = serde_json::to_value(&*self)?;
        merge_values(&mut base, &value);
        *self = serde_json::from_value(base)?;
        Ok(())
    }
}

/// Decodes the file at `path` into `dest`.
pub fn read_config_file(path: &Path, dest: &mut dyn ConfigDestination) -> Result<(), WatchError> {
    let format = ConfigFormat::from_path(path).ok_or_else(|| WatchError::Decode {
        path: path.to_path_buf(),
        message: "unsupported file extension".to_string(),
    })?;

    let content = std::fs::read_to_string(path).map_err(|source| WatchError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(());
    }

    let decode_err = |message: String| WatchError::Decode {
        path: path.to_path_buf(),
        message,
    };
    let value = format.decode(&content).map_err(decode_err)?;
    dest.overlay(value).map_err(|e| decode_err(e.to_string()))
}

// ============================================================================
// ConfigWatcher trait
// ============================================================================

/// Read and change-notification surface used by the registry.
#[async_trait]
pub trait ConfigWatcher: Send + Sync + 'static {
    /// Decodes the configuration of `bot_type`/`identifier` into `dest`.
    ///
    /// Returns [`WatchError::NotFound`] when no file exists; `dest` is untouched then.
    fn read(
        &self,
        bot_type: &BotType,
        identifier: &str,
        dest: &mut dyn ConfigDestination,
    ) -> Result<(), WatchError>;

    async fn watch(
        &self,
        bot_type: &BotType,
        identifier: &str,
        callback: WatchCallback,
    ) -> Result<(), WatchError>;

    /// Drops every subscription of `bot_type`.
    async fn unwatch(&self, bot_type: &BotType) -> Result<(), WatchError>;
}

/// Used when no configuration directory is set: nothing is found, nothing changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWatcher;

#[async_trait]
impl ConfigWatcher for NullWatcher {
    fn read(
        &self,
        bot_type: &BotType,
        identifier: &str,
        _dest: &mut dyn ConfigDestination,
    ) -> Result<(), WatchError> {
        Err(WatchError::NotFound {
            bot_type: bot_type.clone(),
            identifier: identifier.to_string(),
        })
    }

    async fn watch(
        &self,
        _bot_type: &BotType,
        _identifier: &str,
        _callback: WatchCallback,
    ) -> Result<(), WatchError> {
        Ok(())
    }

    async fn unwatch(&self, _bot_type: &BotType) -> Result<(), WatchError> {
        Ok(())
    }
}

// ============================================================================
// File watcher
// ============================================================================

/// The OS-level watch primitive.
pub(crate) trait FsBackend: Send + 'static {
    fn add_watch(&mut self, dir: &Path) -> Result<(), notify::Error>;
    fn remove_watch(&mut self, dir: &Path) -> Result<(), notify::Error>;
}

struct NotifyBackend {
    watcher: RecommendedWatcher,
}

impl FsBackend for NotifyBackend {
    fn add_watch(&mut self, dir: &Path) -> Result<(), notify::Error> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)
    }

    fn remove_watch(&mut self, dir: &Path) -> Result<(), notify::Error> {
        self.watcher.unwatch(dir)
    }
}

pub(crate) type FsEvent = Result<notify::Event, notify::Error>;

type Reply = oneshot::Sender<Result<(), WatchError>>;

struct SubscribeRequest {
    dir: PathBuf,
    bot_type: BotType,
    identifier: String,
    callback: WatchCallback,
    reply: Reply,
}

struct UnsubscribeRequest {
    dir: PathBuf,
    bot_type: BotType,
    /// `None` drops every subscription of the bot type.
    identifier: Option<String>,
    reply: Reply,
}

/// Watches `<base>/<bot type>/` directories and notifies per-identifier subscribers.
#[derive(Clone)]
pub struct FileWatcher {
    base_dir: PathBuf,
    token: CancellationToken,
    subscribe_tx: mpsc::Sender<SubscribeRequest>,
    unsubscribe_tx: mpsc::Sender<UnsubscribeRequest>,
}

impl FileWatcher {
    /// Starts the supervising loop. It stops, removing every OS-level watch, once
    /// `token` is cancelled; the returned handle resolves after that cleanup.
    pub fn spawn(
        token: CancellationToken,
        base_dir: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Result<(Self, JoinHandle<()>), WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: FsEvent| {
            let _ = event_tx.send(res);
        })?;

        Self::spawn_with_backend(
            token,
            base_dir.into(),
            debounce,
            NotifyBackend { watcher },
            event_rx,
        )
    }

    pub(crate) fn spawn_with_backend<B: FsBackend>(
        token: CancellationToken,
        base_dir: PathBuf,
        debounce: Duration,
        backend: B,
        events: mpsc::UnboundedReceiver<FsEvent>,
    ) -> Result<(Self, JoinHandle<()>), WatchError> {
        let base_dir = resolve_base_dir(&base_dir)?;
        let (subscribe_tx, subscribe_rx) = mpsc::channel(16);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(16);

        let supervisor = Supervisor {
            backend,
            subscriptions: HashMap::new(),
            pending: HashMap::new(),
            debounce,
        };
        let handle = tokio::spawn(supervisor.run(
            token.clone(),
            subscribe_rx,
            unsubscribe_rx,
            events,
        ));

        info!(base_dir = %base_dir.display(), "config watcher started");

        Ok((
            Self {
                base_dir,
                token,
                subscribe_tx,
                unsubscribe_tx,
            },
            handle,
        ))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding the configuration files of `bot_type`.
    pub fn dir_for(&self, bot_type: &BotType) -> PathBuf {
        self.base_dir.join(bot_type.dir_name())
    }

    /// Location of the configuration file for `bot_type`/`identifier`, if any.
    pub fn find_file(&self, bot_type: &BotType, identifier: &str) -> Option<PathBuf> {
        let dir = self.dir_for(bot_type);
        ConfigFormat::EXTENSIONS
            .iter()
            .map(|(ext, _)| dir.join(format!("{}.{}", identifier, ext)))
            .find(|path| path.is_file())
    }

    pub async fn subscribe(
        &self,
        bot_type: &BotType,
        identifier: &str,
        callback: WatchCallback,
    ) -> Result<(), WatchError> {
        let (reply, rx) = oneshot::channel();
        let request = SubscribeRequest {
            dir: self.dir_for(bot_type),
            bot_type: bot_type.clone(),
            identifier: identifier.to_string(),
            callback,
            reply,
        };
        self.request(&self.subscribe_tx, request, rx).await
    }

    /// Drops one identifier's subscription.
    pub async fn unsubscribe(&self, bot_type: &BotType, identifier: &str) -> Result<(), WatchError> {
        let (reply, rx) = oneshot::channel();
        let request = UnsubscribeRequest {
            dir: self.dir_for(bot_type),
            bot_type: bot_type.clone(),
            identifier: Some(identifier.to_string()),
            reply,
        };
        self.request(&self.unsubscribe_tx, request, rx).await
    }

    async fn request<T>(
        &self,
        tx: &mpsc::Sender<T>,
        request: T,
        rx: oneshot::Receiver<Result<(), WatchError>>,
    ) -> Result<(), WatchError> {
        if self.token.is_cancelled() {
            return Err(WatchError::NotRunning);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(WatchError::NotRunning),
            sent = tx.send(request) => sent.map_err(|_| WatchError::NotRunning)?,
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(WatchError::NotRunning),
            res = rx => res.unwrap_or(Err(WatchError::NotRunning)),
        }
    }
}

#[async_trait]
impl ConfigWatcher for FileWatcher {
    fn read(
        &self,
        bot_type: &BotType,
        identifier: &str,
        dest: &mut dyn ConfigDestination,
    ) -> Result<(), WatchError> {
        match self.find_file(bot_type, identifier) {
            Some(path) => read_config_file(&path, dest),
            None => Err(WatchError::NotFound {
                bot_type: bot_type.clone(),
                identifier: identifier.to_string(),
            }),
        }
    }

    async fn watch(
        &self,
        bot_type: &BotType,
        identifier: &str,
        callback: WatchCallback,
    ) -> Result<(), WatchError> {
        self.subscribe(bot_type, identifier, callback).await
    }

    async fn unwatch(&self, bot_type: &BotType) -> Result<(), WatchError> {
        let (reply, rx) = oneshot::channel();
        let request = UnsubscribeRequest {
            dir: self.dir_for(bot_type),
            bot_type: bot_type.clone(),
            identifier: None,
            reply,
        };
        self.request(&self.unsubscribe_tx, request, rx).await
    }
}

fn resolve_base_dir(base_dir: &Path) -> Result<PathBuf, WatchError> {
    match base_dir.canonicalize() {
        Ok(dir) => Ok(dir),
        Err(_) => std::path::absolute(base_dir).map_err(|source| WatchError::Io {
            path: base_dir.to_path_buf(),
            source,
        }),
    }
}

// ============================================================================
// Supervising loop
// ============================================================================

struct Subscription {
    bot_type: BotType,
    identifier: String,
    callback: WatchCallback,
}

struct Supervisor<B> {
    backend: B,
    /// Subscriptions per watched directory. A directory is present iff it is watched.
    subscriptions: HashMap<PathBuf, Vec<Subscription>>,
    /// Changed files waiting for their debounce deadline.
    pending: HashMap<PathBuf, Instant>,
    debounce: Duration,
}

impl<B: FsBackend> Supervisor<B> {
    async fn run(
        mut self,
        token: CancellationToken,
        mut subscribe_rx: mpsc::Receiver<SubscribeRequest>,
        mut unsubscribe_rx: mpsc::Receiver<UnsubscribeRequest>,
        mut events: mpsc::UnboundedReceiver<FsEvent>,
    ) {
        loop {
            let next_due = self.pending.values().min().copied();

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(req) = subscribe_rx.recv() => {
                    let res = self.subscribe(req.dir, req.bot_type, req.identifier, req.callback);
                    let _ = req.reply.send(res);
                }
                Some(req) = unsubscribe_rx.recv() => {
                    let res = self.unsubscribe(&req.dir, &req.bot_type, req.identifier.as_deref());
                    let _ = req.reply.send(res);
                }
                Some(event) = events.recv() => self.on_event(event),
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.flush_due(Instant::now());
                }
            }
        }

        self.shutdown();
    }

    fn subscribe(
        &mut self,
        dir: PathBuf,
        bot_type: BotType,
        identifier: String,
        callback: WatchCallback,
    ) -> Result<(), WatchError> {
        if let Some(subs) = self.subscriptions.get(&dir) {
            if subs.iter().any(|s| s.identifier == identifier) {
                return Err(WatchError::AlreadySubscribing {
                    bot_type,
                    identifier,
                });
            }
        } else {
            self.backend.add_watch(&dir)?;
            debug!(dir = %dir.display(), "watching directory");
        }

        debug!(bot_type = %bot_type, identifier = %identifier, "subscribed to config changes");
        self.subscriptions.entry(dir).or_default().push(Subscription {
            bot_type,
            identifier,
            callback,
        });
        Ok(())
    }

    fn unsubscribe(
        &mut self,
        dir: &Path,
        bot_type: &BotType,
        identifier: Option<&str>,
    ) -> Result<(), WatchError> {
        let Some(subs) = self.subscriptions.get_mut(dir) else {
            return match identifier {
                Some(identifier) => Err(WatchError::NotFound {
                    bot_type: bot_type.clone(),
                    identifier: identifier.to_string(),
                }),
                None => Ok(()),
            };
        };

        match identifier {
            Some(identifier) => {
                let before = subs.len();
                subs.retain(|s| s.identifier != identifier);
                if subs.len() == before {
                    return Err(WatchError::NotFound {
                        bot_type: bot_type.clone(),
                        identifier: identifier.to_string(),
                    });
                }
            }
            None => subs.retain(|s| &s.bot_type != bot_type),
        }

        if subs.is_empty() {
            self.subscriptions.remove(dir);
            self.pending.retain(|path, _| path.parent() != Some(dir));
            self.backend.remove_watch(dir)?;
            debug!(dir = %dir.display(), "stopped watching directory");
        }
        Ok(())
    }

    fn on_event(&mut self, event: FsEvent) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("file watch error: {}", e);
                return;
            }
        };

        let deadline = Instant::now() + self.debounce;
        for path in written_paths(event) {
            let watched = path
                .parent()
                .is_some_and(|dir| self.subscriptions.contains_key(dir));
            if watched && ConfigFormat::from_path(&path).is_some() {
                self.pending.insert(path, deadline);
            }
        }
    }

    fn flush_due(&mut self, now: Instant) {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            self.pending.remove(&path);
            self.notify(&path);
        }
    }

    fn notify(&self, path: &Path) {
        let (Some(dir), Some(identifier)) = (path.parent(), path.file_stem().and_then(|s| s.to_str()))
        else {
            return;
        };
        let Some(subs) = self.subscriptions.get(dir) else {
            return;
        };

        for sub in subs.iter().filter(|s| s.identifier == identifier) {
            info!(
                bot_type = %sub.bot_type,
                identifier = %sub.identifier,
                path = %path.display(),
                "config file changed"
            );
            let callback = sub.callback.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(
                    bot_type = %sub.bot_type,
                    identifier = %sub.identifier,
                    "config change callback panicked"
                );
            }
        }
    }

    fn shutdown(&mut self) {
        for dir in self.subscriptions.keys() {
            if let Err(e) = self.backend.remove_watch(dir) {
                warn!(dir = %dir.display(), "failed to remove watch: {}", e);
            }
        }
        self.subscriptions.clear();
        self.pending.clear();
        info!("config watcher stopped");
    }
}

/// Paths whose content may have changed. Metadata changes and files moved away are
/// ignored so neither triggers a rebuild.
fn written_paths(event: notify::Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Name(RenameMode::To)) => {
            event.paths
        }
        // `[from, to]`
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).collect()
        }
        // Direction unknown: only a path that is still there was renamed into place.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.into_iter().filter(|p| p.exists()).collect()
        }
        _ => Vec::new(),
    }
}
