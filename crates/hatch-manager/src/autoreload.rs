//! Source watching for hot reload.
//!
//! One background task owns the filesystem watcher. Caches subscribe the
//! source directories of their live entries; file events under a directory
//! are debounced per (directory, cache) and then fire one
//! [`ReloadTarget::reload_directory`] call.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Weak;
use std::time::Duration;

use hatch_core::CacheKey;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::ManagerError;

/// Directory names that never trigger a reload, wherever they appear.
const IGNORED_DIRS: &[&str] = &["__pycache__", "target", "node_modules", "venv"];

/// Something that can rebuild everything it loaded from a directory.
pub trait ReloadTarget: Send + Sync {
    fn reload_directory<'a>(&'a self, dir: &'a Path) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Trailing-edge debounce: every event pushes its key's deadline out by the
/// window, and a key fires once its deadline passes with no new events.
///
/// A key is idle (absent), pending (has a deadline) or firing (returned by
/// [`poll`](Debouncer::poll) and removed).
#[derive(Debug)]
pub struct Debouncer<K> {
    pending: HashMap<K, Instant>,
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> Debouncer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, key: K, now: Instant, window: Duration) {
        self.pending.insert(key, now + window);
    }

    /// Keys whose window elapsed by `now`. They return to idle.
    pub fn poll(&mut self, now: Instant) -> Vec<K> {
        let due: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.pending.remove(key);
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Creates, writes, removals and renames. Access and metadata-only events
/// are ignored.
pub fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    )
}

/// Whether a change to `path` under `root` should trigger a reload.
///
/// Hidden files and directories and build or dependency directories are
/// ignored. An empty extension list accepts every file.
pub fn should_trigger(path: &Path, root: &Path, extensions: &[String]) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    for component in relative.components() {
        if let Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_ref()) {
                return false;
            }
        }
    }
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|w| w.eq_ignore_ascii_case(ext)))
}

/// One cache's interest in a watched directory.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Name of the subscribing cache; debounced separately from other caches.
    pub target: String,
    pub directory: PathBuf,
    pub key: CacheKey,
    pub extensions: Vec<String>,
    pub debounce: Duration,
}

struct TargetInterest {
    reload: Weak<dyn ReloadTarget>,
    extensions: Vec<String>,
    keys: HashSet<CacheKey>,
}

/// A watched directory and the cache keys rooted in it.
struct WatchSubscription {
    directory: PathBuf,
    debounce_window: Duration,
    targets: HashMap<String, TargetInterest>,
}

enum WatchCommand {
    Subscribe(Subscription, Weak<dyn ReloadTarget>),
    Unsubscribe {
        target: String,
        directory: PathBuf,
        key: CacheKey,
    },
    Changed(PathBuf),
    Shutdown,
}

/// Cheap handle to the autoreloader task. The task stops when
/// [`shutdown`](AutoreloadHandle::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct AutoreloadHandle {
    commands: mpsc::UnboundedSender<WatchCommand>,
}

impl std::fmt::Debug for AutoreloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoreloadHandle")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl AutoreloadHandle {
    /// Start the watcher and its task on the current runtime.
    pub fn spawn() -> Result<Self, ManagerError> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = event_tx.send(event);
        })?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let autoreloader = Autoreloader {
            watcher,
            subscriptions: HashMap::new(),
            debouncer: Debouncer::new(),
        };
        tokio::spawn(autoreloader.run(command_rx, events));
        tracing::info!("Autoreloader started");
        Ok(Self { commands })
    }

    pub fn subscribe(&self, subscription: Subscription, reload: Weak<dyn ReloadTarget>) {
        self.send(WatchCommand::Subscribe(subscription, reload));
    }

    pub fn unsubscribe(&self, target: &str, directory: &Path, key: &CacheKey) {
        self.send(WatchCommand::Unsubscribe {
            target: target.to_string(),
            directory: directory.to_path_buf(),
            key: key.clone(),
        });
    }

    /// Treat `path` as changed, as if the watcher had reported it.
    pub fn notify_changed(&self, path: impl Into<PathBuf>) {
        self.send(WatchCommand::Changed(path.into()));
    }

    pub fn shutdown(&self) {
        self.send(WatchCommand::Shutdown);
    }

    fn send(&self, command: WatchCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Autoreloader already stopped");
        }
    }
}

struct Autoreloader {
    watcher: RecommendedWatcher,
    subscriptions: HashMap<PathBuf, WatchSubscription>,
    debouncer: Debouncer<(PathBuf, String)>,
}

impl Autoreloader {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<WatchCommand>,
        mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    ) {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(WatchCommand::Shutdown) => break,
                    Some(command) => self.apply(command),
                },
                Some(event) = events.recv() => self.on_event(event),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire(Instant::now());
                }
            }
        }
        tracing::info!("Autoreloader stopped");
    }

    fn apply(&mut self, command: WatchCommand) {
        match command {
            WatchCommand::Subscribe(subscription, reload) => self.subscribe(subscription, reload),
            WatchCommand::Unsubscribe {
                target,
                directory,
                key,
            } => self.unsubscribe(&target, &directory, &key),
            WatchCommand::Changed(path) => self.changed(&path),
            WatchCommand::Shutdown => {}
        }
    }

    fn subscribe(&mut self, subscription: Subscription, reload: Weak<dyn ReloadTarget>) {
        let Subscription {
            target,
            directory,
            key,
            extensions,
            debounce,
        } = subscription;

        let watched = self.subscriptions.entry(directory.clone()).or_insert_with(|| {
            match self.watcher.watch(&directory, RecursiveMode::Recursive) {
                Ok(()) => tracing::info!(dir = %directory.display(), "Watching for source changes"),
                Err(e) => tracing::warn!(dir = %directory.display(), "Failed to watch directory: {e}"),
            }
            WatchSubscription {
                directory: directory.clone(),
                debounce_window: debounce,
                targets: HashMap::new(),
            }
        });
        let interest = watched
            .targets
            .entry(target)
            .or_insert_with(|| TargetInterest {
                reload,
                extensions,
                keys: HashSet::new(),
            });
        interest.keys.insert(key);
    }

    fn unsubscribe(&mut self, target: &str, directory: &Path, key: &CacheKey) {
        let Some(watched) = self.subscriptions.get_mut(directory) else {
            return;
        };
        if let Some(interest) = watched.targets.get_mut(target) {
            interest.keys.remove(key);
            if interest.keys.is_empty() {
                watched.targets.remove(target);
            }
        }
        if watched.targets.is_empty() {
            self.subscriptions.remove(directory);
            if let Err(e) = self.watcher.unwatch(directory) {
                tracing::debug!(dir = %directory.display(), "Failed to unwatch directory: {e}");
            }
            tracing::info!(dir = %directory.display(), "Stopped watching");
        }
    }

    fn on_event(&mut self, event: notify::Result<Event>) {
        match event {
            Ok(event) if is_relevant(&event.kind) => {
                for path in &event.paths {
                    self.changed(path);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("File watch error: {e}"),
        }
    }

    fn changed(&mut self, path: &Path) {
        let now = Instant::now();
        for watched in self.subscriptions.values() {
            if !path.starts_with(&watched.directory) {
                continue;
            }
            for (target, interest) in &watched.targets {
                if should_trigger(path, &watched.directory, &interest.extensions) {
                    tracing::debug!(path = %path.display(), target = %target, "Source change");
                    self.debouncer.on_event(
                        (watched.directory.clone(), target.clone()),
                        now,
                        watched.debounce_window,
                    );
                }
            }
        }
    }

    fn fire(&mut self, now: Instant) {
        for (directory, target) in self.debouncer.poll(now) {
            let reload = self
                .subscriptions
                .get(&directory)
                .and_then(|watched| watched.targets.get(&target))
                .and_then(|interest| interest.reload.upgrade());
            let Some(reload) = reload else {
                continue;
            };
            tracing::info!(dir = %directory.display(), target = %target, "Reloading after source change");
            tokio::spawn(async move {
                reload.reload_directory(&directory).await;
            });
        }
    }
}
