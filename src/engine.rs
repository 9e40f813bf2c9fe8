// SPDX-License-Identifier: Apache-2.0

//! The engine wires the position store, the publisher queue, the watcher,
//! and the per-file tailers together: startup recovery, the event-dispatch
//! loop, and the flush/reap timers. All tracking state changes flow through
//! here, so the tailer registry has a single writer.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pattern::PatternRegistry;
use crate::position::{inode_of, PositionError, PositionStore, TrackedFile};
use crate::publisher::BatchSender;
use crate::reaper::Reaper;
use crate::tailer::{spawn_tailer, DrainLimits, TailerHandle};
use crate::watcher::{FileEvent, FileEventKind, NativeWatcher, WatcherError};

/// Fixed cadence of the reaper sweep.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("watcher event stream closed unexpectedly")]
    EventStreamClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Whether pre-existing files discovered by the startup scan begin at
    /// offset 0 (true) or at their current size (false)
    pub from_beginning: bool,
    pub limits: DrainLimits,
}

pub struct Engine {
    registry: Arc<PatternRegistry>,
    store: Arc<PositionStore>,
    queue: BatchSender,
    settings: EngineSettings,
    tailers: HashMap<PathBuf, TailerHandle>,
}

impl Engine {
    pub fn new(
        registry: Arc<PatternRegistry>,
        store: Arc<PositionStore>,
        queue: BatchSender,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            settings,
            tailers: HashMap::new(),
        }
    }

    /// Recover state, bring up tailers, then dispatch watcher events until
    /// cancelled. On return every tailer has exited and the position file
    /// reflects the final offsets.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), EngineError> {
        let accepted = self.store.load(&self.registry)?;
        info!(records = accepted, "Restored position records");

        let (mut watcher, mut events) = NativeWatcher::new()?;
        info!(backend = watcher.backend_name(), "File watcher initialized");

        for dir in self.registry.directories() {
            if let Err(e) = watcher.watch(&dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to watch directory");
            } else {
                debug!(dir = %dir.display(), "Watching directory");
            }
        }

        self.scan_directories();

        for entry in self.store.snapshot() {
            self.start_tailer(entry);
        }

        // make the position file reflect the post-recovery state
        if let Err(e) = self.store.flush() {
            error!(error = %e, "Failed to flush position file after recovery");
        }

        info!(tracked = self.store.len(), "Tailing started");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break Err(EngineError::EventStreamClosed),
                },
            }
        };

        self.shutdown().await;
        result
    }

    /// Enumerate configured directories for matching files that are not yet
    /// tracked. Recovered records win; scanned paths start at 0 or current
    /// size per `from_beginning`.
    fn scan_directories(&self) {
        for dir in self.registry.directories() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Cannot scan directory");
                    continue;
                }
            };

            for dent in entries.flatten() {
                let path = dent.path();
                let Some(spec) = self.registry.match_path(&path) else {
                    continue;
                };
                let Ok(meta) = dent.metadata() else {
                    continue;
                };
                if !meta.is_file() || self.store.contains(&path) {
                    continue;
                }

                let offset = if self.settings.from_beginning {
                    0
                } else {
                    meta.len()
                };

                debug!(
                    path = %path.display(),
                    offset,
                    topic = %spec.topic,
                    "Discovered existing file"
                );
                if let Err(e) = self.store.upsert(path, spec, inode_of(&meta), offset) {
                    error!(error = %e, "Failed to track discovered file");
                }
            }
        }
    }

    fn start_tailer(&mut self, entry: Arc<TrackedFile>) {
        if let Some(handle) = self.tailers.get(&entry.path) {
            if !handle.is_finished() {
                return;
            }
            // the previous tailer exited on its own (e.g. a read error);
            // clear the stale handle so the path can be tailed again
            self.tailers.remove(&entry.path);
        }
        let handle = spawn_tailer(
            entry.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.settings.limits,
        );
        self.tailers.insert(entry.path.clone(), handle);
    }

    async fn handle_event(&mut self, event: FileEvent) {
        match event.kind {
            FileEventKind::Create => self.handle_create(event.path).await,
            FileEventKind::Remove => self.handle_remove(event.path).await,
            FileEventKind::Modify => self.handle_modify(event.path).await,
            FileEventKind::Other => {}
        }
    }

    /// A file appeared in a watched directory. Newly appearing files always
    /// start at offset 0, whatever `from_beginning` says.
    async fn handle_create(&mut self, path: PathBuf) {
        if let Some(entry) = self.store.get(&path) {
            // already tracked (e.g. scanned moments ago); make sure a live
            // tailer is draining it, then treat the event as a wake
            self.start_tailer(entry);
            if let Some(handle) = self.tailers.get(&path) {
                handle.wake();
            }
            return;
        }
        let Some(spec) = self.registry.match_path(&path) else {
            return;
        };
        let meta = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            _ => return,
        };

        info!(path = %path.display(), topic = %spec.topic, "Tracking new file");
        match self.store.upsert(path, spec, inode_of(&meta), 0) {
            Ok(entry) => self.start_tailer(entry),
            Err(e) => error!(error = %e, "Failed to track new file"),
        }
    }

    /// A tracked file disappeared. Cancel its tailer, wait for it to
    /// observe the cancel, then drop the entry.
    async fn handle_remove(&mut self, path: PathBuf) {
        if let Some(handle) = self.tailers.remove(&path) {
            handle.stop().await;
        }
        if self.store.remove(&path).is_some() {
            info!(path = %path.display(), "Stopped tracking removed file");
        }
    }

    async fn handle_modify(&mut self, path: PathBuf) {
        if let Some(handle) = self.tailers.get(&path) {
            if !handle.is_finished() {
                handle.wake();
                return;
            }
        }
        if self.registry.match_path(&path).is_some() {
            // native backends may collapse a create into a modify; a path
            // whose tailer died also comes back through here
            self.handle_create(path).await;
        }
    }

    async fn shutdown(&mut self) {
        info!(tailers = self.tailers.len(), "Stopping tailers");
        for (_, handle) in self.tailers.drain() {
            handle.stop().await;
        }
        if let Err(e) = self.store.flush() {
            error!(error = %e, "Failed to flush position file during shutdown");
        }
    }
}

/// Fire the position flush at `flush_interval` and the reaper every 60
/// seconds until cancelled.
pub async fn run_timers(
    store: Arc<PositionStore>,
    reaper: Option<Reaper>,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now();
    let mut flush_tick = tokio::time::interval_at(start + flush_interval, flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reap_tick = tokio::time::interval_at(start + REAP_INTERVAL, REAP_INTERVAL);
    reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = flush_tick.tick() => {
                if let Err(e) = store.flush() {
                    error!(error = %e, "Failed to flush position file");
                }
            }
            _ = reap_tick.tick() => {
                if let Some(reaper) = &reaper {
                    reaper.sweep().await;
                }
            }
        }
    }
}
