// SPDX-License-Identifier: Apache-2.0

//! Native file system watcher using the `notify` crate.
//!
//! Uses OS-level file system notifications:
//! - Linux: inotify
//! - macOS: FSEvents
//!
//! Raw (undebounced) events are consumed because the engine routes on the
//! event class: a create starts a tailer, a remove stops one, a modify only
//! wakes one. Rename events are split into a remove of the source path and
//! a create of the destination path.

use std::path::Path;

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use super::{FileEvent, FileEventKind, WatcherError};

/// Native watcher handle. Watched directories deliver events for their
/// direct children.
pub struct NativeWatcher {
    watcher: RecommendedWatcher,
}

/// Async stream of normalized events from a [`NativeWatcher`].
pub struct EventStream {
    rx: flume::Receiver<FileEvent>,
}

impl EventStream {
    /// Next event; None once the watcher has been dropped.
    pub async fn next(&mut self) -> Option<FileEvent> {
        self.rx.recv_async().await.ok()
    }
}

impl NativeWatcher {
    pub fn new() -> Result<(Self, EventStream), WatcherError> {
        let (tx, rx) = flume::unbounded();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for converted in convert_event(event) {
                        // receiver dropped means we are shutting down
                        let _ = tx.send(converted);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "File watcher error");
                }
            }
        })
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok((Self { watcher }, EventStream { rx }))
    }

    pub fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .unwatch(path)
            .map_err(|e| WatcherError::Watch(e.to_string()))
    }

    pub fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "linux")]
        {
            "inotify"
        }
        #[cfg(target_os = "macos")]
        {
            "FSEvents"
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            "native"
        }
    }
}

/// Normalize a notify event into per-path [`FileEvent`]s.
fn convert_event(event: notify::Event) -> Vec<FileEvent> {
    match &event.kind {
        EventKind::Create(_) => per_path(event, FileEventKind::Create),
        EventKind::Remove(_) => per_path(event, FileEventKind::Remove),
        EventKind::Modify(ModifyKind::Name(mode)) => {
            let mode = *mode;
            convert_rename(event, mode)
        }
        EventKind::Modify(_) => per_path(event, FileEventKind::Modify),
        EventKind::Access(_) => Vec::new(),
        _ => per_path(event, FileEventKind::Other),
    }
}

fn per_path(event: notify::Event, kind: FileEventKind) -> Vec<FileEvent> {
    event
        .paths
        .into_iter()
        .map(|path| FileEvent::new(kind, path))
        .collect()
}

fn convert_rename(event: notify::Event, mode: RenameMode) -> Vec<FileEvent> {
    match mode {
        RenameMode::From => per_path(event, FileEventKind::Remove),
        RenameMode::To => per_path(event, FileEventKind::Create),
        RenameMode::Both => {
            // paths come ordered source, destination
            let mut iter = event.paths.into_iter();
            let mut events = Vec::with_capacity(2);
            if let Some(from) = iter.next() {
                events.push(FileEvent::new(FileEventKind::Remove, from));
            }
            if let Some(to) = iter.next() {
                events.push(FileEvent::new(FileEventKind::Create, to));
            }
            events
        }
        // backend did not say which side of the rename this is; let the
        // current state of the path decide
        _ => event
            .paths
            .into_iter()
            .map(|path| {
                let kind = if path.exists() {
                    FileEventKind::Create
                } else {
                    FileEventKind::Remove
                };
                FileEvent::new(kind, path)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn next_matching(
        stream: &mut EventStream,
        kind: FileEventKind,
        path: &Path,
    ) -> Option<FileEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let event = tokio::time::timeout_at(deadline, stream.next())
                .await
                .ok()??;
            if event.kind == kind && event.path == path {
                return Some(event);
            }
        }
    }

    #[tokio::test]
    async fn detects_file_create() {
        let dir = TempDir::new().unwrap();
        let (mut watcher, mut stream) = NativeWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        let path = dir.path().join("created.log");
        File::create(&path).unwrap();

        let event = next_matching(&mut stream, FileEventKind::Create, &path).await;
        assert!(event.is_some(), "expected a create event");
    }

    #[tokio::test]
    async fn detects_file_modify() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("modified.log");
        File::create(&path).unwrap();

        let (mut watcher, mut stream) = NativeWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"appended\n").unwrap();
        f.flush().unwrap();
        drop(f);

        let event = next_matching(&mut stream, FileEventKind::Modify, &path).await;
        assert!(event.is_some(), "expected a modify event");
    }

    #[tokio::test]
    async fn detects_file_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("removed.log");
        File::create(&path).unwrap();

        let (mut watcher, mut stream) = NativeWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        fs::remove_file(&path).unwrap();

        let event = next_matching(&mut stream, FileEventKind::Remove, &path).await;
        assert!(event.is_some(), "expected a remove event");
    }

    #[tokio::test]
    async fn rename_surfaces_as_remove_and_create() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("before.log");
        let to = dir.path().join("after.log");
        File::create(&from).unwrap();

        let (mut watcher, mut stream) = NativeWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();

        fs::rename(&from, &to).unwrap();

        let removed = next_matching(&mut stream, FileEventKind::Remove, &from).await;
        assert!(removed.is_some(), "expected a remove for the old path");
        let created = next_matching(&mut stream, FileEventKind::Create, &to).await;
        assert!(created.is_some(), "expected a create for the new path");
    }

    #[test]
    fn backend_name_is_set() {
        let (watcher, _stream) = NativeWatcher::new().unwrap();
        assert!(!watcher.backend_name().is_empty());
    }
}
