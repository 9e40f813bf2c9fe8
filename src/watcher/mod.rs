// SPDX-License-Identifier: Apache-2.0

//! File system watching.
//!
//! Events are normalized into [`FileEvent`]s with a small kind set the
//! engine can route on: create/move-in, remove/move-out, and content
//! modification. Renames surface as a remove of the old path and a create
//! of the new one.

mod native;

pub use native::{EventStream, NativeWatcher};

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum WatcherError {
    /// Failed to initialize the watcher
    Init(String),
    /// Failed to watch a path
    Watch(String),
    /// Event channel closed
    Channel(String),
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherError::Init(msg) => write!(f, "watcher initialization failed: {}", msg),
            WatcherError::Watch(msg) => write!(f, "watch failed: {}", msg),
            WatcherError::Channel(msg) => write!(f, "watcher channel error: {}", msg),
        }
    }
}

impl std::error::Error for WatcherError {}

/// Kind of file event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File appeared: created or moved into a watched directory
    Create,
    /// File content changed
    Modify,
    /// File disappeared: deleted or moved out of a watched directory
    Remove,
    /// Catch-all for kinds the engine does not route on
    Other,
}

/// A normalized file system event for a single path.
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: PathBuf) -> Self {
        Self { kind, path }
    }
}
