// SPDX-License-Identifier: Apache-2.0

//! The tracked-file table and its durable on-disk representation.
//!
//! Each tracked file carries the inode observed when tracking started and a
//! committed offset that only the publisher advances, after the broker has
//! acknowledged every byte below it. The table is flushed wholesale to a
//! text position file, one `path pattern topic inode offset` record per
//! line, and filtered against filesystem reality on load.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pattern::{FileSpec, PatternRegistry};
use crate::tailer::reader::LineReader;

#[derive(Error, Debug)]
pub enum PositionError {
    #[error("position file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("position store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, PositionError>;

#[cfg(unix)]
pub fn inode_of(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

/// One tracked path. Rotation produces a new inode and therefore a new
/// `TrackedFile`; this value lives exactly as long as the path stays
/// tracked.
pub struct TrackedFile {
    pub path: PathBuf,
    pub spec: Arc<FileSpec>,
    /// Inode observed when tracking started
    pub inode: u64,
    /// Last byte position acknowledged by the broker
    committed: AtomicU64,
    /// Read state: open handle position and partial-line remainder. The
    /// tailer and the wake path both take this lock before touching the
    /// file.
    pub reader: Mutex<Option<LineReader>>,
}

impl TrackedFile {
    fn new(path: PathBuf, spec: Arc<FileSpec>, inode: u64, offset: u64) -> Arc<Self> {
        Arc::new(Self {
            path,
            spec,
            inode,
            committed: AtomicU64::new(offset),
            reader: Mutex::new(None),
        })
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Monotonic advance; a stale smaller offset never rewinds the commit.
    pub fn advance(&self, offset: u64) {
        self.committed.fetch_max(offset, Ordering::AcqRel);
    }

    /// Drop the open file handle, if any.
    pub fn close(&self) {
        if let Ok(mut guard) = self.reader.lock() {
            *guard = None;
        }
    }
}

impl std::fmt::Debug for TrackedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedFile")
            .field("path", &self.path)
            .field("topic", &self.spec.topic)
            .field("inode", &self.inode)
            .field("committed", &self.committed())
            .finish_non_exhaustive()
    }
}

/// Durable mapping from path to `(pattern, topic, inode, offset)`.
pub struct PositionStore {
    position_path: PathBuf,
    table: Mutex<HashMap<PathBuf, Arc<TrackedFile>>>,
}

impl PositionStore {
    pub fn new(position_path: impl Into<PathBuf>) -> Self {
        Self {
            position_path: position_path.into(),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Load the position file, accepting only records that still describe
    /// filesystem reality: the path exists, its inode is unchanged, and its
    /// size has not shrunk below the recorded offset. Rejected records are
    /// dropped; the directory scan re-tracks those paths from offset 0.
    /// Returns the number of accepted records.
    pub fn load(&self, registry: &PatternRegistry) -> Result<usize> {
        let content = match fs::read_to_string(&self.position_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut accepted = 0;
        let mut table = self.table.lock().map_err(|_| PositionError::Poisoned)?;

        for line in content.lines() {
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let parsed = match fields.as_slice() {
                [path, _pattern, _topic, inode, offset] => {
                    match (inode.parse::<u64>(), offset.parse::<u64>()) {
                        (Ok(inode), Ok(offset)) => Some((PathBuf::from(path), inode, offset)),
                        _ => None,
                    }
                }
                _ => None,
            };

            let Some((path, inode, offset)) = parsed else {
                warn!(line, "Skipping malformed position record");
                continue;
            };

            let meta = match fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                _ => {
                    debug!(path = %path.display(), "Dropping position record, file is gone");
                    continue;
                }
            };
            if inode_of(&meta) != inode {
                debug!(path = %path.display(), "Dropping position record, inode changed");
                continue;
            }
            if meta.len() < offset {
                debug!(
                    path = %path.display(),
                    size = meta.len(),
                    offset,
                    "Dropping position record, file shrank below recorded offset"
                );
                continue;
            }
            let Some(spec) = registry.match_path(&path) else {
                debug!(path = %path.display(), "Dropping position record, no configured pattern");
                continue;
            };

            table.insert(path.clone(), TrackedFile::new(path, spec, inode, offset));
            accepted += 1;
        }

        Ok(accepted)
    }

    /// Add a tracked file. Idempotent on path: an existing entry wins, so a
    /// recovered record is never reset by the directory scan.
    pub fn upsert(
        &self,
        path: PathBuf,
        spec: Arc<FileSpec>,
        inode: u64,
        offset: u64,
    ) -> Result<Arc<TrackedFile>> {
        let mut table = self.table.lock().map_err(|_| PositionError::Poisoned)?;
        let entry = table
            .entry(path.clone())
            .or_insert_with(|| TrackedFile::new(path, spec, inode, offset));
        Ok(entry.clone())
    }

    pub fn get(&self, path: &Path) -> Option<Arc<TrackedFile>> {
        self.table.lock().ok()?.get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.table
            .lock()
            .map(|t| t.contains_key(path))
            .unwrap_or(false)
    }

    /// Advance a path's committed offset. Only the publisher calls this.
    pub fn advance(&self, path: &Path, offset: u64) {
        if let Some(entry) = self.get(path) {
            entry.advance(offset);
        }
    }

    /// Remove a tracked file and close its handle.
    pub fn remove(&self, path: &Path) -> Option<Arc<TrackedFile>> {
        let removed = self.table.lock().ok()?.remove(path);
        if let Some(ref entry) = removed {
            entry.close();
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Arc<TrackedFile>> {
        self.table
            .lock()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the position file from the current table. Writes a temporary
    /// sibling and renames it over the target so a crash mid-flush never
    /// leaves a torn file. The table lock is held for the whole rewrite,
    /// which also serializes concurrent flush calls.
    pub fn flush(&self) -> Result<()> {
        let table = self.table.lock().map_err(|_| PositionError::Poisoned)?;
        let mut records: Vec<String> = table
            .values()
            .map(|entry| {
                format!(
                    "{} {} {} {} {}",
                    entry.path.display(),
                    entry.spec.time_pattern,
                    entry.spec.topic,
                    entry.inode,
                    entry.committed()
                )
            })
            .collect();
        records.sort();

        let tmp_name = match self.position_path.file_name() {
            Some(name) => {
                let mut n = name.to_os_string();
                n.push(".tmp");
                n
            }
            None => std::ffi::OsString::from(".positions.tmp"),
        };
        let tmp_path = self.position_path.with_file_name(tmp_name);

        {
            let mut file = fs::File::create(&tmp_path)?;
            for record in &records {
                writeln!(file, "{}", record)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.position_path)?;

        Ok(())
    }
}
