// SPDX-License-Identifier: Apache-2.0

//! Garbage collection of fully-shipped rotated files.
//!
//! A tracked file is reaped once it is no longer the active time bucket for
//! its pattern, its inode is unchanged, every byte has been acknowledged
//! (size equals the committed offset), and it has been quiet past a grace
//! period. The table entry is left alone; the delete event that follows
//! removes it through the normal watcher path.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::position::{inode_of, PositionStore, TrackedFile};

/// Minimum quiet time before a rotated file may be deleted.
const REAP_GRACE: Duration = Duration::from_secs(30);

pub struct Reaper {
    store: Arc<PositionStore>,
    post_delete_command: Option<String>,
}

impl Reaper {
    pub fn new(store: Arc<PositionStore>, post_delete_command: Option<String>) -> Self {
        Self {
            store,
            post_delete_command,
        }
    }

    /// One sweep over the tracked set.
    pub async fn sweep(&self) {
        let now = Local::now();

        for entry in self.store.snapshot() {
            if !eligible(&entry, &now) {
                continue;
            }

            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    info!(
                        path = %entry.path.display(),
                        offset = entry.committed(),
                        "Reaped fully shipped rotated file"
                    );
                    if let Some(command) = &self.post_delete_command {
                        run_post_delete(command).await;
                    }
                }
                Err(e) => {
                    warn!(
                        path = %entry.path.display(),
                        error = %e,
                        "Failed to delete rotated file"
                    );
                }
            }
        }
    }
}

/// All reap conditions: rotated out of the active bucket, same inode, fully
/// acknowledged, and quiet past the grace period.
fn eligible(entry: &TrackedFile, now: &chrono::DateTime<Local>) -> bool {
    let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name == entry.spec.current_name(now) {
        return false;
    }

    let Ok(meta) = fs::metadata(&entry.path) else {
        return false;
    };
    if inode_of(&meta) != entry.inode {
        return false;
    }
    if meta.len() != entry.committed() {
        return false;
    }

    match meta.modified().map(|mtime| mtime.elapsed()) {
        Ok(Ok(quiet)) => quiet >= REAP_GRACE,
        _ => false,
    }
}

/// Run the configured post-delete command in a subshell with the inherited
/// environment. Failures are logged with the captured output, never fatal.
async fn run_post_delete(command: &str) {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            debug!(command, "Post-delete command succeeded");
        }
        Ok(output) => {
            error!(
                command,
                status = %output.status,
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Post-delete command failed"
            );
        }
        Err(e) => {
            error!(command, error = %e, "Failed to execute post-delete command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileSpecConfig;
    use crate::pattern::PatternRegistry;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn registry_for(dir: &Path) -> PatternRegistry {
        PatternRegistry::new(&[FileSpecConfig {
            topic: "logs".to_string(),
            prefix: format!("{}/app-", dir.display()),
            suffix: Some(".log".to_string()),
            time_pattern: "%Y-%m-%d".to_string(),
        }])
        .unwrap()
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> (PathBuf, u64) {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        let inode = inode_of(&fs::metadata(&path).unwrap());
        (path, inode)
    }

    fn backdate(path: &Path) {
        // push mtime well past the grace period
        let old = std::time::SystemTime::now() - Duration::from_secs(120);
        let f = fs::File::options().append(true).open(path).unwrap();
        f.set_modified(old).unwrap();
    }

    fn tracked(
        store: &PositionStore,
        registry: &PatternRegistry,
        path: PathBuf,
        inode: u64,
        offset: u64,
    ) -> Arc<TrackedFile> {
        let spec = registry.specs()[0].clone();
        let entry = store.upsert(path, spec, inode, 0).unwrap();
        entry.advance(offset);
        entry
    }

    #[test]
    fn rotated_and_shipped_file_is_eligible() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = PositionStore::new(dir.path().join("positions"));

        let (path, inode) = write_file(dir.path(), "app-2001-01-01.log", b"done\n");
        backdate(&path);
        let entry = tracked(&store, &registry, path, inode, 5);

        assert!(eligible(&entry, &Local::now()));
    }

    #[test]
    fn active_bucket_is_not_eligible() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = PositionStore::new(dir.path().join("positions"));

        let now = Local::now();
        let name = registry.specs()[0].current_name(&now);
        let (path, inode) = write_file(dir.path(), &name, b"live\n");
        backdate(&path);
        let entry = tracked(&store, &registry, path, inode, 5);

        assert!(!eligible(&entry, &now));
    }

    #[test]
    fn unshipped_bytes_block_reaping() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = PositionStore::new(dir.path().join("positions"));

        let (path, inode) = write_file(dir.path(), "app-2001-01-01.log", b"pending\n");
        backdate(&path);
        // committed short of the file size
        let entry = tracked(&store, &registry, path, inode, 3);

        assert!(!eligible(&entry, &Local::now()));
    }

    #[test]
    fn inode_change_blocks_reaping() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = PositionStore::new(dir.path().join("positions"));

        let (path, inode) = write_file(dir.path(), "app-2001-01-01.log", b"done\n");
        backdate(&path);
        let entry = tracked(&store, &registry, path, inode + 1, 5);

        assert!(!eligible(&entry, &Local::now()));
    }

    #[test]
    fn fresh_mtime_blocks_reaping() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = PositionStore::new(dir.path().join("positions"));

        let (path, inode) = write_file(dir.path(), "app-2001-01-01.log", b"done\n");
        let entry = tracked(&store, &registry, path, inode, 5);

        assert!(!eligible(&entry, &Local::now()));
    }

    #[test]
    fn missing_file_is_not_eligible() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = PositionStore::new(dir.path().join("positions"));

        let entry = tracked(
            &store,
            &registry,
            dir.path().join("app-2001-01-01.log"),
            9,
            5,
        );

        assert!(!eligible(&entry, &Local::now()));
    }

    #[tokio::test]
    async fn sweep_deletes_and_keeps_the_entry() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = Arc::new(PositionStore::new(dir.path().join("positions")));

        let (path, inode) = write_file(dir.path(), "app-2001-01-01.log", b"done\n");
        backdate(&path);
        tracked(&store, &registry, path.clone(), inode, 5);

        let marker = dir.path().join("post-delete-ran");
        let reaper = Reaper::new(
            store.clone(),
            Some(format!("touch {}", marker.display())),
        );
        reaper.sweep().await;

        assert!(!path.exists());
        assert!(marker.exists());
        // entry removal is the watcher's job, not the reaper's
        assert!(store.contains(&path));
    }

    #[tokio::test]
    async fn failing_post_delete_command_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let registry = registry_for(dir.path());
        let store = Arc::new(PositionStore::new(dir.path().join("positions")));

        let (path, inode) = write_file(dir.path(), "app-2001-01-01.log", b"done\n");
        backdate(&path);
        tracked(&store, &registry, path.clone(), inode, 5);

        let reaper = Reaper::new(store, Some("exit 3".to_string()));
        reaper.sweep().await;

        assert!(!path.exists());
    }
}
