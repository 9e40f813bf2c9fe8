// SPDX-License-Identifier: Apache-2.0

//! The per-file drain task.
//!
//! One tailer runs per tracked file. On startup it drains aggressively until
//! the first empty read, catching up on whatever accumulated while the
//! process was down. After that it suspends until the watcher wakes it, and
//! each wake drains at most `max_batches` iterations so one hot file cannot
//! starve the rest.
//!
//! File I/O runs on the blocking pool; the per-file read-state mutex keeps
//! the wake path and the drain loop from reading concurrently.

use std::io;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::position::{PositionStore, TrackedFile};
use crate::publisher::BatchSender;
use crate::tailer::reader::LineReader;
use crate::tailer::Batch;

#[derive(Debug, Clone, Copy)]
pub struct DrainLimits {
    /// Maximum complete lines per batch
    pub max_batch_lines: usize,
    /// Maximum consecutive drain iterations per wake
    pub max_batches: usize,
}

/// Handle to a running tailer task.
pub struct TailerHandle {
    notify: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TailerHandle {
    /// Wake the tailer to drain newly appended data. Wakes are coalesced; a
    /// wake during a drain triggers one more pass.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Whether the task has exited on its own, e.g. after a read error.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cooperatively cancel the tailer and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Tailer task panicked");
        }
    }
}

/// Start a tailer for a tracked file. The file is opened at the committed
/// offset; open failures remove the entry so a later event can re-track it.
pub fn spawn_tailer(
    entry: Arc<TrackedFile>,
    store: Arc<PositionStore>,
    queue: BatchSender,
    limits: DrainLimits,
) -> TailerHandle {
    let notify = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let tailer = Tailer {
        entry,
        store,
        queue,
        limits,
        cancel: cancel.clone(),
    };

    let task_notify = notify.clone();
    let task = tokio::spawn(async move { tailer.run(task_notify).await });

    TailerHandle {
        notify,
        cancel,
        task,
    }
}

/// Outcome of one drain iteration.
enum Drain {
    Batch(Vec<String>, u64),
    Empty,
    Closed,
}

struct Tailer {
    entry: Arc<TrackedFile>,
    store: Arc<PositionStore>,
    queue: BatchSender,
    limits: DrainLimits,
    cancel: CancellationToken,
}

impl Tailer {
    async fn run(self, notify: Arc<Notify>) {
        if !self.open() {
            self.store.remove(&self.entry.path);
            return;
        }

        debug!(
            path = %self.entry.path.display(),
            offset = self.entry.committed(),
            topic = %self.entry.spec.topic,
            "Tailer started"
        );

        // catch-up pass, unbounded until the first empty read
        if self.drain_until_empty().await {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = notify.notified() => {
                        if !self.drain_wake().await {
                            break;
                        }
                    }
                }
            }
        }

        self.entry.close();
        debug!(path = %self.entry.path.display(), "Tailer stopped");
    }

    /// Open the file at the committed offset under the read-state mutex.
    fn open(&self) -> bool {
        let offset = self.entry.committed();
        let Ok(mut guard) = self.entry.reader.lock() else {
            error!(path = %self.entry.path.display(), "Read state lock poisoned");
            return false;
        };
        if guard.is_some() {
            return true;
        }
        match LineReader::open(&self.entry.path, offset) {
            Ok(reader) => {
                *guard = Some(reader);
                true
            }
            Err(e) => {
                error!(
                    path = %self.entry.path.display(),
                    error = %e,
                    "Failed to open tailed file"
                );
                false
            }
        }
    }

    /// Drain repeatedly until a read comes back empty. Returns false when
    /// the tailer should exit.
    async fn drain_until_empty(&self) -> bool {
        loop {
            match self.drain_one().await {
                Ok(Drain::Batch(lines, offset)) => {
                    if !self.submit(lines, offset).await {
                        return false;
                    }
                }
                Ok(Drain::Empty) | Ok(Drain::Closed) => return true,
                Err(e) => {
                    self.fail(e);
                    return false;
                }
            }
        }
    }

    /// One wake: up to `max_batches` drain iterations. Returns false when
    /// the tailer should exit.
    async fn drain_wake(&self) -> bool {
        for _ in 0..self.limits.max_batches {
            match self.drain_one().await {
                Ok(Drain::Batch(lines, offset)) => {
                    if !self.submit(lines, offset).await {
                        return false;
                    }
                }
                Ok(Drain::Empty) => break,
                Ok(Drain::Closed) => {
                    warn!(
                        path = %self.entry.path.display(),
                        "Dropping wake for a closed file"
                    );
                    break;
                }
                Err(e) => {
                    self.fail(e);
                    return false;
                }
            }
        }
        true
    }

    /// Read one batch on the blocking pool, under the per-file mutex.
    async fn drain_one(&self) -> io::Result<Drain> {
        let entry = self.entry.clone();
        let max_lines = self.limits.max_batch_lines;

        tokio::task::spawn_blocking(move || {
            let mut guard = entry
                .reader
                .lock()
                .map_err(|_| io::Error::other("read state lock poisoned"))?;
            match guard.as_mut() {
                None => Ok(Drain::Closed),
                Some(reader) => {
                    let lines = reader.read_lines(max_lines)?;
                    if lines.is_empty() {
                        Ok(Drain::Empty)
                    } else {
                        Ok(Drain::Batch(lines, reader.offset()))
                    }
                }
            }
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Hand a batch to the publisher queue. Blocks on a full queue; that is
    /// the designed backpressure. Returns false when shutting down.
    async fn submit(&self, lines: Vec<String>, offset: u64) -> bool {
        let batch = Batch {
            path: self.entry.path.clone(),
            topic: self.entry.spec.topic.clone(),
            lines,
            offset,
        };

        tokio::select! {
            res = self.queue.submit(batch) => res.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    fn fail(&self, e: io::Error) {
        error!(
            path = %self.entry.path.display(),
            error = %e,
            "Read error on tailed file, stopping tailer"
        );
        self.store.remove(&self.entry.path);
    }
}
