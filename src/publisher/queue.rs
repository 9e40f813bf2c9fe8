// SPDX-License-Identifier: Apache-2.0

//! The publisher queue: a bounded FIFO of batches between the tailers and
//! the single publisher worker.
//!
//! When broker acknowledgement is slow the queue fills and `submit`
//! suspends the calling tailer, which is the designed backpressure. A
//! closed queue (publisher gone) is the signal for tailers to stop; a
//! drained queue with no senders left is the signal for the publisher to
//! exit.

use std::fmt;

use crate::tailer::Batch;

/// The publisher is gone; no more batches will be accepted.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publisher queue closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Producer half, cloned into every tailer.
#[derive(Clone)]
pub struct BatchSender {
    tx: flume::Sender<Batch>,
}

impl BatchSender {
    /// Queue a batch for publishing. Suspends while the queue is at
    /// capacity; fails only once the consumer half is gone.
    pub async fn submit(&self, batch: Batch) -> Result<(), QueueClosed> {
        self.tx.send_async(batch).await.map_err(|_| QueueClosed)
    }
}

/// Consumer half, owned by the publisher worker.
pub struct BatchReceiver {
    rx: flume::Receiver<Batch>,
}

impl BatchReceiver {
    /// Next batch in submission order. Returns None once every tailer has
    /// dropped its sender and the backlog is drained.
    pub async fn next(&mut self) -> Option<Batch> {
        self.rx.recv_async().await.ok()
    }
}

/// Build the queue with the configured capacity.
pub fn batch_queue(capacity: usize) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = flume::bounded::<Batch>(capacity);

    (BatchSender { tx }, BatchReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_test::{assert_pending, assert_ready, task::spawn};

    fn batch(line: &str, offset: u64) -> Batch {
        Batch {
            path: PathBuf::from("/var/log/app-2024-01-01.log"),
            topic: "app-logs".to_string(),
            lines: vec![line.to_string()],
            offset,
        }
    }

    #[tokio::test]
    async fn delivers_batches_in_submission_order() {
        let (tailer, mut publisher) = batch_queue(4);

        tailer.submit(batch("first", 6)).await.unwrap();
        tailer.submit(batch("second", 13)).await.unwrap();

        assert_eq!(publisher.next().await.unwrap().offset, 6);
        let second = publisher.next().await.unwrap();
        assert_eq!(second.lines, vec!["second"]);
        assert_eq!(second.offset, 13);
    }

    #[tokio::test]
    async fn full_queue_suspends_the_tailer() {
        let (tailer, mut publisher) = batch_queue(1);

        tailer.submit(batch("queued", 7)).await.unwrap();

        // capacity is used up; the next submit waits on the publisher
        let mut backpressured = spawn(tailer.submit(batch("waiting", 15)));
        assert_pending!(backpressured.poll());

        // draining one batch makes room and wakes the tailer
        assert_eq!(publisher.next().await.unwrap().lines, vec!["queued"]);
        assert!(backpressured.is_woken());
        assert_ready!(backpressured.poll()).unwrap();

        assert_eq!(publisher.next().await.unwrap().lines, vec!["waiting"]);
    }

    #[tokio::test]
    async fn submit_fails_once_the_publisher_is_gone() {
        let (tailer, publisher) = batch_queue(2);
        drop(publisher);

        assert_eq!(tailer.submit(batch("orphaned", 9)).await, Err(QueueClosed));
    }

    #[tokio::test]
    async fn backlog_outlives_the_last_tailer() {
        let (tailer, mut publisher) = batch_queue(4);

        tailer.submit(batch("parting", 8)).await.unwrap();
        drop(tailer);

        // the queued batch still publishes, then the queue reports closed
        assert_eq!(publisher.next().await.unwrap().lines, vec!["parting"]);
        assert!(publisher.next().await.is_none());
    }
}
