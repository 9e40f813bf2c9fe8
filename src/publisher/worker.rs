// SPDX-License-Identifier: Apache-2.0

//! The single publisher worker.
//!
//! Exactly one consumer drains the FIFO batch queue, so batches publish and
//! commit in submission order per path. An offset only advances after the
//! broker has acknowledged the batch; a crash or restart therefore re-reads
//! at most the unacknowledged tail.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::position::PositionStore;
use crate::publisher::{BatchReceiver, Broker, PublishError};
use crate::tailer::Batch;

const RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub struct Publisher {
    rx: BatchReceiver,
    broker: Arc<dyn Broker>,
    store: Arc<PositionStore>,
    /// When false, batches are discarded but offsets still advance
    produce: bool,
}

impl Publisher {
    pub fn new(
        rx: BatchReceiver,
        broker: Arc<dyn Broker>,
        store: Arc<PositionStore>,
        produce: bool,
    ) -> Self {
        Self {
            rx,
            broker,
            store,
            produce,
        }
    }

    /// Run until the queue closes (all tailers gone), cancellation, or a
    /// non-retryable broker failure. The error case is deliberate: it
    /// surfaces to the operator instead of silently dropping batches.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PublishError> {
        loop {
            tokio::select! {
                biased;

                batch = self.rx.next() => match batch {
                    Some(batch) => {
                        if !self.publish_batch(batch, &cancel).await? {
                            break;
                        }
                    }
                    None => {
                        debug!("Batch queue closed, publisher exiting");
                        break;
                    }
                },

                _ = cancel.cancelled() => break,
            }
        }

        Ok(())
    }

    /// Publish one batch, retrying the transient metadata class forever.
    /// Returns Ok(false) when cancelled mid-retry; the batch stays
    /// unacknowledged and its offset untouched.
    async fn publish_batch(
        &self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<bool, PublishError> {
        if self.produce {
            loop {
                match self.broker.publish(&batch.topic, &batch.lines).await {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() => {
                        warn!(
                            topic = %batch.topic,
                            path = %batch.path.display(),
                            error = %e,
                            "Broker metadata unavailable, retrying batch"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                            _ = cancel.cancelled() => return Ok(false),
                        }
                    }
                    Err(e) => {
                        error!(
                            topic = %batch.topic,
                            path = %batch.path.display(),
                            error = %e,
                            "Broker rejected batch"
                        );
                        return Err(e);
                    }
                }
            }
        }

        self.store.advance(&batch.path, batch.offset);
        debug!(
            topic = %batch.topic,
            path = %batch.path.display(),
            lines = batch.lines.len(),
            offset = batch.offset,
            "Batch acknowledged"
        );

        Ok(true)
    }
}
