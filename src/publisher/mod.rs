// SPDX-License-Identifier: Apache-2.0

//! Publishing: the bounded batch queue, the broker seam, and the single
//! worker that drains the queue, commits offsets on acknowledgement, and
//! retries broker outages.

mod broker;
mod queue;
mod worker;

pub use broker::{Broker, KafkaBroker, PublishError};
pub use queue::{batch_queue, BatchReceiver, BatchSender, QueueClosed};
pub use worker::Publisher;
