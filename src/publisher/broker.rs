// SPDX-License-Identifier: Apache-2.0

//! The publish contract required of the broker client, and its Kafka
//! implementation.

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::config::{KafkaConfig, ProducerType};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Kafka producer error: {0}")]
    Producer(#[from] KafkaError),

    #[error("invalid producer configuration: {0}")]
    Configuration(String),
}

impl PublishError {
    /// Whether the failure is the transient "metadata unavailable" class
    /// that publishing retries indefinitely.
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Producer(e) => match e {
                KafkaError::MessageProduction(code)
                | KafkaError::MetadataFetch(code)
                | KafkaError::Global(code) => retryable_code(*code),
                _ => false,
            },
            PublishError::Configuration(_) => false,
        }
    }
}

fn retryable_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::UnknownPartition
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut
    )
}

/// The contract this system requires of a broker client: publish a group of
/// line payloads to a topic, acknowledged or failed as a unit, with a
/// distinguishable retryable failure class.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, lines: &[String]) -> Result<(), PublishError>;
}

/// Kafka broker client over a librdkafka future producer.
pub struct KafkaBroker {
    producer: FutureProducer,
    producer_type: ProducerType,
}

impl KafkaBroker {
    pub fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        if config.brokers.is_empty() {
            return Err(PublishError::Configuration(
                "no brokers configured".to_string(),
            ));
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("message.timeout.ms", "30000")
            .create()?;

        Ok(Self {
            producer,
            producer_type: config.producer_type,
        })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn publish(&self, topic: &str, lines: &[String]) -> Result<(), PublishError> {
        match self.producer_type {
            // one record in flight at a time, each delivery awaited
            ProducerType::Sync => {
                for line in lines {
                    let record = FutureRecord::<(), String>::to(topic).payload(line);
                    self.producer
                        .send(record, Timeout::Never)
                        .await
                        .map_err(|(e, _)| PublishError::Producer(e))?;
                }
            }
            // enqueue the whole group, then await every delivery report
            ProducerType::Async => {
                let deliveries: Vec<_> = lines
                    .iter()
                    .map(|line| {
                        let record = FutureRecord::<(), String>::to(topic).payload(line);
                        self.producer.send(record, Timeout::Never)
                    })
                    .collect();

                for delivery in deliveries {
                    delivery.await.map_err(|(e, _)| PublishError::Producer(e))?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_class_is_retryable() {
        let err = PublishError::Producer(KafkaError::MessageProduction(
            RDKafkaErrorCode::LeaderNotAvailable,
        ));
        assert!(err.is_retryable());

        let err = PublishError::Producer(KafkaError::MetadataFetch(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(err.is_retryable());

        let err =
            PublishError::Producer(KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure));
        assert!(err.is_retryable());
    }

    #[test]
    fn other_failures_are_not_retryable() {
        let err = PublishError::Producer(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(!err.is_retryable());

        let err = PublishError::Configuration("bad".to_string());
        assert!(!err.is_retryable());
    }
}
