use std::time::Duration;

use crate::config::KafkaConfig;
use metrics::gauge;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

pub struct KafkaContext {
    name: String,
}

impl KafkaContext {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_producer_queue_depth", "producer" => self.name.clone())
            .set(stats.msg_cnt as f64);
        gauge!("kafka_producer_queue_depth_limit", "producer" => self.name.clone())
            .set(stats.msg_max as f64);
        gauge!("kafka_callback_queue_depth", "producer" => self.name.clone())
            .set(stats.replyq as f64);
    }
}

/// Create a producer for the pipeline topics.
///
/// The producer is idempotent, so retries inside librdkafka never reorder
/// or duplicate records of one partition.
pub async fn create_kafka_producer(
    config: &KafkaConfig,
    name: &str,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("client.id", name)
        .set("statistics.interval.ms", "10000")
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!(producer = name, "rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(KafkaContext::new(name))?;

    // Fail at startup rather than on the first record when brokers are unreachable
    let metadata = producer
        .client()
        .fetch_metadata(None, METADATA_TIMEOUT)
        .map_err(|error| {
            error!(producer = name, "failed to fetch kafka metadata: {}", error);
            error
        })?;
    info!(
        producer = name,
        topics = metadata.topics().len(),
        "connected to kafka"
    );

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Produce one JSON record and wait for the broker acknowledgement.
///
/// Waiting for the delivery report before returning is what keeps records
/// with the same key in order when the caller produces them one by one.
pub async fn send_keyed_json<T, C>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&str>,
    item: &T,
) -> Result<(), KafkaProduceError>
where
    T: Serialize,
    C: rdkafka::ClientContext + 'static,
{
    let payload = serde_json::to_string(item)
        .map_err(|e| KafkaProduceError::SerializationError { error: e })?;

    let record = FutureRecord {
        topic,
        key,
        payload: Some(&payload),
        timestamp: None,
        partition: None,
        headers: None,
    };

    let delivery = kafka_producer
        .send_result(record)
        .map_err(|(e, _)| KafkaProduceError::KafkaProduceError { error: e })?;

    match delivery.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((e, _))) => Err(KafkaProduceError::KafkaProduceError { error: e }),
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}
