use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{RecvErr, SingleTopicConsumer};
use common_kafka::kafka_producer::{send_keyed_json, KafkaContext};
use metrics::counter;
use rdkafka::producer::FutureProducer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use submission_common::envelope::{Envelope, Metadata, RawEnvelope, Topic, Versioned};

use crate::error::{ProcessingError, StreamError};
use crate::topology::managed::StreamHandle;

/// Pause before polling again after the consumer failed.
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One step of the pipeline: records of one version are read from the input
/// topic, processed, and the result is published to the output topic.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + Sync + 'static;

    /// Name of the topology, also naming its consumer group.
    fn name(&self) -> &str;

    fn input(&self) -> &Topic<Self::Input>;

    /// `None` for stages with side effects only.
    fn output(&self) -> Option<&Topic<Self::Output>>;

    /// Partitioning key taken from the data, used to publish records that
    /// arrived without one.
    fn key<'a>(&self, _input: &'a Self::Input) -> Option<&'a str> {
        None
    }

    async fn process(
        &self,
        envelope: Envelope<Self::Input>,
    ) -> Result<Self::Output, ProcessingError>;
}

/// What happened to one consumed record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Another version than the stage reads.
    Filtered,
    Published,
    /// Processed by a stage without output.
    Consumed,
    /// Processing failed and no dead letter topic is set.
    Dropped,
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Filtered => "filtered",
            Outcome::Published => "published",
            Outcome::Consumed => "consumed",
            Outcome::Dropped => "dropped",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Runs a `Stage` over a Kafka topic, one record at a time.
pub struct Topology<S> {
    stage: S,
    producer: FutureProducer<KafkaContext>,
    dead_letter_topic: Option<String>,
}

impl<S: Stage> Topology<S> {
    pub fn new(
        stage: S,
        producer: FutureProducer<KafkaContext>,
        dead_letter_topic: Option<String>,
    ) -> Self {
        Self {
            stage,
            producer,
            dead_letter_topic,
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// Handle one record, publishing under the same key, or under the key
    /// the stage takes from the data when the record has none.
    ///
    /// Records of another version and records the stage fails on are not
    /// errors here: only failing to publish is, as the record would be lost.
    pub async fn handle(
        &self,
        key: Option<&str>,
        raw: RawEnvelope,
    ) -> Result<Outcome, StreamError> {
        let metadata = raw.metadata.clone();
        let dead_letter = self.dead_letter_topic.as_ref().map(|_| raw.clone());

        let envelope = match self.stage.input().decode(raw) {
            Ok(Versioned::Supported(envelope)) => envelope,
            Ok(Versioned::Unsupported(metadata)) => {
                debug!(
                    topology = self.name(),
                    correlation_id = %metadata.correlation_id,
                    version = metadata.version,
                    "skipping record of unsupported version"
                );
                return Ok(Outcome::Filtered);
            }
            Err(error) => return self.failed(key, dead_letter, &metadata, error.into()).await,
        };

        let key = key
            .or_else(|| self.stage.key(&envelope.data))
            .map(str::to_owned);

        let output = match self.stage.process(envelope).await {
            Ok(output) => output,
            Err(error) => {
                return self
                    .failed(key.as_deref(), dead_letter, &metadata, error)
                    .await
            }
        };

        match self.stage.output() {
            Some(topic) => {
                let envelope = Envelope::new(metadata.forward(topic.version), output);
                send_keyed_json(&self.producer, &topic.name, key.as_deref(), &envelope).await?;
                Ok(Outcome::Published)
            }
            None => Ok(Outcome::Consumed),
        }
    }

    async fn failed(
        &self,
        key: Option<&str>,
        raw: Option<RawEnvelope>,
        metadata: &Metadata,
        error: ProcessingError,
    ) -> Result<Outcome, StreamError> {
        error!(
            topology = self.name(),
            correlation_id = %metadata.correlation_id,
            "failed to process record: {}",
            error
        );

        match (&self.dead_letter_topic, raw) {
            (Some(topic), Some(raw)) => {
                send_keyed_json(&self.producer, topic, key, &raw).await?;
                Ok(Outcome::DeadLettered)
            }
            _ => Ok(Outcome::Dropped),
        }
    }

    /// Consume until cancelled. A record is always fully handled before the
    /// cancellation is looked at, and its offset is stored only then.
    pub async fn run(
        &self,
        consumer: SingleTopicConsumer,
        stream: StreamHandle,
    ) -> Result<(), StreamError> {
        info!(
            topology = self.name(),
            topic = consumer.topic(),
            "consuming"
        );
        stream.running();

        let result = self.consume(&consumer, &stream).await;

        if let Err(error) = consumer.commit() {
            warn!(topology = self.name(), "failed to commit offsets: {}", error);
        }
        result
    }

    async fn consume(
        &self,
        consumer: &SingleTopicConsumer,
        stream: &StreamHandle,
    ) -> Result<(), StreamError> {
        loop {
            let received = tokio::select! {
                biased;
                _ = stream.cancelled() => return Ok(()),
                received = consumer.json_recv::<RawEnvelope>() => received,
            };

            match received {
                Ok((message, offset)) => {
                    let outcome = self.handle(message.key.as_deref(), message.payload).await?;
                    counter!(
                        "stream_messages_total",
                        "topology" => self.name().to_owned(),
                        "outcome" => outcome.as_str()
                    )
                    .increment(1);
                    offset.store()?;
                    stream.running();
                }
                Err(RecvErr::Kafka(error)) => {
                    warn!(topology = self.name(), "failed to consume: {}", error);
                    stream.errored();
                    tokio::select! {
                        _ = stream.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => {}
                    }
                }
                Err(RecvErr::Offset(error)) => return Err(error.into()),
                Err(error) => {
                    // The offset of an unreadable record is already stored
                    warn!(topology = self.name(), "skipping unreadable record: {}", error);
                    counter!(
                        "stream_messages_total",
                        "topology" => self.name().to_owned(),
                        "outcome" => "unreadable"
                    )
                    .increment(1);
                }
            }
        }
    }
}
