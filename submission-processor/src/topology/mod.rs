//! Stream topologies: each one consumes a topic with its own consumer group,
//! runs a `Stage` over every record and publishes the results.
use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::kafka_consumer::SingleTopicConsumer;
use common_kafka::kafka_producer::KafkaContext;
use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use tokio::task::JoinHandle;

pub mod managed;
pub mod stages;
pub mod stream;

use managed::ManagedStream;
use stream::{Stage, Topology};

/// Subscribe to the input topic of `stage` and start consuming it.
pub fn spawn<S: Stage>(
    stage: S,
    kafka: &KafkaConfig,
    producer: FutureProducer<KafkaContext>,
    dead_letter_topic: Option<String>,
    grace_period: Duration,
) -> Result<(Arc<ManagedStream>, JoinHandle<()>), KafkaError> {
    let consumer = SingleTopicConsumer::new(
        kafka,
        ConsumerConfig::for_topology(kafka, stage.name(), &stage.input().name),
    )?;

    let topology = Topology::new(stage, producer, dead_letter_topic);
    let stream = Arc::new(ManagedStream::new(topology.name(), grace_period));
    let task = stream.start(move |handle| async move { topology.run(consumer, handle).await });

    Ok((stream, task))
}
