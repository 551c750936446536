use rdkafka::mocking::MockCluster;
use rdkafka::producer::{DefaultProducerContext, FutureProducer};

use crate::config::KafkaConfig;
use crate::kafka_producer::{create_kafka_producer, KafkaContext};

/// Config pointing at a mock cluster, with short timeouts to keep tests fast.
pub fn mock_kafka_config(cluster: &MockCluster<'static, DefaultProducerContext>) -> KafkaConfig {
    KafkaConfig {
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
        kafka_hosts: cluster.bootstrap_servers(),
        kafka_tls: false,
        kafka_consumer_group_prefix: "test".to_string(),
        kafka_consumer_offset_reset: "earliest".to_string(),
        kafka_consumer_auto_commit_interval_ms: 1000,
    }
}

/// Start a single broker mock cluster with the given topics created.
pub async fn create_mock_kafka(
    topics: &[&str],
) -> (
    MockCluster<'static, DefaultProducerContext>,
    FutureProducer<KafkaContext>,
) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    for topic in topics {
        cluster
            .create_topic(topic, 1, 1)
            .expect("failed to create mock topic");
    }

    let config = mock_kafka_config(&cluster);
    let producer = create_kafka_producer(&config, "test")
        .await
        .expect("failed to create mocked kafka producer");

    (cluster, producer)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::config::ConsumerConfig;
    use crate::kafka_consumer::SingleTopicConsumer;
    use crate::kafka_producer::send_keyed_json;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Record {
        value: u32,
    }

    #[tokio::test]
    async fn keyed_records_round_trip_in_order() {
        let (cluster, producer) = create_mock_kafka(&["records"]).await;
        let config = mock_kafka_config(&cluster);

        for value in 0..3 {
            send_keyed_json(&producer, "records", Some("key-1"), &Record { value })
                .await
                .expect("failed to produce");
        }

        let consumer = SingleTopicConsumer::new(
            &config,
            ConsumerConfig::for_topology(&config, "round-trip", "records"),
        )
        .expect("failed to create consumer");

        for expected in 0..3 {
            let (message, offset) =
                tokio::time::timeout(Duration::from_secs(20), consumer.json_recv::<Record>())
                    .await
                    .expect("timed out waiting for record")
                    .expect("failed to receive record");
            assert_eq!(message.key.as_deref(), Some("key-1"));
            assert_eq!(message.payload, Record { value: expected });
            offset.store().expect("failed to store offset");
        }
    }
}
