use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "0")]
    pub kafka_producer_linger_ms: u32, // Records are produced one at a time, no need to batch

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    // Each topology gets its own consumer group: "{prefix}-{topology name}"
    #[envconfig(default = "submission-processor")]
    pub kafka_consumer_group_prefix: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

/// Settings for one consumer, derived from the shared `KafkaConfig`.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,
    pub kafka_consumer_offset_reset: String,
    pub kafka_consumer_auto_commit_interval_ms: u32,
}

impl ConsumerConfig {
    pub fn for_topology(config: &KafkaConfig, topology: &str, topic: &str) -> Self {
        Self {
            kafka_consumer_group: format!("{}-{}", config.kafka_consumer_group_prefix, topology),
            kafka_consumer_topic: topic.to_owned(),
            kafka_consumer_offset_reset: config.kafka_consumer_offset_reset.clone(),
            kafka_consumer_auto_commit_interval_ms: config.kafka_consumer_auto_commit_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_group_is_scoped_by_topology() {
        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_string(),
            kafka_tls: false,
            kafka_hosts: "localhost:9092".to_string(),
            kafka_consumer_group_prefix: "prefix".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_auto_commit_interval_ms: 1000,
        };

        let consumer = ConsumerConfig::for_topology(&config, "preprocessing", "mottatt");
        assert_eq!(consumer.kafka_consumer_group, "prefix-preprocessing");
        assert_eq!(consumer.kafka_consumer_topic, "mottatt");
        assert_eq!(consumer.kafka_consumer_offset_reset, "earliest");
    }
}
