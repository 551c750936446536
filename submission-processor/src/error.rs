use common_kafka::kafka_consumer::OffsetErr;
use common_kafka::kafka_producer::KafkaProduceError;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::document::GatewayError;
use crate::preprocessing::PreprocessingError;

/// Enumeration of errors raised while a stage handles one record. The record
/// is not published, and the stream goes on with the next one.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("failed to decode record: {0}")]
    DecodeError(#[from] serde_json::Error),
    #[error(transparent)]
    PreprocessingError(#[from] PreprocessingError),
    #[error(transparent)]
    GatewayError(#[from] GatewayError),
    #[error("invalid document location for {id}: {error}")]
    LocationError { id: String, error: url::ParseError },
}

/// Enumeration of errors that stop a stream: records after the current one
/// cannot be handled without losing it.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to create consumer: {0}")]
    ConsumerError(#[from] KafkaError),
    #[error("failed to publish record: {0}")]
    ProduceError(#[from] KafkaProduceError),
    #[error("failed to store offset: {0}")]
    OffsetError(#[from] OffsetErr),
}
