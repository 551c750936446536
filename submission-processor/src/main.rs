//! Consume submitted applications, enrich them, and clean up after journaling.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use common_kafka::kafka_producer::create_kafka_producer;
use health::HealthRegistry;
use submission_common::metrics::{serve, setup_metrics_recorder};
use submission_common::token::{AccessTokenClient, CachedAccessTokenClient, ClientCredentialsClient};
use submission_processor::config::Config;
use submission_processor::document::DocumentStorageGateway;
use submission_processor::handlers::{self, AppState};
use submission_processor::identity::HttpIdentityLookup;
use submission_processor::preprocessing::{
    PreprocessingService, CHILD_AGE_BUCKETS, CHILD_AGE_METRIC,
};
use submission_processor::submission::{EnrichedSubmission, EnrichedSupplementarySubmission};
use submission_processor::topology;
use submission_processor::topology::stages::{
    CleanupStage, DayTransferPreprocessingStage, JournalConfirmationStage, PreprocessingStage,
    SupplementaryPreprocessingStage, JOURNAL_CONFIRMATION, SUPPLEMENTARY_JOURNAL_CONFIRMATION,
};

async fn shutdown() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env()?;
    let recorder_handle = setup_metrics_recorder(&[(CHILD_AGE_METRIC, CHILD_AGE_BUCKETS)])?;

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout.0)
        .build()?;

    let token_client: Arc<dyn AccessTokenClient> = Arc::new(ClientCredentialsClient::new(
        client.clone(),
        config.auth.auth_token_endpoint.clone(),
        &config.auth.auth_client_id,
        &config.auth.auth_client_secret,
    ));

    let documents = Arc::new(DocumentStorageGateway::new(
        client.clone(),
        token_client.clone(),
        &config.document_storage.document_storage_base_url,
        config.document_storage.document_storage_store_scopes.0.clone(),
        config.document_storage.document_storage_delete_scopes.0.clone(),
        config.retry_policy.policy(),
    )?);
    let identities = Arc::new(HttpIdentityLookup::new(
        client,
        Arc::new(CachedAccessTokenClient::new(token_client)),
        &config.identity_base_url,
        config.identity_scopes.0.clone(),
    ));
    let service = Arc::new(PreprocessingService::new(identities, documents.clone()));

    let producer = create_kafka_producer(&config.kafka, "submission-processor").await?;
    let grace_period = config.stream_grace_period.0;
    let topics = &config.topics;

    let dead_letter_topic = &config.dead_letter_topic;

    let (preprocessing, preprocessing_task) = topology::spawn(
        PreprocessingStage::new(
            service.clone(),
            &topics.received_topic,
            &topics.preprocessed_topic,
        ),
        &config.kafka,
        producer.clone(),
        dead_letter_topic.clone(),
        grace_period,
    )?;
    let (supplementary, supplementary_task) = topology::spawn(
        SupplementaryPreprocessingStage::new(
            service.clone(),
            &topics.supplementary_received_topic,
            &topics.supplementary_preprocessed_topic,
        ),
        &config.kafka,
        producer.clone(),
        dead_letter_topic.clone(),
        grace_period,
    )?;
    let (day_transfer, day_transfer_task) = topology::spawn(
        DayTransferPreprocessingStage::new(
            service,
            &topics.day_transfer_received_topic,
            &topics.day_transfer_preprocessed_topic,
        ),
        &config.kafka,
        producer.clone(),
        dead_letter_topic.clone(),
        grace_period,
    )?;
    let (confirmation, confirmation_task) = topology::spawn(
        JournalConfirmationStage::<EnrichedSubmission>::new(
            JOURNAL_CONFIRMATION,
            documents.clone(),
            &topics.journaled_topic,
            &topics.cleanup_topic,
        ),
        &config.kafka,
        producer.clone(),
        dead_letter_topic.clone(),
        grace_period,
    )?;
    let (supplementary_confirmation, supplementary_confirmation_task) = topology::spawn(
        JournalConfirmationStage::<EnrichedSupplementarySubmission>::new(
            SUPPLEMENTARY_JOURNAL_CONFIRMATION,
            documents.clone(),
            &topics.supplementary_journaled_topic,
            &topics.cleanup_topic,
        ),
        &config.kafka,
        producer.clone(),
        dead_letter_topic.clone(),
        grace_period,
    )?;
    let (cleanup, cleanup_task) = topology::spawn(
        CleanupStage::new(documents.clone(), &topics.cleanup_topic),
        &config.kafka,
        producer,
        dead_letter_topic.clone(),
        grace_period,
    )?;

    let streams = vec![
        preprocessing,
        supplementary,
        day_transfer,
        confirmation,
        supplementary_confirmation,
        cleanup,
    ];
    let tasks = [
        preprocessing_task,
        supplementary_task,
        day_transfer_task,
        confirmation_task,
        supplementary_confirmation_task,
        cleanup_task,
    ];
    let health = streams.iter().fold(
        HealthRegistry::new("submission-processor").register("document-storage", documents),
        |registry, stream| registry.register(stream.name(), stream.clone()),
    );
    let app = handlers::app(AppState::new(streams.clone(), health), Some(recorder_handle));

    let bind = config.bind();
    let http_server = tokio::spawn(async move {
        if let Err(error) = serve(app, &bind).await {
            error!("failed to serve probes and metrics: {}", error);
        }
    });
    info!("listening on {}", config.bind());

    shutdown().await?;

    for stream in &streams {
        stream.stop(false);
    }
    for task in tasks {
        if let Err(error) = task.await {
            error!("stream task failed: {}", error);
        }
    }
    http_server.abort();

    Ok(())
}
