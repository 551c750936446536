use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{info, instrument};

use submission_common::envelope::{Envelope, Topic};

use crate::document::DocumentStorageGateway;
use crate::error::ProcessingError;
use crate::preprocessing::PreprocessingService;
use crate::submission::{
    CleanupInstruction, DayTransferRequest, EnrichedDayTransferRequest,
    EnrichedSubmission, EnrichedSupplementarySubmission, JournalConfirmation, RawSubmission,
    StoredDocuments, SupplementarySubmission,
};
use crate::topology::stream::Stage;

pub const PREPROCESSING: &str = "preprocessing";
pub const SUPPLEMENTARY_PREPROCESSING: &str = "supplementary-preprocessing";
pub const DAY_TRANSFER_PREPROCESSING: &str = "day-transfer-preprocessing";
pub const JOURNAL_CONFIRMATION: &str = "journal-confirmation";
pub const SUPPLEMENTARY_JOURNAL_CONFIRMATION: &str = "supplementary-journal-confirmation";
pub const CLEANUP: &str = "cleanup";

/// Received applications in, enriched applications out.
pub struct PreprocessingStage {
    service: Arc<PreprocessingService>,
    input: Topic<RawSubmission>,
    output: Topic<EnrichedSubmission>,
}

impl PreprocessingStage {
    pub fn new(service: Arc<PreprocessingService>, input: &str, output: &str) -> Self {
        Self {
            service,
            input: Topic::new(input, 1),
            output: Topic::new(output, 1),
        }
    }
}

#[async_trait]
impl Stage for PreprocessingStage {
    type Input = RawSubmission;
    type Output = EnrichedSubmission;

    fn name(&self) -> &str {
        PREPROCESSING
    }

    fn input(&self) -> &Topic<RawSubmission> {
        &self.input
    }

    fn output(&self) -> Option<&Topic<EnrichedSubmission>> {
        Some(&self.output)
    }

    fn key<'a>(&self, input: &'a RawSubmission) -> Option<&'a str> {
        Some(&input.application_id)
    }

    #[instrument(skip_all, fields(
        correlation_id = %envelope.metadata.correlation_id,
        application_id = %envelope.data.application_id,
    ))]
    async fn process(
        &self,
        envelope: Envelope<RawSubmission>,
    ) -> Result<EnrichedSubmission, ProcessingError> {
        info!("preprocessing submission");
        let enriched = self
            .service
            .preprocess(envelope.data, &envelope.metadata)
            .await?;
        Ok(enriched)
    }
}

/// Supplementary submissions in, with stored documents out.
pub struct SupplementaryPreprocessingStage {
    service: Arc<PreprocessingService>,
    input: Topic<SupplementarySubmission>,
    output: Topic<EnrichedSupplementarySubmission>,
}

impl SupplementaryPreprocessingStage {
    pub fn new(service: Arc<PreprocessingService>, input: &str, output: &str) -> Self {
        Self {
            service,
            input: Topic::new(input, 1),
            output: Topic::new(output, 1),
        }
    }
}

#[async_trait]
impl Stage for SupplementaryPreprocessingStage {
    type Input = SupplementarySubmission;
    type Output = EnrichedSupplementarySubmission;

    fn name(&self) -> &str {
        SUPPLEMENTARY_PREPROCESSING
    }

    fn input(&self) -> &Topic<SupplementarySubmission> {
        &self.input
    }

    fn output(&self) -> Option<&Topic<EnrichedSupplementarySubmission>> {
        Some(&self.output)
    }

    fn key<'a>(&self, input: &'a SupplementarySubmission) -> Option<&'a str> {
        Some(&input.application_id)
    }

    #[instrument(skip_all, fields(
        correlation_id = %envelope.metadata.correlation_id,
        application_id = %envelope.data.application_id,
    ))]
    async fn process(
        &self,
        envelope: Envelope<SupplementarySubmission>,
    ) -> Result<EnrichedSupplementarySubmission, ProcessingError> {
        info!("preprocessing supplementary submission");
        let enriched = self
            .service
            .preprocess_supplementary(envelope.data, &envelope.metadata)
            .await?;
        Ok(enriched)
    }
}

pub struct DayTransferPreprocessingStage {
    service: Arc<PreprocessingService>,
    input: Topic<DayTransferRequest>,
    output: Topic<EnrichedDayTransferRequest>,
}

impl DayTransferPreprocessingStage {
    pub fn new(service: Arc<PreprocessingService>, input: &str, output: &str) -> Self {
        Self {
            service,
            input: Topic::new(input, 1),
            output: Topic::new(output, 1),
        }
    }
}

#[async_trait]
impl Stage for DayTransferPreprocessingStage {
    type Input = DayTransferRequest;
    type Output = EnrichedDayTransferRequest;

    fn name(&self) -> &str {
        DAY_TRANSFER_PREPROCESSING
    }

    fn input(&self) -> &Topic<DayTransferRequest> {
        &self.input
    }

    fn output(&self) -> Option<&Topic<EnrichedDayTransferRequest>> {
        Some(&self.output)
    }

    fn key<'a>(&self, input: &'a DayTransferRequest) -> Option<&'a str> {
        Some(&input.application_id)
    }

    #[instrument(skip_all, fields(
        correlation_id = %envelope.metadata.correlation_id,
        application_id = %envelope.data.application_id,
    ))]
    async fn process(
        &self,
        envelope: Envelope<DayTransferRequest>,
    ) -> Result<EnrichedDayTransferRequest, ProcessingError> {
        info!("preprocessing day transfer request");
        Ok(self
            .service
            .preprocess_day_transfer(envelope.data, &envelope.metadata)
            .await)
    }
}

/// Journaled records in, instructions to delete their documents out.
///
/// One instance per journaled record type, each under its own name.
pub struct JournalConfirmationStage<S = EnrichedSubmission> {
    name: &'static str,
    documents: Arc<DocumentStorageGateway>,
    input: Topic<JournalConfirmation<S>>,
    output: Topic<CleanupInstruction>,
}

impl<S> JournalConfirmationStage<S> {
    pub fn new(
        name: &'static str,
        documents: Arc<DocumentStorageGateway>,
        input: &str,
        output: &str,
    ) -> Self {
        Self {
            name,
            documents,
            input: Topic::new(input, 1),
            output: Topic::new(output, 1),
        }
    }
}

#[async_trait]
impl<S> Stage for JournalConfirmationStage<S>
where
    S: StoredDocuments + DeserializeOwned + Send + Sync + 'static,
{
    type Input = JournalConfirmation<S>;
    type Output = CleanupInstruction;

    fn name(&self) -> &str {
        self.name
    }

    fn input(&self) -> &Topic<JournalConfirmation<S>> {
        &self.input
    }

    fn output(&self) -> Option<&Topic<CleanupInstruction>> {
        Some(&self.output)
    }

    fn key<'a>(&self, input: &'a JournalConfirmation<S>) -> Option<&'a str> {
        Some(input.submission.application_id())
    }

    #[instrument(skip_all, fields(
        correlation_id = %envelope.metadata.correlation_id,
        journal_post_id = %envelope.data.journal_post_id,
    ))]
    async fn process(
        &self,
        envelope: Envelope<JournalConfirmation<S>>,
    ) -> Result<CleanupInstruction, ProcessingError> {
        let confirmation = envelope.data;
        let document_locations = confirmation
            .submission
            .document_ids()
            .iter()
            .flatten()
            .map(|id| {
                self.documents
                    .document_location(id)
                    .map_err(|error| ProcessingError::LocationError {
                        id: id.clone(),
                        error,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            documents = document_locations.len(),
            "requesting cleanup of journaled submission"
        );
        Ok(CleanupInstruction {
            journal_post_id: confirmation.journal_post_id,
            document_locations,
            owner: confirmation.submission.owner(),
        })
    }
}

/// Deletes the documents of journaled applications. Publishes nothing.
pub struct CleanupStage {
    documents: Arc<DocumentStorageGateway>,
    input: Topic<CleanupInstruction>,
}

impl CleanupStage {
    pub fn new(documents: Arc<DocumentStorageGateway>, input: &str) -> Self {
        Self {
            documents,
            input: Topic::new(input, 1),
        }
    }
}

#[async_trait]
impl Stage for CleanupStage {
    type Input = CleanupInstruction;
    type Output = ();

    fn name(&self) -> &str {
        CLEANUP
    }

    fn input(&self) -> &Topic<CleanupInstruction> {
        &self.input
    }

    fn output(&self) -> Option<&Topic<()>> {
        None
    }

    #[instrument(skip_all, fields(
        correlation_id = %envelope.metadata.correlation_id,
        journal_post_id = %envelope.data.journal_post_id,
    ))]
    async fn process(&self, envelope: Envelope<CleanupInstruction>) -> Result<(), ProcessingError> {
        let instruction = envelope.data;
        self.documents
            .delete_all(
                &instruction.document_locations,
                &instruction.owner,
                &envelope.metadata.correlation_id,
            )
            .await?;
        Ok(())
    }
}
