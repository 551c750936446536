//! # Document storage
//!
//! Client for the document storage service: attachments are stored there
//! while an application is processed, and deleted once it is journaled.
use std::sync::Arc;

use async_trait::async_trait;
use health::{HealthCheck, HealthCheckResult};
use metrics::counter;
use reqwest::header::{AUTHORIZATION, LOCATION};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};
use url::Url;

use submission_common::retry::{AttemptError, RetryError, RetryPolicy};
use submission_common::token::{AccessTokenClient, CachedAccessTokenClient, Scopes, TokenError};

use crate::submission::{Document, DocumentOwner};

const STORE_OPERATION: &str = "store-document";
const DELETE_OPERATION: &str = "delete-document";
const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// Why a single store request failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("document storage answered {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("document stored without a valid Location header")]
    MissingLocation,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to get an access token: {0}")]
    TokenError(#[from] TokenError),
    #[error(transparent)]
    StoreError(#[from] RetryError<StoreError>),
    #[error("document task failed: {0}")]
    TaskError(#[from] JoinError),
    #[error("invalid document url: {0}")]
    UrlError(#[from] url::ParseError),
}

/// Counts of a best effort deletion.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: usize,
    pub failed: usize,
}

pub struct DocumentStorageGateway {
    client: reqwest::Client,
    /// Uncached, used by health checks to really reach the token endpoint.
    token_client: Arc<dyn AccessTokenClient>,
    cached_token_client: CachedAccessTokenClient,
    store_scopes: Scopes,
    delete_scopes: Scopes,
    documents_url: Url,
    retry_policy: RetryPolicy,
}

impl DocumentStorageGateway {
    pub fn new(
        client: reqwest::Client,
        token_client: Arc<dyn AccessTokenClient>,
        base_url: &Url,
        store_scopes: Scopes,
        delete_scopes: Scopes,
        retry_policy: RetryPolicy,
    ) -> Result<Self, url::ParseError> {
        let documents_url = format!("{}/v1/dokument", base_url.as_str().trim_end_matches('/'));

        Ok(Self {
            client,
            cached_token_client: CachedAccessTokenClient::new(token_client.clone()),
            token_client,
            store_scopes,
            delete_scopes,
            documents_url: documents_url.parse()?,
            retry_policy,
        })
    }

    /// Location of the document stored under `id`.
    pub fn document_location(&self, id: &str) -> Result<Url, url::ParseError> {
        format!("{}/{}", self.documents_url, id).parse()
    }

    /// Store every document concurrently, returning their locations in
    /// input order.
    ///
    /// Each document is retried on its own. As soon as one of them is given
    /// up on, the others are aborted and the whole batch fails: nothing is
    /// returned for the documents that did get stored.
    pub async fn store_all(
        &self,
        documents: Vec<Document>,
        correlation_id: &str,
    ) -> Result<Vec<Url>, GatewayError> {
        let authorization = self
            .cached_token_client
            .get_access_token(&self.store_scopes)
            .await?
            .authorization_header();

        let mut set = JoinSet::new();
        let count = documents.len();
        for (index, document) in documents.into_iter().enumerate() {
            let client = self.client.clone();
            let url = self.documents_url.clone();
            let authorization = authorization.clone();
            let correlation_id = correlation_id.to_owned();
            let retry_policy = self.retry_policy.clone();

            set.spawn(async move {
                let location = retry_policy
                    .retry(STORE_OPERATION, || {
                        store(&client, &url, &authorization, &correlation_id, &document)
                    })
                    .await;
                (index, location)
            });
        }

        let mut locations: Vec<Option<Url>> = vec![None; count];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(location))) => locations[index] = Some(location),
                Ok((_, Err(error))) => {
                    error!(correlation_id, "giving up storing documents: {}", error);
                    set.abort_all();
                    return Err(error.into());
                }
                Err(error) => {
                    set.abort_all();
                    return Err(error.into());
                }
            }
        }

        info!(correlation_id, count, "stored documents");
        Ok(locations.into_iter().flatten().collect())
    }

    /// Delete every document concurrently. Deletion is best effort: failures
    /// are logged and counted, never retried. Only failing to get a token
    /// fails the call.
    pub async fn delete_all(
        &self,
        locations: &[Url],
        owner: &DocumentOwner,
        correlation_id: &str,
    ) -> Result<DeleteReport, GatewayError> {
        let authorization = self
            .cached_token_client
            .get_access_token(&self.delete_scopes)
            .await?
            .authorization_header();

        let mut set = JoinSet::new();
        for location in locations {
            let request = self
                .client
                .delete(location.clone())
                .header(AUTHORIZATION, &authorization)
                .header(CORRELATION_ID_HEADER, correlation_id)
                .json(owner);
            let location = location.clone();

            set.spawn(async move {
                match request.send().await {
                    Ok(response) if response.status() == StatusCode::NO_CONTENT => true,
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        warn!(%location, %status, body = %body, "failed to delete document");
                        false
                    }
                    Err(error) => {
                        warn!(%location, "failed to delete document: {}", error);
                        false
                    }
                }
            });
        }

        let mut report = DeleteReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => report.deleted += 1,
                Ok(false) => report.failed += 1,
                Err(error) => {
                    warn!("document deletion task failed: {}", error);
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            counter!("document_delete_failures_total").increment(report.failed as u64);
        }
        info!(
            correlation_id,
            deleted = report.deleted,
            failed = report.failed,
            "deleted documents"
        );
        Ok(report)
    }

    async fn check_access_token(&self, operation: &str, scopes: &Scopes) -> HealthCheckResult {
        match self.token_client.get_access_token(scopes).await {
            Ok(_) => HealthCheckResult::healthy(operation, "access token ok"),
            Err(error) => {
                error!(operation, "failed to get access token: {}", error);
                HealthCheckResult::unhealthy(operation, "failed to get access token")
            }
        }
    }
}

#[async_trait]
impl HealthCheck for DocumentStorageGateway {
    async fn check(&self) -> HealthCheckResult {
        let (store, delete) = tokio::join!(
            self.check_access_token(STORE_OPERATION, &self.store_scopes),
            self.check_access_token(DELETE_OPERATION, &self.delete_scopes),
        );
        HealthCheckResult::combine([store, delete]).with_detail("name", "DocumentStorageGateway")
    }
}

/// Id of the document stored at `location`: the last segment of its path.
pub fn document_id(location: &Url) -> Option<String> {
    location
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_owned)
}

async fn store(
    client: &reqwest::Client,
    url: &Url,
    authorization: &str,
    correlation_id: &str,
    document: &Document,
) -> Result<Url, AttemptError<StoreError>> {
    let response = client
        .post(url.clone())
        .header(AUTHORIZATION, authorization)
        .header(CORRELATION_ID_HEADER, correlation_id)
        .json(document)
        .send()
        .await
        .map_err(|error| AttemptError::Retryable(StoreError::from(error)))?;

    let status = response.status();
    counter!("document_store_attempts_total", "status" => status.as_u16().to_string())
        .increment(1);

    if status != StatusCode::CREATED {
        let body = response.text().await.unwrap_or_default();
        return Err(AttemptError::Retryable(StoreError::UnexpectedStatus {
            status,
            body,
        }));
    }

    // Storing again would only duplicate the document
    response
        .headers()
        .get(LOCATION)
        .and_then(|location| location.to_str().ok())
        .and_then(|location| url.join(location).ok())
        .ok_or(AttemptError::NonRetryable(StoreError::MissingLocation))
}
