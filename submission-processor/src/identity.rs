//! # Identity lookup
//!
//! Resolves national ids to the actor ids the journaling system uses. The
//! national id is a path segment of the registry url and is escaped as one.
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde_derive::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use submission_common::token::{AccessTokenClient, Scopes, TokenError};

use crate::submission::ActorId;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to get an access token: {0}")]
    TokenError(#[from] TokenError),
    #[error("identity lookup failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("identity registry answered {0}")]
    UnexpectedStatus(StatusCode),
    #[error("identity registry url cannot take a path: {0}")]
    InvalidBaseUrl(Url),
}

/// Resolves national ids to internal actor ids.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// `Ok(None)` when the registry does not know the person.
    async fn lookup(
        &self,
        national_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ActorId>, IdentityError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    actor_id: String,
}

pub struct HttpIdentityLookup {
    client: reqwest::Client,
    token_client: Arc<dyn AccessTokenClient>,
    scopes: Scopes,
    base_url: Url,
}

impl HttpIdentityLookup {
    pub fn new(
        client: reqwest::Client,
        token_client: Arc<dyn AccessTokenClient>,
        base_url: &Url,
        scopes: Scopes,
    ) -> Self {
        Self {
            client,
            token_client,
            scopes,
            base_url: base_url.clone(),
        }
    }

    fn identity_url(&self, national_id: &str) -> Result<Url, IdentityError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IdentityError::InvalidBaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["api", "v1", "identer"])
            .push(national_id);
        Ok(url)
    }
}

#[async_trait]
impl IdentityLookup for HttpIdentityLookup {
    async fn lookup(
        &self,
        national_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ActorId>, IdentityError> {
        let authorization = self
            .token_client
            .get_access_token(&self.scopes)
            .await?
            .authorization_header();
        let url = self.identity_url(national_id)?;

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, authorization)
            .header("X-Correlation-Id", correlation_id)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let identity: IdentityResponse = response.json().await?;
                Ok(Some(ActorId(identity.actor_id)))
            }
            StatusCode::NOT_FOUND => {
                debug!(correlation_id, "identity not found");
                Ok(None)
            }
            status => Err(IdentityError::UnexpectedStatus(status)),
        }
    }
}
