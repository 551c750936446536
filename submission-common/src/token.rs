//! # Token
//!
//! Access tokens for outgoing requests: the `AccessTokenClient` seam, an
//! OAuth2 client credentials implementation, and a cache keeping one token
//! per scope set.
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time;

use async_trait::async_trait;
use metrics::counter;
use reqwest::StatusCode;
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

pub type Scopes = BTreeSet<String>;

/// Build a scope set from anything iterable over string-likes.
pub fn scopes<I, S>(scopes: I) -> Scopes
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    scopes.into_iter().map(Into::into).collect()
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("failed to request an access token: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("token endpoint answered {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("no access token available for scopes {0:?}")]
    Unavailable(Scopes),
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    pub token_type: String,
    pub expires_at: Instant,
    pub expires_in: time::Duration,
}

impl AccessToken {
    pub fn new(token: &str, token_type: &str, expires_in: time::Duration) -> Self {
        Self {
            token: token.to_owned(),
            token_type: token_type.to_owned(),
            expires_at: Instant::now() + expires_in,
            expires_in,
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }

    /// Whether the token can still be used for `leeway`, so a request is
    /// never sent with a token about to expire in flight.
    ///
    /// The leeway is capped at half the token's lifetime: a short lived
    /// token is still reused for the first half of its life.
    pub fn is_valid_for(&self, leeway: time::Duration) -> bool {
        let leeway = leeway.min(self.expires_in / 2);
        Instant::now() + leeway < self.expires_at
    }
}

#[async_trait]
pub trait AccessTokenClient: Send + Sync {
    async fn get_access_token(&self, scopes: &Scopes) -> Result<AccessToken, TokenError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    expires_in: u64,
}

/// Gets tokens from an OAuth2 token endpoint with the client credentials grant.
pub struct ClientCredentialsClient {
    client: reqwest::Client,
    token_endpoint: url::Url,
    client_id: String,
    client_secret: String,
}

impl ClientCredentialsClient {
    pub fn new(
        client: reqwest::Client,
        token_endpoint: url::Url,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            client,
            token_endpoint,
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
        }
    }
}

#[async_trait]
impl AccessTokenClient for ClientCredentialsClient {
    async fn get_access_token(&self, scopes: &Scopes) -> Result<AccessToken, TokenError> {
        let scope = scopes.iter().cloned().collect::<Vec<_>>().join(" ");
        debug!(scope = %scope, "requesting access token");

        let response = self
            .client
            .post(self.token_endpoint.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::UnexpectedStatus { status, body });
        }

        let body: TokenResponse = response.json().await?;
        Ok(AccessToken::new(
            &body.access_token,
            body.token_type.as_deref().unwrap_or("Bearer"),
            time::Duration::from_secs(body.expires_in),
        ))
    }
}

type Slot = Arc<RwLock<Option<AccessToken>>>;

/// Keeps one token per scope set in front of another `AccessTokenClient`.
///
/// Callers holding a valid token share a read lock on their scope set's slot.
/// A stale slot is refreshed under the write lock, and whoever waited on that
/// lock finds the new token on its second look: at most one refresh is in
/// flight per scope set, while distinct scope sets refresh independently.
pub struct CachedAccessTokenClient {
    client: Arc<dyn AccessTokenClient>,
    leeway: time::Duration,
    slots: Mutex<HashMap<Scopes, Slot>>,
}

impl CachedAccessTokenClient {
    pub fn new(client: Arc<dyn AccessTokenClient>) -> Self {
        Self {
            client,
            leeway: time::Duration::from_secs(10),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_leeway(mut self, leeway: time::Duration) -> Self {
        self.leeway = leeway;
        self
    }

    fn slot(&self, scopes: &Scopes) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(scopes.clone()).or_default().clone()
    }

    fn cached(&self, slot: &Option<AccessToken>) -> Option<AccessToken> {
        slot.as_ref()
            .filter(|token| token.is_valid_for(self.leeway))
            .cloned()
    }
}

#[async_trait]
impl AccessTokenClient for CachedAccessTokenClient {
    async fn get_access_token(&self, scopes: &Scopes) -> Result<AccessToken, TokenError> {
        let slot = self.slot(scopes);

        if let Some(token) = self.cached(&*slot.read().await) {
            counter!("access_token_cache_hits_total").increment(1);
            return Ok(token);
        }

        let mut cached = slot.write().await;
        if let Some(token) = self.cached(&cached) {
            // Refreshed by the caller we were waiting on
            counter!("access_token_cache_hits_total").increment(1);
            return Ok(token);
        }

        counter!("access_token_cache_misses_total").increment(1);
        let token = self.client.get_access_token(scopes).await?;
        info!(?scopes, "refreshed access token");
        *cached = Some(token.clone());
        Ok(token)
    }
}
