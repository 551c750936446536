//! Health reporting for the dependencies and loops of the service.
//!
//! Each component that talks to something outside the process (a token
//! endpoint, a document store, a Kafka consume loop) implements
//! [`HealthCheck`] and returns a map from operation name to a human readable
//! status. The process status is the combination of these results:
//!   - if any check is unhealthy, the process is unhealthy
//!   - if every registered check is healthy, the process is healthy
//!   - with no check registered, the process is unhealthy
//!
//! Checks never fail: anything that goes wrong while checking is reported as
//! an unhealthy entry in the returned map.
//!
//! Liveness and readiness are answered separately by the stream lifecycle,
//! this registry only backs the detailed health endpoint.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

pub type HealthDetails = BTreeMap<String, String>;

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "status", content = "details", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckResult {
    Healthy(HealthDetails),
    Unhealthy(HealthDetails),
}

impl HealthCheckResult {
    pub fn healthy(operation: &str, message: &str) -> Self {
        HealthCheckResult::Healthy(BTreeMap::from([(
            operation.to_owned(),
            message.to_owned(),
        )]))
    }

    pub fn unhealthy(operation: &str, message: &str) -> Self {
        HealthCheckResult::Unhealthy(BTreeMap::from([(
            operation.to_owned(),
            message.to_owned(),
        )]))
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthCheckResult::Healthy(_))
    }

    pub fn details(&self) -> &HealthDetails {
        match self {
            HealthCheckResult::Healthy(details) | HealthCheckResult::Unhealthy(details) => details,
        }
    }

    fn into_details(self) -> HealthDetails {
        match self {
            HealthCheckResult::Healthy(details) | HealthCheckResult::Unhealthy(details) => details,
        }
    }

    /// Merge several results into one: details are unioned, and the result
    /// is unhealthy as soon as one of the inputs is.
    pub fn combine(results: impl IntoIterator<Item = HealthCheckResult>) -> Self {
        let mut healthy = true;
        let mut details = HealthDetails::new();
        for result in results {
            healthy &= result.is_healthy();
            details.extend(result.into_details());
        }
        if healthy {
            HealthCheckResult::Healthy(details)
        } else {
            HealthCheckResult::Unhealthy(details)
        }
    }

    /// Attach an extra entry, typically the component name.
    pub fn with_detail(mut self, key: &str, value: &str) -> Self {
        match &mut self {
            HealthCheckResult::Healthy(details) | HealthCheckResult::Unhealthy(details) => {
                drop(details.insert(key.to_owned(), value.to_owned()))
            }
        }
        self
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthCheckResult;
}

#[derive(Default, Debug, Serialize)]
pub struct HealthStatus {
    /// The overall status: true if all checks are healthy
    pub healthy: bool,
    /// Result of each registered check, for display
    pub components: BTreeMap<String, HealthCheckResult>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and renders each check result in the body for debugging.
    fn into_response(self) -> Response {
        let status = match self.healthy {
            true => StatusCode::OK,
            false => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(self)).into_response()
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    checks: Vec<(String, Arc<dyn HealthCheck>)>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            checks: Vec::new(),
        }
    }

    /// Registers a check under the given component name.
    pub fn register(mut self, component: &str, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push((component.to_owned(), check));
        self
    }

    /// Runs every registered check concurrently and returns the overall
    /// status. Can be used as an axum handler.
    pub async fn get_status(&self) -> HealthStatus {
        let results = futures::future::join_all(
            self.checks
                .iter()
                .map(|(component, check)| async move { (component.clone(), check.check().await) }),
        )
        .await;

        let status = results.into_iter().fold(
            HealthStatus {
                healthy: !self.checks.is_empty(), // unhealthy if no check has registered yet
                components: Default::default(),
            },
            |mut status, (component, result)| {
                status.healthy &= result.is_healthy();
                drop(status.components.insert(component, result));
                status
            },
        );

        match status.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, status.components),
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(HealthCheckResult);

    #[async_trait]
    impl HealthCheck for Fixed {
        async fn check(&self) -> HealthCheckResult {
            self.0.clone()
        }
    }

    #[test]
    fn combine_is_unhealthy_if_any_is() {
        let combined = HealthCheckResult::combine([
            HealthCheckResult::healthy("store", "ok"),
            HealthCheckResult::unhealthy("delete", "failed"),
        ]);

        assert!(!combined.is_healthy());
        assert_eq!(combined.details().len(), 2);
        assert_eq!(combined.details().get("delete").unwrap(), "failed");

        let combined = HealthCheckResult::combine([
            HealthCheckResult::healthy("store", "ok"),
            HealthCheckResult::healthy("delete", "ok"),
        ])
        .with_detail("name", "gateway");
        assert!(combined.is_healthy());
        assert_eq!(combined.details().get("name").unwrap(), "gateway");
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("health");
        assert!(!registry.get_status().await.healthy);
    }

    #[tokio::test]
    async fn several_checks() {
        let registry = HealthRegistry::new("health")
            .register(
                "one",
                Arc::new(Fixed(HealthCheckResult::healthy("op", "ok"))),
            )
            .register(
                "two",
                Arc::new(Fixed(HealthCheckResult::healthy("op", "ok"))),
            );
        let status = registry.get_status().await;
        assert!(status.healthy);
        assert_eq!(status.components.len(), 2);

        let registry = registry.register(
            "three",
            Arc::new(Fixed(HealthCheckResult::unhealthy("op", "down"))),
        );
        let status = registry.get_status().await;
        assert!(!status.healthy);
        assert!(!status.components.get("three").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
