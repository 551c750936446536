use std::convert::Infallible;
use std::str::FromStr;
use std::time;

use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;
use submission_common::retry::RetryPolicy;
use submission_common::token::Scopes;
use url::Url;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub topics: TopicConfig,

    #[envconfig(nested = true)]
    pub document_storage: DocumentStorageConfig,

    #[envconfig(nested = true)]
    pub auth: AuthConfig,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    #[envconfig(default = "http://localhost:8092")]
    pub identity_base_url: Url,

    #[envconfig(default = "api://identity-registry/.default")]
    pub identity_scopes: ScopeList,

    #[envconfig(default = "30000")]
    pub request_timeout: EnvMsDuration,

    // How long a stream may keep failing to consume before it is reported unhealthy
    #[envconfig(default = "300000")]
    pub stream_grace_period: EnvMsDuration,

    // Failed records are forwarded here when set, and dropped otherwise
    pub dead_letter_topic: Option<String>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct TopicConfig {
    #[envconfig(default = "mottatt")]
    pub received_topic: String,

    #[envconfig(default = "preprosessert")]
    pub preprocessed_topic: String,

    #[envconfig(default = "journalfort")]
    pub journaled_topic: String,

    #[envconfig(default = "cleanup")]
    pub cleanup_topic: String,

    #[envconfig(default = "ettersending-mottatt")]
    pub supplementary_received_topic: String,

    #[envconfig(default = "ettersending-preprosessert")]
    pub supplementary_preprocessed_topic: String,

    #[envconfig(default = "ettersending-journalfort")]
    pub supplementary_journaled_topic: String,

    #[envconfig(default = "mottatt-overforedager")]
    pub day_transfer_received_topic: String,

    #[envconfig(default = "preprosessert-overforedager")]
    pub day_transfer_preprocessed_topic: String,
}

#[derive(Envconfig, Clone)]
pub struct DocumentStorageConfig {
    #[envconfig(default = "http://localhost:8090")]
    pub document_storage_base_url: Url,

    #[envconfig(default = "api://document-storage/.default")]
    pub document_storage_store_scopes: ScopeList,

    #[envconfig(default = "api://document-storage/.default")]
    pub document_storage_delete_scopes: ScopeList,
}

#[derive(Envconfig, Clone)]
pub struct AuthConfig {
    #[envconfig(default = "http://localhost:8091/oauth2/v2.0/token")]
    pub auth_token_endpoint: Url,

    #[envconfig(default = "submission-processor")]
    pub auth_client_id: String,

    pub auth_client_secret: String,
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2.0")]
    pub backoff_coefficient: f64,

    #[envconfig(default = "200")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_attempts: u32,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// OAuth2 scopes, separated by commas or whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeList(pub Scopes);

impl FromStr for ScopeList {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ScopeList(
            s.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|scope| !scope.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scope_list() {
        let scopes: ScopeList = "a/.default, b/.default  c/.default,".parse().unwrap();
        assert_eq!(
            scopes.0.into_iter().collect::<Vec<_>>(),
            vec!["a/.default", "b/.default", "c/.default"]
        );
    }

    #[test]
    fn parse_ms_duration() {
        let duration: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(duration.0, time::Duration::from_millis(1500));
        assert_eq!(
            "soon".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }

    #[test]
    fn retry_policy_from_config() {
        let config = RetryPolicyConfig {
            backoff_coefficient: 2.0,
            initial_interval: EnvMsDuration(time::Duration::from_millis(200)),
            maximum_interval: EnvMsDuration(time::Duration::from_millis(1000)),
            max_attempts: 3,
        };

        let policy = config.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_interval(1), time::Duration::from_millis(200));
        assert_eq!(policy.retry_interval(4), time::Duration::from_millis(1000));
    }
}
