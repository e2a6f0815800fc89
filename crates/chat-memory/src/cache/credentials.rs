use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::{CacheAuthConfig, CacheAuthMode};
use crate::utils::{SessionError, SessionResult, Tier};

/// Credential presented to the cache server on connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCredential {
    pub username: Option<String>,
    pub password: Option<String>,
    /// None = never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheCredential {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
            expires_at: None,
        }
    }

    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_at {
            None => false,
            Some(at) => {
                let margin = ChronoDuration::from_std(margin).unwrap_or(ChronoDuration::zero());
                Utc::now() + margin >= at
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self) -> SessionResult<CacheCredential>;
}

pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn fetch(&self) -> SessionResult<CacheCredential> {
        Ok(CacheCredential::anonymous())
    }
}

pub struct StaticCredentials {
    credential: CacheCredential,
}

impl StaticCredentials {
    pub fn new(username: Option<String>, password: String) -> Self {
        Self {
            credential: CacheCredential {
                username,
                password: Some(password),
                expires_at: None,
            },
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch(&self) -> SessionResult<CacheCredential> {
        Ok(self.credential.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Short-lived access tokens from an HTTP token endpoint
pub struct TokenEndpointCredentials {
    client: Client,
    token_url: String,
    username: Option<String>,
}

impl TokenEndpointCredentials {
    pub fn new(token_url: String, username: Option<String>, timeout: Duration) -> SessionResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Config(format!("token client: {}", e)))?;
        Ok(Self {
            client,
            token_url,
            username,
        })
    }
}

#[async_trait]
impl CredentialProvider for TokenEndpointCredentials {
    async fn fetch(&self) -> SessionResult<CacheCredential> {
        let response = self
            .client
            .get(&self.token_url)
            .send()
            .await
            .map_err(|e| SessionError::connectivity(Tier::Cache, format!("token endpoint: {}", e)))?;

        if !response.status().is_success() {
            return Err(SessionError::connectivity(
                Tier::Cache,
                format!("token endpoint returned {}", response.status()),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::connectivity(Tier::Cache, format!("token body: {}", e)))?;

        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        debug!("Fetched cache access token (expires_at={:?})", expires_at);

        Ok(CacheCredential {
            username: self.username.clone(),
            password: Some(token.access_token),
            expires_at,
        })
    }
}

/// Build the provider selected by `cache.auth.mode`
pub fn provider_from_config(
    auth: &CacheAuthConfig,
    timeout: Duration,
) -> SessionResult<Box<dyn CredentialProvider>> {
    match auth.mode {
        CacheAuthMode::None => Ok(Box::new(NoCredentials)),
        CacheAuthMode::Password => {
            let password = auth
                .password
                .clone()
                .ok_or_else(|| SessionError::Config("cache.auth.password is required".into()))?;
            Ok(Box::new(StaticCredentials::new(auth.username.clone(), password)))
        }
        CacheAuthMode::TokenEndpoint => {
            let url = auth
                .token_url
                .clone()
                .ok_or_else(|| SessionError::Config("cache.auth.token_url is required".into()))?;
            Ok(Box::new(TokenEndpointCredentials::new(
                url,
                auth.username.clone(),
                timeout,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_margin() {
        let mut credential = CacheCredential::anonymous();
        assert!(!credential.expires_within(Duration::from_secs(3600)));

        credential.expires_at = Some(Utc::now() + ChronoDuration::seconds(60));
        assert!(credential.expires_within(Duration::from_secs(300)));
        assert!(!credential.expires_within(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let provider = StaticCredentials::new(Some("app".into()), "s3cret".into());
        let credential = provider.fetch().await.unwrap();
        assert_eq!(credential.username.as_deref(), Some("app"));
        assert_eq!(credential.password.as_deref(), Some("s3cret"));
        assert!(credential.expires_at.is_none());
    }

    #[test]
    fn test_provider_from_config_requires_password() {
        let auth = CacheAuthConfig {
            mode: CacheAuthMode::Password,
            ..CacheAuthConfig::default()
        };
        assert!(matches!(
            provider_from_config(&auth, Duration::from_secs(1)),
            Err(SessionError::Config(_))
        ));
    }
}
