use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::AmilonConfig;
use crate::errors::AmilonAuthError;
use crate::tracing::log_api_call;

/// Lifetime Amilon assumes when the token response carries no `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 300;
/// Tokens are dropped this long before the identity server expires them.
const EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Obtains and caches bearer tokens for the Amilon B2B API (OAuth password grant).
pub struct AmilonAuthService {
    client: reqwest::Client,
    config: AmilonConfig,
    cache: RwLock<Option<CachedToken>>,
}

impl AmilonAuthService {
    pub fn new(config: AmilonConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(client, config)
    }

    pub fn with_client(client: reqwest::Client, config: AmilonConfig) -> Self {
        Self {
            client,
            config,
            cache: RwLock::new(None),
        }
    }

    /// Returns the cached token while it is valid, otherwise fetches a new one.
    pub async fn get_access_token(&self) -> Result<String, AmilonAuthError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if cached.is_valid() {
                return Ok(cached.token.clone());
            }
        }

        let mut guard = self.cache.write().await;
        // another task may have refreshed while we waited for the lock
        if let Some(cached) = guard.as_ref() {
            if cached.is_valid() {
                return Ok(cached.token.clone());
            }
        }

        let (token, lifetime) = self.fetch().await?;
        *guard = (!lifetime.is_zero()).then(|| CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token)
    }

    /// Drops the cached token and fetches a new one unconditionally.
    pub async fn refresh_token(&self) -> Result<String, AmilonAuthError> {
        let mut guard = self.cache.write().await;
        *guard = None;
        info!("Refreshing Amilon access token");

        let (token, lifetime) = self.fetch().await?;
        *guard = (!lifetime.is_zero()).then(|| CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token)
    }

    pub async fn is_healthy(&self) -> bool {
        match self.get_access_token().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Amilon authentication health check failed");
                false
            }
        }
    }

    fn check_credentials(&self) -> Result<(), AmilonAuthError> {
        let required = [
            ("token_url", &self.config.token_url),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("username", &self.config.username),
            ("password", &self.config.password),
        ];
        match required.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(AmilonAuthError::MissingCredentials(*name)),
            None => Ok(()),
        }
    }

    async fn fetch(&self) -> Result<(String, Duration), AmilonAuthError> {
        self.check_credentials()?;

        let form = [
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
            ("scope", self.config.scope.as_str()),
        ];

        let started = Instant::now();
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                log_api_call("amilon", "POST", "/connect/token", None, started.elapsed());
                error!(error = %e, "Amilon token request failed");
                AmilonAuthError::Transport(e.to_string())
            })?;

        let status = response.status();
        log_api_call(
            "amilon",
            "POST",
            "/connect/token",
            Some(status.as_u16()),
            started.elapsed(),
        );

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Amilon rejected the token request");
            return Err(AmilonAuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AmilonAuthError::InvalidResponse(e.to_string()))?;

        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AmilonAuthError::InvalidResponse("missing access_token".into()))?;

        let expires_in = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let lifetime = cache_lifetime(expires_in, self.config.token_cache_ttl_secs);
        debug!(expires_in, cache_secs = lifetime.as_secs(), "Amilon access token obtained");

        Ok((token, lifetime))
    }
}

fn cache_lifetime(expires_in: u64, ttl_secs: u64) -> Duration {
    Duration::from_secs(expires_in.saturating_sub(EXPIRY_MARGIN_SECS).min(ttl_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(token_url: String) -> AmilonConfig {
        AmilonConfig {
            api_url: "http://unused".into(),
            token_url,
            client_id: "client".into(),
            client_secret: "secret".into(),
            username: "engage".into(),
            password: "pw".into(),
            contract_id: "contract-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn lifetime_keeps_a_minute_of_margin_and_respects_ttl() {
        assert_eq!(cache_lifetime(300, 240), Duration::from_secs(240));
        assert_eq!(cache_lifetime(120, 240), Duration::from_secs(60));
        assert_eq!(cache_lifetime(30, 240), Duration::ZERO);
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("scope=b2b.webapi"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok-1", "expires_in": 300})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let auth = AmilonAuthService::new(config(format!("{}/connect/token", server.uri())));
        assert_eq!(auth.get_access_token().await.unwrap(), "tok-1");
        assert_eq!(auth.get_access_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn refresh_always_hits_the_identity_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 300})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let auth = AmilonAuthService::new(config(format!("{}/connect/token", server.uri())));
        auth.get_access_token().await.unwrap();
        auth.refresh_token().await.unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_a_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut cfg = config(format!("{}/connect/token", server.uri()));
        cfg.password = String::new();
        let auth = AmilonAuthService::new(cfg);

        assert_matches!(
            auth.get_access_token().await,
            Err(AmilonAuthError::MissingCredentials("password"))
        );
        assert!(!auth.is_healthy().await);
    }

    #[tokio::test]
    async fn rejected_and_malformed_responses_are_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let auth = AmilonAuthService::new(config(format!("{}/bad", server.uri())));
        assert_matches!(
            auth.get_access_token().await,
            Err(AmilonAuthError::Rejected { status: 400, ref body }) if body == "invalid_grant"
        );

        let auth = AmilonAuthService::new(config(format!("{}/empty", server.uri())));
        assert_matches!(
            auth.get_access_token().await,
            Err(AmilonAuthError::InvalidResponse(_))
        );
    }
}
