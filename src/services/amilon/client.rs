use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use super::{AmilonAuthService, PROVIDER};
use crate::config::AmilonConfig;
use crate::errors::ServiceError;
use crate::tracing::log_api_call;

pub(crate) struct VendorResponse {
    pub status: StatusCode,
    pub body: String,
}

impl VendorResponse {
    /// Amilon sometimes answers with an empty or non-JSON body.
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// Authorized HTTP access to the `/b2bwebapi/v1` API.
#[derive(Clone)]
pub struct AmilonClient {
    auth: Arc<AmilonAuthService>,
    http: reqwest::Client,
    config: AmilonConfig,
}

impl AmilonClient {
    pub fn new(auth: Arc<AmilonAuthService>, config: AmilonConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { auth, http, config }
    }

    pub fn config(&self) -> &AmilonConfig {
        &self.config
    }

    pub async fn is_healthy(&self) -> bool {
        self.auth.is_healthy().await
    }

    /// Sends with the cached token; on 401 refreshes it and resends once.
    pub(crate) async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
    ) -> Result<VendorResponse, ServiceError> {
        let token = self.auth.get_access_token().await?;
        let response = self
            .send_once(method.clone(), path, path, &token, payload)
            .await?;

        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(path, "Amilon authentication failed, refreshing token and retrying");
        let token = self.auth.refresh_token().await?;
        let retry_path = format!("{path} (retry)");
        self.send_once(method, path, &retry_path, &token, payload)
            .await
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        log_path: &str,
        token: &str,
        payload: Option<&Value>,
    ) -> Result<VendorResponse, ServiceError> {
        let url = format!("{}{}", self.config.base_url(), path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT_LANGUAGE, &self.config.culture);
        if let Some(body) = payload {
            request = request.json(body);
        }

        let started = Instant::now();
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                log_api_call(
                    PROVIDER,
                    method.as_str(),
                    log_path,
                    Some(status.as_u16()),
                    started.elapsed(),
                );
                let body = response.text().await.unwrap_or_default();
                Ok(VendorResponse { status, body })
            }
            Err(e) => {
                log_api_call(PROVIDER, method.as_str(), log_path, None, started.elapsed());
                Err(ServiceError::AmilonOrder(format!("Amilon request failed: {e}")))
            }
        }
    }
}
