//! Upstream refresh credential exchange.
//!
//! The identity provider's protocol is out of scope; the core only needs
//! "refresh credential in, credential pair out". [`HttpTokenExchanger`]
//! speaks the common OAuth 2.0 `refresh_token` grant.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::clock::DynClock;
use crate::config::UpstreamConfig;
use crate::types::CredentialPair;
use crate::{AuthError, AuthResult};

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Why an exchange failed.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The provider refused the credential.
    #[error("refresh credential rejected: {message}")]
    Rejected { message: String },

    /// The provider could not be reached or answered with a server error.
    #[error("upstream unavailable: {message}")]
    Transport { message: String },
}

impl From<ExchangeError> for AuthError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Rejected { message } => AuthError::invalid_credential(message),
            ExchangeError::Transport { message } => AuthError::upstream_exchange(message),
        }
    }
}

/// Exchanges a refresh credential for a new credential pair.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<CredentialPair, ExchangeError>;
}

pub type DynTokenExchanger = Arc<dyn TokenExchanger>;

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenEndpointError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenEndpointError {
    fn message(self, status: reqwest::StatusCode) -> String {
        match (self.error, self.error_description) {
            (Some(error), Some(description)) => format!("{error}: {description}"),
            (Some(error), None) => error,
            (None, Some(description)) => description,
            (None, None) => format!("token endpoint returned {status}"),
        }
    }
}

/// OAuth 2.0 `refresh_token` grant over HTTP.
pub struct HttpTokenExchanger {
    http_client: reqwest::Client,
    endpoint: Url,
    client_id: Option<String>,
    client_secret: Option<String>,
    clock: DynClock,
}

impl HttpTokenExchanger {
    /// Builds an exchanger from the upstream configuration.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if no valid token endpoint is configured or the
    /// HTTP client cannot be created.
    pub fn new(config: &UpstreamConfig, clock: DynClock) -> AuthResult<Self> {
        let endpoint = config
            .token_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::configuration("upstream.token_endpoint is not set"))?;
        let endpoint = Url::parse(endpoint).map_err(|e| {
            AuthError::configuration(format!("invalid upstream.token_endpoint: {e}"))
        })?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            endpoint,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            clock,
        })
    }
}

impl std::fmt::Debug for HttpTokenExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenExchanger")
            .field("endpoint", &self.endpoint.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, refresh_token: &str) -> Result<CredentialPair, ExchangeError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = &self.client_id {
            form.push(("client_id", client_id.as_str()));
        }
        if let Some(client_secret) = &self.client_secret {
            form.push(("client_secret", client_secret.as_str()));
        }

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport {
                message: format!("token endpoint request failed: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        {
            let body = response
                .json::<TokenEndpointError>()
                .await
                .unwrap_or_default();
            return Err(ExchangeError::Rejected {
                message: body.message(status),
            });
        }
        if !status.is_success() {
            tracing::warn!(status = %status, endpoint = %self.endpoint, "Token endpoint failed");
            return Err(ExchangeError::Transport {
                message: format!("token endpoint returned {status}"),
            });
        }

        let body: TokenEndpointResponse =
            response.json().await.map_err(|e| ExchangeError::Transport {
                message: format!("invalid token endpoint response: {e}"),
            })?;

        let mut pair = CredentialPair::new(
            body.access_token,
            body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            self.clock.now(),
        );
        pair.refresh_token = body.refresh_token;
        pair.refresh_expires_in = body.refresh_expires_in;
        pair.scope = body.scope;
        if let Some(token_type) = body.token_type {
            pair.token_type = token_type;
        }
        Ok(pair)
    }
}
