use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::http::{read_json, with_retry, RetryPolicy};
use super::traits::{OAuthClient, TokenSet};
use crate::error::ProviderError;
use crate::ledger::models::SourceType;

/// OAuth2 endpoints and client credentials for one provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider_name: String,
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Token endpoint response (RFC 6749 §5.1)
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl From<TokenResponse> for TokenSet {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            expires_at: response.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }
}

/// OAuth2 client speaking the standard code / refresh grants over HTTP
pub struct HttpOAuthClient {
    source: SourceType,
    config: OAuthConfig,
    http: Client,
    retry: RetryPolicy,
}

impl HttpOAuthClient {
    pub fn new(source: SourceType, config: OAuthConfig, http: Client, retry: RetryPolicy) -> Self {
        Self { source, config, http, retry }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, ProviderError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(self.source, e))?;

        let body: TokenResponse = read_json(self.source, response).await?;
        Ok(body.into())
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    fn source(&self) -> SourceType {
        self.source
    }

    fn provider_name(&self) -> &str {
        &self.config.provider_name
    }

    fn authorization_url(&self, state: &str) -> Result<String, ProviderError> {
        let scope = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| ProviderError::Rejected {
            provider: self.source,
            status: 0,
            message: format!("invalid authorize url: {}", e),
        })?;

        Ok(url.to_string())
    }

    #[instrument(skip(self, code), fields(provider = %self.source))]
    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError> {
        // Authorization codes are single-use; a retried exchange would be rejected
        debug!("Exchanging authorization code");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    #[instrument(skip(self, refresh_token), fields(provider = %self.source))]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ProviderError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        with_retry(&self.retry, "token refresh", || self.token_request(&form)).await
    }
}
