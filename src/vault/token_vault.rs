use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::cipher::TokenCipher;
use crate::audit::AuditLogger;
use crate::error::{AppError, AppResult, VaultError};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;
use crate::sources::traits::{OAuthClient, TokenSet};

/// Token vault configuration
#[derive(Debug, Clone)]
pub struct TokenVaultConfig {
    /// Tokens expiring within this window are refreshed early
    pub refresh_skew_seconds: i64,
    /// Consecutive transient failures before a connection degrades to FAILED
    pub max_consecutive_errors: i32,
}

impl Default for TokenVaultConfig {
    fn default() -> Self {
        Self {
            refresh_skew_seconds: 60,
            max_consecutive_errors: 3,
        }
    }
}

/// Decrypted, currently valid credential for one connection
#[derive(Clone)]
pub struct Credential {
    pub connection_id: Uuid,
    pub access_token: String,
    pub provider_account_id: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("connection_id", &self.connection_id)
            .field("access_token", &"<redacted>")
            .field("provider_account_id", &self.provider_account_id)
            .finish()
    }
}

/// Token vault - the only path that mutates stored OAuth tokens
pub struct TokenVault {
    config: TokenVaultConfig,
    cipher: Arc<TokenCipher>,
    store: Arc<dyn RevenueStore>,
    audit: Arc<AuditLogger>,
    oauth_clients: HashMap<SourceType, Arc<dyn OAuthClient>>,
    refresh_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenVault {
    pub fn new(
        config: TokenVaultConfig,
        cipher: Arc<TokenCipher>,
        store: Arc<dyn RevenueStore>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            config,
            cipher,
            store,
            audit,
            oauth_clients: HashMap::new(),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_oauth_client(&mut self, client: Arc<dyn OAuthClient>) {
        info!("Registering OAuth client: {} ({})", client.provider_name(), client.source());
        self.oauth_clients.insert(client.source(), client);
    }

    pub fn oauth_client(&self, source: SourceType) -> Result<Arc<dyn OAuthClient>, VaultError> {
        self.oauth_clients
            .get(&source)
            .cloned()
            .ok_or(VaultError::NoOAuthClient(source))
    }

    pub fn config(&self) -> &TokenVaultConfig {
        &self.config
    }

    fn lock_for(&self, connection_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(connection_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Return a currently valid credential, refreshing and persisting new
    /// tokens first if the stored access token has expired.
    ///
    /// Refreshes for the same connection are serialized: a caller that waited
    /// on the lock re-reads the connection and reuses the token the previous
    /// holder stored instead of refreshing again.
    #[instrument(skip(self, connection), fields(connection_id = %connection.id, source = %connection.source_type))]
    pub async fn credential_for(&self, connection: &RevenueConnection) -> AppResult<Credential> {
        let lock = self.lock_for(connection.id);
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_connection(connection.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection.id)))?;

        if current.status == ConnectionStatus::Disconnected {
            return Err(VaultError::Disconnected(current.id).into());
        }

        let skew = Duration::seconds(self.config.refresh_skew_seconds);
        if !current.token_expired(Utc::now(), skew) {
            return match self.unseal_access_token(&current) {
                Ok(access_token) => Ok(Credential {
                    connection_id: current.id,
                    access_token,
                    provider_account_id: current.provider_account_id.clone(),
                }),
                Err(error) => Err(self.reject_stored_credential(&current, error).await),
            };
        }

        self.refresh(&current).await
    }

    fn unseal_access_token(&self, connection: &RevenueConnection) -> Result<String, VaultError> {
        let sealed = connection
            .access_token_enc
            .as_deref()
            .ok_or(VaultError::MissingAccessToken(connection.id))?;
        self.cipher.decrypt(sealed)
    }

    /// A stored token that cannot be used needs a fresh authorization: the
    /// connection goes to FAILED immediately and the attempt is logged.
    async fn reject_stored_credential(&self, connection: &RevenueConnection, error: VaultError) -> AppError {
        warn!("Stored credential for connection {} is unusable: {}", connection.id, error);

        let updated = match self
            .store
            .record_sync_failure(connection.id, &error.to_string(), true, self.config.max_consecutive_errors)
            .await
        {
            Ok(updated) => updated,
            Err(db_error) => return db_error,
        };

        self.audit
            .record(
                NewVerificationLog::new(VerificationAction::CredentialRejected, AttemptStatus::Failure)
                    .connection(connection)
                    .message(error.to_string())
                    .payload(serde_json::json!({
                        "key_id": self.cipher.key_id(),
                        "error_count": updated.error_count,
                        "status": updated.status,
                    })),
            )
            .await;

        error.into()
    }

    async fn refresh(&self, connection: &RevenueConnection) -> AppResult<Credential> {
        info!("Access token expired for connection {}, refreshing", connection.id);

        let result = self.try_refresh(connection).await;

        match result {
            Ok(tokens) => {
                let access_enc = self.cipher.encrypt(&tokens.access_token)?;
                let refresh_enc = tokens
                    .refresh_token
                    .as_deref()
                    .map(|t| self.cipher.encrypt(t))
                    .transpose()?;

                self.store
                    .update_connection_tokens(
                        connection.id,
                        &access_enc,
                        refresh_enc.as_deref(),
                        tokens.expires_at,
                    )
                    .await?;

                self.audit
                    .record(
                        NewVerificationLog::new(VerificationAction::TokenRefresh, AttemptStatus::Success)
                            .connection(connection)
                            .payload(serde_json::json!({
                                "expires_at": tokens.expires_at,
                                "refresh_token_rotated": tokens.refresh_token.is_some(),
                            })),
                    )
                    .await;

                info!("✓ Refreshed tokens for connection {}", connection.id);

                Ok(Credential {
                    connection_id: connection.id,
                    access_token: tokens.access_token,
                    provider_account_id: connection.provider_account_id.clone(),
                })
            }
            Err(error) => {
                let auth_failure = error.is_credential_failure();
                warn!(
                    "Token refresh failed for connection {} (auth failure: {}): {}",
                    connection.id, auth_failure, error
                );

                // Credential failures need a fresh manual authorization; transient
                // ones degrade only after repeated attempts
                let updated = self
                    .store
                    .record_sync_failure(
                        connection.id,
                        &error.to_string(),
                        auth_failure,
                        self.config.max_consecutive_errors,
                    )
                    .await?;

                self.audit
                    .record(
                        NewVerificationLog::new(VerificationAction::TokenRefresh, AttemptStatus::Failure)
                            .connection(connection)
                            .message(error.to_string())
                            .payload(serde_json::json!({
                                "auth_failure": auth_failure,
                                "error_count": updated.error_count,
                                "status": updated.status,
                            })),
                    )
                    .await;

                Err(VaultError::RefreshFailed {
                    connection_id: connection.id,
                    reason: error.to_string(),
                    auth_failure,
                }
                .into())
            }
        }
    }

    async fn try_refresh(&self, connection: &RevenueConnection) -> AppResult<TokenSet> {
        let sealed = connection
            .refresh_token_enc
            .as_deref()
            .ok_or(VaultError::MissingRefreshToken(connection.id))?;
        let refresh_token = self.cipher.decrypt(sealed)?;
        let client = self.oauth_client(connection.source_type)?;

        Ok(client.refresh(&refresh_token).await?)
    }

    /// Exchange an authorization code and store the encrypted tokens as a
    /// VERIFIED connection for (business, source)
    #[instrument(skip(self, code))]
    pub async fn authorize(
        &self,
        business_id: Uuid,
        source: SourceType,
        code: &str,
        provider_account_id: Option<String>,
    ) -> AppResult<RevenueConnection> {
        let client = self.oauth_client(source)?;
        let tokens = client.exchange_code(code).await?;

        let connection = self
            .store
            .upsert_connection(NewConnection {
                business_id,
                source_type: source,
                provider: client.provider_name().to_string(),
                provider_account_id,
                access_token_enc: self.cipher.encrypt(&tokens.access_token)?,
                refresh_token_enc: tokens
                    .refresh_token
                    .as_deref()
                    .map(|t| self.cipher.encrypt(t))
                    .transpose()?,
                token_expires_at: tokens.expires_at,
            })
            .await?;

        self.audit
            .record(
                NewVerificationLog::new(VerificationAction::ConnectionAuthorized, AttemptStatus::Success)
                    .connection(&connection)
                    .payload(serde_json::json!({
                        "business_id": business_id,
                        "provider": connection.provider,
                        "expires_at": tokens.expires_at,
                    })),
            )
            .await;

        Ok(connection)
    }

    /// Status transition to DISCONNECTED; tokens are wiped, the row stays
    pub async fn disconnect(&self, connection_id: Uuid) -> AppResult<RevenueConnection> {
        let lock = self.lock_for(connection_id);
        let _guard = lock.lock().await;

        let connection = self.store.disconnect_connection(connection_id).await?;

        self.audit
            .record(
                NewVerificationLog::new(VerificationAction::ConnectionDisconnected, AttemptStatus::Success)
                    .connection(&connection),
            )
            .await;

        info!("Connection {} disconnected", connection_id);
        Ok(connection)
    }
}
