use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use super::oauth_state::PendingAuthorizations;
use crate::error::{AppError, AppResult};
use crate::jobs::{MonthlyRevenueJob, RunSummary};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;
use crate::revenue::RevenueReview;
use crate::sources::{BankFeedFetcher, SourceRegistry};
use crate::vault::TokenVault;

const DEFAULT_LOG_LIMIT: i64 = 100;
const MAX_LOG_LIMIT: i64 = 500;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RevenueStore>,
    pub vault: Arc<TokenVault>,
    pub sources: Arc<SourceRegistry>,
    /// Present when bank feed credentials are configured
    pub bank_feed: Option<Arc<BankFeedFetcher>>,
    pub job: Arc<MonthlyRevenueJob>,
    pub review: Arc<RevenueReview>,
    /// OAuth `state` values awaiting their callback
    pub pending_authorizations: Arc<PendingAuthorizations>,
    pub cron_secret: Arc<str>,
    pub operator_secret: Arc<str>,
    pub shutdown: watch::Receiver<bool>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let sources = state.sources.registered();
    Json(HealthResponse {
        status: if sources.is_empty() { "degraded" } else { "healthy" }.to_string(),
        timestamp: Utc::now(),
        sources,
    })
}

// ========== JOBS ==========

/// POST /api/v1/jobs/revenue-verification - run the monthly job on demand
///
/// The body is optional; an empty body verifies the previous calendar month.
pub async fn run_revenue_verification(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<RunSummary>> {
    let request: RunJobRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunJobRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::InvalidInput(format!("Invalid JSON: {}", e)))?
    };

    let month = match request.month.as_deref() {
        Some(month) => RevenueMonth::from_str(month)?,
        None => RevenueMonth::previous_to(Utc::now().date_naive()),
    };

    info!("🔄 Manual revenue verification requested for {}", month);
    let summary = state.job.run(month, state.shutdown.clone()).await?;
    Ok(Json(summary))
}

// ========== CONNECTIONS ==========

/// GET /api/v1/connections/:source/authorize?business_id=
pub async fn authorize_connection(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> AppResult<Json<AuthorizeResponse>> {
    let source = SourceType::from_str(&source)?;
    let client = state.vault.oauth_client(source)?;

    let oauth_state = state.pending_authorizations.issue(query.business_id, source);
    let authorization_url = client.authorization_url(&oauth_state)?;

    Ok(Json(AuthorizeResponse {
        source,
        authorization_url,
        state: oauth_state,
    }))
}

/// POST /api/v1/connections/:source/callback
pub async fn connection_callback(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(request): Json<CallbackRequest>,
) -> AppResult<Json<ConnectionResponse>> {
    let source = SourceType::from_str(&source)?;
    if request.code.trim().is_empty() {
        return Err(AppError::InvalidInput("code is required".to_string()));
    }
    state
        .pending_authorizations
        .redeem(request.state.trim(), request.business_id, source)?;

    let connection = state
        .vault
        .authorize(
            request.business_id,
            source,
            request.code.trim(),
            request.provider_account_id.filter(|id| !id.trim().is_empty()),
        )
        .await?;
    info!("✅ {} connection {} authorized for business {}", source, connection.id, request.business_id);

    let mut bank_accounts = Vec::new();
    if let (SourceType::BankFeed, Some(bank_feed)) = (source, state.bank_feed.as_ref()) {
        let credential = state.vault.credential_for(&connection).await?;
        match bank_feed.register_accounts(&connection, &credential).await {
            Ok(accounts) => bank_accounts = accounts,
            // Accounts are discovered again on the first fetch
            Err(e) => warn!("⚠️ Could not register bank accounts for connection {}: {}", connection.id, e),
        }
    }

    Ok(Json(ConnectionResponse {
        connection,
        bank_accounts,
    }))
}

/// POST /api/v1/connections/:id/disconnect
pub async fn disconnect_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> AppResult<Json<RevenueConnection>> {
    let connection = state.vault.disconnect(connection_id).await?;
    Ok(Json(connection))
}

/// GET /api/v1/connections/:id/transactions?month=YYYY-MM
pub async fn list_connection_transactions(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
    Query(query): Query<TransactionsQuery>,
) -> AppResult<Json<ConnectionTransactionsResponse>> {
    let month = RevenueMonth::from_str(&query.month)?;
    state
        .store
        .get_connection(connection_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("connection {}", connection_id)))?;

    let mut accounts = Vec::new();
    for account in state.store.list_bank_accounts(connection_id).await? {
        let transactions = state.store.list_bank_transactions(account.id, month).await?;
        accounts.push(AccountTransactions { account, transactions });
    }

    Ok(Json(ConnectionTransactionsResponse {
        connection_id,
        month,
        accounts,
    }))
}

// ========== REVENUE RECORDS ==========

/// POST /api/v1/revenue-records/:id/resolve
pub async fn resolve_revenue_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    Json(request): Json<ResolveRecordRequest>,
) -> AppResult<Json<ResolveRecordResponse>> {
    let outcome = state
        .review
        .resolve(record_id, request.verified_revenue, request.reviewer.trim(), request.notes.trim())
        .await?;

    Ok(Json(ResolveRecordResponse {
        payout_created: outcome.payout.is_new(),
        payout: outcome.payout.schedule().clone(),
        record: outcome.record,
    }))
}

/// GET /api/v1/deals/:deal_id/revenue-records
pub async fn list_revenue_records(
    State(state): State<AppState>,
    Path(deal_id): Path<Uuid>,
) -> AppResult<Json<RevenueRecordsResponse>> {
    state
        .store
        .get_deal(deal_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("deal {}", deal_id)))?;

    let records = state.store.list_revenue_records(deal_id).await?;
    Ok(Json(RevenueRecordsResponse { deal_id, records }))
}

/// GET /api/v1/verification-logs?deal_id=&limit=
pub async fn list_verification_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Json<VerificationLogsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let logs = state.store.list_verification_logs(query.deal_id, limit).await?;

    Ok(Json(VerificationLogsResponse {
        count: logs.len(),
        logs,
    }))
}
