use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Persistence seam for the revenue engine
///
/// INVARIANTS every implementation must uphold:
/// - at most one connection per (business, source type)
/// - bank transactions are unique per (account, external id); re-sending updates in place
/// - at most one revenue record and one payout schedule per (deal, month)
/// - VERIFIED revenue records are never rewritten by `upsert_revenue_record`
/// - verification logs are append-only
#[async_trait]
pub trait RevenueStore: Send + Sync {
    // ========== DEALS ==========

    /// Deals with status ACTIVE or REPAYING
    async fn list_payable_deals(&self) -> AppResult<Vec<Deal>>;

    async fn get_deal(&self, deal_id: Uuid) -> AppResult<Option<Deal>>;

    async fn count_active_investments(&self, deal_id: Uuid) -> AppResult<i64>;

    // ========== CONNECTIONS ==========

    async fn list_connections(&self, business_id: Uuid) -> AppResult<Vec<RevenueConnection>>;

    async fn get_connection(&self, connection_id: Uuid) -> AppResult<Option<RevenueConnection>>;

    /// Insert or re-authorize the (business, source type) connection as VERIFIED
    async fn upsert_connection(&self, connection: NewConnection) -> AppResult<RevenueConnection>;

    /// Replace stored tokens after a refresh
    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<()>;

    /// Reset error count and stamp the last successful sync
    async fn record_sync_success(&self, connection_id: Uuid, synced_at: DateTime<Utc>) -> AppResult<()>;

    /// Increment the error count and record the error. Status degrades to FAILED
    /// when `force_failed` is set or the count reaches `max_errors`.
    async fn record_sync_failure(
        &self,
        connection_id: Uuid,
        error: &str,
        force_failed: bool,
        max_errors: i32,
    ) -> AppResult<RevenueConnection>;

    /// Status transition to DISCONNECTED; tokens are cleared, the row is kept
    async fn disconnect_connection(&self, connection_id: Uuid) -> AppResult<RevenueConnection>;

    // ========== BANK DATA ==========

    async fn list_bank_accounts(&self, connection_id: Uuid) -> AppResult<Vec<BankAccount>>;

    async fn upsert_bank_account(
        &self,
        connection_id: Uuid,
        external_account_id: &str,
        name: Option<&str>,
        currency: Option<&str>,
    ) -> AppResult<BankAccount>;

    /// Returns the number of rows written (inserted or updated)
    async fn upsert_bank_transactions(
        &self,
        account_id: Uuid,
        transactions: &[NewBankTransaction],
    ) -> AppResult<u64>;

    async fn list_bank_transactions(
        &self,
        account_id: Uuid,
        month: RevenueMonth,
    ) -> AppResult<Vec<BankTransaction>>;

    // ========== REVENUE RECORDS ==========

    async fn get_revenue_record(&self, deal_id: Uuid, month: RevenueMonth) -> AppResult<Option<RevenueRecord>>;

    async fn get_revenue_record_by_id(&self, record_id: Uuid) -> AppResult<Option<RevenueRecord>>;

    /// Insert, or update a non-VERIFIED record in place. Returns `None` when a
    /// VERIFIED record already exists for (deal, month) and was left untouched.
    async fn upsert_revenue_record(&self, record: NewRevenueRecord) -> AppResult<Option<RevenueRecord>>;

    /// FLAGGED → VERIFIED after human review. Returns `None` if the record is
    /// missing or not FLAGGED.
    async fn resolve_flagged_record(
        &self,
        record_id: Uuid,
        resolution: RecordResolution,
    ) -> AppResult<Option<RevenueRecord>>;

    async fn list_revenue_records(&self, deal_id: Uuid) -> AppResult<Vec<RevenueRecord>>;

    // ========== PAYOUTS ==========

    async fn get_payout_schedule(&self, deal_id: Uuid, month: RevenueMonth) -> AppResult<Option<PayoutSchedule>>;

    /// Returns `None` when a schedule already exists for (deal, month)
    async fn insert_payout_schedule_if_absent(
        &self,
        schedule: NewPayoutSchedule,
    ) -> AppResult<Option<PayoutSchedule>>;

    // ========== AUDIT ==========

    async fn append_verification_log(
        &self,
        entry: NewVerificationLog,
        payload_digest: String,
    ) -> AppResult<VerificationLog>;

    async fn list_verification_logs(
        &self,
        deal_id: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<VerificationLog>>;
}
