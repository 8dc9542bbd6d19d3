use super::models::*;
use super::store::RevenueStore;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

const CONNECTION_COLUMNS: &str = r#"
    id, business_id, source_type, provider, provider_account_id,
    access_token_enc, refresh_token_enc, token_expires_at, status,
    last_synced_at, last_sync_status, last_error, error_count,
    created_at, updated_at
"#;

const RECORD_COLUMNS: &str = r#"
    id, deal_id, period_start, bank_revenue, accounting_revenue,
    verified_revenue, has_discrepancy, discrepancy_amount, discrepancy_ratio,
    discrepancy_notes, status, revenue_share_amount, reviewed_by, reviewed_at,
    created_at, updated_at
"#;

const PAYOUT_COLUMNS: &str = r#"
    id, deal_id, revenue_record_id, period_start, total_revenue,
    revenue_share_amount, platform_fee, net_payout, investor_count,
    scheduled_date, status, created_at, updated_at
"#;

const LOG_COLUMNS: &str = r#"
    id, deal_id, connection_id, source_type, period_start, action, status,
    message, payload, payload_digest, created_at
"#;

/// Ledger repository - Postgres-backed source of truth for the revenue engine
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevenueStore for LedgerRepository {
    // ========== DEALS ==========

    async fn list_payable_deals(&self) -> AppResult<Vec<Deal>> {
        let deals = sqlx::query_as::<_, Deal>(
            r#"
            SELECT id, business_id, name, status, revenue_share_pct, created_at
            FROM deals
            WHERE status IN ('ACTIVE', 'REPAYING')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(deals)
    }

    async fn get_deal(&self, deal_id: Uuid) -> AppResult<Option<Deal>> {
        let deal = sqlx::query_as::<_, Deal>(
            r#"
            SELECT id, business_id, name, status, revenue_share_pct, created_at
            FROM deals
            WHERE id = $1
            "#,
        )
        .bind(deal_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(deal)
    }

    async fn count_active_investments(&self, deal_id: Uuid) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM investments WHERE deal_id = $1 AND status = 'ACTIVE'",
        )
        .bind(deal_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    // ========== CONNECTIONS ==========

    async fn list_connections(&self, business_id: Uuid) -> AppResult<Vec<RevenueConnection>> {
        let connections = sqlx::query_as::<_, RevenueConnection>(&format!(
            "SELECT {} FROM revenue_connections WHERE business_id = $1 ORDER BY source_type",
            CONNECTION_COLUMNS
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(connections)
    }

    async fn get_connection(&self, connection_id: Uuid) -> AppResult<Option<RevenueConnection>> {
        let connection = sqlx::query_as::<_, RevenueConnection>(&format!(
            "SELECT {} FROM revenue_connections WHERE id = $1",
            CONNECTION_COLUMNS
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(connection)
    }

    async fn upsert_connection(&self, connection: NewConnection) -> AppResult<RevenueConnection> {
        let row = sqlx::query_as::<_, RevenueConnection>(&format!(
            r#"
            INSERT INTO revenue_connections (
                business_id, source_type, provider, provider_account_id,
                access_token_enc, refresh_token_enc, token_expires_at, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'VERIFIED')
            ON CONFLICT (business_id, source_type) DO UPDATE SET
                provider = EXCLUDED.provider,
                provider_account_id = EXCLUDED.provider_account_id,
                access_token_enc = EXCLUDED.access_token_enc,
                refresh_token_enc = EXCLUDED.refresh_token_enc,
                token_expires_at = EXCLUDED.token_expires_at,
                status = 'VERIFIED',
                last_error = NULL,
                error_count = 0,
                updated_at = NOW()
            RETURNING {}
            "#,
            CONNECTION_COLUMNS
        ))
        .bind(connection.business_id)
        .bind(connection.source_type)
        .bind(&connection.provider)
        .bind(&connection.provider_account_id)
        .bind(&connection.access_token_enc)
        .bind(&connection.refresh_token_enc)
        .bind(connection.token_expires_at)
        .fetch_one(&self.pool)
        .await?;

        info!("Connection {} authorized for business {} ({})", row.id, row.business_id, row.source_type);
        Ok(row)
    }

    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        // A provider that does not rotate refresh tokens returns none; keep the old one
        let result = sqlx::query(
            r#"
            UPDATE revenue_connections
            SET access_token_enc = $2,
                refresh_token_enc = COALESCE($3, refresh_token_enc),
                token_expires_at = $4,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'DISCONNECTED'
            "#,
        )
        .bind(connection_id)
        .bind(access_token_enc)
        .bind(refresh_token_enc)
        .bind(token_expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Active connection {}", connection_id)));
        }

        Ok(())
    }

    async fn record_sync_success(&self, connection_id: Uuid, synced_at: DateTime<Utc>) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE revenue_connections
            SET last_synced_at = $2,
                last_sync_status = 'success',
                last_error = NULL,
                error_count = 0,
                status = CASE WHEN status = 'DISCONNECTED' THEN status ELSE 'VERIFIED'::connection_status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(connection_id)
        .bind(synced_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_sync_failure(
        &self,
        connection_id: Uuid,
        error: &str,
        force_failed: bool,
        max_errors: i32,
    ) -> AppResult<RevenueConnection> {
        let row = sqlx::query_as::<_, RevenueConnection>(&format!(
            r#"
            UPDATE revenue_connections
            SET error_count = error_count + 1,
                last_error = $2,
                last_sync_status = 'failed',
                status = CASE
                    WHEN status = 'DISCONNECTED' THEN status
                    WHEN $3 OR error_count + 1 >= $4 THEN 'FAILED'::connection_status
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            CONNECTION_COLUMNS
        ))
        .bind(connection_id)
        .bind(error)
        .bind(force_failed)
        .bind(max_errors)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

        debug!(
            "Connection {} failure recorded (count {}, status {:?})",
            row.id, row.error_count, row.status
        );
        Ok(row)
    }

    async fn disconnect_connection(&self, connection_id: Uuid) -> AppResult<RevenueConnection> {
        let row = sqlx::query_as::<_, RevenueConnection>(&format!(
            r#"
            UPDATE revenue_connections
            SET status = 'DISCONNECTED',
                access_token_enc = NULL,
                refresh_token_enc = NULL,
                token_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            CONNECTION_COLUMNS
        ))
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

        Ok(row)
    }

    // ========== BANK DATA ==========

    async fn list_bank_accounts(&self, connection_id: Uuid) -> AppResult<Vec<BankAccount>> {
        let accounts = sqlx::query_as::<_, BankAccount>(
            r#"
            SELECT id, connection_id, external_account_id, name, currency, created_at
            FROM bank_accounts
            WHERE connection_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn upsert_bank_account(
        &self,
        connection_id: Uuid,
        external_account_id: &str,
        name: Option<&str>,
        currency: Option<&str>,
    ) -> AppResult<BankAccount> {
        let account = sqlx::query_as::<_, BankAccount>(
            r#"
            INSERT INTO bank_accounts (connection_id, external_account_id, name, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (connection_id, external_account_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, bank_accounts.name),
                currency = COALESCE(EXCLUDED.currency, bank_accounts.currency)
            RETURNING id, connection_id, external_account_id, name, currency, created_at
            "#,
        )
        .bind(connection_id)
        .bind(external_account_id)
        .bind(name)
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    async fn upsert_bank_transactions(
        &self,
        account_id: Uuid,
        transactions: &[NewBankTransaction],
    ) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for txn in transactions {
            let result = sqlx::query(
                r#"
                INSERT INTO bank_transactions (
                    account_id, external_id, transaction_date, description,
                    amount, running_balance, reference, category
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (account_id, external_id) DO UPDATE SET
                    transaction_date = EXCLUDED.transaction_date,
                    description = EXCLUDED.description,
                    amount = EXCLUDED.amount,
                    running_balance = EXCLUDED.running_balance,
                    reference = EXCLUDED.reference,
                    category = EXCLUDED.category,
                    updated_at = NOW()
                "#,
            )
            .bind(account_id)
            .bind(&txn.external_id)
            .bind(txn.transaction_date)
            .bind(&txn.description)
            .bind(txn.amount)
            .bind(txn.running_balance)
            .bind(&txn.reference)
            .bind(txn.category)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn list_bank_transactions(
        &self,
        account_id: Uuid,
        month: RevenueMonth,
    ) -> AppResult<Vec<BankTransaction>> {
        let rows = sqlx::query_as::<_, BankTransaction>(
            r#"
            SELECT id, account_id, external_id, transaction_date, description, amount,
                   running_balance, reference, category, created_at, updated_at
            FROM bank_transactions
            WHERE account_id = $1 AND transaction_date BETWEEN $2 AND $3
            ORDER BY transaction_date ASC
            "#,
        )
        .bind(account_id)
        .bind(month.first_day())
        .bind(month.last_day())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // ========== REVENUE RECORDS ==========

    async fn get_revenue_record(&self, deal_id: Uuid, month: RevenueMonth) -> AppResult<Option<RevenueRecord>> {
        let record = sqlx::query_as::<_, RevenueRecord>(&format!(
            "SELECT {} FROM revenue_records WHERE deal_id = $1 AND period_start = $2",
            RECORD_COLUMNS
        ))
        .bind(deal_id)
        .bind(month.first_day())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_revenue_record_by_id(&self, record_id: Uuid) -> AppResult<Option<RevenueRecord>> {
        let record = sqlx::query_as::<_, RevenueRecord>(&format!(
            "SELECT {} FROM revenue_records WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert_revenue_record(&self, record: NewRevenueRecord) -> AppResult<Option<RevenueRecord>> {
        // The WHERE on the conflict branch leaves VERIFIED rows untouched and returns no row
        let row = sqlx::query_as::<_, RevenueRecord>(&format!(
            r#"
            INSERT INTO revenue_records (
                deal_id, period_start, bank_revenue, accounting_revenue, verified_revenue,
                has_discrepancy, discrepancy_amount, discrepancy_ratio, discrepancy_notes,
                status, revenue_share_amount
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (deal_id, period_start) DO UPDATE SET
                bank_revenue = EXCLUDED.bank_revenue,
                accounting_revenue = EXCLUDED.accounting_revenue,
                verified_revenue = EXCLUDED.verified_revenue,
                has_discrepancy = EXCLUDED.has_discrepancy,
                discrepancy_amount = EXCLUDED.discrepancy_amount,
                discrepancy_ratio = EXCLUDED.discrepancy_ratio,
                discrepancy_notes = EXCLUDED.discrepancy_notes,
                status = EXCLUDED.status,
                revenue_share_amount = EXCLUDED.revenue_share_amount,
                updated_at = NOW()
            WHERE revenue_records.status <> 'VERIFIED'
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.deal_id)
        .bind(record.month.first_day())
        .bind(record.bank_revenue)
        .bind(record.accounting_revenue)
        .bind(record.verified_revenue)
        .bind(record.has_discrepancy)
        .bind(record.discrepancy_amount)
        .bind(record.discrepancy_ratio)
        .bind(&record.discrepancy_notes)
        .bind(record.status)
        .bind(record.revenue_share_amount)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn resolve_flagged_record(
        &self,
        record_id: Uuid,
        resolution: RecordResolution,
    ) -> AppResult<Option<RevenueRecord>> {
        let row = sqlx::query_as::<_, RevenueRecord>(&format!(
            r#"
            UPDATE revenue_records
            SET status = 'VERIFIED',
                verified_revenue = $2,
                revenue_share_amount = $3,
                reviewed_by = $4,
                reviewed_at = NOW(),
                discrepancy_notes = CONCAT_WS(E'\n', discrepancy_notes, $5),
                updated_at = NOW()
            WHERE id = $1 AND status = 'FLAGGED'
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .bind(resolution.verified_revenue)
        .bind(resolution.revenue_share_amount)
        .bind(&resolution.reviewer)
        .bind(format!("Reviewed by {}: {}", resolution.reviewer, resolution.notes))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_revenue_records(&self, deal_id: Uuid) -> AppResult<Vec<RevenueRecord>> {
        let records = sqlx::query_as::<_, RevenueRecord>(&format!(
            "SELECT {} FROM revenue_records WHERE deal_id = $1 ORDER BY period_start DESC",
            RECORD_COLUMNS
        ))
        .bind(deal_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ========== PAYOUTS ==========

    async fn get_payout_schedule(&self, deal_id: Uuid, month: RevenueMonth) -> AppResult<Option<PayoutSchedule>> {
        let schedule = sqlx::query_as::<_, PayoutSchedule>(&format!(
            "SELECT {} FROM payout_schedules WHERE deal_id = $1 AND period_start = $2",
            PAYOUT_COLUMNS
        ))
        .bind(deal_id)
        .bind(month.first_day())
        .fetch_optional(&self.pool)
        .await?;

        Ok(schedule)
    }

    async fn insert_payout_schedule_if_absent(
        &self,
        schedule: NewPayoutSchedule,
    ) -> AppResult<Option<PayoutSchedule>> {
        // Only a VERIFIED record may back a payout; the join enforces it at write time
        let row = sqlx::query_as::<_, PayoutSchedule>(&format!(
            r#"
            INSERT INTO payout_schedules (
                deal_id, revenue_record_id, period_start, total_revenue,
                revenue_share_amount, platform_fee, net_payout, investor_count,
                scheduled_date, status
            )
            SELECT $1, r.id, $3, $4, $5, $6, $7, $8, $9, 'SCHEDULED'
            FROM revenue_records r
            WHERE r.id = $2 AND r.deal_id = $1 AND r.status = 'VERIFIED'
            ON CONFLICT (deal_id, period_start) DO NOTHING
            RETURNING {}
            "#,
            PAYOUT_COLUMNS
        ))
        .bind(schedule.deal_id)
        .bind(schedule.revenue_record_id)
        .bind(schedule.month.first_day())
        .bind(schedule.total_revenue)
        .bind(schedule.revenue_share_amount)
        .bind(schedule.platform_fee)
        .bind(schedule.net_payout)
        .bind(schedule.investor_count)
        .bind(schedule.scheduled_date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    // ========== AUDIT ==========

    async fn append_verification_log(
        &self,
        entry: NewVerificationLog,
        payload_digest: String,
    ) -> AppResult<VerificationLog> {
        let row = sqlx::query_as::<_, VerificationLog>(&format!(
            r#"
            INSERT INTO verification_logs (
                deal_id, connection_id, source_type, period_start, action, status,
                message, payload, payload_digest
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            LOG_COLUMNS
        ))
        .bind(entry.deal_id)
        .bind(entry.connection_id)
        .bind(entry.source_type)
        .bind(entry.month.map(|m| m.first_day()))
        .bind(entry.action)
        .bind(entry.status)
        .bind(&entry.message)
        .bind(&entry.payload)
        .bind(payload_digest)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn list_verification_logs(
        &self,
        deal_id: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<VerificationLog>> {
        let rows = if let Some(deal_id) = deal_id {
            sqlx::query_as::<_, VerificationLog>(&format!(
                "SELECT {} FROM verification_logs WHERE deal_id = $1 ORDER BY created_at DESC LIMIT $2",
                LOG_COLUMNS
            ))
            .bind(deal_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, VerificationLog>(&format!(
                "SELECT {} FROM verification_logs ORDER BY created_at DESC LIMIT $1",
                LOG_COLUMNS
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows)
    }
}
