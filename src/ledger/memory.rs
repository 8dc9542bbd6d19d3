use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::RevenueStore;
use crate::error::{AppError, AppResult};

/// In-memory store with the same uniqueness rules as the Postgres schema
#[derive(Default)]
pub struct InMemoryStore {
    deals: RwLock<HashMap<Uuid, Deal>>,
    investments: RwLock<HashMap<Uuid, Vec<InvestmentStatus>>>,
    connections: RwLock<HashMap<Uuid, RevenueConnection>>,
    accounts: RwLock<HashMap<Uuid, BankAccount>>,
    transactions: RwLock<HashMap<(Uuid, String), BankTransaction>>,
    records: RwLock<HashMap<(Uuid, RevenueMonth), RevenueRecord>>,
    payouts: RwLock<HashMap<(Uuid, RevenueMonth), PayoutSchedule>>,
    logs: RwLock<Vec<VerificationLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_deal(&self, deal: Deal) {
        self.deals.write().await.insert(deal.id, deal);
    }

    pub async fn add_investment(&self, deal_id: Uuid, status: InvestmentStatus) {
        self.investments
            .write()
            .await
            .entry(deal_id)
            .or_default()
            .push(status);
    }

    pub async fn insert_connection(&self, connection: RevenueConnection) {
        self.connections.write().await.insert(connection.id, connection);
    }

    pub async fn all_transactions(&self) -> Vec<BankTransaction> {
        self.transactions.read().await.values().cloned().collect()
    }

    pub async fn all_records(&self) -> Vec<RevenueRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn all_payouts(&self) -> Vec<PayoutSchedule> {
        self.payouts.read().await.values().cloned().collect()
    }

    pub async fn all_logs(&self) -> Vec<VerificationLog> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl RevenueStore for InMemoryStore {
    async fn list_payable_deals(&self) -> AppResult<Vec<Deal>> {
        let mut deals: Vec<Deal> = self
            .deals
            .read()
            .await
            .values()
            .filter(|d| d.status.is_payable())
            .cloned()
            .collect();
        deals.sort_by_key(|d| d.created_at);
        Ok(deals)
    }

    async fn get_deal(&self, deal_id: Uuid) -> AppResult<Option<Deal>> {
        Ok(self.deals.read().await.get(&deal_id).cloned())
    }

    async fn count_active_investments(&self, deal_id: Uuid) -> AppResult<i64> {
        Ok(self
            .investments
            .read()
            .await
            .get(&deal_id)
            .map(|all| all.iter().filter(|s| **s == InvestmentStatus::Active).count() as i64)
            .unwrap_or(0))
    }

    async fn list_connections(&self, business_id: Uuid) -> AppResult<Vec<RevenueConnection>> {
        Ok(self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.business_id == business_id)
            .cloned()
            .collect())
    }

    async fn get_connection(&self, connection_id: Uuid) -> AppResult<Option<RevenueConnection>> {
        Ok(self.connections.read().await.get(&connection_id).cloned())
    }

    async fn upsert_connection(&self, connection: NewConnection) -> AppResult<RevenueConnection> {
        let mut connections = self.connections.write().await;
        let now = Utc::now();

        if let Some(existing) = connections
            .values_mut()
            .find(|c| c.business_id == connection.business_id && c.source_type == connection.source_type)
        {
            existing.provider = connection.provider;
            existing.provider_account_id = connection.provider_account_id;
            existing.access_token_enc = Some(connection.access_token_enc);
            existing.refresh_token_enc = connection.refresh_token_enc;
            existing.token_expires_at = connection.token_expires_at;
            existing.status = ConnectionStatus::Verified;
            existing.last_error = None;
            existing.error_count = 0;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let row = RevenueConnection {
            id: Uuid::new_v4(),
            business_id: connection.business_id,
            source_type: connection.source_type,
            provider: connection.provider,
            provider_account_id: connection.provider_account_id,
            access_token_enc: Some(connection.access_token_enc),
            refresh_token_enc: connection.refresh_token_enc,
            token_expires_at: connection.token_expires_at,
            status: ConnectionStatus::Verified,
            last_synced_at: None,
            last_sync_status: None,
            last_error: None,
            error_count: 0,
            created_at: now,
            updated_at: now,
        };
        connections.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_connection_tokens(
        &self,
        connection_id: Uuid,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .filter(|c| c.status != ConnectionStatus::Disconnected)
            .ok_or_else(|| AppError::NotFound(format!("Active connection {}", connection_id)))?;

        connection.access_token_enc = Some(access_token_enc.to_string());
        if let Some(refresh) = refresh_token_enc {
            connection.refresh_token_enc = Some(refresh.to_string());
        }
        connection.token_expires_at = token_expires_at;
        connection.updated_at = Utc::now();
        Ok(())
    }

    async fn record_sync_success(&self, connection_id: Uuid, synced_at: DateTime<Utc>) -> AppResult<()> {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(&connection_id) {
            connection.last_synced_at = Some(synced_at);
            connection.last_sync_status = Some("success".to_string());
            connection.last_error = None;
            connection.error_count = 0;
            if connection.status != ConnectionStatus::Disconnected {
                connection.status = ConnectionStatus::Verified;
            }
        }
        Ok(())
    }

    async fn record_sync_failure(
        &self,
        connection_id: Uuid,
        error: &str,
        force_failed: bool,
        max_errors: i32,
    ) -> AppResult<RevenueConnection> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

        connection.error_count += 1;
        connection.last_error = Some(error.to_string());
        connection.last_sync_status = Some("failed".to_string());
        if connection.status != ConnectionStatus::Disconnected
            && (force_failed || connection.error_count >= max_errors)
        {
            connection.status = ConnectionStatus::Failed;
        }
        Ok(connection.clone())
    }

    async fn disconnect_connection(&self, connection_id: Uuid) -> AppResult<RevenueConnection> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

        connection.status = ConnectionStatus::Disconnected;
        connection.access_token_enc = None;
        connection.refresh_token_enc = None;
        connection.token_expires_at = None;
        Ok(connection.clone())
    }

    async fn list_bank_accounts(&self, connection_id: Uuid) -> AppResult<Vec<BankAccount>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .filter(|a| a.connection_id == connection_id)
            .cloned()
            .collect())
    }

    async fn upsert_bank_account(
        &self,
        connection_id: Uuid,
        external_account_id: &str,
        name: Option<&str>,
        currency: Option<&str>,
    ) -> AppResult<BankAccount> {
        let mut accounts = self.accounts.write().await;
        if let Some(existing) = accounts
            .values_mut()
            .find(|a| a.connection_id == connection_id && a.external_account_id == external_account_id)
        {
            if let Some(name) = name {
                existing.name = Some(name.to_string());
            }
            if let Some(currency) = currency {
                existing.currency = Some(currency.to_string());
            }
            return Ok(existing.clone());
        }

        let account = BankAccount {
            id: Uuid::new_v4(),
            connection_id,
            external_account_id: external_account_id.to_string(),
            name: name.map(str::to_string),
            currency: currency.map(str::to_string),
            created_at: Utc::now(),
        };
        accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn upsert_bank_transactions(
        &self,
        account_id: Uuid,
        transactions: &[NewBankTransaction],
    ) -> AppResult<u64> {
        let mut rows = self.transactions.write().await;
        let now = Utc::now();

        for txn in transactions {
            let key = (account_id, txn.external_id.clone());
            match rows.get_mut(&key) {
                Some(existing) => {
                    existing.transaction_date = txn.transaction_date;
                    existing.description = txn.description.clone();
                    existing.amount = txn.amount;
                    existing.running_balance = txn.running_balance;
                    existing.reference = txn.reference.clone();
                    existing.category = txn.category;
                    existing.updated_at = now;
                }
                None => {
                    rows.insert(
                        key,
                        BankTransaction {
                            id: Uuid::new_v4(),
                            account_id,
                            external_id: txn.external_id.clone(),
                            transaction_date: txn.transaction_date,
                            description: txn.description.clone(),
                            amount: txn.amount,
                            running_balance: txn.running_balance,
                            reference: txn.reference.clone(),
                            category: txn.category,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }

        Ok(transactions.len() as u64)
    }

    async fn list_bank_transactions(
        &self,
        account_id: Uuid,
        month: RevenueMonth,
    ) -> AppResult<Vec<BankTransaction>> {
        let mut rows: Vec<BankTransaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|t| t.account_id == account_id && month.contains(t.transaction_date))
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.transaction_date);
        Ok(rows)
    }

    async fn get_revenue_record(&self, deal_id: Uuid, month: RevenueMonth) -> AppResult<Option<RevenueRecord>> {
        Ok(self.records.read().await.get(&(deal_id, month)).cloned())
    }

    async fn get_revenue_record_by_id(&self, record_id: Uuid) -> AppResult<Option<RevenueRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.id == record_id)
            .cloned())
    }

    async fn upsert_revenue_record(&self, record: NewRevenueRecord) -> AppResult<Option<RevenueRecord>> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let key = (record.deal_id, record.month);

        if let Some(existing) = records.get_mut(&key) {
            if existing.status == RevenueStatus::Verified {
                return Ok(None);
            }
            existing.bank_revenue = record.bank_revenue;
            existing.accounting_revenue = record.accounting_revenue;
            existing.verified_revenue = record.verified_revenue;
            existing.has_discrepancy = record.has_discrepancy;
            existing.discrepancy_amount = record.discrepancy_amount;
            existing.discrepancy_ratio = record.discrepancy_ratio;
            existing.discrepancy_notes = record.discrepancy_notes;
            existing.status = record.status;
            existing.revenue_share_amount = record.revenue_share_amount;
            existing.updated_at = now;
            return Ok(Some(existing.clone()));
        }

        let row = RevenueRecord {
            id: Uuid::new_v4(),
            deal_id: record.deal_id,
            period_start: record.month.first_day(),
            bank_revenue: record.bank_revenue,
            accounting_revenue: record.accounting_revenue,
            verified_revenue: record.verified_revenue,
            has_discrepancy: record.has_discrepancy,
            discrepancy_amount: record.discrepancy_amount,
            discrepancy_ratio: record.discrepancy_ratio,
            discrepancy_notes: record.discrepancy_notes,
            status: record.status,
            revenue_share_amount: record.revenue_share_amount,
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(key, row.clone());
        Ok(Some(row))
    }

    async fn resolve_flagged_record(
        &self,
        record_id: Uuid,
        resolution: RecordResolution,
    ) -> AppResult<Option<RevenueRecord>> {
        let mut records = self.records.write().await;
        let Some(record) = records
            .values_mut()
            .find(|r| r.id == record_id && r.status == RevenueStatus::Flagged)
        else {
            return Ok(None);
        };

        let note = format!("Reviewed by {}: {}", resolution.reviewer, resolution.notes);
        record.status = RevenueStatus::Verified;
        record.verified_revenue = resolution.verified_revenue;
        record.revenue_share_amount = resolution.revenue_share_amount;
        record.reviewed_by = Some(resolution.reviewer);
        record.reviewed_at = Some(Utc::now());
        record.discrepancy_notes = Some(match record.discrepancy_notes.take() {
            Some(existing) => format!("{}\n{}", existing, note),
            None => note,
        });
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn list_revenue_records(&self, deal_id: Uuid) -> AppResult<Vec<RevenueRecord>> {
        let mut rows: Vec<RevenueRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.deal_id == deal_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        Ok(rows)
    }

    async fn get_payout_schedule(&self, deal_id: Uuid, month: RevenueMonth) -> AppResult<Option<PayoutSchedule>> {
        Ok(self.payouts.read().await.get(&(deal_id, month)).cloned())
    }

    async fn insert_payout_schedule_if_absent(
        &self,
        schedule: NewPayoutSchedule,
    ) -> AppResult<Option<PayoutSchedule>> {
        let verified = self
            .records
            .read()
            .await
            .get(&(schedule.deal_id, schedule.month))
            .map(|r| r.id == schedule.revenue_record_id && r.status == RevenueStatus::Verified)
            .unwrap_or(false);
        if !verified {
            return Ok(None);
        }

        let mut payouts = self.payouts.write().await;
        let key = (schedule.deal_id, schedule.month);
        if payouts.contains_key(&key) {
            return Ok(None);
        }

        let now = Utc::now();
        let row = PayoutSchedule {
            id: Uuid::new_v4(),
            deal_id: schedule.deal_id,
            revenue_record_id: schedule.revenue_record_id,
            period_start: schedule.month.first_day(),
            total_revenue: schedule.total_revenue,
            revenue_share_amount: schedule.revenue_share_amount,
            platform_fee: schedule.platform_fee,
            net_payout: schedule.net_payout,
            investor_count: schedule.investor_count,
            scheduled_date: schedule.scheduled_date,
            status: PayoutStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };
        payouts.insert(key, row.clone());
        Ok(Some(row))
    }

    async fn append_verification_log(
        &self,
        entry: NewVerificationLog,
        payload_digest: String,
    ) -> AppResult<VerificationLog> {
        let row = VerificationLog {
            id: Uuid::new_v4(),
            deal_id: entry.deal_id,
            connection_id: entry.connection_id,
            source_type: entry.source_type,
            period_start: entry.month.map(|m| m.first_day()),
            action: entry.action,
            status: entry.status,
            message: entry.message,
            payload: entry.payload,
            payload_digest,
            created_at: Utc::now(),
        };
        self.logs.write().await.push(row.clone());
        Ok(row)
    }

    async fn list_verification_logs(
        &self,
        deal_id: Option<Uuid>,
        limit: i64,
    ) -> AppResult<Vec<VerificationLog>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .rev()
            .filter(|l| deal_id.is_none() || l.deal_id == deal_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
