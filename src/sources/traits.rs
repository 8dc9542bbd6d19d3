use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ProviderError};
use crate::ledger::models::{RevenueConnection, RevenueMonth, SourceType};
use crate::vault::Credential;

/// Tokens returned by an OAuth2 token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    /// Absent when the provider does not rotate refresh tokens
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// OAuth2 code exchange and refresh for one provider
#[async_trait]
pub trait OAuthClient: Send + Sync {
    fn source(&self) -> SourceType;

    fn provider_name(&self) -> &str;

    /// URL the business is sent to for consent; `state` round-trips to the callback
    fn authorization_url(&self, state: &str) -> Result<String, ProviderError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, ProviderError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ProviderError>;
}

/// Bank account as reported by the bank feed provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderBankAccount {
    pub external_id: String,
    pub name: Option<String>,
    pub currency: Option<String>,
}

/// Bank transaction after schema validation
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTransaction {
    pub external_id: String,
    pub date: NaiveDate,
    pub description: String,
    /// Signed: credits are positive, debits negative
    pub amount: Decimal,
    pub running_balance: Option<Decimal>,
    pub reference: Option<String>,
}

#[async_trait]
pub trait BankFeedApi: Send + Sync {
    async fn list_accounts(&self, access_token: &str) -> Result<Vec<ProviderBankAccount>, ProviderError>;

    async fn list_transactions(
        &self,
        access_token: &str,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderTransaction>, ProviderError>;
}

/// One labeled line of a profit-and-loss report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportLine {
    /// Title of the report section the line sits in ("Income", "Operating Expenses")
    pub section: Option<String>,
    pub label: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfitAndLossReport {
    pub lines: Vec<ReportLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInvoice {
    pub external_id: String,
    pub status: String,
    pub date: NaiveDate,
    pub total: Decimal,
}

#[async_trait]
pub trait AccountingApi: Send + Sync {
    async fn profit_and_loss(
        &self,
        access_token: &str,
        tenant_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<ProfitAndLossReport, ProviderError>;

    async fn list_invoices(
        &self,
        access_token: &str,
        tenant_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderInvoice>, ProviderError>;
}

/// Normalized monthly figure from one source
#[derive(Debug, Clone, Serialize)]
pub struct SourceRevenue {
    pub source: SourceType,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
    /// Source-specific breakdown kept in the audit trail
    pub details: serde_json::Value,
}

/// A fetcher that turns one provider's data into a monthly revenue total
#[async_trait]
pub trait RevenueSource: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch_monthly_revenue(
        &self,
        connection: &RevenueConnection,
        credential: &Credential,
        month: RevenueMonth,
    ) -> AppResult<SourceRevenue>;
}
