use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Revenue data source a business can connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "source_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    BankFeed,
    Accounting,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::BankFeed => "bank_feed",
            SourceType::Accounting => "accounting",
        }
    }

    pub fn all() -> Vec<SourceType> {
        vec![SourceType::BankFeed, SourceType::Accounting]
    }
}

impl FromStr for SourceType {
    type Err = AppError;

    /// Accepts the path forms used by the HTTP surface (`bank-feed`) as well as
    /// the storage forms (`bank_feed`, `BANK_FEED`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "bank_feed" => Ok(SourceType::BankFeed),
            "accounting" => Ok(SourceType::Accounting),
            other => Err(AppError::InvalidInput(format!("Unknown source type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "connection_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Pending,
    Verified,
    Failed,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "deal_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    Draft,
    Funding,
    Active,
    Repaying,
    Completed,
    Defaulted,
}

impl DealStatus {
    /// Deals that owe a monthly revenue share
    pub fn is_payable(&self) -> bool {
        matches!(self, DealStatus::Active | DealStatus::Repaying)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "investment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestmentStatus {
    Pending,
    Active,
    Exited,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_category", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionCategory {
    Revenue,
    Expense,
    /// Credit that is not trading income (transfers, loans, refunds, reversals)
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "revenue_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevenueStatus {
    Verified,
    Flagged,
    Failed,
}

impl fmt::Display for RevenueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RevenueStatus::Verified => "VERIFIED",
            RevenueStatus::Flagged => "FLAGGED",
            RevenueStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payout_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Scheduled,
    Completed,
    Failed,
}

/// Kind of attempt recorded in the verification log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "verification_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VerificationAction {
    ConnectionAuthorized,
    ConnectionDisconnected,
    TokenRefresh,
    /// Stored token could not be used (undecryptable or missing)
    CredentialRejected,
    BankFeedFetch,
    AccountingFetch,
    Reconciliation,
    PayoutScheduled,
    ManualReview,
    DealFailed,
}

impl VerificationAction {
    pub fn fetch_for(source: SourceType) -> Self {
        match source {
            SourceType::BankFeed => VerificationAction::BankFeedFetch,
            SourceType::Accounting => VerificationAction::AccountingFetch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "attempt_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
}

/// Calendar month a revenue figure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevenueMonth {
    year: i32,
    month: u32,
}

impl RevenueMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, AppError> {
        if !(1..=12).contains(&month) {
            return Err(AppError::InvalidInput(format!("Invalid month: {}", month)));
        }
        Ok(Self { year, month })
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The calendar month before the one containing `today`
    pub fn previous_to(today: NaiveDate) -> Self {
        Self::containing(today).previous()
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        // Month is validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next()
            .first_day()
            .pred_opt()
            .unwrap_or_else(|| self.first_day())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// `day` of the following month, clamped to that month's last day
    pub fn day_of_following_month(&self, day: u32) -> NaiveDate {
        let next = self.next();
        NaiveDate::from_ymd_opt(next.year, next.month, day).unwrap_or_else(|| next.last_day())
    }
}

impl fmt::Display for RevenueMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for RevenueMonth {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::InvalidInput(format!("Expected month as YYYY-MM, got '{}'", s));
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl Serialize for RevenueMonth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RevenueMonth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Financed deal, owned by the wider platform and read here
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deal {
    pub id: Uuid,
    pub business_id: Uuid,
    pub name: String,
    pub status: DealStatus,
    /// Share of verified revenue owed to investors, as a percentage (5 = 5%)
    #[serde(with = "rust_decimal::serde::float")]
    pub revenue_share_pct: Decimal,
    pub created_at: DateTime<Utc>,
}

/// OAuth-backed link between a business and one revenue source
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RevenueConnection {
    pub id: Uuid,
    pub business_id: Uuid,
    pub source_type: SourceType,
    pub provider: String,
    /// Tenant / organisation id some providers require on every call
    pub provider_account_id: Option<String>,
    #[serde(skip_serializing)]
    pub access_token_enc: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<String>,
    pub last_error: Option<String>,
    pub error_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RevenueConnection {
    /// FAILED and DISCONNECTED connections wait for a fresh authorization
    pub fn is_usable(&self) -> bool {
        self.status == ConnectionStatus::Verified && self.access_token_enc.is_some()
    }

    pub fn token_expired(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + skew,
            None => false,
        }
    }
}

/// Fields written when a connection is (re)authorized
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub business_id: Uuid,
    pub source_type: SourceType,
    pub provider: String,
    pub provider_account_id: Option<String>,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BankAccount {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub external_account_id: String,
    pub name: Option<String>,
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BankTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_id: String,
    pub transaction_date: NaiveDate,
    pub description: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub running_balance: Option<Decimal>,
    pub reference: Option<String>,
    pub category: TransactionCategory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized bank transaction ready for upsert on (account, external id)
#[derive(Debug, Clone, PartialEq)]
pub struct NewBankTransaction {
    pub external_id: String,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount: Decimal,
    pub running_balance: Option<Decimal>,
    pub reference: Option<String>,
    pub category: TransactionCategory,
}

/// One row per (deal, month)
///
/// INVARIANT: a VERIFIED record is never rewritten by an automated run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RevenueRecord {
    pub id: Uuid,
    pub deal_id: Uuid,
    pub period_start: NaiveDate,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub bank_revenue: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub accounting_revenue: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float")]
    pub verified_revenue: Decimal,
    pub has_discrepancy: bool,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub discrepancy_amount: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub discrepancy_ratio: Option<Decimal>,
    pub discrepancy_notes: Option<String>,
    pub status: RevenueStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub revenue_share_amount: Decimal,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RevenueRecord {
    pub fn month(&self) -> RevenueMonth {
        RevenueMonth::containing(self.period_start)
    }

    pub fn is_payable(&self) -> bool {
        self.status == RevenueStatus::Verified
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRevenueRecord {
    pub deal_id: Uuid,
    pub month: RevenueMonth,
    pub bank_revenue: Option<Decimal>,
    pub accounting_revenue: Option<Decimal>,
    pub verified_revenue: Decimal,
    pub has_discrepancy: bool,
    pub discrepancy_amount: Option<Decimal>,
    pub discrepancy_ratio: Option<Decimal>,
    pub discrepancy_notes: Option<String>,
    pub status: RevenueStatus,
    pub revenue_share_amount: Decimal,
}

/// Outcome of a human review of a FLAGGED record
#[derive(Debug, Clone)]
pub struct RecordResolution {
    pub verified_revenue: Decimal,
    pub revenue_share_amount: Decimal,
    pub reviewer: String,
    pub notes: String,
}

/// Payout intent handed to the disbursement collaborator
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PayoutSchedule {
    pub id: Uuid,
    pub deal_id: Uuid,
    pub revenue_record_id: Uuid,
    pub period_start: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_revenue: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub revenue_share_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub platform_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub net_payout: Decimal,
    pub investor_count: i32,
    pub scheduled_date: NaiveDate,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPayoutSchedule {
    pub deal_id: Uuid,
    pub revenue_record_id: Uuid,
    pub month: RevenueMonth,
    pub total_revenue: Decimal,
    pub revenue_share_amount: Decimal,
    pub platform_fee: Decimal,
    pub net_payout: Decimal,
    pub investor_count: i32,
    pub scheduled_date: NaiveDate,
}

/// Append-only audit row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VerificationLog {
    pub id: Uuid,
    pub deal_id: Option<Uuid>,
    pub connection_id: Option<Uuid>,
    pub source_type: Option<SourceType>,
    pub period_start: Option<NaiveDate>,
    pub action: VerificationAction,
    pub status: AttemptStatus,
    pub message: Option<String>,
    pub payload: serde_json::Value,
    pub payload_digest: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVerificationLog {
    pub deal_id: Option<Uuid>,
    pub connection_id: Option<Uuid>,
    pub source_type: Option<SourceType>,
    pub month: Option<RevenueMonth>,
    pub action: VerificationAction,
    pub status: AttemptStatus,
    pub message: Option<String>,
    pub payload: serde_json::Value,
}

impl NewVerificationLog {
    pub fn new(action: VerificationAction, status: AttemptStatus) -> Self {
        Self {
            deal_id: None,
            connection_id: None,
            source_type: None,
            month: None,
            action,
            status,
            message: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn deal(mut self, deal_id: Uuid, month: RevenueMonth) -> Self {
        self.deal_id = Some(deal_id);
        self.month = Some(month);
        self
    }

    pub fn connection(mut self, connection: &RevenueConnection) -> Self {
        self.connection_id = Some(connection.id);
        self.source_type = Some(connection.source_type);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_parsing() {
        let month: RevenueMonth = "2024-03".parse().unwrap();
        assert_eq!(month.year(), 2024);
        assert_eq!(month.month(), 3);
        assert_eq!(month.to_string(), "2024-03");

        assert!("2024-13".parse::<RevenueMonth>().is_err());
        assert!("2024-3".parse::<RevenueMonth>().is_err());
        assert!("march".parse::<RevenueMonth>().is_err());
    }

    #[test]
    fn test_previous_month_wraps_year() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let month = RevenueMonth::previous_to(today);
        assert_eq!(month.to_string(), "2024-12");
    }

    #[test]
    fn test_month_bounds() {
        let feb_leap = RevenueMonth::new(2024, 2).unwrap();
        assert_eq!(feb_leap.first_day(), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(feb_leap.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

        let dec = RevenueMonth::new(2024, 12).unwrap();
        assert_eq!(dec.last_day(), NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert!(dec.contains(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));
        assert!(!dec.contains(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
    }

    #[test]
    fn test_day_of_following_month() {
        let dec = RevenueMonth::new(2024, 12).unwrap();
        assert_eq!(
            dec.day_of_following_month(5),
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()
        );

        let jan = RevenueMonth::new(2025, 1).unwrap();
        assert_eq!(
            jan.day_of_following_month(31),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
    }

    #[test]
    fn test_source_type_from_path() {
        assert_eq!("bank-feed".parse::<SourceType>().unwrap(), SourceType::BankFeed);
        assert_eq!("ACCOUNTING".parse::<SourceType>().unwrap(), SourceType::Accounting);
        assert!("crypto".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_month_serde_as_string() {
        let month = RevenueMonth::new(2024, 7).unwrap();
        let json = serde_json::to_string(&month).unwrap();
        assert_eq!(json, "\"2024-07\"");
        let back: RevenueMonth = serde_json::from_str(&json).unwrap();
        assert_eq!(back, month);
    }
}
