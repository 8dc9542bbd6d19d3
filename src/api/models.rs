use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::ledger::models::*;

// ========== REQUEST MODELS ==========

/// Optional body of the on-demand verification trigger
#[derive(Debug, Default, Deserialize)]
pub struct RunJobRequest {
    /// `YYYY-MM`; defaults to the previous calendar month
    pub month: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub business_id: Uuid,
}

/// OAuth callback forwarded by the frontend after the provider redirect
#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub business_id: Uuid,
    pub code: String,
    /// Value issued by the authorize endpoint for this business and source
    pub state: String,
    /// Accounting tenant / organisation id
    pub provider_account_id: Option<String>,
}

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(ValidationError::new("must not be negative"));
    }
    Ok(())
}

/// Manual resolution of a FLAGGED revenue record
#[derive(Debug, Deserialize, Validate)]
pub struct ResolveRecordRequest {
    #[serde(deserialize_with = "crate::sources::schema::decimal")]
    #[validate(custom = "non_negative")]
    pub verified_revenue: Decimal,
    #[validate(length(min = 1, max = 255, message = "reviewer is required"))]
    pub reviewer: String,
    #[validate(length(min = 1, max = 2000, message = "notes are required"))]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub deal_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    /// `YYYY-MM`
    pub month: String,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub sources: Vec<SourceType>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub source: SourceType,
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub connection: RevenueConnection,
    /// Bank accounts registered during the callback (bank feeds only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bank_accounts: Vec<BankAccount>,
}

#[derive(Debug, Serialize)]
pub struct ResolveRecordResponse {
    pub record: RevenueRecord,
    pub payout: PayoutSchedule,
    pub payout_created: bool,
}

#[derive(Debug, Serialize)]
pub struct RevenueRecordsResponse {
    pub deal_id: Uuid,
    pub records: Vec<RevenueRecord>,
}

/// Stored transactions of one bank account for a month
#[derive(Debug, Serialize)]
pub struct AccountTransactions {
    pub account: BankAccount,
    pub transactions: Vec<BankTransaction>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionTransactionsResponse {
    pub connection_id: Uuid,
    pub month: RevenueMonth,
    pub accounts: Vec<AccountTransactions>,
}

#[derive(Debug, Serialize)]
pub struct VerificationLogsResponse {
    pub count: usize,
    pub logs: Vec<VerificationLog>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_resolve_request_validation() {
        let ok: ResolveRecordRequest = serde_json::from_str(
            r#"{"verified_revenue": "140000.00", "reviewer": "ops", "notes": "checked invoices"}"#,
        )
        .unwrap();
        assert_eq!(ok.verified_revenue, dec!(140000.00));
        assert!(ok.validate().is_ok());

        let negative: ResolveRecordRequest =
            serde_json::from_str(r#"{"verified_revenue": -5, "reviewer": "ops", "notes": "x"}"#).unwrap();
        let errors = negative.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("verified_revenue"));

        let blank: ResolveRecordRequest =
            serde_json::from_str(r#"{"verified_revenue": 10, "reviewer": "", "notes": ""}"#).unwrap();
        let errors = blank.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("reviewer"));
        assert!(errors.field_errors().contains_key("notes"));
    }
}
