use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::http::{read_json, with_retry, RetryPolicy};
use super::schema;
use super::traits::{BankFeedApi, ProviderBankAccount, ProviderTransaction, RevenueSource, SourceRevenue};
use crate::error::{AppError, AppResult, ProviderError};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;
use crate::vault::Credential;

/// Hard stop on pagination so a misbehaving provider cannot loop forever
const MAX_PAGES: u32 = 200;

/// Credit descriptions containing any of these words are not trading income
const EXCLUDED_CREDIT_WORDS: &[&str] = &[
    "transfer",
    "transfers",
    "trf",
    "xfer",
    "loan",
    "loans",
    "refund",
    "refunds",
    "refunded",
    "reversal",
    "reversed",
    "atm",
    "withdrawal",
    "withdrawals",
];

/// Classify one bank line. Credits (positive amounts) are revenue unless the
/// description marks them as a transfer, loan, refund, reversal or ATM entry.
pub fn categorize(amount: Decimal, description: &str) -> TransactionCategory {
    if amount <= Decimal::ZERO {
        return TransactionCategory::Expense;
    }

    let lowered = description.to_lowercase();
    let excluded = lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| EXCLUDED_CREDIT_WORDS.contains(&word));

    if excluded {
        TransactionCategory::Excluded
    } else {
        TransactionCategory::Revenue
    }
}

// ========== WIRE SCHEMA ==========

#[derive(Debug, Deserialize)]
struct AccountsEnvelope {
    accounts: Vec<AccountDto>,
}

#[derive(Debug, Deserialize)]
struct AccountDto {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionsPage {
    transactions: Vec<TransactionDto>,
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDto {
    id: String,
    date: NaiveDate,
    #[serde(default)]
    description: Option<String>,
    #[serde(deserialize_with = "schema::decimal")]
    amount: Decimal,
    #[serde(default, deserialize_with = "schema::optional_decimal")]
    running_balance: Option<Decimal>,
    #[serde(default)]
    reference: Option<String>,
}

impl TransactionDto {
    fn validate(self) -> Result<ProviderTransaction, String> {
        if self.id.trim().is_empty() {
            return Err("transaction without id".to_string());
        }
        Ok(ProviderTransaction {
            external_id: self.id,
            date: self.date,
            description: self.description.unwrap_or_default(),
            amount: self.amount,
            running_balance: self.running_balance,
            reference: self.reference.filter(|r| !r.is_empty()),
        })
    }
}

/// Page to request after `current`. A partial month must never be totalled, so
/// a cursor past the page cap or one that does not advance is an error.
fn following_page(current: u32, next: Option<u32>) -> Result<Option<u32>, String> {
    match next {
        None => Ok(None),
        Some(next) if next <= current => Err(format!("page cursor did not advance ({} -> {})", current, next)),
        Some(next) if next > MAX_PAGES => Err(format!("more than {} pages of transactions", MAX_PAGES)),
        Some(next) => Ok(Some(next)),
    }
}

// ========== HTTP CLIENT ==========

/// REST client for the bank feed aggregator
pub struct HttpBankFeedClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpBankFeedClient {
    pub fn new(http: Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    async fn fetch_page(
        &self,
        access_token: &str,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
        page: u32,
    ) -> Result<TransactionsPage, ProviderError> {
        let url = format!("{}/accounts/{}/transactions", self.base_url, account_id);
        let from = from.to_string();
        let to = to.to_string();
        let page = page.to_string();

        with_retry(&self.retry, "bank transactions fetch", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("from", from.as_str()), ("to", to.as_str()), ("page", page.as_str())])
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(SourceType::BankFeed, e))?;
            read_json(SourceType::BankFeed, response).await
        })
        .await
    }
}

#[async_trait]
impl BankFeedApi for HttpBankFeedClient {
    async fn list_accounts(&self, access_token: &str) -> Result<Vec<ProviderBankAccount>, ProviderError> {
        let url = format!("{}/accounts", self.base_url);

        let envelope: AccountsEnvelope = with_retry(&self.retry, "bank accounts fetch", || async {
            let response = self
                .http
                .get(&url)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(SourceType::BankFeed, e))?;
            read_json(SourceType::BankFeed, response).await
        })
        .await?;

        Ok(envelope
            .accounts
            .into_iter()
            .filter(|a| !a.id.trim().is_empty())
            .map(|a| ProviderBankAccount {
                external_id: a.id,
                name: a.name,
                currency: a.currency,
            })
            .collect())
    }

    async fn list_transactions(
        &self,
        access_token: &str,
        account_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderTransaction>, ProviderError> {
        let mut transactions = Vec::new();
        let mut page = 1;

        loop {
            let body = self.fetch_page(access_token, account_id, from, to, page).await?;
            for dto in body.transactions {
                match dto.validate() {
                    Ok(tx) => transactions.push(tx),
                    Err(reason) => {
                        return Err(ProviderError::MalformedPayload {
                            provider: SourceType::BankFeed,
                            message: reason,
                        })
                    }
                }
            }

            match following_page(page, body.next_page) {
                Ok(Some(next)) => page = next,
                Ok(None) => break,
                Err(message) => {
                    warn!("⚠️ Bank feed pagination aborted for account {}: {}", account_id, message);
                    return Err(ProviderError::MalformedPayload {
                        provider: SourceType::BankFeed,
                        message,
                    });
                }
            }
        }

        debug!("Fetched {} transactions for account {}", transactions.len(), account_id);
        Ok(transactions)
    }
}

// ========== REVENUE SOURCE ==========

/// Bank feed fetcher: persists the month's transactions and totals qualifying credits
pub struct BankFeedFetcher {
    api: Arc<dyn BankFeedApi>,
    store: Arc<dyn RevenueStore>,
}

impl BankFeedFetcher {
    pub fn new(api: Arc<dyn BankFeedApi>, store: Arc<dyn RevenueStore>) -> Self {
        Self { api, store }
    }

    /// Accounts known for the connection, discovering them from the provider on first use
    async fn accounts_for(
        &self,
        connection: &RevenueConnection,
        credential: &Credential,
    ) -> AppResult<Vec<BankAccount>> {
        let known = self.store.list_bank_accounts(connection.id).await?;
        if !known.is_empty() {
            return Ok(known);
        }
        self.register_accounts(connection, credential).await
    }

    /// Pull the provider's account list and upsert it for the connection
    pub async fn register_accounts(
        &self,
        connection: &RevenueConnection,
        credential: &Credential,
    ) -> AppResult<Vec<BankAccount>> {
        let discovered = self.api.list_accounts(&credential.access_token).await?;
        info!("🔄 Discovered {} bank accounts for connection {}", discovered.len(), connection.id);

        let mut accounts = Vec::with_capacity(discovered.len());
        for account in discovered {
            let stored = self
                .store
                .upsert_bank_account(
                    connection.id,
                    &account.external_id,
                    account.name.as_deref(),
                    account.currency.as_deref(),
                )
                .await?;
            accounts.push(stored);
        }
        Ok(accounts)
    }
}

#[async_trait]
impl RevenueSource for BankFeedFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::BankFeed
    }

    #[instrument(skip_all, fields(connection_id = %connection.id, month = %month))]
    async fn fetch_monthly_revenue(
        &self,
        connection: &RevenueConnection,
        credential: &Credential,
        month: RevenueMonth,
    ) -> AppResult<SourceRevenue> {
        let accounts = self.accounts_for(connection, credential).await?;
        if accounts.is_empty() {
            return Err(AppError::NotFound(format!(
                "No bank accounts available for connection {}",
                connection.id
            )));
        }

        let mut total = Decimal::ZERO;
        let mut excluded_total = Decimal::ZERO;
        let mut per_account = Vec::with_capacity(accounts.len());

        for account in &accounts {
            let fetched = self
                .api
                .list_transactions(
                    &credential.access_token,
                    &account.external_account_id,
                    month.first_day(),
                    month.last_day(),
                )
                .await?;

            // Providers occasionally repeat a line across pages; the last copy wins
            let mut unique: BTreeMap<String, NewBankTransaction> = BTreeMap::new();
            for tx in fetched {
                let category = categorize(tx.amount, &tx.description);
                unique.insert(
                    tx.external_id.clone(),
                    NewBankTransaction {
                        external_id: tx.external_id,
                        transaction_date: tx.date,
                        description: tx.description,
                        amount: tx.amount,
                        running_balance: tx.running_balance,
                        reference: tx.reference,
                        category,
                    },
                );
            }
            let normalized: Vec<NewBankTransaction> = unique.into_values().collect();
            let written = self.store.upsert_bank_transactions(account.id, &normalized).await?;

            let in_month = normalized.iter().filter(|tx| month.contains(tx.transaction_date));
            let mut account_revenue = Decimal::ZERO;
            let mut account_excluded = Decimal::ZERO;
            let mut revenue_count = 0;
            for tx in in_month {
                match tx.category {
                    TransactionCategory::Revenue => {
                        account_revenue += tx.amount;
                        revenue_count += 1;
                    }
                    TransactionCategory::Excluded => account_excluded += tx.amount,
                    TransactionCategory::Expense => {}
                }
            }

            total += account_revenue;
            excluded_total += account_excluded;
            per_account.push(json!({
                "account_id": account.id,
                "external_account_id": account.external_account_id,
                "transactions": normalized.len(),
                "rows_written": written,
                "revenue_transactions": revenue_count,
                "revenue": account_revenue.to_string(),
                "excluded_credits": account_excluded.to_string(),
            }));
        }

        info!("✅ Bank feed revenue for {}: {}", month, total);

        Ok(SourceRevenue {
            source: SourceType::BankFeed,
            total,
            details: json!({
                "accounts": per_account,
                "excluded_credits_total": excluded_total.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct FakeBankFeed {
        transactions: Vec<ProviderTransaction>,
    }

    #[async_trait]
    impl BankFeedApi for FakeBankFeed {
        async fn list_accounts(&self, _: &str) -> Result<Vec<ProviderBankAccount>, ProviderError> {
            Ok(vec![ProviderBankAccount {
                external_id: "acc-1".to_string(),
                name: Some("Operating".to_string()),
                currency: Some("NGN".to_string()),
            }])
        }

        async fn list_transactions(
            &self,
            _: &str,
            _: &str,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<ProviderTransaction>, ProviderError> {
            Ok(self.transactions.clone())
        }
    }

    fn tx(id: &str, day: u32, description: &str, amount: Decimal) -> ProviderTransaction {
        ProviderTransaction {
            external_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            description: description.to_string(),
            amount,
            running_balance: None,
            reference: None,
        }
    }

    fn connection() -> RevenueConnection {
        let now = Utc::now();
        RevenueConnection {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            source_type: SourceType::BankFeed,
            provider: "bankfeed".to_string(),
            provider_account_id: None,
            access_token_enc: Some("enc".to_string()),
            refresh_token_enc: None,
            token_expires_at: None,
            status: ConnectionStatus::Verified,
            last_synced_at: None,
            last_sync_status: None,
            last_error: None,
            error_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn credential(connection: &RevenueConnection) -> Credential {
        Credential {
            connection_id: connection.id,
            access_token: "token".to_string(),
            provider_account_id: None,
        }
    }

    #[test]
    fn test_following_page() {
        assert_eq!(following_page(1, None), Ok(None));
        assert_eq!(following_page(1, Some(2)), Ok(Some(2)));
        assert_eq!(following_page(MAX_PAGES - 1, Some(MAX_PAGES)), Ok(Some(MAX_PAGES)));
        assert!(following_page(1, Some(MAX_PAGES + 1)).is_err());
        assert!(following_page(3, Some(3)).is_err());
    }

    #[test]
    fn test_categorize() {
        assert_eq!(categorize(dec!(1500), "POS settlement"), TransactionCategory::Revenue);
        assert_eq!(categorize(dec!(1500), "Transfer from savings"), TransactionCategory::Excluded);
        assert_eq!(categorize(dec!(900), "LOAN DISBURSEMENT"), TransactionCategory::Excluded);
        assert_eq!(categorize(dec!(40), "Refund - order 22"), TransactionCategory::Excluded);
        assert_eq!(categorize(dec!(-200), "Rent"), TransactionCategory::Expense);
        assert_eq!(categorize(Decimal::ZERO, "Nothing"), TransactionCategory::Expense);
    }

    #[test]
    fn test_categorize_matches_whole_words() {
        // "atm" inside "treatment" is still a sale
        assert_eq!(categorize(dec!(300), "Dental treatment"), TransactionCategory::Revenue);
        assert_eq!(categorize(dec!(300), "ATM deposit"), TransactionCategory::Excluded);
    }

    #[test]
    fn test_transaction_page_schema() {
        let page: TransactionsPage = serde_json::from_str(
            r#"{
                "transactions": [
                    {"id":"t1","date":"2024-03-02","description":"Card sales","amount":"2500.50","runningBalance":10000},
                    {"id":"t2","date":"2024-03-03","amount":-120.25}
                ],
                "nextPage": 2
            }"#,
        )
        .unwrap();

        assert_eq!(page.next_page, Some(2));
        let txs: Vec<_> = page.transactions.into_iter().map(|t| t.validate().unwrap()).collect();
        assert_eq!(txs[0].amount, dec!(2500.50));
        assert_eq!(txs[0].running_balance, Some(dec!(10000)));
        assert_eq!(txs[1].description, "");
        assert_eq!(txs[1].amount, dec!(-120.25));
    }

    /// Serve a single transactions page whose cursor is `next_page`
    async fn serve_page(next_page: u32) -> String {
        use axum::{routing::get, Json, Router};

        let app = Router::new().route(
            "/accounts/:id/transactions",
            get(move || async move {
                Json(serde_json::json!({
                    "transactions": [{"id": "t1", "date": "2024-03-02", "amount": "100"}],
                    "nextPage": next_page,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_page_cap_is_an_error_not_a_partial_month() {
        let base_url = serve_page(MAX_PAGES + 1).await;
        let client = HttpBankFeedClient::new(Client::new(), base_url, RetryPolicy::default().with_max_retries(0));
        let from = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();

        let err = client.list_transactions("token", "acc-1", from, to).await.unwrap_err();
        assert!(matches!(err, ProviderError::MalformedPayload { .. }));
    }

    #[test]
    fn test_transaction_without_id_is_rejected() {
        let dto: TransactionDto =
            serde_json::from_str(r#"{"id":" ","date":"2024-03-02","amount":"1"}"#).unwrap();
        assert!(dto.validate().is_err());
    }

    #[tokio::test]
    async fn test_fetch_sums_qualifying_credits_and_stores_all() {
        let store = Arc::new(InMemoryStore::new());
        let api = Arc::new(FakeBankFeed {
            transactions: vec![
                tx("t1", 1, "Card sales", dec!(60000)),
                tx("t2", 15, "Invoice 100 paid", dec!(40000)),
                tx("t3", 16, "Transfer from owner", dec!(25000)),
                tx("t4", 20, "Supplier payment", dec!(-15000)),
                // duplicate delivery of t2
                tx("t2", 15, "Invoice 100 paid", dec!(40000)),
            ],
        });
        let fetcher = BankFeedFetcher::new(api, store.clone());
        let conn = connection();
        let month = RevenueMonth::new(2024, 3).unwrap();

        let revenue = fetcher
            .fetch_monthly_revenue(&conn, &credential(&conn), month)
            .await
            .unwrap();

        assert_eq!(revenue.total, dec!(100000));
        assert_eq!(revenue.source, SourceType::BankFeed);
        assert_eq!(revenue.details["excluded_credits_total"], "25000");

        let stored = store.all_transactions().await;
        assert_eq!(stored.len(), 4);
        assert!(stored
            .iter()
            .any(|t| t.external_id == "t3" && t.category == TransactionCategory::Excluded));
    }

    #[tokio::test]
    async fn test_refetch_updates_in_place() {
        let store = Arc::new(InMemoryStore::new());
        let conn = connection();
        let month = RevenueMonth::new(2024, 3).unwrap();

        let first = BankFeedFetcher::new(
            Arc::new(FakeBankFeed {
                transactions: vec![tx("t1", 1, "Card sales", dec!(500))],
            }),
            store.clone(),
        );
        let before = first
            .fetch_monthly_revenue(&conn, &credential(&conn), month)
            .await
            .unwrap();
        assert_eq!(before.total, dec!(500));

        // The provider later reclassifies the same entry as a reversed payment
        let second = BankFeedFetcher::new(
            Arc::new(FakeBankFeed {
                transactions: vec![tx("t1", 1, "Card payment reversed", dec!(450))],
            }),
            store.clone(),
        );
        let after = second
            .fetch_monthly_revenue(&conn, &credential(&conn), month)
            .await
            .unwrap();
        assert_eq!(after.total, Decimal::ZERO);

        let accounts = store.list_bank_accounts(conn.id).await.unwrap();
        assert_eq!(accounts.len(), 1);
        let stored = store
            .list_bank_transactions(accounts[0].id, month)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].description, "Card payment reversed");
        assert_eq!(stored[0].amount, dec!(450));
        assert_eq!(stored[0].category, TransactionCategory::Excluded);
    }

    #[tokio::test]
    async fn test_empty_month_is_zero_revenue() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = BankFeedFetcher::new(Arc::new(FakeBankFeed { transactions: vec![] }), store);
        let conn = connection();

        let revenue = fetcher
            .fetch_monthly_revenue(&conn, &credential(&conn), RevenueMonth::new(2024, 3).unwrap())
            .await
            .unwrap();
        assert_eq!(revenue.total, Decimal::ZERO);
    }
}
