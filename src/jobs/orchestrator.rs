use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;
use crate::payout::{PayoutDecision, PayoutScheduler};
use crate::reconciliation::{Reconciler, SourceFigures};
use crate::revenue::{RecordWrite, RevenueRecordWriter};
use crate::sources::{SourceRegistry, SourceRevenue};
use crate::vault::TokenVault;

/// Job configuration
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Deals processed in parallel
    pub concurrency: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// What happened to one deal during a run
#[derive(Debug, Clone, PartialEq)]
pub enum DealOutcome {
    Verified { payout_created: bool, revenue_share: Decimal },
    /// Record was already VERIFIED from an earlier run; only the payout was ensured
    AlreadyVerified { payout_created: bool, revenue_share: Decimal },
    Flagged,
    Failed,
    Errored(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub month: RevenueMonth,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deals_total: usize,
    pub deals_processed: usize,
    pub verified: usize,
    pub already_verified: usize,
    pub flagged: usize,
    pub failed: usize,
    pub errored: usize,
    /// Shutdown was requested before every deal was started
    pub aborted: bool,
    pub payouts_created: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_revenue_share_scheduled: Decimal,
}

impl RunSummary {
    fn new(month: RevenueMonth, deals_total: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            month,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            deals_total,
            deals_processed: 0,
            verified: 0,
            already_verified: 0,
            flagged: 0,
            failed: 0,
            errored: 0,
            aborted: false,
            payouts_created: 0,
            total_revenue_share_scheduled: Decimal::ZERO,
        }
    }

    fn tally(&mut self, outcome: &DealOutcome) {
        self.deals_processed += 1;
        let created = match outcome {
            DealOutcome::Verified { payout_created, revenue_share } => {
                self.verified += 1;
                payout_created.then_some(*revenue_share)
            }
            DealOutcome::AlreadyVerified { payout_created, revenue_share } => {
                self.already_verified += 1;
                payout_created.then_some(*revenue_share)
            }
            DealOutcome::Flagged => {
                self.flagged += 1;
                None
            }
            DealOutcome::Failed => {
                self.failed += 1;
                None
            }
            DealOutcome::Errored(_) => {
                self.errored += 1;
                None
            }
        };
        if let Some(share) = created {
            self.payouts_created += 1;
            self.total_revenue_share_scheduled += share;
        }
    }
}

/// Monthly verification job: fetch → reconcile → record → schedule, per payable deal
pub struct MonthlyRevenueJob {
    config: JobConfig,
    store: Arc<dyn RevenueStore>,
    vault: Arc<TokenVault>,
    sources: Arc<SourceRegistry>,
    reconciler: Arc<Reconciler>,
    writer: Arc<RevenueRecordWriter>,
    payouts: Arc<PayoutScheduler>,
    audit: Arc<AuditLogger>,
    run_lock: Mutex<()>,
}

impl MonthlyRevenueJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: JobConfig,
        store: Arc<dyn RevenueStore>,
        vault: Arc<TokenVault>,
        sources: Arc<SourceRegistry>,
        reconciler: Arc<Reconciler>,
        writer: Arc<RevenueRecordWriter>,
        payouts: Arc<PayoutScheduler>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            config,
            store,
            vault,
            sources,
            reconciler,
            writer,
            payouts,
            audit,
            run_lock: Mutex::new(()),
        }
    }

    /// Run the job for `month`. Deals are independent: one failing never stops
    /// the rest, and nothing already written is rolled back. A shutdown signal
    /// stops new deals from starting; deals in flight finish.
    #[instrument(skip_all, fields(month = %month))]
    pub async fn run(&self, month: RevenueMonth, shutdown: watch::Receiver<bool>) -> AppResult<RunSummary> {
        let _running = self.run_lock.try_lock().map_err(|_| AppError::InvalidState {
            current: "a verification run is in progress".to_string(),
            expected: "idle".to_string(),
        })?;

        let deals = self.store.list_payable_deals().await?;
        let mut summary = RunSummary::new(month, deals.len());
        info!("🔄 Revenue verification run {} for {}: {} payable deals", summary.run_id, month, deals.len());

        let outcomes: Vec<Option<(Uuid, DealOutcome)>> = stream::iter(deals)
            .map(|deal| {
                let shutdown = shutdown.clone();
                async move {
                    let stopping = *shutdown.borrow();
                    if stopping {
                        return None;
                    }
                    let outcome = self.process_deal_isolated(&deal, month).await;
                    Some((deal.id, outcome))
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in &outcomes {
            match result {
                Some((_, outcome)) => summary.tally(outcome),
                None => summary.aborted = true,
            }
        }
        summary.finished_at = Utc::now();

        if summary.aborted {
            warn!(
                "⚠️ Run {} aborted by shutdown after {}/{} deals",
                summary.run_id, summary.deals_processed, summary.deals_total
            );
        }
        info!(
            "✅ Run {} finished: {} verified, {} already verified, {} flagged, {} failed, {} errored, {} payouts ({} revenue share)",
            summary.run_id,
            summary.verified,
            summary.already_verified,
            summary.flagged,
            summary.failed,
            summary.errored,
            summary.payouts_created,
            summary.total_revenue_share_scheduled
        );

        Ok(summary)
    }

    async fn process_deal_isolated(&self, deal: &Deal, month: RevenueMonth) -> DealOutcome {
        match self.process_deal(deal, month).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("❌ Deal {} failed for {}: {}", deal.id, month, e);
                self.audit
                    .record(
                        NewVerificationLog::new(VerificationAction::DealFailed, AttemptStatus::Failure)
                            .deal(deal.id, month)
                            .message(e.to_string())
                            .payload(json!({ "deal_name": deal.name, "error": format!("{:?}", e) })),
                    )
                    .await;
                DealOutcome::Errored(e.to_string())
            }
        }
    }

    #[instrument(skip(self, deal), fields(deal_id = %deal.id))]
    pub async fn process_deal(&self, deal: &Deal, month: RevenueMonth) -> AppResult<DealOutcome> {
        if let Some(existing) = self.store.get_revenue_record(deal.id, month).await? {
            if existing.is_payable() {
                return self.ensure_payout(&existing).await;
            }
        }

        let mut figures = SourceFigures::default();
        let connections = self.store.list_connections(deal.business_id).await?;
        for connection in &connections {
            if !connection.is_usable() {
                warn!(
                    "⏭️ Skipping {} connection {} ({:?})",
                    connection.source_type, connection.id, connection.status
                );
                continue;
            }
            if let Some(revenue) = self.fetch_source(deal, month, connection).await? {
                match revenue.source {
                    SourceType::BankFeed => figures.bank = Some(revenue.total),
                    SourceType::Accounting => figures.accounting = Some(revenue.total),
                }
            }
        }

        let outcome = self.reconciler.reconcile(figures);
        self.audit
            .record(
                NewVerificationLog::new(
                    VerificationAction::Reconciliation,
                    match outcome.status {
                        RevenueStatus::Failed => AttemptStatus::Failure,
                        _ => AttemptStatus::Success,
                    },
                )
                .deal(deal.id, month)
                .message(format!("Reconciled as {}", outcome.status))
                .payload(json!({
                    "figures": figures,
                    "outcome": outcome,
                    "threshold": self.reconciler.config().discrepancy_threshold.to_string(),
                    "connections": connections.len(),
                })),
            )
            .await;

        let record = match self.writer.write(deal, month, figures, &outcome).await? {
            RecordWrite::Written(record) => record,
            RecordWrite::Immutable(record) => return self.ensure_payout(&record).await,
        };

        match record.status {
            RevenueStatus::Verified => {
                let decision = self.payouts.schedule(&record).await?;
                Ok(DealOutcome::Verified {
                    payout_created: decision.is_new(),
                    revenue_share: record.revenue_share_amount,
                })
            }
            RevenueStatus::Flagged => Ok(DealOutcome::Flagged),
            RevenueStatus::Failed => Ok(DealOutcome::Failed),
        }
    }

    async fn ensure_payout(&self, record: &RevenueRecord) -> AppResult<DealOutcome> {
        let decision = self.payouts.schedule(record).await?;
        Ok(DealOutcome::AlreadyVerified {
            payout_created: matches!(decision, PayoutDecision::Scheduled(_)),
            revenue_share: record.revenue_share_amount,
        })
    }

    /// Fetch one source. Any failure makes the source unavailable for this deal
    /// and is recorded; only storage errors propagate.
    async fn fetch_source(
        &self,
        deal: &Deal,
        month: RevenueMonth,
        connection: &RevenueConnection,
    ) -> AppResult<Option<SourceRevenue>> {
        let action = VerificationAction::fetch_for(connection.source_type);

        let Some(source) = self.sources.get(connection.source_type) else {
            warn!("⚠️ No fetcher registered for {}", connection.source_type);
            return Ok(None);
        };

        let credential = match self.vault.credential_for(connection).await {
            Ok(credential) => credential,
            Err(AppError::Database(e)) => return Err(AppError::Database(e)),
            Err(e) => {
                // refresh and stored-token failures are recorded on the connection by the vault
                warn!("⚠️ No credential for connection {}: {}", connection.id, e);
                self.audit
                    .record(
                        NewVerificationLog::new(action, AttemptStatus::Failure)
                            .deal(deal.id, month)
                            .connection(connection)
                            .message(e.to_string())
                            .payload(json!({
                                "stage": "credential",
                                "credential_failure": e.is_credential_failure(),
                            })),
                    )
                    .await;
                return Ok(None);
            }
        };

        match source.fetch_monthly_revenue(connection, &credential, month).await {
            Ok(revenue) => {
                self.store.record_sync_success(connection.id, Utc::now()).await?;
                self.audit
                    .record(
                        NewVerificationLog::new(action, AttemptStatus::Success)
                            .deal(deal.id, month)
                            .connection(connection)
                            .message(format!("Fetched {} revenue {}", revenue.source, revenue.total))
                            .payload(json!({
                                "total": revenue.total.to_string(),
                                "details": revenue.details,
                            })),
                    )
                    .await;
                Ok(Some(revenue))
            }
            Err(AppError::Database(e)) => Err(AppError::Database(e)),
            Err(e) => {
                let credential_failure = e.is_credential_failure();
                warn!(
                    "⚠️ {} fetch failed for deal {} (credential failure: {}): {}",
                    connection.source_type, deal.id, credential_failure, e
                );
                let updated = self
                    .store
                    .record_sync_failure(
                        connection.id,
                        &e.to_string(),
                        credential_failure,
                        self.vault.config().max_consecutive_errors,
                    )
                    .await?;
                self.audit
                    .record(
                        NewVerificationLog::new(action, AttemptStatus::Failure)
                            .deal(deal.id, month)
                            .connection(connection)
                            .message(e.to_string())
                            .payload(json!({
                                "stage": "fetch",
                                "credential_failure": credential_failure,
                                "error_count": updated.error_count,
                                "connection_status": updated.status,
                            })),
                    )
                    .await;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::ledger::memory::InMemoryStore;
    use crate::payout::PayoutConfig;
    use crate::sources::traits::*;
    use crate::sources::{AccountingFetcher, BankFeedFetcher};
    use crate::vault::{TokenCipher, TokenVaultConfig};
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBank {
        credits: Vec<Decimal>,
    }

    #[async_trait]
    impl BankFeedApi for FakeBank {
        async fn list_accounts(&self, _: &str) -> Result<Vec<ProviderBankAccount>, ProviderError> {
            Ok(vec![ProviderBankAccount {
                external_id: "main".to_string(),
                name: None,
                currency: None,
            }])
        }

        async fn list_transactions(
            &self,
            access_token: &str,
            _: &str,
            from: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<ProviderTransaction>, ProviderError> {
            assert!(access_token.starts_with("bank-"));
            Ok(self
                .credits
                .iter()
                .enumerate()
                .map(|(i, amount)| ProviderTransaction {
                    external_id: format!("tx-{}", i),
                    date: from,
                    description: "Card settlement".to_string(),
                    amount: *amount,
                    running_balance: None,
                    reference: None,
                })
                .collect())
        }
    }

    struct FakeLedger {
        revenue: Result<Decimal, ProviderError>,
    }

    #[async_trait]
    impl AccountingApi for FakeLedger {
        async fn profit_and_loss(
            &self,
            _: &str,
            _: Option<&str>,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<ProfitAndLossReport, ProviderError> {
            let amount = self.revenue.clone()?;
            Ok(ProfitAndLossReport {
                lines: vec![ReportLine {
                    section: Some("Income".to_string()),
                    label: "Sales".to_string(),
                    amount,
                }],
            })
        }

        async fn list_invoices(
            &self,
            _: &str,
            _: Option<&str>,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<ProviderInvoice>, ProviderError> {
            Ok(vec![])
        }
    }

    struct CountingOAuth {
        source: SourceType,
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl OAuthClient for CountingOAuth {
        fn source(&self) -> SourceType {
            self.source
        }

        fn provider_name(&self) -> &str {
            "fake"
        }

        fn authorization_url(&self, state: &str) -> Result<String, ProviderError> {
            Ok(format!("https://auth.test/?state={}", state))
        }

        async fn exchange_code(&self, _: &str) -> Result<TokenSet, ProviderError> {
            unreachable!("not used by the job")
        }

        async fn refresh(&self, _: &str) -> Result<TokenSet, ProviderError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(TokenSet {
                access_token: "bank-refreshed".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            })
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        cipher: Arc<TokenCipher>,
        bank_oauth: Arc<CountingOAuth>,
        job: MonthlyRevenueJob,
    }

    fn harness(bank: FakeBank, ledger: FakeLedger) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let cipher = Arc::new(TokenCipher::new(&[9u8; 32]).unwrap());
        let audit = Arc::new(AuditLogger::new(store.clone()));
        let bank_oauth = Arc::new(CountingOAuth {
            source: SourceType::BankFeed,
            refreshes: AtomicUsize::new(0),
        });

        let mut vault = TokenVault::new(TokenVaultConfig::default(), cipher.clone(), store.clone(), audit.clone());
        vault.register_oauth_client(bank_oauth.clone());

        let mut sources = SourceRegistry::new();
        sources.register(Arc::new(BankFeedFetcher::new(Arc::new(bank), store.clone())));
        sources.register(Arc::new(AccountingFetcher::new(Arc::new(ledger))));

        let payouts = Arc::new(PayoutScheduler::new(PayoutConfig::default(), store.clone(), audit.clone()));
        let job = MonthlyRevenueJob::new(
            JobConfig::default(),
            store.clone(),
            Arc::new(vault),
            Arc::new(sources),
            Arc::new(Reconciler::default()),
            Arc::new(RevenueRecordWriter::new(store.clone())),
            payouts,
            audit,
        );

        Harness { store, cipher, bank_oauth, job }
    }

    impl Harness {
        async fn deal(&self) -> Deal {
            let deal = Deal {
                id: Uuid::new_v4(),
                business_id: Uuid::new_v4(),
                name: "Corner shop".to_string(),
                status: DealStatus::Active,
                revenue_share_pct: dec!(5),
                created_at: Utc::now(),
            };
            self.store.insert_deal(deal.clone()).await;
            self.store.add_investment(deal.id, InvestmentStatus::Active).await;
            deal
        }

        async fn connect(&self, deal: &Deal, source: SourceType, expired: bool) -> RevenueConnection {
            let now = Utc::now();
            let prefix = match source {
                SourceType::BankFeed => "bank",
                SourceType::Accounting => "acct",
            };
            let connection = RevenueConnection {
                id: Uuid::new_v4(),
                business_id: deal.business_id,
                source_type: source,
                provider: "fake".to_string(),
                provider_account_id: None,
                access_token_enc: Some(self.cipher.encrypt(&format!("{}-access", prefix)).unwrap()),
                refresh_token_enc: Some(self.cipher.encrypt("refresh").unwrap()),
                token_expires_at: Some(if expired {
                    now - Duration::minutes(1)
                } else {
                    now + Duration::hours(1)
                }),
                status: ConnectionStatus::Verified,
                last_synced_at: None,
                last_sync_status: None,
                last_error: None,
                error_count: 0,
                created_at: now,
                updated_at: now,
            };
            self.store.insert_connection(connection.clone()).await;
            connection
        }
    }

    fn month() -> RevenueMonth {
        RevenueMonth::new(2024, 6).unwrap()
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn test_agreeing_sources_schedule_one_payout_across_reruns() {
        let h = harness(
            FakeBank { credits: vec![dec!(60000), dec!(40000)] },
            FakeLedger { revenue: Ok(dec!(100000)) },
        );
        let deal = h.deal().await;
        h.connect(&deal, SourceType::BankFeed, false).await;
        h.connect(&deal, SourceType::Accounting, false).await;

        let first = h.job.run(month(), running()).await.unwrap();
        assert_eq!(first.verified, 1);
        assert_eq!(first.payouts_created, 1);
        assert_eq!(first.total_revenue_share_scheduled, dec!(5000));

        let second = h.job.run(month(), running()).await.unwrap();
        assert_eq!(second.verified, 0);
        assert_eq!(second.already_verified, 1);
        assert_eq!(second.payouts_created, 0);

        let records = h.store.all_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].verified_revenue, dec!(100000));
        assert_eq!(records[0].bank_revenue, Some(dec!(100000)));
        assert_eq!(h.store.all_payouts().await.len(), 1);
        assert_eq!(h.store.all_transactions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disagreement_is_flagged_without_payout() {
        let h = harness(
            FakeBank { credits: vec![dec!(100000)] },
            FakeLedger { revenue: Ok(dec!(150000)) },
        );
        let deal = h.deal().await;
        h.connect(&deal, SourceType::BankFeed, false).await;
        h.connect(&deal, SourceType::Accounting, false).await;

        let summary = h.job.run(month(), running()).await.unwrap();
        assert_eq!(summary.flagged, 1);
        assert_eq!(summary.payouts_created, 0);

        let record = h.store.get_revenue_record(deal.id, month()).await.unwrap().unwrap();
        assert_eq!(record.status, RevenueStatus::Flagged);
        assert_eq!(record.verified_revenue, dec!(100000));
        assert!(h.store.all_payouts().await.is_empty());
    }

    #[tokio::test]
    async fn test_deal_without_sources_fails() {
        let h = harness(FakeBank { credits: vec![] }, FakeLedger { revenue: Ok(Decimal::ZERO) });
        let deal = h.deal().await;

        let summary = h.job.run(month(), running()).await.unwrap();
        assert_eq!(summary.failed, 1);

        let record = h.store.get_revenue_record(deal.id, month()).await.unwrap().unwrap();
        assert_eq!(record.status, RevenueStatus::Failed);
        assert!(h.store.all_payouts().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let h = harness(FakeBank { credits: vec![dec!(50000)] }, FakeLedger { revenue: Ok(Decimal::ZERO) });
        let deal = h.deal().await;
        h.connect(&deal, SourceType::BankFeed, true).await;

        let summary = h.job.run(month(), running()).await.unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(h.bank_oauth.refreshes.load(Ordering::SeqCst), 1);

        // the stored token is now fresh; a later month reuses it
        let next = month().next();
        h.job.run(next, running()).await.unwrap();
        assert_eq!(h.bank_oauth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_fails_connection_but_not_deal() {
        let h = harness(
            FakeBank { credits: vec![dec!(50000)] },
            FakeLedger {
                revenue: Err(ProviderError::Unauthorized {
                    provider: SourceType::Accounting,
                    status: 401,
                    message: "token revoked".to_string(),
                }),
            },
        );
        let deal = h.deal().await;
        h.connect(&deal, SourceType::BankFeed, false).await;
        let accounting = h.connect(&deal, SourceType::Accounting, false).await;

        let summary = h.job.run(month(), running()).await.unwrap();
        assert_eq!(summary.verified, 1);

        let connection = h.store.get_connection(accounting.id).await.unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Failed);
        assert_eq!(connection.error_count, 1);

        let failures = h
            .store
            .all_logs()
            .await
            .into_iter()
            .filter(|l| l.action == VerificationAction::AccountingFetch && l.status == AttemptStatus::Failure)
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_aborts_run() {
        let h = harness(FakeBank { credits: vec![dec!(1)] }, FakeLedger { revenue: Ok(dec!(1)) });
        h.deal().await;
        h.deal().await;

        let (tx, rx) = watch::channel(true);
        let summary = h.job.run(month(), rx).await.unwrap();
        drop(tx);

        assert!(summary.aborted);
        assert_eq!(summary.deals_processed, 0);
        assert!(h.store.all_records().await.is_empty());
    }
}
