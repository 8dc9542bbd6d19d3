use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    api::{AppState, PendingAuthorizations},
    audit::AuditLogger,
    config::{Config, ProviderSettings},
    error::{AppError, AppResult},
    jobs::{JobConfig, MonthlyRevenueJob},
    ledger::{models::SourceType, LedgerRepository, RevenueStore},
    payout::{PayoutConfig, PayoutScheduler},
    reconciliation::{Reconciler, ReconcilerConfig},
    revenue::{RevenueRecordWriter, RevenueReview},
    sources::{
        http::{build_client, RetryPolicy},
        AccountingFetcher, BankFeedFetcher, HttpAccountingClient, HttpBankFeedClient, HttpOAuthClient,
        OAuthConfig, SourceRegistry,
    },
    vault::{TokenCipher, TokenVault, TokenVaultConfig},
};

fn oauth_config(provider_name: &str, settings: &ProviderSettings, scopes: &[&str]) -> OAuthConfig {
    OAuthConfig {
        provider_name: provider_name.to_string(),
        authorize_url: settings.authorize_url.clone(),
        token_url: settings.token_url.clone(),
        client_id: settings.client_id.clone(),
        client_secret: settings.client_secret.clone(),
        redirect_uri: settings.redirect_uri.clone(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
    }
}

pub async fn initialize_app_state(config: &Config, shutdown: watch::Receiver<bool>) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn RevenueStore> = Arc::new(LedgerRepository::new(pool));
    let audit = Arc::new(AuditLogger::new(store.clone()));

    let cipher = Arc::new(TokenCipher::from_base64(&config.token_encryption_key)?);
    info!("🔐 Token cipher ready (key {})", cipher.key_id());

    let http = build_client(config.http_timeout_secs)?;
    let retry = RetryPolicy::default().with_max_retries(config.http_max_retries);

    let mut vault = TokenVault::new(TokenVaultConfig::default(), cipher, store.clone(), audit.clone());
    let mut sources = SourceRegistry::new();

    info!("⚙️  Initializing revenue sources...");

    let bank_settings = config.bank_feed().map_err(|e| AppError::Config(e.to_string()))?;
    let bank_feed = match bank_settings {
        Some(settings) => {
            vault.register_oauth_client(Arc::new(HttpOAuthClient::new(
                SourceType::BankFeed,
                oauth_config("bank_feed", &settings, &["accounts", "transactions", "offline_access"]),
                http.clone(),
                retry.clone(),
            )));
            let api = Arc::new(HttpBankFeedClient::new(http.clone(), settings.base_url.clone(), retry.clone()));
            let fetcher = Arc::new(BankFeedFetcher::new(api, store.clone()));
            sources.register(fetcher.clone());
            info!("✅ Bank feed source registered");
            Some(fetcher)
        }
        None => {
            warn!("⚠️  BANK_FEED_CLIENT_ID not set - bank feed verification disabled");
            None
        }
    };

    let accounting_settings = config.accounting().map_err(|e| AppError::Config(e.to_string()))?;
    match accounting_settings {
        Some(settings) => {
            vault.register_oauth_client(Arc::new(HttpOAuthClient::new(
                SourceType::Accounting,
                oauth_config("accounting", &settings, &["offline_access", "reports.read", "invoices.read"]),
                http.clone(),
                retry.clone(),
            )));
            let api = Arc::new(HttpAccountingClient::new(http.clone(), settings.base_url.clone(), retry.clone()));
            sources.register(Arc::new(AccountingFetcher::new(api)));
            info!("✅ Accounting source registered");
        }
        None => warn!("⚠️  ACCOUNTING_CLIENT_ID not set - accounting verification disabled"),
    }

    let vault = Arc::new(vault);
    let sources = Arc::new(sources);
    info!("🔗 Revenue sources: {:?}", sources.registered());

    let reconciler = Arc::new(Reconciler::new(ReconcilerConfig::default()));
    let writer = Arc::new(RevenueRecordWriter::new(store.clone()));
    let payouts = Arc::new(PayoutScheduler::new(PayoutConfig::default(), store.clone(), audit.clone()));
    let review = Arc::new(RevenueReview::new(store.clone(), audit.clone(), payouts.clone()));

    let job = Arc::new(MonthlyRevenueJob::new(
        JobConfig {
            concurrency: config.job_concurrency,
        },
        store.clone(),
        vault.clone(),
        sources.clone(),
        reconciler,
        writer,
        payouts,
        audit,
    ));
    info!("✅ Monthly revenue job initialized (concurrency {})", config.job_concurrency);

    Ok(AppState {
        store,
        vault,
        sources,
        bank_feed,
        job,
        review,
        pending_authorizations: Arc::new(PendingAuthorizations::default()),
        cron_secret: Arc::from(config.cron_secret.trim()),
        operator_secret: Arc::from(config.operator_secret.trim()),
        shutdown,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
