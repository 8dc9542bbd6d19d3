use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::http::{read_json, with_retry, RetryPolicy};
use super::schema;
use super::traits::{AccountingApi, ProfitAndLossReport, ProviderInvoice, ReportLine, RevenueSource, SourceRevenue};
use crate::error::{AppResult, ProviderError};
use crate::ledger::models::*;
use crate::reconciliation::discrepancy_ratio;
use crate::vault::Credential;

const MAX_INVOICE_PAGES: u32 = 50;
const INVOICE_PAGE_SIZE: usize = 100;

const REVENUE_WORDS: &[&str] = &["revenue", "revenues", "sales", "sale", "income", "turnover", "fees", "fee"];

const EXPENSE_WORDS: &[&str] = &[
    "cost",
    "costs",
    "cogs",
    "expense",
    "expenses",
    "purchases",
    "wages",
    "salaries",
    "rent",
    "depreciation",
    "less",
];

/// Invoice states that represent billed revenue
const BILLED_STATUSES: &[&str] = &["AUTHORISED", "PAID"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Revenue,
    Expense,
    Other,
}

fn has_word(text: &str, vocabulary: &[&str]) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| vocabulary.contains(&word))
}

/// Classify a report line. Expense wording on the label or the section title
/// wins ("Cost of Sales", "Bank Fees" under operating expenses); revenue wording
/// only counts outside expense sections.
pub fn classify_line(section: Option<&str>, label: &str) -> LineKind {
    let expense_section = section.is_some_and(|title| has_word(title, EXPENSE_WORDS));
    if expense_section || has_word(label, EXPENSE_WORDS) {
        return LineKind::Expense;
    }
    if has_word(label, REVENUE_WORDS) || section.is_some_and(|title| has_word(title, REVENUE_WORDS)) {
        return LineKind::Revenue;
    }
    LineKind::Other
}

// ========== WIRE SCHEMA ==========

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportsEnvelope {
    reports: Vec<ReportDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReportDto {
    #[serde(default)]
    rows: Vec<RowDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RowDto {
    row_type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    cells: Vec<CellDto>,
    #[serde(default)]
    rows: Vec<RowDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CellDto {
    #[serde(default)]
    value: String,
}

impl ReportsEnvelope {
    /// Flatten section rows into labeled lines. Header, summary and "Total" rows are dropped
    fn into_report(self) -> ProfitAndLossReport {
        let mut lines = Vec::new();
        for report in self.reports {
            collect_lines(None, report.rows, &mut lines);
        }
        ProfitAndLossReport { lines }
    }
}

fn collect_lines(section: Option<&str>, rows: Vec<RowDto>, out: &mut Vec<ReportLine>) {
    for row in rows {
        match row.row_type.as_str() {
            "Section" => {
                let title = row.title.as_deref().filter(|t| !t.is_empty()).or(section);
                let title = title.map(str::to_string);
                collect_lines(title.as_deref(), row.rows, out);
            }
            "Row" => {
                let label = match row.cells.first() {
                    Some(cell) if !cell.value.trim().is_empty() => cell.value.trim().to_string(),
                    _ => continue,
                };
                if label.to_lowercase().starts_with("total") {
                    continue;
                }
                if let Some(amount) = row.cells.get(1).and_then(|c| schema::cell_amount(&c.value)) {
                    out.push(ReportLine {
                        section: section.map(str::to_string),
                        label,
                        amount,
                    });
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvoicesEnvelope {
    #[serde(default)]
    invoices: Vec<InvoiceDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvoiceDto {
    #[serde(rename = "InvoiceID")]
    invoice_id: String,
    #[serde(default, rename = "Type")]
    kind: Option<String>,
    status: String,
    date_string: String,
    #[serde(deserialize_with = "schema::decimal")]
    total: Decimal,
}

impl InvoiceDto {
    fn is_sales(&self) -> bool {
        self.kind.as_deref().map_or(true, |k| k.eq_ignore_ascii_case("ACCREC"))
    }

    fn validate(self) -> Result<ProviderInvoice, String> {
        let date_part = self.date_string.get(..10).unwrap_or(&self.date_string);
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .map_err(|e| format!("invoice {} has invalid date '{}': {}", self.invoice_id, self.date_string, e))?;
        Ok(ProviderInvoice {
            external_id: self.invoice_id,
            status: self.status.to_ascii_uppercase(),
            date,
            total: self.total,
        })
    }
}

// ========== HTTP CLIENT ==========

/// REST client for the accounting provider's reporting API
pub struct HttpAccountingClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpAccountingClient {
    pub fn new(http: Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        }
    }

    fn authorized(&self, url: &str, access_token: &str, tenant_id: Option<&str>) -> RequestBuilder {
        let request = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json");
        match tenant_id {
            Some(tenant) => request.header("Tenant-Id", tenant),
            None => request,
        }
    }
}

#[async_trait]
impl AccountingApi for HttpAccountingClient {
    async fn profit_and_loss(
        &self,
        access_token: &str,
        tenant_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<ProfitAndLossReport, ProviderError> {
        let url = format!("{}/Reports/ProfitAndLoss", self.base_url);
        let from = from.to_string();
        let to = to.to_string();

        let envelope: ReportsEnvelope = with_retry(&self.retry, "profit and loss fetch", || async {
            let response = self
                .authorized(&url, access_token, tenant_id)
                .query(&[("fromDate", from.as_str()), ("toDate", to.as_str())])
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(SourceType::Accounting, e))?;
            read_json(SourceType::Accounting, response).await
        })
        .await?;

        Ok(envelope.into_report())
    }

    async fn list_invoices(
        &self,
        access_token: &str,
        tenant_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderInvoice>, ProviderError> {
        let url = format!("{}/Invoices", self.base_url);
        let statuses = BILLED_STATUSES.join(",");
        let from_s = from.to_string();
        let to_s = to.to_string();
        let mut invoices = Vec::new();

        for page in 1..=MAX_INVOICE_PAGES {
            let page_s = page.to_string();
            let envelope: InvoicesEnvelope = with_retry(&self.retry, "invoice list fetch", || async {
                let response = self
                    .authorized(&url, access_token, tenant_id)
                    .query(&[
                        ("page", page_s.as_str()),
                        ("statuses", statuses.as_str()),
                        ("dateFrom", from_s.as_str()),
                        ("dateTo", to_s.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(SourceType::Accounting, e))?;
                read_json(SourceType::Accounting, response).await
            })
            .await?;

            let received = envelope.invoices.len();
            for dto in envelope.invoices.into_iter().filter(InvoiceDto::is_sales) {
                let invoice = dto.validate().map_err(|message| ProviderError::MalformedPayload {
                    provider: SourceType::Accounting,
                    message,
                })?;
                if invoice.date >= from && invoice.date <= to {
                    invoices.push(invoice);
                }
            }

            if received < INVOICE_PAGE_SIZE {
                break;
            }
        }

        Ok(invoices)
    }
}

// ========== REVENUE SOURCE ==========

/// Accounting fetcher: revenue from the P&L report, cross-checked against billed invoices
pub struct AccountingFetcher {
    api: Arc<dyn AccountingApi>,
    /// Relative invoice/P&L gap above which a warning is logged
    invoice_tolerance: Decimal,
}

impl AccountingFetcher {
    pub fn new(api: Arc<dyn AccountingApi>) -> Self {
        Self {
            api,
            invoice_tolerance: dec!(0.10),
        }
    }

    pub fn with_invoice_tolerance(mut self, tolerance: Decimal) -> Self {
        self.invoice_tolerance = tolerance;
        self
    }

    /// Supplementary invoice check; never changes the P&L figure
    async fn invoice_check(
        &self,
        credential: &Credential,
        month: RevenueMonth,
        pnl_revenue: Decimal,
    ) -> serde_json::Value {
        let invoices = match self
            .api
            .list_invoices(
                &credential.access_token,
                credential.provider_account_id.as_deref(),
                month.first_day(),
                month.last_day(),
            )
            .await
        {
            Ok(invoices) => invoices,
            Err(e) => {
                warn!("⚠️ Invoice cross-check unavailable for {}: {}", month, e);
                return json!({ "invoice_error": e.to_string() });
            }
        };

        let billed: Vec<&ProviderInvoice> = invoices
            .iter()
            .filter(|i| BILLED_STATUSES.contains(&i.status.as_str()))
            .collect();
        let invoice_total: Decimal = billed.iter().map(|i| i.total).sum();
        let variance = discrepancy_ratio(pnl_revenue, invoice_total);

        if let Some(ratio) = variance {
            if ratio > self.invoice_tolerance {
                warn!(
                    "⚠️ Invoices for {} total {} but P&L revenue is {} (variance {})",
                    month,
                    invoice_total,
                    pnl_revenue,
                    ratio.round_dp(4)
                );
            }
        }

        json!({
            "invoice_total": invoice_total.to_string(),
            "invoice_count": billed.len(),
            "invoice_variance_ratio": variance.map(|r| r.round_dp(4).to_string()),
        })
    }
}

#[async_trait]
impl RevenueSource for AccountingFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Accounting
    }

    #[instrument(skip_all, fields(connection_id = %connection.id, month = %month))]
    async fn fetch_monthly_revenue(
        &self,
        connection: &RevenueConnection,
        credential: &Credential,
        month: RevenueMonth,
    ) -> AppResult<SourceRevenue> {
        let report = self
            .api
            .profit_and_loss(
                &credential.access_token,
                credential.provider_account_id.as_deref(),
                month.first_day(),
                month.last_day(),
            )
            .await?;

        let mut total = Decimal::ZERO;
        let mut expense_total = Decimal::ZERO;
        let mut revenue_lines = Vec::new();

        for line in &report.lines {
            match classify_line(line.section.as_deref(), &line.label) {
                LineKind::Revenue => {
                    total += line.amount;
                    revenue_lines.push(json!({ "label": line.label, "amount": line.amount.to_string() }));
                }
                LineKind::Expense => expense_total += line.amount,
                LineKind::Other => {}
            }
        }

        let invoices = self.invoice_check(credential, month, total).await;
        info!("✅ Accounting revenue for {}: {} ({} lines)", month, total, revenue_lines.len());

        Ok(SourceRevenue {
            source: SourceType::Accounting,
            total,
            details: json!({
                "provider": connection.provider,
                "revenue_lines": revenue_lines,
                "expense_total": expense_total.to_string(),
                "invoices": invoices,
            }),
        })
    }
}
