use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::writer::revenue_share;
use crate::audit::AuditLogger;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;
use crate::payout::{PayoutDecision, PayoutScheduler};

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub record: RevenueRecord,
    pub payout: PayoutDecision,
}

/// Human resolution of FLAGGED records: the only path from FLAGGED to VERIFIED
pub struct RevenueReview {
    store: Arc<dyn RevenueStore>,
    audit: Arc<AuditLogger>,
    payouts: Arc<PayoutScheduler>,
}

impl RevenueReview {
    pub fn new(store: Arc<dyn RevenueStore>, audit: Arc<AuditLogger>, payouts: Arc<PayoutScheduler>) -> Self {
        Self { store, audit, payouts }
    }

    #[instrument(skip_all, fields(record_id = %record_id, reviewer = %reviewer))]
    pub async fn resolve(
        &self,
        record_id: Uuid,
        verified_revenue: Decimal,
        reviewer: &str,
        notes: &str,
    ) -> AppResult<ReviewOutcome> {
        if verified_revenue < Decimal::ZERO {
            return Err(AppError::InvalidInput("verified_revenue must not be negative".to_string()));
        }

        let record = self
            .store
            .get_revenue_record_by_id(record_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("revenue record {}", record_id)))?;

        if record.status != RevenueStatus::Flagged {
            return Err(AppError::InvalidState {
                current: record.status.to_string(),
                expected: RevenueStatus::Flagged.to_string(),
            });
        }

        let range = source_range(&record);
        let outside_range = range.map_or(true, |(low, high)| verified_revenue < low || verified_revenue > high);
        if outside_range && notes.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "notes are required when verified_revenue is outside the range reported by the sources".to_string(),
            ));
        }
        if outside_range {
            warn!(
                "Record {} resolved outside source range {:?} at {}",
                record_id, range, verified_revenue
            );
        }

        let deal = self
            .store
            .get_deal(record.deal_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("deal {}", record.deal_id)))?;

        let previous_revenue = record.verified_revenue;
        let resolved = self
            .store
            .resolve_flagged_record(
                record_id,
                RecordResolution {
                    verified_revenue,
                    revenue_share_amount: revenue_share(verified_revenue, deal.revenue_share_pct),
                    reviewer: reviewer.to_string(),
                    notes: notes.to_string(),
                },
            )
            .await?
            .ok_or_else(|| AppError::InvalidState {
                current: "no longer FLAGGED".to_string(),
                expected: RevenueStatus::Flagged.to_string(),
            })?;

        let month = resolved.month();
        info!("✅ Revenue record {} resolved by {}: {}", record_id, reviewer, verified_revenue);

        self.audit
            .record(
                NewVerificationLog::new(VerificationAction::ManualReview, AttemptStatus::Success)
                    .deal(resolved.deal_id, month)
                    .message(format!("FLAGGED record resolved by {}", reviewer))
                    .payload(json!({
                        "revenue_record_id": resolved.id,
                        "bank_revenue": resolved.bank_revenue.map(|v| v.to_string()),
                        "accounting_revenue": resolved.accounting_revenue.map(|v| v.to_string()),
                        "previous_verified_revenue": previous_revenue.to_string(),
                        "verified_revenue": resolved.verified_revenue.to_string(),
                        "revenue_share_amount": resolved.revenue_share_amount.to_string(),
                        "source_range": range.map(|(low, high)| [low.to_string(), high.to_string()]),
                        "outside_source_range": outside_range,
                        "reviewer": reviewer,
                        "notes": notes,
                    })),
            )
            .await;

        let payout = self.payouts.schedule(&resolved).await?;
        Ok(ReviewOutcome { record: resolved, payout })
    }
}

/// Lowest and highest revenue the sources reported, if any did
fn source_range(record: &RevenueRecord) -> Option<(Decimal, Decimal)> {
    let figures = [record.bank_revenue, record.accounting_revenue];
    let mut present = figures.iter().flatten().copied();
    let first = present.next()?;
    Some(present.fold((first, first), |(low, high), v| (low.min(v), high.max(v))))
}
