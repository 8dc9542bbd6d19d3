use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;
use crate::reconciliation::{Reconciliation, SourceFigures};

/// Verified revenue × deal percentage (5 = 5%), rounded to cents
pub fn revenue_share(verified_revenue: Decimal, share_pct: Decimal) -> Decimal {
    (verified_revenue * share_pct / dec!(100)).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone)]
pub enum RecordWrite {
    Written(RevenueRecord),
    /// A VERIFIED record already existed and was left as is
    Immutable(RevenueRecord),
}

impl RecordWrite {
    pub fn record(&self) -> &RevenueRecord {
        match self {
            RecordWrite::Written(r) | RecordWrite::Immutable(r) => r,
        }
    }

    pub fn into_record(self) -> RevenueRecord {
        match self {
            RecordWrite::Written(r) | RecordWrite::Immutable(r) => r,
        }
    }
}

/// Persists one revenue record per (deal, month)
pub struct RevenueRecordWriter {
    store: Arc<dyn RevenueStore>,
}

impl RevenueRecordWriter {
    pub fn new(store: Arc<dyn RevenueStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all, fields(deal_id = %deal.id, month = %month, status = %outcome.status))]
    pub async fn write(
        &self,
        deal: &Deal,
        month: RevenueMonth,
        figures: SourceFigures,
        outcome: &Reconciliation,
    ) -> AppResult<RecordWrite> {
        let share = match outcome.status {
            RevenueStatus::Failed => Decimal::ZERO,
            _ => revenue_share(outcome.verified_revenue, deal.revenue_share_pct),
        };

        let written = self
            .store
            .upsert_revenue_record(NewRevenueRecord {
                deal_id: deal.id,
                month,
                bank_revenue: figures.bank,
                accounting_revenue: figures.accounting,
                verified_revenue: outcome.verified_revenue,
                has_discrepancy: outcome.has_discrepancy,
                discrepancy_amount: outcome.discrepancy_amount,
                discrepancy_ratio: outcome.discrepancy_ratio,
                discrepancy_notes: outcome.notes.clone(),
                status: outcome.status,
                revenue_share_amount: share,
            })
            .await?;

        match written {
            Some(record) => {
                info!(
                    "📝 Revenue record {} for deal {} {}: {} (share {})",
                    record.status, deal.id, month, record.verified_revenue, record.revenue_share_amount
                );
                Ok(RecordWrite::Written(record))
            }
            None => {
                let existing = self
                    .store
                    .get_revenue_record(deal.id, month)
                    .await?
                    .ok_or_else(|| AppError::Internal(format!("Revenue record for {} {} vanished", deal.id, month)))?;
                info!("🔒 Revenue record for deal {} {} is VERIFIED; left unchanged", deal.id, month);
                Ok(RecordWrite::Immutable(existing))
            }
        }
    }
}
