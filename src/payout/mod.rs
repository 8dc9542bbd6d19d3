// Payout scheduling
//
// Turns a VERIFIED revenue record into a payout intent for the disbursement
// service. Money never moves here; the row is the instruction.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::audit::AuditLogger;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::RevenueStore;

/// Payout configuration
#[derive(Debug, Clone)]
pub struct PayoutConfig {
    /// Platform fee as a fraction of the revenue share
    pub platform_fee_rate: Decimal,
    /// Day of the month following the revenue month on which payouts are scheduled
    pub payout_day: u32,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            platform_fee_rate: dec!(0.05),
            payout_day: 5,
        }
    }
}

/// Split of a revenue share between platform and investors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PayoutAmounts {
    pub revenue_share: Decimal,
    pub platform_fee: Decimal,
    pub net_payout: Decimal,
}

impl PayoutAmounts {
    pub fn compute(revenue_share: Decimal, platform_fee_rate: Decimal) -> Self {
        let platform_fee =
            (revenue_share * platform_fee_rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Self {
            revenue_share,
            platform_fee,
            net_payout: revenue_share - platform_fee,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PayoutDecision {
    Scheduled(PayoutSchedule),
    /// A schedule already existed for (deal, month); nothing was written
    AlreadyScheduled(PayoutSchedule),
}

impl PayoutDecision {
    pub fn schedule(&self) -> &PayoutSchedule {
        match self {
            PayoutDecision::Scheduled(s) | PayoutDecision::AlreadyScheduled(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, PayoutDecision::Scheduled(_))
    }
}

pub struct PayoutScheduler {
    config: PayoutConfig,
    store: Arc<dyn RevenueStore>,
    audit: Arc<AuditLogger>,
}

impl PayoutScheduler {
    pub fn new(config: PayoutConfig, store: Arc<dyn RevenueStore>, audit: Arc<AuditLogger>) -> Self {
        Self { config, store, audit }
    }

    pub fn config(&self) -> &PayoutConfig {
        &self.config
    }

    /// Schedule the payout for a record. Only VERIFIED records pass; at most one
    /// schedule ever exists per (deal, month).
    #[instrument(skip(self, record), fields(deal_id = %record.deal_id, month = %record.month()))]
    pub async fn schedule(&self, record: &RevenueRecord) -> AppResult<PayoutDecision> {
        if !record.is_payable() {
            return Err(AppError::PayoutBlocked { status: record.status });
        }

        let month = record.month();
        if let Some(existing) = self.store.get_payout_schedule(record.deal_id, month).await? {
            info!("⏭️ Payout for deal {} {} already scheduled", record.deal_id, month);
            return Ok(PayoutDecision::AlreadyScheduled(existing));
        }

        let investor_count = self.store.count_active_investments(record.deal_id).await?;
        let amounts = PayoutAmounts::compute(record.revenue_share_amount, self.config.platform_fee_rate);
        let scheduled_date = month.day_of_following_month(self.config.payout_day);

        if investor_count == 0 {
            warn!("⚠️ Deal {} has no active investments; payout scheduled with zero investors", record.deal_id);
        }

        let inserted = self
            .store
            .insert_payout_schedule_if_absent(NewPayoutSchedule {
                deal_id: record.deal_id,
                revenue_record_id: record.id,
                month,
                total_revenue: record.verified_revenue,
                revenue_share_amount: amounts.revenue_share,
                platform_fee: amounts.platform_fee,
                net_payout: amounts.net_payout,
                investor_count: i32::try_from(investor_count).unwrap_or(i32::MAX),
                scheduled_date,
            })
            .await?;

        match inserted {
            Some(schedule) => {
                info!(
                    "✅ Payout scheduled for deal {} {}: net {} on {}",
                    record.deal_id, month, schedule.net_payout, schedule.scheduled_date
                );
                self.audit
                    .record(
                        NewVerificationLog::new(VerificationAction::PayoutScheduled, AttemptStatus::Success)
                            .deal(record.deal_id, month)
                            .message(format!("Payout scheduled for {}", schedule.scheduled_date))
                            .payload(json!({
                                "payout_id": schedule.id,
                                "revenue_record_id": record.id,
                                "total_revenue": schedule.total_revenue.to_string(),
                                "revenue_share_amount": schedule.revenue_share_amount.to_string(),
                                "platform_fee": schedule.platform_fee.to_string(),
                                "net_payout": schedule.net_payout.to_string(),
                                "investor_count": schedule.investor_count,
                                "scheduled_date": schedule.scheduled_date,
                            })),
                    )
                    .await;
                Ok(PayoutDecision::Scheduled(schedule))
            }
            None => {
                // Lost a race with a concurrent writer, or the record changed under us
                match self.store.get_payout_schedule(record.deal_id, month).await? {
                    Some(existing) => Ok(PayoutDecision::AlreadyScheduled(existing)),
                    None => Err(AppError::InvalidState {
                        current: "revenue record no longer VERIFIED".to_string(),
                        expected: "VERIFIED".to_string(),
                    }),
                }
            }
        }
    }
}
