// Cross-source revenue reconciliation
//
// Rules, applied to the figures a deal's sources produced for one month:
// - no source with a positive figure  -> FAILED, nothing verified
// - exactly one positive figure       -> VERIFIED at that figure
// - two positive figures within the threshold -> VERIFIED at their average
// - two positive figures beyond the threshold -> FLAGGED at the lower figure
//
// A FLAGGED record never pays out until a reviewer resolves it.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ledger::models::RevenueStatus;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Relative difference above which two sources are considered in disagreement
    pub discrepancy_threshold: Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            discrepancy_threshold: dec!(0.10),
        }
    }
}

/// Monthly figures per source; `None` when the source is not connected or its fetch failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SourceFigures {
    #[serde(with = "rust_decimal::serde::float_option")]
    pub bank: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub accounting: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub status: RevenueStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub verified_revenue: Decimal,
    pub has_discrepancy: bool,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub discrepancy_amount: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub discrepancy_ratio: Option<Decimal>,
    pub notes: Option<String>,
}

/// |a - b| / mean(a, b); `None` when the mean is zero
pub fn discrepancy_ratio(a: Decimal, b: Decimal) -> Option<Decimal> {
    let average = (a + b) / dec!(2);
    if average.is_zero() {
        return None;
    }
    Some(((a - b).abs() / average).abs())
}

fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn reconcile(&self, figures: SourceFigures) -> Reconciliation {
        let bank = figures.bank.filter(|v| *v > Decimal::ZERO);
        let accounting = figures.accounting.filter(|v| *v > Decimal::ZERO);

        match (bank, accounting) {
            (None, None) => Reconciliation {
                status: RevenueStatus::Failed,
                verified_revenue: Decimal::ZERO,
                has_discrepancy: false,
                discrepancy_amount: None,
                discrepancy_ratio: None,
                notes: Some(match (figures.bank, figures.accounting) {
                    (None, None) => "No revenue source returned data".to_string(),
                    _ => "All available sources reported zero revenue".to_string(),
                }),
            },
            (Some(only), None) | (None, Some(only)) => {
                let source = if bank.is_some() { "bank feed" } else { "accounting" };
                debug!("Single-source reconciliation from {}: {}", source, only);
                Reconciliation {
                    status: RevenueStatus::Verified,
                    verified_revenue: money(only),
                    has_discrepancy: false,
                    discrepancy_amount: None,
                    discrepancy_ratio: None,
                    notes: Some(format!("Verified from {} only", source)),
                }
            }
            (Some(bank), Some(accounting)) => self.reconcile_pair(bank, accounting),
        }
    }

    fn reconcile_pair(&self, bank: Decimal, accounting: Decimal) -> Reconciliation {
        let difference = (bank - accounting).abs();
        // both figures are positive, so the mean is too
        let ratio = discrepancy_ratio(bank, accounting).unwrap_or(Decimal::ZERO);
        let threshold = self.config.discrepancy_threshold;

        if ratio > threshold {
            let verified = bank.min(accounting);
            warn!(
                "⚠️ Sources disagree: bank {} vs accounting {} (ratio {})",
                bank,
                accounting,
                ratio.round_dp(4)
            );
            Reconciliation {
                status: RevenueStatus::Flagged,
                verified_revenue: money(verified),
                has_discrepancy: true,
                discrepancy_amount: Some(money(difference)),
                discrepancy_ratio: Some(ratio.round_dp(6)),
                notes: Some(format!(
                    "Bank feed {} vs accounting {} differ by {}% (threshold {}%); lower figure held pending review",
                    bank,
                    accounting,
                    (ratio * dec!(100)).round_dp(2),
                    (threshold * dec!(100)).normalize()
                )),
            }
        } else {
            let average = (bank + accounting) / dec!(2);
            Reconciliation {
                status: RevenueStatus::Verified,
                verified_revenue: money(average),
                has_discrepancy: false,
                discrepancy_amount: Some(money(difference)),
                discrepancy_ratio: Some(ratio.round_dp(6)),
                notes: None,
            }
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}
