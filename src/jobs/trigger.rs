// Monthly trigger - runs revenue verification for the previous calendar month
//
// Schedule:
// - fires on the configured day of month at the configured hour (UTC)
// - day is clamped to the month's last day (31 -> 30 Apr, 28/29 Feb)
// - a missed slot is not replayed; the HTTP trigger covers manual reruns

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use super::orchestrator::MonthlyRevenueJob;
use crate::ledger::models::RevenueMonth;

/// Trigger configuration
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub enabled: bool,
    /// Day of month to run (1-31)
    pub run_day: u32,
    /// UTC hour to run (0-23)
    pub run_hour: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_day: 1,
            run_hour: 2,
        }
    }
}

pub struct MonthlyTrigger {
    config: TriggerConfig,
    job: Arc<MonthlyRevenueJob>,
    shutdown: watch::Receiver<bool>,
}

impl MonthlyTrigger {
    pub fn new(config: TriggerConfig, job: Arc<MonthlyRevenueJob>, shutdown: watch::Receiver<bool>) -> Self {
        Self { config, job, shutdown }
    }

    /// Start the trigger loop in the background. Returns `None` when disabled.
    pub fn start(self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("⏸️ Monthly trigger disabled");
            return None;
        }
        Some(tokio::spawn(async move { self.run_loop().await }))
    }

    async fn run_loop(self) {
        loop {
            if *self.shutdown.borrow() {
                info!("🛑 Monthly trigger stopping");
                return;
            }

            let now = Utc::now();
            let next = calculate_next_monthly_execution(now, self.config.run_day, self.config.run_hour);
            let wait = next.signed_duration_since(now).to_std().unwrap_or(Duration::ZERO);

            info!("⏰ Next revenue verification run scheduled for {} UTC", next.format("%Y-%m-%d %H:%M"));

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("🛑 Monthly trigger stopping");
                        return;
                    }
                    continue;
                }
            }

            let month = RevenueMonth::previous_to(Utc::now().date_naive());
            info!("🔄 Starting scheduled revenue verification for {}", month);

            match self.job.run(month, self.shutdown.clone()).await {
                Ok(summary) => info!(
                    "✓ Scheduled run {} complete: {} deals, {} payouts",
                    summary.run_id, summary.deals_processed, summary.payouts_created
                ),
                Err(e) => error!("❌ Scheduled revenue verification failed: {:?}", e),
            }
        }
    }
}

fn slot_in_month(year: i32, month: u32, day: u32, hour: u32) -> Option<DateTime<Utc>> {
    let month = RevenueMonth::new(year, month).ok()?;
    let date = NaiveDate::from_ymd_opt(year, month.month(), day).unwrap_or_else(|| month.last_day());
    Some(Utc.from_utc_datetime(&date.and_hms_opt(hour.min(23), 0, 0)?))
}

/// Next instant at `day`/`hour` UTC strictly after `now`
pub fn calculate_next_monthly_execution(now: DateTime<Utc>, day: u32, hour: u32) -> DateTime<Utc> {
    let day = day.clamp(1, 31);
    let this_month = RevenueMonth::containing(now.date_naive());

    match slot_in_month(now.year(), now.month(), day, hour) {
        Some(slot) if slot > now => slot,
        _ => {
            let next = this_month.next();
            slot_in_month(next.year(), next.month(), day, hour).unwrap_or(now + chrono::Duration::days(1))
        }
    }
}
