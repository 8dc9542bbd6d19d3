pub mod orchestrator;
pub mod trigger;

pub use orchestrator::{DealOutcome, JobConfig, MonthlyRevenueJob, RunSummary};
pub use trigger::{MonthlyTrigger, TriggerConfig};
