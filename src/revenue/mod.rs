pub mod review;
pub mod writer;

pub use review::{ReviewOutcome, RevenueReview};
pub use writer::{revenue_share, RecordWrite, RevenueRecordWriter};
