pub mod accounting;
pub mod bank_feed;
pub mod http;
pub mod oauth;
pub mod registry;
pub mod schema;
pub mod traits;

pub use accounting::{AccountingFetcher, HttpAccountingClient};
pub use bank_feed::{BankFeedFetcher, HttpBankFeedClient};
pub use oauth::{HttpOAuthClient, OAuthConfig};
pub use registry::SourceRegistry;
pub use traits::{AccountingApi, BankFeedApi, OAuthClient, RevenueSource, SourceRevenue};
