pub mod handler;
pub mod models;
pub mod oauth_state;

pub use handler::AppState;
pub use oauth_state::PendingAuthorizations;
