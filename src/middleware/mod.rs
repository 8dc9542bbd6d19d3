pub mod auth;
pub mod cors;
pub mod validation;

pub use auth::{require_cron_secret, require_operator_secret};
pub use cors::create_cors_layer;
pub use validation::validate_json;
