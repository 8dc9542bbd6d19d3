use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::api::AppState;
use crate::error::AppError;

/// Reject job triggers that do not carry `Authorization: Bearer <CRON_SECRET>`
pub async fn require_cron_secret(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !bearer_matches(&req, &state.cron_secret) {
        warn!("⚠️ Rejected job trigger with missing or invalid secret");
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

/// Gate operator endpoints (connections, review, reads) on `Bearer <OPERATOR_SECRET>`
pub async fn require_operator_secret(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !bearer_matches(&req, &state.operator_secret) {
        warn!("⚠️ Rejected {} {} without a valid operator secret", req.method(), req.uri().path());
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

fn bearer_matches(req: &Request, expected: &str) -> bool {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .is_some_and(|token| secrets_match(token, expected))
}

/// Comparison time depends only on length
fn secrets_match(presented: &str, expected: &str) -> bool {
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
