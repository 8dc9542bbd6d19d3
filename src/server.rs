use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::{
        handler::{
            authorize_connection, connection_callback, disconnect_connection, health_check,
            list_connection_transactions, list_revenue_records, list_verification_logs, resolve_revenue_record,
            run_revenue_verification, AppState,
        },
        models::ResolveRecordRequest,
    },
    middleware::{create_cors_layer, require_cron_secret, require_operator_secret, validate_json},
};

pub async fn create_app(state: AppState, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Job triggers require the cron secret
    let jobs = Router::new()
        .route("/jobs/revenue-verification", post(run_revenue_verification))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_cron_secret));

    let review = Router::new()
        .route("/revenue-records/:id/resolve", post(resolve_revenue_record))
        .route_layer(middleware::from_fn(validate_json::<ResolveRecordRequest>));

    // Everything else under /api/v1 requires the operator secret
    let operator = Router::new()
        // Connection lifecycle
        .route("/connections/:id/authorize", get(authorize_connection))
        .route("/connections/:id/callback", post(connection_callback))
        .route("/connections/:id/disconnect", post(disconnect_connection))
        // Read endpoints
        .route("/connections/:id/transactions", get(list_connection_transactions))
        .route("/deals/:deal_id/revenue-records", get(list_revenue_records))
        .route("/verification-logs", get(list_verification_logs))
        .merge(review)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_operator_secret));

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", operator.merge(jobs))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(create_cors_layer(cors_origins)),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Serve until the shutdown channel flips to `true`
pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                let stopping = *shutdown.borrow();
                if stopping || shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("🛑 HTTP server shutting down");
        })
        .await?;
    Ok(())
}
