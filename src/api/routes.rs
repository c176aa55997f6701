use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // System endpoints
        .route("/api/health", get(handlers::health))
        .route("/api/worker/status", get(handlers::worker_status))
        .route("/api/condition-rules", get(handlers::condition_rules))
        // Strategy CRUD
        .route("/api/strategies", get(handlers::list_strategies))
        .route("/api/strategies", post(handlers::create_strategy))
        .route("/api/strategies/:id", get(handlers::get_strategy))
        .route("/api/strategies/:id", delete(handlers::delete_strategy))
        // Partial updates
        .route("/api/strategies/:id/basic", patch(handlers::patch_basic))
        .route("/api/strategies/:id/conditions", put(handlers::put_conditions))
        .route("/api/strategies/:id/actions", put(handlers::put_actions))
        // Control
        .route("/api/strategies/:id/activate", post(handlers::activate_strategy))
        .route("/api/strategies/:id/pause", post(handlers::pause_strategy))
        .route("/api/strategies/:id/resume", post(handlers::resume_strategy))
        .route("/api/strategies/:id/cancel", post(handlers::cancel_strategy))
        // Read side
        .route("/api/strategies/:id/events", get(handlers::strategy_events))
        .route("/api/events", get(handlers::global_events))
        .route("/api/portfolio/summary", get(handlers::portfolio_summary))
        .route("/api/positions", get(handlers::positions))
        .route(
            "/api/trade-instructions/active",
            get(handlers::active_trade_instructions),
        )
        .route("/api/trade-logs", get(handlers::trade_logs))
        .with_state(state)
        .layer(cors)
}
