use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum SentraError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Caller-fault validation (4xx-equivalent)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    // Caller/engine races
    #[error("strategy {strategy_id} is locked until {lock_until}")]
    StrategyLocked {
        strategy_id: String,
        lock_until: DateTime<Utc>,
    },

    #[error("Invalid state transition for {strategy_id}: {from} -> {to}")]
    InvalidTransition {
        strategy_id: String,
        from: String,
        to: String,
    },

    #[error("strategy {0} has a stale version; reload and retry")]
    VersionConflict(String),

    #[error("strategy {0} only accepts upstream activation")]
    UpstreamOnlyActivation(String),

    #[error("strategy {strategy_id} chain would form a cycle via {via}")]
    CycleDetected { strategy_id: String, via: String },

    // Market data / evaluation
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Condition evaluation failed: {0}")]
    Evaluation(String),

    // Gateway errors
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Gateway request timed out after {0}s")]
    GatewayTimeout(u64),

    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order rejected by gateway: {0}")]
    OrderRejected(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SentraError {
    /// Stable machine-readable code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SentraError::Config(_) | SentraError::ConfigInvalid(_) => "CONFIG_INVALID",
            SentraError::Database(_) | SentraError::Migration(_) => "STORE_FAILURE",
            SentraError::Json(_) => "PAYLOAD_INVALID",
            SentraError::Validation(_) => "VALIDATION",
            SentraError::NotFound { .. } => "NOT_FOUND",
            SentraError::StrategyLocked { .. } => "STRATEGY_LOCKED",
            SentraError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SentraError::VersionConflict(_) => "VERSION_CONFLICT",
            SentraError::UpstreamOnlyActivation(_) => "UPSTREAM_ONLY_ACTIVATION",
            SentraError::CycleDetected { .. } => "CYCLE_DETECTED",
            SentraError::MarketDataUnavailable(_) => "MARKET_DATA_UNAVAILABLE",
            SentraError::Evaluation(_) => "EVALUATION_FAILED",
            SentraError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            SentraError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            SentraError::OrderSubmission(_) => "ORDER_SUBMISSION_FAILED",
            SentraError::OrderRejected(_) => "ORDER_REJECTED",
            SentraError::Io(_) => "IO_FAILURE",
            SentraError::Internal(_) | SentraError::Other(_) => "INTERNAL",
        }
    }

    /// Whether the error is worth retrying inside a leased run.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SentraError::GatewayUnavailable(_)
                | SentraError::GatewayTimeout(_)
                | SentraError::MarketDataUnavailable(_)
        )
    }
}

/// Result type alias for SentraError
pub type Result<T> = std::result::Result<T, SentraError>;
