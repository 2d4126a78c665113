use thiserror::Error;

use crate::models::Target;

/// Engine-level failures. None of these abort a `predict` call; they surface as
/// `None`, per-target fallbacks or a retrain.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Insufficient history for {team}: {matches} matches")]
    DataInsufficient { team: String, matches: usize },

    #[error("Feature {0} missing from vector, imputed")]
    FeatureSchemaMismatch(String),

    #[error("Model for {target} unavailable: {reason}")]
    ModelUnavailable { target: Target, reason: String },

    #[error("Team name '{0}' could not be resolved")]
    UnresolvedTeam(String),

    #[error("Model cache rejected: {0}")]
    StaleCache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
