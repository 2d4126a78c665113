pub mod aliases;
pub mod boosting;
pub mod feature_builder;
pub mod feature_schema;
pub mod history;
pub mod model_bank;
pub mod odds;
pub mod predictor;
pub mod team_form;

pub use aliases::AliasTable;
pub use feature_builder::{AggregationMode, FeatureBuilder, FeatureTable};
pub use history::MatchHistory;
pub use model_bank::{ModelBank, TrainingDiagnostics};
pub use predictor::{PredictionEngine, PredictionRequest};
pub use team_form::TeamFormStore;
