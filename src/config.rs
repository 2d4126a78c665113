use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Values substituted for a team with no usable history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeutralDefaults {
    pub ppg: f64,
    pub goals: f64,
    pub shots: f64,
    pub shots_on_target: f64,
    pub corners: f64,
    pub cards: f64,
    pub fouls: f64,
    pub rate: f64,
    pub volatility: f64,
}

impl Default for NeutralDefaults {
    fn default() -> Self {
        Self {
            ppg: 1.35,
            goals: 1.35,
            shots: 11.5,
            shots_on_target: 3.5,
            corners: 5.0,
            cards: 2.0,
            fouls: 11.0,
            rate: 0.5,
            volatility: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Matches in the form window used by both feature paths
    pub form_window: usize,
    /// Half-life, in matches, for exponentially weighted enrichment
    pub ewm_half_life: f64,
    pub default_rest_days: f64,
    pub strength_epsilon: f64,
    pub top_form_ppg: f64,
    pub defensive_lock_ga: f64,
    pub volatility_floor: f64,
    pub min_referee_sample: usize,
    pub default_referee_cards: f64,
    pub neutral: NeutralDefaults,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            form_window: 5,
            ewm_half_life: 5.0,
            default_rest_days: 7.0,
            strength_epsilon: 0.1,
            top_form_ppg: 2.0,
            defensive_lock_ga: 0.9,
            volatility_floor: 0.25,
            min_referee_sample: 5,
            default_referee_cards: 3.8,
            neutral: NeutralDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapConfig {
    /// Calendar months treated as the business end of the season
    pub late_season_months: Vec<u32>,
    pub close_form_ppg: f64,
    pub close_xg: f64,
    pub fatigue_rest_days: f64,
    pub low_shot_volume: f64,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            late_season_months: vec![4, 5],
            close_form_ppg: 0.3,
            close_xg: 0.3,
            fatigue_rest_days: 4.0,
            low_shot_volume: 10.0,
        }
    }
}

/// Model hyperparameters. Persisted with every bundle; a mismatch invalidates the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub half_life_days: f64,
    pub rounds: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
    pub l2_lambda: f64,
    pub validation_fraction: f64,
    pub min_training_rows: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            half_life_days: 365.0,
            rounds: 120,
            max_depth: 3,
            learning_rate: 0.08,
            min_samples_leaf: 20,
            l2_lambda: 1.0,
            validation_fraction: 0.15,
            min_training_rows: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OddsConfig {
    /// Bookmaker-style margin multiplier applied to synthesized prices
    pub margin: f64,
    /// Exponent of the goal-line power law
    pub goal_power: f64,
    pub min_decimal_odds: f64,
}

impl Default for OddsConfig {
    fn default() -> Self {
        Self {
            margin: 1.05,
            goal_power: 2.2,
            min_decimal_odds: 1.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub database_url: String,
    pub model_path: String,
    pub alias_path: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:../data/matchcast.db".to_string(),
            model_path: "../data/model_bundle.json".to_string(),
            alias_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub features: FeatureConfig,
    pub traps: TrapConfig,
    pub training: TrainingConfig,
    pub odds: OddsConfig,
    pub paths: PathsConfig,
}

impl EngineConfig {
    /// Defaults, overlaid with the JSON file named by `MATCHCAST_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("MATCHCAST_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path))?
            }
            Err(_) => EngineConfig::default(),
        };

        if let Ok(url) = env::var("DATABASE_URL") {
            config.paths.database_url = url;
        }
        if let Ok(path) = env::var("MATCHCAST_MODEL_PATH") {
            config.paths.model_path = path;
        }
        if let Ok(path) = env::var("MATCHCAST_ALIAS_PATH") {
            config.paths.alias_path = Some(path);
        }
        if let Ok(window) = env::var("MATCHCAST_FORM_WINDOW") {
            config.features.form_window = window
                .parse()
                .with_context(|| format!("MATCHCAST_FORM_WINDOW is not a number: {}", window))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.features.form_window == 0 {
            anyhow::bail!("form_window must be at least 1 match");
        }
        if self.features.ewm_half_life.is_nan() || self.features.ewm_half_life <= 0.0 {
            anyhow::bail!("ewm_half_life must be positive, got {}", self.features.ewm_half_life);
        }
        if self.odds.min_decimal_odds.is_nan() || self.odds.min_decimal_odds <= 1.0 {
            anyhow::bail!("min_decimal_odds must exceed 1.0, got {}", self.odds.min_decimal_odds);
        }
        Ok(())
    }
}
