//! Outcome model bank.
//!
//! One boosted tree ensemble per target over the shared feature schema, a
//! column-mean imputer fit once at training time, and a versioned JSON bundle
//! cached on disk. Every target answers independently: a missing or broken
//! model only affects its own output.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{EngineConfig, FeatureConfig, TrainingConfig, TrapConfig};
use crate::error::EngineError;
use crate::models::{Target, TargetKind};
use crate::services::boosting::{self, BoostedEnsemble, Objective, TreeParams};
use crate::services::feature_builder::FeatureTable;
use crate::services::feature_schema::{feature_names, FeatureVector};
use crate::utils::recency_weight;

/// Bump whenever the bundle layout or the feature definitions change
pub const BUNDLE_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Imputer {
    pub means: Vec<f64>,
}

impl Imputer {
    /// Column means over present, finite values; 0.0 for an all-missing column
    pub fn fit(rows: &[&[Option<f64>]], width: usize) -> Self {
        let mut sums = vec![0.0; width];
        let mut counts = vec![0usize; width];
        for row in rows {
            for (col, value) in row.iter().enumerate().take(width) {
                if let Some(v) = value.filter(|v| v.is_finite()) {
                    sums[col] += v;
                    counts[col] += 1;
                }
            }
        }
        let means = sums
            .iter()
            .zip(&counts)
            .map(|(s, c)| if *c > 0 { s / *c as f64 } else { 0.0 })
            .collect();
        Self { means }
    }

    pub fn transform(&self, values: &[Option<f64>]) -> Vec<f64> {
        self.means
            .iter()
            .enumerate()
            .map(|(col, mean)| {
                values
                    .get(col)
                    .copied()
                    .flatten()
                    .filter(|v| v.is_finite())
                    .unwrap_or(*mean)
            })
            .collect()
    }
}

/// Settings that give each feature column its meaning. A bundle only serves
/// vectors built with the settings it was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSettings {
    pub features: FeatureConfig,
    pub traps: TrapConfig,
}

impl From<&EngineConfig> for FeatureSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            features: config.features.clone(),
            traps: config.traps.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetModel {
    pub target: Target,
    pub ensemble: BoostedEnsemble,
}

/// Everything needed to serve predictions, persisted as one JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub schema_version: u32,
    pub bundle_id: String,
    pub trained_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    pub hyperparameters: TrainingConfig,
    pub feature_settings: FeatureSettings,
    pub imputer: Imputer,
    pub models: Vec<TargetModel>,
    pub training_rows: usize,
    pub history_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HoldoutMetric {
    Classifier { brier: f64, accuracy: f64 },
    Regressor { mae: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetDiagnostics {
    pub target: Target,
    /// None when trained, otherwise why the target is unavailable
    pub failure: Option<String>,
    pub holdout: Option<HoldoutMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingDiagnostics {
    pub bundle_id: String,
    pub rows: usize,
    pub holdout_rows: usize,
    pub targets: Vec<TargetDiagnostics>,
}

impl TrainingDiagnostics {
    pub fn failed_targets(&self) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|t| t.failure.is_some())
            .map(|t| t.target)
            .collect()
    }
}

/// Per-target inference results; failures stay typed
#[derive(Debug)]
pub struct TargetOutputs {
    outputs: Vec<(Target, Result<f64, EngineError>)>,
}

impl TargetOutputs {
    pub fn get(&self, target: Target) -> Option<&Result<f64, EngineError>> {
        self.outputs.iter().find(|(t, _)| *t == target).map(|(_, r)| r)
    }

    /// The model's value, or the target's neutral fallback
    pub fn value_or_fallback(&self, target: Target) -> f64 {
        match self.get(target) {
            Some(Ok(v)) => *v,
            _ => target.fallback(),
        }
    }

    pub fn fallbacks(&self) -> Vec<Target> {
        self.outputs
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(t, _)| *t)
            .collect()
    }
}

/// Exponential recency weights relative to the newest date
pub fn recency_weights(dates: &[NaiveDate], half_life_days: f64) -> Vec<f64> {
    let Some(newest) = dates.iter().max().copied() else {
        return Vec::new();
    };
    dates
        .iter()
        .map(|d| recency_weight((newest - *d).num_days() as f64, half_life_days))
        .collect()
}

fn objective_for(target: Target) -> Objective {
    match target.kind() {
        TargetKind::Classifier => Objective::Logistic,
        TargetKind::Regressor => Objective::SquaredError,
    }
}

#[derive(Debug, Clone)]
pub struct ModelBank {
    bundle: ModelBundle,
}

impl ModelBank {
    pub fn from_bundle(bundle: ModelBundle) -> Self {
        Self { bundle }
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    pub fn train(table: &FeatureTable, engine: &EngineConfig, history_fingerprint: &str) -> (Self, TrainingDiagnostics) {
        let config = &engine.training;
        let names = feature_names();
        let rows = &table.rows;
        let bundle_id = uuid::Uuid::new_v4().to_string();

        let values: Vec<&[Option<f64>]> = rows.iter().map(|r| r.vector.values()).collect();
        let imputer = Imputer::fit(&values, names.len());
        let x: Vec<Vec<f64>> = values.iter().map(|v| imputer.transform(v)).collect();
        let dates: Vec<NaiveDate> = rows.iter().map(|r| r.record.date).collect();
        let weights = recency_weights(&dates, config.half_life_days);
        let params = TreeParams::from(config);

        // rows are in date order, so the holdout is the most recent slice
        let holdout_rows = (rows.len() as f64 * config.validation_fraction.clamp(0.0, 0.5)).floor() as usize;
        let validate = holdout_rows > 0 && rows.len() - holdout_rows >= config.min_training_rows;
        let split = rows.len() - holdout_rows;

        let mut models = Vec::new();
        let mut targets = Vec::new();

        for target in Target::ALL {
            if rows.len() < config.min_training_rows {
                let reason = format!("only {} training rows, need {}", rows.len(), config.min_training_rows);
                tracing::warn!("{}", EngineError::ModelUnavailable { target, reason: reason.clone() });
                targets.push(TargetDiagnostics { target, failure: Some(reason), holdout: None });
                continue;
            }

            let y: Vec<f64> = rows
                .iter()
                .map(|r| target.label(r.record.home_goals, r.record.away_goals))
                .collect();
            let objective = objective_for(target);

            let holdout = if validate {
                let train_values = &values[..split];
                let fold_imputer = Imputer::fit(train_values, names.len());
                let fold_x: Vec<Vec<f64>> = train_values.iter().map(|v| fold_imputer.transform(v)).collect();
                boosting::fit(&fold_x, &y[..split], &weights[..split], objective, &params)
                    .ok()
                    .map(|model| {
                        let preds: Vec<f64> = values[split..]
                            .iter()
                            .map(|v| model.predict(&fold_imputer.transform(v)))
                            .collect();
                        holdout_metric(target, &preds, &y[split..])
                    })
            } else {
                None
            };

            match boosting::fit(&x, &y, &weights, objective, &params) {
                Ok(ensemble) => {
                    tracing::debug!("Trained {} with {} trees", target, ensemble.trees.len());
                    models.push(TargetModel { target, ensemble });
                    targets.push(TargetDiagnostics { target, failure: None, holdout });
                }
                Err(e) => {
                    let err = EngineError::ModelUnavailable { target, reason: e.to_string() };
                    tracing::warn!("{}", err);
                    targets.push(TargetDiagnostics { target, failure: Some(e.to_string()), holdout: None });
                }
            }
        }

        tracing::info!(
            "Trained model bundle {}: {} rows, {} of {} targets available",
            bundle_id,
            rows.len(),
            models.len(),
            Target::ALL.len()
        );

        let bundle = ModelBundle {
            schema_version: BUNDLE_SCHEMA_VERSION,
            bundle_id: bundle_id.clone(),
            trained_at: Utc::now(),
            feature_names: names,
            hyperparameters: config.clone(),
            feature_settings: FeatureSettings::from(engine),
            imputer,
            models,
            training_rows: rows.len(),
            history_fingerprint: history_fingerprint.to_string(),
        };
        let diagnostics = TrainingDiagnostics {
            bundle_id,
            rows: rows.len(),
            holdout_rows: if validate { holdout_rows } else { 0 },
            targets,
        };
        (Self { bundle }, diagnostics)
    }

    pub fn predict(&self, vector: &FeatureVector) -> TargetOutputs {
        let (aligned, missing) = vector.align_to(&self.bundle.feature_names);
        for name in missing {
            tracing::warn!("{}", EngineError::FeatureSchemaMismatch(name));
        }
        let x = self.bundle.imputer.transform(&aligned);

        let outputs = Target::ALL
            .iter()
            .map(|&target| {
                let result = match self.bundle.models.iter().find(|m| m.target == target) {
                    None => Err(EngineError::ModelUnavailable {
                        target,
                        reason: "no trained model".to_string(),
                    }),
                    Some(m) if m.ensemble.n_features != x.len() => Err(EngineError::ModelUnavailable {
                        target,
                        reason: format!("expects {} features, got {}", m.ensemble.n_features, x.len()),
                    }),
                    Some(m) => {
                        let value = m.ensemble.predict(&x);
                        if value.is_finite() {
                            Ok(value)
                        } else {
                            Err(EngineError::ModelUnavailable {
                                target,
                                reason: "non-finite output".to_string(),
                            })
                        }
                    }
                };
                (target, result)
            })
            .collect();
        TargetOutputs { outputs }
    }

    /// Write the bundle atomically: temp file in the same directory, then rename
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec(&self.bundle)?;
        let tmp = temp_path(path);
        fs::write(&tmp, json)?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::info!("Saved model bundle {} to {}", self.bundle.bundle_id, path.display());
        Ok(())
    }

    /// Load a cached bundle, rejecting it unless it matches the current schema,
    /// feature settings and hyperparameters
    pub fn load(path: &Path, config: &EngineConfig) -> Result<Self, EngineError> {
        let raw = fs::read(path)?;
        let bundle: ModelBundle = serde_json::from_slice(&raw)?;

        if bundle.schema_version != BUNDLE_SCHEMA_VERSION {
            return Err(EngineError::StaleCache(format!(
                "schema version {} (current {})",
                bundle.schema_version, BUNDLE_SCHEMA_VERSION
            )));
        }
        if bundle.feature_names != feature_names() {
            return Err(EngineError::StaleCache("feature list differs".to_string()));
        }
        if bundle.feature_settings.features != config.features {
            return Err(EngineError::StaleCache("feature settings differ".to_string()));
        }
        if bundle.feature_settings.traps != config.traps {
            return Err(EngineError::StaleCache("trap settings differ".to_string()));
        }
        if bundle.hyperparameters != config.training {
            return Err(EngineError::StaleCache("hyperparameters differ".to_string()));
        }
        Ok(Self { bundle })
    }

    /// Reuse a compatible cache or train and save a fresh bundle. Never fails:
    /// a bad cache means retraining and a failed save is only logged.
    pub fn load_or_train<F>(
        path: &Path,
        config: &EngineConfig,
        history_fingerprint: &str,
        build_table: F,
    ) -> (Self, Option<TrainingDiagnostics>)
    where
        F: FnOnce() -> FeatureTable,
    {
        match Self::load(path, config) {
            Ok(bank) => {
                if bank.bundle.history_fingerprint != history_fingerprint {
                    tracing::info!(
                        "Model bundle {} was trained on older history; run `train --retrain` to refresh",
                        bank.bundle.bundle_id
                    );
                }
                tracing::info!("Loaded model bundle {} from {}", bank.bundle.bundle_id, path.display());
                return (bank, None);
            }
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No model cache at {}, training", path.display());
            }
            Err(e) => {
                tracing::warn!("Ignoring model cache at {}: {}", path.display(), e);
            }
        }

        let table = build_table();
        let (bank, diagnostics) = Self::train(&table, config, history_fingerprint);
        if let Err(e) = bank.save(path) {
            tracing::error!("Failed to save model bundle to {}: {}", path.display(), e);
        }
        (bank, Some(diagnostics))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn holdout_metric(target: Target, preds: &[f64], labels: &[f64]) -> HoldoutMetric {
    let n = preds.len().max(1) as f64;
    match target.kind() {
        TargetKind::Classifier => {
            let brier = preds.iter().zip(labels).map(|(p, y)| (p - y).powi(2)).sum::<f64>() / n;
            let correct = preds
                .iter()
                .zip(labels)
                .filter(|(p, y)| (**p >= 0.5) == (**y >= 0.5))
                .count();
            HoldoutMetric::Classifier { brier, accuracy: correct as f64 / n }
        }
        TargetKind::Regressor => HoldoutMetric::Regressor {
            mae: preds.iter().zip(labels).map(|(p, y)| (p - y).abs()).sum::<f64>() / n,
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::feature_builder::FeatureBuilder;
    use crate::services::history::test_support::*;
    use crate::services::history::MatchHistory;

    pub(crate) fn fast_training() -> TrainingConfig {
        TrainingConfig {
            rounds: 15,
            min_samples_leaf: 5,
            min_training_rows: 30,
            ..TrainingConfig::default()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            training: fast_training(),
            ..EngineConfig::default()
        }
    }

    fn table(rounds: usize) -> FeatureTable {
        let cfg = EngineConfig::default();
        let history = MatchHistory::new(league_history(
            &["A", "B", "C", "D", "E", "F", "G", "H"],
            rounds,
            date(2023, 8, 12),
        ));
        FeatureBuilder::new(&cfg).build(&history)
    }

    #[test]
    fn test_imputer_uses_column_means() {
        let a = [Some(1.0), None, Some(f64::NAN)];
        let b = [Some(3.0), None, Some(2.0)];
        let imputer = Imputer::fit(&[&a[..], &b[..]], 3);
        assert_eq!(imputer.means, vec![2.0, 0.0, 2.0]);
        assert_eq!(imputer.transform(&[None, Some(5.0)]), vec![2.0, 5.0, 2.0]);
    }

    #[test]
    fn test_recency_weights_favour_recent_rows() {
        let dates = [date(2022, 1, 1), date(2023, 1, 1), date(2024, 1, 1)];
        let w = recency_weights(&dates, 365.0);
        assert_eq!(w[2], 1.0);
        assert!(w[0] < w[1] && w[1] < w[2]);
        assert!(w[0] > 0.0);
    }

    #[test]
    fn test_train_and_predict_all_targets() {
        let (bank, diagnostics) = ModelBank::train(&table(20), &config(), "fp");
        assert!(diagnostics.failed_targets().is_empty());
        assert!(diagnostics.holdout_rows > 0);
        assert_eq!(bank.bundle().models.len(), Target::ALL.len());

        let outputs = bank.predict(&table(20).rows[70].vector);
        assert!(outputs.fallbacks().is_empty());
        for target in Target::ALL {
            let v = outputs.value_or_fallback(target);
            match target.kind() {
                TargetKind::Classifier => assert!(v > 0.0 && v < 1.0),
                TargetKind::Regressor => assert!(v >= 0.0),
            }
        }
    }

    #[test]
    fn test_too_few_rows_fall_back_per_target() {
        let (bank, diagnostics) = ModelBank::train(&table(2), &config(), "fp");
        assert_eq!(diagnostics.failed_targets().len(), Target::ALL.len());
        let outputs = bank.predict(&table(2).rows[0].vector);
        assert_eq!(outputs.value_or_fallback(Target::HomeWin), 0.5);
        assert_eq!(outputs.value_or_fallback(Target::HomeGoals), 0.0);
        assert!(matches!(
            outputs.get(Target::Draw),
            Some(Err(EngineError::ModelUnavailable { .. }))
        ));
    }

    #[test]
    fn test_single_missing_model_only_affects_its_target() {
        let (bank, _) = ModelBank::train(&table(12), &config(), "fp");
        let mut bundle = bank.bundle().clone();
        bundle.models.retain(|m| m.target != Target::Btts);
        let bank = ModelBank::from_bundle(bundle);

        let outputs = bank.predict(&table(12).rows[30].vector);
        assert_eq!(outputs.fallbacks(), vec![Target::Btts]);
        assert_eq!(outputs.value_or_fallback(Target::Btts), 0.5);
        assert!(outputs.get(Target::Over25).unwrap().is_ok());
    }

    #[test]
    fn test_missing_features_are_imputed() {
        let (bank, _) = ModelBank::train(&table(12), &config(), "fp");
        let empty = FeatureVector::from_values(vec![None; 3]);
        let outputs = bank.predict(&empty);
        assert!(outputs.fallbacks().is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        let config = config();
        let (bank, _) = ModelBank::train(&table(12), &config, "fp");
        bank.save(&path).unwrap();

        let loaded = ModelBank::load(&path, &config).unwrap();
        assert_eq!(loaded.bundle().bundle_id, bank.bundle().bundle_id);
        assert_eq!(loaded.bundle().models.len(), bank.bundle().models.len());
        let vector = &table(12).rows[40].vector;
        for target in Target::ALL {
            let a = loaded.predict(vector).value_or_fallback(target);
            let b = bank.predict(vector).value_or_fallback(target);
            assert!((a - b).abs() < 1e-9, "{} differs after reload", target);
        }
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_stale_caches_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        let config = config();
        let (bank, _) = ModelBank::train(&table(8), &config, "fp");

        let mut old = bank.bundle().clone();
        old.schema_version = 0;
        ModelBank::from_bundle(old).save(&path).unwrap();
        assert!(matches!(ModelBank::load(&path, &config), Err(EngineError::StaleCache(_))));

        let mut renamed = bank.bundle().clone();
        renamed.feature_names[0] = "elo_diff".to_string();
        ModelBank::from_bundle(renamed).save(&path).unwrap();
        assert!(matches!(ModelBank::load(&path, &config), Err(EngineError::StaleCache(_))));

        bank.save(&path).unwrap();
        let mut other = config.clone();
        other.training.rounds = 99;
        assert!(matches!(ModelBank::load(&path, &other), Err(EngineError::StaleCache(_))));

        let mut other = config.clone();
        other.traps.close_xg = 0.5;
        assert!(matches!(ModelBank::load(&path, &other), Err(EngineError::StaleCache(_))));
        assert!(ModelBank::load(&path, &config).is_ok());
    }

    #[test]
    fn test_changed_feature_settings_force_retraining() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        let config = config();
        let (first, diagnostics) = ModelBank::load_or_train(&path, &config, "fp", || table(8));
        assert!(diagnostics.is_some());

        let mut wider = config.clone();
        wider.features.form_window = 10;
        wider.features.neutral.ppg = 0.5;
        assert!(matches!(ModelBank::load(&path, &wider), Err(EngineError::StaleCache(_))));

        let (second, diagnostics) = ModelBank::load_or_train(&path, &wider, "fp", || table(8));
        assert!(diagnostics.is_some());
        assert_ne!(second.bundle().bundle_id, first.bundle().bundle_id);
        assert_eq!(second.bundle().feature_settings.features.form_window, 10);
    }

    #[test]
    fn test_corrupt_or_missing_cache_triggers_retraining() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("bundle.json");
        let config = config();

        let (_, diagnostics) = ModelBank::load_or_train(&path, &config, "fp", || table(8));
        assert!(diagnostics.is_some());
        assert!(path.exists());

        let (_, diagnostics) = ModelBank::load_or_train(&path, &config, "fp", || table(8));
        assert!(diagnostics.is_none());

        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(ModelBank::load(&path, &config), Err(EngineError::Json(_))));
        let (bank, diagnostics) = ModelBank::load_or_train(&path, &config, "fp", || table(8));
        assert!(diagnostics.is_some());
        assert_eq!(ModelBank::load(&path, &config).unwrap().bundle().bundle_id, bank.bundle().bundle_id);
    }
}
