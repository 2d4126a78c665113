//! Fixed-order feature schema shared by training and inference.
//!
//! Both the feature builder and the prediction assembler go through
//! [`derive_interactions`] and [`FeatureVector::assemble`], so column order
//! and interaction definitions cannot drift between the two.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::{FeatureConfig, TrapConfig};
use crate::models::{RefereeContext, TeamTemporalState, TrapFlags};

pub const FEATURE_NAMES: [&str; 40] = [
    "home_ppg",
    "away_ppg",
    "home_avg_goals_for",
    "home_avg_goals_against",
    "away_avg_goals_for",
    "away_avg_goals_against",
    "home_avg_shots_for",
    "away_avg_shots_for",
    "home_avg_sot_for",
    "home_avg_sot_against",
    "away_avg_sot_for",
    "away_avg_sot_against",
    "home_avg_corners_for",
    "away_avg_corners_for",
    "home_btts_rate",
    "away_btts_rate",
    "home_over25_rate",
    "away_over25_rate",
    "home_clean_sheet_rate",
    "away_clean_sheet_rate",
    "home_failed_to_score_rate",
    "away_failed_to_score_rate",
    "home_goal_volatility",
    "away_goal_volatility",
    "home_schedule_difficulty",
    "away_schedule_difficulty",
    "home_rest_days",
    "away_rest_days",
    "referee_avg_cards",
    "home_attack_strength",
    "away_attack_strength",
    "home_xg_proxy",
    "away_xg_proxy",
    "home_z_score",
    "away_z_score",
    "top_clash",
    "defensive_lock",
    "timing_trap",
    "fatigue_trap",
    "style_clash_trap",
];

pub fn feature_names() -> Vec<String> {
    FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
}

/// Derived cross-team terms for one prospective match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interactions {
    pub home_attack_strength: f64,
    pub away_attack_strength: f64,
    pub home_xg_proxy: f64,
    pub away_xg_proxy: f64,
    pub home_z_score: f64,
    pub away_z_score: f64,
    pub top_clash: bool,
    pub defensive_lock: bool,
    pub traps: TrapFlags,
}

/// Recent scoring relative to the league, in units of the team's own volatility
pub fn z_score(state: &TeamTemporalState, league_baseline: f64, volatility_floor: f64) -> f64 {
    (state.avg_goals_for - league_baseline) / state.goal_volatility.max(volatility_floor)
}

pub fn derive_interactions(
    home: &TeamTemporalState,
    away: &TeamTemporalState,
    league_baseline: f64,
    match_date: NaiveDate,
    features: &FeatureConfig,
    traps: &TrapConfig,
) -> Interactions {
    let eps = features.strength_epsilon;
    let home_xg_proxy = home.avg_goals_for * away.avg_goals_against;
    let away_xg_proxy = away.avg_goals_for * home.avg_goals_against;
    let close_form = (home.ppg - away.ppg).abs() <= traps.close_form_ppg;

    let flags = TrapFlags {
        timing: traps.late_season_months.contains(&match_date.month()) && close_form,
        fatigue: home.rest_days.min(away.rest_days) < traps.fatigue_rest_days,
        stylistic_clash: home.avg_shots_for < traps.low_shot_volume
            && away.avg_shots_for < traps.low_shot_volume,
        closely_matched: close_form && (home_xg_proxy - away_xg_proxy).abs() <= traps.close_xg,
    };

    Interactions {
        home_attack_strength: home.avg_sot_for / (away.avg_sot_against + eps),
        away_attack_strength: away.avg_sot_for / (home.avg_sot_against + eps),
        home_xg_proxy,
        away_xg_proxy,
        home_z_score: z_score(home, league_baseline, features.volatility_floor),
        away_z_score: z_score(away, league_baseline, features.volatility_floor),
        top_clash: home.ppg > features.top_form_ppg && away.ppg > features.top_form_ppg,
        defensive_lock: home.avg_goals_against < features.defensive_lock_ga
            && away.avg_goals_against < features.defensive_lock_ga,
        traps: flags,
    }
}

/// Numeric model input in [`FEATURE_NAMES`] order. `None` marks a value for the imputer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: Vec<Option<f64>>,
}

impl FeatureVector {
    pub fn assemble(
        home: &TeamTemporalState,
        away: &TeamTemporalState,
        referee: &RefereeContext,
        interactions: &Interactions,
    ) -> Self {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        let raw = [
            home.ppg,
            away.ppg,
            home.avg_goals_for,
            home.avg_goals_against,
            away.avg_goals_for,
            away.avg_goals_against,
            home.avg_shots_for,
            away.avg_shots_for,
            home.avg_sot_for,
            home.avg_sot_against,
            away.avg_sot_for,
            away.avg_sot_against,
            home.avg_corners_for,
            away.avg_corners_for,
            home.btts_rate,
            away.btts_rate,
            home.over25_rate,
            away.over25_rate,
            home.clean_sheet_rate,
            away.clean_sheet_rate,
            home.failed_to_score_rate,
            away.failed_to_score_rate,
            home.goal_volatility,
            away.goal_volatility,
            home.schedule_difficulty,
            away.schedule_difficulty,
            home.rest_days,
            away.rest_days,
            referee.avg_cards,
            interactions.home_attack_strength,
            interactions.away_attack_strength,
            interactions.home_xg_proxy,
            interactions.away_xg_proxy,
            interactions.home_z_score,
            interactions.away_z_score,
            flag(interactions.top_clash),
            flag(interactions.defensive_lock),
            flag(interactions.traps.timing),
            flag(interactions.traps.fatigue),
            flag(interactions.traps.stylistic_clash),
        ];
        Self {
            values: raw.iter().map(|v| v.is_finite().then_some(*v)).collect(),
        }
    }

    #[cfg(test)]
    pub fn from_values(values: Vec<Option<f64>>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let idx = FEATURE_NAMES.iter().position(|n| *n == name)?;
        self.values.get(idx).copied().flatten()
    }

    /// Reorder onto another schema. Names absent from this vector come back as `None`
    /// and are listed in the second element.
    pub fn align_to(&self, names: &[String]) -> (Vec<Option<f64>>, Vec<String>) {
        let mut missing = Vec::new();
        let aligned = names
            .iter()
            .map(|name| match FEATURE_NAMES.iter().position(|n| n == name) {
                Some(idx) => self.values.get(idx).copied().flatten(),
                None => {
                    missing.push(name.clone());
                    None
                }
            })
            .collect();
        (aligned, missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, NeutralDefaults};

    fn state(team: &str, ppg: f64, gf: f64, ga: f64) -> TeamTemporalState {
        let mut s = TeamTemporalState::neutral(
            team,
            NaiveDate::from_ymd_opt(2024, 4, 20).unwrap(),
            &NeutralDefaults::default(),
            7.0,
        );
        s.ppg = ppg;
        s.avg_goals_for = gf;
        s.avg_goals_against = ga;
        s.goal_volatility = 0.0;
        s
    }

    #[test]
    fn test_interactions() {
        let config = EngineConfig::default();
        let home = state("A", 2.4, 2.0, 0.5);
        let away = state("B", 2.2, 1.5, 0.8);
        let date = NaiveDate::from_ymd_opt(2024, 4, 20).unwrap();
        let ix = derive_interactions(&home, &away, 1.4, date, &config.features, &config.traps);

        assert!((ix.home_xg_proxy - 1.6).abs() < 1e-9);
        assert!((ix.away_xg_proxy - 0.75).abs() < 1e-9);
        assert!(ix.top_clash);
        assert!(ix.defensive_lock);
        assert!(ix.traps.timing);
        assert!(!ix.traps.closely_matched);
        // volatility 0 is floored to 0.25
        assert!((ix.home_z_score - (2.0 - 1.4) / 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_assemble_matches_schema() {
        let config = EngineConfig::default();
        let home = state("A", 1.0, 1.0, 1.0);
        let away = state("B", 1.0, 1.0, 1.0);
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let ix = derive_interactions(&home, &away, 1.0, date, &config.features, &config.traps);
        let referee = RefereeContext::baseline(None, 3.8);
        let v = FeatureVector::assemble(&home, &away, &referee, &ix);

        assert_eq!(v.values().len(), FEATURE_NAMES.len());
        assert_eq!(v.get("referee_avg_cards"), Some(3.8));
        assert_eq!(v.get("home_ppg"), Some(1.0));

        let (aligned, missing) = v.align_to(&["away_ppg".to_string(), "elo_diff".to_string()]);
        assert_eq!(aligned, vec![Some(1.0), None]);
        assert_eq!(missing, vec!["elo_diff".to_string()]);
    }
}
