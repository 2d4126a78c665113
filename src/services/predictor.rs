use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{
    ExpectedGoals, Fixture, KnownOdds, OutcomeProbabilities, Prediction, RefereeContext, ResolvedTeam, Target,
    TeamSnapshot,
};
use crate::services::aliases::AliasTable;
use crate::services::feature_builder::FeatureBuilder;
use crate::services::feature_schema::{derive_interactions, FeatureVector};
use crate::services::history::MatchHistory;
use crate::services::model_bank::{ModelBank, TrainingDiagnostics};
use crate::services::odds::resolve_odds;
use crate::services::team_form::TeamFormStore;
use crate::utils::normalize_probabilities;

/// A prospective match to price
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub home_team: String,
    pub away_team: String,
    /// Defaults to today
    #[serde(default)]
    pub match_date: Option<NaiveDate>,
    #[serde(default)]
    pub referee: Option<String>,
    /// Defaults to the home side's most recent league
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub known_odds: Option<KnownOdds>,
}

impl PredictionRequest {
    pub fn new(home_team: &str, away_team: &str) -> Self {
        Self {
            home_team: home_team.to_string(),
            away_team: away_team.to_string(),
            ..Self::default()
        }
    }

    pub fn on(mut self, date: NaiveDate) -> Self {
        self.match_date = Some(date);
        self
    }

    pub fn with_referee(mut self, referee: &str) -> Self {
        self.referee = Some(referee.to_string());
        self
    }

    pub fn with_odds(mut self, odds: KnownOdds) -> Self {
        self.known_odds = Some(odds);
        self
    }
}

impl From<&Fixture> for PredictionRequest {
    fn from(fixture: &Fixture) -> Self {
        Self {
            home_team: fixture.home_team.clone(),
            away_team: fixture.away_team.clone(),
            match_date: Some(fixture.date),
            referee: fixture.referee.clone(),
            league: Some(fixture.league.clone()),
            known_odds: (!fixture.odds.is_empty()).then(|| fixture.odds.clone()),
        }
    }
}

/// Read-only after construction; share it behind an `Arc`.
pub struct PredictionEngine {
    history: Arc<MatchHistory>,
    store: TeamFormStore,
    bank: ModelBank,
    config: EngineConfig,
}

impl PredictionEngine {
    pub fn new(history: Arc<MatchHistory>, mut aliases: AliasTable, bank: ModelBank, config: EngineConfig) -> Self {
        aliases.register_teams(history.team_names());
        let store = TeamFormStore::new(history.clone(), Arc::new(aliases), config.features.clone());
        Self {
            history,
            store,
            bank,
            config,
        }
    }

    /// Build the feature table from `history` and train a fresh bundle
    pub fn train(history: MatchHistory, aliases: AliasTable, config: EngineConfig) -> (Self, TrainingDiagnostics) {
        let (history, aliases) = canonicalize(history, aliases);
        let table = FeatureBuilder::new(&config).build(&history);
        let (bank, diagnostics) = ModelBank::train(&table, &config, &history.fingerprint());
        (Self::new(Arc::new(history), aliases, bank, config), diagnostics)
    }

    /// Load the cached bundle when it is compatible, otherwise train and cache one.
    /// `retrain` ignores any cache.
    pub fn bootstrap(
        history: MatchHistory,
        aliases: AliasTable,
        config: EngineConfig,
        retrain: bool,
    ) -> (Self, Option<TrainingDiagnostics>) {
        let (history, aliases) = canonicalize(history, aliases);
        let model_path = config.paths.model_path.clone();
        let path = Path::new(&model_path);
        let fingerprint = history.fingerprint();

        let (bank, diagnostics) = if retrain {
            let table = FeatureBuilder::new(&config).build(&history);
            let (bank, diagnostics) = ModelBank::train(&table, &config, &fingerprint);
            if let Err(e) = bank.save(path) {
                tracing::error!("Failed to save model bundle to {}: {}", path.display(), e);
            }
            (bank, Some(diagnostics))
        } else {
            ModelBank::load_or_train(path, &config, &fingerprint, || {
                FeatureBuilder::new(&config).build(&history)
            })
        };

        (Self::new(Arc::new(history), aliases, bank, config), diagnostics)
    }

    pub fn model_version(&self) -> &str {
        &self.bank.bundle().bundle_id
    }

    pub fn model_bank(&self) -> &ModelBank {
        &self.bank
    }

    pub fn history(&self) -> &MatchHistory {
        &self.history
    }

    pub fn resolve_team(&self, name: &str) -> Option<ResolvedTeam> {
        self.store.aliases().resolve(name)
    }

    pub fn get_team_state(&self, name: &str, as_of: Option<NaiveDate>) -> Option<TeamSnapshot> {
        self.store.get_team_state(name, as_of)
    }

    /// Full prediction for one match. `None` when either side cannot be resolved
    /// or has no history before the match date.
    pub fn predict(&self, request: &PredictionRequest) -> Option<Prediction> {
        let match_date = request.match_date.unwrap_or_else(|| Utc::now().date_naive());

        let home = self.snapshot(&request.home_team, match_date)?;
        let away = self.snapshot(&request.away_team, match_date)?;
        if home.team.canonical == away.team.canonical {
            tracing::warn!("Refusing to predict {} against itself", home.team.canonical);
            return None;
        }

        let features = &self.config.features;
        let referee = RefereeContext::from_profile(
            request.referee.clone(),
            request
                .referee
                .as_deref()
                .and_then(|name| self.history.referee_profile(name, match_date)),
            features.min_referee_sample,
            features.default_referee_cards,
        );

        let league = request
            .league
            .clone()
            .or_else(|| self.history.latest_league(&home.team.canonical, match_date));
        let league_baseline = league
            .as_deref()
            .and_then(|l| self.history.league_baseline(l, match_date))
            .unwrap_or(features.neutral.goals);

        let interactions = derive_interactions(
            &home.state,
            &away.state,
            league_baseline,
            match_date,
            features,
            &self.config.traps,
        );
        let vector = FeatureVector::assemble(&home.state, &away.state, &referee, &interactions);
        let outputs = self.bank.predict(&vector);
        for target in outputs.fallbacks() {
            if let Some(Err(e)) = outputs.get(target) {
                tracing::debug!("{} vs {}: {}", home.team.canonical, away.team.canonical, e);
            }
        }

        let mut draw = outputs.value_or_fallback(Target::Draw);
        let home_win = outputs.value_or_fallback(Target::HomeWin);
        let away_win = outputs.value_or_fallback(Target::AwayWin);
        if interactions.traps.closely_matched {
            draw = draw.max(home_win).max(away_win);
        }
        let result = normalize_probabilities(&[home_win, draw, away_win]);

        let probabilities = OutcomeProbabilities {
            home_win: result[0],
            draw: result[1],
            away_win: result[2],
            over15: outputs.value_or_fallback(Target::Over15).clamp(0.0, 1.0),
            over25: outputs.value_or_fallback(Target::Over25).clamp(0.0, 1.0),
            btts: outputs.value_or_fallback(Target::Btts).clamp(0.0, 1.0),
        };
        let expected_goals = ExpectedGoals {
            home: outputs.value_or_fallback(Target::HomeGoals).max(0.0),
            away: outputs.value_or_fallback(Target::AwayGoals).max(0.0),
        };
        let odds = resolve_odds(
            &probabilities,
            &expected_goals,
            request.known_odds.as_ref(),
            &self.config.odds,
        );

        tracing::info!(
            "Generated prediction for {} vs {}: Home {:.2}%, Draw {:.2}%, Away {:.2}%, xG {:.2}-{:.2}",
            home.team.canonical,
            away.team.canonical,
            probabilities.home_win * 100.0,
            probabilities.draw * 100.0,
            probabilities.away_win * 100.0,
            expected_goals.home,
            expected_goals.away
        );

        Some(Prediction {
            home: home.team,
            away: away.team,
            match_date,
            league,
            referee,
            home_state: home.state,
            away_state: away.state,
            probabilities,
            expected_goals,
            odds,
            traps: interactions.traps,
            fallbacks: outputs.fallbacks(),
            model_version: self.model_version().to_string(),
        })
    }

    /// Predict every fixture that can be priced; the rest are logged and skipped
    pub fn predict_fixtures(&self, fixtures: &[Fixture]) -> Vec<Prediction> {
        fixtures
            .iter()
            .filter_map(|fixture| {
                let prediction = self.predict(&PredictionRequest::from(fixture));
                if prediction.is_none() {
                    tracing::warn!(
                        "Skipping fixture {} vs {} on {}: not enough history",
                        fixture.home_team,
                        fixture.away_team,
                        fixture.date
                    );
                }
                prediction
            })
            .collect()
    }

    fn snapshot(&self, name: &str, match_date: NaiveDate) -> Option<TeamSnapshot> {
        let Some(team) = self.resolve_team(name) else {
            tracing::debug!("{}", EngineError::UnresolvedTeam(name.to_string()));
            return None;
        };
        match self.store.state_for(&team.canonical, match_date) {
            Ok(state) => Some(TeamSnapshot { team, state }),
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        }
    }
}

/// Register every team in `history` and key the secondary calendar by those names
pub fn canonicalize(history: MatchHistory, mut aliases: AliasTable) -> (MatchHistory, AliasTable) {
    aliases.register_teams(history.team_names());
    let history = history.resolve_secondary_names(&aliases);
    (history, aliases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Market, NameMatch, OddsSource, ResultCode};
    use crate::services::history::test_support::*;
    use crate::services::model_bank::tests::fast_training;

    const TEAMS: [&str; 8] = ["Arsenal", "Chelsea", "Everton", "Fulham", "Liverpool", "Brighton", "Wolves", "Burnley"];

    fn config() -> EngineConfig {
        EngineConfig {
            training: fast_training(),
            ..EngineConfig::default()
        }
    }

    /// A trained league plus two teams with identical records
    fn history() -> MatchHistory {
        let mut matches = league_history(&TEAMS, 20, date(2023, 8, 12));
        for week in 0..6 {
            let on = date(2024, 2, 3) + chrono::Duration::days(7 * week);
            if week % 2 == 0 {
                matches.push(played(on, "Twin North", "Rival North", 2, 1));
                matches.push(played(on, "Twin South", "Rival South", 2, 1));
            } else {
                matches.push(played(on, "Rival North", "Twin North", 1, 1));
                matches.push(played(on, "Rival South", "Twin South", 1, 1));
            }
        }
        MatchHistory::new(matches)
    }

    fn engine() -> PredictionEngine {
        let mut aliases = AliasTable::with_builtin_aliases();
        aliases.register_team("Newcomers");
        PredictionEngine::train(history(), aliases, config()).0
    }

    fn match_day() -> NaiveDate {
        date(2024, 3, 23)
    }

    #[test]
    fn test_prediction_is_complete_and_consistent() {
        let engine = engine();
        assert!(engine
            .predict(&PredictionRequest::new("Arsenal", "Man City Reserves").on(match_day()))
            .is_none());

        let p = engine
            .predict(&PredictionRequest::new("Arsenal", "Chelsea").on(match_day()).with_referee("A Taylor"))
            .unwrap();
        let sum = p.probabilities.home_win + p.probabilities.draw + p.probabilities.away_win;
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(p.expected_goals.home >= 0.0 && p.expected_goals.away >= 0.0);
        assert!(p.odds.iter().all(|o| o.decimal_odds > 1.0));
        assert!(p.fallbacks.is_empty());
        assert_eq!(p.model_version, engine.model_version());
        assert_eq!(p.league.as_deref(), Some("E0"));
        assert!(!p.referee.is_baseline);
        assert_eq!(p.home.matched, NameMatch::Exact);
    }

    #[test]
    fn test_scenario_b_missing_history_returns_none() {
        let engine = engine();
        assert!(engine.get_team_state("Arsenal", Some(match_day())).unwrap().state.matches_considered >= 5);
        assert!(engine.get_team_state("Newcomers", Some(match_day())).is_none());
        assert!(engine
            .predict(&PredictionRequest::new("Arsenal", "Newcomers").on(match_day()))
            .is_none());
        assert!(engine
            .predict(&PredictionRequest::new("Arsenal", "Arsenal").on(match_day()))
            .is_none());
    }

    #[test]
    fn test_scenario_c_known_odds_are_returned_verbatim() {
        let engine = engine();
        let (known, _) = KnownOdds::from_keyed([("home", 1.80), ("draw", 3.40), ("away", 4.50)]);
        let p = engine
            .predict(&PredictionRequest::new("Liverpool", "Everton").on(match_day()).with_odds(known))
            .unwrap();

        let price = |code| p.odds_for(Market::MatchResult(code)).unwrap();
        assert_eq!(price(ResultCode::Home).decimal_odds, 1.80);
        assert_eq!(price(ResultCode::Draw).decimal_odds, 3.40);
        assert_eq!(price(ResultCode::Away).decimal_odds, 4.50);
        assert_eq!(price(ResultCode::Home).source, OddsSource::Market);
        assert_eq!(p.odds_for(Market::BothTeamsScore(true)).unwrap().source, OddsSource::Model);
    }

    #[test]
    fn test_scenario_d_identical_teams_do_not_get_a_confident_winner() {
        let engine = engine();
        let home = engine.get_team_state("Twin North", Some(match_day())).unwrap();
        let away = engine.get_team_state("Twin South", Some(match_day())).unwrap();
        assert_eq!(home.state.avg_goals_for, away.state.avg_goals_for);
        assert_eq!(home.state.ppg, away.state.ppg);

        let p = engine
            .predict(&PredictionRequest::new("Twin North", "Twin South").on(match_day()))
            .unwrap();
        assert!(p.traps.closely_matched);
        assert!(p.probabilities.draw >= p.probabilities.home_win);
        assert!(p.probabilities.draw >= p.probabilities.away_win);
    }

    #[test]
    fn test_predictions_are_idempotent() {
        let engine = engine();
        let request = PredictionRequest::new("Fulham", "Wolves").on(match_day());
        assert_eq!(engine.predict(&request), engine.predict(&request));
    }

    #[test]
    fn test_single_target_failure_keeps_the_rest() {
        let engine = engine();
        let mut bundle = engine.model_bank().bundle().clone();
        bundle.models.retain(|m| m.target != Target::Over25);
        let engine = PredictionEngine::new(
            engine.history.clone(),
            AliasTable::with_builtin_aliases(),
            ModelBank::from_bundle(bundle),
            config(),
        );

        let p = engine
            .predict(&PredictionRequest::new("Burnley", "Brighton").on(match_day()))
            .unwrap();
        assert_eq!(p.fallbacks, vec![Target::Over25]);
        assert_eq!(p.probabilities.over25, 0.5);
    }

    #[test]
    fn test_untrained_bank_still_predicts_neutral_values() {
        let mut cfg = config();
        cfg.training.min_training_rows = 10_000;
        let (engine, diagnostics) = PredictionEngine::train(history(), AliasTable::new(), cfg);
        assert_eq!(diagnostics.failed_targets().len(), Target::ALL.len());

        let p = engine
            .predict(&PredictionRequest::new("Arsenal", "Chelsea").on(match_day()))
            .unwrap();
        assert_eq!(p.fallbacks.len(), Target::ALL.len());
        assert_eq!(p.expected_goals.total(), 0.0);
        assert!(p.odds.iter().all(|o| o.decimal_odds > 1.0));
    }

    #[test]
    fn test_fixtures_skip_unknown_teams() {
        let engine = engine();
        let fixture = |home: &str, away: &str| Fixture {
            date: match_day(),
            kickoff: Some("15:00".to_string()),
            league: "E0".to_string(),
            home_team: home.to_string(),
            away_team: away.to_string(),
            referee: None,
            odds: KnownOdds::default(),
        };
        let predictions = engine.predict_fixtures(&[fixture("Arsenal", "Wolves"), fixture("Arsenal", "Nowhere Town")]);
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].away.canonical, "Wolves");
    }

    #[test]
    fn test_secondary_schedule_under_another_spelling_counts_as_rest() {
        let history = MatchHistory::new(vec![
            played(date(2024, 1, 1), "Man United", "Arsenal", 2, 1),
            played(date(2023, 12, 26), "Arsenal", "Man United", 0, 0),
        ])
        .with_secondary_fixtures([("Manchester United".to_string(), date(2024, 1, 9))]);
        let (engine, _) = PredictionEngine::train(history, AliasTable::with_builtin_aliases(), config());

        let snapshot = engine.get_team_state("Manchester United", Some(date(2024, 1, 11))).unwrap();
        assert_eq!(snapshot.team.canonical, "Man United");
        assert_eq!(snapshot.state.rest_days, 2.0);
        let arsenal = engine.get_team_state("Arsenal", Some(date(2024, 1, 11))).unwrap();
        assert_eq!(arsenal.state.rest_days, 10.0);
    }

    #[test]
    fn test_bootstrap_retrains_when_feature_settings_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.paths.model_path = dir.path().join("bundle.json").display().to_string();
        let (first, diagnostics) = PredictionEngine::bootstrap(history(), AliasTable::new(), cfg.clone(), false);
        assert!(diagnostics.is_some());

        cfg.features.form_window = 10;
        cfg.features.neutral.ppg = 0.5;
        let (second, diagnostics) = PredictionEngine::bootstrap(history(), AliasTable::new(), cfg, false);
        assert!(diagnostics.is_some());
        assert_ne!(first.model_version(), second.model_version());
    }

    #[test]
    fn test_bootstrap_reuses_the_cached_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.paths.model_path = dir.path().join("bundle.json").display().to_string();

        let (first, diagnostics) = PredictionEngine::bootstrap(history(), AliasTable::new(), cfg.clone(), false);
        assert!(diagnostics.is_some());
        let (second, diagnostics) = PredictionEngine::bootstrap(history(), AliasTable::new(), cfg.clone(), false);
        assert!(diagnostics.is_none());
        assert_eq!(first.model_version(), second.model_version());

        let (third, diagnostics) = PredictionEngine::bootstrap(history(), AliasTable::new(), cfg, true);
        assert!(diagnostics.is_some());
        assert_ne!(third.model_version(), first.model_version());
    }
}
