//! Team form snapshot store (inference-time path).
//!
//! Recomputes a team's entering-match state straight from raw match records,
//! without touching the feature builder's long table. The two paths share one
//! aggregation definition (unweighted mean of the last `form_window` matches)
//! and are parity-tested against each other.

use chrono::{NaiveDate, Utc};
use std::sync::Arc;

use crate::config::FeatureConfig;
use crate::error::EngineError;
use crate::models::{MatchRecord, SideStats, TeamSnapshot, TeamTemporalState};
use crate::services::aliases::AliasTable;
use crate::services::history::MatchHistory;
use crate::utils::{days_between, mean_present, population_std};

#[derive(Debug, Clone)]
pub struct TeamFormStore {
    history: Arc<MatchHistory>,
    aliases: Arc<AliasTable>,
    config: FeatureConfig,
}

impl TeamFormStore {
    pub fn new(history: Arc<MatchHistory>, aliases: Arc<AliasTable>, config: FeatureConfig) -> Self {
        Self {
            history,
            aliases,
            config,
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Resolve `name` and compute its state as of `as_of` (default: today).
    /// `None` means "cannot predict", never zero-valued stats.
    pub fn get_team_state(&self, name: &str, as_of: Option<NaiveDate>) -> Option<TeamSnapshot> {
        let resolved = self.aliases.resolve(name)?;
        let as_of = as_of.unwrap_or_else(|| Utc::now().date_naive());
        match self.state_for(&resolved.canonical, as_of) {
            Ok(state) => Some(TeamSnapshot { team: resolved, state }),
            Err(e) => {
                tracing::debug!("No team state for '{}': {}", name, e);
                None
            }
        }
    }

    /// State for a canonical team from its last `form_window` matches before `as_of`
    pub fn state_for(&self, team: &str, as_of: NaiveDate) -> Result<TeamTemporalState, EngineError> {
        let prior = self.history.matches_before(team, as_of);
        if prior.is_empty() {
            return Err(EngineError::DataInsufficient {
                team: team.to_string(),
                matches: 0,
            });
        }

        let window = &prior[prior.len().saturating_sub(self.config.form_window)..];
        let n = window.len() as f64;
        let d = &self.config.neutral;

        let goals_for: Vec<f64> = window.iter().filter_map(|m| m.goals_for(team)).map(f64::from).collect();
        let goals_against: Vec<f64> = window
            .iter()
            .filter_map(|m| m.goals_against(team))
            .map(f64::from)
            .collect();
        let points: Vec<u32> = window.iter().filter_map(|m| m.points_for(team)).collect();

        let own = |stat: fn(&SideStats) -> Option<u32>| {
            mean_present(window.iter().map(|m| m.stats_for(team).and_then(stat).map(f64::from)))
        };
        let opp = |stat: fn(&SideStats) -> Option<u32>| {
            mean_present(window.iter().map(|m| m.stats_against(team).and_then(stat).map(f64::from)))
        };
        let rate = |pred: &dyn Fn(f64, f64) -> bool| {
            goals_for
                .iter()
                .zip(&goals_against)
                .filter(|(gf, ga)| pred(**gf, **ga))
                .count() as f64
                / n
        };

        let schedule = mean_present(window.iter().map(|m| {
            m.opponent(team)
                .map(|opponent| self.entering_ppg(opponent, m.date))
        }));

        Ok(TeamTemporalState {
            team: team.to_string(),
            as_of,
            matches_considered: window.len(),
            avg_goals_for: goals_for.iter().sum::<f64>() / n,
            avg_goals_against: goals_against.iter().sum::<f64>() / n,
            avg_shots_for: own(|s| s.shots).unwrap_or(d.shots),
            avg_shots_against: opp(|s| s.shots).unwrap_or(d.shots),
            avg_sot_for: own(|s| s.shots_on_target).unwrap_or(d.shots_on_target),
            avg_sot_against: opp(|s| s.shots_on_target).unwrap_or(d.shots_on_target),
            avg_corners_for: own(|s| s.corners).unwrap_or(d.corners),
            avg_corners_against: opp(|s| s.corners).unwrap_or(d.corners),
            avg_cards: own(SideStats::cards).unwrap_or(d.cards),
            avg_fouls: own(|s| s.fouls).unwrap_or(d.fouls),
            ppg: points.iter().sum::<u32>() as f64 / n,
            wins: points.iter().filter(|p| **p == 3).count() as u32,
            draws: points.iter().filter(|p| **p == 1).count() as u32,
            losses: points.iter().filter(|p| **p == 0).count() as u32,
            btts_rate: rate(&|gf, ga| gf > 0.0 && ga > 0.0),
            over25_rate: rate(&|gf, ga| gf + ga > 2.5),
            clean_sheet_rate: rate(&|_, ga| ga == 0.0),
            failed_to_score_rate: rate(&|gf, _| gf == 0.0),
            goal_volatility: population_std(&goals_for),
            schedule_difficulty: schedule.unwrap_or(d.ppg),
            rest_days: self.rest_days(team, &prior, as_of),
            last_match_date: prior.last().map(|m| m.date),
        })
    }

    /// PPG of `team` over its last window of matches before `before`
    fn entering_ppg(&self, team: &str, before: NaiveDate) -> f64 {
        let prior = self.history.matches_before(team, before);
        if prior.is_empty() {
            return self.config.neutral.ppg;
        }
        let window = &prior[prior.len().saturating_sub(self.config.form_window)..];
        window.iter().filter_map(|m| m.points_for(team)).sum::<u32>() as f64 / window.len() as f64
    }

    fn rest_days(&self, team: &str, prior: &[&MatchRecord], as_of: NaiveDate) -> f64 {
        let last_league = prior.last().map(|m| m.date);
        let last_secondary = self
            .history
            .secondary_dates(team)
            .iter()
            .filter(|d| **d < as_of)
            .max()
            .copied();
        match last_league.max(last_secondary) {
            Some(last) => days_between(last, as_of) as f64,
            None => self.config.default_rest_days,
        }
    }
}
