//! Temporal feature builder (training-time path).
//!
//! Every match is reshaped into two team-perspective rows, the long table is
//! ordered by team then date, and each team's entering-match state is
//! aggregated from its *prior* rows only (shift-by-one). Referee and league
//! baselines are accumulated one matchday at a time so same-day fixtures
//! never see each other.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::config::EngineConfig;
use crate::models::{MatchRecord, RefereeContext, RefereeProfile, TeamTemporalState};
use crate::services::feature_schema::{derive_interactions, FeatureVector, Interactions, FEATURE_NAMES};
use crate::services::history::MatchHistory;
use crate::utils::{days_between, weighted_mean, weighted_std};

/// How prior rows are aggregated into an entering-match statistic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AggregationMode {
    /// Unweighted mean of the last `n` matches. Same definition as the snapshot store.
    Window(usize),
    /// Unweighted career-to-date mean
    Expanding,
    /// Exponentially weighted mean, half-life counted in matches
    Ewm { half_life: f64 },
}

/// One match seen from one team's side
#[derive(Debug, Clone, PartialEq)]
pub struct TeamMatchRow {
    pub match_idx: usize,
    pub team: String,
    pub opponent: String,
    pub date: NaiveDate,
    pub is_home: bool,
    pub goals_for: f64,
    pub goals_against: f64,
    pub shots_for: Option<f64>,
    pub shots_against: Option<f64>,
    pub sot_for: Option<f64>,
    pub sot_against: Option<f64>,
    pub corners_for: Option<f64>,
    pub corners_against: Option<f64>,
    pub cards: Option<f64>,
    pub fouls: Option<f64>,
    pub points: f64,
}

impl TeamMatchRow {
    fn from_match(match_idx: usize, m: &MatchRecord, is_home: bool) -> Self {
        let (team, opponent, gf, ga, own, opp) = if is_home {
            (&m.home_team, &m.away_team, m.home_goals, m.away_goals, &m.home_stats, &m.away_stats)
        } else {
            (&m.away_team, &m.home_team, m.away_goals, m.home_goals, &m.away_stats, &m.home_stats)
        };
        let f = |v: Option<u32>| v.map(f64::from);
        Self {
            match_idx,
            team: team.clone(),
            opponent: opponent.clone(),
            date: m.date,
            is_home,
            goals_for: gf as f64,
            goals_against: ga as f64,
            shots_for: f(own.shots),
            shots_against: f(opp.shots),
            sot_for: f(own.shots_on_target),
            sot_against: f(opp.shots_on_target),
            corners_for: f(own.corners),
            corners_against: f(opp.corners),
            cards: f(own.cards()),
            fouls: f(own.fouls),
            points: match gf.cmp(&ga) {
                std::cmp::Ordering::Greater => 3.0,
                std::cmp::Ordering::Equal => 1.0,
                std::cmp::Ordering::Less => 0.0,
            },
        }
    }
}

/// A historical match with both sides' entering-match features attached
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub record: MatchRecord,
    pub home: TeamTemporalState,
    pub away: TeamTemporalState,
    pub referee: RefereeContext,
    pub league_baseline: f64,
    pub interactions: Interactions,
    pub vector: FeatureVector,
}

#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub rows: Vec<FeatureRow>,
    pub mode: AggregationMode,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// A named feature column, in match order
    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = FEATURE_NAMES.iter().position(|n| *n == name)?;
        Some(self.rows.iter().map(|r| r.vector.values()[idx]).collect())
    }
}

type SideKey = (usize, bool);

/// Rows of a date-sorted team slice dated strictly before row `k`; same-day rows never see each other
fn prior_len(rows: &[TeamMatchRow], k: usize) -> usize {
    rows.partition_point(|r| r.date < rows[k].date)
}

pub struct FeatureBuilder<'a> {
    config: &'a EngineConfig,
    mode: AggregationMode,
}

impl<'a> FeatureBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            mode: AggregationMode::Window(config.features.form_window),
        }
    }

    pub fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Both team-perspective rows for every match, ordered by team, then date, then match order
    pub fn long_table(history: &MatchHistory) -> Vec<TeamMatchRow> {
        let mut rows: Vec<TeamMatchRow> = history
            .matches()
            .iter()
            .enumerate()
            .flat_map(|(idx, m)| {
                [TeamMatchRow::from_match(idx, m, true), TeamMatchRow::from_match(idx, m, false)]
            })
            .collect();
        rows.sort_by(|a, b| {
            a.team
                .cmp(&b.team)
                .then(a.date.cmp(&b.date))
                .then(a.match_idx.cmp(&b.match_idx))
        });
        rows
    }

    pub fn build(&self, history: &MatchHistory) -> FeatureTable {
        let mut by_team: BTreeMap<String, Vec<TeamMatchRow>> = BTreeMap::new();
        for row in Self::long_table(history) {
            by_team.entry(row.team.clone()).or_default().push(row);
        }

        // entering PPG of every side, needed for opponents' schedule difficulty
        let mut entering_ppg: HashMap<SideKey, f64> = HashMap::new();
        for rows in by_team.values() {
            for k in 0..rows.len() {
                let ppg = self
                    .aggregate(&rows[..prior_len(rows, k)], |r| Some(r.points))
                    .unwrap_or(self.config.features.neutral.ppg);
                entering_ppg.insert((rows[k].match_idx, rows[k].is_home), ppg);
            }
        }

        let mut states: HashMap<SideKey, TeamTemporalState> = HashMap::new();
        for (team, rows) in &by_team {
            let calendar = self.calendar(history, team, rows);
            let opp_ppg: Vec<f64> = rows
                .iter()
                .map(|r| {
                    entering_ppg
                        .get(&(r.match_idx, !r.is_home))
                        .copied()
                        .unwrap_or(self.config.features.neutral.ppg)
                })
                .collect();

            for k in 0..rows.len() {
                let prior = prior_len(rows, k);
                let rest = rest_days(&calendar, rows[k].date, self.config.features.default_rest_days);
                let state = self.entering_state(team, &rows[..prior], &opp_ppg[..prior], rows[k].date, rest);
                states.insert((rows[k].match_idx, rows[k].is_home), state);
            }
        }

        let rows = self.assemble_rows(history, &mut states);
        tracing::info!(
            "Built feature table: {} matches, {} teams, mode {:?}",
            rows.len(),
            by_team.len(),
            self.mode
        );
        FeatureTable { rows, mode: self.mode }
    }

    fn assemble_rows(
        &self,
        history: &MatchHistory,
        states: &mut HashMap<SideKey, TeamTemporalState>,
    ) -> Vec<FeatureRow> {
        let features = &self.config.features;
        let matches = history.matches();
        let mut referees: HashMap<String, (u64, usize)> = HashMap::new();
        let mut leagues: HashMap<String, (u64, u64)> = HashMap::new();
        let mut out = Vec::with_capacity(matches.len());

        let mut start = 0;
        while start < matches.len() {
            let day = matches[start].date;
            let end = start + matches[start..].iter().take_while(|m| m.date == day).count();

            for (idx, m) in matches.iter().enumerate().take(end).skip(start) {
                let (Some(home), Some(away)) = (states.remove(&(idx, true)), states.remove(&(idx, false)))
                else {
                    continue;
                };

                let profile = m.referee.as_deref().and_then(|name| {
                    referees.get(&referee_key(name)).map(|(cards, n)| RefereeProfile {
                        name: name.trim().to_string(),
                        avg_cards: *cards as f64 / *n as f64,
                        matches: *n,
                    })
                });
                let referee = RefereeContext::from_profile(
                    m.referee.clone(),
                    profile,
                    features.min_referee_sample,
                    features.default_referee_cards,
                );

                let league_baseline = leagues
                    .get(&m.league)
                    .filter(|(_, n)| *n > 0)
                    .map(|(g, n)| *g as f64 / *n as f64)
                    .unwrap_or(features.neutral.goals);

                let interactions =
                    derive_interactions(&home, &away, league_baseline, m.date, features, &self.config.traps);
                let vector = FeatureVector::assemble(&home, &away, &referee, &interactions);

                out.push(FeatureRow {
                    record: m.clone(),
                    home,
                    away,
                    referee,
                    league_baseline,
                    interactions,
                    vector,
                });
            }

            for m in &matches[start..end] {
                if let (Some(name), Some(cards)) = (m.referee.as_deref(), m.total_cards()) {
                    let entry = referees.entry(referee_key(name)).or_insert((0, 0));
                    entry.0 += cards as u64;
                    entry.1 += 1;
                }
                let entry = leagues.entry(m.league.clone()).or_insert((0, 0));
                entry.0 += m.total_goals() as u64;
                entry.1 += 2;
            }
            start = end;
        }
        out
    }

    /// League and secondary-competition dates for a team, sorted and deduplicated
    fn calendar(&self, history: &MatchHistory, team: &str, rows: &[TeamMatchRow]) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
        dates.extend_from_slice(history.secondary_dates(team));
        dates.sort();
        dates.dedup();
        dates
    }

    /// Weights aligned with `prior`; rows outside a window get none
    fn weights(&self, len: usize) -> Vec<f64> {
        match self.mode {
            AggregationMode::Window(n) => (0..len).map(|i| if i + n >= len { 1.0 } else { 0.0 }).collect(),
            AggregationMode::Expanding => vec![1.0; len],
            AggregationMode::Ewm { half_life } => {
                let decay = 0.5f64.powf(1.0 / half_life.max(f64::EPSILON));
                (0..len).map(|i| decay.powi((len - 1 - i) as i32)).collect()
            }
        }
    }

    fn aggregate<F>(&self, prior: &[TeamMatchRow], metric: F) -> Option<f64>
    where
        F: Fn(&TeamMatchRow) -> Option<f64>,
    {
        let weights = self.weights(prior.len());
        let pairs: Vec<(Option<f64>, f64)> = prior
            .iter()
            .zip(&weights)
            .filter(|(_, w)| **w > 0.0)
            .map(|(r, w)| (metric(r), *w))
            .collect();
        weighted_mean(&pairs)
    }

    fn entering_state(
        &self,
        team: &str,
        prior: &[TeamMatchRow],
        opp_ppg: &[f64],
        as_of: NaiveDate,
        rest_days: f64,
    ) -> TeamTemporalState {
        let d = &self.config.features.neutral;
        if prior.is_empty() {
            return TeamTemporalState::neutral(team, as_of, d, rest_days);
        }

        let flag = |b: bool| Some(if b { 1.0 } else { 0.0 });
        let weights = self.weights(prior.len());
        let considered = weights.iter().filter(|w| **w > 0.0).count();

        let volatility = weighted_std(
            &prior
                .iter()
                .zip(&weights)
                .filter(|(_, w)| **w > 0.0)
                .map(|(r, w)| (r.goals_for, *w))
                .collect::<Vec<_>>(),
        );
        let schedule: Vec<(Option<f64>, f64)> = opp_ppg
            .iter()
            .zip(&weights)
            .filter(|(_, w)| **w > 0.0)
            .map(|(p, w)| (Some(*p), *w))
            .collect();

        let recent = &prior[prior.len().saturating_sub(self.config.features.form_window)..];
        let count = |points: f64| recent.iter().filter(|r| r.points == points).count() as u32;

        TeamTemporalState {
            team: team.to_string(),
            as_of,
            matches_considered: considered,
            avg_goals_for: self.aggregate(prior, |r| Some(r.goals_for)).unwrap_or(d.goals),
            avg_goals_against: self.aggregate(prior, |r| Some(r.goals_against)).unwrap_or(d.goals),
            avg_shots_for: self.aggregate(prior, |r| r.shots_for).unwrap_or(d.shots),
            avg_shots_against: self.aggregate(prior, |r| r.shots_against).unwrap_or(d.shots),
            avg_sot_for: self.aggregate(prior, |r| r.sot_for).unwrap_or(d.shots_on_target),
            avg_sot_against: self.aggregate(prior, |r| r.sot_against).unwrap_or(d.shots_on_target),
            avg_corners_for: self.aggregate(prior, |r| r.corners_for).unwrap_or(d.corners),
            avg_corners_against: self.aggregate(prior, |r| r.corners_against).unwrap_or(d.corners),
            avg_cards: self.aggregate(prior, |r| r.cards).unwrap_or(d.cards),
            avg_fouls: self.aggregate(prior, |r| r.fouls).unwrap_or(d.fouls),
            ppg: self.aggregate(prior, |r| Some(r.points)).unwrap_or(d.ppg),
            wins: count(3.0),
            draws: count(1.0),
            losses: count(0.0),
            btts_rate: self
                .aggregate(prior, |r| flag(r.goals_for > 0.0 && r.goals_against > 0.0))
                .unwrap_or(d.rate),
            over25_rate: self
                .aggregate(prior, |r| flag(r.goals_for + r.goals_against > 2.5))
                .unwrap_or(d.rate),
            clean_sheet_rate: self.aggregate(prior, |r| flag(r.goals_against == 0.0)).unwrap_or(d.rate),
            failed_to_score_rate: self.aggregate(prior, |r| flag(r.goals_for == 0.0)).unwrap_or(d.rate),
            goal_volatility: volatility,
            schedule_difficulty: weighted_mean(&schedule).unwrap_or(d.ppg),
            rest_days,
            last_match_date: prior.last().map(|r| r.date),
        }
    }
}

fn referee_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Days since the last calendar entry strictly before `date`
pub(crate) fn rest_days(calendar: &[NaiveDate], date: NaiveDate, default_rest: f64) -> f64 {
    let prior = calendar.partition_point(|d| *d < date);
    if prior == 0 {
        default_rest
    } else {
        days_between(calendar[prior - 1], date) as f64
    }
}
