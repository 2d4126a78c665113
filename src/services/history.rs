//! Shared, immutable match history.
//!
//! Records are held sorted by date (ingestion order breaks ties) together with
//! a per-team appearance index and the optional secondary-competition calendar.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{MatchRecord, RefereeProfile};
use crate::services::aliases::AliasTable;

#[derive(Debug, Clone, Default)]
pub struct MatchHistory {
    matches: Vec<MatchRecord>,
    appearances: HashMap<String, Vec<usize>>,
    secondary: HashMap<String, Vec<NaiveDate>>,
}

impl MatchHistory {
    pub fn new(mut matches: Vec<MatchRecord>) -> Self {
        // stable sort keeps ingestion order for same-day fixtures
        matches.sort_by_key(|m| m.date);

        let mut appearances: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, m) in matches.iter().enumerate() {
            appearances.entry(m.home_team.clone()).or_default().push(idx);
            appearances.entry(m.away_team.clone()).or_default().push(idx);
        }

        Self {
            matches,
            appearances,
            secondary: HashMap::new(),
        }
    }

    /// Attach cup or continental fixtures used only for rest-day computation
    pub fn with_secondary_fixtures<I>(mut self, fixtures: I) -> Self
    where
        I: IntoIterator<Item = (String, NaiveDate)>,
    {
        for (team, date) in fixtures {
            self.secondary.entry(team).or_default().push(date);
        }
        for dates in self.secondary.values_mut() {
            dates.sort();
            dates.dedup();
        }
        self
    }

    /// Re-key the secondary calendar by canonical team name. Feeds spell clubs
    /// their own way; names the table cannot resolve are kept and logged.
    pub fn resolve_secondary_names(mut self, aliases: &AliasTable) -> Self {
        let mut resolved: HashMap<String, Vec<NaiveDate>> = HashMap::new();
        for (name, dates) in std::mem::take(&mut self.secondary) {
            let canonical = match aliases.resolve(&name) {
                Some(team) => team.canonical,
                None => {
                    tracing::warn!(
                        "Secondary fixtures for '{}' match no known team; they will not count towards rest days",
                        name
                    );
                    name
                }
            };
            resolved.entry(canonical).or_default().extend(dates);
        }
        for dates in resolved.values_mut() {
            dates.sort();
            dates.dedup();
        }
        self.secondary = resolved;
        self
    }

    pub fn matches(&self) -> &[MatchRecord] {
        &self.matches
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&MatchRecord> {
        self.matches.get(idx)
    }

    /// Indices of the team's matches, oldest first
    pub fn appearances(&self, team: &str) -> &[usize] {
        self.appearances.get(team).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The team's matches strictly before `before`, oldest first
    pub fn matches_before<'a>(&'a self, team: &str, before: NaiveDate) -> Vec<&'a MatchRecord> {
        self.appearances(team)
            .iter()
            .map(|&idx| &self.matches[idx])
            .take_while(|m| m.date < before)
            .collect()
    }

    pub fn secondary_dates(&self, team: &str) -> &[NaiveDate] {
        self.secondary.get(team).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn team_names(&self) -> BTreeSet<String> {
        self.appearances.keys().cloned().collect()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.matches.last().map(|m| m.date)
    }

    /// League of the team's most recent match before `before`
    pub fn latest_league(&self, team: &str, before: NaiveDate) -> Option<String> {
        self.matches_before(team, before).last().map(|m| m.league.clone())
    }

    /// Mean goals per team-match in `league` from matches strictly before `before`
    pub fn league_baseline(&self, league: &str, before: NaiveDate) -> Option<f64> {
        let (goals, team_matches) = self
            .matches
            .iter()
            .take_while(|m| m.date < before)
            .filter(|m| m.league == league)
            .fold((0u64, 0u64), |(g, n), m| (g + m.total_goals() as u64, n + 2));
        if team_matches == 0 {
            None
        } else {
            Some(goals as f64 / team_matches as f64)
        }
    }

    /// Card profile for `referee` from matches strictly before `before`
    pub fn referee_profile(&self, referee: &str, before: NaiveDate) -> Option<RefereeProfile> {
        let wanted = referee.trim().to_lowercase();
        let (cards, matches) = self
            .matches
            .iter()
            .take_while(|m| m.date < before)
            .filter(|m| {
                m.referee
                    .as_deref()
                    .is_some_and(|r| r.trim().to_lowercase() == wanted)
            })
            .filter_map(|m| m.total_cards())
            .fold((0u64, 0usize), |(c, n), cards| (c + cards as u64, n + 1));
        if matches == 0 {
            return None;
        }
        Some(RefereeProfile {
            name: referee.trim().to_string(),
            avg_cards: cards as f64 / matches as f64,
            matches,
        })
    }

    /// Cheap content fingerprint recorded in model bundles
    pub fn fingerprint(&self) -> String {
        let per_league: BTreeMap<&str, usize> = self.matches.iter().fold(BTreeMap::new(), |mut acc, m| {
            *acc.entry(m.league.as_str()).or_insert(0) += 1;
            acc
        });
        let leagues: Vec<String> = per_league.iter().map(|(l, n)| format!("{}:{}", l, n)).collect();
        format!(
            "{}|{}|{}",
            self.matches.len(),
            self.last_date().map(|d| d.to_string()).unwrap_or_default(),
            leagues.join(",")
        )
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_history_sorted_and_indexed() {
        let history = MatchHistory::new(vec![
            played(date(2024, 2, 10), "A", "B", 1, 0),
            played(date(2024, 1, 10), "B", "C", 2, 2),
        ]);
        assert_eq!(history.matches()[0].date, date(2024, 1, 10));
        assert_eq!(history.appearances("B"), &[0, 1]);
        assert_eq!(history.matches_before("B", date(2024, 2, 10)).len(), 1);
        assert!(history.appearances("Z").is_empty());
    }

    #[test]
    fn test_referee_profile_is_strictly_prior() {
        let history = MatchHistory::new(vec![
            played(date(2024, 1, 1), "A", "B", 1, 0),
            played(date(2024, 1, 8), "B", "A", 1, 0),
        ]);
        let before_second = history.referee_profile("m oliver", date(2024, 1, 8)).unwrap();
        assert_eq!(before_second.matches, 1);
        assert!((before_second.avg_cards - 3.0).abs() < 1e-9);
        assert!(history.referee_profile("M Oliver", date(2024, 1, 1)).is_none());
    }

    #[test]
    fn test_league_baseline() {
        let history = MatchHistory::new(vec![
            played(date(2024, 1, 1), "A", "B", 3, 1),
            played(date(2024, 1, 8), "B", "A", 0, 0),
        ]);
        assert_eq!(history.league_baseline("E0", date(2024, 1, 8)), Some(1.0));
        assert_eq!(history.league_baseline("E0", date(2024, 1, 9)), Some(0.5));
        assert_eq!(history.league_baseline("SP1", date(2024, 1, 9)), None);
    }

    #[test]
    fn test_secondary_names_resolve_to_canonical_teams() {
        let history = MatchHistory::new(vec![played(date(2024, 1, 1), "Man United", "Arsenal", 1, 0)]);
        let mut aliases = AliasTable::with_builtin_aliases();
        aliases.register_teams(history.team_names());

        let history = history
            .with_secondary_fixtures([
                ("Manchester United".to_string(), date(2024, 1, 9)),
                ("Man United".to_string(), date(2024, 1, 9)),
                ("Atlantis Rovers".to_string(), date(2024, 1, 9)),
            ])
            .resolve_secondary_names(&aliases);

        assert_eq!(history.secondary_dates("Man United"), &[date(2024, 1, 9)]);
        assert!(history.secondary_dates("Manchester United").is_empty());
        assert_eq!(history.secondary_dates("Atlantis Rovers"), &[date(2024, 1, 9)]);
    }
}
