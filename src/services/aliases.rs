//! Canonical team identity.
//!
//! External feeds spell clubs differently ("Manchester United", "Man Utd",
//! "Man United"). Lookups go exact → alias map → substring fallback, and a
//! substring hit is always tagged `NameMatch::Recovered`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::models::{NameMatch, ResolvedTeam};

/// Shortest query allowed to take the substring fallback
const MIN_FALLBACK_LEN: usize = 3;

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("Manchester United", "Man United"),
    ("Man Utd", "Man United"),
    ("Manchester City", "Man City"),
    ("Tottenham Hotspur", "Tottenham"),
    ("Spurs", "Tottenham"),
    ("Wolverhampton Wanderers", "Wolves"),
    ("Wolverhampton", "Wolves"),
    ("Newcastle United", "Newcastle"),
    ("Nottingham Forest", "Nott'm Forest"),
    ("Nottm Forest", "Nott'm Forest"),
    ("Brighton & Hove Albion", "Brighton"),
    ("Brighton and Hove Albion", "Brighton"),
    ("West Ham United", "West Ham"),
    ("West Bromwich Albion", "West Brom"),
    ("Leicester City", "Leicester"),
    ("Leeds United", "Leeds"),
    ("AFC Bournemouth", "Bournemouth"),
    ("Sheffield Utd", "Sheffield United"),
    ("Sheff Utd", "Sheffield United"),
    ("Sheffield Wednesday", "Sheffield Weds"),
    ("Huddersfield Town", "Huddersfield"),
    ("Norwich City", "Norwich"),
    ("Cardiff City", "Cardiff"),
    ("Swansea City", "Swansea"),
    ("Stoke City", "Stoke"),
    ("Hull City", "Hull"),
    ("Luton Town", "Luton"),
    ("Ipswich Town", "Ipswich"),
    ("Queens Park Rangers", "QPR"),
    ("Atletico Madrid", "Ath Madrid"),
    ("Athletic Bilbao", "Ath Bilbao"),
    ("Bayern Munich", "Bayern Munich"),
    ("Borussia Dortmund", "Dortmund"),
    ("Paris Saint-Germain", "Paris SG"),
    ("PSG", "Paris SG"),
    ("Inter Milan", "Inter"),
    ("AC Milan", "Milan"),
];

/// Lowercase, strip club suffixes and punctuation, collapse whitespace
pub fn normalize_name(name: &str) -> String {
    let lowered = format!(" {} ", name.to_lowercase())
        .replace('.', "")
        .replace('-', " ")
        .replace(" fc ", " ")
        .replace(" afc ", " ")
        .replace(" sc ", " ");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Deserialize)]
struct AliasRow {
    alias: String,
    canonical: String,
}

#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    /// normalized alias -> canonical
    aliases: BTreeMap<String, String>,
    /// normalized canonical -> canonical
    teams: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_aliases() -> Self {
        let mut table = Self::new();
        for (alias, canonical) in BUILTIN_ALIASES {
            table.insert_alias(alias, canonical);
        }
        table
    }

    pub fn insert_alias(&mut self, alias: &str, canonical: &str) {
        self.aliases
            .insert(normalize_name(alias), canonical.trim().to_string());
    }

    /// Register a canonical identifier as it appears in the match history
    pub fn register_team(&mut self, canonical: &str) {
        self.teams
            .insert(normalize_name(canonical), canonical.to_string());
    }

    pub fn register_teams<I, S>(&mut self, teams: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for team in teams {
            self.register_team(team.as_ref());
        }
    }

    /// Load extra `alias,canonical` rows from a CSV file with a header
    pub fn load_csv(&mut self, path: &Path) -> Result<usize> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open alias file {}", path.display()))?;
        let mut loaded = 0;
        for row in reader.deserialize::<AliasRow>() {
            let row = row?;
            self.insert_alias(&row.alias, &row.canonical);
            loaded += 1;
        }
        tracing::info!("Loaded {} team aliases from {}", loaded, path.display());
        Ok(loaded)
    }

    pub fn resolve(&self, name: &str) -> Option<ResolvedTeam> {
        let key = normalize_name(name);
        if key.is_empty() {
            return None;
        }

        if let Some(canonical) = self.teams.get(&key) {
            return Some(ResolvedTeam {
                query: name.to_string(),
                canonical: canonical.clone(),
                matched: NameMatch::Exact,
            });
        }

        if let Some(canonical) = self.aliases.get(&key) {
            return Some(ResolvedTeam {
                query: name.to_string(),
                canonical: canonical.clone(),
                matched: NameMatch::Alias,
            });
        }

        if key.len() < MIN_FALLBACK_LEN {
            return None;
        }

        let mut candidates: Vec<(&String, &String)> = self
            .teams
            .iter()
            .filter(|(norm, _)| norm.contains(&key) || key.contains(norm.as_str()))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // BTreeMap iteration already gives alphabetical order; stable sort keeps it for ties
        candidates.sort_by(|a, b| {
            let sa = strsim::jaro_winkler(&key, a.0);
            let sb = strsim::jaro_winkler(&key, b.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        let canonical = candidates[0].1.clone();

        if candidates.len() > 1 {
            tracing::warn!(
                "Ambiguous team name '{}': {} candidates, recovered as '{}'",
                name,
                candidates.len(),
                canonical
            );
        } else {
            tracing::warn!("Team name '{}' recovered as '{}' by substring match", name, canonical);
        }

        Some(ResolvedTeam {
            query: name.to_string(),
            canonical,
            matched: NameMatch::Recovered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> AliasTable {
        let mut table = AliasTable::with_builtin_aliases();
        table.register_teams(["Man United", "Man City", "Tottenham", "West Ham", "Arsenal"]);
        table
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Arsenal F.C. "), "arsenal");
        assert_eq!(normalize_name("AFC Bournemouth"), "bournemouth");
        assert_eq!(normalize_name("Paris Saint-Germain"), "paris saint germain");
    }

    #[test]
    fn test_exact_and_alias() {
        let table = table();
        let exact = table.resolve("arsenal").unwrap();
        assert_eq!(exact.canonical, "Arsenal");
        assert_eq!(exact.matched, NameMatch::Exact);

        let alias = table.resolve("Manchester United").unwrap();
        assert_eq!(alias.canonical, "Man United");
        assert_eq!(alias.matched, NameMatch::Alias);
    }

    #[test]
    fn test_substring_fallback_is_tagged_recovered() {
        let table = table();
        let recovered = table.resolve("Arsenal London").unwrap();
        assert_eq!(recovered.canonical, "Arsenal");
        assert_eq!(recovered.matched, NameMatch::Recovered);
    }

    #[test]
    fn test_ambiguous_fallback_is_deterministic() {
        let table = table();
        let first = table.resolve("Man").unwrap();
        let second = table.resolve("Man").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.matched, NameMatch::Recovered);
    }

    #[test]
    fn test_unknown_and_short_names() {
        let table = table();
        assert!(table.resolve("Real Madrid").is_none());
        assert!(table.resolve("ar").is_none());
        assert!(table.resolve("   ").is_none());
    }

    #[test]
    fn test_load_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.csv");
        std::fs::write(&path, "alias,canonical\nThe Gunners,Arsenal\n").unwrap();
        let mut table = table();
        assert_eq!(table.load_csv(&path).unwrap(), 1);
        assert_eq!(table.resolve("the gunners").map(|r| r.canonical), Some("Arsenal".to_string()));
    }
}
