//! CSV importers for football-data.co.uk style files.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::StringRecord;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use crate::db::{insert_fixtures, insert_matches, insert_secondary_fixtures};
use crate::models::{Fixture, KnownOdds, Market, MatchRecord, ResultCode, SecondaryFixture, SideStats};
use crate::utils::season_label;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub rows: usize,
    pub imported: usize,
    pub skipped: usize,
}

/// Header lookup tolerant of the column spellings used across seasons
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().trim_start_matches('\u{feff}').to_string(), i))
            .collect();
        Self { index }
    }

    fn has(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn get<'r>(&self, record: &'r StringRecord, names: &[&str]) -> Option<&'r str> {
        names
            .iter()
            .filter_map(|n| self.index.get(*n))
            .filter_map(|i| record.get(*i))
            .map(str::trim)
            .find(|v| !v.is_empty())
    }

    fn count(&self, record: &StringRecord, names: &[&str]) -> Option<u32> {
        self.get(record, names)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.round() as u32)
    }
}

/// football-data dates come as dd/mm/yyyy, or dd/mm/yy in older seasons
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%d/%m/%y", "%d/%m/%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input)
}

/// Settled matches. Rows without a date, teams or a full-time score are skipped.
pub fn parse_matches<R: Read>(input: R, default_league: Option<&str>) -> Result<(Vec<MatchRecord>, ImportReport)> {
    let mut reader = reader(input);
    let cols = Columns::new(reader.headers()?);
    if !cols.has("HomeTeam") && !cols.has("Home") {
        anyhow::bail!("CSV has no HomeTeam column");
    }

    let mut report = ImportReport::default();
    let mut matches = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;
        report.rows += 1;

        let date = cols.get(&record, &["Date"]).and_then(parse_feed_date);
        let home = cols.get(&record, &["HomeTeam", "Home"]);
        let away = cols.get(&record, &["AwayTeam", "Away"]);
        let home_goals = cols.count(&record, &["FTHG", "HG"]);
        let away_goals = cols.count(&record, &["FTAG", "AG"]);
        let league = cols.get(&record, &["Div", "League"]).or(default_league);

        let (Some(date), Some(home), Some(away), Some(hg), Some(ag), Some(league)) =
            (date, home, away, home_goals, away_goals, league)
        else {
            tracing::debug!("Skipping row {}: missing date, teams, score or league", line + 2);
            report.skipped += 1;
            continue;
        };

        let result = cols
            .get(&record, &["FTR", "Res"])
            .and_then(ResultCode::from_code)
            .unwrap_or_else(|| ResultCode::from_score(hg, ag));

        let side = |shots: &str, sot: &str, fouls: &str, corners: &str, yellow: &str, red: &str| SideStats {
            shots: cols.count(&record, &[shots]),
            shots_on_target: cols.count(&record, &[sot]),
            fouls: cols.count(&record, &[fouls]),
            corners: cols.count(&record, &[corners]),
            yellow_cards: cols.count(&record, &[yellow]),
            red_cards: cols.count(&record, &[red]),
        };

        matches.push(MatchRecord {
            date,
            league: league.to_string(),
            season: season_label(date),
            home_team: home.to_string(),
            away_team: away.to_string(),
            home_goals: hg,
            away_goals: ag,
            result,
            home_stats: side("HS", "HST", "HF", "HC", "HY", "HR"),
            away_stats: side("AS", "AST", "AF", "AC", "AY", "AR"),
            referee: cols.get(&record, &["Referee"]).map(str::to_string),
        });
        report.imported += 1;
    }

    Ok((matches, report))
}

const BOOKMAKER_COLUMNS: [(&str, &str); 5] = [
    ("B365H", "home"),
    ("B365D", "draw"),
    ("B365A", "away"),
    ("B365>2.5", "over25"),
    ("B365<2.5", "under25"),
];

/// Upcoming fixtures with any bookmaker prices. Besides the B365 columns, any
/// column named after a market key (`btts_yes`, `over35`, ...) is read as a price.
pub fn parse_fixtures<R: Read>(input: R, default_league: Option<&str>) -> Result<(Vec<Fixture>, ImportReport)> {
    let mut reader = reader(input);
    let headers = reader.headers()?.clone();
    let cols = Columns::new(&headers);
    let market_columns: Vec<(usize, Market)> = headers
        .iter()
        .enumerate()
        .filter_map(|(i, h)| {
            let key = BOOKMAKER_COLUMNS
                .iter()
                .find(|(col, _)| *col == h)
                .map(|(_, key)| *key)
                .unwrap_or(h);
            Market::from_key(key).map(|m| (i, m))
        })
        .collect();

    let mut report = ImportReport::default();
    let mut fixtures = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;
        report.rows += 1;

        let date = cols.get(&record, &["Date"]).and_then(parse_feed_date);
        let home = cols.get(&record, &["HomeTeam", "Home"]);
        let away = cols.get(&record, &["AwayTeam", "Away"]);
        let league = cols.get(&record, &["Div", "League"]).or(default_league);
        let (Some(date), Some(home), Some(away), Some(league)) = (date, home, away, league) else {
            report.skipped += 1;
            continue;
        };

        let mut odds = KnownOdds::default();
        for (i, market) in &market_columns {
            match record.get(*i).and_then(|v| v.trim().parse::<f64>().ok()) {
                Some(price) if price.is_finite() && price > 1.0 => odds.insert(*market, price),
                Some(price) => tracing::warn!("Ignoring price {} for {} in row {}", price, market.key(), line + 2),
                None => {}
            }
        }

        fixtures.push(Fixture {
            date,
            kickoff: cols.get(&record, &["Time"]).map(str::to_string),
            league: league.to_string(),
            home_team: home.to_string(),
            away_team: away.to_string(),
            referee: cols.get(&record, &["Referee"]).map(str::to_string),
            odds,
        });
        report.imported += 1;
    }

    Ok((fixtures, report))
}

/// Two-column `team,date` file, with an optional `competition` column
pub fn parse_secondary<R: Read>(input: R) -> Result<(Vec<SecondaryFixture>, ImportReport)> {
    let mut reader = reader(input);
    let cols = Columns::new(reader.headers()?);
    let mut report = ImportReport::default();
    let mut fixtures = Vec::new();

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;
        report.rows += 1;

        let team = cols.get(&record, &["team", "Team"]);
        let date = cols.get(&record, &["date", "Date"]).and_then(parse_feed_date);
        let (Some(team), Some(date)) = (team, date) else {
            report.skipped += 1;
            continue;
        };
        fixtures.push(SecondaryFixture {
            team: team.to_string(),
            date,
            competition: cols.get(&record, &["competition", "Competition"]).map(str::to_string),
        });
        report.imported += 1;
    }

    Ok((fixtures, report))
}

fn open(path: &Path) -> Result<std::fs::File> {
    std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

pub async fn import_matches(pool: &SqlitePool, path: &Path, default_league: Option<&str>) -> Result<ImportReport> {
    let (matches, report) = parse_matches(open(path)?, default_league)?;
    insert_matches(pool, &matches).await?;
    tracing::info!(
        "Imported {} matches from {} ({} skipped)",
        report.imported,
        path.display(),
        report.skipped
    );
    Ok(report)
}

pub async fn import_fixtures(pool: &SqlitePool, path: &Path, default_league: Option<&str>) -> Result<ImportReport> {
    let (fixtures, report) = parse_fixtures(open(path)?, default_league)?;
    insert_fixtures(pool, &fixtures).await?;
    tracing::info!(
        "Imported {} fixtures from {} ({} skipped)",
        report.imported,
        path.display(),
        report.skipped
    );
    Ok(report)
}

pub async fn import_secondary(pool: &SqlitePool, path: &Path) -> Result<ImportReport> {
    let (fixtures, report) = parse_secondary(open(path)?)?;
    insert_secondary_fixtures(pool, &fixtures).await?;
    tracing::info!(
        "Imported {} secondary fixtures from {} ({} skipped)",
        report.imported,
        path.display(),
        report.skipped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GoalLine, OverUnder};

    const RESULTS: &str = "\
Div,Date,Time,HomeTeam,AwayTeam,FTHG,FTAG,FTR,Referee,HS,AS,HST,AST,HF,AF,HC,AC,HY,AY,HR,AR
E0,11/08/2023,20:00,Burnley,Man City,0,3,A,C Pawson,6,17,1,8,11,8,6,5,0,2,1,0
E0,12/08/2023,12:30,Arsenal,Nott'm Forest,2,1,H,M Oliver,15,6,7,2,12,12,8,3,2,2,0,0
E0,13/08/2023,14:00,Brentford,Tottenham,,,,,,,,,,,,,,,,
";

    #[test]
    fn test_parse_results_file() {
        let (matches, report) = parse_matches(RESULTS.as_bytes(), None).unwrap();
        assert_eq!(report, ImportReport { rows: 3, imported: 2, skipped: 1 });

        let first = &matches[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2023, 8, 11).unwrap());
        assert_eq!(first.season, "2023-24");
        assert_eq!(first.result, ResultCode::Away);
        assert_eq!(first.away_stats.shots_on_target, Some(8));
        assert_eq!(first.home_stats.cards(), Some(1));
        assert_eq!(first.referee.as_deref(), Some("C Pawson"));
    }

    #[test]
    fn test_missing_stat_columns_stay_empty() {
        let csv = "Date,HomeTeam,AwayTeam,FTHG,FTAG\n05/05/19,Everton,Burnley,2,0\n";
        let (matches, _) = parse_matches(csv.as_bytes(), Some("E0")).unwrap();
        assert_eq!(matches[0].league, "E0");
        assert_eq!(matches[0].date, NaiveDate::from_ymd_opt(2019, 5, 5).unwrap());
        assert_eq!(matches[0].result, ResultCode::Home);
        assert_eq!(matches[0].home_stats, SideStats::default());
        assert!(parse_matches("Date,Team\n".as_bytes(), None).is_err());
    }

    #[test]
    fn test_parse_fixtures_with_prices() {
        let csv = "\
Div,Date,Time,HomeTeam,AwayTeam,Referee,B365H,B365D,B365A,B365>2.5,B365<2.5,btts_yes
E0,18/05/2024,15:00,Arsenal,Everton,,1.25,6.5,11,1.5,2.6,1.9
E0,18/05/2024,15:00,Fulham,Luton,J Brooks,1.8,4.0,0.5,,,
";
        let (fixtures, report) = parse_fixtures(csv.as_bytes(), None).unwrap();
        assert_eq!(report.imported, 2);

        let odds = &fixtures[0].odds;
        assert_eq!(odds.get(Market::MatchResult(ResultCode::Draw)), Some(6.5));
        assert_eq!(
            odds.get(Market::TotalGoals { line: GoalLine::TwoAndHalf, side: OverUnder::Under }),
            Some(2.6)
        );
        assert_eq!(odds.get(Market::BothTeamsScore(true)), Some(1.9));
        assert_eq!(fixtures[0].kickoff.as_deref(), Some("15:00"));

        // sub-1.0 prices are not decimal odds
        assert_eq!(fixtures[1].odds.get(Market::MatchResult(ResultCode::Away)), None);
        assert_eq!(fixtures[1].referee.as_deref(), Some("J Brooks"));
    }

    #[test]
    fn test_parse_secondary_schedule() {
        let csv = "team,date,competition\nArsenal,2024-02-20,UCL\nChelsea,,FA Cup\n";
        let (fixtures, report) = parse_secondary(csv.as_bytes()).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(fixtures[0].competition.as_deref(), Some("UCL"));
    }
}
