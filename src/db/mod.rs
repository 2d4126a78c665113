pub mod import;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::*;
use crate::services::MatchHistory;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if !file_path.starts_with(":memory:") {
        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Called from the CLI where no pool exists yet.
pub async fn init_database(database_url: &str) -> Result<()> {
    let pool = create_pool(database_url).await?;
    init_database_with_pool(&pool).await
}

/// Called from the server so schema creation shares the main pool.
pub async fn init_database_with_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matches (
            id TEXT PRIMARY KEY,
            match_date TEXT NOT NULL,
            league TEXT NOT NULL,
            season TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            home_goals INTEGER NOT NULL,
            away_goals INTEGER NOT NULL,
            result TEXT NOT NULL,
            referee TEXT,
            home_shots INTEGER,
            away_shots INTEGER,
            home_shots_on_target INTEGER,
            away_shots_on_target INTEGER,
            home_corners INTEGER,
            away_corners INTEGER,
            home_fouls INTEGER,
            away_fouls INTEGER,
            home_yellow_cards INTEGER,
            away_yellow_cards INTEGER,
            home_red_cards INTEGER,
            away_red_cards INTEGER,
            created_at TEXT NOT NULL,
            UNIQUE (match_date, home_team, away_team)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fixtures (
            id TEXT PRIMARY KEY,
            match_date TEXT NOT NULL,
            kickoff TEXT,
            league TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            referee TEXT,
            odds TEXT NOT NULL DEFAULT '{"prices":[]}',
            created_at TEXT NOT NULL,
            UNIQUE (match_date, home_team, away_team)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // cup and continental dates, used only for rest days
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS secondary_fixtures (
            team TEXT NOT NULL,
            match_date TEXT NOT NULL,
            competition TEXT,
            PRIMARY KEY (team, match_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id TEXT PRIMARY KEY,
            match_date TEXT NOT NULL,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            model_version TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_matches_date ON matches(match_date)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fixtures_date ON fixtures(match_date)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_match ON predictions(match_date, home_team, away_team)")
        .execute(pool)
        .await?;

    tracing::info!("Database initialized successfully");
    Ok(())
}

pub async fn clear_all_data(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM predictions").execute(pool).await?;
    sqlx::query("DELETE FROM fixtures").execute(pool).await?;
    sqlx::query("DELETE FROM secondary_fixtures").execute(pool).await?;
    sqlx::query("DELETE FROM matches").execute(pool).await?;
    tracing::info!("All data cleared");
    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(raw, DATE_FORMAT)?)
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32> {
    Ok(u32::try_from(row.get::<i64, _>(column))?)
}

fn get_opt_u32(row: &SqliteRow, column: &str) -> Result<Option<u32>> {
    Ok(row.get::<Option<i64>, _>(column).map(u32::try_from).transpose()?)
}

// Match operations

/// Upsert settled matches in one transaction. Re-importing a match replaces it.
pub async fn insert_matches(pool: &SqlitePool, matches: &[MatchRecord]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let now = Utc::now().to_rfc3339();

    for m in matches {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO matches
            (id, match_date, league, season, home_team, away_team, home_goals, away_goals, result, referee,
             home_shots, away_shots, home_shots_on_target, away_shots_on_target, home_corners, away_corners,
             home_fouls, away_fouls, home_yellow_cards, away_yellow_cards, home_red_cards, away_red_cards,
             created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(m.date.format(DATE_FORMAT).to_string())
        .bind(&m.league)
        .bind(&m.season)
        .bind(&m.home_team)
        .bind(&m.away_team)
        .bind(m.home_goals as i64)
        .bind(m.away_goals as i64)
        .bind(m.result.code())
        .bind(&m.referee)
        .bind(m.home_stats.shots.map(i64::from))
        .bind(m.away_stats.shots.map(i64::from))
        .bind(m.home_stats.shots_on_target.map(i64::from))
        .bind(m.away_stats.shots_on_target.map(i64::from))
        .bind(m.home_stats.corners.map(i64::from))
        .bind(m.away_stats.corners.map(i64::from))
        .bind(m.home_stats.fouls.map(i64::from))
        .bind(m.away_stats.fouls.map(i64::from))
        .bind(m.home_stats.yellow_cards.map(i64::from))
        .bind(m.away_stats.yellow_cards.map(i64::from))
        .bind(m.home_stats.red_cards.map(i64::from))
        .bind(m.away_stats.red_cards.map(i64::from))
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(matches.len())
}

fn match_from_row(row: &SqliteRow) -> Result<MatchRecord> {
    let home_goals = get_u32(row, "home_goals")?;
    let away_goals = get_u32(row, "away_goals")?;
    let result = ResultCode::from_code(&row.get::<String, _>("result"))
        .unwrap_or_else(|| ResultCode::from_score(home_goals, away_goals));

    Ok(MatchRecord {
        date: parse_date(&row.get::<String, _>("match_date"))?,
        league: row.get("league"),
        season: row.get("season"),
        home_team: row.get("home_team"),
        away_team: row.get("away_team"),
        home_goals,
        away_goals,
        result,
        home_stats: SideStats {
            shots: get_opt_u32(row, "home_shots")?,
            shots_on_target: get_opt_u32(row, "home_shots_on_target")?,
            corners: get_opt_u32(row, "home_corners")?,
            fouls: get_opt_u32(row, "home_fouls")?,
            yellow_cards: get_opt_u32(row, "home_yellow_cards")?,
            red_cards: get_opt_u32(row, "home_red_cards")?,
        },
        away_stats: SideStats {
            shots: get_opt_u32(row, "away_shots")?,
            shots_on_target: get_opt_u32(row, "away_shots_on_target")?,
            corners: get_opt_u32(row, "away_corners")?,
            fouls: get_opt_u32(row, "away_fouls")?,
            yellow_cards: get_opt_u32(row, "away_yellow_cards")?,
            red_cards: get_opt_u32(row, "away_red_cards")?,
        },
        referee: row.get("referee"),
    })
}

pub async fn get_all_matches(pool: &SqlitePool) -> Result<Vec<MatchRecord>> {
    let rows = sqlx::query("SELECT * FROM matches ORDER BY match_date ASC, rowid ASC")
        .fetch_all(pool)
        .await?;

    rows.iter().map(match_from_row).collect()
}

pub async fn count_matches(pool: &SqlitePool) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM matches").fetch_one(pool).await?;
    Ok(row.get("n"))
}

/// Everything the engine needs: settled matches plus the secondary calendar
pub async fn load_match_history(pool: &SqlitePool) -> Result<MatchHistory> {
    let matches = get_all_matches(pool).await?;
    let secondary = get_secondary_fixtures(pool).await?;
    tracing::info!(
        "Loaded {} matches and {} secondary fixtures",
        matches.len(),
        secondary.len()
    );
    Ok(MatchHistory::new(matches).with_secondary_fixtures(secondary.into_iter().map(|f| (f.team, f.date))))
}

// Fixture operations

pub async fn insert_fixtures(pool: &SqlitePool, fixtures: &[Fixture]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    let now = Utc::now().to_rfc3339();

    for f in fixtures {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO fixtures
            (id, match_date, kickoff, league, home_team, away_team, referee, odds, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(f.date.format(DATE_FORMAT).to_string())
        .bind(&f.kickoff)
        .bind(&f.league)
        .bind(&f.home_team)
        .bind(&f.away_team)
        .bind(&f.referee)
        .bind(serde_json::to_string(&f.odds)?)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(fixtures.len())
}

/// Fixtures on or after `from`, soonest first
pub async fn get_upcoming_fixtures(pool: &SqlitePool, from: NaiveDate, limit: i64) -> Result<Vec<Fixture>> {
    let rows = sqlx::query(
        "SELECT * FROM fixtures WHERE match_date >= ? ORDER BY match_date ASC, kickoff ASC, home_team ASC LIMIT ?",
    )
    .bind(from.format(DATE_FORMAT).to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut fixtures = Vec::new();
    for row in rows {
        fixtures.push(Fixture {
            date: parse_date(&row.get::<String, _>("match_date"))?,
            kickoff: row.get("kickoff"),
            league: row.get("league"),
            home_team: row.get("home_team"),
            away_team: row.get("away_team"),
            referee: row.get("referee"),
            odds: serde_json::from_str(&row.get::<String, _>("odds"))?,
        });
    }
    Ok(fixtures)
}

// Secondary competition schedule

pub async fn insert_secondary_fixtures(pool: &SqlitePool, fixtures: &[SecondaryFixture]) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for f in fixtures {
        sqlx::query("INSERT OR REPLACE INTO secondary_fixtures (team, match_date, competition) VALUES (?, ?, ?)")
            .bind(&f.team)
            .bind(f.date.format(DATE_FORMAT).to_string())
            .bind(&f.competition)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(fixtures.len())
}

pub async fn get_secondary_fixtures(pool: &SqlitePool) -> Result<Vec<SecondaryFixture>> {
    let rows = sqlx::query("SELECT * FROM secondary_fixtures ORDER BY match_date ASC, team ASC")
        .fetch_all(pool)
        .await?;

    let mut fixtures = Vec::new();
    for row in rows {
        fixtures.push(SecondaryFixture {
            team: row.get("team"),
            date: parse_date(&row.get::<String, _>("match_date"))?,
            competition: row.get("competition"),
        });
    }
    Ok(fixtures)
}

// Prediction operations

pub async fn insert_prediction(pool: &SqlitePool, prediction: &Prediction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO predictions
        (id, match_date, home_team, away_team, model_version, payload, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(prediction.match_date.format(DATE_FORMAT).to_string())
    .bind(&prediction.home.canonical)
    .bind(&prediction.away.canonical)
    .bind(&prediction.model_version)
    .bind(serde_json::to_string(prediction)?)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_latest_prediction(
    pool: &SqlitePool,
    home_team: &str,
    away_team: &str,
    match_date: NaiveDate,
) -> Result<Option<Prediction>> {
    let row = sqlx::query(
        r#"SELECT payload FROM predictions
           WHERE home_team = ? AND away_team = ? AND match_date = ?
           ORDER BY created_at DESC LIMIT 1"#,
    )
    .bind(home_team)
    .bind(away_team)
    .bind(match_date.format(DATE_FORMAT).to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("payload"))?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_database_with_pool(&pool).await.unwrap();
        pool
    }

    fn record(date: NaiveDate, home: &str, away: &str, hg: u32, ag: u32) -> MatchRecord {
        MatchRecord {
            date,
            league: "E0".to_string(),
            season: crate::utils::season_label(date),
            home_team: home.to_string(),
            away_team: away.to_string(),
            home_goals: hg,
            away_goals: ag,
            result: ResultCode::from_score(hg, ag),
            home_stats: SideStats {
                shots: Some(14),
                shots_on_target: Some(6),
                corners: None,
                fouls: Some(9),
                yellow_cards: Some(1),
                red_cards: Some(0),
            },
            away_stats: SideStats::default(),
            referee: Some("S Attwell".to_string()),
        }
    }

    #[tokio::test]
    async fn test_matches_round_trip_and_upsert() {
        let pool = memory_pool().await;
        let d = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let first = record(d, "Arsenal", "Chelsea", 2, 1);
        insert_matches(&pool, &[record(d.succ_opt().unwrap(), "Everton", "Fulham", 0, 0), first.clone()])
            .await
            .unwrap();

        let stored = get_all_matches(&pool).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0], first);

        // same date and teams replaces the row
        insert_matches(&pool, &[record(d, "Arsenal", "Chelsea", 3, 1)]).await.unwrap();
        assert_eq!(count_matches(&pool).await.unwrap(), 2);
        assert_eq!(get_all_matches(&pool).await.unwrap()[0].home_goals, 3);
    }

    #[tokio::test]
    async fn test_history_includes_secondary_calendar() {
        let pool = memory_pool().await;
        let d = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        insert_matches(&pool, &[record(d, "Arsenal", "Chelsea", 2, 1)]).await.unwrap();
        insert_secondary_fixtures(
            &pool,
            &[SecondaryFixture {
                team: "Arsenal".to_string(),
                date: NaiveDate::from_ymd_opt(2024, 3, 6).unwrap(),
                competition: Some("UCL".to_string()),
            }],
        )
        .await
        .unwrap();

        let history = load_match_history(&pool).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.secondary_dates("Arsenal").len(), 1);
    }

    #[tokio::test]
    async fn test_fixtures_keep_their_odds() {
        let pool = memory_pool().await;
        let (odds, _) = KnownOdds::from_keyed([("home", 2.1), ("draw", 3.3), ("away", 3.6)]);
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let fixture = Fixture {
            date: today,
            kickoff: Some("17:30".to_string()),
            league: "E0".to_string(),
            home_team: "Arsenal".to_string(),
            away_team: "Chelsea".to_string(),
            referee: None,
            odds,
        };
        let past = Fixture {
            date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            ..fixture.clone()
        };
        insert_fixtures(&pool, &[fixture.clone(), past]).await.unwrap();

        let upcoming = get_upcoming_fixtures(&pool, today, 50).await.unwrap();
        assert_eq!(upcoming, vec![fixture]);
    }
}
