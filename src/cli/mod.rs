use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use std::path::Path;

use crate::config::EngineConfig;
use crate::db::import::{import_fixtures, import_matches, import_secondary};
use crate::db::{
    count_matches, create_pool, get_upcoming_fixtures, init_database_with_pool, insert_prediction, load_match_history,
};
use crate::models::{KnownOdds, OddsSource, Prediction};
use crate::services::feature_schema::FEATURE_NAMES;
use crate::services::model_bank::HoldoutMetric;
use crate::services::predictor::canonicalize;
use crate::services::{
    AggregationMode, AliasTable, FeatureBuilder, FeatureTable, PredictionEngine, PredictionRequest, TrainingDiagnostics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ImportKind {
    /// Settled results (football-data.co.uk layout)
    Matches,
    /// Upcoming fixtures, with B365 prices when present
    Fixtures,
    /// team,date[,competition] rows from cup and European competitions
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportMode {
    /// Trailing window of `form_window` matches, as used for training
    Window,
    /// Career-to-date mean
    Expanding,
    /// Exponentially weighted, half-life `ewm_half_life` matches
    Ewm,
}

impl ExportMode {
    fn aggregation(self, config: &EngineConfig) -> AggregationMode {
        match self {
            ExportMode::Window => AggregationMode::Window(config.features.form_window),
            ExportMode::Expanding => AggregationMode::Expanding,
            ExportMode::Ewm => AggregationMode::Ewm {
                half_life: config.features.ewm_half_life,
            },
        }
    }
}

async fn open_pool(config: &EngineConfig) -> Result<SqlitePool> {
    let pool = create_pool(&config.paths.database_url).await?;
    init_database_with_pool(&pool).await?;
    Ok(pool)
}

fn load_aliases(config: &EngineConfig) -> Result<AliasTable> {
    let mut aliases = AliasTable::with_builtin_aliases();
    if let Some(path) = &config.paths.alias_path {
        aliases.load_csv(Path::new(path))?;
    }
    Ok(aliases)
}

/// Load history from the database and bring up an engine, training on a blocking thread when needed
pub async fn build_engine(
    config: &EngineConfig,
    retrain: bool,
) -> Result<(PredictionEngine, Option<TrainingDiagnostics>, SqlitePool)> {
    let pool = open_pool(config).await?;
    let history = load_match_history(&pool).await?;
    if history.is_empty() {
        tracing::warn!("No match history in the database; every prediction will come back empty");
    }
    let aliases = load_aliases(config)?;
    let config = config.clone();

    let (engine, diagnostics) =
        tokio::task::spawn_blocking(move || PredictionEngine::bootstrap(history, aliases, config, retrain))
            .await
            .context("Model training task failed")?;
    Ok((engine, diagnostics, pool))
}

pub async fn import(config: &EngineConfig, kind: ImportKind, path: &Path, league: Option<&str>) -> Result<()> {
    let pool = open_pool(config).await?;

    println!("📥 Importing {:?} from {}...", kind, path.display());
    let report = match kind {
        ImportKind::Matches => import_matches(&pool, path, league).await?,
        ImportKind::Fixtures => import_fixtures(&pool, path, league).await?,
        ImportKind::Secondary => import_secondary(&pool, path).await?,
    };

    println!(
        "✅ Imported {} of {} rows ({} skipped)",
        report.imported, report.rows, report.skipped
    );
    if kind == ImportKind::Matches && report.imported > 0 {
        println!("📚 Database now holds {} matches", count_matches(&pool).await?);
        println!("💡 Run 'matchcast train --retrain' to refresh the models");
    }
    Ok(())
}

pub async fn reset(config: &EngineConfig) -> Result<()> {
    let pool = open_pool(config).await?;
    crate::db::clear_all_data(&pool).await?;
    println!("🧹 Cleared matches, fixtures and stored predictions");
    Ok(())
}

/// Dump the feature table, one row per historical match
pub async fn export_features(config: &EngineConfig, out: &Path, mode: ExportMode) -> Result<()> {
    let pool = open_pool(config).await?;
    let (history, _) = canonicalize(load_match_history(&pool).await?, load_aliases(config)?);
    let table = FeatureBuilder::new(config)
        .with_mode(mode.aggregation(config))
        .build(&history);

    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = std::fs::File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
    write_feature_csv(&table, file)?;
    println!("📤 Wrote {} feature rows ({:?}) to {}", table.len(), table.mode, out.display());
    Ok(())
}

fn write_feature_csv<W: std::io::Write>(table: &FeatureTable, out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    let columns: Vec<Vec<Option<f64>>> = FEATURE_NAMES.iter().filter_map(|n| table.column(n)).collect();

    let mut header = vec!["date", "league", "home_team", "away_team", "home_goals", "away_goals"];
    header.extend(FEATURE_NAMES);
    writer.write_record(&header)?;

    for (i, row) in table.rows.iter().enumerate() {
        let m = &row.record;
        let mut record = vec![
            m.date.to_string(),
            m.league.clone(),
            m.home_team.clone(),
            m.away_team.clone(),
            m.home_goals.to_string(),
            m.away_goals.to_string(),
        ];
        record.extend(columns.iter().map(|c| c[i].map(|v| v.to_string()).unwrap_or_default()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub async fn train(config: &EngineConfig, retrain: bool) -> Result<()> {
    println!("🧠 Preparing models...");
    let (engine, diagnostics, _) = build_engine(config, retrain).await?;

    match diagnostics {
        Some(diagnostics) => print_diagnostics(&diagnostics),
        None => println!(
            "♻️  Reused cached model bundle {} ({} training rows)",
            engine.model_version(),
            engine.model_bank().bundle().training_rows
        ),
    }
    println!("💾 Model bundle: {}", config.paths.model_path);
    Ok(())
}

fn print_diagnostics(diagnostics: &TrainingDiagnostics) {
    println!(
        "✅ Trained bundle {} on {} matches ({} held out for validation)",
        diagnostics.bundle_id, diagnostics.rows, diagnostics.holdout_rows
    );
    for target in &diagnostics.targets {
        match (&target.failure, &target.holdout) {
            (Some(reason), _) => println!("   ❌ {:<11} unavailable: {}", target.target.to_string(), reason),
            (None, Some(HoldoutMetric::Classifier { brier, accuracy })) => println!(
                "   • {:<11} brier {:.3} | accuracy {:.1}%",
                target.target.to_string(),
                brier,
                accuracy * 100.0
            ),
            (None, Some(HoldoutMetric::Regressor { mae })) => {
                println!("   • {:<11} MAE {:.3} goals", target.target.to_string(), mae)
            }
            (None, None) => println!("   • {:<11} trained (no holdout)", target.target.to_string()),
        }
    }
}

/// `key=price` pairs such as `home=1.80` or `over25=1.95`
pub fn parse_odds_args(args: &[String]) -> Result<Option<KnownOdds>> {
    if args.is_empty() {
        return Ok(None);
    }
    let mut pairs = Vec::new();
    for arg in args {
        let (key, price) = arg
            .split_once('=')
            .with_context(|| format!("Expected key=price, got '{}'", arg))?;
        let price: f64 = price
            .trim()
            .parse()
            .with_context(|| format!("Invalid price in '{}'", arg))?;
        pairs.push((key.trim(), price));
    }
    let (odds, rejected) = KnownOdds::from_keyed(pairs);
    if !rejected.is_empty() {
        anyhow::bail!("Unknown market or invalid price for: {}", rejected.join(", "));
    }
    Ok(Some(odds))
}

pub async fn predict(config: &EngineConfig, request: PredictionRequest) -> Result<()> {
    let (engine, _, pool) = build_engine(config, false).await?;

    println!("🔮 Predicting {} vs {}...", request.home_team, request.away_team);
    match engine.predict(&request) {
        Some(prediction) => {
            insert_prediction(&pool, &prediction).await?;
            print_prediction(&prediction);
        }
        None => {
            println!("❌ Cannot predict this match: a team is unknown or has no prior matches");
            println!("💡 Use 'matchcast team --name <team>' to check what the engine knows");
        }
    }
    Ok(())
}

pub async fn fixtures(config: &EngineConfig, from: Option<NaiveDate>, limit: i64) -> Result<()> {
    let (engine, _, pool) = build_engine(config, false).await?;
    let from = from.unwrap_or_else(|| Utc::now().date_naive());

    println!("🔮 Generating predictions for fixtures from {}...", from);
    let fixtures = get_upcoming_fixtures(&pool, from, limit).await?;
    if fixtures.is_empty() {
        println!("📭 No upcoming fixtures found. Import some first with: matchcast import --kind fixtures --file <csv>");
        return Ok(());
    }

    let predictions = engine.predict_fixtures(&fixtures);
    for prediction in &predictions {
        insert_prediction(&pool, prediction).await?;
    }
    println!(
        "✅ Generated predictions for {} of {} fixtures!\n",
        predictions.len(),
        fixtures.len()
    );
    for prediction in &predictions {
        print_prediction(prediction);
    }
    Ok(())
}

pub async fn query_team(config: &EngineConfig, name: &str, as_of: Option<NaiveDate>) -> Result<()> {
    let pool = open_pool(config).await?;
    let history = load_match_history(&pool).await?;
    let (history, aliases) = canonicalize(history, load_aliases(config)?);
    let store = crate::services::TeamFormStore::new(
        std::sync::Arc::new(history),
        std::sync::Arc::new(aliases),
        config.features.clone(),
    );

    println!("🔍 Searching for team: {}", name);
    let Some(snapshot) = store.get_team_state(name, as_of) else {
        println!("❌ No team state for '{}' (unknown team or no matches before the cutoff)", name);
        return Ok(());
    };

    let s = &snapshot.state;
    println!("📊 {} ({} match)", snapshot.team.canonical, snapshot.team.matched);
    println!("   As of: {} | last {} matches", s.as_of, s.matches_considered);
    println!("   Form: {}W {}D {}L | PPG {:.2}", s.wins, s.draws, s.losses, s.ppg);
    println!("   Goals: {:.2} for | {:.2} against | volatility {:.2}", s.avg_goals_for, s.avg_goals_against, s.goal_volatility);
    println!("   Shots: {:.1} ({:.1} on target) | conceded {:.1} ({:.1} on target)", s.avg_shots_for, s.avg_sot_for, s.avg_shots_against, s.avg_sot_against);
    println!("   Corners: {:.1} | Cards: {:.1} | Fouls: {:.1}", s.avg_corners_for, s.avg_cards, s.avg_fouls);
    println!(
        "   BTTS {:.0}% | Over 2.5 {:.0}% | Clean sheets {:.0}% | Failed to score {:.0}%",
        s.btts_rate * 100.0,
        s.over25_rate * 100.0,
        s.clean_sheet_rate * 100.0,
        s.failed_to_score_rate * 100.0
    );
    println!("   Schedule difficulty: {:.2} | Rest days: {:.0}", s.schedule_difficulty, s.rest_days);
    Ok(())
}

fn print_prediction(p: &Prediction) {
    let (home_score, away_score) = p.expected_goals.display_score();
    println!("⚽ {} vs {} ({})", p.home.canonical, p.away.canonical, p.match_date);
    for team in [&p.home, &p.away] {
        if team.matched != crate::models::NameMatch::Exact {
            println!("   ℹ️  '{}' resolved to {} ({})", team.query, team.canonical, team.matched);
        }
    }
    println!(
        "   Home win: {:.1}% | Draw: {:.1}% | Away win: {:.1}%",
        p.probabilities.home_win * 100.0,
        p.probabilities.draw * 100.0,
        p.probabilities.away_win * 100.0
    );
    println!(
        "   Over 1.5: {:.1}% | Over 2.5: {:.1}% | BTTS: {:.1}%",
        p.probabilities.over15 * 100.0,
        p.probabilities.over25 * 100.0,
        p.probabilities.btts * 100.0
    );
    println!(
        "   Expected goals: {:.2} - {:.2} (likely {}-{})",
        p.expected_goals.home, p.expected_goals.away, home_score, away_score
    );
    let referee = match (&p.referee.name, p.referee.is_baseline) {
        (Some(name), false) => format!("{} ({:.1} cards over {} matches)", name, p.referee.avg_cards, p.referee.sample),
        (Some(name), true) => format!("{} (baseline {:.1} cards)", name, p.referee.avg_cards),
        (None, _) => format!("unknown (baseline {:.1} cards)", p.referee.avg_cards),
    };
    println!("   Referee: {}", referee);
    let odds: Vec<String> = p
        .odds
        .iter()
        .map(|o| match o.source {
            OddsSource::Market => format!("{} {:.2}* (edge {:+.1}%)", o.key, o.decimal_odds, o.edge() * 100.0),
            OddsSource::Model => format!("{} {:.2}", o.key, o.decimal_odds),
        })
        .collect();
    println!("   Odds: {}", odds.join(" | "));
    let traps = p.traps.labels();
    if !traps.is_empty() {
        println!("   ⚠️  Traps: {}", traps.join(", "));
    }
    if !p.fallbacks.is_empty() {
        let targets: Vec<String> = p.fallbacks.iter().map(|t| t.to_string()).collect();
        println!("   ⚠️  Neutral fallback used for: {}", targets.join(", "));
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Market, ResultCode};

    #[test]
    fn test_parse_odds_args() {
        assert!(parse_odds_args(&[]).unwrap().is_none());

        let odds = parse_odds_args(&["home=1.80".to_string(), "x = 3.4".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(odds.get(Market::MatchResult(ResultCode::Home)), Some(1.80));
        assert_eq!(odds.get(Market::MatchResult(ResultCode::Draw)), Some(3.4));

        assert!(parse_odds_args(&["corners=2.0".to_string()]).is_err());
        assert!(parse_odds_args(&["home:1.8".to_string()]).is_err());
        assert!(parse_odds_args(&["away=0.8".to_string()]).is_err());
    }

    #[test]
    fn test_feature_csv_has_one_row_per_match() {
        use crate::services::history::test_support::*;
        use crate::services::MatchHistory;

        let config = EngineConfig::default();
        let history = MatchHistory::new(league_history(&["A", "B", "C", "D"], 3, date(2023, 8, 12)));
        let table = FeatureBuilder::new(&config)
            .with_mode(ExportMode::Ewm.aggregation(&config))
            .build(&history);

        let mut out = Vec::new();
        write_feature_csv(&table, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), history.len() + 1);
        assert!(lines[0].starts_with("date,league,home_team,away_team,home_goals,away_goals,home_ppg"));
        assert_eq!(lines[1].split(',').count(), 6 + FEATURE_NAMES.len());
    }
}
