mod api;
mod cli;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::services::PredictionRequest;

#[derive(Parser)]
#[command(name = "matchcast")]
#[command(about = "Football match outcome prediction engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Initialize the database
    InitDb {
        /// Delete all imported data and stored predictions
        #[arg(long)]
        reset: bool,
    },
    /// Import results, fixtures or a secondary competition schedule from CSV
    Import {
        #[arg(short, long, value_enum)]
        kind: cli::ImportKind,
        #[arg(short, long)]
        file: PathBuf,
        /// League code for files without a Div column
        #[arg(short, long)]
        league: Option<String>,
    },
    /// Train the outcome models, or reuse a compatible cached bundle
    Train {
        /// Ignore any cached bundle
        #[arg(long)]
        retrain: bool,
    },
    /// Predict a single match
    Predict {
        #[arg(long)]
        home: String,
        #[arg(long)]
        away: String,
        /// Match date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,
        #[arg(short, long)]
        referee: Option<String>,
        #[arg(short, long)]
        league: Option<String>,
        /// Known bookmaker prices as key=price, e.g. --odds home=1.80 --odds draw=3.40
        #[arg(short, long)]
        odds: Vec<String>,
    },
    /// Generate predictions for imported upcoming fixtures
    Fixtures {
        /// First fixture date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        from: Option<NaiveDate>,
        #[arg(short = 'n', long, default_value = "50")]
        limit: i64,
    },
    /// Export the historical feature table as CSV
    Export {
        #[arg(short, long)]
        out: PathBuf,
        #[arg(short, long, value_enum, default_value = "window")]
        mode: cli::ExportMode,
    },
    /// Query a team's current form snapshot
    Team {
        #[arg(short, long)]
        name: String,
        /// Cutoff date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        as_of: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables before the filter reads RUST_LOG
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load()?;

    match cli.command {
        Some(Commands::Serve { port }) => {
            tracing::info!("Starting MatchCast API server on port {}", port);
            api::serve(&config, port).await?;
        }
        Some(Commands::InitDb { reset }) => {
            tracing::info!("Initializing database...");
            db::init_database(&config.paths.database_url).await?;
            if reset {
                cli::reset(&config).await?;
            }
        }
        Some(Commands::Import { kind, file, league }) => {
            cli::import(&config, kind, &file, league.as_deref()).await?;
        }
        Some(Commands::Train { retrain }) => {
            tracing::info!("Training models...");
            cli::train(&config, retrain).await?;
        }
        Some(Commands::Predict {
            home,
            away,
            date,
            referee,
            league,
            odds,
        }) => {
            let request = PredictionRequest {
                home_team: home,
                away_team: away,
                match_date: date,
                referee,
                league,
                known_odds: cli::parse_odds_args(&odds)?,
            };
            cli::predict(&config, request).await?;
        }
        Some(Commands::Fixtures { from, limit }) => {
            tracing::info!("Generating fixture predictions...");
            cli::fixtures(&config, from, limit).await?;
        }
        Some(Commands::Export { out, mode }) => {
            cli::export_features(&config, &out, mode).await?;
        }
        Some(Commands::Team { name, as_of }) => {
            tracing::info!("Querying team: {}", name);
            cli::query_team(&config, &name, as_of).await?;
        }
        None => {
            // Default to serving
            tracing::info!("Starting MatchCast API server on port 3000");
            api::serve(&config, 3000).await?;
        }
    }

    Ok(())
}
