use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cli::build_engine;
use crate::config::EngineConfig;
use crate::db::{get_latest_prediction, get_upcoming_fixtures, insert_prediction};
use crate::models::{ApiResponse, KnownOdds, Prediction, TeamSnapshot};
use crate::services::{PredictionEngine, PredictionRequest};

pub struct AppState {
    pub engine: PredictionEngine,
    pub pool: SqlitePool,
}

pub async fn serve(config: &EngineConfig, port: u16) -> anyhow::Result<()> {
    let (engine, _, pool) = build_engine(config, false).await?;
    tracing::info!("Serving model bundle {}", engine.model_version());

    let state = Arc::new(AppState { engine, pool });
    let app = create_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("MatchCast API server listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/teams/{name}/state", get(get_team_state_handler))
        .route("/predict", post(predict_handler))
        .route("/predictions/latest", get(get_stored_prediction_handler))
        .route("/fixtures/predictions", get(get_fixture_predictions_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    model_version: String,
    history_matches: usize,
    trained_at: chrono::DateTime<Utc>,
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthStatus>> {
    let bundle = state.engine.model_bank().bundle();
    Json(ApiResponse::success(HealthStatus {
        status: "ok",
        model_version: bundle.bundle_id.clone(),
        history_matches: state.engine.history().len(),
        trained_at: bundle.trained_at,
    }))
}

// GET /teams/{name}/state?as_of=YYYY-MM-DD
#[derive(Deserialize)]
struct TeamStateQuery {
    as_of: Option<NaiveDate>,
}

async fn get_team_state_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<TeamStateQuery>,
) -> Result<Json<ApiResponse<TeamSnapshot>>, StatusCode> {
    match state.engine.get_team_state(&name, params.as_of) {
        Some(snapshot) => Ok(Json(ApiResponse::success(snapshot))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// POST /predict
#[derive(Debug, Deserialize)]
struct PredictBody {
    home_team: String,
    away_team: String,
    match_date: Option<NaiveDate>,
    referee: Option<String>,
    league: Option<String>,
    /// market key -> decimal price, e.g. {"home": 1.8, "over25": 1.95}
    #[serde(default)]
    odds: BTreeMap<String, f64>,
}

impl PredictBody {
    fn into_request(self) -> Result<PredictionRequest, Vec<String>> {
        let (odds, rejected) = KnownOdds::from_keyed(self.odds.iter().map(|(k, v)| (k.as_str(), *v)));
        if !rejected.is_empty() {
            return Err(rejected);
        }
        Ok(PredictionRequest {
            home_team: self.home_team,
            away_team: self.away_team,
            match_date: self.match_date,
            referee: self.referee,
            league: self.league,
            known_odds: (!odds.is_empty()).then_some(odds),
        })
    }
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PredictBody>,
) -> Result<Json<ApiResponse<Prediction>>, StatusCode> {
    let request = body.into_request().map_err(|rejected| {
        tracing::warn!("Rejected odds keys: {}", rejected.join(", "));
        StatusCode::BAD_REQUEST
    })?;

    let prediction = state.engine.predict(&request).ok_or(StatusCode::NOT_FOUND)?;
    if let Err(e) = insert_prediction(&state.pool, &prediction).await {
        tracing::error!("Failed to store prediction: {}", e);
    }
    Ok(Json(ApiResponse::success(prediction)))
}

// GET /predictions/latest?home=..&away=..&date=YYYY-MM-DD
#[derive(Deserialize)]
struct StoredPredictionQuery {
    home: String,
    away: String,
    date: NaiveDate,
}

async fn get_stored_prediction_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StoredPredictionQuery>,
) -> Result<Json<ApiResponse<Prediction>>, StatusCode> {
    let canonical = |name: &str| {
        state
            .engine
            .resolve_team(name)
            .map_or_else(|| name.to_string(), |t| t.canonical)
    };
    match get_latest_prediction(&state.pool, &canonical(&params.home), &canonical(&params.away), params.date).await {
        Ok(Some(prediction)) => Ok(Json(ApiResponse::success(prediction))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load stored prediction: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// GET /fixtures/predictions?from=YYYY-MM-DD&limit=50
#[derive(Deserialize)]
struct FixturePredictionsQuery {
    from: Option<NaiveDate>,
    limit: Option<i64>,
}

async fn get_fixture_predictions_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FixturePredictionsQuery>,
) -> Result<Json<ApiResponse<Vec<Prediction>>>, StatusCode> {
    let from = params.from.unwrap_or_else(|| Utc::now().date_naive());
    let limit = params.limit.unwrap_or(50).clamp(1, 200);

    match get_upcoming_fixtures(&state.pool, from, limit).await {
        Ok(fixtures) => Ok(Json(ApiResponse::success(state.engine.predict_fixtures(&fixtures)))),
        Err(e) => {
            tracing::error!("Failed to fetch upcoming fixtures: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
