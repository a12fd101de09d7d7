mod cli;
mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::core::{
    BenefitEstimate, BenefitTableSet, BenefitTables, BreakEven, ClaimingSearchResult, CppHistory,
    EngineError, EngineResult, Eligibility, GisIncome, HistorySummary, IncomeItem, MaritalStatus,
    OptimalAge, ReturnTier, Scenario, apply_return_tier, calculate_break_even_age, calculate_gis,
    calculate_gis_income, calculate_net_oas, calculate_oas_deferral, compare_return_tiers,
    estimate_cpp, find_optimal_cpp_start_age, is_eligible_for_gis, optimize_claiming_ages,
    run_projection, run_scenarios, summarize_history,
};

pub use cli::{Cli, CliError, Command, run_cli};
pub use wire::{PersonPayload, ProjectionPayload, ProjectionResponse, SummaryResponse};

const DEFAULT_HORIZON_AGE: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    tables: Arc<BenefitTableSet>,
}

impl AppState {
    pub fn new(tables: BenefitTableSet) -> Self {
        Self {
            tables: Arc::new(tables),
        }
    }

    fn tables_for(&self, year: Option<i32>) -> EngineResult<&BenefitTables> {
        let year = year
            .or_else(|| self.tables.latest().map(|t| t.year))
            .unwrap_or(wire::DEFAULT_START_YEAR);
        self.tables.for_year(year)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CppPayload {
    average_indexed_earnings: Option<f64>,
    years_of_contribution: Option<f64>,
    history: Option<CppHistory>,
    start_age: Option<u32>,
    current_age: Option<u32>,
    year: Option<i32>,
    life_expectancy: Option<f64>,
    discount_rate: Option<f64>,
    age_a: Option<u32>,
    age_b: Option<u32>,
    horizon_age: Option<u32>,
}

impl CppPayload {
    fn summary(&self, tables: &BenefitTables) -> EngineResult<HistorySummary> {
        if let Some(history) = &self.history {
            return summarize_history(history, &tables.cpp);
        }
        let average = self.average_indexed_earnings.ok_or_else(|| {
            EngineError::invalid("average_indexed_earnings", "is required without a history")
        })?;
        let years = self.years_of_contribution.ok_or_else(|| {
            EngineError::invalid("years_of_contribution", "is required without a history")
        })?;
        summarize_history(
            &CppHistory::Summary {
                average_indexed_earnings: average,
                contributory_years: years,
            },
            &tables.cpp,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OasPayload {
    years_in_canada: Option<u32>,
    net_world_income: Option<f64>,
    age: Option<u32>,
    deferral_months: Option<u32>,
    base_age: Option<u32>,
    year: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GisPayload {
    countable_income: Option<f64>,
    marital_status: Option<MaritalStatus>,
    spouse_receives_oas: Option<bool>,
    age: Option<u32>,
    receives_oas: Option<bool>,
    year: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GisIncomePayload {
    sources: Vec<IncomeItem>,
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ScenarioPayload {
    id: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    plan: ProjectionPayload,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComparePayload {
    #[serde(flatten)]
    plan: ProjectionPayload,
    scenarios: Vec<ScenarioPayload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OptimizePayload {
    #[serde(flatten)]
    plan: ProjectionPayload,
    person_index: Option<usize>,
}

#[derive(Debug, Serialize)]
struct GisResponse {
    #[serde(flatten)]
    estimate: BenefitEstimate,
    #[serde(skip_serializing_if = "Option::is_none")]
    eligibility: Option<Eligibility>,
}

#[derive(Debug, Serialize)]
struct TierResponse {
    tier: ReturnTier,
    return_shift: f64,
    #[serde(flatten)]
    result: ProjectionResponse,
}

#[derive(Debug, Serialize)]
struct ScenarioResponse {
    id: u32,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<ProjectionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum CompareResponse {
    Tiers { tiers: Vec<TierResponse> },
    Scenarios { scenarios: Vec<ScenarioResponse> },
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    table_years: Vec<i32>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/projection", post(projection_handler))
        .route("/api/compare", post(compare_handler))
        .route("/api/optimize", post(optimize_handler))
        .route("/api/cpp", get(cpp_get_handler).post(cpp_post_handler))
        .route("/api/cpp/optimal", post(cpp_optimal_handler))
        .route("/api/cpp/break-even", post(cpp_break_even_handler))
        .route("/api/oas", get(oas_get_handler).post(oas_post_handler))
        .route(
            "/api/oas/deferral",
            get(oas_deferral_get_handler).post(oas_deferral_post_handler),
        )
        .route("/api/gis", get(gis_get_handler).post(gis_post_handler))
        .route("/api/gis/income", post(gis_income_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(addr: SocketAddr, tables: BenefitTableSet) -> std::io::Result<()> {
    let years = tables.years();
    let app = router(AppState::new(tables));

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, ?years, "retirement planning API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn health_handler(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            table_years: state.tables.years(),
        },
    )
}

async fn projection_handler(
    State(state): State<AppState>,
    payload: Result<Json<ProjectionPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(&rejection.body_text()),
    };
    let tables = Arc::clone(&state.tables);
    run_blocking(move || project_payload(payload, &tables)).await
}

fn project_payload(payload: ProjectionPayload, tables: &BenefitTableSet) -> EngineResult<ProjectionResponse> {
    let tier = payload.return_tier;
    let (mut household, strategy) = payload.into_domain()?;
    if let Some(tier) = tier {
        household = apply_return_tier(&household, tier);
    }
    run_projection(&household, &strategy, tables).map(ProjectionResponse::from)
}

async fn compare_handler(
    State(state): State<AppState>,
    payload: Result<Json<ComparePayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(&rejection.body_text()),
    };
    let tables = Arc::clone(&state.tables);
    run_blocking(move || compare_payload(payload, &tables)).await
}

fn compare_payload(payload: ComparePayload, tables: &BenefitTableSet) -> EngineResult<CompareResponse> {
    if payload.scenarios.is_empty() {
        let (household, strategy) = payload.plan.into_domain()?;
        let tiers = compare_return_tiers(&household, &strategy, tables)?
            .into_iter()
            .map(|c| TierResponse {
                tier: c.tier,
                return_shift: c.return_shift,
                result: c.summary.into(),
            })
            .collect();
        return Ok(CompareResponse::Tiers { tiers });
    }

    let mut scenarios = Vec::with_capacity(payload.scenarios.len());
    for s in payload.scenarios {
        let tier = s.plan.return_tier;
        let (mut household, strategy) = s.plan.into_domain()?;
        if let Some(tier) = tier {
            household = apply_return_tier(&household, tier);
        }
        scenarios.push(Scenario {
            id: s.id,
            name: s.name.unwrap_or_else(|| format!("scenario-{}", s.id)),
            household,
            strategy,
        });
    }
    let results = run_scenarios(&scenarios, tables)
        .into_iter()
        .map(|r| ScenarioResponse {
            id: r.id,
            name: r.name,
            result: r.summary.map(ProjectionResponse::from),
            error: r.error,
        })
        .collect();
    Ok(CompareResponse::Scenarios { scenarios: results })
}

async fn optimize_handler(
    State(state): State<AppState>,
    payload: Result<Json<OptimizePayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(&rejection.body_text()),
    };
    let tables = Arc::clone(&state.tables);
    run_blocking(move || optimize_payload(payload, &tables)).await
}

fn optimize_payload(payload: OptimizePayload, tables: &BenefitTableSet) -> EngineResult<ClaimingSearchResult> {
    let person_index = payload.person_index.unwrap_or(0);
    let (household, strategy) = payload.plan.into_domain()?;
    optimize_claiming_ages(&household, &strategy, person_index, tables)
}

async fn cpp_get_handler(
    State(state): State<AppState>,
    payload: Result<Query<CppPayload>, QueryRejection>,
) -> Response {
    match payload {
        Ok(Query(payload)) => respond(cpp_estimate(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

async fn cpp_post_handler(
    State(state): State<AppState>,
    payload: Result<Json<CppPayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => respond(cpp_estimate(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

fn cpp_estimate(state: &AppState, payload: &CppPayload) -> EngineResult<BenefitEstimate> {
    let tables = state.tables_for(payload.year)?;
    let summary = payload.summary(tables)?;
    let start_age = payload.start_age.unwrap_or(65);
    estimate_cpp(
        summary.average_indexed_earnings,
        summary.contributory_years,
        start_age,
        payload.current_age.unwrap_or(start_age),
        tables,
    )
}

async fn cpp_optimal_handler(
    State(state): State<AppState>,
    payload: Result<Json<CppPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(&rejection.body_text()),
    };
    respond(cpp_optimal(&state, &payload))
}

fn cpp_optimal(state: &AppState, payload: &CppPayload) -> EngineResult<OptimalAge> {
    let tables = state.tables_for(payload.year)?;
    let summary = payload.summary(tables)?;
    let life_expectancy = payload
        .life_expectancy
        .ok_or_else(|| EngineError::invalid("life_expectancy", "is required"))?;
    find_optimal_cpp_start_age(
        &summary,
        life_expectancy,
        payload.discount_rate,
        payload.current_age.unwrap_or(60),
        tables,
    )
}

async fn cpp_break_even_handler(
    State(state): State<AppState>,
    payload: Result<Json<CppPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(&rejection.body_text()),
    };
    respond(cpp_break_even(&state, &payload))
}

fn cpp_break_even(state: &AppState, payload: &CppPayload) -> EngineResult<BreakEven> {
    let tables = state.tables_for(payload.year)?;
    let summary = payload.summary(tables)?;
    let age_a = payload
        .age_a
        .ok_or_else(|| EngineError::invalid("age_a", "is required"))?;
    let age_b = payload
        .age_b
        .ok_or_else(|| EngineError::invalid("age_b", "is required"))?;
    calculate_break_even_age(
        &summary,
        age_a,
        age_b,
        payload.horizon_age.unwrap_or(DEFAULT_HORIZON_AGE),
        tables,
    )
}

async fn oas_get_handler(
    State(state): State<AppState>,
    payload: Result<Query<OasPayload>, QueryRejection>,
) -> Response {
    match payload {
        Ok(Query(payload)) => respond(oas_estimate(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

async fn oas_post_handler(
    State(state): State<AppState>,
    payload: Result<Json<OasPayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => respond(oas_estimate(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

fn oas_estimate(state: &AppState, payload: &OasPayload) -> EngineResult<BenefitEstimate> {
    let tables = state.tables_for(payload.year)?;
    let years = payload
        .years_in_canada
        .ok_or_else(|| EngineError::invalid("years_in_canada", "is required"))?;
    calculate_net_oas(
        years,
        payload.net_world_income.unwrap_or(0.0),
        payload.age.unwrap_or(65),
        tables,
    )
}

async fn oas_deferral_get_handler(
    State(state): State<AppState>,
    payload: Result<Query<OasPayload>, QueryRejection>,
) -> Response {
    match payload {
        Ok(Query(payload)) => respond(oas_deferral(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

async fn oas_deferral_post_handler(
    State(state): State<AppState>,
    payload: Result<Json<OasPayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => respond(oas_deferral(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

fn oas_deferral(state: &AppState, payload: &OasPayload) -> EngineResult<BenefitEstimate> {
    let tables = state.tables_for(payload.year)?;
    let years = payload
        .years_in_canada
        .ok_or_else(|| EngineError::invalid("years_in_canada", "is required"))?;
    calculate_oas_deferral(
        years,
        payload.deferral_months.unwrap_or(0),
        payload.base_age.unwrap_or(65),
        tables,
    )
}

async fn gis_get_handler(
    State(state): State<AppState>,
    payload: Result<Query<GisPayload>, QueryRejection>,
) -> Response {
    match payload {
        Ok(Query(payload)) => respond(gis_estimate(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

async fn gis_post_handler(
    State(state): State<AppState>,
    payload: Result<Json<GisPayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => respond(gis_estimate(&state, &payload)),
        Err(rejection) => rejection_response(&rejection.body_text()),
    }
}

fn gis_estimate(state: &AppState, payload: &GisPayload) -> EngineResult<GisResponse> {
    let tables = state.tables_for(payload.year)?;
    let income = payload
        .countable_income
        .ok_or_else(|| EngineError::invalid("countable_income", "is required"))?;
    let status = payload.marital_status.unwrap_or_default();
    let spouse_oas = payload.spouse_receives_oas.unwrap_or(false);

    let estimate = calculate_gis(income, status, spouse_oas, tables)?;
    let eligibility = payload.age.map(|age| {
        is_eligible_for_gis(
            age,
            payload.receives_oas.unwrap_or(true),
            income,
            status,
            spouse_oas,
            tables,
        )
    });
    Ok(GisResponse {
        estimate,
        eligibility,
    })
}

async fn gis_income_handler(
    State(state): State<AppState>,
    payload: Result<Json<GisIncomePayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(&rejection.body_text()),
    };
    respond(gis_income(&state, &payload))
}

fn gis_income(state: &AppState, payload: &GisIncomePayload) -> EngineResult<GisIncome> {
    let tables = state.tables_for(payload.year)?;
    calculate_gis_income(&payload.sources, tables)
}

async fn run_blocking<T, F>(job: F) -> Response
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(result) => respond(result),
        Err(err) => {
            tracing::error!(%err, "projection task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Projection task failed")
        }
    }
}

fn respond<T: Serialize>(result: EngineResult<T>) -> Response {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => engine_error_response(&err),
    }
}

fn engine_error_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::TableLoad(_) | EngineError::WorkerPanic => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    tracing::debug!(%err, "request rejected");
    error_response(status, &err.to_string())
}

fn rejection_response(detail: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("Invalid request payload: {detail}"),
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
