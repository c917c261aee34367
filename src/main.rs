mod config;
mod external;
mod http;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod prompt;
mod resolver;
mod security;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::{MatcherConfig, Timeouts, env_parse, env_string};
use external::{AssignReport, CategoryUpdate, ExternalSiteResolver, HttpPageFetcher, ItemCategoryGuess};
use jobs::{ChunkResult, JobInfo, JobRegistry, JobStatus};
use llm::{ModelParams, OpenAiClient, OpenAiConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CategoryOption, ItemId, ItemSummary};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{CategoryStore, MemoryCatalog, ProductStore, memory::CatalogSeed};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catmatch.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let matcher = MatcherConfig::from_env();
    let timeouts = Timeouts::from_env();
    let catalog = Arc::new(match env_string("CATALOG_PATH") {
        Some(path) => MemoryCatalog::from_yaml_file(&path, &matcher.uncategorized_name)?,
        None => MemoryCatalog::new(CatalogSeed::default(), &matcher.uncategorized_name),
    });
    info!(
        target = "catmatch.store",
        uncategorized_id = catalog.uncategorized_category_id().await,
        "catalog_ready"
    );
    let llm = Arc::new(OpenAiClient::new(OpenAiConfig::from_env(), timeouts.connect));
    let pipeline = Pipeline::new(
        matcher,
        timeouts,
        ModelParams::from_env(),
        llm,
        catalog.clone(),
        catalog,
    );

    if std::env::args().nth(1).as_deref() == Some("sweep") {
        return sweep(pipeline).await;
    }

    let fetcher = Arc::new(HttpPageFetcher::new(timeouts.site_fetch, timeouts.connect));
    let state = AppState {
        registry: JobRegistry::new(pipeline.clone()),
        external: Arc::new(ExternalSiteResolver::for_pipeline(fetcher, &pipeline)),
        pipeline,
        prometheus_handle: PrometheusBuilder::new().install_recorder()?,
    };
    let app = app(state, AuthState::from_env());

    let port: u16 = env_parse("PORT").unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "catmatch.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Headless run: one job, every chunk, then exit.
async fn sweep(pipeline: Pipeline) -> eyre::Result<()> {
    let delay = pipeline.config.chunk_delay;
    let job = jobs::BatchJob::new(pipeline);
    let info = job.run(delay).await?;
    info!(
        target = "catmatch.jobs",
        job_id = %info.id,
        status = info.state.status.as_str(),
        processed = info.state.processed_count,
        matched = info.state.counts.matched,
        unmatched = info.state.counts.unmatched,
        untouched = info.state.counts.untouched,
        remaining = info.state.remaining,
        "sweep_finished"
    );
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    registry: JobRegistry,
    external: Arc<ExternalSiteResolver>,
    prometheus_handle: PrometheusHandle,
}

fn app(state: AppState, auth: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/jobs/categorize", post(start_job))
        .route("/jobs/categorize/{id}", get(get_job_status))
        .route("/jobs/categorize/{id}/chunks", post(request_chunk))
        .route("/jobs/categorize/{id}/cancel", post(cancel_job))
        .route("/items/uncategorized", get(list_uncategorized))
        .route("/external/check", post(external_check))
        .route("/external/assign", post(external_assign))
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "catmatch",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn body_limit_from_env() -> usize {
    env_parse::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

#[derive(Debug, Serialize)]
struct StartResponse {
    job_id: String,
    chunk: ChunkResult,
}

/// Creates a job, sizes the sweep and runs chunk 0. Answers 409 while another job runs.
///
/// - Method: `POST`
/// - Path: `/jobs/categorize`
/// - Auth: `Authorization: Bearer <key>` or `X-Catmatch-Key: <key>`
async fn start_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<StartResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/categorize");
    let (job, chunk) = state.registry.start().await?;
    info!(
        target = "catmatch.api",
        job_id = %job.id(),
        org_id = %auth.org_id,
        api_key_id = %auth.api_key_id,
        "job_started_via_api"
    );
    Ok(Json(StartResponse {
        job_id: job.id().to_string(),
        chunk,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ChunkRequest {
    #[serde(default)]
    chunk_index: Option<usize>,
}

/// Runs the requested chunk, or the next one when no index is given.
async fn request_chunk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ChunkRequest>>,
) -> Result<Json<ChunkResult>, AppError> {
    crate::metrics::inc_requests("/jobs/categorize/chunks");
    let job = find_job(&state, &id).await?;
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let result = match request.chunk_index {
        Some(index) => job.request_chunk(index).await?,
        None => job.next_chunk().await?,
    };
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    job_id: String,
    status: JobStatus,
}

async fn cancel_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/categorize/cancel");
    let job = find_job(&state, &id).await?;
    let status = job.cancel().await?;
    info!(
        target = "catmatch.api",
        job_id = %job.id(),
        org_id = %auth.org_id,
        api_key_id = %auth.api_key_id,
        status = status.as_str(),
        "job_cancel_via_api"
    );
    Ok(Json(CancelResponse {
        job_id: job.id().to_string(),
        status,
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let job = find_job(&state, &id).await?;
    Ok(Json(job.snapshot().await))
}

async fn find_job(state: &AppState, id: &str) -> Result<Arc<jobs::BatchJob>, AppError> {
    let Ok(uuid) = Uuid::parse_str(id) else {
        return Err(PipelineError::invalid_input("jobs", "invalid_job_id").into());
    };
    state
        .registry
        .get(uuid)
        .await
        .ok_or_else(|| PipelineError::not_found("jobs", format!("job {uuid} not found")).into())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

async fn list_uncategorized(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ItemSummary>>, AppError> {
    crate::metrics::inc_requests("/items/uncategorized");
    let limit = match query.limit {
        Some(limit) => limit,
        None => state.pipeline.count_uncategorized().await?,
    };
    let items = state
        .pipeline
        .products()
        .list_uncategorized(limit, query.offset)
        .await
        .map_err(|err| PipelineError::internal("list_uncategorized", err.to_string()))?;
    Ok(Json(items.iter().map(ItemSummary::from).collect()))
}

#[derive(Debug, Deserialize)]
struct ExternalCheckRequest {
    #[serde(default)]
    item_ids: Option<Vec<ItemId>>,
    urls: Vec<String>,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExternalCheckResponse {
    results: Vec<ItemCategoryGuess>,
    all_categories: Vec<CategoryOption>,
}

/// Looks the given items (default: every uncategorized item) up on up to two sites.
async fn external_check(
    State(state): State<AppState>,
    Json(payload): Json<ExternalCheckRequest>,
) -> Result<Json<ExternalCheckResponse>, AppError> {
    crate::metrics::inc_requests("/external/check");
    let products = state.pipeline.products();
    let items: Vec<ItemSummary> = match payload.item_ids {
        Some(ids) => {
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                let item = products
                    .get_item(id)
                    .await
                    .map_err(|err| PipelineError::internal("get_item", err.to_string()))?
                    .ok_or_else(|| PipelineError::not_found("get_item", format!("item {id} not found")))?;
                items.push(ItemSummary::from(&item));
            }
            items
        }
        None => {
            let count = state.pipeline.count_uncategorized().await?;
            products
                .list_uncategorized(count, 0)
                .await
                .map_err(|err| PipelineError::internal("list_uncategorized", err.to_string()))?
                .iter()
                .map(ItemSummary::from)
                .collect()
        }
    };

    let results = state
        .external
        .check_sites_for_items(&items, &payload.urls, payload.instructions.as_deref())
        .await?;

    let sentinel = state.pipeline.config.uncategorized_name.trim().to_lowercase();
    let all_categories = state
        .pipeline
        .categories()
        .list_categories(true)
        .await
        .map_err(|err| PipelineError::internal("list_categories", err.to_string()))?
        .iter()
        .filter(|c| c.name.trim().to_lowercase() != sentinel)
        .map(CategoryOption::from)
        .collect();

    Ok(Json(ExternalCheckResponse {
        results,
        all_categories,
    }))
}

#[derive(Debug, Deserialize)]
struct ExternalAssignRequest {
    updates: Vec<CategoryUpdate>,
}

async fn external_assign(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<ExternalAssignRequest>,
) -> Result<Json<AssignReport>, AppError> {
    crate::metrics::inc_requests("/external/assign");
    if payload.updates.is_empty() {
        return Err(PipelineError::invalid_input("external_assign", "no updates given").into());
    }
    let report = external::assign_found_categories(&state.pipeline, &payload.updates).await;
    info!(
        target = "catmatch.api",
        org_id = %auth.org_id,
        api_key_id = %auth.api_key_id,
        assigned = report.assigned.len(),
        failed = report.failed.len(),
        "found_categories_assigned"
    );
    Ok(Json(report))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Authorization => StatusCode::UNAUTHORIZED,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::Config => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(target = "catmatch.api", stage = err.stage(), detail = err.detail(), "request_failed");
                }
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Scripted, StaticPages};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const KEY: &str = "secret";

    fn test_app(catalog: Arc<MemoryCatalog>, llm: Arc<Scripted>) -> Router {
        let pipeline = testing::pipeline(catalog, llm);
        let pages = StaticPages::new([(
            "https://shop.test",
            "<html><nav>Lighting</nav></html>",
        )]);
        let state = AppState {
            registry: JobRegistry::new(pipeline.clone()),
            external: Arc::new(ExternalSiteResolver::for_pipeline(pages, &pipeline)),
            pipeline,
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        app(state, AuthState::from_list(&format!("shop:{KEY}")))
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("X-Catmatch-Key", KEY)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri)
            .header("Authorization", format!("Bearer {KEY}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app(testing::catalog(0), Scripted::always("Shoes"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_routes_need_a_key() {
        let app = test_app(testing::catalog(1), Scripted::always("Shoes"));
        let response = app
            .oneshot(
                Request::post("/jobs/categorize")
                    .header("X-Catmatch-Key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "invalid_api_key");
    }

    #[tokio::test]
    async fn job_runs_chunk_by_chunk_over_http() {
        let catalog = testing::catalog(7);
        let app = test_app(catalog.clone(), Scripted::always("Shoes"));

        let response = app.clone().oneshot(post("/jobs/categorize", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let started = json_body(response).await;
        let job_id = started["job_id"].as_str().unwrap().to_string();
        assert_eq!(started["chunk"]["total_chunks"], 2);
        assert_eq!(started["chunk"]["next_chunk"], 1);
        assert_eq!(started["chunk"]["results"][0]["category"], "Shoes");

        let response = app
            .clone()
            .oneshot(post(&format!("/jobs/categorize/{job_id}/chunks"), json!({"chunk_index": 1})))
            .await
            .unwrap();
        let chunk = json_body(response).await;
        assert_eq!(chunk["status"], "completed");
        assert_eq!(chunk["remaining"], 0);

        let response = app
            .clone()
            .oneshot(get(&format!("/jobs/categorize/{job_id}")))
            .await
            .unwrap();
        let info = json_body(response).await;
        assert_eq!(info["status"], "completed");
        assert_eq!(info["processed_count"], 7);

        let response = app
            .oneshot(post(&format!("/jobs/categorize/{job_id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(catalog.count_uncategorized().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_start_conflicts_while_a_job_runs() {
        let catalog = testing::catalog(12);
        let app = test_app(catalog, Scripted::always("Shoes"));

        let response = app.clone().oneshot(post("/jobs/categorize", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job_id = json_body(response).await["job_id"].as_str().unwrap().to_string();

        let response = app.clone().oneshot(post("/jobs/categorize", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert!(body["detail"].as_str().unwrap().contains(&job_id));

        let response = app
            .clone()
            .oneshot(post(&format!("/jobs/categorize/{job_id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["status"], "cancelled");

        let response = app.oneshot(post("/jobs/categorize", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn concurrent_starts_never_sweep_twice() {
        let llm = Scripted::always("Shoes");
        let gate = llm.hold();
        let app = test_app(testing::catalog(5), llm.clone());

        let first = tokio::spawn(app.clone().oneshot(post("/jobs/categorize", json!({}))));
        llm.wait_for_calls(1).await;

        let response = app.oneshot(post("/jobs/categorize", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        gate.add_permits(100);

        let response = first.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(llm.calls(), 5);
    }

    #[tokio::test]
    async fn unknown_and_malformed_job_ids() {
        let app = test_app(testing::catalog(1), Scripted::always("Shoes"));
        let response = app.clone().oneshot(get("/jobs/categorize/not-a-uuid")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = app
            .oneshot(get(&format!("/jobs/categorize/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_completion_key_is_unavailable() {
        let app = test_app(testing::catalog(2), Scripted::unconfigured());
        let response = app.oneshot(post("/jobs/categorize", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn uncategorized_items_are_listed() {
        let app = test_app(testing::catalog(3), Scripted::always("Shoes"));
        let response = app.oneshot(get("/items/uncategorized?limit=2")).await.unwrap();
        let items = json_body(response).await;
        assert_eq!(items.as_array().unwrap().len(), 2);
        assert_eq!(items[0]["title"], "Item 1");
    }

    #[tokio::test]
    async fn external_check_then_assign() {
        let catalog = testing::catalog(2);
        catalog.ensure_category("Lighting").await.unwrap();
        let app = test_app(
            catalog.clone(),
            Scripted::always(r#"{"Item 1": "Lighting", "Item 2": "not found"}"#),
        );

        let response = app
            .clone()
            .oneshot(post("/external/check", json!({"urls": ["https://shop.test"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["results"][0]["category"], "Lighting");
        assert_eq!(body["results"][1]["category"], "not found");
        let names: Vec<&str> = body["all_categories"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"Lighting"));
        assert!(!names.contains(&"Uncategorized"));

        let response = app
            .oneshot(post(
                "/external/assign",
                json!({"updates": [
                    {"item_id": 1, "category": "Lighting"},
                    {"item_id": 2, "category": "not found"}
                ]}),
            ))
            .await
            .unwrap();
        let report = json_body(response).await;
        assert_eq!(report["assigned"], json!([1]));
        assert_eq!(report["failed"], json!([2]));
        assert_eq!(catalog.count_uncategorized().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn external_check_rejects_three_urls() {
        let app = test_app(testing::catalog(1), Scripted::always("{}"));
        let response = app
            .oneshot(post(
                "/external/check",
                json!({"urls": ["https://a.test", "https://b.test", "https://c.test"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
