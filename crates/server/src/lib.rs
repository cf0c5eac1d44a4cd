use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tablehub_engine::{EngineError, SyncCoordinator};
use tablehub_protocol::{PullResponse, SyncRequest, SyncResponse, Table, ROOT_CURSOR};

#[cfg(test)]
mod tests;

/// Runtime configuration read once at startup and handed to every handler
/// through [`AppState`]. Mirrors the environment-variable surface documented
/// for this service; CLI flags in `main.rs` overlay these the way they
/// overlay defaults anywhere else in this codebase.
#[derive(Clone, Debug)]
pub struct Config {
    pub cors_origins: Vec<String>,
    pub debug: bool,
    pub max_sync_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
                "http://localhost:8080".to_string(),
            ],
            debug: true,
            max_sync_batch_size: 100,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub config: Config,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    let debug = state.config.debug;

    let mut router = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/api/sync", post(sync_push).get(sync_pull))
        .route(
            "/api/tables",
            get(api_tables_list).post(api_tables_create),
        )
        .route(
            "/api/tables/{id}",
            get(api_tables_get)
                .put(api_tables_update)
                .patch(api_tables_patch)
                .delete(api_tables_delete),
        )
        .route("/api/export.json", get(api_export_json))
        .route("/api/export.csv", get(api_export_csv));

    if debug {
        router = router
            .route("/api/debug/events", get(api_debug_events))
            .route("/api/debug/reset", axum::routing::delete(api_debug_reset));
    }

    router
        .with_state(Arc::new(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
        .allow_origin(parsed)
}

/// Maps storage/internal faults to an HTTP response. Applier conflicts never
/// reach this path — they're reported in-band via [`SyncResponse::conflicts`].
fn internal_error(ctx: &'static str) -> impl FnOnce(EngineError) -> Response {
    move |e| {
        tracing::error!(error = %e, context = ctx, "engine error");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{ctx}: {e}")).into_response()
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "TableHub backend is running",
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    version: &'static str,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now(),
        version: "1.0.0",
    })
}

async fn sync_push(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Response {
    if req.ops.len() > state.config.max_sync_batch_size {
        return (
            StatusCode::BAD_REQUEST,
            format!(
                "batch of {} operations exceeds the limit of {}",
                req.ops.len(),
                state.config.max_sync_batch_size
            ),
        )
            .into_response();
    }

    match state
        .coordinator
        .process_sync(&req.client_id, &req.base_cursor, req.ops)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            // The push handler never surfaces a 5xx for its own failure: the
            // caller already sent state, so the response carries the error
            // in-band and echoes the base cursor back, same as any other
            // failed-to-advance push.
            tracing::error!(error = %e, "sync push failed");
            Json(SyncResponse {
                success: false,
                cursor: req.base_cursor,
                deltas: Vec::new(),
                conflicts: Vec::new(),
                error: Some(e.to_string()),
            })
            .into_response()
        }
    }
}

#[derive(Deserialize)]
struct SyncPullQuery {
    #[serde(default = "default_since")]
    since: String,
    #[serde(default = "default_pull_limit")]
    limit: i64,
}

fn default_since() -> String {
    ROOT_CURSOR.to_string()
}

fn default_pull_limit() -> i64 {
    500
}

async fn sync_pull(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SyncPullQuery>,
) -> Result<Json<PullResponse>, Response> {
    let resp = state
        .coordinator
        .get_changes_since(&q.since, q.limit)
        .await
        .map_err(internal_error("sync pull"))?;
    Ok(Json(resp))
}

async fn api_tables_list(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, Response> {
    let tables = state
        .coordinator
        .store()
        .get_all_tables()
        .await
        .map_err(internal_error("list tables"))?;
    Ok(Json(serde_json::json!({ "tables": tables })))
}

async fn api_tables_create(
    State(state): State<Arc<AppState>>,
    Json(table): Json<Table>,
) -> Result<Json<serde_json::Value>, Response> {
    state
        .coordinator
        .store()
        .create_table(&table)
        .await
        .map_err(internal_error("create table"))?;
    Ok(Json(
        serde_json::json!({ "id": table.id, "message": "Table created successfully" }),
    ))
}

async fn api_tables_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Table>, Response> {
    match state.coordinator.store().get_table(&id).await {
        Ok(Some(table)) => Ok(Json(table)),
        Ok(None) => Err((StatusCode::NOT_FOUND, "Table not found").into_response()),
        Err(e) => Err(internal_error("get table")(e)),
    }
}

async fn api_tables_update(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(table): Json<Table>,
) -> Result<Json<serde_json::Value>, Response> {
    let updated = state
        .coordinator
        .store()
        .update_table(&id, &table)
        .await
        .map_err(internal_error("update table"))?;
    if !updated {
        return Err((StatusCode::NOT_FOUND, "Table not found").into_response());
    }
    Ok(Json(
        serde_json::json!({ "message": "Table updated successfully" }),
    ))
}

async fn api_tables_patch(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(updates): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>, Response> {
    let store = state.coordinator.store();
    let Some(table) = store.get_table(&id).await.map_err(internal_error("patch table"))? else {
        return Err((StatusCode::NOT_FOUND, "Table not found").into_response());
    };

    let mut value = serde_json::to_value(&table)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())?;
    if let Some(obj) = value.as_object_mut() {
        for (k, v) in updates {
            obj.insert(k, v);
        }
    }
    let table: Table = serde_json::from_value(value)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;

    store
        .update_table(&id, &table)
        .await
        .map_err(internal_error("patch table"))?;
    Ok(Json(
        serde_json::json!({ "message": "Table patched successfully" }),
    ))
}

async fn api_tables_delete(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let deleted = state
        .coordinator
        .store()
        .delete_table(&id)
        .await
        .map_err(internal_error("delete table"))?;
    if !deleted {
        return Err((StatusCode::NOT_FOUND, "Table not found").into_response());
    }
    Ok(Json(
        serde_json::json!({ "message": "Table deleted successfully" }),
    ))
}

#[derive(Serialize)]
struct ExportMeta {
    exported_at: chrono::DateTime<chrono::Utc>,
    table_count: usize,
    version: &'static str,
}

#[derive(Serialize)]
struct ExportJson {
    meta: ExportMeta,
    tables: Vec<Table>,
}

async fn api_export_json(State(state): State<Arc<AppState>>) -> Result<Response, Response> {
    let tables = state
        .coordinator
        .store()
        .get_all_tables()
        .await
        .map_err(internal_error("export json"))?;
    let body = ExportJson {
        meta: ExportMeta {
            exported_at: chrono::Utc::now(),
            table_count: tables.len(),
            version: "1.0.0",
        },
        tables,
    };
    let filename = format!(
        "tablehub-export-{}.json",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    );
    Ok((
        [(
            axum::http::header::CONTENT_DISPOSITION,
            format!("attachment; filename={filename}"),
        )],
        Json(body),
    )
        .into_response())
}

async fn api_export_csv(State(state): State<Arc<AppState>>) -> Result<Response, Response> {
    let tables = state
        .coordinator
        .store()
        .get_all_tables()
        .await
        .map_err(internal_error("export csv"))?;

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for table in &tables {
        writer
            .write_record([format!("Table: {}", table.name)])
            .map_err(csv_error)?;
        writer.write_record(&table.headers).map_err(csv_error)?;
        for row in &table.rows {
            writer.write_record(&row.cells).map_err(csv_error)?;
        }
        writer.write_record::<_, &str>([]).map_err(csv_error)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())?;

    let filename = format!(
        "tablehub-export-{}.csv",
        chrono::Utc::now().format("%Y%m%d-%H%M%S")
    );
    Ok((
        [
            (axum::http::header::CONTENT_TYPE, "text/csv".to_string()),
            (
                axum::http::header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        bytes,
    )
        .into_response())
}

fn csv_error(e: csv::Error) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

#[derive(Deserialize)]
struct DebugEventsQuery {
    #[serde(default = "default_debug_limit")]
    limit: i64,
}

fn default_debug_limit() -> i64 {
    100
}

async fn api_debug_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DebugEventsQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let events = state
        .coordinator
        .store()
        .recent_events(q.limit)
        .await
        .map_err(internal_error("get events"))?;
    Ok(Json(serde_json::json!({ "events": events })))
}

async fn api_debug_reset(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, Response> {
    state
        .coordinator
        .store()
        .reset()
        .await
        .map_err(internal_error("reset database"))?;
    Ok(Json(
        serde_json::json!({ "message": "Database reset successfully" }),
    ))
}

/// Bind `addr`, construct the coordinator over `database_url`, and serve
/// until `shutdown` resolves. Returns the address actually bound (useful
/// when `addr`'s port is `0`).
pub async fn serve(
    addr: SocketAddr,
    database_url: &str,
    config: Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(listener, database_url, config, shutdown).await
}

pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    database_url: &str,
    config: Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let store = tablehub_engine::open_store(database_url).await?;
    let coordinator = Arc::new(SyncCoordinator::new(store));
    let state = AppState { coordinator, config };
    let app = build_router(state);
    let addr = listener.local_addr()?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(addr)
}
