use super::*;
use axum::body::{to_bytes, Body};
use axum::http::Request;
use std::sync::Arc;
use tablehub_engine::{SqliteStore, Store};
use tower::ServiceExt;

async fn test_router() -> Router {
    let store = SqliteStore::open_in_memory().expect("open sqlite");
    store.init().await.expect("init schema");
    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(store)));
    build_router(AppState {
        coordinator,
        config: Config::default(),
    })
}

async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = test_router().await;
    let resp = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], "1.0.0");
}

#[tokio::test]
async fn create_then_get_table_round_trips() {
    let app = test_router().await;
    let table = serde_json::json!({
        "id": "t1",
        "name": "Sheet1",
        "headers": ["A", "B"],
        "rows": [],
        "updatedAt": chrono::Utc::now().to_rfc3339(),
        "version": 1,
    });

    let create = app
        .clone()
        .oneshot(
            Request::post("/api/tables")
                .header("content-type", "application/json")
                .body(Body::from(table.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::OK);

    let get = app
        .oneshot(Request::get("/api/tables/t1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    let body = body_json(get).await;
    assert_eq!(body["name"], "Sheet1");
}

#[tokio::test]
async fn get_missing_table_is_404() {
    let app = test_router().await;
    let resp = app
        .oneshot(
            Request::get("/api/tables/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sync_push_reports_conflict_for_unknown_table() {
    let app = test_router().await;
    let req = serde_json::json!({
        "clientId": "alice",
        "baseCursor": "0",
        "ops": [{"op": "setCell", "tableId": "ghost", "rowId": "r1", "col": 0, "value": "x", "ts": 1}],
    });
    let resp = app
        .oneshot(
            Request::post("/api/sync")
                .header("content-type", "application/json")
                .body(Body::from(req.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["conflicts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sync_push_over_batch_limit_is_rejected() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.init().await.unwrap();
    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(store)));
    let app = build_router(AppState {
        coordinator,
        config: Config {
            max_sync_batch_size: 1,
            ..Config::default()
        },
    });

    let req = serde_json::json!({
        "clientId": "alice",
        "baseCursor": "0",
        "ops": [
            {"op": "addRow", "tableId": "t1", "rowId": "r1", "ts": 1},
            {"op": "addRow", "tableId": "t1", "rowId": "r2", "ts": 2},
        ],
    });
    let resp = app
        .oneshot(
            Request::post("/api/sync")
                .header("content-type", "application/json")
                .body(Body::from(req.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pull_from_root_cursor_includes_tables() {
    let app = test_router().await;
    let resp = app
        .oneshot(
            Request::get("/api/sync?since=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert!(body["tables"].is_array());
}

#[tokio::test]
async fn export_csv_contains_table_banner() {
    let app = test_router().await;
    let table = serde_json::json!({
        "id": "t1",
        "name": "Sheet1",
        "headers": ["A"],
        "rows": [],
        "updatedAt": chrono::Utc::now().to_rfc3339(),
        "version": 1,
    });
    app.clone()
        .oneshot(
            Request::post("/api/tables")
                .header("content-type", "application/json")
                .body(Body::from(table.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let resp = app
        .oneshot(
            Request::get("/api/export.csv")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("Table: Sheet1"));
}

#[tokio::test]
async fn debug_endpoints_absent_when_debug_disabled() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.init().await.unwrap();
    let coordinator = Arc::new(SyncCoordinator::new(Arc::new(store)));
    let app = build_router(AppState {
        coordinator,
        config: Config {
            debug: false,
            ..Config::default()
        },
    });
    let resp = app
        .oneshot(
            Request::get("/api/debug/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
