//! Router tests driven through `tower::ServiceExt::oneshot`, no socket.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::TestHarness;
use linkmirror::server::create_router;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_route_serves_json() {
    let h = TestHarness::new();
    let workers = h.start();
    let app = create_router(workers.context().clone());

    let response = app
        .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["queue"]["in_flight"], 0);
    assert_eq!(json["paused"]["scan"], false);

    workers.stop().await;
}

#[tokio::test]
async fn pausing_scan_is_visible_in_controls() {
    let h = TestHarness::new();
    let workers = h.start();
    let app = create_router(workers.context().clone());

    let response = app
        .oneshot(
            Request::post("/api/adapters/scan/pause")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(workers
        .context()
        .controls
        .is_paused(linkmirror::context::Adapter::Scan));

    workers.stop().await;
}

#[tokio::test]
async fn get_on_post_route_is_rejected() {
    let h = TestHarness::new();
    let workers = h.start();
    let app = create_router(workers.context().clone());

    let response = app
        .oneshot(Request::get("/api/scan").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    workers.stop().await;
}

#[tokio::test]
async fn inventory_limit_is_clamped() {
    let h = TestHarness::new();
    let workers = h.start();
    let app = create_router(workers.context().clone());

    let response = app
        .oneshot(
            Request::get("/api/inventory?limit=50000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["limit"], 1000);
    assert_eq!(json["total"], 0);

    workers.stop().await;
}

#[tokio::test]
async fn config_reload_picks_up_file_changes() {
    let h = TestHarness::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("linkmirror.toml");
    let write = |workers: usize| {
        std::fs::write(
            &path,
            format!(
                "[source]\nroot = \"{}\"\n\n[target]\nbase = \"{}\"\n\n[queue]\nmax_workers = {workers}\n",
                h.source.path().display(),
                h.target.path().display()
            ),
        )
        .unwrap();
    };
    write(2);

    let service = linkmirror::service::Service::with_dependencies(
        h.config.clone(),
        Some(path.clone()),
        h.db.clone(),
        linkmirror::service::Dependencies {
            probe: h.probe.clone(),
            remote: None,
            media_server: None,
        },
    );
    let workers = service.start_workers().unwrap();
    let app = create_router(workers.context().clone());

    write(7);
    let response = app
        .oneshot(Request::post("/api/config/reload").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["reloaded"], true);
    assert_eq!(workers.context().config.current().queue.max_workers, 7);

    workers.stop().await;
}
