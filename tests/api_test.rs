//! API integration tests.
//!
//! Tests the status and control endpoints against a [`TestHarness`] server
//! running on a random port with an in-memory SQLite database.

mod common;

use common::TestHarness;
use linkmirror::reconciler::Reconciler;
use linkmirror::sources::Intake;
use lm_core::{ChangeEvent, ChangeSource, Observation};

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_every_dependency() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    let json: serde_json::Value = resp.json().await.unwrap();

    let names: Vec<&str> = json["checks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["mount", "remote_api", "media_server", "store", "disk"]);
    assert_eq!(json["checks"][0]["healthy"], true);
    assert_eq!(json["checks"][1]["detail"], "disabled");
    assert_eq!(json["checks"][3]["healthy"], true);

    workers.stop().await;
}

#[tokio::test]
async fn health_is_503_when_mount_is_down() {
    let h = TestHarness::new();
    h.probe.set_ready(false);
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 503);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["healthy"], false);
    assert_eq!(json["checks"][0]["name"], "mount");
    assert_eq!(json["checks"][0]["healthy"], false);

    workers.stop().await;
}

#[tokio::test]
async fn unreachable_media_server_is_unhealthy() {
    let h = TestHarness::new();
    h.media.set_reachable(false);
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 503);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["checks"][2]["name"], "media_server");
    assert_eq!(json["checks"][2]["healthy"], false);

    workers.stop().await;
}

// ---------------------------------------------------------------------------
// Status and inventory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_reports_queue_and_inventory() {
    let h = TestHarness::new();
    h.write_source("Movies/A.mkv", b"movie");
    h.write_source("Movies/A.nfo", b"<xml/>");
    h.sync().await;
    let (workers, addr) = h.with_server().await;

    let json: serde_json::Value = reqwest::get(format!("http://{addr}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(json["queue"]["depth"], 0);
    assert_eq!(json["dead_letters"], 0);
    assert_eq!(json["retrying"], 0);
    assert_eq!(json["inventory"]["linked"], 2);
    assert_eq!(json["inventory"]["unlinked"], 1);
    assert_eq!(json["paused"]["remote"], false);
    assert!(json["recent_events"].is_array());

    workers.stop().await;
}

#[tokio::test]
async fn inventory_is_paged_and_filtered() {
    let h = TestHarness::new();
    h.write_source("Movies/A.mkv", b"a");
    h.write_source("Movies/B.mkv", b"b");
    h.write_source("Shows/S1/E1.mkv", b"e1");
    h.sync().await;
    let (workers, addr) = h.with_server().await;

    let page: serde_json::Value = reqwest::get(format!("http://{addr}/api/inventory?prefix=Movies&limit=2"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let paths: Vec<&str> = page["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["Movies", "Movies/A.mkv"]);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["entries"][1]["state"], "linked");

    let page: serde_json::Value = reqwest::get(format!("http://{addr}/api/inventory?pattern=*E1.mkv"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["entries"].as_array().unwrap().len(), 1);
    assert_eq!(page["entries"][0]["path"], "Shows/S1/E1.mkv");

    workers.stop().await;
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_letter_can_be_listed_and_retried() {
    let h = TestHarness::new();
    h.write_source("Movies/A.mkv", b"movie");
    h.sync().await;
    let (workers, addr) = h.with_server().await;

    let reconciler = Reconciler::new(workers.context());
    let late = Observation::file("Movies/Late.mkv", 5, 1);
    reconciler
        .handle(Intake::Event(ChangeEvent::created(ChangeSource::Remote, late)))
        .await
        .unwrap();
    workers.drain().await;

    let letters: serde_json::Value = reqwest::get(format!("http://{addr}/api/dead-letters"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(letters.as_array().unwrap().len(), 1);
    assert_eq!(letters[0]["path"], "Movies/Late.mkv");
    assert_eq!(letters[0]["error_kind"], "transient_source");
    let id = letters[0]["id"].as_i64().unwrap();

    h.write_source("Movies/Late.mkv", b"later");
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/dead-letters/{id}/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["dead_letter"], id);
    assert!(body["operation_id"].is_string());

    workers.drain().await;
    assert!(h.link_at("Movies/Late.mkv").is_some());

    // Already resolved.
    let resp = client
        .post(format!("http://{addr}/api/dead-letters/{id}/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let unresolved: serde_json::Value = reqwest::get(format!("http://{addr}/api/dead-letters"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(unresolved.as_array().unwrap().is_empty());
    let all: serde_json::Value = reqwest::get(format!("http://{addr}/api/dead-letters?include_resolved=true"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_array().unwrap().len(), 1);

    workers.stop().await;
}

#[tokio::test]
async fn retrying_unknown_dead_letter_is_404() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/dead-letters/999/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "not_found");

    workers.stop().await;
}

// ---------------------------------------------------------------------------
// Controls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn adapters_can_be_paused_and_resumed() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/adapters/remote/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["adapter"], "remote");
    assert_eq!(json["paused"], true);
    assert_eq!(json["changed"], true);

    let json: serde_json::Value = client
        .post(format!("http://{addr}/api/adapters/remote/pause"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["changed"], false);

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["paused"]["remote"], true);
    assert_eq!(status["paused"]["local"], false);

    let json: serde_json::Value = client
        .post(format!("http://{addr}/api/adapters/remote/resume"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["paused"], false);
    assert_eq!(json["changed"], true);

    workers.stop().await;
}

#[tokio::test]
async fn unknown_adapter_or_action_is_400() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/adapters/ftp/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["code"], "validation");

    let resp = client
        .post(format!("http://{addr}/api/adapters/local/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    workers.stop().await;
}

#[tokio::test]
async fn scan_request_is_accepted() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/scan"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["scan"], "requested");

    workers.stop().await;
}

#[tokio::test]
async fn flush_delivers_pending_refreshes() {
    let h = TestHarness::new();
    h.write_source("Movies/A.mkv", b"movie");
    h.sync().await;
    h.media.take_refreshes();
    let (workers, addr) = h.with_server().await;

    h.write_source("Shows/S1/E1.mkv", b"episode");
    let reconciler = Reconciler::new(workers.context());
    let obs = common::file_observation(h.source.path(), "Shows/S1/E1.mkv");
    reconciler
        .handle(Intake::Event(ChangeEvent::created(ChangeSource::Local, obs)))
        .await
        .unwrap();
    workers.context().queue.wait_idle().await;
    // Held until the idle window or an explicit flush.
    assert!(h.media.refreshes().is_empty());

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/notifications/flush"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json["sections"], serde_json::json!(["shows"]));
    assert_eq!(h.media.refreshes(), vec!["shows".to_string()]);

    workers.stop().await;
}

#[tokio::test]
async fn config_reload_without_file_is_rejected() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/config/reload"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    workers.stop().await;
}

#[tokio::test]
async fn unknown_route_is_404() {
    let h = TestHarness::new();
    let (workers, addr) = h.with_server().await;

    let resp = reqwest::get(format!("http://{addr}/api/nonexistent")).await.unwrap();
    assert_eq!(resp.status(), 404);

    workers.stop().await;
}
