//! Emby client against a mock HTTP server.

use std::path::PathBuf;
use std::time::Duration;

use linkmirror::notifications::emby::{EmbyClient, MediaServerClient};
use lm_core::config::NotifyConfig;
use lm_core::Error;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> EmbyClient {
    EmbyClient::new(&server.uri(), "secret-key", Duration::from_secs(5))
}

#[tokio::test]
async fn lists_sections_with_locations() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/emby/Library/VirtualFolders"))
        .and(header("X-Emby-Token", "secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"Name": "Movies", "ItemId": "11", "Locations": ["/mnt/links/Movies"]},
            {"Name": "Shows", "ItemId": "22", "Locations": ["/mnt/links/Shows", "/mnt/links/Anime"]},
            {"Name": "Broken", "Locations": []}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let sections = client(&server).list_sections().await.unwrap();

    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].id, "11");
    assert_eq!(sections[0].name, "Movies");
    assert_eq!(sections[0].locations, vec![PathBuf::from("/mnt/links/Movies")]);
    assert_eq!(sections[1].locations.len(), 2);
}

#[tokio::test]
async fn refresh_posts_recursive_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/emby/Items/11/Refresh"))
        .and(query_param("Recursive", "true"))
        .and(header("X-Emby-Token", "secret-key"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).refresh_section("11").await.unwrap();
}

#[tokio::test]
async fn server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/emby/Items/11/Refresh"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting up"))
        .mount(&server)
        .await;

    let err = client(&server).refresh_section("11").await.unwrap_err();
    assert!(matches!(err, Error::TransientSource(_)), "got {err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn rejected_requests_are_notification_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/emby/Items/99/Refresh"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such item"))
        .mount(&server)
        .await;

    let err = client(&server).refresh_section("99").await.unwrap_err();
    assert!(matches!(err, Error::Notification(_)), "got {err:?}");
    assert_eq!(err.kind(), "notification");
}

#[tokio::test]
async fn garbled_listing_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/emby/Library/VirtualFolders"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = client(&server).list_sections().await.unwrap_err();
    assert!(matches!(err, Error::Notification(_)));
}

#[tokio::test]
async fn ping_hits_public_info() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/emby/System/Info/Public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ServerName": "emby"})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).ping().await.unwrap();
}

#[tokio::test]
async fn unreachable_server_fails_ping() {
    // Nothing listens on the discard port.
    let client = EmbyClient::new("http://127.0.0.1:9", "k", Duration::from_millis(500));
    assert!(client.ping().await.is_err());
}

#[test]
fn from_config_requires_enabled_and_url() {
    let mut config = NotifyConfig::default();
    config.server_url = Some("http://emby:8096".into());
    config.enabled = false;
    assert!(EmbyClient::from_config(&config).is_none());

    config.enabled = true;
    assert!(EmbyClient::from_config(&config).is_some());

    config.server_url = Some(String::new());
    assert!(EmbyClient::from_config(&config).is_none());
}
