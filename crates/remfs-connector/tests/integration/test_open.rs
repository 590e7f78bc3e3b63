//! Integration tests for the `open` command and response handling
//!
//! Verifies that HttpTransport encodes `open`, normalizes the connector
//! payload (cwd, options, files, limits) and maps failure statuses.

use remfs_core::domain::{Command, EntryId};
use remfs_core::ports::{Encoding, ITransport, TransportError, TransportRequest};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, id, CONNECTOR_PATH};

fn open_request(target: Option<EntryId>, init: bool) -> TransportRequest {
    TransportRequest::new(Command::Open {
        target,
        init,
        tree: false,
        compare: None,
    })
}

#[tokio::test]
async fn test_open_init_normalizes_payload() {
    let (server, transport) = common::setup_connector_mock().await;
    common::mount_open(&server).await;

    let response = transport
        .send(&open_request(None, true))
        .await
        .expect("open failed");

    let cwd = response.cwd.clone().expect("cwd present");
    assert_eq!(cwd.id, id("l1_Lw"));
    assert!(cwd.is_root());
    assert!(cwd.is_directory);
    let options = cwd.volume_options.expect("root carries options");
    assert_eq!(options.disabled, vec!["mkfile".to_string()]);
    assert!(options.copy_overwrite);
    assert!(!options.upload_overwrite);
    assert_eq!(options.upload_max_size, Some(2 * 1024 * 1024));

    assert_eq!(response.files.len(), 3);
    let a = response
        .files
        .iter()
        .find(|e| e.name == "a.txt")
        .expect("a.txt listed");
    assert_eq!(a.parent_id, Some(id("l1_Lw")));
    assert_eq!(a.size, Some(10));
    assert_eq!(a.mime.as_deref(), Some("text/plain"));

    assert_eq!(response.api.as_deref(), Some("2.1"));
    assert_eq!(response.upload_max_size, Some(134_217_728));
    assert!(!response.is_error());
}

#[tokio::test]
async fn test_open_sends_init_flag_in_query() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .and(query_param("cmd", "open"))
        .and(query_param("init", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cwd": common::root_json(),
            "files": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport.send(&open_request(None, true)).await.unwrap();
    assert!(response.files.is_empty());
}

#[tokio::test]
async fn test_body_encoding_posts_form() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("POST"))
        .and(path(CONNECTOR_PATH))
        .and(body_string_contains("cmd=open"))
        .and(body_string_contains("target=l1_Lw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "cwd": common::root_json(),
            "files": [common::root_json()]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut request = open_request(Some(id("l1_Lw")), false);
    request.encoding = Encoding::Body;
    let response = transport.send(&request).await.unwrap();
    assert_eq!(response.files.len(), 1);
}

#[tokio::test]
async fn test_status_414_maps_to_uri_too_long() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .respond_with(ResponseTemplate::new(414))
        .mount(&server)
        .await;

    let result = transport.send(&open_request(Some(id("l1_Lw")), false)).await;
    assert_eq!(result.unwrap_err(), TransportError::UriTooLong);
}

#[tokio::test]
async fn test_server_error_maps_to_http() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let result = transport.send(&open_request(Some(id("l1_Lw")), false)).await;
    assert_eq!(
        result.unwrap_err(),
        TransportError::Http {
            status: 500,
            message: "boom".to_string(),
        }
    );
}

#[tokio::test]
async fn test_connector_error_is_not_transport_error() {
    let (server, transport) = common::setup_connector_mock().await;
    common::mount_get(&server, "open", serde_json::json!({"error": ["errOpen", "#l1_Lw"]})).await;

    let response = transport
        .send(&open_request(Some(id("l1_Lw")), false))
        .await
        .expect("body-level errors are successful transports");
    assert!(response.is_error());
    assert_eq!(
        response.error,
        Some(vec!["errOpen".to_string(), "#l1_Lw".to_string()])
    );
}

#[tokio::test]
async fn test_non_json_body_is_invalid_response() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let result = transport.send(&open_request(Some(id("l1_Lw")), false)).await;
    assert!(matches!(result, Err(TransportError::InvalidResponse(_))));
}
