//! Integration tests for non-navigation commands
//!
//! Verifies parameter encoding of list-style arguments and normalization of
//! the command-specific response fields.

use remfs_core::domain::{Command, CompareToken};
use remfs_core::ports::{ITransport, TransportRequest};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, id, CONNECTOR_PATH};

#[tokio::test]
async fn test_ls_with_intersect() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .and(query_param("cmd", "ls"))
        .and(query_param("target", "l1_Lw"))
        .and(query_param("intersect[]", "a.txt"))
        .and(query_param("intersect[]", "c.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "list": {"l1_YS50eHQ": "a.txt"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport
        .send(&TransportRequest::new(Command::Ls {
            target: id("l1_Lw"),
            intersect: vec!["a.txt".into(), "c.txt".into()],
        }))
        .await
        .unwrap();

    assert_eq!(response.listing.len(), 1);
    assert_eq!(response.listing.get("a.txt"), Some(&Some(id("l1_YS50eHQ"))));
}

#[tokio::test]
async fn test_rm_reports_removed_ids() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .and(query_param("cmd", "rm"))
        .and(query_param("targets[]", "l1_YS50eHQ"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "removed": ["l1_YS50eHQ"]
        })))
        .mount(&server)
        .await;

    let response = transport
        .send(&TransportRequest::new(Command::Rm {
            targets: vec![id("l1_YS50eHQ")],
        }))
        .await
        .unwrap();
    assert_eq!(response.removed, vec![id("l1_YS50eHQ")]);
}

#[tokio::test]
async fn test_mkdir_reports_added_entry() {
    let (server, transport) = common::setup_connector_mock().await;
    common::mount_get(
        &server,
        "mkdir",
        serde_json::json!({
            "added": [{
                "hash": "l1_bmV3", "phash": "l1_Lw", "name": "new",
                "mime": "directory", "read": 1, "write": 1
            }]
        }),
    )
    .await;

    let response = transport
        .send(&TransportRequest::new(Command::Mkdir {
            target: id("l1_Lw"),
            name: "new".into(),
        }))
        .await
        .unwrap();
    assert_eq!(response.added.len(), 1);
    assert!(response.added[0].is_directory);
    assert!(!response.added[0].is_root());
}

#[tokio::test]
async fn test_tmb_and_size() {
    let (server, transport) = common::setup_connector_mock().await;
    common::mount_get(
        &server,
        "tmb",
        serde_json::json!({"images": {"l1_YS50eHQ": "a.png"}}),
    )
    .await;
    common::mount_get(&server, "size", serde_json::json!({"size": "4096"})).await;

    let tmb = transport
        .send(&TransportRequest::new(Command::Tmb {
            targets: vec![id("l1_YS50eHQ")],
        }))
        .await
        .unwrap();
    assert_eq!(tmb.thumbnails.get(&id("l1_YS50eHQ")).map(String::as_str), Some("a.png"));

    let size = transport
        .send(&TransportRequest::new(Command::Size {
            targets: vec![id("l1_Lw")],
        }))
        .await
        .unwrap();
    assert_eq!(size.size, Some(4096));
}

#[tokio::test]
async fn test_compare_token_round_trip_unchanged() {
    let (server, transport) = common::setup_connector_mock().await;
    let token = CompareToken::new(2, None);
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .and(query_param("cmd", "open"))
        .and(query_param("compare", token.to_wire().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "unchanged": 1,
            "compare": token.to_wire()
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport
        .send(&TransportRequest::new(Command::Open {
            target: Some(id("l1_Lw")),
            init: false,
            tree: false,
            compare: Some(token),
        }))
        .await
        .unwrap();
    assert!(response.unchanged);
    assert_eq!(response.compare_token, Some(token));
}
