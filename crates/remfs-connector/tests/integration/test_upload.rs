//! Integration tests for multipart uploads
//!
//! Verifies the three upload shapes (whole files, chunk, merge) reach the
//! connector as multipart bodies with the expected fields.

use remfs_core::domain::{ChunkDescriptor, Command, MergeToken, UploadFile, UploadPayload};
use remfs_core::ports::{ITransport, TransportRequest};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, id, CONNECTOR_PATH};

fn upload_file(name: &str, data: &[u8]) -> UploadFile {
    UploadFile {
        name: name.to_string(),
        data: data.to_vec(),
        mime: Some("text/plain".to_string()),
    }
}

#[tokio::test]
async fn test_upload_whole_files_multipart() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("POST"))
        .and(path(CONNECTOR_PATH))
        .and(body_string_contains("name=\"upload[]\"; filename=\"a.txt\""))
        .and(body_string_contains("name=\"upload[]\"; filename=\"b.txt\""))
        .and(body_string_contains("hello a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "added": [
                common::file_json("l1_YS50eHQ", "a.txt", 7),
                common::file_json("l1_Yi50eHQ", "b.txt", 7)
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport
        .send(&TransportRequest::new(Command::Upload(UploadPayload::Files {
            target: id("l1_Lw"),
            files: vec![upload_file("a.txt", b"hello a"), upload_file("b.txt", b"hello b")],
            overwrite: false,
        })))
        .await
        .unwrap();
    assert_eq!(response.added.len(), 2);
}

#[tokio::test]
async fn test_upload_chunk_returns_merge_token() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("POST"))
        .and(path(CONNECTOR_PATH))
        .and(body_string_contains("big.bin.1_1.part"))
        .and(body_string_contains("5,5,10"))
        .and(body_string_contains("cid-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "added": [],
            "_chunkmerged": "big.bin.merged",
            "_name": "big.bin"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport
        .send(&TransportRequest::new(Command::Upload(UploadPayload::Chunk {
            target: id("l1_Lw"),
            file: upload_file("big.bin", b"56789"),
            chunk: ChunkDescriptor {
                cid: "cid-1".into(),
                index: 1,
                total: 2,
                offset: 5,
                length: 5,
                file_size: 10,
            },
            overwrite: false,
        })))
        .await
        .unwrap();

    assert_eq!(response.merge_token.unwrap().as_str(), "big.bin.merged");
    assert_eq!(response.merged_name.as_deref(), Some("big.bin"));
    assert!(response.added.is_empty());
}

#[tokio::test]
async fn test_upload_merge_commits_file() {
    let (server, transport) = common::setup_connector_mock().await;
    Mock::given(method("POST"))
        .and(path(CONNECTOR_PATH))
        .and(body_string_contains("name=\"_name\""))
        .and(body_string_contains("big.bin.merged"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "added": [common::file_json("l1_YmlnLmJpbg", "big.bin", 10)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = transport
        .send(&TransportRequest::new(Command::Upload(UploadPayload::Merge {
            target: id("l1_Lw"),
            token: MergeToken::new("big.bin.merged").unwrap(),
            name: "big.bin".into(),
            overwrite: false,
        })))
        .await
        .unwrap();
    assert_eq!(response.added[0].name, "big.bin");
}
