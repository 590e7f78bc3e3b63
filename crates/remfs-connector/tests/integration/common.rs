//! Shared test helpers for connector integration tests
//!
//! Provides wiremock-based mock server setup for the connector endpoint.
//! Each helper mounts the necessary mocks and returns an HttpTransport
//! pointing at the mock server.

use remfs_connector::{ConnectorClient, HttpTransport};
use remfs_core::domain::EntryId;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path the mock connector listens on
pub const CONNECTOR_PATH: &str = "/connector";

/// Starts a mock server and returns it with a transport pointed at it
pub async fn setup_connector_mock() -> (MockServer, HttpTransport) {
    let server = MockServer::start().await;
    let client = ConnectorClient::new(&format!("{}{}", server.uri(), CONNECTOR_PATH))
        .expect("mock server URL is valid");
    (server, HttpTransport::new(client))
}

pub fn id(s: &str) -> EntryId {
    EntryId::new(s).unwrap()
}

/// Volume root of the mock connector
pub fn root_json() -> serde_json::Value {
    serde_json::json!({
        "hash": "l1_Lw",
        "name": "Home",
        "mime": "directory",
        "ts": 1700000000,
        "read": 1,
        "write": 1,
        "locked": 0,
        "dirs": 1,
        "volumeid": "l1_"
    })
}

/// A file inside the volume root
pub fn file_json(hash: &str, name: &str, size: u64) -> serde_json::Value {
    serde_json::json!({
        "hash": hash,
        "phash": "l1_Lw",
        "name": name,
        "mime": "text/plain",
        "size": size,
        "ts": 1700000100,
        "read": 1,
        "write": 1,
        "locked": 0
    })
}

/// Mounts a GET handler for one command that answers with `body`
pub async fn mount_get(server: &MockServer, cmd: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(CONNECTOR_PATH))
        .and(query_param("cmd", cmd))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Mounts the `open` command with the volume root, two files and options
pub async fn mount_open(server: &MockServer) {
    mount_get(
        server,
        "open",
        serde_json::json!({
            "cwd": root_json(),
            "options": {
                "path": "Home",
                "url": "/media/",
                "tmbUrl": "/media/.tmb/",
                "separator": "/",
                "disabled": ["mkfile"],
                "copyOverwrite": 1,
                "uploadOverwrite": 0,
                "uploadMaxSize": "2M"
            },
            "files": [
                root_json(),
                file_json("l1_YS50eHQ", "a.txt", 10),
                file_json("l1_Yi50eHQ", "b.txt", 20)
            ],
            "api": "2.1",
            "uplMaxSize": 134217728
        }),
    )
    .await;
}
