//! HttpTransport - ITransport implementation for HTTP connectors
//!
//! Wraps the [`ConnectorClient`] and delegates to [`crate::wire`] and
//! [`crate::upload`] to fulfil the [`ITransport`] port contract.
//!
//! ## Design Notes
//!
//! - `Encoding::Query` sends `GET` with a query string; `Encoding::Body`
//!   sends `POST` with a form body. Upload payloads are always multipart.
//! - Timeouts are the dispatcher's concern: it drops the `send` future when
//!   its deadline passes, so no per-request timeout is set here.

use async_trait::async_trait;
use remfs_core::domain::Command;
use remfs_core::ports::{Encoding, ITransport, NormalizedResponse, TransportError, TransportRequest};
use tracing::{debug, instrument};

use crate::client::ConnectorClient;
use crate::upload::build_form;
use crate::wire::encode_params;

/// [`ITransport`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ConnectorClient,
}

impl HttpTransport {
    pub fn new(client: ConnectorClient) -> Self {
        Self { client }
    }

    /// Returns the underlying client
    pub fn client(&self) -> &ConnectorClient {
        &self.client
    }
}

#[async_trait]
impl ITransport for HttpTransport {
    #[instrument(skip(self, request), fields(cmd = %request.command.kind(), encoding = ?request.encoding))]
    async fn send(&self, request: &TransportRequest) -> Result<NormalizedResponse, TransportError> {
        let wire = match (&request.command, request.encoding) {
            (Command::Upload(payload), _) => {
                self.client.post_multipart(build_form(payload)?).await?
            }
            (command, Encoding::Query) => self.client.get(&encode_params(command)).await?,
            (command, Encoding::Body) => self.client.post_form(&encode_params(command)).await?,
        };

        let response = wire.normalize()?;
        debug!(
            files = response.files.len(),
            added = response.added.len(),
            removed = response.removed.len(),
            error = response.is_error(),
            "Connector response"
        );
        Ok(response)
    }
}
