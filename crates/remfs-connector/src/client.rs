//! Connector HTTP client
//!
//! Provides a thin typed HTTP client for one connector endpoint. Handles
//! extra headers, parameter encoding (query string, form body or multipart)
//! and status mapping; response bodies are parsed by [`crate::wire`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use remfs_connector::client::ConnectorClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConnectorClient::new("http://localhost:8080/connector")?;
//! let params = vec![("cmd".to_string(), "open".to_string()), ("init".to_string(), "1".to_string())];
//! let response = client.get(&params).await?;
//! println!("{:?}", response.api);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use remfs_core::config::ConnectorConfig;
use remfs_core::ports::TransportError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{multipart::Form, Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::wire::{parse_response, WireResponse};
use crate::ConnectorError;

/// Longest response excerpt carried in an HTTP error
const ERROR_EXCERPT_LEN: usize = 200;

// ============================================================================
// ConnectorClient
// ============================================================================

/// HTTP client for one connector endpoint
///
/// Wraps `reqwest::Client` with the endpoint URL and any extra headers the
/// deployment requires (session cookies, CSRF tokens).
#[derive(Debug, Clone)]
pub struct ConnectorClient {
    /// The underlying HTTP client
    client: Client,
    /// Connector endpoint
    url: Url,
    /// Headers added to every request
    headers: HeaderMap,
}

impl ConnectorClient {
    /// Creates a client for the given endpoint
    ///
    /// # Arguments
    /// * `url` - Absolute `http`/`https` URL of the connector
    ///
    /// # Errors
    /// Returns [`ConnectorError::InvalidUrl`] if the URL does not parse or
    /// uses another scheme
    pub fn new(url: &str) -> Result<Self, ConnectorError> {
        let url = Url::parse(url).map_err(|e| ConnectorError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConnectorError::InvalidUrl(format!(
                "{url}: unsupported scheme"
            )));
        }
        Ok(Self {
            client: Client::new(),
            url,
            headers: HeaderMap::new(),
        })
    }

    /// Creates a client from the `connector` configuration section
    ///
    /// # Errors
    /// Returns an error for an invalid URL or header
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        Self::new(&config.url)?.with_headers(&config.headers)
    }

    /// Adds headers sent with every request
    ///
    /// # Errors
    /// Returns [`ConnectorError::InvalidHeader`] for names or values HTTP
    /// does not allow
    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Result<Self, ConnectorError> {
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ConnectorError::InvalidHeader(format!("{name}: {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| ConnectorError::InvalidHeader(format!("{name}: {e}")))?;
            self.headers.insert(header_name, header_value);
        }
        Ok(self)
    }

    /// Returns the connector endpoint
    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.headers(self.headers.clone())
    }

    /// Sends a command with its parameters in the query string
    ///
    /// # Errors
    /// See [`ConnectorClient::execute`]
    pub async fn get(&self, params: &[(String, String)]) -> Result<WireResponse, TransportError> {
        let mut url = self.url.clone();
        url.query_pairs_mut().extend_pairs(params);
        debug!(uri_len = url.as_str().len(), "GET connector");
        self.execute(self.request(self.client.get(url))).await
    }

    /// Sends a command with its parameters as a form body
    ///
    /// # Errors
    /// See [`ConnectorClient::execute`]
    pub async fn post_form(&self, params: &[(String, String)]) -> Result<WireResponse, TransportError> {
        debug!(params = params.len(), "POST connector form");
        self.execute(self.request(self.client.post(self.url.clone()).form(params)))
            .await
    }

    /// Sends a multipart body (uploads)
    ///
    /// # Errors
    /// See [`ConnectorClient::execute`]
    pub async fn post_multipart(&self, form: Form) -> Result<WireResponse, TransportError> {
        debug!("POST connector multipart");
        self.execute(self.request(self.client.post(self.url.clone()).multipart(form)))
            .await
    }

    /// Sends a prepared request and parses the response body
    ///
    /// # Errors
    /// - [`TransportError::UriTooLong`] on HTTP 414
    /// - [`TransportError::Http`] on any other non-success status
    /// - [`TransportError::Network`] if the request could not complete
    /// - [`TransportError::InvalidResponse`] if the body is not connector JSON
    async fn execute(&self, builder: RequestBuilder) -> Result<WireResponse, TransportError> {
        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();

        if status == StatusCode::URI_TOO_LONG {
            warn!("Connector rejected request URI as too long");
            return Err(TransportError::UriTooLong);
        }

        let body = response.bytes().await.map_err(network_error)?;

        if !status.is_success() {
            let excerpt: String = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_EXCERPT_LEN)
                .collect();
            warn!(status = status.as_u16(), "Connector returned error status");
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: if excerpt.is_empty() {
                    status.canonical_reason().unwrap_or_default().to_string()
                } else {
                    excerpt
                },
            });
        }

        parse_response(&body)
    }
}

/// Map a reqwest failure to the port error
pub(crate) fn network_error(err: reqwest::Error) -> TransportError {
    TransportError::Network(err.to_string())
}
