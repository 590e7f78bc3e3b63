//! remfs Connector - HTTP transport for elFinder-style connectors
//!
//! Provides the adapter side of the `ITransport` port:
//! - Command encoding as query string, form body or multipart upload
//! - Lenient parsing of connector JSON into `NormalizedResponse`
//! - Status mapping (HTTP 414 becomes `TransportError::UriTooLong`)
//!
//! ## Modules
//!
//! - [`client`] - Connector HTTP client
//! - [`transport`] - `ITransport` implementation
//! - [`upload`] - Multipart bodies for whole files, chunks and merges
//! - [`wire`] - Response types and parameter encoding

pub mod client;
pub mod transport;
pub mod upload;
pub mod wire;

pub use client::ConnectorClient;
pub use transport::HttpTransport;

use thiserror::Error;

/// Errors that can occur while setting up a connector client
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The endpoint URL is malformed or not http(s)
    #[error("Invalid connector URL: {0}")]
    InvalidUrl(String),

    /// A configured header name or value is not valid HTTP
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}
