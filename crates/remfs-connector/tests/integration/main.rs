//! Integration tests for remfs-connector
//!
//! Uses wiremock to simulate an elFinder-style connector and verifies
//! end-to-end behavior of HttpTransport: parameter encoding, response
//! normalization, status mapping and multipart uploads.

mod common;

mod test_commands;
mod test_open;
mod test_upload;
