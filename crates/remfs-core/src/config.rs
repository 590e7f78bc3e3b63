//! Configuration module for remfs.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::EntryField;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for remfs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connector: ConnectorConfig,
    pub dispatcher: DispatcherConfig,
    pub upload: UploadConfig,
    pub sync: SyncConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Remote connector endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Connector URL, e.g. `https://files.example.com/connector`.
    pub url: String,
    /// Extra headers sent with every request (auth tokens, CSRF headers).
    pub headers: BTreeMap<String, String>,
}

/// Behaviour when a navigation is submitted while another is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationPolicy {
    /// Abort the older navigation quietly; the newest one wins.
    #[default]
    Supersede,
    /// Reject the newer navigation until the in-flight one settles.
    RejectWhileOpening,
}

/// Request dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum simultaneous non-upload requests.
    pub max_concurrency: usize,
    /// Milliseconds before a pending request shows a "working" indicator.
    pub notify_delay_ms: u64,
    /// Default per-request timeout in seconds (0 disables the timeout).
    pub request_timeout_secs: u64,
    /// How concurrent navigations are arbitrated.
    pub navigation_policy: NavigationPolicy,
}

/// Upload pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum simultaneous upload requests (capped at 5).
    pub concurrency: usize,
    /// Files above this size (in MiB) are uploaded in chunks of this size.
    pub chunk_size_mb: u64,
    /// Bytes kept below the server's upload limit when sizing chunks.
    pub safety_margin_bytes: u64,
    /// Maximum number of whole files sent in one request.
    pub max_files_per_batch: usize,
    /// Maximum aggregate size (in MiB) of one batch request.
    pub max_batch_size_mb: u64,
    /// Maximum items in one upload invocation (0 = unlimited).
    pub max_items_per_call: usize,
    /// Attempts per chunk before the file fails.
    pub chunk_attempts: u32,
    /// Fixed delay between chunk attempts, in milliseconds.
    pub chunk_retry_delay_ms: u64,
    /// Per-request timeout for upload requests in seconds (0 disables it).
    pub request_timeout_secs: u64,
}

/// Background synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between periodic sync cycles (0 disables periodic sync).
    pub interval_secs: u64,
    /// Send a compare token so unchanged directories short-circuit.
    pub use_compare_token: bool,
    /// Fields ignored when deciding whether a cached entry changed.
    pub excluded_fields: Vec<EntryField>,
}

/// Command facade settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Run a full sync in the background after a transport failure.
    pub sync_on_transport_error: bool,
    /// Names hidden from normal listings (still resolvable by id).
    pub hidden_names: Vec<String>,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/remfs/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("remfs")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/connector".to_string(),
            headers: BTreeMap::new(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            notify_delay_ms: 500,
            request_timeout_secs: 60,
            navigation_policy: NavigationPolicy::Supersede,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            chunk_size_mb: 10,
            safety_margin_bytes: 8 * 1024,
            max_files_per_batch: 20,
            max_batch_size_mb: 32,
            max_items_per_call: 0,
            chunk_attempts: 3,
            chunk_retry_delay_ms: 1000,
            request_timeout_secs: 0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 0,
            use_compare_token: true,
            excluded_fields: Vec::new(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_on_transport_error: true,
            hidden_names: Vec::new(),
            event_capacity: crate::ports::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Hard ceiling on simultaneous upload requests.
pub const MAX_UPLOAD_CONCURRENCY: usize = 5;

impl DispatcherConfig {
    /// Delay before the "working" indicator appears.
    pub fn notify_delay(&self) -> Duration {
        Duration::from_millis(self.notify_delay_ms)
    }

    /// Default timeout for standard requests, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl UploadConfig {
    /// Effective upload lane width: `min(5, concurrency)`, at least 1.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_UPLOAD_CONCURRENCY)
    }

    /// Configured chunk size in bytes.
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    /// Configured batch size limit in bytes.
    pub fn max_batch_bytes(&self) -> u64 {
        self.max_batch_size_mb * 1024 * 1024
    }

    /// Fixed delay between chunk attempts.
    pub fn chunk_retry_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_delay_ms)
    }

    /// Timeout for upload requests, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl SyncConfig {
    /// Interval between periodic syncs, if enabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"dispatcher.max_concurrency"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            });
        };

        // --- connector ---
        if !(self.connector.url.starts_with("http://") || self.connector.url.starts_with("https://"))
        {
            push(
                "connector.url",
                format!("must be an http(s) URL, got '{}'", self.connector.url),
            );
        }

        // --- dispatcher ---
        if self.dispatcher.max_concurrency == 0 || self.dispatcher.max_concurrency > 16 {
            push("dispatcher.max_concurrency", "must be in range 1..=16".into());
        }

        // --- upload ---
        if self.upload.concurrency == 0 {
            push("upload.concurrency", "must be greater than 0".into());
        }
        if self.upload.chunk_size_mb == 0 {
            push("upload.chunk_size_mb", "must be greater than 0".into());
        }
        if self.upload.max_files_per_batch == 0 {
            push("upload.max_files_per_batch", "must be greater than 0".into());
        }
        if self.upload.max_batch_size_mb == 0 {
            push("upload.max_batch_size_mb", "must be greater than 0".into());
        }
        if self.upload.chunk_size_mb > self.upload.max_batch_size_mb {
            push(
                "upload.chunk_size_mb",
                format!(
                    "chunk_size_mb ({}) must not exceed max_batch_size_mb ({})",
                    self.upload.chunk_size_mb, self.upload.max_batch_size_mb
                ),
            );
        }
        if self.upload.chunk_attempts == 0 {
            push("upload.chunk_attempts", "must be greater than 0".into());
        }

        // --- client ---
        if self.client.event_capacity == 0 {
            push("client.event_capacity", "must be greater than 0".into());
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use remfs_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .connector_url("https://files.example.com/connector")
///     .dispatcher_max_concurrency(4)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- connector ---

    pub fn connector_url(mut self, url: impl Into<String>) -> Self {
        self.config.connector.url = url.into();
        self
    }

    pub fn connector_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .connector
            .headers
            .insert(name.into(), value.into());
        self
    }

    // --- dispatcher ---

    pub fn dispatcher_max_concurrency(mut self, n: usize) -> Self {
        self.config.dispatcher.max_concurrency = n;
        self
    }

    pub fn dispatcher_notify_delay_ms(mut self, ms: u64) -> Self {
        self.config.dispatcher.notify_delay_ms = ms;
        self
    }

    pub fn dispatcher_request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.dispatcher.request_timeout_secs = secs;
        self
    }

    pub fn dispatcher_navigation_policy(mut self, policy: NavigationPolicy) -> Self {
        self.config.dispatcher.navigation_policy = policy;
        self
    }

    // --- upload ---

    pub fn upload_concurrency(mut self, n: usize) -> Self {
        self.config.upload.concurrency = n;
        self
    }

    pub fn upload_chunk_size_mb(mut self, mb: u64) -> Self {
        self.config.upload.chunk_size_mb = mb;
        self
    }

    pub fn upload_max_files_per_batch(mut self, n: usize) -> Self {
        self.config.upload.max_files_per_batch = n;
        self
    }

    pub fn upload_max_batch_size_mb(mut self, mb: u64) -> Self {
        self.config.upload.max_batch_size_mb = mb;
        self
    }

    pub fn upload_max_items_per_call(mut self, n: usize) -> Self {
        self.config.upload.max_items_per_call = n;
        self
    }

    pub fn upload_chunk_attempts(mut self, n: u32) -> Self {
        self.config.upload.chunk_attempts = n;
        self
    }

    pub fn upload_chunk_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.upload.chunk_retry_delay_ms = ms;
        self
    }

    // --- sync ---

    pub fn sync_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync.interval_secs = secs;
        self
    }

    pub fn sync_use_compare_token(mut self, enabled: bool) -> Self {
        self.config.sync.use_compare_token = enabled;
        self
    }

    pub fn sync_excluded_fields(mut self, fields: Vec<EntryField>) -> Self {
        self.config.sync.excluded_fields = fields;
        self
    }

    // --- client ---

    pub fn client_sync_on_transport_error(mut self, enabled: bool) -> Self {
        self.config.client.sync_on_transport_error = enabled;
        self
    }

    pub fn client_hidden_names(mut self, names: Vec<String>) -> Self {
        self.config.client.hidden_names = names;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.dispatcher.max_concurrency, 3);
        assert_eq!(cfg.dispatcher.notify_delay_ms, 500);
        assert_eq!(cfg.dispatcher.navigation_policy, NavigationPolicy::Supersede);
        assert_eq!(cfg.upload.concurrency, 5);
        assert_eq!(cfg.upload.chunk_size_mb, 10);
        assert_eq!(cfg.upload.chunk_attempts, 3);
        assert_eq!(cfg.upload.max_items_per_call, 0);
        assert!(cfg.sync.use_compare_token);
        assert!(cfg.sync.interval().is_none());
        assert!(cfg.client.sync_on_transport_error);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    #[test]
    fn derived_durations() {
        let cfg = Config::default();
        assert_eq!(cfg.dispatcher.notify_delay(), Duration::from_millis(500));
        assert_eq!(cfg.dispatcher.request_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(cfg.upload.request_timeout(), None);
        assert_eq!(cfg.upload.chunk_size_bytes(), 10 * 1024 * 1024);
        assert_eq!(cfg.upload.chunk_retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn upload_concurrency_is_capped_at_five() {
        let mut cfg = UploadConfig::default();
        cfg.concurrency = 12;
        assert_eq!(cfg.effective_concurrency(), 5);
        cfg.concurrency = 2;
        assert_eq!(cfg.effective_concurrency(), 2);
        cfg.concurrency = 0;
        assert_eq!(cfg.effective_concurrency(), 1);
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
connector:
  url: https://files.example.com/connector
  headers:
    X-Auth-Token: secret
dispatcher:
  max_concurrency: 4
  notify_delay_ms: 250
  request_timeout_secs: 30
  navigation_policy: reject_while_opening
upload:
  concurrency: 2
  chunk_size_mb: 4
  max_files_per_batch: 10
  max_batch_size_mb: 16
  chunk_attempts: 5
sync:
  interval_secs: 120
  excluded_fields: [thumbnail, modified]
client:
  hidden_names: [".git"]
logging:
  level: debug
  json: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.connector.url, "https://files.example.com/connector");
        assert_eq!(
            cfg.connector.headers.get("X-Auth-Token").map(String::as_str),
            Some("secret")
        );
        assert_eq!(cfg.dispatcher.max_concurrency, 4);
        assert_eq!(cfg.dispatcher.notify_delay_ms, 250);
        assert_eq!(
            cfg.dispatcher.navigation_policy,
            NavigationPolicy::RejectWhileOpening
        );
        assert_eq!(cfg.upload.concurrency, 2);
        assert_eq!(cfg.upload.chunk_size_mb, 4);
        assert_eq!(cfg.upload.chunk_attempts, 5);
        // Unspecified keys fall back to their defaults
        assert_eq!(cfg.upload.chunk_retry_delay_ms, 1000);
        assert_eq!(cfg.sync.interval(), Some(Duration::from_secs(120)));
        assert_eq!(
            cfg.sync.excluded_fields,
            vec![EntryField::Thumbnail, EntryField::Modified]
        );
        assert_eq!(cfg.client.hidden_names, vec![".git".to_string()]);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.dispatcher.max_concurrency, 3);
    }

    #[test]
    fn load_returns_error_on_invalid_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"not: [valid: yaml: {{{").unwrap();
        tmp.flush().unwrap();

        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn default_path_ends_with_remfs_config() {
        let path = Config::default_path();
        assert!(path.ends_with("remfs/config.yaml"));
    }

    // -- Validation --

    #[test]
    fn validate_catches_bad_url() {
        let cfg = ConfigBuilder::new().connector_url("ftp://nope").build();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "connector.url"));
    }

    #[test]
    fn validate_catches_zero_concurrency() {
        let mut cfg = Config::default();
        cfg.dispatcher.max_concurrency = 0;
        cfg.upload.concurrency = 0;
        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"dispatcher.max_concurrency".to_string()));
        assert!(fields.contains(&"upload.concurrency".to_string()));
    }

    #[test]
    fn validate_catches_chunk_larger_than_batch() {
        let cfg = ConfigBuilder::new()
            .upload_chunk_size_mb(64)
            .upload_max_batch_size_mb(32)
            .build();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "upload.chunk_size_mb"));
    }

    #[test]
    fn validate_catches_invalid_log_level() {
        let cfg = ConfigBuilder::new().logging_level("verbose").build();
        let errors = cfg.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "logging.level");
        assert!(errors[0].to_string().contains("verbose"));
    }

    // -- Builder --

    #[test]
    fn builder_overrides_and_validates() {
        let cfg = ConfigBuilder::new()
            .connector_url("https://example.com/c")
            .connector_header("Authorization", "Bearer x")
            .dispatcher_max_concurrency(2)
            .upload_chunk_attempts(4)
            .sync_interval_secs(30)
            .build_validated()
            .expect("valid config");
        assert_eq!(cfg.dispatcher.max_concurrency, 2);
        assert_eq!(cfg.upload.chunk_attempts, 4);
        assert_eq!(cfg.sync.interval_secs, 30);
        assert_eq!(cfg.connector.headers.len(), 1);
    }

    #[test]
    fn builder_validated_reports_errors() {
        let result = ConfigBuilder::new().upload_chunk_attempts(0).build_validated();
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| e.field == "upload.chunk_attempts"));
    }
}
