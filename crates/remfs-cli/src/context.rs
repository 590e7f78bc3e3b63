//! Shared setup for commands: configuration and the connected browser

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use remfs_client::Browser;
use remfs_connector::{ConnectorClient, HttpTransport};
use remfs_core::config::Config;
use remfs_core::domain::EntryId;
use remfs_core::ports::IConflictResolver;
use tracing::{debug, info};

/// Options shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<String>,
    pub url: Option<String>,
}

impl GlobalArgs {
    /// Config file in effect: `--config`, else the platform default
    pub fn config_path(&self) -> PathBuf {
        self.config
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(Config::default_path)
    }

    /// `logging.json` from the config file, ignoring load errors
    pub fn logging_json(&self) -> bool {
        Config::load_or_default(&self.config_path()).logging.json
    }

    /// Loads and validates the configuration, applying `--url`
    ///
    /// An explicit `--config` must exist; the default path falls back to
    /// built-in defaults.
    pub fn load_config(&self) -> Result<Config> {
        let path = self.config_path();
        let mut config = if self.config.is_some() {
            Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        } else {
            Config::load_or_default(&path)
        };

        if let Some(url) = &self.url {
            config.connector.url = url.clone();
        }

        let errors = config.validate();
        if !errors.is_empty() {
            let list: Vec<String> = errors.iter().map(ToString::to_string).collect();
            bail!("Invalid configuration: {}", list.join("; "));
        }
        Ok(config)
    }
}

/// Connects to the configured connector and opens the default volume
///
/// Returns the browser and the id of the directory opened by `init`.
pub async fn connect(
    config: Config,
    resolver: Option<Arc<dyn IConflictResolver>>,
) -> Result<(Browser, EntryId)> {
    let client = ConnectorClient::from_config(&config.connector)
        .context("Failed to create connector client")?;
    info!(url = %client.url(), "Connecting");
    let transport = Arc::new(HttpTransport::new(client));

    let browser = match resolver {
        Some(resolver) => Browser::with_conflict_resolver(transport, config, resolver),
        None => Browser::new(transport, config),
    };
    let root = browser
        .init()
        .outcome()
        .await
        .context("Failed to initialise connector")?;
    debug!(%root, api = ?browser.api_version(), "Connector ready");
    Ok((browser, root))
}

/// Opens `target` when given, else stays in the directory `init` opened
pub async fn open_or_root(browser: &Browser, root: EntryId, target: Option<&str>) -> Result<EntryId> {
    match target {
        Some(target) => {
            let id = parse_id(target)?;
            browser
                .open(id)
                .outcome()
                .await
                .with_context(|| format!("Failed to open {target}"))
        }
        None => Ok(root),
    }
}

pub fn parse_id(raw: &str) -> Result<EntryId> {
    EntryId::new(raw).with_context(|| format!("Invalid entry id: {raw:?}"))
}
