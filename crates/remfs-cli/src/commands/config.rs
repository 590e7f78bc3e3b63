//! Config command - Inspect remfs configuration
//!
//! `remfs config show` prints the effective configuration (file values over
//! defaults, with `--url` applied); `remfs config validate` checks the file
//! without connecting.

use anyhow::{Context, Result};
use clap::Subcommand;
use remfs_core::config::Config;
use tracing::info;

use crate::context::GlobalArgs;
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
}

impl ConfigCommand {
    pub async fn execute(&self, globals: &GlobalArgs, format: OutputFormat) -> Result<()> {
        match self {
            ConfigCommand::Show => show(globals, format),
            ConfigCommand::Validate => validate(globals, format),
        }
    }
}

fn show(globals: &GlobalArgs, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let path = globals.config_path();
    let config = globals.load_config()?;
    info!(config_path = %path.display(), "Showing configuration");

    if format.is_json() {
        let json = serde_json::to_value(&config)
            .context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
        return Ok(());
    }

    formatter.success(&format!("Configuration ({})", path.display()));
    let yaml =
        serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
    for line in yaml.lines() {
        formatter.info(line);
    }
    Ok(())
}

fn validate(globals: &GlobalArgs, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let path = globals.config_path();

    let errors: Vec<String> = if path.exists() {
        match Config::load(&path) {
            Ok(config) => config.validate().iter().map(ToString::to_string).collect(),
            Err(err) => vec![format!("Failed to parse configuration: {err}")],
        }
    } else {
        vec![format!("Configuration file not found at {}", path.display())]
    };
    info!(config_path = %path.display(), errors = errors.len(), "Validated configuration");

    if format.is_json() {
        formatter.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": path.display().to_string(),
            "errors": errors,
        }));
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", path.display()));
    } else {
        formatter.error(&format!("Configuration has {} problem(s)", errors.len()));
        formatter.info(&format!("File: {}", path.display()));
        for error in &errors {
            formatter.info(&format!("  {error}"));
        }
    }
    Ok(())
}
