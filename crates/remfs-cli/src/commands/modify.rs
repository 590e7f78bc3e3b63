//! Mutating commands: `mkdir` and `rm`

use anyhow::{Context, Result};
use clap::Args;
use remfs_core::config::Config;
use remfs_core::domain::EntryId;
use tracing::info;

use crate::context::{connect, open_or_root, parse_id};
use crate::output::{entries_json, entry_line, get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct MkdirCommand {
    /// Name of the new directory
    pub name: String,

    /// Parent directory id; the default volume root when omitted
    #[arg(long)]
    pub target: Option<String>,
}

impl MkdirCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let (browser, root) = connect(config, None).await?;
        let parent = open_or_root(&browser, root, self.target.as_deref()).await?;

        let created = browser
            .mkdir(parent.clone(), self.name.clone())
            .outcome()
            .await
            .with_context(|| format!("Failed to create {:?}", self.name))?;
        info!(%parent, name = %self.name, "Directory created");

        if format.is_json() {
            formatter.print_json(&entries_json(&created));
        } else {
            formatter.success(&format!("Created {}", self.name));
            for entry in &created {
                formatter.info(&entry_line(entry));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct RmCommand {
    /// Entry ids to remove
    #[arg(required = true)]
    pub ids: Vec<String>,
}

impl RmCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let ids = self
            .ids
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<Vec<EntryId>>>()?;
        let (browser, _) = connect(config, None).await?;

        let removed = browser
            .rm(ids)
            .outcome()
            .await
            .context("Failed to remove entries")?;

        if format.is_json() {
            formatter.print_json(&serde_json::to_value(&removed)?);
        } else {
            formatter.success(&format!(
                "Removed {} entr{}",
                removed.len(),
                if removed.len() == 1 { "y" } else { "ies" }
            ));
            for id in &removed {
                formatter.info(id.as_str());
            }
        }
        Ok(())
    }
}
