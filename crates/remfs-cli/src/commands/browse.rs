//! Read-only commands: `ls`, `tree`, `search` and `du`

use anyhow::{Context, Result};
use clap::Args;
use remfs_core::config::Config;
use remfs_core::domain::EntryId;
use tracing::info;

use crate::context::{connect, open_or_root, parse_id};
use crate::output::{entries_json, entry_line, get_formatter, human_size, OutputFormat};

// ============================================================================
// ls
// ============================================================================

#[derive(Debug, Args)]
pub struct LsCommand {
    /// Directory id; the default volume root when omitted
    pub target: Option<String>,

    /// Only print names, as reported by the connector's `ls`
    #[arg(long)]
    pub names: bool,
}

impl LsCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let (browser, root) = connect(config, None).await?;
        let dir = open_or_root(&browser, root, self.target.as_deref()).await?;

        if self.names {
            let listing = browser
                .list(dir.clone())
                .outcome()
                .await
                .context("Failed to list names")?;
            if format.is_json() {
                formatter.print_json(&serde_json::to_value(&listing)?);
            } else {
                for (name, id) in &listing {
                    match id {
                        Some(id) => formatter.info(&format!("{name}  [{id}]")),
                        None => formatter.info(name),
                    }
                }
            }
            return Ok(());
        }

        let children = browser.cache().children_of(&dir);
        info!(%dir, entries = children.len(), "Listed directory");
        if format.is_json() {
            formatter.print_json(&entries_json(&children));
            return Ok(());
        }

        let path: Vec<String> = browser
            .cache()
            .ancestors_of(&dir)
            .into_iter()
            .map(|e| e.name)
            .collect();
        formatter.success(&format!("/{} ({} entries)", path.join("/"), children.len()));
        for entry in &children {
            formatter.info(&entry_line(entry));
        }
        let disabled = browser.capabilities().disabled_for(&dir);
        if !disabled.is_empty() {
            let names: Vec<&str> = disabled.iter().map(|k| k.as_str()).collect();
            formatter.info(&format!("Disabled here: {}", names.join(", ")));
        }
        Ok(())
    }
}

// ============================================================================
// tree
// ============================================================================

#[derive(Debug, Args)]
pub struct TreeCommand {
    /// Directory id; the default volume root when omitted
    pub target: Option<String>,
}

impl TreeCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let (browser, root) = connect(config, None).await?;
        let dir = match self.target.as_deref() {
            Some(raw) => parse_id(raw)?,
            None => root,
        };

        let ids = browser
            .tree(dir.clone())
            .outcome()
            .await
            .context("Failed to load tree")?;
        let cache = browser.cache();
        let entries: Vec<_> = ids.iter().filter_map(|id| cache.get(id)).collect();

        if format.is_json() {
            formatter.print_json(&entries_json(&entries));
            return Ok(());
        }

        let base_depth = cache.ancestors_of(&dir).len();
        formatter.success(&format!("{} directories", entries.len()));
        for entry in &entries {
            let depth = cache.ancestors_of(&entry.id).len().saturating_sub(base_depth);
            formatter.info(&format!("{}{}  [{}]", "  ".repeat(depth), entry.name, entry.id));
        }
        Ok(())
    }
}

// ============================================================================
// search
// ============================================================================

#[derive(Debug, Args)]
pub struct SearchCommand {
    /// Name fragment to look for
    pub query: String,

    /// Limit the search to this directory
    #[arg(long = "in")]
    pub scope: Option<String>,
}

impl SearchCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let (browser, _) = connect(config, None).await?;
        let scope = self.scope.as_deref().map(parse_id).transpose()?;

        let found = browser
            .search(self.query.clone(), scope)
            .outcome()
            .await
            .context("Search failed")?;

        if format.is_json() {
            formatter.print_json(&entries_json(&found));
            return Ok(());
        }
        if found.is_empty() {
            formatter.warn(&format!("Nothing matches {:?}", self.query));
            return Ok(());
        }
        formatter.success(&format!("{} match(es) for {:?}", found.len(), self.query));
        for entry in &found {
            formatter.info(&entry_line(entry));
        }
        Ok(())
    }
}

// ============================================================================
// du
// ============================================================================

#[derive(Debug, Args)]
pub struct DuCommand {
    /// Entry ids to measure together
    #[arg(required = true)]
    pub ids: Vec<String>,
}

impl DuCommand {
    pub async fn execute(&self, config: Config, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let ids = self
            .ids
            .iter()
            .map(|raw| parse_id(raw))
            .collect::<Result<Vec<EntryId>>>()?;
        let (browser, _) = connect(config, None).await?;

        let size = browser
            .get_aggregate_size(ids)
            .outcome()
            .await
            .context("Failed to compute size")?;

        if format.is_json() {
            formatter.print_json(&serde_json::json!({ "size": size }));
        } else {
            formatter.success(&format!("{} ({size} bytes)", human_size(size)));
        }
        Ok(())
    }
}
