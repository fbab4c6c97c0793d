//! Initialize the configuration directory: create ~/.courier, a default config, and the workspace.
//!
//! `config/workspace/AGENTS.md` in this crate is the template for `~/.courier/workspace/AGENTS.md`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, Config};

static DEFAULT_AGENT_CTX: &str = include_str!("../config/workspace/AGENTS.md");

/// Create the config directory and default files if they do not exist.
/// - Writes `config.json` with the default config if missing.
/// - Creates the workspace directory and seeds `AGENTS.md` from the template if missing.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    let config = if config_path.exists() {
        let s = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading config from {}", config_path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", config_path.display()))?
    } else {
        let config = Config::default();
        let body = serde_json::to_string_pretty(&config).context("serializing default config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
        config
    };

    let workspace = config::resolve_workspace_dir(&config, config_path);
    if !workspace.exists() {
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("creating workspace directory {}", workspace.display()))?;
        log::info!("created workspace directory at {}", workspace.display());
    }
    let workspace_agents = workspace.join("AGENTS.md");
    if !workspace_agents.exists() {
        std::fs::write(&workspace_agents, DEFAULT_AGENT_CTX)
            .with_context(|| format!("writing default AGENTS.md to {}", workspace_agents.display()))?;
        log::info!("wrote default AGENTS.md to {}", workspace_agents.display());
    } else {
        log::debug!("AGENTS.md already exists at {}, skipping", workspace_agents.display());
    }

    Ok(config_dir.to_path_buf())
}
