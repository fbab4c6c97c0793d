//! Agent context loader: load AGENTS.md from the workspace.
//!
//! The contents become the runtime's system prompt; the per-message prompt is built by the invoker.

use std::fs;
use std::path::Path;

/// Load agent context from the workspace (AGENTS.md).
///
/// Returns the file contents when AGENTS.md exists and is non-empty; otherwise None.
pub fn load_agent_ctx(workspace_dir: Option<&Path>) -> Option<String> {
    let dir = workspace_dir?;
    let path = dir.join("AGENTS.md");
    match fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => {
            log::debug!("loaded agent context from {}", path.display());
            Some(s)
        }
        Ok(_) => None,
        Err(e) => {
            log::debug!("no agent context at {}: {}", path.display(), e);
            None
        }
    }
}
