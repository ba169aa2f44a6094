use anyhow::{Context, Result};
use std::path::Path;

/// Prompts used when no prompts file is given (or it is empty)
pub const DEFAULT_PROMPTS: &[&str] = &[
    "Explain the concept of zero-downtime deployment in three sentences.",
    "Write a short Python function that reverses a string.",
    "What is the difference between blue-green and canary deployments?",
    "Summarize the benefits of container orchestration.",
    "Describe how a load balancer distributes traffic.",
];

pub fn default_prompts() -> Vec<String> {
    DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect()
}

/// Load prompts, one per line. Blank lines are dropped and surrounding
/// whitespace trimmed. Falls back to the defaults when `path` is `None` or
/// the file holds no prompts.
pub fn load_prompts(path: Option<&Path>) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(default_prompts());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompts file {}", path.display()))?;

    let prompts = parse_prompts(&content);
    if prompts.is_empty() {
        tracing::warn!(
            "Prompts file {} is empty, using defaults",
            path.display()
        );
        return Ok(default_prompts());
    }

    tracing::info!("Loaded {} prompts from {}", prompts.len(), path.display());
    Ok(prompts)
}

fn parse_prompts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
