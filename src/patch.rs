//! Artifact interpretation: file blocks and embedded JSON.
//!
//! Agents return plain text. Implementation and fix artifacts carry
//! complete file contents in delimited blocks:
//!
//! ```text
//! <<<FILE: src/lib.rs>>>
//! ...entire file contents...
//! <<<END_FILE>>>
//! ```
//!
//! Planning artifacts carry JSON, often wrapped in fences or prose, so
//! extraction is tolerant: direct parse first, then fenced block, then
//! outermost bracket span.

use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_warn};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

fn file_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<<<FILE:\s*(.*?)\s*>>>\n?(.*?)<<<END_FILE>>>").unwrap()
    })
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").unwrap())
}

/// One complete file carried by an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    /// Path relative to the workspace root.
    pub path: PathBuf,
    /// Entire file contents.
    pub content: String,
}

/// Parse all file blocks out of an artifact body.
pub fn parse_file_blocks(body: &str) -> Vec<FileBlock> {
    file_block_re()
        .captures_iter(body)
        .map(|cap| FileBlock {
            path: PathBuf::from(cap[1].trim()),
            content: cap[2].to_string(),
        })
        .collect()
}

/// Reject paths that would land outside the workspace root.
///
/// Absolute paths and any `..` component are refused; the workspace is
/// the agent's whole world.
fn validate_rel_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(Error::Validation(format!(
            "Artifact path must be relative: {}",
            path.display()
        )));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::Validation(format!(
                "Artifact path escapes the workspace: {}",
                path.display()
            )));
        }
    }
    if path.as_os_str().is_empty() {
        return Err(Error::Validation("Artifact path is empty".to_string()));
    }
    Ok(())
}

/// Apply every file block in an artifact body under `root`.
///
/// Creates parent directories as needed and overwrites existing files.
/// Returns the relative paths written, in artifact order.
///
/// # Errors
/// Fails on the first invalid path or IO error; files written before
/// the failure stay on disk (the caller's workspace is disposable).
pub fn apply_file_blocks(root: &Path, body: &str) -> Result<Vec<PathBuf>> {
    let blocks = parse_file_blocks(body);
    if blocks.is_empty() {
        mlog_warn!("apply_file_blocks: artifact contained no file blocks");
    }

    let mut written = Vec::with_capacity(blocks.len());
    for block in blocks {
        validate_rel_path(&block.path)?;
        let target = root.join(&block.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &block.content)?;
        mlog_debug!(
            "apply_file_blocks: wrote {} ({} bytes)",
            block.path.display(),
            block.content.len()
        );
        written.push(block.path);
    }
    Ok(written)
}

/// Extract a JSON value from agent output that may wrap it in fences
/// or surrounding prose.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    for cap in fenced_json_re().captures_iter(trimmed) {
        if let Ok(value) = serde_json::from_str(cap[1].trim()) {
            return Ok(value);
        }
    }

    // Outermost bracket span, object or array, whichever starts first.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(Error::AgentProposal(
        "No parseable JSON found in agent output".to_string(),
    ))
}

/// Extract and deserialize JSON in one step.
pub fn extract_json_as<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value = extract_json(text)?;
    Ok(serde_json::from_value(value)?)
}
