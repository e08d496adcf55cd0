// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Writes `FILE: path` / `ENDFILE` blocks embedded in step outputs to
//! disk under `artifacts/<run_id>/`. Only the final version of each path
//! survives when multiple steps emit the same file.

use crate::value::Value;
use crate::workflow_result::WorkflowResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `FILE: path\n<content>\nENDFILE` block, path and body captured.
fn file_block_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?ms)^FILE:\s*([^\r\n]+)\r?\n(.*?)^ENDFILE\s*$").unwrap()
    })
}

/// Normalizes a raw `FILE:` path into a safe, traversal-free relative
/// path: backslashes to slashes, leading slashes stripped, and any `..`
/// component dropped.
fn safe_rel_path(raw: &str) -> Option<PathBuf> {
    let clean = raw.trim().replace('\\', "/");
    let clean = clean.trim_start_matches('/');
    let parts: Vec<&str> = clean.split('/').filter(|p| !p.is_empty() && *p != "..").collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().collect())
}

fn scan_output_for_files(output: &BTreeMap<String, Value>) -> BTreeMap<PathBuf, String> {
    let mut files = BTreeMap::new();
    let mut strings = Vec::new();
    for value in output.values() {
        value.collect_strings(&mut strings);
    }
    for blob in &strings {
        for caps in file_block_regex().captures_iter(blob) {
            let Some(path) = safe_rel_path(&caps[1]) else {
                debug!(path = &caps[1], "skipping unsafe artifact path");
                continue;
            };
            files.insert(path, caps[2].to_string());
        }
    }
    files
}

fn write_files(run_dir: &Path, files: &BTreeMap<PathBuf, String>) -> std::io::Result<()> {
    std::fs::create_dir_all(run_dir)?;
    for (rel, content) in files {
        let dest = run_dir.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, content)?;
    }
    Ok(())
}

/// Extracts every `FILE:`/`ENDFILE` block from a completed run's
/// successful and skipped step outputs, writing them under
/// `artifacts_dir/<run_id>/`. Returns the run directory if anything was
/// written.
pub fn extract_artifacts(result: &WorkflowResult, artifacts_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    if result.steps.is_empty() {
        return Ok(None);
    }

    let mut files = BTreeMap::new();
    for step in &result.steps {
        use crate::workflow_result::StepStatus;
        if !matches!(step.status, StepStatus::Success | StepStatus::Skipped) {
            continue;
        }
        files.extend(scan_output_for_files(&step.output_data));
    }

    if files.is_empty() {
        debug!(run_id = %result.run_id, "no FILE blocks found in run");
        return Ok(None);
    }

    let run_dir = artifacts_dir.join(&result.run_id);
    write_files(&run_dir, &files)?;
    info!(count = files.len(), dir = %run_dir.display(), "extracted artifact files");
    Ok(Some(run_dir))
}
