// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Ties search results to the code and configuration that produced them.

use crate::config::UnlearnConfig;
use crate::error::{UnlearnError, UnlearnResult};
use chrono::{Local, NaiveDateTime};
use fade_hpo::Study;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn git(dir: &Path, args: &[&str]) -> UnlearnResult<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        return Err(UnlearnError::Git {
            command: args.join(" "),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn repo_root(dir: impl AsRef<Path>) -> UnlearnResult<PathBuf> {
    git(dir.as_ref(), &["rev-parse", "--show-toplevel"]).map(PathBuf::from)
}

pub fn commit_hash(dir: impl AsRef<Path>) -> UnlearnResult<String> {
    git(dir.as_ref(), &["rev-parse", "HEAD"])
}

/// No modified, staged, or untracked files.
pub fn is_repo_clean(dir: impl AsRef<Path>) -> UnlearnResult<bool> {
    Ok(git(dir.as_ref(), &["status", "--porcelain"])?.is_empty())
}

/// Refuses to start a search from uncommitted code.
pub fn ensure_clean(dir: impl AsRef<Path>) -> UnlearnResult<String> {
    let dir = dir.as_ref();
    let root = repo_root(dir)?;
    if !is_repo_clean(&root)? {
        return Err(UnlearnError::DirtyWorkingTree(root));
    }
    commit_hash(&root)
}

/// Copies `script` to `results_root/<YYYY-MM-DD>/<HH-MM-SS>_<name>` and
/// returns the destination.
pub fn snapshot_script_at(
    script: impl AsRef<Path>,
    results_root: impl AsRef<Path>,
    at: NaiveDateTime,
) -> UnlearnResult<PathBuf> {
    let script = script.as_ref();
    let file_name = script
        .file_name()
        .ok_or_else(|| {
            UnlearnError::config("script", format!("{} has no file name", script.display()))
        })?
        .to_string_lossy();
    let dir = results_root.as_ref().join(at.format("%Y-%m-%d").to_string());
    fs::create_dir_all(&dir)?;
    let destination = dir.join(format!("{}_{file_name}", at.format("%H-%M-%S")));
    fs::copy(script, &destination)?;
    tracing::info!(
        source = %script.display(),
        destination = %destination.display(),
        "script snapshot"
    );
    Ok(destination)
}

pub fn snapshot_script(
    script: impl AsRef<Path>,
    results_root: impl AsRef<Path>,
) -> UnlearnResult<PathBuf> {
    snapshot_script_at(script, results_root, Local::now().naive_local())
}

/// Stores the commit and every flattened config field on the study.
pub fn record_provenance(
    study: &mut Study,
    commit: &str,
    config: &UnlearnConfig,
) -> UnlearnResult<()> {
    study.set_user_attr("commit_hash", Value::String(commit.to_string()))?;
    for (key, value) in config.flatten()? {
        study.set_user_attr(&format!("config.{key}"), value)?;
    }
    Ok(())
}
