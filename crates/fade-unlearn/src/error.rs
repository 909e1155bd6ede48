// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use fade_hpo::SearchError;
use fade_nn::TensorError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a whole run.
///
/// Degenerate trials are not errors; they come back as pruned outcomes.
#[derive(Debug, Error)]
pub enum UnlearnError {
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },
    #[error("no model parameter matches intervention target `{0}`")]
    MissingTarget(String),
    #[error("circuit has no entry for parameter `{0}`")]
    MissingCircuitEntry(String),
    #[error("circuit entry `{name}` has shape {circuit:?} but the parameter is {param:?}")]
    CircuitShape {
        name: String,
        circuit: (usize, usize),
        param: (usize, usize),
    },
    #[error("working tree at {} has uncommitted changes", .0.display())]
    DirtyWorkingTree(PathBuf),
    #[error("`git {command}` failed: {message}")]
    Git { command: String, message: String },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl UnlearnError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        UnlearnError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type UnlearnResult<T> = Result<T, UnlearnError>;
