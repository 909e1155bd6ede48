// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural building blocks for the unlearning stack.
//!
//! Everything a trial needs from a differentiable substrate lives here: named
//! parameters with per-parameter gradient tracking, linear layers that carry
//! low-rank adapters, next-token losses, optimisers restricted to parameter
//! groups, state-dict persistence, and an infinite token batch source.

pub mod dataset;
pub mod io;
pub mod layers;
pub mod lm;
pub mod loss;
pub mod module;
pub mod optim;

pub use dataset::{BatchSource, ConstantBatches, LoopingBatches, TokenBatch, TokenDataset};
pub use io::{
    load_bincode, load_json, load_state_dict_bincode, load_state_dict_json, save_bincode,
    save_json, save_state_dict_bincode, save_state_dict_json,
};
pub use layers::embedding::Embedding;
pub use layers::linear::Linear;
pub use layers::lora::{LoraAdapter, LoraConfig};
pub use lm::{LanguageModel, TinyLm, TinyLmConfig};
pub use loss::TokenLoss;
pub use module::{Module, Parameter};
pub use optim::{Adam, AdamConfig, LrScheduler, Optimizer, ParamGroup, Sgd, WarmupGrowthScheduler};

pub use fade_tensor::{PureResult, Tensor, TensorError};
