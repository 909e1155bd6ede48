// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gradient-masked unlearning with adversarial co-training.
//!
//! A trial degrades a language model on a narrow forget distribution while
//! holding a broad retain distribution in place:
//!
//! * [`ParameterInterventionSet`] names the weights that may move and pairs
//!   each with its [`Circuit`] target;
//! * [`DisruptionScoreTracker`] keeps a decayed estimate of how much each of
//!   those weights matters to the retain task;
//! * [`CircuitMaskSelector`] turns the scores into a per-step mask;
//! * [`AlternatingTrainingLoop`] interleaves retain, masked unlearn, and
//!   adversary updates on disjoint [`TrainableSubset`]s;
//! * [`EvaluationGate`] prunes degenerate trials at evaluation steps;
//! * [`RelearnAttack`] fine-tunes the result afresh, and its lowest forget
//!   loss is the trial's fitness;
//! * [`TrialOrchestrator`] searches the knobs with a `fade-hpo` study.

pub mod alternating;
pub mod circuit;
pub mod config;
pub mod disruption;
pub mod error;
pub mod gate;
pub mod intervention;
pub mod mask;
pub mod orchestrator;
pub mod relearn;
pub mod repro;
pub mod subset;
pub mod trial;

pub use alternating::{AlternatingTrainingLoop, EvalBatches, LoopOutcome, UnlearnStats};
pub use circuit::{compute_circuit, Circuit, CircuitTransform};
pub use config::{
    AdapterSpec, GateConfig, Knob, MaskKind, OptimizerKind, RelearnConfig, RetainMode,
    SearchSpaceConfig, TrialParams, UnlearnConfig, UpdateDirection,
};
pub use disruption::DisruptionScoreTracker;
pub use error::{UnlearnError, UnlearnResult};
pub use gate::{Baseline, EvalSnapshot, EvaluationGate, GateVerdict, PruneReason};
pub use intervention::{InterveneParameter, ParameterInterventionSet};
pub use mask::{CircuitMaskSelector, Mask, MaskStrategy};
pub use orchestrator::{SearchState, TrialOrchestrator, BEST_MODEL_FILE};
pub use relearn::{RelearnAttack, RelearnReport};
pub use subset::{
    SubsetPartition, TrainableSubset, ADVERSARY_ADAPTER, RELEARN_ADAPTER, RETAIN_ADAPTER,
};
pub use trial::{run_trial, TrialData, TrialReport};
