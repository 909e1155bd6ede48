// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{UnlearnError, UnlearnResult};
use fade_nn::{BatchSource, LanguageModel, PureResult, Tensor, TensorError, TokenLoss};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Immutable per-parameter forget direction.
///
/// Cloning is cheap; every clone shares the same tensors, so one circuit can
/// be loaded before the first trial and handed to all of them.
#[derive(Clone, Debug, Default)]
pub struct Circuit {
    entries: Arc<BTreeMap<String, Arc<Tensor>>>,
}

impl Circuit {
    /// Builds a circuit, dropping embedding entries. Embeddings are never
    /// intervened on and their tables dominate the artifact size.
    pub fn new(entries: HashMap<String, Tensor>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|(name, _)| !name.contains("embed"))
            .map(|(name, tensor)| (name, Arc::new(tensor)))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Loads a state-dict artifact. `.json` files are read as JSON,
    /// everything else as bincode.
    pub fn load<P: AsRef<Path>>(path: P) -> UnlearnResult<Self> {
        let path = path.as_ref();
        let entries = if is_json(path) {
            fade_nn::load_state_dict_json(path)?
        } else {
            fade_nn::load_state_dict_bincode(path)?
        };
        let circuit = Self::new(entries);
        tracing::info!(path = %path.display(), entries = circuit.len(), "loaded circuit");
        Ok(circuit)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> UnlearnResult<()> {
        let path = path.as_ref();
        let state: HashMap<String, Tensor> = self
            .entries
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.as_ref().clone()))
            .collect();
        if is_json(path) {
            fade_nn::save_state_dict_json(&state, path)?;
        } else {
            fade_nn::save_state_dict_bincode(&state, path)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Tensor>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn map_entries(
        &self,
        mut f: impl FnMut(&str, &Tensor) -> PureResult<Tensor>,
    ) -> PureResult<Self> {
        let mut entries = BTreeMap::new();
        for (name, tensor) in self.entries.iter() {
            entries.insert(name.clone(), Arc::new(f(name, tensor)?));
        }
        Ok(Self {
            entries: Arc::new(entries),
        })
    }

    /// Applies an elementwise transform to every entry.
    pub fn transform(&self, transform: CircuitTransform) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(name, tensor)| (name.clone(), Arc::new(transform.apply(tensor))))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// `|self| / max(|other|, floor)` per entry. Both circuits must cover the
    /// same names with the same shapes.
    pub fn ratio(&self, other: &Circuit, floor: f32) -> UnlearnResult<Self> {
        let floor = floor.max(f32::MIN_POSITIVE);
        for name in self.names() {
            if other.get(name).is_none() {
                return Err(UnlearnError::MissingCircuitEntry(name.to_string()));
            }
        }
        Ok(self.map_entries(|name, tensor| {
            let Some(denominator) = other.get(name) else {
                return Err(TensorError::MissingParameter {
                    name: name.to_string(),
                });
            };
            tensor.zip_map(denominator, |a, b| a.abs() / b.abs().max(floor))
        })?)
    }

    /// Zeroes, per entry, the elements whose `criterion` score is below the
    /// entry's own `quantile`. Entries without a criterion are kept whole.
    pub fn sparsify_by(&self, criterion: &Circuit, quantile: f64) -> UnlearnResult<Self> {
        if !(0.0..1.0).contains(&quantile) {
            return Err(UnlearnError::config(
                "sparsify_quantile",
                format!("{quantile} not in [0, 1)"),
            ));
        }
        Ok(self.map_entries(|name, tensor| {
            let Some(scores) = criterion.get(name) else {
                return Ok(tensor.clone());
            };
            if scores.shape() != tensor.shape() {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: scores.shape(),
                });
            }
            let k = (scores.len() as f64 * quantile).floor() as usize;
            if k == 0 {
                return Ok(tensor.clone());
            }
            let mut sorted = scores.data().to_vec();
            let (_, kth, _) = sorted.select_nth_unstable_by(k - 1, f32::total_cmp);
            let threshold = *kth;
            tensor.zip_map(scores, |value, score| {
                if score.total_cmp(&threshold).is_lt() {
                    0.0
                } else {
                    value
                }
            })
        })?)
    }

    /// [`Circuit::sparsify_by`] with the entry magnitudes as criterion.
    pub fn sparsify_per_parameter(&self, quantile: f64) -> UnlearnResult<Self> {
        self.sparsify_by(&self.transform(CircuitTransform::Abs), quantile)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("json")
}

/// Closed set of elementwise circuit derivations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CircuitTransform {
    Identity,
    Abs,
    NegAbs,
    /// `1 / max(|x|, floor)`.
    ReciprocalAbs { floor: f32 },
}

impl CircuitTransform {
    pub fn apply(&self, tensor: &Tensor) -> Tensor {
        match *self {
            CircuitTransform::Identity => tensor.clone(),
            CircuitTransform::Abs => tensor.map(f32::abs),
            CircuitTransform::NegAbs => tensor.map(|x| -x.abs()),
            CircuitTransform::ReciprocalAbs { floor } => {
                let floor = floor.max(f32::MIN_POSITIVE);
                tensor.map(|x| 1.0 / x.abs().max(floor))
            }
        }
    }
}

/// Mean gradient of `loss` over `batches` forget batches, for every
/// non-adapter parameter. Descending along it lowers `loss` on the forget
/// distribution, which for the correct-logit loss damages the forget task.
pub fn compute_circuit<M>(
    model: &mut M,
    forget: &mut dyn BatchSource,
    batches: usize,
    loss: TokenLoss,
) -> UnlearnResult<Circuit>
where
    M: LanguageModel + ?Sized,
{
    if batches == 0 {
        return Err(UnlearnError::config("circuit_batches", "must be positive"));
    }
    model.set_active_adapters(&[])?;
    model.only_grad_on(&|name: &str| !name.contains("lora"))?;
    model.zero_accumulators()?;
    for _ in 0..batches {
        let batch = forget.next_batch()?;
        let logits = model.logits(&batch)?;
        let (_, grad) = loss.forward_backward(&logits, &batch)?;
        model.backward_logits(&batch, &grad)?;
    }
    let scale = 1.0 / batches as f32;
    let mut entries = HashMap::new();
    for (name, grad) in model.gradients()? {
        entries.insert(name, grad.scale(scale)?);
    }
    model.zero_accumulators()?;
    tracing::debug!(batches, loss = loss.as_str(), "computed circuit");
    Ok(Circuit::new(entries))
}
