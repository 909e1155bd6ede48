// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::circuit::Circuit;
use crate::error::{UnlearnError, UnlearnResult};
use fade_nn::{Module, PureResult, Tensor};
use std::sync::Arc;

/// Side state of one base weight selected for intervention. The weight itself
/// stays inside the model and is addressed by `name`.
#[derive(Clone, Debug)]
pub struct InterveneParameter {
    name: String,
    pub(crate) disruption_score: Tensor,
    to_forget: Arc<Tensor>,
    pub(crate) retain_grad: Option<Tensor>,
}

impl InterveneParameter {
    fn new(name: String, to_forget: Arc<Tensor>) -> PureResult<Self> {
        let (rows, cols) = to_forget.shape();
        Ok(Self {
            name,
            disruption_score: Tensor::zeros(rows, cols)?,
            to_forget,
            retain_grad: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> (usize, usize) {
        self.to_forget.shape()
    }

    pub fn disruption_score(&self) -> &Tensor {
        &self.disruption_score
    }

    pub fn to_forget(&self) -> &Tensor {
        &self.to_forget
    }

    /// Retain gradient seen by the last disruption update.
    pub fn retain_grad(&self) -> Option<&Tensor> {
        self.retain_grad.as_ref()
    }
}

/// Whether `param` is the weight of the layer named by `target`.
fn matches_target(param: &str, target: &str) -> bool {
    let Some(layer) = param.strip_suffix(".weight") else {
        return false;
    };
    layer == target
        || layer
            .strip_suffix(target)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Base weights eligible for the unlearning update, in model traversal order.
#[derive(Clone, Debug, Default)]
pub struct ParameterInterventionSet {
    params: Vec<InterveneParameter>,
}

impl ParameterInterventionSet {
    /// Selects the weights of every layer named in `targets`. Each target must
    /// match at least one weight and every match needs a circuit entry of the
    /// same shape.
    pub fn select<M>(model: &M, targets: &[String], circuit: &Circuit) -> UnlearnResult<Self>
    where
        M: Module + ?Sized,
    {
        let mut matched = vec![false; targets.len()];
        let mut selected: Vec<(String, (usize, usize))> = Vec::new();
        model.visit_parameters(&mut |param| {
            if param.name().contains("lora") {
                return Ok(());
            }
            let mut hit = false;
            for (index, target) in targets.iter().enumerate() {
                if matches_target(param.name(), target) {
                    matched[index] = true;
                    hit = true;
                }
            }
            if hit {
                selected.push((param.name().to_string(), param.value().shape()));
            }
            Ok(())
        })?;
        if let Some(index) = matched.iter().position(|hit| !hit) {
            return Err(UnlearnError::MissingTarget(targets[index].clone()));
        }

        let mut params = Vec::with_capacity(selected.len());
        for (name, shape) in selected {
            let Some(to_forget) = circuit.get(&name) else {
                return Err(UnlearnError::MissingCircuitEntry(name));
            };
            if to_forget.shape() != shape {
                return Err(UnlearnError::CircuitShape {
                    circuit: to_forget.shape(),
                    param: shape,
                    name,
                });
            }
            params.push(InterveneParameter::new(name, Arc::clone(to_forget))?);
        }
        tracing::debug!(count = params.len(), "selected intervention parameters");
        Ok(Self { params })
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterveneParameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InterveneParameter> {
        self.params.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&InterveneParameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Zeroes every disruption score and forgets the stored retain gradients.
    pub fn reset_scores(&mut self) {
        for param in &mut self.params {
            param.disruption_score.data_mut().fill(0.0);
            param.retain_grad = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fade_nn::{TinyLm, TinyLmConfig};
    use std::collections::HashMap;

    fn model() -> TinyLm {
        TinyLm::new(TinyLmConfig {
            vocab_size: 5,
            d_model: 3,
            d_hidden: 4,
            seed: Some(1),
        })
        .unwrap()
    }

    fn circuit_for(model: &TinyLm) -> Circuit {
        Circuit::new(
            model
                .state_dict()
                .unwrap()
                .into_iter()
                .map(|(name, value)| (name, value.map(|_| 1.0)))
                .collect(),
        )
    }

    fn targets(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn selects_weights_not_biases() {
        let model = model();
        let set = ParameterInterventionSet::select(
            &model,
            &targets(&["mlp.up", "down"]),
            &circuit_for(&model),
        )
        .unwrap();
        assert_eq!(
            set.names().collect::<Vec<_>>(),
            vec!["mlp.up.weight", "mlp.down.weight"]
        );
        let up = set.get("mlp.up.weight").unwrap();
        assert_eq!(up.shape(), (3, 4));
        assert!(up.disruption_score().data().iter().all(|&v| v == 0.0));
        assert!(up.retain_grad().is_none());
    }

    #[test]
    fn configuration_errors_are_reported() {
        let model = model();
        let circuit = circuit_for(&model);
        assert!(matches!(
            ParameterInterventionSet::select(&model, &targets(&["attn"]), &circuit),
            Err(UnlearnError::MissingTarget(name)) if name == "attn"
        ));

        let empty = Circuit::new(HashMap::new());
        assert!(matches!(
            ParameterInterventionSet::select(&model, &targets(&["head"]), &empty),
            Err(UnlearnError::MissingCircuitEntry(name)) if name == "head.weight"
        ));

        let mut wrong = HashMap::new();
        wrong.insert("head.weight".to_string(), Tensor::zeros(1, 1).unwrap());
        assert!(matches!(
            ParameterInterventionSet::select(&model, &targets(&["head"]), &Circuit::new(wrong)),
            Err(UnlearnError::CircuitShape { param: (3, 5), .. })
        ));
    }

    #[test]
    fn target_matching_respects_segments() {
        assert!(matches_target("mlp.up.weight", "mlp.up"));
        assert!(matches_target("mlp.up.weight", "up"));
        assert!(!matches_target("mlp.up.weight", "p.up"));
        assert!(!matches_target("mlp.up.bias", "mlp.up"));
    }
}
