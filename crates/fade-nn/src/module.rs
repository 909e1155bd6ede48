// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with an Euclidean gradient slot and a gradient
/// tracking flag.
///
/// When `requires_grad` is off, backward passes leave the slot untouched so
/// parameters outside the active trainable subset never see a gradient.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
    requires_grad: bool,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={},requires_grad={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some(),
            self.requires_grad
        )
    }
}

impl Parameter {
    /// Creates a new parameter with gradient tracking enabled.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
            requires_grad: true,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently cached Euclidean gradient.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, enabled: bool) {
        self.requires_grad = enabled;
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a Euclidean gradient update. A no-op when gradient
    /// tracking is disabled.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        if !self.requires_grad {
            return Ok(());
        }
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Overwrites the gradient slot, bypassing the tracking flag. Used when a
    /// caller replaces the task gradient with a hand-built update direction.
    pub fn set_gradient(&mut self, gradient: Option<Tensor>) -> PureResult<()> {
        if let Some(grad) = gradient.as_ref() {
            self.assert_shape(grad)?;
        }
        self.gradient = gradient;
        Ok(())
    }

    /// Drops the cached gradient entirely.
    pub fn zero_gradient(&mut self) {
        self.gradient = None;
    }

    /// Plain gradient descent with the supplied learning rate. Parameters
    /// without a gradient are left untouched.
    pub fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        if let Some(grad) = self.gradient.as_ref() {
            self.value.add_scaled(grad, -lr)?;
        }
        Ok(())
    }

    /// Scales the accumulated gradient by the provided factor.
    pub fn scale_gradient(&mut self, factor: f32) {
        if !factor.is_finite() {
            return;
        }
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value *= factor;
            }
        }
    }

    /// Returns the squared L2 norm of the accumulated gradient.
    pub fn gradient_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| {
                grad.data()
                    .iter()
                    .map(|&value| {
                        let v = value as f64;
                        v * v
                    })
                    .sum::<f64>()
            })
            .unwrap_or(0.0)
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Minimal `nn.Module` style surface: forward, backward into parameter
/// accumulators, and named parameter traversal.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations populate the
    /// accumulators of parameters that track gradients before returning the
    /// gradient with respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Enables gradient tracking exactly on the parameters accepted by
    /// `predicate` and disables it everywhere else.
    fn only_grad_on(&mut self, predicate: &dyn Fn(&str) -> bool) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let enabled = predicate(param.name());
            param.set_requires_grad(enabled);
            Ok(())
        })
    }

    /// Names of every parameter, in traversal order.
    fn parameter_names(&self) -> PureResult<Vec<String>> {
        let mut names = Vec::new();
        self.visit_parameters(&mut |param| {
            names.push(param.name().to_string());
            Ok(())
        })?;
        Ok(names)
    }

    /// Snapshot of every gradient currently held, keyed by parameter name.
    fn gradients(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut grads = HashMap::new();
        self.visit_parameters(&mut |param| {
            if let Some(grad) = param.gradient() {
                grads.insert(param.name().to_string(), grad.clone());
            }
            Ok(())
        })?;
        Ok(grads)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}
