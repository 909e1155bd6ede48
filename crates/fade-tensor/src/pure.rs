// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense row-major tensors used by every layer, optimiser, and unlearning
//! primitive in the workspace.
//!
//! Storage is reference counted so cloning a tensor is cheap; mutation goes
//! through [`Arc::make_mut`] and therefore copies only when the buffer is
//! shared. Everything is single threaded and deterministic for a fixed seed.

use core::fmt;
use fade_config::determinism;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

/// Fallible tensor operations.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor constructors and operators.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rate must be positive for optimisers.
    NonPositiveLearningRate { rate: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// A token id fell outside the vocabulary of an embedding or head.
    TokenOutOfRange { token: usize, vocab: usize },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "parameter '{name}' was not found")
            }
            TensorError::IoError { message } => write!(f, "i/o error: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization error: {message}")
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "{label} produced a non-finite value ({value})")
            }
            TensorError::TokenOutOfRange { token, vocab } => {
                write!(f, "token id {token} is outside the vocabulary of size {vocab}")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value for {label}"),
        }
    }
}

impl Error for TensorError {}

/// A simple 2D tensor backed by a reference-counted row-major buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredTensor", into = "StoredTensor")]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl From<Tensor> for StoredTensor {
    fn from(tensor: Tensor) -> Self {
        StoredTensor {
            rows: tensor.rows,
            cols: tensor.cols,
            data: tensor.data.as_ref().clone(),
        }
    }
}

impl TryFrom<StoredTensor> for Tensor {
    type Error = TensorError;

    fn try_from(stored: StoredTensor) -> Result<Self, Self::Error> {
        Tensor::from_vec(stored.rows, stored.cols, stored.data)
    }
}

impl Tensor {
    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_vec(rows, cols, vec![0.0; rows * cols])
    }

    /// Row-major `data` of exactly `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise the process-wide determinism settings apply.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed, "fade-tensor/tensor/uniform");
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(&mut rng))
            .collect();
        Self::from_vec(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed, "fade-tensor/tensor/normal");
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_vec(rows, cols, data)
    }

    /// `f(row, col)` for every coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_vec(rows, cols, data)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Constructors reject empty shapes, so this only holds for degenerate
    /// buffers produced by future views.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[f32] {
        self.data.as_slice()
    }

    /// Mutable access to the buffer, copying it first when shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Row slice at `index`.
    pub fn row(&self, index: usize) -> &[f32] {
        let offset = index * self.cols;
        &self.data[offset..offset + self.cols]
    }

    fn ensure_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut dst = vec![0.0f32; rows * cols];
        for (dst_row, lhs_row) in dst.chunks_mut(cols).zip(self.data.chunks(inner)) {
            matmul_row(dst_row, lhs_row, other.data(), cols);
        }
        Tensor::from_vec(rows, cols, dst)
    }

    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_map(other, |a, b| a - b)
    }

    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        Ok(self.map(|a| a * value))
    }

    /// Applies `f` element-wise.
    pub fn map<F>(&self, mut f: F) -> Tensor
    where
        F: FnMut(f32) -> f32,
    {
        Tensor {
            data: Arc::new(self.data.iter().map(|&v| f(v)).collect()),
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Combines two equally shaped tensors element-wise.
    pub fn zip_map<F>(&self, other: &Tensor, mut f: F) -> PureResult<Tensor>
    where
        F: FnMut(f32, f32) -> f32,
    {
        self.ensure_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.ensure_same_shape(other)?;
        let data = Arc::make_mut(&mut self.data);
        for (a, b) in data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Broadcasts `bias` over the rows.
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += b;
            }
        }
        Ok(())
    }

    pub fn relu_inplace(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        for value in data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Column sums; the bias gradient of a batch.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        }
        sums
    }

    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// True when every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

#[inline]
fn matmul_row(dst_row: &mut [f32], lhs_row: &[f32], rhs: &[f32], cols: usize) {
    for (k, &a) in lhs_row.iter().enumerate() {
        if a == 0.0 {
            continue;
        }
        let rhs_row = &rhs[k * cols..(k + 1) * cols];
        for (d, &b) in dst_row.iter_mut().zip(rhs_row) {
            *d += a * b;
        }
    }
}
