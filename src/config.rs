//! Model and runtime configuration.
//!
//! Hyperparameters are plain serde structs so an experiment can be described in JSON.
//! Numeric state that would otherwise be process-global (seed, device, dtype) lives in
//! [`RuntimeConfig`] and is handed to each model at construction.

use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Floating-point precision of parameters and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F64,
}

impl Precision {
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
        }
    }
}

/// Where tensors are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

/// Seed, device and precision for one model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seed for parameter init and dropout masks.
    pub seed: u64,
    pub precision: Precision,
    pub device: DeviceKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            precision: Precision::F32,
            device: DeviceKind::Cpu,
        }
    }
}

impl RuntimeConfig {
    /// CPU, f32, with the given seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Resolve the candle device. Fails when the backend was not compiled in.
    pub fn device(&self) -> Result<Device> {
        let device = match self.device {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceKind::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }
}

/// Width of the gate projection in the source experiments.
pub const DEFAULT_GATE_IN_FEATURES: usize = 16;

fn default_gate_in() -> usize {
    DEFAULT_GATE_IN_FEATURES
}

fn default_true() -> bool {
    true
}

fn default_lambda() -> f64 {
    0.5
}

fn default_dropout() -> f64 {
    0.5
}

/// Hyperparameters of the plain and residual GCN stacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcnConfig {
    pub nfeat: usize,
    pub nhid: usize,
    pub nclass: usize,
    /// Total number of graph-convolution layers, boundary layers included.
    pub num_layers: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// Depth-decay strength in `theta = ln(lambda / l + 1)`.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    /// Input width of every layer's gate. The gate reads the message-passed features,
    /// so this must equal the layer input width for a forward pass to succeed.
    #[serde(default = "default_gate_in")]
    pub gate_in_features: usize,
    #[serde(default = "default_true")]
    pub residual: bool,
    #[serde(default = "default_true")]
    pub variant: bool,
}

impl GcnConfig {
    /// A config with the source defaults for everything but the widths and depth.
    #[must_use]
    pub fn new(nfeat: usize, nhid: usize, nclass: usize, num_layers: usize) -> Self {
        Self {
            nfeat,
            nhid,
            nclass,
            num_layers,
            dropout: default_dropout(),
            lambda: default_lambda(),
            gate_in_features: DEFAULT_GATE_IN_FEATURES,
            residual: true,
            variant: true,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers < 2 {
            return Err(Error::InvalidConfig(format!(
                "num_layers must be at least 2, got {}",
                self.num_layers
            )));
        }
        check_widths(&[
            ("nfeat", self.nfeat),
            ("nhid", self.nhid),
            ("nclass", self.nclass),
            ("gate_in_features", self.gate_in_features),
        ])?;
        check_dropout(self.dropout)?;
        check_lambda(self.lambda)
    }
}

/// Hyperparameters of the GCNII model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcniiConfig {
    pub nfeat: usize,
    /// Number of graph-convolution layers between the two projections.
    pub nlayers: usize,
    pub nhidden: usize,
    pub nclass: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default)]
    pub variant: bool,
    #[serde(default = "default_gate_in")]
    pub gate_in_features: usize,
    #[serde(default = "default_true")]
    pub residual: bool,
}

impl GcniiConfig {
    #[must_use]
    pub fn new(nfeat: usize, nlayers: usize, nhidden: usize, nclass: usize) -> Self {
        Self {
            nfeat,
            nlayers,
            nhidden,
            nclass,
            dropout: default_dropout(),
            lambda: default_lambda(),
            variant: false,
            gate_in_features: DEFAULT_GATE_IN_FEATURES,
            residual: true,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        check_widths(&[
            ("nfeat", self.nfeat),
            ("nhidden", self.nhidden),
            ("nclass", self.nclass),
            ("gate_in_features", self.gate_in_features),
        ])?;
        check_dropout(self.dropout)?;
        check_lambda(self.lambda)
    }
}

fn check_widths(widths: &[(&str, usize)]) -> Result<()> {
    for (name, width) in widths {
        if *width == 0 {
            return Err(Error::InvalidConfig(format!("{name} must be positive")));
        }
    }
    Ok(())
}

fn check_dropout(p: f64) -> Result<()> {
    if !(0.0..1.0).contains(&p) {
        return Err(Error::InvalidConfig(format!(
            "dropout must lie in [0, 1), got {p}"
        )));
    }
    Ok(())
}

fn check_lambda(lambda: f64) -> Result<()> {
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "lambda must be finite and non-negative, got {lambda}"
        )));
    }
    Ok(())
}
