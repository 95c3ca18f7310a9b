//! Seeded randomness for parameter init and dropout.
//!
//! candle's CPU backend cannot be reseeded, so every random draw in this crate goes
//! through a per-model [`ParamRng`] and is uploaded as a tensor. Parameters land in a
//! `candle_nn::VarMap` under dotted names, the way `VarBuilder::pp` lays them out.

use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::VarMap;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// A model's random stream.
#[derive(Debug)]
pub struct ParamRng(Mutex<StdRng>);

impl ParamRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    /// Lock the stream. A poisoned lock still holds a usable generator.
    pub fn lock(&self) -> MutexGuard<'_, StdRng> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Tensor of `shape` with entries drawn uniformly from `[-bound, bound]`.
pub fn uniform<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    bound: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    if !bound.is_finite() || bound < 0.0 {
        return Err(Error::InvalidConfig(format!(
            "uniform bound must be finite and non-negative, got {bound}"
        )));
    }
    let shape = shape.into();
    let dist = Uniform::new_inclusive(-bound, bound);
    let values: Vec<f64> = dist.sample_iter(rng).take(shape.elem_count()).collect();
    Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
}

/// Overwrite `var` in place with a uniform draw of the same shape.
pub fn reset_uniform(rng: &mut StdRng, var: &Var, bound: f64) -> Result<()> {
    let fresh = uniform(rng, var.shape().clone(), bound, var.dtype(), var.device())?;
    var.set(&fresh)?;
    Ok(())
}

/// Allocates seeded parameters into a [`VarMap`] under dotted path names.
#[derive(Clone)]
pub struct ParamBuilder<'a> {
    varmap: &'a VarMap,
    path: Vec<String>,
    dtype: DType,
    device: &'a Device,
}

impl<'a> ParamBuilder<'a> {
    #[must_use]
    pub fn new(varmap: &'a VarMap, dtype: DType, device: &'a Device) -> Self {
        Self {
            varmap,
            path: Vec::new(),
            dtype,
            device,
        }
    }

    /// A builder whose names are prefixed with `name`.
    #[must_use]
    pub fn pp<S: ToString>(&self, name: S) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Self {
            path,
            ..self.clone()
        }
    }

    fn full_name(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path.join("."))
        }
    }

    /// Draw `shape` uniformly in `±bound`, register it as `<prefix>.<name>`.
    pub fn uniform<S: Into<Shape>>(
        &self,
        rng: &mut StdRng,
        shape: S,
        name: &str,
        bound: f64,
    ) -> Result<Var> {
        let var = Var::from_tensor(&uniform(rng, shape, bound, self.dtype, self.device)?)?;
        self.varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.full_name(name), var.clone());
        Ok(var)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        self.device
    }
}

/// Inverted dropout. Identity in eval mode or when `p == 0`.
pub fn dropout(xs: &Tensor, p: f64, train: bool, rng: &mut StdRng) -> Result<Tensor> {
    if !train || p == 0.0 {
        return Ok(xs.clone());
    }
    let scale = 1.0 / (1.0 - p);
    let mask: Vec<f64> = (0..xs.elem_count())
        .map(|_| if rng.gen::<f64>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, xs.shape().clone(), xs.device())?.to_dtype(xs.dtype())?;
    Ok(xs.mul(&mask)?)
}
