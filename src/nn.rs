//! Graph convolution with a learned residual gate, plus the dense projection used at
//! model boundaries.

use candle_core::{Tensor, Var};
use candle_nn::{Linear, Module};
use rand::rngs::StdRng;
use tracing::debug;

use crate::config::DEFAULT_GATE_IN_FEATURES;
use crate::error::{Error, Result};
use crate::graph::Adjacency;
use crate::init::{self, ParamBuilder};

/// Depth-decay weight of the transformed branch: `ln(lambda / layer + 1)`.
///
/// Decreases monotonically in `layer` for `lambda > 0`. Layers are numbered from 1.
pub fn theta(lambda: f64, layer: usize) -> Result<f64> {
    if layer == 0 {
        return Err(Error::InvalidLayerIndex(layer));
    }
    Ok((lambda / layer as f64 + 1.0).ln())
}

fn check_width(what: &str, width: usize) -> Result<()> {
    if width == 0 {
        return Err(Error::InvalidConfig(format!("{what} must be positive")));
    }
    Ok(())
}

/// Dense affine projection `x W^T + b`, initialized like a torch `nn.Linear`
/// (weight and bias uniform in `±1/sqrt(in_features)`).
pub struct Dense {
    weight: Var,
    bias: Var,
    linear: Linear,
    in_features: usize,
    out_features: usize,
}

impl Dense {
    /// Registers `weight` and `bias` under `pb`'s prefix.
    pub fn new(
        in_features: usize,
        out_features: usize,
        pb: &ParamBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        check_width("dense in_features", in_features)?;
        check_width("dense out_features", out_features)?;
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = pb.uniform(rng, (out_features, in_features), "weight", bound)?;
        let bias = pb.uniform(rng, out_features, "bias", bound)?;
        let linear = Linear::new(weight.as_tensor().clone(), Some(bias.as_tensor().clone()));
        Ok(Self {
            weight,
            bias,
            linear,
            in_features,
            out_features,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.linear.forward(x)?)
    }

    pub fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        let bound = 1.0 / (self.in_features as f64).sqrt();
        init::reset_uniform(rng, &self.weight, bound)?;
        init::reset_uniform(rng, &self.bias, bound)
    }

    /// Weight of shape (out_features, in_features).
    #[must_use]
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    #[must_use]
    pub fn bias(&self) -> &Var {
        &self.bias
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    #[must_use]
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Per-layer switches of a [`GraphConvolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOptions {
    /// Add the layer input to its output. Needs `in_features == out_features`.
    pub residual: bool,
    /// Transform `[A·x, h0]` instead of the gated mix, doubling the weight's rows.
    pub variant: bool,
    /// Input width of the gate projection.
    pub gate_in_features: usize,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            residual: true,
            variant: true,
            gate_in_features: DEFAULT_GATE_IN_FEATURES,
        }
    }
}

/// Graph convolution layer with a learned residual gate.
///
/// Implements:
///
/// ```text
/// hi      = A · x
/// alpha   = hi W_g^T + b_g                       (N x 1, unbounded)
/// r       = (1 - alpha) * hi + alpha * h0
/// support = [hi, h0] if variant else r
/// out     = theta * support · W + (1 - theta) * r   (+ x if residual)
/// theta   = ln(lambda / l + 1)
/// ```
///
/// The gate reads `hi` directly, so its input width must equal the layer input width.
/// `r` is added to an `out_features`-wide product, so the layer only runs when
/// `in_features == out_features`. Violations are reported as
/// [`Error::ShapeMismatch`], never repaired.
pub struct GraphConvolution {
    weight: Var,
    gate: Dense,
    in_features: usize,
    out_features: usize,
    residual: bool,
    variant: bool,
}

impl GraphConvolution {
    /// Registers `weight` under `pb`'s prefix and the gate under `gate`.
    pub fn new(
        in_features: usize,
        out_features: usize,
        options: ConvOptions,
        pb: &ParamBuilder,
        rng: &mut StdRng,
    ) -> Result<Self> {
        check_width("in_features", in_features)?;
        check_width("out_features", out_features)?;
        check_width("gate_in_features", options.gate_in_features)?;
        let rows = if options.variant {
            2 * in_features
        } else {
            in_features
        };
        let bound = Self::bound(out_features);
        let weight = pb.uniform(rng, (rows, out_features), "weight", bound)?;
        let gate = Dense::new(options.gate_in_features, 1, &pb.pp("gate"), rng)?;
        Ok(Self {
            weight,
            gate,
            in_features,
            out_features,
            residual: options.residual,
            variant: options.variant,
        })
    }

    fn bound(out_features: usize) -> f64 {
        1.0 / (out_features as f64).sqrt()
    }

    /// Redraw `W` uniformly in `±1/sqrt(out_features)`. The gate keeps its weights.
    pub fn reset_parameters(&self, rng: &mut StdRng) -> Result<()> {
        init::reset_uniform(rng, &self.weight, Self::bound(self.out_features))
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `input`: node features (N x in_features)
    /// - `adj`: normalized adjacency operator
    /// - `h0`: reference features mixed in by the gate (same shape as `adj · input`)
    /// - `lambda`: depth-decay strength
    /// - `layer`: 1-based depth of this layer
    pub fn forward(
        &self,
        input: &Tensor,
        adj: &Adjacency,
        h0: &Tensor,
        lambda: f64,
        layer: usize,
    ) -> Result<Tensor> {
        let theta = theta(lambda, layer)?;
        let hi = adj.matmul(input)?;
        let (n, width) = hi.dims2()?;

        let gate_in = self.gate.in_features();
        if width != gate_in {
            return Err(Error::shape("gate input", &[n, gate_in], &[n, width]));
        }
        if h0.dims() != hi.dims() {
            return Err(Error::shape("initial features", hi.dims(), h0.dims()));
        }

        let alpha = self.gate.forward(&hi)?;
        let r = hi
            .broadcast_mul(&alpha.affine(-1.0, 1.0)?)?
            .add(&h0.broadcast_mul(&alpha)?)?;
        let support = if self.variant {
            Tensor::cat(&[&hi, h0], 1)?
        } else {
            r.clone()
        };

        let rows = self.weight.dim(0)?;
        if support.dim(1)? != rows {
            return Err(Error::shape("support", &[n, rows], support.dims()));
        }
        if width != self.out_features {
            return Err(Error::shape(
                "residual mix",
                &[n, self.out_features],
                &[n, width],
            ));
        }

        debug!(layer, theta, variant = self.variant, "graph convolution");
        let out = support
            .matmul(self.weight.as_tensor())?
            .affine(theta, 0.0)?
            .add(&r.affine(1.0 - theta, 0.0)?)?;

        if !self.residual {
            return Ok(out);
        }
        if input.dims() != out.dims() {
            return Err(Error::shape("residual add", out.dims(), input.dims()));
        }
        Ok(out.add(input)?)
    }

    /// Weight of shape (in_features or 2·in_features, out_features).
    #[must_use]
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    #[must_use]
    pub fn gate(&self) -> &Dense {
        &self.gate
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    #[must_use]
    pub fn is_residual(&self) -> bool {
        self.residual
    }

    #[must_use]
    pub fn is_variant(&self) -> bool {
        self.variant
    }

    #[must_use]
    pub fn parameters(&self) -> Vec<Var> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.gate.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init::ParamRng;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use proptest::prelude::*;

    const N: usize = 5;
    const F: usize = 4;

    fn opts(residual: bool, variant: bool) -> ConvOptions {
        ConvOptions {
            residual,
            variant,
            gate_in_features: F,
        }
    }

    fn build(in_f: usize, out_f: usize, options: ConvOptions) -> Result<GraphConvolution> {
        let varmap = VarMap::new();
        let dev = Device::Cpu;
        let pb = ParamBuilder::new(&varmap, DType::F32, &dev);
        let rng = ParamRng::new(7);
        let mut rng = rng.lock();
        GraphConvolution::new(in_f, out_f, options, &pb, &mut rng)
    }

    fn layer(in_f: usize, out_f: usize, options: ConvOptions) -> GraphConvolution {
        build(in_f, out_f, options).unwrap()
    }

    fn features(n: usize, f: usize) -> Tensor {
        let values: Vec<f32> = (0..n * f).map(|i| (i as f32 * 0.37).sin()).collect();
        Tensor::from_vec(values, (n, f), &Device::Cpu).unwrap()
    }

    fn ring(n: usize) -> Adjacency {
        let edges: Vec<_> = (0..n).map(|i| (i, (i + 1) % n)).collect();
        Adjacency::from_edges(n, &edges, crate::graph::Normalization::Row, &Device::Cpu).unwrap()
    }

    /// Gate forced to a constant `alpha` for every node.
    fn pin_gate(conv: &GraphConvolution, alpha: f32) {
        let dev = Device::Cpu;
        let w = conv.gate().weight();
        w.set(&Tensor::zeros(w.shape().clone(), DType::F32, &dev).unwrap())
            .unwrap();
        conv.gate()
            .bias()
            .set(&Tensor::new(&[alpha], &dev).unwrap())
            .unwrap();
    }

    fn scaled_identity(rows: usize, scale: f64) -> Tensor {
        Tensor::eye(rows, DType::F32, &Device::Cpu)
            .unwrap()
            .affine(scale, 0.0)
            .unwrap()
    }

    #[test]
    fn theta_literal() {
        assert!((theta(0.5, 1).unwrap() - 0.405_465).abs() < 1e-6);
        assert!(matches!(theta(0.5, 0), Err(Error::InvalidLayerIndex(0))));
    }

    #[test]
    fn plain_layer_output_shape() {
        let conv = layer(F, F, opts(false, false));
        let x = features(N, F);
        let y = conv.forward(&x, &ring(N), &x, 0.5, 1).unwrap();
        assert_eq!(y.dims(), &[N, F]);
    }

    #[test]
    fn variant_layer_doubles_weight_rows() {
        let conv = layer(F, F, opts(true, true));
        assert_eq!(conv.weight().dims(), &[2 * F, F]);
        let x = features(N, F);
        let y = conv.forward(&x, &ring(N), &x, 0.5, 3).unwrap();
        assert_eq!(y.dims(), &[N, F]);
    }

    #[test]
    fn closed_form_with_zero_gate() {
        // alpha = 0, A = I: r = x, out = theta * x * 2I + (1 - theta) * x = (1 + theta) x
        let conv = layer(F, F, opts(false, false));
        pin_gate(&conv, 0.0);
        conv.weight().set(&scaled_identity(F, 2.0)).unwrap();

        let x = features(N, F);
        let adj = Adjacency::identity(N, &Device::Cpu).unwrap();
        let t = theta(0.5, 2).unwrap() as f32;
        let y = conv.forward(&x, &adj, &x, 0.5, 2).unwrap();

        let expected = x.affine(1.0 + t as f64, 0.0).unwrap();
        for (a, b) in y
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .zip(expected.flatten_all().unwrap().to_vec1::<f32>().unwrap())
        {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn full_gate_selects_reference_features() {
        // alpha = 1: r = h0, support = [hi, h0]; W = [0; I] maps support to h0.
        let conv = layer(F, F, opts(true, true));
        pin_gate(&conv, 1.0);
        let dev = Device::Cpu;
        let w = Tensor::cat(
            &[
                Tensor::zeros((F, F), DType::F32, &dev).unwrap(),
                scaled_identity(F, 1.0),
            ],
            0,
        )
        .unwrap();
        conv.weight().set(&w).unwrap();

        let x = features(N, F);
        let h0 = Tensor::ones((N, F), DType::F32, &dev).unwrap();
        let y = conv.forward(&x, &ring(N), &h0, 1.0, 1).unwrap();

        // theta * h0 + (1 - theta) * h0 + x
        let expected = h0.add(&x).unwrap();
        let diff = y
            .sub(&expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "max deviation {diff}");
    }

    #[test]
    fn output_tracks_depth() {
        // alpha = 0, A = I, W = 2I: out = (1 + theta_l) x, shrinking as l grows.
        let conv = layer(F, F, opts(false, false));
        pin_gate(&conv, 0.0);
        conv.weight().set(&scaled_identity(F, 2.0)).unwrap();
        let x = Tensor::ones((N, F), DType::F32, &Device::Cpu).unwrap();
        let adj = Adjacency::identity(N, &Device::Cpu).unwrap();

        let mut previous = f32::INFINITY;
        for l in 1..=4 {
            let y = conv.forward(&x, &adj, &x, 0.5, l).unwrap();
            let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let expected = 1.0 + theta(0.5, l).unwrap() as f32;
            assert!(values.iter().all(|v| (v - expected).abs() < 1e-5), "layer {l}");
            assert!(expected < previous);
            previous = expected;
        }
    }

    #[test]
    fn zero_widths_are_rejected() {
        for (in_f, out_f) in [(F, 0), (0, F)] {
            let err = build(in_f, out_f, opts(false, false)).err();
            assert!(matches!(err, Some(Error::InvalidConfig(_))), "{in_f} -> {out_f}");
        }
        let zero_gate = ConvOptions {
            gate_in_features: 0,
            ..opts(false, false)
        };
        assert!(matches!(build(F, F, zero_gate), Err(Error::InvalidConfig(_))));

        let varmap = VarMap::new();
        let dev = Device::Cpu;
        let pb = ParamBuilder::new(&varmap, DType::F32, &dev);
        let rng = ParamRng::new(0);
        let mut rng = rng.lock();
        assert!(matches!(
            Dense::new(0, 3, &pb, &mut rng),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn parameters_are_named_by_role() {
        let varmap = VarMap::new();
        let dev = Device::Cpu;
        let pb = ParamBuilder::new(&varmap, DType::F32, &dev);
        let rng = ParamRng::new(0);
        let mut rng = rng.lock();
        GraphConvolution::new(F, F, opts(true, true), &pb.pp("conv"), &mut rng).unwrap();

        let mut names: Vec<_> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["conv.gate.bias", "conv.gate.weight", "conv.weight"]);
    }

    #[test]
    fn default_gate_width_rejects_other_hidden_sizes() {
        let conv = layer(F, F, ConvOptions::default());
        let x = features(N, F);
        match conv.forward(&x, &ring(N), &x, 0.5, 1).unwrap_err() {
            Error::ShapeMismatch {
                context, expected, ..
            } => {
                assert_eq!(context, "gate input");
                assert_eq!(expected, vec![N, DEFAULT_GATE_IN_FEATURES]);
            }
            other => panic!("expected gate mismatch, got {other}"),
        }
    }

    #[test]
    fn width_change_is_rejected() {
        let conv = layer(F, 3, opts(false, false));
        let x = features(N, F);
        let err = conv.forward(&x, &ring(N), &x, 0.5, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                context: "residual mix",
                ..
            }
        ));
    }

    #[test]
    fn mismatched_reference_is_rejected() {
        let conv = layer(F, F, opts(false, true));
        let x = features(N, F);
        let h0 = features(N, F + 1);
        let err = conv.forward(&x, &ring(N), &h0, 0.5, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                context: "initial features",
                ..
            }
        ));
    }

    #[test]
    fn gradients_reach_weight_and_gate() {
        let conv = layer(F, F, opts(true, true));
        let x = features(N, F);
        let y = conv.forward(&x, &ring(N), &x, 0.5, 1).unwrap();
        let grads = y.sqr().unwrap().sum_all().unwrap().backward().unwrap();
        for p in conv.parameters() {
            assert!(grads.get(p.as_tensor()).is_some());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            max_shrink_iters: 0,
            .. ProptestConfig::default()
        })]

        #[test]
        fn prop_theta_decreases_with_depth(lambda in 0.01f64..10.0, l in 1usize..512) {
            prop_assert!(theta(lambda, l + 1).unwrap() < theta(lambda, l).unwrap());
        }

        #[test]
        fn prop_reset_stays_in_bound(out_f in 1usize..64, seed in any::<u64>()) {
            let varmap = VarMap::new();
            let dev = Device::Cpu;
            let pb = ParamBuilder::new(&varmap, DType::F32, &dev);
            let rng = ParamRng::new(seed);
            let mut rng = rng.lock();
            let conv = GraphConvolution::new(3, out_f, ConvOptions::default(), &pb, &mut rng)
                .unwrap();
            conv.reset_parameters(&mut rng).unwrap();
            let bound = 1.0 / (out_f as f32).sqrt();
            let values = conv.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            prop_assert!(values.iter().all(|v| v.abs() <= bound + 1e-6));
        }
    }
}
