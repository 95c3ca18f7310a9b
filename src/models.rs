//! Layer stacks: GCN, Residual-GCN and GCNII.
//!
//! All three end in a log-softmax over classes and report their final pre-softmax
//! representation to an [`EmbeddingSink`] once per forward pass.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::log_softmax;
use candle_nn::VarMap;
use tracing::{info, warn};

use crate::config::{GcnConfig, GcniiConfig, RuntimeConfig};
use crate::error::{Error, Result};
use crate::graph::Adjacency;
use crate::init::{self, ParamBuilder, ParamRng};
use crate::nn::{ConvOptions, Dense, GraphConvolution};
use crate::sink::{Architecture, EmbeddingRecord, EmbeddingSink, NoopSink};

/// A node classifier over a fixed graph.
pub trait GraphModel {
    /// Log-probabilities (N x nclass). Dropout is active only when `train` is set.
    fn forward_t(&self, x: &Tensor, adj: &Adjacency, train: bool) -> Result<Tensor>;

    /// Evaluation-mode forward pass.
    fn forward(&self, x: &Tensor, adj: &Adjacency) -> Result<Tensor> {
        self.forward_t(x, adj, false)
    }

    /// Every trainable variable, e.g. for `candle_nn::AdamW::new`. Order is unspecified.
    fn parameters(&self) -> Vec<Var>;

    fn reset_parameters(&self) -> Result<()>;

    fn architecture(&self) -> Architecture;

    /// Number of graph-convolution layers.
    fn num_layers(&self) -> usize;
}

fn conv_options(residual: bool, variant: bool, gate_in_features: usize) -> ConvOptions {
    ConvOptions {
        residual,
        variant,
        gate_in_features,
    }
}

/// Plain stack of gated graph convolutions.
///
/// `nfeat → nhid → … → nhid → nclass`, ReLU and dropout between layers. Every layer
/// mixes in the stack input `x` through its gate, at depth `l = i + 1`.
pub struct Gcn {
    architecture: Architecture,
    convs: Vec<GraphConvolution>,
    varmap: VarMap,
    dropout: f64,
    lambda: f64,
    rng: ParamRng,
    sink: Arc<dyn EmbeddingSink>,
    device: Device,
    dtype: DType,
}

impl Gcn {
    /// Build a GCN stack. Its embeddings are tagged [`Architecture::Gcn`].
    pub fn new(config: &GcnConfig, runtime: &RuntimeConfig) -> Result<Self> {
        Self::build(Architecture::Gcn, config, runtime)
    }

    /// Build a Residual-GCN stack. Same computation, tagged
    /// [`Architecture::ResidualGcn`].
    pub fn residual(config: &GcnConfig, runtime: &RuntimeConfig) -> Result<Self> {
        Self::build(Architecture::ResidualGcn, config, runtime)
    }

    fn build(
        architecture: Architecture,
        config: &GcnConfig,
        runtime: &RuntimeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let device = runtime.device()?;
        let dtype = runtime.dtype();
        let rng = ParamRng::new(runtime.seed);
        let options = conv_options(config.residual, config.variant, config.gate_in_features);

        let mut widths = vec![config.nfeat];
        widths.extend(std::iter::repeat(config.nhid).take(config.num_layers - 1));
        widths.push(config.nclass);

        let varmap = VarMap::new();
        let convs = {
            let pb = ParamBuilder::new(&varmap, dtype, &device).pp("convs");
            let mut rng = rng.lock();
            widths
                .windows(2)
                .enumerate()
                .map(|(i, w)| GraphConvolution::new(w[0], w[1], options, &pb.pp(i), &mut rng))
                .collect::<Result<Vec<_>>>()?
        };

        if widths.iter().any(|&w| w != config.gate_in_features) {
            warn!(
                ?architecture,
                nfeat = config.nfeat,
                nhid = config.nhid,
                nclass = config.nclass,
                gate_in_features = config.gate_in_features,
                "layer widths differ from the gate width; forward passes will fail"
            );
        }
        info!(
            ?architecture,
            num_layers = config.num_layers,
            nfeat = config.nfeat,
            nhid = config.nhid,
            nclass = config.nclass,
            "built gcn stack"
        );

        Ok(Self {
            architecture,
            convs,
            varmap,
            dropout: config.dropout,
            lambda: config.lambda,
            rng,
            sink: Arc::new(NoopSink),
            device,
            dtype,
        })
    }

    /// Replace the embedding sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EmbeddingSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn layers(&self) -> &[GraphConvolution] {
        &self.convs
    }

    /// Parameters by name: `convs.<i>.weight`, `convs.<i>.gate.{weight,bias}`.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

impl GraphModel for Gcn {
    fn forward_t(&self, x: &Tensor, adj: &Adjacency, train: bool) -> Result<Tensor> {
        let Some((last, hidden)) = self.convs.split_last() else {
            return Err(Error::InvalidConfig("empty layer stack".into()));
        };

        let mut h = x.clone();
        for (i, conv) in hidden.iter().enumerate() {
            h = conv.forward(&h, adj, x, self.lambda, i + 1)?.relu()?;
            h = init::dropout(&h, self.dropout, train, &mut self.rng.lock())?;
        }
        let h = last.forward(&h, adj, x, self.lambda, self.convs.len())?;

        self.sink.record(&EmbeddingRecord {
            architecture: self.architecture,
            num_layers: self.convs.len(),
            embedding: &h,
        })?;
        Ok(log_softmax(&h, D::Minus1)?)
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn reset_parameters(&self) -> Result<()> {
        let mut rng = self.rng.lock();
        for conv in &self.convs {
            conv.reset_parameters(&mut rng)?;
        }
        Ok(())
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn num_layers(&self) -> usize {
        self.convs.len()
    }
}

/// GCNII: dense input projection, `nlayers` width-preserving gated convolutions that
/// all mix in the first hidden representation, dense output projection.
pub struct Gcnii {
    convs: Vec<GraphConvolution>,
    input_proj: Dense,
    output_proj: Dense,
    varmap: VarMap,
    dropout: f64,
    lambda: f64,
    rng: ParamRng,
    sink: Arc<dyn EmbeddingSink>,
    device: Device,
    dtype: DType,
}

impl Gcnii {
    pub fn new(config: &GcniiConfig, runtime: &RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let device = runtime.device()?;
        let dtype = runtime.dtype();
        let rng = ParamRng::new(runtime.seed);
        let options = conv_options(config.residual, config.variant, config.gate_in_features);

        let varmap = VarMap::new();
        let (convs, input_proj, output_proj) = {
            let pb = ParamBuilder::new(&varmap, dtype, &device);
            let mut rng = rng.lock();
            let width = config.nhidden;
            let convs = (0..config.nlayers)
                .map(|i| {
                    let pb = pb.pp("convs").pp(i);
                    GraphConvolution::new(width, width, options, &pb, &mut rng)
                })
                .collect::<Result<Vec<_>>>()?;
            let fcs = pb.pp("fcs");
            let input_proj = Dense::new(config.nfeat, width, &fcs.pp(0), &mut rng)?;
            let output_proj = Dense::new(width, config.nclass, &fcs.pp(1), &mut rng)?;
            (convs, input_proj, output_proj)
        };

        if config.nlayers > 0 && config.nhidden != config.gate_in_features {
            warn!(
                nhidden = config.nhidden,
                gate_in_features = config.gate_in_features,
                "hidden width differs from the gate width; forward passes will fail"
            );
        }
        info!(
            nlayers = config.nlayers,
            nfeat = config.nfeat,
            nhidden = config.nhidden,
            nclass = config.nclass,
            variant = config.variant,
            lambda = config.lambda,
            "built gcnii"
        );

        Ok(Self {
            convs,
            input_proj,
            output_proj,
            varmap,
            dropout: config.dropout,
            lambda: config.lambda,
            rng,
            sink: Arc::new(NoopSink),
            device,
            dtype,
        })
    }

    /// Replace the embedding sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EmbeddingSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn layers(&self) -> &[GraphConvolution] {
        &self.convs
    }

    /// Parameters of the graph convolutions (usually given their own weight decay).
    #[must_use]
    pub fn conv_parameters(&self) -> Vec<Var> {
        self.convs.iter().flat_map(|c| c.parameters()).collect()
    }

    /// Parameters of the input and output projections.
    #[must_use]
    pub fn dense_parameters(&self) -> Vec<Var> {
        let mut params = self.input_proj.parameters();
        params.extend(self.output_proj.parameters());
        params
    }

    /// `nfeat → nhidden` projection, registered as `fcs.0`.
    #[must_use]
    pub fn input_projection(&self) -> &Dense {
        &self.input_proj
    }

    /// `nhidden → nclass` projection, registered as `fcs.1`.
    #[must_use]
    pub fn output_projection(&self) -> &Dense {
        &self.output_proj
    }

    /// Parameters by name: `convs.<i>.*`, `fcs.0.*`, `fcs.1.*`.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn dropout(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        init::dropout(xs, self.dropout, train, &mut self.rng.lock())
    }
}

impl GraphModel for Gcnii {
    fn forward_t(&self, x: &Tensor, adj: &Adjacency, train: bool) -> Result<Tensor> {
        let x = self.dropout(x, train)?;
        let h0 = self.input_proj.forward(&x)?.relu()?;

        let mut h = h0.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            h = self.dropout(&h, train)?;
            h = conv.forward(&h, adj, &h0, self.lambda, i + 1)?.relu()?;
        }
        let h = self.dropout(&h, train)?;
        let out = self.output_proj.forward(&h)?;

        self.sink.record(&EmbeddingRecord {
            architecture: Architecture::Gcnii,
            num_layers: self.convs.len(),
            embedding: &out,
        })?;
        Ok(log_softmax(&out, D::Minus1)?)
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn reset_parameters(&self) -> Result<()> {
        let mut rng = self.rng.lock();
        for conv in &self.convs {
            conv.reset_parameters(&mut rng)?;
        }
        self.input_proj.reset_parameters(&mut rng)?;
        self.output_proj.reset_parameters(&mut rng)
    }

    fn architecture(&self) -> Architecture {
        Architecture::Gcnii
    }

    fn num_layers(&self) -> usize {
        self.convs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcn_layer_widths() {
        let mut config = GcnConfig::new(6, 4, 3, 5);
        config.gate_in_features = 4;
        let model = Gcn::new(&config, &RuntimeConfig::default()).unwrap();
        let widths: Vec<_> = model
            .layers()
            .iter()
            .map(|c| (c.in_features(), c.out_features()))
            .collect();
        assert_eq!(widths, vec![(6, 4), (4, 4), (4, 4), (4, 4), (4, 3)]);
        assert!(model
            .layers()
            .iter()
            .all(|c| c.is_residual() && c.is_variant()));
        assert_eq!(model.parameters().len(), 3 * 5);
    }

    #[test]
    fn gcnii_parameter_groups() {
        let config = GcniiConfig::new(10, 6, 16, 4);
        let model = Gcnii::new(&config, &RuntimeConfig::default()).unwrap();
        assert_eq!(model.conv_parameters().len(), 3 * 6);
        assert_eq!(model.dense_parameters().len(), 4);
        assert_eq!(model.parameters().len(), 3 * 6 + 4);
        assert_eq!(model.num_layers(), 6);
    }

    #[test]
    fn parameters_are_registered_by_name() {
        let mut config = GcniiConfig::new(5, 2, 4, 3);
        config.gate_in_features = 4;
        let model = Gcnii::new(&config, &RuntimeConfig::default()).unwrap();
        let data = model.varmap().data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "convs.0.gate.bias",
                "convs.0.gate.weight",
                "convs.0.weight",
                "convs.1.gate.bias",
                "convs.1.gate.weight",
                "convs.1.weight",
                "fcs.0.bias",
                "fcs.0.weight",
                "fcs.1.bias",
                "fcs.1.weight",
            ]
        );
        assert_eq!(data["fcs.0.weight"].dims(), &[4, 5]);
        assert_eq!(data["convs.1.weight"].dims(), &[4, 4]);
    }

    #[test]
    fn invalid_config_is_rejected_before_building() {
        let config = GcnConfig::new(4, 4, 4, 1);
        assert!(matches!(
            Gcn::residual(&config, &RuntimeConfig::default()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
