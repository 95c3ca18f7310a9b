//! alphagate: gated-residual graph convolutions for oversmoothing experiments.
//!
//! Provides a graph convolution whose output mixes message-passed features with a
//! reference representation through a learned per-node gate, and the three stacks built
//! from it (GCN, Residual-GCN, GCNII), on `candle` tensors.
//!
//! # Modules
//!
//! - [`nn`]: [`GraphConvolution`] and the dense boundary projection
//! - [`models`]: [`Gcn`] and [`Gcnii`] behind the [`GraphModel`] trait
//! - [`graph`]: sparse normalized [`Adjacency`] operator
//! - [`sink`]: where each forward pass's final representation is reported
//! - [`smoothing`]: Dirichlet energy and MAD diagnostics
//!
//! # Example
//!
//! ```rust,ignore
//! use alphagate::{Adjacency, Gcnii, GcniiConfig, GraphModel, Normalization, RuntimeConfig};
//!
//! let runtime = RuntimeConfig::seeded(0);
//! let device = runtime.device()?;
//! let adj = Adjacency::from_edges(4, &[(0, 1), (1, 2), (2, 3)], Normalization::Symmetric, &device)?;
//! let model = Gcnii::new(&GcniiConfig::new(8, 16, 16, 3), &runtime)?;
//! let log_probs = model.forward(&x, &adj)?;  // (4, 3)
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod init;
pub mod models;
pub mod nn;
pub mod sink;
pub mod smoothing;

pub use config::{DeviceKind, GcnConfig, GcniiConfig, Precision, RuntimeConfig};
pub use error::{Error, Result};
pub use graph::{Adjacency, Normalization};
pub use init::{ParamBuilder, ParamRng};
pub use models::{Gcn, Gcnii, GraphModel};
pub use nn::{theta, ConvOptions, Dense, GraphConvolution};
pub use sink::{Architecture, EmbeddingRecord, EmbeddingSink, MemorySink, NoopSink, NpySink};
