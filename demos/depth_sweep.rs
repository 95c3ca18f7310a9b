//! Track oversmoothing diagnostics as GCNII depth grows.
//!
//! Run:
//!   cargo run --example depth_sweep

use alphagate::smoothing::{dirichlet_energy, mean_average_distance};
use alphagate::{
    init, Adjacency, Gcnii, GcniiConfig, GraphModel, MemorySink, Normalization, RuntimeConfig,
};
use candle_core::DType;
use std::sync::Arc;

fn main() -> alphagate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = RuntimeConfig::seeded(7);
    let dev = runtime.device()?;

    // two loosely connected rings
    let n = 20usize;
    let mut edges: Vec<_> = (0..10).map(|i| (i, (i + 1) % 10)).collect();
    edges.extend((10..20).map(|i| (i, 10 + (i + 1) % 10)));
    edges.push((0, 10));
    let adj = Adjacency::from_edges(n, &edges, Normalization::Symmetric, &dev)?;

    let x = {
        let rng = init::ParamRng::new(3);
        let mut rng = rng.lock();
        init::uniform(&mut rng, (n, 32), 1.0, DType::F32, &dev)?
    };

    println!("{:>6} {:>14} {:>10}", "layers", "dirichlet", "mad");
    for nlayers in [2usize, 4, 8, 16, 32, 64] {
        let sink = Arc::new(MemorySink::new());
        let config = GcniiConfig {
            lambda: 0.5,
            ..GcniiConfig::new(32, nlayers, 16, 4)
        };
        let model = Gcnii::new(&config, &runtime)?.with_sink(sink.clone());
        model.forward(&x, &adj)?;

        if let Some(captured) = sink.last() {
            let energy = dirichlet_energy(&captured.embedding, &adj)?;
            let mad = mean_average_distance(&captured.embedding)?;
            println!("{nlayers:>6} {energy:>14.6} {mad:>10.6}");
        }
    }

    Ok(())
}
