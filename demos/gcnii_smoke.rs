//! Minimal GCNII smoke example (CPU).
//!
//! Run:
//!   cargo run --example gcnii_smoke

use alphagate::{
    init, Adjacency, Gcnii, GcniiConfig, GraphModel, Normalization, NpySink, RuntimeConfig,
};
use candle_core::{DType, D};
use std::sync::Arc;

fn main() -> alphagate::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = RuntimeConfig::seeded(0);
    let dev = runtime.device()?;

    let n = 6usize;
    let d = 8usize;
    let edges: Vec<_> = (0..n).map(|i| (i, (i + 1) % n)).collect();
    let adj = Adjacency::from_edges(n, &edges, Normalization::Symmetric, &dev)?;

    let x = {
        let rng = init::ParamRng::new(1);
        let mut rng = rng.lock();
        init::uniform(&mut rng, (n, d), 0.1, DType::F32, &dev)?
    };

    let config = GcniiConfig {
        variant: true,
        ..GcniiConfig::new(d, 4, 16, 3)
    };
    let out_dir = std::env::temp_dir().join("alphagate-smoke");
    let model = Gcnii::new(&config, &runtime)?.with_sink(Arc::new(NpySink::new(&out_dir)));

    let y = model.forward(&x, &adj)?;
    let (yn, yd) = y.dims2()?;
    println!("log-probs shape: [{yn}, {yd}]");

    let pred = y.argmax(D::Minus1)?.to_vec1::<u32>()?;
    println!("predicted classes: {pred:?}");
    println!("embedding dumped under {}", out_dir.display());

    Ok(())
}
