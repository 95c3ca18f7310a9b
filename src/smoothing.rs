//! Oversmoothing diagnostics for node representations.
//!
//! Both measures shrink towards zero as node representations collapse onto each other,
//! which is what deep stacks without residual mixing tend to do.

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};
use crate::graph::Adjacency;

/// Distances at or below this count as "the same point".
const DISTANCE_EPS: f64 = 1e-6;

/// `½ Σ a_ij ‖x_i − x_j‖²` over the stored entries of `adj`.
pub fn dirichlet_energy(x: &Tensor, adj: &Adjacency) -> Result<f64> {
    let (n, f) = x.dims2()?;
    if n != adj.num_nodes() {
        return Err(Error::shape(
            "dirichlet energy",
            &[adj.num_nodes(), f],
            &[n, f],
        ));
    }
    let x = x.to_dtype(DType::F64)?;
    let src = x.index_select(adj.row_index(), 0)?;
    let dst = x.index_select(adj.col_index(), 0)?;
    let sq = src.sub(&dst)?.sqr()?.sum(1)?;
    let weights = adj.weights().to_dtype(DType::F64)?;
    let energy = sq.mul(&weights)?.sum_all()?.to_scalar::<f64>()?;
    Ok(0.5 * energy)
}

/// Mean Average Distance (MAD) over all node pairs using cosine distance.
///
/// For each node, average its cosine distance to every node at non-zero distance;
/// then average over nodes that have at least one such partner. Returns 0 when all
/// representations point the same way.
pub fn mean_average_distance(x: &Tensor) -> Result<f64> {
    let x = x.to_dtype(DType::F64)?;
    let norms = x.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
    let unit = x.broadcast_div(&norms)?;
    let dist = unit
        .matmul(&unit.t()?)?
        .affine(-1.0, 1.0)?
        .to_vec2::<f64>()?;

    let mut total = 0.0;
    let mut counted = 0usize;
    for row in &dist {
        let (sum, count) = row
            .iter()
            .filter(|&&d| d > DISTANCE_EPS)
            .fold((0.0, 0usize), |(s, c), &d| (s + d, c + 1));
        if count > 0 {
            total += sum / count as f64;
            counted += 1;
        }
    }
    Ok(if counted == 0 {
        0.0
    } else {
        total / counted as f64
    })
}
