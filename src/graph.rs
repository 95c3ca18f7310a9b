//! Sparse adjacency operator.
//!
//! candle has no sparse tensor type, so the normalized adjacency is kept as COO triplets
//! and applied as gather → scale → scatter-add. The product is differentiable with
//! respect to the dense operand.

use std::collections::BTreeSet;

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// How self-looped adjacency is normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
    /// `D^-1 (A + I)`: every row sums to one.
    #[default]
    Row,
    /// `D^-1/2 (A + I) D^-1/2`.
    Symmetric,
}

/// An N×N sparse linear operator over node features.
#[derive(Debug, Clone)]
pub struct Adjacency {
    num_nodes: usize,
    rows: Vec<u32>,
    cols: Vec<u32>,
    values: Vec<f32>,
    row_index: Tensor,
    col_index: Tensor,
    weights: Tensor,
}

impl Adjacency {
    /// Build from raw COO triplets. Entry `k` contributes `values[k] * x[cols[k]]` to
    /// output row `rows[k]`; duplicate coordinates accumulate.
    pub fn from_coo(
        num_nodes: usize,
        rows: Vec<u32>,
        cols: Vec<u32>,
        values: Vec<f32>,
        device: &Device,
    ) -> Result<Self> {
        if rows.len() != cols.len() || rows.len() != values.len() {
            return Err(Error::InvalidGraph(format!(
                "coo arrays differ in length: rows={}, cols={}, values={}",
                rows.len(),
                cols.len(),
                values.len()
            )));
        }
        if let Some(bad) = rows
            .iter()
            .chain(cols.iter())
            .find(|&&i| i as usize >= num_nodes)
        {
            return Err(Error::InvalidGraph(format!(
                "node index {bad} out of range for {num_nodes} nodes"
            )));
        }
        let nnz = rows.len();
        let row_index = Tensor::from_vec(rows.clone(), nnz, device)?;
        let col_index = Tensor::from_vec(cols.clone(), nnz, device)?;
        let weights = Tensor::from_vec(values.clone(), nnz, device)?;
        Ok(Self {
            num_nodes,
            rows,
            cols,
            values,
            row_index,
            col_index,
            weights,
        })
    }

    /// Build the normalized operator of an undirected graph.
    ///
    /// Edges are symmetrized and deduplicated, self-loops are added for every node,
    /// then the result is normalized with `norm`.
    pub fn from_edges(
        num_nodes: usize,
        edges: &[(usize, usize)],
        norm: Normalization,
        device: &Device,
    ) -> Result<Self> {
        check_node_count(num_nodes)?;
        let mut coords = BTreeSet::new();
        for &(u, v) in edges {
            if u >= num_nodes || v >= num_nodes {
                return Err(Error::InvalidGraph(format!(
                    "edge ({u}, {v}) out of range for {num_nodes} nodes"
                )));
            }
            coords.insert((u, v));
            coords.insert((v, u));
        }
        coords.extend((0..num_nodes).map(|i| (i, i)));

        let mut degree = vec![0f32; num_nodes];
        for &(u, _) in &coords {
            degree[u] += 1.0;
        }

        let mut rows = Vec::with_capacity(coords.len());
        let mut cols = Vec::with_capacity(coords.len());
        let mut values = Vec::with_capacity(coords.len());
        for (u, v) in coords {
            let w = match norm {
                Normalization::Row => 1.0 / degree[u],
                Normalization::Symmetric => 1.0 / (degree[u] * degree[v]).sqrt(),
            };
            rows.push(u as u32);
            cols.push(v as u32);
            values.push(w);
        }
        Self::from_coo(num_nodes, rows, cols, values, device)
    }

    /// The identity operator: message passing becomes a no-op.
    pub fn identity(num_nodes: usize, device: &Device) -> Result<Self> {
        check_node_count(num_nodes)?;
        let idx: Vec<u32> = (0..num_nodes as u32).collect();
        Self::from_coo(num_nodes, idx.clone(), idx, vec![1.0; num_nodes], device)
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Number of stored entries.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored `(row, col, value)` triplets.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.rows
            .iter()
            .zip(&self.cols)
            .zip(&self.values)
            .map(|((&r, &c), &w)| (r as usize, c as usize, w))
    }

    pub(crate) fn row_index(&self) -> &Tensor {
        &self.row_index
    }

    pub(crate) fn col_index(&self) -> &Tensor {
        &self.col_index
    }

    pub(crate) fn weights(&self) -> &Tensor {
        &self.weights
    }

    /// Sparse–dense product `A · x` for `x` of shape (N, F).
    pub fn matmul(&self, x: &Tensor) -> Result<Tensor> {
        let (n, f) = x.dims2()?;
        if n != self.num_nodes {
            return Err(Error::shape(
                "adjacency product",
                &[self.num_nodes, f],
                &[n, f],
            ));
        }
        let weights = self.weights.to_dtype(x.dtype())?.unsqueeze(1)?;
        let messages = x
            .index_select(&self.col_index, 0)?
            .broadcast_mul(&weights)?;
        let out = Tensor::zeros((n, f), x.dtype(), x.device())?;
        Ok(out.index_add(&self.row_index, &messages, 0)?)
    }

    /// Dense N×N copy of the operator (f32).
    pub fn to_dense(&self) -> Result<Tensor> {
        let n = self.num_nodes;
        let mut dense = vec![0f32; n * n];
        for (r, c, w) in self.entries() {
            dense[r * n + c] += w;
        }
        Ok(Tensor::from_vec(dense, (n, n), self.weights.device())?)
    }
}

/// Node ids are stored as `u32`.
fn check_node_count(num_nodes: usize) -> Result<()> {
    if num_nodes > u32::MAX as usize {
        return Err(Error::InvalidGraph(format!(
            "{num_nodes} nodes exceed the u32 index range"
        )));
    }
    Ok(())
}
