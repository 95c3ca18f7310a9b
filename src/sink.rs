//! Where a model's final hidden representation goes after each forward pass.
//!
//! The experiments dump the last pre-softmax representation on every call. That write
//! is kept out of the forward computation: models hand an [`EmbeddingRecord`] to an
//! injected [`EmbeddingSink`], and the default sink discards it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use candle_core::Tensor;
use tracing::trace;

use crate::error::{Error, Result};

/// Which model produced an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Gcn,
    ResidualGcn,
    Gcnii,
}

impl Architecture {
    /// File stem used by the experiment dumps, relative to the run directory.
    #[must_use]
    pub fn dump_stem(self) -> &'static str {
        match self {
            Self::Gcn => "embedding/GCNalphafree",
            Self::ResidualGcn => "alphafree",
            Self::Gcnii => "embedding/alphafree",
        }
    }
}

/// One forward pass's final hidden representation (N x nclass, before log-softmax).
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingRecord<'a> {
    pub architecture: Architecture,
    pub num_layers: usize,
    pub embedding: &'a Tensor,
}

/// Receives the final representation of every forward pass.
pub trait EmbeddingSink: Send + Sync {
    fn record(&self, record: &EmbeddingRecord<'_>) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EmbeddingSink for NoopSink {
    fn record(&self, _record: &EmbeddingRecord<'_>) -> Result<()> {
        Ok(())
    }
}

/// Writes `<root>/<stem>_<num_layers>.npy`, overwriting the previous call's file.
#[derive(Debug, Clone)]
pub struct NpySink {
    root: PathBuf,
}

impl NpySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, architecture: Architecture, num_layers: usize) -> PathBuf {
        self.root
            .join(format!("{}_{num_layers}.npy", architecture.dump_stem()))
    }
}

impl EmbeddingSink for NpySink {
    fn record(&self, record: &EmbeddingRecord<'_>) -> Result<()> {
        let path = self.path_for(record.architecture, record.num_layers);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        trace!(path = %path.display(), "writing embedding");
        record
            .embedding
            .detach()
            .write_npy(&path)
            .map_err(|source| Error::Sink { path, source })
    }
}

/// A captured embedding.
#[derive(Debug, Clone)]
pub struct Captured {
    pub architecture: Architecture,
    pub num_layers: usize,
    pub embedding: Tensor,
}

/// Keeps detached copies of every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Captured>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far, oldest first.
    pub fn records(&self) -> Vec<Captured> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<Captured> {
        self.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Captured>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EmbeddingSink for MemorySink {
    fn record(&self, record: &EmbeddingRecord<'_>) -> Result<()> {
        self.lock().push(Captured {
            architecture: record.architecture,
            num_layers: record.num_layers,
            embedding: record.embedding.detach(),
        });
        Ok(())
    }
}
