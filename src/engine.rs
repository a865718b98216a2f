//! Teachable classification engine.
//!
//! Pairs an embedding model with the k-nearest-neighbor store: frames taught
//! through [`KnnEmbeddingEngine::learn`] become labeled examples, frames passed
//! to [`KnnEmbeddingEngine::classify`] are matched against them.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::RgbImage;

use crate::knn::EmbeddingStore;
use crate::nn::EmbedModel;

pub struct KnnEmbeddingEngine<M> {
    model: M,
    store: EmbeddingStore<String>,
}

impl<M: EmbedModel> KnnEmbeddingEngine<M> {
    /// Create an engine voting over `k` nearest neighbors.
    pub fn new(model: M, k: usize) -> Self {
        Self {
            model,
            store: EmbeddingStore::new(k),
        }
    }

    /// Record one example frame under the given label.
    pub fn learn(&mut self, frame: &RgbImage, label: &str) -> Result<()> {
        let embedding = self.model.embed(frame)?;
        self.store.add_embedding(embedding.view(), label.to_owned())?;
        log::debug!("learned example {} for {label}", self.store.example_count());
        Ok(())
    }

    /// Predict the label of a frame, `None` before any example was learned.
    pub fn classify(&self, frame: &RgbImage) -> Result<Option<String>> {
        let embedding = self.model.embed(frame)?;
        Ok(self.store.knn_embedding(embedding.view())?)
    }

    /// Total number of examples learned so far.
    pub fn example_count(&self) -> usize {
        self.store.example_count()
    }

    /// Forget all learned examples.
    pub fn clear(&mut self) {
        self.store.clear();
    }
}

/// Engine behind a single lock, for concurrent learn/classify callers.
///
/// Queries read the pooled matrix which `learn` rebuilds in place, so both
/// sides must go through the same lock.
pub type SharedEngine<M> = Arc<Mutex<KnnEmbeddingEngine<M>>>;
