//! Last-resort backend: uniform class, mid-range confidence.

use crate::error::{BackendUnavailable, Result};
use crate::inference::{
    BackendKind, BackendProbe, HealthStatus, InferenceBackend, InferenceResult, ModelInfo,
};
use crate::input::PreparedImage;
use crate::taxonomy::ClassTaxonomy;
use async_trait::async_trait;
use rand::Rng;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const RANDOM_CONFIDENCE: Range<f64> = 0.50..0.80;

pub struct RandomBackend {
    taxonomy: Arc<ClassTaxonomy>,
    simulated_latency: Duration,
}

impl RandomBackend {
    pub fn new(taxonomy: Arc<ClassTaxonomy>, simulated_latency: Duration) -> Self {
        Self {
            taxonomy,
            simulated_latency,
        }
    }

    fn guess(&self, processing_time_ms: u64) -> InferenceResult {
        let mut rng = rand::rng();
        let class_id = rng.random_range(0..self.taxonomy.len());
        let confidence = rng.random_range(RANDOM_CONFIDENCE);
        InferenceResult::with_confidence(
            &self.taxonomy,
            class_id,
            confidence,
            &mut rng,
            BackendKind::Random,
            processing_time_ms,
        )
    }
}

#[async_trait]
impl InferenceBackend for RandomBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Random
    }

    async fn predict(&self, image: &PreparedImage) -> Result<InferenceResult> {
        let start = Instant::now();
        if !self.simulated_latency.is_zero() {
            tokio::time::sleep(self.simulated_latency).await;
        }

        let result = self.guess(start.elapsed().as_millis() as u64);
        debug!(
            filename = %image.original_filename,
            class = %result.class_name,
            "Random prediction"
        );
        Ok(result)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "Random Fallback".to_string(),
            version: "1.0.0".to_string(),
            framework: "none".to_string(),
            backend: BackendKind::Random,
            num_classes: self.taxonomy.len(),
            input_shape: Vec::new(),
            source: None,
        }
    }

    fn health_check(&self) -> HealthStatus {
        HealthStatus::degraded("serving random predictions")
    }
}

pub struct RandomProbe {
    taxonomy: Arc<ClassTaxonomy>,
    simulated_latency: Duration,
}

impl RandomProbe {
    pub fn new(taxonomy: Arc<ClassTaxonomy>, simulated_latency: Duration) -> Self {
        Self {
            taxonomy,
            simulated_latency,
        }
    }
}

#[async_trait]
impl BackendProbe for RandomProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Random
    }

    async fn init(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        if self.taxonomy.is_empty() {
            return Err(BackendUnavailable::new(BackendKind::Random, "taxonomy is empty"));
        }
        info!(classes = self.taxonomy.len(), "Random backend ready");
        Ok(Arc::new(RandomBackend::new(
            self.taxonomy.clone(),
            self.simulated_latency,
        )))
    }
}
