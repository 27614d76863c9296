#![allow(dead_code)]

use async_trait::async_trait;
use leafscan_rust_node::config::{Config, HeuristicConfig};
use leafscan_rust_node::error::Result;
use leafscan_rust_node::heuristic_backend::HeuristicProbe;
use leafscan_rust_node::inference::{HealthStatus, ModelInfo};
use leafscan_rust_node::quota::Clock;
use leafscan_rust_node::random_backend::RandomProbe;
use leafscan_rust_node::{
    BackendKind, BackendProbe, BackendUnavailable, ClassTaxonomy, ImageInput, InferenceBackend,
    InferenceResult, PipelineError, PredictionService, PreparedImage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

pub fn png(filename: &str) -> ImageInput {
    ImageInput::from_bytes(PNG_HEADER.to_vec(), filename, "image/png")
}

pub fn quiet_config() -> Config {
    Config {
        heuristic_config: HeuristicConfig {
            simulated_latency: Duration::ZERO,
        },
        ..Default::default()
    }
}

/// Probe that counts its calls and either fails or delegates
pub struct CountingProbe {
    kind: BackendKind,
    calls: Arc<AtomicUsize>,
    inner: Option<Arc<dyn BackendProbe>>,
}

impl CountingProbe {
    pub fn failing(kind: BackendKind) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(Self {
            kind,
            calls: calls.clone(),
            inner: None,
        });
        (probe, calls)
    }

    pub fn wrapping(inner: Arc<dyn BackendProbe>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(Self {
            kind: inner.kind(),
            calls: calls.clone(),
            inner: Some(inner),
        });
        (probe, calls)
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendProbe for CountingProbe {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn init(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window for racing first callers
        tokio::time::sleep(Duration::from_millis(10)).await;
        match &self.inner {
            Some(inner) => inner.init().await,
            None => Err(BackendUnavailable::new(self.kind, "disabled in test")),
        }
    }
}

pub fn heuristic_probe(taxonomy: &Arc<ClassTaxonomy>) -> Arc<dyn BackendProbe> {
    Arc::new(HeuristicProbe::new(None, taxonomy.clone(), Duration::ZERO))
}

pub fn random_probe(taxonomy: &Arc<ClassTaxonomy>) -> Arc<dyn BackendProbe> {
    Arc::new(RandomProbe::new(taxonomy.clone(), Duration::ZERO))
}

/// Backend whose every prediction fails, after `delay`
pub struct BrokenBackend {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

#[async_trait]
impl InferenceBackend for BrokenBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn predict(&self, _image: &PreparedImage) -> Result<InferenceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Err(PipelineError::prediction_failed(
            BackendKind::Real,
            anyhow::anyhow!("output tensor had the wrong shape"),
        ))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "broken".to_string(),
            version: "0".to_string(),
            framework: "test".to_string(),
            backend: BackendKind::Real,
            num_classes: 0,
            input_shape: Vec::new(),
            source: None,
        }
    }

    fn health_check(&self) -> HealthStatus {
        HealthStatus::degraded("always fails")
    }
}

pub struct BrokenProbe {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

#[async_trait]
impl BackendProbe for BrokenProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn init(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        Ok(Arc::new(BrokenBackend {
            calls: self.calls.clone(),
            delay: self.delay,
        }))
    }
}

/// Real-kind backend that replays fixed model scores
pub struct ScoredBackend {
    pub taxonomy: Arc<ClassTaxonomy>,
    pub scores: Vec<f32>,
}

#[async_trait]
impl InferenceBackend for ScoredBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn predict(&self, _image: &PreparedImage) -> Result<InferenceResult> {
        InferenceResult::from_scores(&self.taxonomy, &self.scores, BackendKind::Real, 2)
            .map_err(|e| PipelineError::prediction_failed(BackendKind::Real, e))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "fixed scores".to_string(),
            version: "0".to_string(),
            framework: "test".to_string(),
            backend: BackendKind::Real,
            num_classes: self.taxonomy.len(),
            input_shape: Vec::new(),
            source: None,
        }
    }

    fn health_check(&self) -> HealthStatus {
        HealthStatus::ok("fixed scores")
    }
}

pub struct ScoredProbe {
    pub taxonomy: Arc<ClassTaxonomy>,
    pub scores: Vec<f32>,
}

#[async_trait]
impl BackendProbe for ScoredProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn init(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        Ok(Arc::new(ScoredBackend {
            taxonomy: self.taxonomy.clone(),
            scores: self.scores.clone(),
        }))
    }
}

pub fn service_with(
    probes: Vec<Arc<dyn BackendProbe>>,
    clock: Arc<dyn Clock>,
) -> PredictionService {
    let taxonomy = Arc::new(ClassTaxonomy::default());
    PredictionService::from_parts(quiet_config(), taxonomy, probes, clock)
}
