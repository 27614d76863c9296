//! Inference Backend Abstraction
//!
//! One capability, three implementations of differing fidelity:
//! - `onnx_backend`: a trained model run through ONNX Runtime
//! - `heuristic_backend`: filename keyword + hash seeded guesses
//! - `random_backend`: uniform guesses so the pipeline degrades instead of failing
//!
//! Every backend emits the same [`InferenceResult`] shape with a probability
//! entry for every class in the taxonomy.

use crate::error::{BackendUnavailable, Result};
use crate::input::PreparedImage;
use crate::taxonomy::ClassTaxonomy;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Tolerance for "probabilities sum to one"
pub const PROBABILITY_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Real,
    Heuristic,
    Random,
}

impl BackendKind {
    /// Probe order, highest fidelity first
    pub const FALLBACK_ORDER: [BackendKind; 3] =
        [BackendKind::Real, BackendKind::Heuristic, BackendKind::Random];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Real => "real",
            BackendKind::Heuristic => "heuristic",
            BackendKind::Random => "random",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised output of a single prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f64,
    pub probabilities: BTreeMap<String, f64>,
    pub processing_time_ms: u64,
    pub backend_kind: BackendKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
}

impl InferenceResult {
    /// Build a result from raw per-class model scores (logits or
    /// probabilities, in taxonomy order). Scores that already approximate a
    /// distribution are rescaled to sum to one; anything else goes through
    /// softmax.
    pub fn from_scores(
        taxonomy: &ClassTaxonomy,
        scores: &[f32],
        backend_kind: BackendKind,
        processing_time_ms: u64,
    ) -> std::result::Result<Self, ScoreError> {
        if scores.len() != taxonomy.len() {
            return Err(ScoreError::ShapeMismatch {
                expected: taxonomy.len(),
                actual: scores.len(),
            });
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(ScoreError::NonFinite);
        }

        let scores: Vec<f64> = scores.iter().map(|&s| s as f64).collect();
        let probs = if is_distribution(&scores) {
            normalise(&scores)
        } else {
            softmax(&scores)
        };

        let (class_id, _) = probs
            .iter()
            .enumerate()
            .fold((0usize, f64::MIN), |best, (idx, &p)| if p > best.1 { (idx, p) } else { best });

        Ok(Self::from_probabilities(
            taxonomy,
            class_id,
            &probs,
            backend_kind,
            processing_time_ms,
        ))
    }

    /// Build a result by giving `confidence` to `class_id` and spreading the
    /// remainder over the other classes in proportion to `rng`-drawn weights.
    pub fn with_confidence<R: Rng + ?Sized>(
        taxonomy: &ClassTaxonomy,
        class_id: usize,
        confidence: f64,
        rng: &mut R,
        backend_kind: BackendKind,
        processing_time_ms: u64,
    ) -> Self {
        let n = taxonomy.len();
        let confidence = if n <= 1 { 1.0 } else { confidence.clamp(0.0, 1.0) };

        let weights: Vec<f64> = (0..n)
            .map(|idx| if idx == class_id { 0.0 } else { rng.random_range(0.05..1.0) })
            .collect();
        let weight_total: f64 = weights.iter().sum();
        let remainder = 1.0 - confidence;

        let probs: Vec<f64> = weights
            .iter()
            .enumerate()
            .map(|(idx, w)| {
                if idx == class_id {
                    confidence
                } else if weight_total > 0.0 {
                    remainder * w / weight_total
                } else {
                    0.0
                }
            })
            .collect();

        Self::from_probabilities(taxonomy, class_id, &probs, backend_kind, processing_time_ms)
    }

    fn from_probabilities(
        taxonomy: &ClassTaxonomy,
        class_id: usize,
        probs: &[f64],
        backend_kind: BackendKind,
        processing_time_ms: u64,
    ) -> Self {
        let probabilities: BTreeMap<String, f64> = taxonomy
            .names()
            .zip(probs.iter())
            .map(|(name, &p)| (name.to_string(), p))
            .collect();

        let class_name = taxonomy
            .get(class_id)
            .map(|e| e.raw_class_name.clone())
            .unwrap_or_default();
        let confidence = probabilities.get(&class_name).copied().unwrap_or(0.0);

        Self {
            class_id,
            class_name,
            confidence,
            probabilities,
            processing_time_ms,
            backend_kind,
        }
    }

    /// Highest-probability classes, best first
    pub fn top_predictions(&self, n: usize) -> Vec<ClassScore> {
        let mut ranked: Vec<(&String, &f64)> = self.probabilities.iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
            .into_iter()
            .take(n)
            .map(|(name, &p)| ClassScore {
                class_name: name.clone(),
                confidence: p,
            })
            .collect()
    }

    /// Probabilities are non-negative, sum to one, cover the taxonomy, and
    /// the winning class carries `confidence`.
    pub fn is_well_formed(&self, taxonomy: &ClassTaxonomy) -> bool {
        let sum: f64 = self.probabilities.values().sum();
        (sum - 1.0).abs() <= PROBABILITY_EPSILON
            && self.probabilities.values().all(|p| *p >= 0.0)
            && self.probabilities.len() == taxonomy.len()
            && taxonomy.names().all(|n| self.probabilities.contains_key(n))
            && self.probabilities.get(&self.class_name) == Some(&self.confidence)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScoreError {
    #[error("Model produced {actual} scores, taxonomy has {expected} classes")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Model produced non-finite scores")]
    NonFinite,
}

fn is_distribution(values: &[f64]) -> bool {
    let sum: f64 = values.iter().sum();
    values.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() <= 1e-3
}

fn normalise(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    values.iter().map(|v| v / total).collect()
}

fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

/// Static description of a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub framework: String,
    pub backend: BackendKind,
    pub num_classes: usize,
    pub input_shape: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub detail: String,
}

impl HealthStatus {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// A bound, ready-to-use backend
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn predict(&self, image: &PreparedImage) -> Result<InferenceResult>;

    fn model_info(&self) -> ModelInfo;

    fn health_check(&self) -> HealthStatus;
}

/// Start-up for one backend. Probes are run at most once by the selector.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn init(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendUnavailable>;
}
