//! Prediction Service
//!
//! Owns every pipeline component and runs one request through them:
//! quota admission, upload validation, backend selection, the
//! fingerprint cache, the bound backend, then response assembly.

use crate::assembler::{assemble, DiagnosisResponse};
use crate::cache::{CacheStats, PredictionCache};
use crate::catalog::RecommendationCatalog;
use crate::config::{Config, ModelConfig};
use crate::error::{PipelineError, Result};
use crate::heuristic_backend::HeuristicProbe;
use crate::inference::{BackendKind, BackendProbe, HealthStatus, ModelInfo};
use crate::input::{CallerIdentity, ImageInput};
use crate::metrics::{self, Timer};
use crate::onnx_backend::OnnxProbe;
use crate::quota::{Admission, Clock, QuotaExceeded, QuotaGuard, QuotaRecord, QuotaStats, SystemClock};
use crate::random_backend::RandomProbe;
use crate::selector::{BackendSelector, SelectorState};
use crate::taxonomy::{ClassTaxonomy, ClassTaxonomyEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaExceededResponse {
    pub blocked: bool,
    pub remaining_detections: u32,
    pub reset_at: DateTime<Utc>,
    pub message: String,
}

impl From<QuotaExceeded> for QuotaExceededResponse {
    fn from(e: QuotaExceeded) -> Self {
        Self {
            blocked: true,
            remaining_detections: 0,
            reset_at: e.reset_at,
            message: "Guest detection limit reached. Sign in or try again later.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureResponse {
    pub success: bool,
    pub error_kind: &'static str,
    pub message: String,
}

impl From<&PipelineError> for FailureResponse {
    fn from(e: &PipelineError) -> Self {
        Self {
            success: false,
            error_kind: e.kind(),
            message: e.user_message(),
        }
    }
}

/// What a diagnosis request resolves to. Never an `Err`: every outcome is
/// something the caller renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DiagnosisOutcome {
    Diagnosed(Box<DiagnosisResponse>),
    QuotaExceeded(QuotaExceededResponse),
    Failed(FailureResponse),
}

impl DiagnosisOutcome {
    pub fn response(&self) -> Option<&DiagnosisResponse> {
        match self {
            DiagnosisOutcome::Diagnosed(r) => Some(r.as_ref()),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        match self {
            DiagnosisOutcome::Failed(f) => Some(f.error_kind),
            DiagnosisOutcome::QuotaExceeded(_) => Some("QuotaExceeded"),
            DiagnosisOutcome::Diagnosed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub selector: SelectorState,
    pub backend: Option<HealthStatus>,
    pub cache: CacheStats,
    pub quota: QuotaStats,
}

pub struct PredictionService {
    config: Config,
    taxonomy: Arc<ClassTaxonomy>,
    catalog: RecommendationCatalog,
    selector: BackendSelector,
    cache: Arc<PredictionCache>,
    quota: QuotaGuard,
}

/// The built-in taxonomy unless a classes file loads
pub fn load_taxonomy(config: &ModelConfig) -> ClassTaxonomy {
    match &config.classes_path {
        Some(path) => ClassTaxonomy::load(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Falling back to built-in class list");
            ClassTaxonomy::default()
        }),
        None => ClassTaxonomy::default(),
    }
}

/// Real, heuristic and random probes wired from configuration
pub fn default_probes(config: &Config, taxonomy: Arc<ClassTaxonomy>) -> Vec<Arc<dyn BackendProbe>> {
    let latency = config.heuristic_config.simulated_latency;
    vec![
        Arc::new(OnnxProbe::new(config.model_config.clone(), taxonomy.clone())),
        Arc::new(HeuristicProbe::new(
            config.model_config.classes_path.clone(),
            taxonomy.clone(),
            latency,
        )),
        Arc::new(RandomProbe::new(taxonomy, latency)),
    ]
}

impl PredictionService {
    pub fn new(config: Config) -> Self {
        let taxonomy = Arc::new(load_taxonomy(&config.model_config));
        let probes = default_probes(&config, taxonomy.clone());
        Self::from_parts(config, taxonomy, probes, Arc::new(SystemClock))
    }

    pub fn from_parts(
        config: Config,
        taxonomy: Arc<ClassTaxonomy>,
        probes: Vec<Arc<dyn BackendProbe>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(PredictionCache::new(config.cache_config.capacity));
        let quota = QuotaGuard::with_clock(&config.quota_config, clock);
        Self {
            catalog: RecommendationCatalog::new(),
            selector: BackendSelector::new(probes),
            cache,
            quota,
            taxonomy,
            config,
        }
    }

    /// Probe and bind a backend now instead of on the first request
    pub async fn init(&self) -> Result<BackendKind> {
        let backend = self.selector.backend().await?;
        info!(
            backend = %backend.kind(),
            classes = self.taxonomy.len(),
            cache_capacity = self.cache.capacity(),
            guest_limit = self.quota.limit(),
            "Prediction service ready"
        );
        Ok(backend.kind())
    }

    pub async fn diagnose(&self, input: ImageInput, caller: &CallerIdentity) -> DiagnosisOutcome {
        let request_id = Uuid::new_v4();
        let timer = Timer::new();

        let permit = match self.quota.admit(caller) {
            Admission::Blocked(exceeded) => {
                return DiagnosisOutcome::QuotaExceeded(exceeded.into());
            }
            Admission::Bypass => None,
            Admission::Admitted(permit) => Some(permit),
        };

        let filename = input.original_filename.clone();
        match self.run(input).await {
            Ok(response) => {
                let response = match permit {
                    Some(permit) => response.with_remaining_detections(permit.commit()),
                    None => response,
                };

                metrics::PREDICTIONS
                    .with_label_values(&[response.backend.as_str()])
                    .inc();
                timer.observe_duration_seconds(&metrics::PREDICTION_LATENCY);
                info!(
                    request_id = %request_id,
                    filename = %filename,
                    backend = %response.backend,
                    class = %response.class_name,
                    confidence = response.confidence,
                    "Diagnosis complete"
                );
                DiagnosisOutcome::Diagnosed(Box::new(response))
            }
            Err(e) => {
                // Uncommitted permit is released here
                drop(permit);
                metrics::PREDICTION_FAILURES
                    .with_label_values(&[e.kind()])
                    .inc();
                error!(
                    request_id = %request_id,
                    filename = %filename,
                    error = %e,
                    "Diagnosis failed"
                );
                DiagnosisOutcome::Failed(FailureResponse::from(&e))
            }
        }
    }

    async fn run(&self, input: ImageInput) -> Result<DiagnosisResponse> {
        let image = input.prepare(&self.config.upload_config).await?;
        let backend = self.selector.backend().await?;
        let kind = backend.kind();

        // Detached so an abandoned request still finishes and fills the cache
        let cache = self.cache.clone();
        let task = tokio::spawn(async move {
            let result = cache
                .get_or_compute(&image.original_filename, || backend.predict(&image))
                .await;
            (image.original_filename, result)
        });

        let (filename, result) = task
            .await
            .map_err(|e| PipelineError::prediction_failed(kind, e))?;
        let result = result?;

        Ok(assemble(&result, &self.catalog, &filename))
    }

    pub fn classes(&self) -> &[ClassTaxonomyEntry] {
        self.taxonomy.entries()
    }

    pub fn taxonomy(&self) -> &ClassTaxonomy {
        &self.taxonomy
    }

    pub fn bound_kind(&self) -> Option<BackendKind> {
        self.selector.bound_kind()
    }

    pub fn selector_state(&self) -> SelectorState {
        self.selector.state()
    }

    pub async fn model_info(&self) -> Result<ModelInfo> {
        Ok(self.selector.backend().await?.model_info())
    }

    pub async fn health(&self) -> ServiceHealth {
        let backend = self.selector.backend().await.ok().map(|b| b.health_check());
        ServiceHealth {
            selector: self.selector.state(),
            backend,
            cache: self.cache.stats(),
            quota: self.quota.stats(),
        }
    }

    pub fn quota_record(&self, identity_key: &str) -> Option<QuotaRecord> {
        self.quota.record(identity_key)
    }

    pub fn prune_quota(&self) -> usize {
        self.quota.prune_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// How often stale guest records should be pruned
    pub fn prune_interval(&self) -> Duration {
        self.config.quota_config.reset_window.min(Duration::from_secs(3600))
    }

    pub fn shutdown(&self) {
        let cache = self.cache.stats();
        let quota = self.quota.stats();
        self.cache.clear();
        info!(
            cached = cache.entries,
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            cache_hit_rate = metrics::cache_hit_rate(),
            guests = quota.tracked_identities,
            quota_rejections = quota.rejections,
            "Prediction service shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeuristicConfig;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    fn quiet_config() -> Config {
        Config {
            heuristic_config: HeuristicConfig {
                simulated_latency: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_default_service_falls_back_to_heuristic() {
        let mut config = quiet_config();
        config.model_config.model_path = "/nonexistent/model.onnx".into();
        let service = PredictionService::new(config);

        assert_eq!(service.init().await.unwrap(), BackendKind::Heuristic);
        assert_eq!(service.bound_kind(), Some(BackendKind::Heuristic));
        assert_eq!(service.classes().len(), 17);

        let info = service.model_info().await.unwrap();
        assert_eq!(info.backend, BackendKind::Heuristic);
    }

    #[tokio::test]
    async fn test_invalid_input_is_typed_failure() {
        let mut config = quiet_config();
        config.model_config.model_path = "/nonexistent/model.onnx".into();
        let service = PredictionService::new(config);

        let outcome = service
            .diagnose(
                ImageInput::from_bytes(PNG_HEADER.to_vec(), "leaf.gif", "image/gif"),
                &CallerIdentity::guest("10.0.0.1"),
            )
            .await;
        assert_eq!(outcome.error_kind(), Some("InvalidInput"));
        assert_eq!(service.quota_record("10.0.0.1").unwrap().count, 0);

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["errorKind"], "InvalidInput");
    }

    #[tokio::test]
    async fn test_shutdown_clears_cache() {
        let mut config = quiet_config();
        config.model_config.model_path = "/nonexistent/model.onnx".into();
        let service = PredictionService::new(config);

        let outcome = service
            .diagnose(
                ImageInput::from_bytes(PNG_HEADER.to_vec(), "tomato_leaf_mold.png", "image/png"),
                &CallerIdentity::authenticated("10.0.0.2"),
            )
            .await;
        let response = outcome.response().unwrap();
        assert_eq!(response.remaining_detections, None);
        assert_eq!(service.cache_stats().entries, 1);

        service.shutdown();
        assert_eq!(service.cache_stats().entries, 0);
    }
}
