//! Trained-model backend backed by ONNX Runtime.
//!
//! The model takes a single NHWC `[1, size, size, 3]` f32 tensor scaled to
//! `0..1` and emits one score per taxonomy class. Session access is
//! serialised and runs on the blocking pool.

use crate::config::ModelConfig;
use crate::error::BackendUnavailable;
use crate::inference::{BackendKind, BackendProbe, InferenceBackend};
use crate::taxonomy::ClassTaxonomy;
use async_trait::async_trait;
use image::imageops::FilterType;
use ndarray::Array4;
use std::sync::Arc;
use tracing::warn;

#[cfg(feature = "onnx")]
pub use session::OnnxBackend;

/// Decode and resize an image into the model's input tensor
pub fn preprocess(bytes: &[u8], input_size: u32) -> Result<Array4<f32>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let rgb = img
        .resize_exact(input_size, input_size, FilterType::Triangle)
        .to_rgb8();

    let size = input_size as usize;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    Ok(tensor)
}

pub fn input_shape(input_size: u32) -> Vec<usize> {
    vec![1, input_size as usize, input_size as usize, 3]
}

#[cfg(feature = "onnx")]
mod session {
    use super::{input_shape, preprocess};
    use crate::error::{PipelineError, Result};
    use crate::inference::{
        BackendKind, HealthStatus, InferenceBackend, InferenceResult, ModelInfo,
    };
    use crate::input::PreparedImage;
    use crate::taxonomy::ClassTaxonomy;
    use async_trait::async_trait;
    use ort::inputs;
    use ort::session::Session;
    use ort::value::Value;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Instant;
    use tracing::debug;

    pub struct OnnxBackend {
        session: Arc<Mutex<Session>>,
        taxonomy: Arc<ClassTaxonomy>,
        model_path: PathBuf,
        input_size: u32,
    }

    impl OnnxBackend {
        pub fn new(
            session: Session,
            taxonomy: Arc<ClassTaxonomy>,
            model_path: PathBuf,
            input_size: u32,
        ) -> Self {
            Self {
                session: Arc::new(Mutex::new(session)),
                taxonomy,
                model_path,
                input_size,
            }
        }
    }

    fn run_model(session: &Mutex<Session>, bytes: &[u8], input_size: u32) -> anyhow::Result<Vec<f32>> {
        let tensor = preprocess(bytes, input_size)?;
        let input = Value::from_array(tensor)?;

        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(inputs![input])?;
        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("model produced no outputs"))?;
        let scores = output.try_extract_array::<f32>()?;
        Ok(scores.iter().copied().collect())
    }

    #[async_trait]
    impl InferenceBackend for OnnxBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Real
        }

        async fn predict(&self, image: &PreparedImage) -> Result<InferenceResult> {
            let start = Instant::now();
            let session = self.session.clone();
            let bytes = image.bytes.clone();
            let input_size = self.input_size;

            let scores = tokio::task::spawn_blocking(move || run_model(&session, &bytes, input_size))
                .await
                .map_err(|e| PipelineError::prediction_failed(BackendKind::Real, e))?
                .map_err(|e| PipelineError::prediction_failed(BackendKind::Real, e))?;

            let elapsed = start.elapsed().as_millis() as u64;
            let result = InferenceResult::from_scores(&self.taxonomy, &scores, BackendKind::Real, elapsed)
                .map_err(|e| PipelineError::prediction_failed(BackendKind::Real, e))?;

            debug!(
                filename = %image.original_filename,
                class = %result.class_name,
                confidence = result.confidence,
                elapsed_ms = elapsed,
                "Model prediction"
            );
            Ok(result)
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "Plant Disease Classifier".to_string(),
                version: "1.0.0".to_string(),
                framework: "onnxruntime".to_string(),
                backend: BackendKind::Real,
                num_classes: self.taxonomy.len(),
                input_shape: input_shape(self.input_size),
                source: Some(self.model_path.display().to_string()),
            }
        }

        fn health_check(&self) -> HealthStatus {
            match self.session.try_lock() {
                Ok(_) => HealthStatus::ok("model loaded"),
                Err(std::sync::TryLockError::WouldBlock) => HealthStatus::ok("model busy"),
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    HealthStatus::degraded("model session poisoned by a panicked inference")
                }
            }
        }
    }
}

/// Loads the model file into an ONNX Runtime session
pub struct OnnxProbe {
    config: ModelConfig,
    taxonomy: Arc<ClassTaxonomy>,
}

impl OnnxProbe {
    pub fn new(config: ModelConfig, taxonomy: Arc<ClassTaxonomy>) -> Self {
        Self { config, taxonomy }
    }

    #[cfg(feature = "onnx")]
    async fn load(&self) -> Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        use ort::session::builder::GraphOptimizationLevel;
        use ort::session::Session;

        let unavailable = |reason: String| BackendUnavailable::new(BackendKind::Real, reason);

        let model_path = self.config.model_path.clone();
        if !model_path.exists() {
            return Err(unavailable(format!("model not found at {}", model_path.display())));
        }
        if self.taxonomy.is_empty() {
            return Err(unavailable("taxonomy is empty".to_string()));
        }

        let path = model_path.clone();
        let session = tokio::task::spawn_blocking(move || {
            Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(&path)
        })
        .await
        .map_err(|e| unavailable(e.to_string()))?
        .map_err(|e| {
            warn!(path = %model_path.display(), error = %e, "Failed to load ONNX model");
            unavailable(e.to_string())
        })?;

        tracing::info!(
            path = %model_path.display(),
            classes = self.taxonomy.len(),
            input_size = self.config.input_size,
            "ONNX model loaded"
        );

        Ok(Arc::new(OnnxBackend::new(
            session,
            self.taxonomy.clone(),
            model_path,
            self.config.input_size,
        )))
    }

    #[cfg(not(feature = "onnx"))]
    async fn load(&self) -> Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        warn!(
            path = %self.config.model_path.display(),
            classes = self.taxonomy.len(),
            "Built without the onnx feature, real backend disabled"
        );
        Err(BackendUnavailable::new(
            BackendKind::Real,
            "built without onnx support",
        ))
    }
}

#[async_trait]
impl BackendProbe for OnnxProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn init(&self) -> Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        self.load().await
    }
}
