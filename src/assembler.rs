//! Result Assembler: inference output + decoded taxonomy + catalog advice
//! into the response handed back to the caller.

use crate::catalog::{RecommendationCatalog, Severity};
use crate::inference::{BackendKind, ClassScore, InferenceResult};
use crate::taxonomy::decode;
use serde::{Deserialize, Serialize};

/// Number of ranked classes included in a response
pub const TOP_PREDICTIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlantInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scientific_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prevention: Option<String>,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisResponse {
    pub success: bool,
    pub plant: PlantInfo,
    pub disease: String,
    pub confidence: f64,
    pub is_healthy: bool,
    pub backend: BackendKind,
    /// Backend compute time of the prediction. A cache hit reports the time
    /// of the original computation, not of the request.
    pub processing_time_ms: u64,
    pub top_predictions: Vec<ClassScore>,
    pub class_id: usize,
    pub class_name: String,
    pub original_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_detections: Option<u32>,
}

impl DiagnosisResponse {
    pub fn with_remaining_detections(mut self, remaining: u32) -> Self {
        self.remaining_detections = Some(remaining);
        self
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

pub fn assemble(
    result: &InferenceResult,
    catalog: &RecommendationCatalog,
    original_filename: &str,
) -> DiagnosisResponse {
    let decoded = decode(&result.class_name);
    let advice = catalog.lookup_decoded(&decoded);

    let plant = PlantInfo {
        name: decoded.plant_name.clone(),
        scientific_name: advice.scientific_name.clone(),
        description: advice.description.clone(),
        symptoms: non_empty(&advice.symptoms),
        treatment: non_empty(&advice.treatment),
        prevention: non_empty(&advice.prevention),
        severity: advice.severity,
    };

    DiagnosisResponse {
        success: true,
        plant,
        disease: decoded.disease_name,
        confidence: result.confidence,
        is_healthy: decoded.is_healthy,
        backend: result.backend_kind,
        processing_time_ms: result.processing_time_ms,
        top_predictions: result.top_predictions(TOP_PREDICTIONS),
        class_id: result.class_id,
        class_name: result.class_name.clone(),
        original_filename: original_filename.to_string(),
        remaining_detections: None,
    }
}
