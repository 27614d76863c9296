//! Filename Heuristic Backend
//!
//! Guesses a class from the identifying string of an upload. Dataset file
//! tags and embedded class names are trusted outright, plant and disease
//! keywords narrow the candidate set, and an md5-seeded generator picks
//! within it. The same identifier always yields the same class, confidence
//! and probability spread.

use crate::error::{BackendUnavailable, Result};
use crate::inference::{
    BackendKind, BackendProbe, HealthStatus, InferenceBackend, InferenceResult, ModelInfo,
};
use crate::input::PreparedImage;
use crate::taxonomy::{decode, ClassTaxonomy};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Confidence range for guesses backed by something in the identifier
pub const CONFIRMED_CONFIDENCE: Range<f64> = 0.85..0.97;

/// Confidence range for unguided guesses
pub const UNGUIDED_CONFIDENCE: Range<f64> = 0.60..0.90;

/// File tags used by the PlantVillage-derived dataset images
const DATASET_PATTERNS: &[(&str, &str)] = &[
    ("RS_Rust", "Corn_(maize)___Common_rust_"),
    ("RS_GLSp", "Corn_(maize)___Cercospora_leaf_spot Gray_leaf_spot"),
    ("RS_NLB", "Corn_(maize)___Northern_Leaf_Blight"),
    ("RS_Early.B", "Potato___Early_blight"),
    ("RS_Late.B", "Potato___Late_blight"),
    ("RS_HL", "Potato___healthy"),
    ("RS_Erly.B", "Tomato___Early_blight"),
    ("GCREC_Bact.Sp", "Tomato___Bacterial_spot"),
    ("GH_HL Leaf", "Tomato___healthy"),
    ("Crnl_L.Mold", "Tomato___Leaf_Mold"),
    ("Keller.St_CG", "Tomato___Septoria_leaf_spot"),
    ("Matt.S_CG", "Tomato___Septoria_leaf_spot"),
    ("Com.G_SpM_FL", "Tomato___Spider_mites Two-spotted_spider_mite"),
    ("Com.G_TgS_FL", "Tomato___Target_Spot"),
    ("PSU_CG", "Tomato___Tomato_mosaic_virus"),
    ("YLCV_GCREC", "Tomato___Tomato_Yellow_Leaf_Curl_Virus"),
    ("YLCV_NREC", "Tomato___Tomato_Yellow_Leaf_Curl_Virus"),
];

/// Disease keywords, most specific first. Each maps filename aliases to a
/// fragment of the decoded disease name.
const DISEASE_KEYWORDS: &[(&[&str], &str)] = &[
    (&["early"], "early blight"),
    (&["late"], "late blight"),
    (&["northern", "nlb"], "northern leaf blight"),
    (&["cercospora", "gray", "grey"], "cercospora"),
    (&["bacterial", "bact"], "bacterial spot"),
    (&["septoria"], "septoria"),
    (&["target"], "target spot"),
    (&["mold", "mould"], "leaf mold"),
    (&["mosaic"], "mosaic"),
    (&["curl", "ylcv"], "yellow leaf curl"),
    (&["mite"], "spider mites"),
    (&["rust"], "rust"),
    (&["blight"], "blight"),
    (&["spot"], "spot"),
    (&["healthy", "sehat"], "healthy"),
];

const PLANT_KEYWORDS: &[(&[&str], &str)] = &[
    (&["corn", "maize", "jagung"], "corn"),
    (&["potato", "kentang"], "potato"),
    (&["tomat"], "tomato"),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicChoice {
    pub class_id: usize,
    pub confidence: f64,
    pub keyword_confirmed: bool,
}

/// Seeded generator for an identifier: md5 of the lowercased string, first
/// eight bytes little-endian.
fn seeded_rng(identifier: &str) -> StdRng {
    let digest = md5::compute(identifier.to_lowercase().as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest.0[..8]);
    StdRng::seed_from_u64(u64::from_le_bytes(seed))
}

/// Pure class choice for an identifier. `taxonomy` must not be empty.
pub fn heuristic_choice(identifier: &str, taxonomy: &ClassTaxonomy) -> HeuristicChoice {
    choose(identifier, taxonomy, &mut seeded_rng(identifier))
}

/// Full deterministic result for an identifier
pub fn heuristic_result(
    identifier: &str,
    taxonomy: &ClassTaxonomy,
    processing_time_ms: u64,
) -> InferenceResult {
    let mut rng = seeded_rng(identifier);
    let choice = choose(identifier, taxonomy, &mut rng);
    InferenceResult::with_confidence(
        taxonomy,
        choice.class_id,
        choice.confidence,
        &mut rng,
        BackendKind::Heuristic,
        processing_time_ms,
    )
}

fn choose(identifier: &str, taxonomy: &ClassTaxonomy, rng: &mut StdRng) -> HeuristicChoice {
    let lower = identifier.to_lowercase();

    let tagged = DATASET_PATTERNS
        .iter()
        .filter(|(tag, _)| identifier.contains(tag))
        .find_map(|(_, class_name)| taxonomy.find(class_name))
        .map(|e| e.class_id);

    let embedded = || {
        taxonomy
            .entries()
            .iter()
            .find(|e| lower.contains(&e.raw_class_name.to_lowercase()))
            .map(|e| e.class_id)
    };

    if let Some(class_id) = tagged.or_else(embedded) {
        return HeuristicChoice {
            class_id,
            confidence: rng.random_range(CONFIRMED_CONFIDENCE),
            keyword_confirmed: true,
        };
    }

    let decoded: Vec<(String, String)> = taxonomy
        .names()
        .map(|name| {
            let d = decode(name);
            (d.plant_name.to_lowercase(), d.disease_name.to_lowercase())
        })
        .collect();

    let disease_candidates: Vec<usize> = DISEASE_KEYWORDS
        .iter()
        .filter(|(aliases, _)| aliases.iter().any(|a| lower.contains(a)))
        .map(|(_, fragment)| matching(&decoded, |(_, disease)| disease.contains(fragment)))
        .find(|ids| !ids.is_empty())
        .unwrap_or_default();

    let plant_candidates: Vec<usize> = PLANT_KEYWORDS
        .iter()
        .filter(|(aliases, _)| aliases.iter().any(|a| lower.contains(a)))
        .map(|(_, plant)| matching(&decoded, |(p, _)| p == plant))
        .find(|ids| !ids.is_empty())
        .unwrap_or_default();

    let (candidates, keyword_confirmed) = match (disease_candidates.is_empty(), plant_candidates.is_empty()) {
        (false, false) => {
            let both: Vec<usize> = disease_candidates
                .iter()
                .copied()
                .filter(|id| plant_candidates.contains(id))
                .collect();
            if both.is_empty() {
                (disease_candidates, true)
            } else {
                (both, true)
            }
        }
        (false, true) => (disease_candidates, true),
        (true, false) => (plant_candidates, false),
        (true, true) => ((0..taxonomy.len()).collect(), false),
    };

    let class_id = candidates[rng.random_range(0..candidates.len())];
    let range = if keyword_confirmed {
        CONFIRMED_CONFIDENCE
    } else {
        UNGUIDED_CONFIDENCE
    };

    HeuristicChoice {
        class_id,
        confidence: rng.random_range(range),
        keyword_confirmed,
    }
}

fn matching<F>(decoded: &[(String, String)], pred: F) -> Vec<usize>
where
    F: Fn(&(String, String)) -> bool,
{
    decoded
        .iter()
        .enumerate()
        .filter(|(_, d)| pred(d))
        .map(|(idx, _)| idx)
        .collect()
}

pub struct HeuristicBackend {
    taxonomy: Arc<ClassTaxonomy>,
    simulated_latency: Duration,
}

impl HeuristicBackend {
    pub fn new(taxonomy: Arc<ClassTaxonomy>, simulated_latency: Duration) -> Self {
        Self {
            taxonomy,
            simulated_latency,
        }
    }
}

#[async_trait]
impl InferenceBackend for HeuristicBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Heuristic
    }

    async fn predict(&self, image: &PreparedImage) -> Result<InferenceResult> {
        let start = Instant::now();
        if !self.simulated_latency.is_zero() {
            tokio::time::sleep(self.simulated_latency).await;
        }

        let elapsed = start.elapsed().as_millis() as u64;
        let result = heuristic_result(&image.original_filename, &self.taxonomy, elapsed);
        debug!(
            filename = %image.original_filename,
            class = %result.class_name,
            confidence = result.confidence,
            "Heuristic prediction"
        );
        Ok(result)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "Filename Heuristic Classifier".to_string(),
            version: "1.0.0".to_string(),
            framework: "heuristic".to_string(),
            backend: BackendKind::Heuristic,
            num_classes: self.taxonomy.len(),
            input_shape: Vec::new(),
            source: None,
        }
    }

    fn health_check(&self) -> HealthStatus {
        HealthStatus::ok(format!("{} classes loaded", self.taxonomy.len()))
    }
}

/// Brings up the heuristic backend. When a classes file is configured it
/// must load; otherwise `taxonomy` is used.
pub struct HeuristicProbe {
    classes_path: Option<PathBuf>,
    taxonomy: Arc<ClassTaxonomy>,
    simulated_latency: Duration,
}

impl HeuristicProbe {
    pub fn new(
        classes_path: Option<PathBuf>,
        taxonomy: Arc<ClassTaxonomy>,
        simulated_latency: Duration,
    ) -> Self {
        Self {
            classes_path,
            taxonomy,
            simulated_latency,
        }
    }
}

#[async_trait]
impl BackendProbe for HeuristicProbe {
    fn kind(&self) -> BackendKind {
        BackendKind::Heuristic
    }

    async fn init(&self) -> std::result::Result<Arc<dyn InferenceBackend>, BackendUnavailable> {
        let taxonomy = match &self.classes_path {
            Some(path) => Arc::new(
                ClassTaxonomy::load(path)
                    .map_err(|e| BackendUnavailable::new(BackendKind::Heuristic, e.to_string()))?,
            ),
            None => self.taxonomy.clone(),
        };

        if taxonomy.is_empty() {
            return Err(BackendUnavailable::new(BackendKind::Heuristic, "taxonomy is empty"));
        }

        info!(classes = taxonomy.len(), "Heuristic backend ready");
        Ok(Arc::new(HeuristicBackend::new(taxonomy, self.simulated_latency)))
    }
}
