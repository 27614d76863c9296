pub mod assembler;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod heuristic_backend;
pub mod inference;
pub mod input;
pub mod metrics;
pub mod onnx_backend;
pub mod quota;
pub mod random_backend;
pub mod selector;
pub mod service;
pub mod taxonomy;

// Re-export commonly used types for easier testing
pub use crate::assembler::{assemble, DiagnosisResponse, PlantInfo};
pub use crate::cache::PredictionCache;
pub use crate::catalog::{RecommendationCatalog, RecommendationEntry, Severity};
pub use crate::config::Config;
pub use crate::error::{BackendUnavailable, InvalidInput, PipelineError};
pub use crate::heuristic_backend::heuristic_choice;
pub use crate::inference::{BackendKind, BackendProbe, InferenceBackend, InferenceResult};
pub use crate::input::{CallerIdentity, ImageInput, PreparedImage};
pub use crate::quota::{Admission, ManualClock, QuotaGuard, QuotaRecord};
pub use crate::selector::{BackendSelector, SelectorState};
pub use crate::service::{DiagnosisOutcome, PredictionService};
pub use crate::taxonomy::{decode, ClassTaxonomy, DecodedClass};
