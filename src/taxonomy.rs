//! Class Taxonomy
//!
//! The fixed set of plant/disease classes the model can emit. Canonical class
//! names use the `Plant___Disease` form (e.g. `Corn_(maize)___Common_rust_`);
//! anything emitting the space-separated form (`Corn Common rust`) goes
//! through [`ClassTaxonomy::canonical_name`] before reaching the rest of the
//! pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Separator between plant and disease in canonical class names
pub const CLASS_SEPARATOR: &str = "___";

/// Plant name used when a class name carries no separator
pub const UNKNOWN_PLANT: &str = "Unknown";

/// Built-in class list, in model output order
pub const DEFAULT_CLASSES: &[&str] = &[
    "Corn_(maize)___Cercospora_leaf_spot Gray_leaf_spot",
    "Corn_(maize)___Common_rust_",
    "Corn_(maize)___Northern_Leaf_Blight",
    "Corn_(maize)___healthy",
    "Potato___Early_blight",
    "Potato___Late_blight",
    "Potato___healthy",
    "Tomato___Bacterial_spot",
    "Tomato___Early_blight",
    "Tomato___Late_blight",
    "Tomato___Leaf_Mold",
    "Tomato___Septoria_leaf_spot",
    "Tomato___Spider_mites Two-spotted_spider_mite",
    "Tomato___Target_Spot",
    "Tomato___Tomato_Yellow_Leaf_Curl_Virus",
    "Tomato___Tomato_mosaic_virus",
    "Tomato___healthy",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTaxonomyEntry {
    pub class_id: usize,
    pub raw_class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedClass {
    pub plant_name: String,
    pub disease_name: String,
    pub is_healthy: bool,
}

/// Decode a compound class name into plant/disease/health facts.
///
/// Accepts both `Plant___Disease` and `Plant Disease`. Pure: the same input
/// always yields the same output.
pub fn decode(raw_class_name: &str) -> DecodedClass {
    let raw = raw_class_name.trim();

    let split = match raw.find(CLASS_SEPARATOR) {
        Some(idx) => Some((&raw[..idx], &raw[idx + CLASS_SEPARATOR.len()..])),
        None => split_spaced(raw),
    };

    let (plant_name, disease_name) = match split {
        Some((plant, disease)) => (clean_plant(plant), clean_segment(disease)),
        None => (UNKNOWN_PLANT.to_string(), clean_segment(raw)),
    };

    let is_healthy = disease_name.to_lowercase().contains("healthy");

    DecodedClass {
        plant_name,
        disease_name,
        is_healthy,
    }
}

/// Split `Plant Disease` at the first space, keeping a parenthesised
/// qualifier (`Corn (maize) Common rust`) with the plant.
fn split_spaced(name: &str) -> Option<(&str, &str)> {
    let idx = name.find(char::is_whitespace)?;
    let rest = name[idx..].trim_start();
    if rest.starts_with('(') {
        if let Some(close) = rest.find(')') {
            let disease = rest[close + 1..].trim_start();
            if !disease.is_empty() {
                let plant_end = name.len() - rest.len() + close + 1;
                return Some((&name[..plant_end], disease));
            }
        }
    }
    Some((&name[..idx], rest))
}

fn clean_plant(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut depth = 0usize;
    for ch in segment.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    let cleaned = clean_segment(&out);
    if cleaned.is_empty() {
        UNKNOWN_PLANT.to_string()
    } else {
        cleaned
    }
}

fn clean_segment(segment: &str) -> String {
    segment
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, thiserror::Error)]
pub enum TaxonomyError {
    #[error("Classes file not found at: {0}")]
    NotFound(String),

    #[error("Failed to read classes file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed classes file: {0}")]
    Malformed(String),
}

/// Immutable, ordered class list
#[derive(Debug, Clone)]
pub struct ClassTaxonomy {
    entries: Vec<ClassTaxonomyEntry>,
}

impl Default for ClassTaxonomy {
    fn default() -> Self {
        Self::from_names(DEFAULT_CLASSES.iter().copied())
    }
}

impl ClassTaxonomy {
    /// Build a taxonomy from names in output order, canonicalising any
    /// space-separated names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = names
            .into_iter()
            .enumerate()
            .map(|(class_id, name)| ClassTaxonomyEntry {
                class_id,
                raw_class_name: to_canonical(name.as_ref()),
            })
            .collect();
        Self { entries }
    }

    /// Load a `classes.json` file of the form `{"0": "Corn_(maize)___...", ...}`.
    pub fn load(path: &Path) -> Result<Self, TaxonomyError> {
        if !path.exists() {
            return Err(TaxonomyError::NotFound(path.display().to_string()));
        }

        let raw = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let taxonomy = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            classes = taxonomy.len(),
            "Loaded class taxonomy"
        );
        Ok(taxonomy)
    }

    pub fn from_json(raw: &str) -> Result<Self, TaxonomyError> {
        let map: BTreeMap<String, String> =
            serde_json::from_str(raw).map_err(|e| TaxonomyError::Malformed(e.to_string()))?;

        let mut indexed = Vec::with_capacity(map.len());
        for (key, name) in map {
            let idx: usize = key
                .trim()
                .parse()
                .map_err(|_| TaxonomyError::Malformed(format!("non-numeric class id '{}'", key)))?;
            indexed.push((idx, name));
        }
        indexed.sort_by_key(|(idx, _)| *idx);

        for (expected, (idx, _)) in indexed.iter().enumerate() {
            if *idx != expected {
                return Err(TaxonomyError::Malformed(format!(
                    "class ids must be contiguous from 0, missing {}",
                    expected
                )));
            }
        }

        if indexed.is_empty() {
            return Err(TaxonomyError::Malformed("no classes defined".to_string()));
        }

        Ok(Self::from_names(indexed.into_iter().map(|(_, name)| name)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ClassTaxonomyEntry] {
        &self.entries
    }

    pub fn get(&self, class_id: usize) -> Option<&ClassTaxonomyEntry> {
        self.entries.get(class_id)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.raw_class_name.as_str())
    }

    /// Find the entry for a class name in either separator convention
    pub fn find(&self, class_name: &str) -> Option<&ClassTaxonomyEntry> {
        let wanted = decode(class_name);
        self.entries
            .iter()
            .find(|e| e.raw_class_name == class_name)
            .or_else(|| {
                self.entries.iter().find(|e| {
                    let decoded = decode(&e.raw_class_name);
                    decoded.plant_name.eq_ignore_ascii_case(&wanted.plant_name)
                        && decoded.disease_name.eq_ignore_ascii_case(&wanted.disease_name)
                })
            })
    }

    /// Adapter for backends that emit `Plant Disease` style names
    pub fn canonical_name(&self, class_name: &str) -> Option<&str> {
        let found = self.find(class_name).map(|e| e.raw_class_name.as_str());
        if found.is_none() {
            debug!(class_name = %class_name, "Class name not present in taxonomy");
        }
        found
    }
}

fn to_canonical(name: &str) -> String {
    let name = name.trim();
    if name.contains(CLASS_SEPARATOR) {
        return name.to_string();
    }
    match split_spaced(name) {
        Some((plant, disease)) => format!(
            "{}{}{}",
            plant.split_whitespace().collect::<Vec<_>>().join("_"),
            CLASS_SEPARATOR,
            disease.replace(' ', "_")
        ),
        None => name.to_string(),
    }
}
