//! Recommendation Catalog
//!
//! Static treatment advice keyed by disease. Lookups are case-insensitive
//! substring matches against the keys below, tried in table order: specific
//! multi-word keys first, generic single-word keys last.

use crate::taxonomy::DecodedClass;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationEntry {
    pub disease_name: String,
    pub severity: Severity,
    pub symptoms: String,
    pub treatment: String,
    pub prevention: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scientific_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

struct Seed {
    key: &'static str,
    disease_name: &'static str,
    severity: Severity,
    scientific_name: Option<&'static str>,
    description: Option<&'static str>,
    symptoms: &'static str,
    treatment: &'static str,
    prevention: &'static str,
}

impl Seed {
    fn to_entry(&self) -> RecommendationEntry {
        RecommendationEntry {
            disease_name: self.disease_name.to_string(),
            severity: self.severity,
            symptoms: self.symptoms.to_string(),
            treatment: self.treatment.to_string(),
            prevention: self.prevention.to_string(),
            scientific_name: self.scientific_name.map(str::to_string),
            description: self.description.map(str::to_string),
        }
    }
}

const HEALTHY: Seed = Seed {
    key: "healthy",
    disease_name: "Healthy",
    severity: Severity::Low,
    scientific_name: None,
    description: Some("The leaf shows no signs of disease or pest damage."),
    symptoms: "Green, vigorous foliage with no spots, lesions, or discoloration.",
    treatment: "No action needed. Continue regular monitoring and good cultural practices.",
    prevention: "Maintain proper nutrition, watering, and pest monitoring to preserve plant health.",
};

const UNMATCHED: Seed = Seed {
    key: "",
    disease_name: "Unrecognised condition",
    severity: Severity::Medium,
    scientific_name: None,
    description: None,
    symptoms: "Symptoms do not match a known entry in the catalog.",
    treatment: "Consult a plant pathology expert for an accurate diagnosis. Isolate the plant to prevent spread.",
    prevention: "Monitor symptom development and document it for expert reference.",
};

const SEEDS: &[Seed] = &[
    Seed {
        key: "northern leaf blight",
        disease_name: "Northern Leaf Blight",
        severity: Severity::High,
        scientific_name: Some("Exserohilum turcicum"),
        description: Some("A destructive foliar disease of corn caused by the fungus Exserohilum turcicum."),
        symptoms: "Large, elliptical, gray-green to tan lesions with dark borders on lower leaves. Lesions can extend across the entire leaf width.",
        treatment: "Use fungicides containing strobilurin or triazole. Remove infected plant material and practice crop rotation.",
        prevention: "Plant resistant varieties, avoid overhead irrigation, and maintain proper plant spacing.",
    },
    Seed {
        key: "early blight",
        disease_name: "Early blight",
        severity: Severity::Medium,
        scientific_name: Some("Alternaria solani"),
        description: Some("A common fungal disease of potato and tomato plants caused by Alternaria solani."),
        symptoms: "Dark brown spots with concentric rings on older leaves, often with a target-like appearance and yellow halos.",
        treatment: "Apply copper-based fungicides or chlorothalonil every 7-10 days. Remove infected lower leaves and improve air circulation.",
        prevention: "Use resistant varieties, rotate crops, mulch around plants, and avoid overhead watering.",
    },
    Seed {
        key: "late blight",
        disease_name: "Late blight",
        severity: Severity::Critical,
        scientific_name: Some("Phytophthora infestans"),
        description: Some("A devastating disease caused by the water mold Phytophthora infestans that can destroy a crop within days."),
        symptoms: "Water-soaked spots that quickly turn brown or black. White fuzzy growth may appear on leaf undersides in humid conditions.",
        treatment: "Apply systemic fungicides containing metalaxyl or mancozeb. Remove and isolate infected plants immediately.",
        prevention: "Use certified disease-free seed, ensure good drainage, and apply preventive fungicide sprays.",
    },
    Seed {
        key: "common rust",
        disease_name: "Common rust",
        severity: Severity::Low,
        scientific_name: Some("Puccinia sorghi"),
        description: Some("A widespread fungal disease of corn characterised by reddish-brown pustules."),
        symptoms: "Small, reddish-brown pustules scattered on both leaf surfaces. Pustules may rupture and release orange-brown spores.",
        treatment: "Apply fungicides such as mancozeb or chlorothalonil. Remove volunteer corn plants and infected debris.",
        prevention: "Plant resistant varieties, ensure proper crop rotation, and maintain field sanitation.",
    },
    Seed {
        key: "cercospora",
        disease_name: "Cercospora leaf spot",
        severity: Severity::Medium,
        scientific_name: Some("Cercospora zeae-maydis"),
        description: Some("A fungal disease of corn that causes significant yield loss if not managed."),
        symptoms: "Small grayish spots that develop into rectangular lesions with gray centers and dark brown borders.",
        treatment: "Apply fungicides containing strobilurin or triazole compounds. Remove infected plant debris.",
        prevention: "Use resistant varieties, rotate with non-host crops, and keep plant spacing wide enough for air circulation.",
    },
    Seed {
        key: "bacterial spot",
        disease_name: "Bacterial spot",
        severity: Severity::High,
        scientific_name: Some("Xanthomonas campestris pv. vesicatoria"),
        description: Some("A serious bacterial disease of tomatoes and peppers."),
        symptoms: "Small, dark brown spots with yellow halos on leaves. Fruit may develop raised, corky spots.",
        treatment: "Apply copper-based bactericides. Remove infected plants and avoid overhead watering.",
        prevention: "Use disease-free seeds, practice crop rotation, and ensure good air circulation.",
    },
    Seed {
        key: "septoria leaf spot",
        disease_name: "Septoria leaf spot",
        severity: Severity::Medium,
        scientific_name: Some("Septoria lycopersici"),
        description: Some("A common fungal disease of tomato foliage."),
        symptoms: "Small, circular spots with gray centers and dark brown borders on lower leaves, with black specks in the centers.",
        treatment: "Apply copper-based fungicides or chlorothalonil. Remove infected lower leaves.",
        prevention: "Mulch to prevent soil splash, avoid overhead watering, and practice crop rotation.",
    },
    Seed {
        key: "target spot",
        disease_name: "Target Spot",
        severity: Severity::Medium,
        scientific_name: Some("Corynespora cassiicola"),
        description: Some("A fungal disease affecting tomato leaves, stems, and fruit."),
        symptoms: "Brown spots with concentric rings giving a target-like appearance. Spots may have yellow halos and coalesce.",
        treatment: "Apply fungicides containing strobilurin or copper compounds. Remove infected plant debris.",
        prevention: "Ensure good air circulation, avoid overhead irrigation, and practice crop rotation.",
    },
    Seed {
        key: "leaf mold",
        disease_name: "Leaf Mold",
        severity: Severity::Medium,
        scientific_name: Some("Cladosporium fulvum"),
        description: Some("A fungal disease that primarily affects greenhouse-grown tomatoes."),
        symptoms: "Yellow spots on upper leaf surfaces with olive-green to brown fuzzy growth on undersides.",
        treatment: "Improve ventilation, reduce humidity, and apply fungicides if necessary.",
        prevention: "Ensure good air circulation, avoid overhead watering, and maintain proper spacing.",
    },
    Seed {
        key: "spider mites",
        disease_name: "Spider mites",
        severity: Severity::Medium,
        scientific_name: Some("Tetranychus urticae"),
        description: Some("Two-spotted spider mites feed on plant fluids, causing stippling and leaf damage."),
        symptoms: "Fine stippling on leaves, webbing on leaf undersides, and eventual yellowing and leaf drop.",
        treatment: "Apply miticides or release predatory mites. Increase humidity around plants.",
        prevention: "Maintain adequate soil moisture, avoid excess nitrogen, and encourage beneficial insects.",
    },
    Seed {
        key: "yellow leaf curl",
        disease_name: "Tomato Yellow Leaf Curl Virus",
        severity: Severity::Critical,
        scientific_name: Some("Begomovirus"),
        description: Some("A whitefly-transmitted viral disease causing severe stunting and yield loss."),
        symptoms: "Upward curling and yellowing of leaves, stunted growth, and reduced fruit production.",
        treatment: "No cure available. Remove infected plants and control whitefly vectors.",
        prevention: "Use resistant varieties, control whiteflies with sticky traps or insecticides, and use reflective mulches.",
    },
    Seed {
        key: "mosaic virus",
        disease_name: "Tomato mosaic virus",
        severity: Severity::High,
        scientific_name: Some("Tobamovirus"),
        description: Some("A virus causing mottling and distortion of tomato leaves."),
        symptoms: "Light and dark green mottled pattern on leaves, leaf distortion, and stunted growth.",
        treatment: "No treatment available. Remove infected plants and disinfect tools.",
        prevention: "Use certified virus-free seed and practice strict tool sanitation.",
    },
    // Generic fallbacks
    Seed {
        key: "blight",
        disease_name: "Blight",
        severity: Severity::High,
        scientific_name: None,
        description: None,
        symptoms: "Rapidly spreading brown or black lesions on leaves and stems.",
        treatment: "Remove infected parts immediately and apply a systemic fungicide.",
        prevention: "Avoid excess humidity around plants and clean tools after use.",
    },
    Seed {
        key: "rust",
        disease_name: "Rust",
        severity: Severity::Low,
        scientific_name: None,
        description: None,
        symptoms: "Orange to reddish-brown pustules on leaf surfaces.",
        treatment: "Remove infected leaves and apply a copper- or sulfur-based fungicide.",
        prevention: "Improve air circulation, avoid evening watering, and clear crop residue after the season.",
    },
    Seed {
        key: "spot",
        disease_name: "Leaf spot",
        severity: Severity::Medium,
        scientific_name: None,
        description: None,
        symptoms: "Discrete dark spots on leaves, sometimes with yellow halos.",
        treatment: "Remove infected leaves and apply a preventive fungicide during wet periods.",
        prevention: "Increase plant spacing and rotate crops to prevent pathogen build-up.",
    },
    Seed {
        key: "mold",
        disease_name: "Mold",
        severity: Severity::Medium,
        scientific_name: None,
        description: None,
        symptoms: "Fuzzy fungal growth on leaf surfaces.",
        treatment: "Reduce humidity, prune for airflow, and apply a suitable systemic fungicide.",
        prevention: "Avoid overwatering and remove organic debris around plants.",
    },
    Seed {
        key: "mites",
        disease_name: "Mites",
        severity: Severity::Medium,
        scientific_name: None,
        description: None,
        symptoms: "Stippled, discoloured leaves with fine webbing.",
        treatment: "Apply an acaricide and rinse leaves regularly with water.",
        prevention: "Encourage natural predators such as ladybugs and isolate infested plants.",
    },
    Seed {
        key: "virus",
        disease_name: "Viral infection",
        severity: Severity::High,
        scientific_name: None,
        description: None,
        symptoms: "Mottling, curling, or distortion of leaves and stunted growth.",
        treatment: "No cure available. Remove infected plants and control insect vectors.",
        prevention: "Use certified virus-free seed and control vector insects.",
    },
];

#[derive(Debug, Clone)]
pub struct RecommendationCatalog {
    keyed: Vec<(String, RecommendationEntry)>,
    healthy: RecommendationEntry,
    unmatched: RecommendationEntry,
}

impl Default for RecommendationCatalog {
    fn default() -> Self {
        Self {
            keyed: SEEDS
                .iter()
                .map(|s| (s.key.to_string(), s.to_entry()))
                .collect(),
            healthy: HEALTHY.to_entry(),
            unmatched: UNMATCHED.to_entry(),
        }
    }
}

impl RecommendationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up advice for a decoded disease name
    pub fn lookup(&self, disease_name: &str) -> &RecommendationEntry {
        let needle = disease_name.to_lowercase();
        if needle.contains(HEALTHY.key) {
            return &self.healthy;
        }

        self.keyed
            .iter()
            .find(|(key, _)| needle.contains(key.as_str()))
            .map(|(_, entry)| entry)
            .unwrap_or(&self.unmatched)
    }

    pub fn lookup_decoded(&self, decoded: &DecodedClass) -> &RecommendationEntry {
        if decoded.is_healthy {
            return &self.healthy;
        }
        self.lookup(&decoded.disease_name)
    }

    pub fn healthy_entry(&self) -> &RecommendationEntry {
        &self.healthy
    }

    pub fn len(&self) -> usize {
        self.keyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyed.is_empty()
    }
}
