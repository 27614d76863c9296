use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_config: ModelConfig,
    pub heuristic_config: HeuristicConfig,
    pub cache_config: CacheConfig,
    pub quota_config: QuotaConfig,
    pub upload_config: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// ONNX model file for the real backend
    pub model_path: PathBuf,
    /// Optional classes.json; the built-in taxonomy is used when unset
    pub classes_path: Option<PathBuf>,
    /// Square input edge in pixels
    pub input_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicConfig {
    /// Artificial delay so the heuristic path looks like real inference
    #[serde(with = "duration_ms")]
    pub simulated_latency: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Predictions allowed per unauthenticated identity per window
    pub limit: u32,
    #[serde(with = "duration_ms")]
    pub reset_window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_bytes: usize,
    pub allowed_types: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("./models/plant_disease.onnx"),
            classes_path: None,
            input_size: 224,
        }
    }
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            simulated_latency: Duration::from_millis(1500),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 2,
            reset_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024, // 10MB
            allowed_types: ["jpeg", "jpg", "png", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: 5000,
            model_config: ModelConfig::default(),
            heuristic_config: HeuristicConfig::default(),
            cache_config: CacheConfig::default(),
            quota_config: QuotaConfig::default(),
            upload_config: UploadConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Config::default();

        let api_host = env::var("API_HOST").unwrap_or_else(|_| defaults.api_host.clone());
        let api_port = env_or("API_PORT", defaults.api_port);

        // Model Configuration
        let model_path = env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_config.model_path);
        let classes_path = env::var("CLASSES_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let input_size = env_or("MODEL_INPUT_SIZE", defaults.model_config.input_size);

        let simulated_latency = Duration::from_millis(env_or(
            "HEURISTIC_LATENCY_MS",
            defaults.heuristic_config.simulated_latency.as_millis() as u64,
        ));

        let capacity = env_or("PREDICTION_CACHE_CAPACITY", defaults.cache_config.capacity);

        // Guest quota
        let limit = env_or("GUEST_DETECTION_LIMIT", defaults.quota_config.limit);
        let reset_hours: u64 = env_or("GUEST_RESET_HOURS", 24);

        let max_bytes = env_or("MAX_FILE_SIZE", defaults.upload_config.max_bytes);
        let allowed_types = env::var("ALLOWED_IMAGE_TYPES")
            .map(|s| {
                s.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.upload_config.allowed_types);

        if capacity == 0 {
            return Err(anyhow::anyhow!("PREDICTION_CACHE_CAPACITY must be at least 1"));
        }
        if reset_hours == 0 {
            return Err(anyhow::anyhow!("GUEST_RESET_HOURS must be at least 1"));
        }

        Ok(Self {
            api_host,
            api_port,
            model_config: ModelConfig {
                model_path,
                classes_path,
                input_size,
            },
            heuristic_config: HeuristicConfig { simulated_latency },
            cache_config: CacheConfig { capacity },
            quota_config: QuotaConfig {
                limit,
                reset_window: Duration::from_secs(reset_hours * 60 * 60),
            },
            upload_config: UploadConfig {
                max_bytes,
                allowed_types,
            },
        })
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "API_PORT",
            "MODEL_PATH",
            "CLASSES_PATH",
            "GUEST_DETECTION_LIMIT",
            "GUEST_RESET_HOURS",
            "PREDICTION_CACHE_CAPACITY",
            "ALLOWED_IMAGE_TYPES",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_load_defaults() {
        clear_env();
        let config = Config::load().unwrap();

        assert_eq!(config.api_port, 5000);
        assert_eq!(config.quota_config.limit, 2);
        assert_eq!(config.quota_config.reset_window, Duration::from_secs(86_400));
        assert!(config.model_config.classes_path.is_none());
        assert!(config.upload_config.allowed_types.contains(&"webp".to_string()));
    }

    #[test]
    #[serial]
    fn test_load_overrides() {
        clear_env();
        env::set_var("GUEST_DETECTION_LIMIT", "5");
        env::set_var("GUEST_RESET_HOURS", "1");
        env::set_var("ALLOWED_IMAGE_TYPES", "PNG, jpg");
        env::set_var("API_PORT", "not-a-port");

        let config = Config::load().unwrap();
        clear_env();

        assert_eq!(config.quota_config.limit, 5);
        assert_eq!(config.quota_config.reset_window, Duration::from_secs(3600));
        assert_eq!(config.upload_config.allowed_types, vec!["png", "jpg"]);
        assert_eq!(config.api_port, 5000);
    }

    #[test]
    #[serial]
    fn test_zero_capacity_rejected() {
        clear_env();
        env::set_var("PREDICTION_CACHE_CAPACITY", "0");
        let result = Config::load();
        clear_env();
        assert!(result.is_err());
    }
}
