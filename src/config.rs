// This module handles worker configuration.
// Values come from an optional TOML file, then environment variables (after .env is loaded) override them.
// Anything optional that isn't set simply switches the corresponding feature off.

use std::{collections::BTreeMap, path::{Path, PathBuf}, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    pub modifiers: ModifierConfig,
    pub face_swap: FaceSwapConfig,
    pub storage: StorageConfig,
    pub faces: FaceDetectionConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Base of the engine's REST API, e.g. http://127.0.0.1:3000/sdapi/v1.
    pub api_url: String,
    pub health_path: String,
    pub max_wait_secs: u64,
    pub probe_interval_ms: u64,
    pub probe_request_timeout_secs: u64,
    pub inference_timeout_secs: u64,
    pub max_attempts: u32,
    pub shutdown_grace_secs: u64,
    /// Extra environment for the engine process.
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let args = [
            "/stable-diffusion-webui/webui.py",
            "--xformers",
            "--no-half-vae",
            "--skip-python-version-check",
            "--skip-torch-cuda-test",
            "--skip-install",
            "--ckpt", "/model.safetensors",
            "--lowram",
            "--opt-sdp-attention",
            "--disable-safe-unpickle",
            "--port", "3000",
            "--api",
            "--nowebui",
            "--skip-version-check",
            "--no-hashing",
            "--no-download-sd-model",
        ];
        Self {
            program: "python3".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            api_url: "http://127.0.0.1:3000/sdapi/v1".to_string(),
            health_path: "sd-models".to_string(),
            max_wait_secs: 900,
            probe_interval_ms: 200,
            probe_request_timeout_secs: 120,
            inference_timeout_secs: 600,
            max_attempts: 10,
            shutdown_grace_secs: 10,
            env: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub fn health_url(&self) -> String {
        self.endpoint(&self.health_path)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_request_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_request_timeout_secs)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// The fixed modifiers merged into every request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModifierConfig {
    pub lora_name: String,
    pub default_lora_level: f64,
    pub negative_tokens: String,
    pub checkpoint: Option<String>,
    pub default_clip_skip: u64,
}

impl Default for ModifierConfig {
    fn default() -> Self {
        Self {
            lora_name: "epicrealness".to_string(),
            default_lora_level: 1.0,
            negative_tokens: "veryBadImageNegative_v1.3, FastNegativeV2".to_string(),
            checkpoint: None,
            default_clip_skip: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaceSwapConfig {
    /// Key under alwayson_scripts.
    pub plugin_name: String,
    pub model: String,
    pub restorer: String,
    pub upscaler: String,
    pub upscaler_scale: f64,
    pub codeformer_weight: f64,
    pub default_strength: f64,
    pub device: String,
    pub detection_threshold: f64,
    pub max_faces: u32,
}

impl Default for FaceSwapConfig {
    fn default() -> Self {
        Self {
            plugin_name: "reactor".to_string(),
            model: "inswapper_128.onnx".to_string(),
            restorer: "CodeFormer".to_string(),
            upscaler: "None".to_string(),
            upscaler_scale: 1.0,
            codeformer_weight: 0.5,
            default_strength: 1.0,
            device: "CUDA".to_string(),
            detection_threshold: 0.6,
            max_faces: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub key_prefix: String,
    /// Return generated images inline (base64) instead of uploading them.
    pub direct_return: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            key_prefix: "faces".to_string(),
            direct_return: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaceDetectionConfig {
    pub url: Option<String>,
    /// Pixels added around each detected box before cropping.
    pub padding: u32,
    pub min_confidence: f32,
    pub timeout_secs: u64,
}

impl Default for FaceDetectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            padding: 32,
            min_confidence: 0.5,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    pub test_mode: bool,
    pub test_input_path: PathBuf,
    pub job_get_url: Option<String>,
    /// May contain `{job_id}`.
    pub job_post_url: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            test_mode: false,
            test_input_path: PathBuf::from("test_input.json"),
            job_get_url: None,
            job_post_url: None,
            api_key: None,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    /// Reads the TOML file (if any) and applies environment overrides.
    /// Callers validate once they've applied their own overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Error reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))?
            }
            None => WorkerConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides fields from environment variables, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), WorkerError> {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("ENGINE_API_URL") {
            self.engine.api_url = v;
        }
        if let Some(v) = non_empty("ENGINE_CHECKPOINT") {
            self.modifiers.checkpoint = Some(v);
        }
        if let Some(v) = non_empty("S3_BUCKET_NAME") {
            self.storage.bucket = Some(v);
        }
        if let Some(v) = non_empty("AWS_REGION") {
            self.storage.region = Some(v);
        }
        if let Some(v) = non_empty("S3_KEY_PREFIX") {
            self.storage.key_prefix = v;
        }
        if let Some(v) = non_empty("DIRECT_RETURN") {
            self.storage.direct_return = parse_bool("DIRECT_RETURN", &v)?;
        }
        if let Some(v) = non_empty("FACE_DETECTOR_URL") {
            self.faces.url = Some(v);
        }
        if let Some(v) = non_empty("TEST_MODE") {
            self.platform.test_mode = parse_bool("TEST_MODE", &v)?;
        }
        if let Some(v) = non_empty("TEST_INPUT_PATH") {
            self.platform.test_input_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("JOB_GET_URL") {
            self.platform.job_get_url = Some(v);
        }
        if let Some(v) = non_empty("JOB_POST_URL") {
            self.platform.job_post_url = Some(v);
        }
        if let Some(v) = non_empty("JOB_API_KEY") {
            self.platform.api_key = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.engine.program.is_empty() {
            return Err(WorkerError::Config("engine.program is empty".to_string()));
        }
        if self.engine.max_attempts == 0 {
            return Err(WorkerError::Config("engine.max_attempts must be at least 1".to_string()));
        }
        // A zero interval would turn readiness polling into a busy loop.
        if self.engine.probe_interval_ms == 0 {
            return Err(WorkerError::Config("engine.probe_interval_ms must be positive".to_string()));
        }
        if !self.platform.test_mode
            && (self.platform.job_get_url.is_none() || self.platform.job_post_url.is_none())
        {
            return Err(WorkerError::Config(
                "JOB_GET_URL and JOB_POST_URL are required unless TEST_MODE is set".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, WorkerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(WorkerError::Config(format!("{key} must be a boolean, got {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_serialization() {
        let config = WorkerConfig::default();
        let text = toml::to_string(&config).unwrap();
        let config2: WorkerConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn test_testdata_config() {
        let config: WorkerConfig = toml::from_str(include_str!("../testdata/worker.toml")).unwrap();
        assert_eq!(config.engine.program, "/usr/bin/env");
        assert_eq!(config.engine.health_url(), "http://127.0.0.1:7860/sdapi/v1/sd-models");
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.modifiers.checkpoint.as_deref(), Some("realistic.safetensors"));
        assert_eq!(config.storage.bucket.as_deref(), Some("worker-faces"));
        // Unset sections fall back to defaults.
        assert_eq!(config.face_swap, FaceSwapConfig::default());
        assert!(config.platform.test_mode);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = WorkerConfig::default();
        config
            .apply_env(env(&[
                ("S3_BUCKET_NAME", "bucket"),
                ("AWS_REGION", "eu-west-1"),
                ("FACE_DETECTOR_URL", "http://detector:8080"),
                ("DIRECT_RETURN", "false"),
                ("TEST_MODE", "1"),
                ("JOB_API_KEY", ""),
            ]))
            .unwrap();
        assert_eq!(config.storage.bucket.as_deref(), Some("bucket"));
        assert_eq!(config.storage.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.faces.url.as_deref(), Some("http://detector:8080"));
        assert!(!config.storage.direct_return);
        assert!(config.platform.test_mode);
        // Empty values count as unset.
        assert_eq!(config.platform.api_key, None);
    }

    #[test]
    fn test_bad_bool() {
        let mut config = WorkerConfig::default();
        let err = config.apply_env(env(&[("TEST_MODE", "maybe")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn test_validation() {
        let mut config = WorkerConfig::default();
        // No job platform configured and not in test mode.
        assert!(config.validate().is_err());
        config.platform.test_mode = true;
        config.validate().unwrap();
        config.engine.probe_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_joining() {
        let engine = EngineConfig {
            api_url: "http://localhost:3000/sdapi/v1/".to_string(),
            ..Default::default()
        };
        assert_eq!(engine.endpoint("/txt2img"), "http://localhost:3000/sdapi/v1/txt2img");
    }
}
