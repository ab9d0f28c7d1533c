//! Configuration loading for the aircheck pipeline
//!
//! Resolution order, highest priority first:
//! 1. Command-line argument (`--config`)
//! 2. `AIRCHECK_CONFIG` environment variable
//! 3. Platform config dir (`~/.config/aircheck/config.toml` on Linux)
//! 4. Compiled defaults
//!
//! Secrets (the inference API key) are always read from the environment,
//! never from the config file.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Model selection for the escalation policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Primary model for detection/analysis calls
    pub primary: String,
    /// Cheaper fallback used after primary failures
    pub fallback: String,
    /// Fixed low-cost model for the reformat-into-schema repair step
    pub repair: String,
    /// Model used for the review stage
    pub review: String,
    /// Embedding model
    pub embedding: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            primary: "gemini-2.5-pro".to_string(),
            fallback: "gemini-2.5-flash".to_string(),
            repair: "gemini-2.5-flash".to_string(),
            review: "gemini-2.5-pro".to_string(),
            embedding: "text-embedding-004".to_string(),
        }
    }
}

/// Tunable thresholds and intervals.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Overall confidence at or above which an analyzed snippet is routed
    /// to review instead of going straight to Processed
    pub review_confidence_threshold: u8,
    /// Cosine similarity at or above which two KB facts are duplicates
    pub kb_duplicate_threshold: f32,
    /// Cosine similarity floor for KB retrieval search
    pub kb_retrieval_threshold: f32,
    /// Minimum confidence for a fact to enter the knowledge base
    pub kb_min_confidence: u8,
    /// Seconds to sleep after a successful claim (more work is likely queued)
    pub busy_poll_secs: u64,
    /// Seconds to sleep when the store had nothing claimable
    pub idle_poll_secs: u64,
    /// Transient-failure retries before escalating to the fallback model
    pub max_transient_retries: u32,
    /// Timeout for a single inference call, in seconds
    pub inference_timeout_secs: u64,
    /// Context padding added before each extracted clip, in seconds
    pub clip_context_before_secs: u32,
    /// Context padding added after each extracted clip, in seconds
    pub clip_context_after_secs: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            review_confidence_threshold: 95,
            kb_duplicate_threshold: 0.92,
            kb_retrieval_threshold: 0.3,
            kb_min_confidence: 70,
            busy_poll_secs: 2,
            idle_poll_secs: 60,
            max_transient_retries: 3,
            inference_timeout_secs: 120,
            clip_context_before_secs: 30,
            clip_context_after_secs: 30,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite database file path
    pub database_path: PathBuf,
    /// Root directory of the object store (recordings and clips)
    pub storage_root: PathBuf,
    /// Inference API base URL
    pub api_base_url: String,
    /// Inference API key; populated from AIRCHECK_API_KEY, never from TOML
    #[serde(skip)]
    pub api_key: String,
    pub models: ModelConfig,
    pub tuning: Tuning,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("aircheck.db"),
            storage_root: default_data_dir().join("recordings"),
            api_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: String::new(),
            models: ModelConfig::default(),
            tuning: Tuning::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration, resolving the file location per the priority
    /// order documented at module level.
    pub fn load(cli_config: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_file(cli_config) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Ok(path) = std::env::var("AIRCHECK_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("AIRCHECK_STORAGE_ROOT") {
            config.storage_root = PathBuf::from(path);
        }
        config.api_key = std::env::var("AIRCHECK_API_KEY").unwrap_or_default();

        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Fail early if a stage that needs the inference API has no key.
    pub fn require_api_key(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::Config(
                "AIRCHECK_API_KEY environment variable was not set".to_string(),
            ));
        }
        Ok(())
    }
}

fn resolve_config_file(cli_config: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_config {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("AIRCHECK_CONFIG") {
        return Some(PathBuf::from(path));
    }

    let default = dirs::config_dir().map(|d| d.join("aircheck").join("config.toml"))?;
    if default.exists() {
        Some(default)
    } else {
        None
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("aircheck"))
        .unwrap_or_else(|| PathBuf::from("./aircheck_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = PipelineConfig::default();
        assert_eq!(config.tuning.review_confidence_threshold, 95);
        assert_eq!(config.tuning.kb_duplicate_threshold, 0.92);
        assert_eq!(config.tuning.kb_retrieval_threshold, 0.3);
        assert_eq!(config.tuning.busy_poll_secs, 2);
        assert_eq!(config.tuning.idle_poll_secs, 60);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database_path = \"/tmp/test.db\"\n\n[models]\nprimary = \"test-model\""
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.models.primary, "test-model");
        // Unspecified fields fall back to defaults
        assert_eq!(config.models.fallback, "gemini-2.5-flash");
        assert_eq!(config.tuning.kb_min_confidence, 70);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[[").unwrap();
        assert!(PipelineConfig::from_file(file.path()).is_err());
    }
}
