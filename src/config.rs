use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::classify::ai::AiConfig;
use crate::classify::ClassifyConfig;
use crate::error::EngineError;
use crate::providers::AdapterConfig;
use crate::queue::QueueConfig;
use crate::sync::SyncConfig;

/// Engine configuration, read once at startup from a JSON file. Every
/// section has working defaults so a missing file just means a local
/// setup with no AI scorer configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the database and the vault master key.
    pub data_dir: PathBuf,
    /// Scheduler cadence in seconds. Due-checks run on this fixed
    /// schedule; an account's own interval decides whether a tick
    /// actually syncs it.
    pub tick_secs: u64,
    /// How long shutdown waits for in-flight jobs before giving up.
    pub shutdown_drain_secs: u64,
    /// Consecutive sync failures before an account is flagged for an
    /// operator.
    pub attention_threshold: i64,
    pub queue: QueueConfig,
    pub adapter: AdapterConfig,
    pub classify: ClassifyConfig,
    /// AI scorer settings. Absent means rule-only classification.
    pub ai: Option<AiConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            tick_secs: 60,
            shutdown_drain_secs: 30,
            attention_threshold: 3,
            queue: QueueConfig::default(),
            adapter: AdapterConfig::default(),
            classify: ClassifyConfig::default(),
            ai: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EngineError::Config(format!("cannot read {}: {err}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| EngineError::Config(format!("bad config {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.tick_secs == 0 {
            return Err(EngineError::Config("tick_secs must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.classify.review_threshold) {
            return Err(EngineError::Config(
                "classify.review_threshold must be in [0, 1]".into(),
            ));
        }
        if self.classify.tie_epsilon < 0.0 {
            return Err(EngineError::Config(
                "classify.tie_epsilon must not be negative".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(EngineError::Config(
                "queue.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mail-sync.db")
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            adapter: self.adapter.clone(),
            attention_threshold: self.attention_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tick_secs, 60);
        assert_eq!(config.queue.sync_concurrency, 2);
        assert_eq!(config.queue.classify_concurrency, 5);
        assert!((config.classify.review_threshold - 0.5).abs() < f64::EPSILON);
        assert!(config.ai.is_none());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "tick_secs": 30,
                "queue": {"sync_concurrency": 4},
                "classify": {"review_threshold": 0.7}
            }"#,
        )
        .unwrap();
        assert_eq!(config.tick_secs, 30);
        assert_eq!(config.queue.sync_concurrency, 4);
        assert_eq!(config.queue.classify_concurrency, 5);
        assert!((config.classify.review_threshold - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn ai_section_parses() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"ai": {"provider": "gemini", "model": "gemini-pro", "api_key": "k"}}"#,
        )
        .unwrap();
        let ai = config.ai.unwrap();
        assert_eq!(ai.model, "gemini-pro");
        assert_eq!(ai.timeout_secs, 30);
    }

    #[test]
    fn bad_threshold_rejected() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"classify": {"review_threshold": 1.5}}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
