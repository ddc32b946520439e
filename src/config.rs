//! Configuration management for Tagweld.
//!
//! Two layers: `Config` mirrors the optional fields of a config file
//! (TOML, YAML or JSON, picked by extension) and `Settings` is the
//! fully resolved runtime view the rest of the crate consumes.
//! Precedence is CLI flags over environment over file over defaults.
//! The hash of the loaded file doubles as the config version that
//! scopes every persistent cache entry.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::AssetKey;

/// Default pipeline name when neither config nor CLI names one.
pub const DEFAULT_PIPELINE: &str = "standard";

const DEFAULT_STORE_URL: &str = "http://localhost:8085";
const DEFAULT_DETECT_URL: &str = "http://localhost:8086";
const DEFAULT_APPROVE_THRESHOLD: f64 = 0.85;
const DEFAULT_SUGGEST_THRESHOLD: f64 = 0.50;
const DEFAULT_MAX_PAGES_PER_PASS: u32 = 50;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BATCH_SIZE: usize = 20;
const DEFAULT_CACHE_TTL_SECS: u64 = 21_600;
const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 2048;
const DEFAULT_REVIEW_LABEL: &str = "needs-annotation";
const DEFAULT_ANNOTATED_LABEL: &str = "annotated";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_DAEMON_POLL_SECS: u64 = 60;

/// Which implementation a component talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process store, for tests and local experiments.
    Memory,
    /// The real HTTP service.
    Http,
}

impl BackendKind {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "http" => Ok(BackendKind::Http),
            other => Err(format!(
                "unknown backend '{other}' (expected 'memory' or 'http')"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Http => "http",
        }
    }
}

/// Graph store connection settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backend: BackendKind,
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

/// Detection service connection settings.
#[derive(Debug, Clone)]
pub struct DetectSettings {
    pub backend: BackendKind,
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
    /// How often finalize re-polls jobs that are still running.
    pub poll_interval_secs: u64,
    /// Jobs older than this are treated as failed.
    pub job_timeout_secs: u64,
}

/// Knobs of the annotation pipeline itself.
#[derive(Debug, Clone)]
pub struct AnnotationSettings {
    pub pipeline: String,
    /// Detections at or above this confidence become approved edges.
    pub approve_threshold: f64,
    /// Detections at or above this (and below approve) become suggestions.
    pub suggest_threshold: f64,
    /// Page window a single pass covers; larger diagrams take several passes.
    pub max_pages_per_pass: u32,
    /// Launch attempts before a diagram is marked failed.
    pub max_attempts: u32,
    /// Diagrams per detection job; one launch batch shares a job pair.
    pub batch_size: usize,
    pub cache_ttl_secs: u64,
    pub memory_cache_capacity: usize,
    /// Diagram label that marks work for this engine.
    pub review_label: String,
    /// Label applied when a diagram is fully annotated.
    pub annotated_label: String,
    /// Placeholder node unresolved pattern edges point at.
    pub review_node: AssetKey,
    /// Delete a diagram's previous edges on its first finalize pass.
    pub clean_old_edges: bool,
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub daemon_poll_secs: u64,
    /// Restrict runs to one site (and optionally one unit).
    pub site: Option<String>,
    pub unit: Option<String>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub detect: DetectSettings,
    pub annotation: AnnotationSettings,
    pub runtime: RuntimeSettings,
    /// Hash of the loaded config file; scopes persistent cache entries.
    pub config_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreSettings {
                backend: BackendKind::Http,
                base_url: DEFAULT_STORE_URL.to_string(),
                api_token: None,
                timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            },
            detect: DetectSettings {
                backend: BackendKind::Http,
                base_url: DEFAULT_DETECT_URL.to_string(),
                api_token: None,
                timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
                poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
                job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            },
            annotation: AnnotationSettings {
                pipeline: DEFAULT_PIPELINE.to_string(),
                approve_threshold: DEFAULT_APPROVE_THRESHOLD,
                suggest_threshold: DEFAULT_SUGGEST_THRESHOLD,
                max_pages_per_pass: DEFAULT_MAX_PAGES_PER_PASS,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                batch_size: DEFAULT_BATCH_SIZE,
                cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
                memory_cache_capacity: DEFAULT_MEMORY_CACHE_CAPACITY,
                review_label: DEFAULT_REVIEW_LABEL.to_string(),
                annotated_label: DEFAULT_ANNOTATED_LABEL.to_string(),
                review_node: AssetKey::new("assets", "annotation-review"),
                clean_old_edges: false,
            },
            runtime: RuntimeSettings {
                workers: DEFAULT_WORKERS,
                daemon_poll_secs: DEFAULT_DAEMON_POLL_SECS,
                site: None,
                unit: None,
            },
            config_version: String::new(),
        }
    }
}

impl Settings {
    /// Fail fast on configurations that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), String> {
        let a = &self.annotation;
        if !(0.0..=1.0).contains(&a.approve_threshold) {
            return Err(format!(
                "approve_threshold {} out of range [0, 1]",
                a.approve_threshold
            ));
        }
        if !(0.0..=1.0).contains(&a.suggest_threshold) {
            return Err(format!(
                "suggest_threshold {} out of range [0, 1]",
                a.suggest_threshold
            ));
        }
        if a.suggest_threshold > a.approve_threshold {
            return Err(format!(
                "suggest_threshold {} exceeds approve_threshold {}",
                a.suggest_threshold, a.approve_threshold
            ));
        }
        if a.max_pages_per_pass == 0 {
            return Err("max_pages_per_pass must be at least 1".to_string());
        }
        if a.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if a.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if a.pipeline.trim().is_empty() {
            return Err("pipeline name must not be empty".to_string());
        }
        if a.review_label.trim().is_empty() || a.annotated_label.trim().is_empty() {
            return Err("diagram labels must not be empty".to_string());
        }
        if a.review_label == a.annotated_label {
            return Err(format!(
                "review label and annotated label are both '{}'",
                a.review_label
            ));
        }
        if a.review_node.space.trim().is_empty() || a.review_node.external_id.trim().is_empty() {
            return Err("review_node must name a placeholder asset".to_string());
        }
        if self.runtime.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.store.backend == BackendKind::Http && self.store.base_url.trim().is_empty() {
            return Err("store URL must be set for the http backend".to_string());
        }
        if self.detect.backend == BackendKind::Http && self.detect.base_url.trim().is_empty() {
            return Err("detect URL must be set for the http backend".to_string());
        }
        if self.runtime.site.is_none() && self.runtime.unit.is_some() {
            return Err("unit filter requires a site filter".to_string());
        }
        Ok(())
    }
}

/// Configuration file structure. Every field is optional; absent
/// fields keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detect_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detect_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggest_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages_per_pass: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_cache_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_label: Option<String>,
    /// Review placeholder node as `space:external_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_old_edges: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_poll_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Where this config was loaded from, if anywhere.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Candidate config locations, checked in order.
fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for ext in ["toml", "yaml", "yml", "json"] {
        candidates.push(PathBuf::from(format!("tagweld.{ext}")));
    }
    for ext in ["toml", "yaml", "yml", "json"] {
        let raw = format!("~/.config/tagweld/config.{ext}");
        let expanded = shellexpand::tilde(&raw);
        candidates.push(PathBuf::from(expanded.as_ref()));
    }
    candidates
}

impl Config {
    /// Load configuration from the first discovered config file, or
    /// defaults when none exists.
    pub async fn load() -> Self {
        for candidate in config_candidates() {
            if candidate.is_file() {
                match Self::load_from_path(&candidate).await {
                    Ok(config) => return config,
                    Err(err) => {
                        tracing::warn!("ignoring config {}: {}", candidate.display(), err);
                    }
                }
            }
        }
        Self::default()
    }

    /// Load configuration from a specific file path.
    /// Supports TOML, YAML and JSON based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {e}"))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

        let mut config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {e}"))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {e}"))?,
            _ => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {e}"))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) -> Result<(), String> {
        if let Some(ref url) = self.store_url {
            settings.store.base_url = url.clone();
        }
        if let Some(ref token) = self.store_token {
            settings.store.api_token = Some(token.clone());
        }
        if let Some(ref backend) = self.store_backend {
            settings.store.backend = BackendKind::parse(backend)?;
        }
        if let Some(ref url) = self.detect_url {
            settings.detect.base_url = url.clone();
        }
        if let Some(ref token) = self.detect_token {
            settings.detect.api_token = Some(token.clone());
        }
        if let Some(ref backend) = self.detect_backend {
            settings.detect.backend = BackendKind::parse(backend)?;
        }
        if let Some(ref pipeline) = self.pipeline {
            settings.annotation.pipeline = pipeline.clone();
        }
        if let Some(threshold) = self.approve_threshold {
            settings.annotation.approve_threshold = threshold;
        }
        if let Some(threshold) = self.suggest_threshold {
            settings.annotation.suggest_threshold = threshold;
        }
        if let Some(pages) = self.max_pages_per_pass {
            settings.annotation.max_pages_per_pass = pages;
        }
        if let Some(attempts) = self.max_attempts {
            settings.annotation.max_attempts = attempts;
        }
        if let Some(batch) = self.batch_size {
            settings.annotation.batch_size = batch;
        }
        if let Some(ttl) = self.cache_ttl_secs {
            settings.annotation.cache_ttl_secs = ttl;
        }
        if let Some(capacity) = self.memory_cache_capacity {
            settings.annotation.memory_cache_capacity = capacity;
        }
        if let Some(ref label) = self.review_label {
            settings.annotation.review_label = label.clone();
        }
        if let Some(ref label) = self.annotated_label {
            settings.annotation.annotated_label = label.clone();
        }
        if let Some(ref node) = self.review_node {
            settings.annotation.review_node = AssetKey::parse(node).ok_or_else(|| {
                format!("review_node '{node}' is not in space:external_id form")
            })?;
        }
        if let Some(clean) = self.clean_old_edges {
            settings.annotation.clean_old_edges = clean;
        }
        if let Some(timeout) = self.request_timeout {
            settings.store.timeout_secs = timeout;
            settings.detect.timeout_secs = timeout;
        }
        if let Some(interval) = self.poll_interval_secs {
            settings.detect.poll_interval_secs = interval;
        }
        if let Some(timeout) = self.job_timeout_secs {
            settings.detect.job_timeout_secs = timeout;
        }
        if let Some(workers) = self.workers {
            settings.runtime.workers = workers;
        }
        if let Some(poll) = self.daemon_poll_secs {
            settings.runtime.daemon_poll_secs = poll;
        }
        if let Some(ref site) = self.site {
            settings.runtime.site = Some(site.clone());
        }
        if let Some(ref unit) = self.unit {
            settings.runtime.unit = Some(unit.clone());
        }
        Ok(())
    }

    /// Compute SHA-256 hash of the serialized config. Persistent cache
    /// entries carry this hash and die when it changes.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Options controlling configuration loading.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config path; errors here are fatal rather than ignored.
    pub config_path: Option<PathBuf>,
    /// CLI pipeline override, applied after everything else.
    pub pipeline: Option<String>,
    /// CLI site/unit scope overrides.
    pub site: Option<String>,
    pub unit: Option<String>,
}

/// Environment overrides, applied between file config and CLI flags.
fn apply_env_overrides(settings: &mut Settings) -> Result<(), String> {
    if let Some(url) = env_nonempty("TAGWELD_STORE_URL") {
        settings.store.base_url = url;
    }
    if let Some(token) = env_nonempty("TAGWELD_STORE_TOKEN") {
        settings.store.api_token = Some(token);
    }
    if let Some(backend) = env_nonempty("TAGWELD_STORE_BACKEND") {
        settings.store.backend = BackendKind::parse(&backend)?;
    }
    if let Some(url) = env_nonempty("TAGWELD_DETECT_URL") {
        settings.detect.base_url = url;
    }
    if let Some(token) = env_nonempty("TAGWELD_DETECT_TOKEN") {
        settings.detect.api_token = Some(token);
    }
    if let Some(backend) = env_nonempty("TAGWELD_DETECT_BACKEND") {
        settings.detect.backend = BackendKind::parse(&backend)?;
    }
    if let Some(pipeline) = env_nonempty("TAGWELD_PIPELINE") {
        settings.annotation.pipeline = pipeline;
    }
    if let Some(node) = env_nonempty("TAGWELD_REVIEW_NODE") {
        settings.annotation.review_node = AssetKey::parse(&node).ok_or_else(|| {
            format!("TAGWELD_REVIEW_NODE '{node}' is not in space:external_id form")
        })?;
    }
    if let Some(workers) = env_nonempty("TAGWELD_WORKERS") {
        settings.runtime.workers = workers
            .parse()
            .map_err(|_| format!("TAGWELD_WORKERS must be a number, got '{workers}'"))?;
    }
    Ok(())
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

/// Resolve the full settings stack: defaults, then config file, then
/// environment, then CLI overrides. Validation is left to the caller
/// so error reporting can go through the CLI's formatting.
pub async fn load_settings_with_options(
    options: LoadOptions,
) -> Result<(Settings, Config), String> {
    let config = match &options.config_path {
        Some(path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings)?;
    apply_env_overrides(&mut settings)?;

    if let Some(pipeline) = options.pipeline {
        settings.annotation.pipeline = pipeline;
    }
    if let Some(site) = options.site {
        settings.runtime.site = Some(site);
    }
    if let Some(unit) = options.unit {
        settings.runtime.unit = Some(unit);
    }

    settings.config_version = config.hash();
    Ok((settings, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_toml() {
        let config: Config = toml::from_str(
            r#"
            store_url = "http://graph.internal:9000"
            pipeline = "std-v2"
            approve_threshold = 0.9
            max_pages_per_pass = 25
            site = "site-a"
            "#,
        )
        .unwrap();

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings).unwrap();
        assert_eq!(settings.store.base_url, "http://graph.internal:9000");
        assert_eq!(settings.annotation.pipeline, "std-v2");
        assert_eq!(settings.annotation.approve_threshold, 0.9);
        assert_eq!(settings.annotation.max_pages_per_pass, 25);
        assert_eq!(settings.runtime.site.as_deref(), Some("site-a"));
        // Untouched fields keep defaults.
        assert_eq!(settings.annotation.suggest_threshold, 0.50);
    }

    #[test]
    fn test_config_parses_yaml() {
        let config: Config = serde_yaml::from_str(
            r#"
            detect_url: "http://detect.internal:9001"
            detect_backend: memory
            workers: 8
            "#,
        )
        .unwrap();

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings).unwrap();
        assert_eq!(settings.detect.base_url, "http://detect.internal:9001");
        assert_eq!(settings.detect.backend, BackendKind::Memory);
        assert_eq!(settings.runtime.workers, 8);
    }

    #[test]
    fn test_bad_backend_name_is_an_error() {
        let config: Config = toml::from_str("store_backend = \"dynamo\"").unwrap();
        let mut settings = Settings::default();
        assert!(config.apply_to_settings(&mut settings).is_err());
    }

    #[test]
    fn test_review_node_parsing() {
        let config: Config = toml::from_str("review_node = \"equip:review-bin\"").unwrap();
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings).unwrap();
        assert_eq!(
            settings.annotation.review_node,
            AssetKey::new("equip", "review-bin")
        );

        let config: Config = toml::from_str("review_node = \"no-space-here\"").unwrap();
        assert!(config.apply_to_settings(&mut settings).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut settings = Settings::default();
        settings.annotation.approve_threshold = 0.4;
        settings.annotation.suggest_threshold = 0.6;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_page_window() {
        let mut settings = Settings::default();
        settings.annotation.max_pages_per_pass = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unit_without_site() {
        let mut settings = Settings::default();
        settings.runtime.unit = Some("unit-1".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_hash_tracks_content() {
        let a: Config = toml::from_str("pipeline = \"p1\"").unwrap();
        let b: Config = toml::from_str("pipeline = \"p2\"").unwrap();
        let a2: Config = toml::from_str("pipeline = \"p1\"").unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a2.hash());
    }

    #[tokio::test]
    async fn test_load_from_path_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagweld.yaml");
        tokio::fs::write(&path, "pipeline: from-yaml\n")
            .await
            .unwrap();
        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.pipeline.as_deref(), Some("from-yaml"));
        assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
    }
}
