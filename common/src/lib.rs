/*!
common/src/lib.rs

Shared configuration types for feedbrief.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader merging a default file with an optional override file
- Startup validation of the merged configuration
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// LLM endpoint configuration (OpenAI-compatible chat completions API)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Full chat completions URL, e.g. "http://localhost:11434/v1/chat/completions"
    pub api_url: String,
    /// Name of the environment variable holding the API key. Local servers may omit it.
    pub api_key_env: Option<String>,
    /// Model used for entry summaries and the digest
    pub model: String,
    /// Model used for image descriptions (falls back to `model`)
    pub image_model: Option<String>,
    /// Model used for linked-page summaries (falls back to `model`)
    pub link_model: Option<String>,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub summary_max_tokens: usize,
    pub digest_max_tokens: usize,
    pub image_max_tokens: usize,
    pub link_max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434/v1/chat/completions".to_string(),
            api_key_env: None,
            model: "llama3.1".to_string(),
            image_model: None,
            link_model: None,
            timeout_seconds: 120,
            temperature: 0.3,
            summary_max_tokens: 1024,
            digest_max_tokens: 2048,
            image_max_tokens: 300,
            link_max_tokens: 400,
        }
    }
}

impl LlmConfig {
    pub fn image_model(&self) -> &str {
        self.image_model.as_deref().unwrap_or(&self.model)
    }

    pub fn link_model(&self) -> &str {
        self.link_model.as_deref().unwrap_or(&self.model)
    }
}

/// Bounded retry with exponential backoff, expressed in plain numbers for TOML
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
    pub max_total_timeout_secs: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
            max_total_timeout_secs: 300,
        }
    }
}

impl RetryPolicyConfig {
    /// Policy for "model still loading" errors: many slow retries under a long budget
    pub fn model_loading() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 5_000,
            backoff_factor: 1.5,
            max_backoff_ms: 60_000,
            max_total_timeout_secs: 900,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !(self.backoff_factor >= 1.0) {
            bail!("retry.{}: backoff_factor must be >= 1.0 (got {})", name, self.backoff_factor);
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            bail!(
                "retry.{}: initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                name,
                self.initial_backoff_ms,
                self.max_backoff_ms
            );
        }
        Ok(())
    }
}

/// Retry policies per call site
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enrichment calls (image descriptions, linked-page summaries)
    pub default: RetryPolicyConfig,
    /// HTTP GETs (feeds, linked pages, images)
    pub fetch: RetryPolicyConfig,
    /// Backend reports the model is still loading
    pub model_loading: RetryPolicyConfig,
    /// Per-entry relevance/summary generation
    pub summaries: RetryPolicyConfig,
    /// Cross-entry digest generation
    pub digest: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default: RetryPolicyConfig::default(),
            fetch: RetryPolicyConfig::default(),
            model_loading: RetryPolicyConfig::model_loading(),
            summaries: RetryPolicyConfig::default(),
            digest: RetryPolicyConfig::default(),
        }
    }
}

/// Phase toggles. Text summaries always run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub image_enrichment: bool,
    pub link_enrichment: bool,
    pub digest: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            image_enrichment: true,
            link_enrichment: true,
            digest: true,
        }
    }
}

/// Politeness / fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Linked-page text is truncated to this many characters before summarization
    pub max_page_chars: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 20,
            user_agent: "feedbrief/0.1.0".to_string(),
            max_page_chars: 12_000,
        }
    }
}

/// Local files written by a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub runs_dir: String,
    pub reports_dir: String,
    pub sent_ids_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            runs_dir: "data/runs".to_string(),
            reports_dir: "data/reports".to_string(),
            sent_ids_path: "data/sent_ids.json".to_string(),
        }
    }
}

/// Remote audit collector receiving serialized run records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub endpoint: String,
    #[serde(default = "default_audit_path")]
    pub path: String,
}

fn default_audit_path() -> String {
    "/api/runs".to_string()
}

impl AuditConfig {
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

/// One reader profile. Only ever consumed as prompt input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub feeds: Vec<String>,
    /// Who the digest is written for, e.g. "a platform engineer tracking Rust tooling"
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub relevance_criteria: Vec<String>,
    #[serde(default)]
    pub exclusion_criteria: Vec<String>,
    #[serde(default = "default_summary_paragraphs")]
    pub summary_paragraphs: u32,
    #[serde(default = "default_technical_depth")]
    pub technical_depth: String,
    #[serde(default = "default_writing_style")]
    pub writing_style: String,
    /// Upper bound on entries processed per run
    pub max_entries: Option<usize>,
}

fn default_summary_paragraphs() -> u32 {
    2
}

fn default_technical_depth() -> String {
    "intermediate".to_string()
}

fn default_writing_style() -> String {
    "concise and neutral".to_string()
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub personas: Vec<Persona>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for (label, path) in [("default", default_path), ("override", override_path)] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {} config: {}", label, path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse {} configuration", label))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Reject configurations that cannot produce a run. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_url.trim().is_empty() {
            bail!("llm.api_url must not be empty");
        }
        url::Url::parse(&self.llm.api_url)
            .with_context(|| format!("llm.api_url is not a valid URL: {}", self.llm.api_url))?;
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }

        self.retry.default.validate("default")?;
        self.retry.fetch.validate("fetch")?;
        self.retry.model_loading.validate("model_loading")?;
        self.retry.summaries.validate("summaries")?;
        self.retry.digest.validate("digest")?;

        if let Some(audit) = &self.audit {
            url::Url::parse(&audit.url())
                .with_context(|| format!("audit endpoint is not a valid URL: {}", audit.url()))?;
        }

        if self.personas.is_empty() {
            bail!("at least one [[personas]] entry is required");
        }
        let mut seen = HashSet::new();
        for persona in &self.personas {
            if persona.name.trim().is_empty() {
                bail!("persona name must not be empty");
            }
            if !seen.insert(persona.name.as_str()) {
                bail!("duplicate persona name: {}", persona.name);
            }
            if persona.feeds.is_empty() {
                bail!("persona '{}' has no feeds", persona.name);
            }
        }
        Ok(())
    }

    pub fn persona(&self, name: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.name == name)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [llm]
        model = "qwen2.5"

        [[personas]]
        name = "rustacean"
        feeds = ["https://blog.rust-lang.org/feed.xml"]
        focus_areas = ["compilers", "tooling"]
    "#;

    #[test]
    fn config_from_string_with_defaults() {
        let cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        assert_eq!(cfg.llm.model, "qwen2.5");
        assert_eq!(cfg.llm.image_model(), "qwen2.5");
        assert_eq!(cfg.retry.summaries, RetryPolicyConfig::default());
        assert_eq!(cfg.retry.model_loading.max_retries, 10);
        assert!(cfg.features.image_enrichment);
        assert_eq!(cfg.personas[0].summary_paragraphs, 2);
        cfg.validate().expect("valid config");
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let mut cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        cfg.personas.push(cfg.personas[0].clone());
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));

        let mut cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        cfg.retry.digest.backoff_factor = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str(MINIMAL).expect("parse config");
        cfg.personas[0].feeds.clear();
        assert!(cfg.validate().unwrap_err().to_string().contains("no feeds"));

        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn audit_url_joins_endpoint_and_path() {
        let audit = AuditConfig {
            endpoint: "http://audit.local:8080/".to_string(),
            path: "/api/runs".to_string(),
        };
        assert_eq!(audit.url(), "http://audit.local:8080/api/runs");
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        std::fs::write(&default_path, MINIMAL).expect("write default");
        std::fs::write(
            &override_path,
            "[llm]\ntemperature = 0.9\n[features]\ndigest = false\n",
        )
        .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");
        assert_eq!(cfg.llm.model, "qwen2.5");
        assert!((cfg.llm.temperature - 0.9).abs() < f32::EPSILON);
        assert!(!cfg.features.digest);
        assert!(cfg.features.link_enrichment);
        assert_eq!(cfg.personas.len(), 1);
    }
}
