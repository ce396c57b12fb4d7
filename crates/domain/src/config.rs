//! Configuration model: TOML file for shape, environment for secrets.
//!
//! Every external dependency names the environment variable its token is
//! read from; [`Config::validate`] reports a fatal issue when a required
//! variable is unset, and startup aborts on any error-severity issue.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transcript_api: TranscriptApiConfig,
    #[serde(default)]
    pub slide_extractor: SlideExtractorConfig,
    #[serde(default)]
    pub object_storage: ObjectStorageConfig,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT
    /// recommended). Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "d_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: d_db_path() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// External services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptApiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "d_transcript_token_env")]
    pub token_env: String,
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_retries")]
    pub max_retries: u32,
}

impl Default for TranscriptApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_env: d_transcript_token_env(),
            timeout_ms: d_timeout_ms(),
            max_retries: d_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlideExtractorConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "d_extractor_token_env")]
    pub token_env: String,
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
    /// Upper bound on how long the job monitor tails the extractor's SSE
    /// stream before giving up.
    #[serde(default = "d_monitor_timeout_secs")]
    pub monitor_timeout_secs: u64,
}

impl Default for SlideExtractorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_env: d_extractor_token_env(),
            timeout_ms: d_timeout_ms(),
            monitor_timeout_secs: d_monitor_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStorageConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "d_object_token_env")]
    pub token_env: String,
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_env: d_object_token_env(),
            timeout_ms: d_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "d_blob_token_env")]
    pub token_env: String,
    #[serde(default = "d_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token_env: d_blob_token_env(),
            timeout_ms: d_timeout_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_llm_url")]
    pub base_url: String,
    #[serde(default = "d_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_llm_model")]
    pub model: String,
    /// Model used for slide image analysis; falls back to `model`.
    #[serde(default)]
    pub slide_model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "d_llm_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_llm_url(),
            api_key_env: d_llm_key_env(),
            model: d_llm_model(),
            slide_model: None,
            max_tokens: None,
            temperature: None,
            timeout_ms: d_llm_timeout_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow tuning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Default retry budget for transient step failures.
    #[serde(default = "d_retries")]
    pub step_max_retries: u32,
    /// Base of the exponential backoff between attempts, in milliseconds.
    #[serde(default = "d_backoff_ms")]
    pub backoff_base_ms: u64,
    /// Age after which an `in_progress` slide extraction with no slides is
    /// declared timed out.
    #[serde(default = "d_stale_mins")]
    pub extraction_stale_after_mins: i64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_max_retries: d_retries(),
            backoff_base_ms: d_backoff_ms(),
            extraction_stale_after_mins: d_stale_mins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Config {
    /// Check the configuration for problems. Error-severity issues abort
    /// startup; warnings are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let mut require_url = |field: &str, value: &str| {
            if value.trim().is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: field.to_owned(),
                    message: "base_url is required".into(),
                });
            }
        };
        require_url("transcript_api.base_url", &self.transcript_api.base_url);
        require_url("slide_extractor.base_url", &self.slide_extractor.base_url);
        require_url("object_storage.base_url", &self.object_storage.base_url);
        require_url("blob_storage.base_url", &self.blob_storage.base_url);

        for (field, env) in [
            ("transcript_api.token_env", &self.transcript_api.token_env),
            ("slide_extractor.token_env", &self.slide_extractor.token_env),
            ("object_storage.token_env", &self.object_storage.token_env),
            ("blob_storage.token_env", &self.blob_storage.token_env),
            ("llm.api_key_env", &self.llm.api_key_env),
        ] {
            if std::env::var(env).map(|v| v.is_empty()).unwrap_or(true) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: field.to_owned(),
                    message: format!("environment variable {env} is not set"),
                });
            }
        }

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be non-zero".into(),
            });
        }

        if self.workflow.extraction_stale_after_mins < 1 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "workflow.extraction_stale_after_mins".into(),
                message: "very small staleness window; extractions may be \
                          marked timed out while still running"
                    .into(),
            });
        }

        issues
    }
}

/// Read a secret from the environment, failing when it is unset or empty.
pub fn env_secret(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "required environment variable {var} is not set"
        ))),
    }
}

// ── serde defaults ─────────────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    3400
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into()]
}
fn d_db_path() -> PathBuf {
    PathBuf::from("./data/vidscribe.db")
}
fn d_transcript_token_env() -> String {
    "VS_TRANSCRIPT_API_TOKEN".into()
}
fn d_extractor_token_env() -> String {
    "VS_SLIDE_EXTRACTOR_TOKEN".into()
}
fn d_object_token_env() -> String {
    "VS_OBJECT_STORAGE_TOKEN".into()
}
fn d_blob_token_env() -> String {
    "VS_BLOB_STORAGE_TOKEN".into()
}
fn d_llm_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_llm_key_env() -> String {
    "VS_LLM_API_KEY".into()
}
fn d_llm_model() -> String {
    "gpt-4o".into()
}
fn d_timeout_ms() -> u64 {
    30_000
}
fn d_llm_timeout_ms() -> u64 {
    120_000
}
fn d_retries() -> u32 {
    3
}
fn d_backoff_ms() -> u64 {
    100
}
fn d_monitor_timeout_secs() -> u64 {
    1_200
}
fn d_stale_mins() -> i64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3400);
        assert_eq!(config.workflow.step_max_retries, 3);
        assert_eq!(config.slide_extractor.monitor_timeout_secs, 1_200);
    }

    #[test]
    fn validate_flags_missing_urls() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "transcript_api.base_url"
                && i.severity == ConfigSeverity::Error));
        assert!(issues
            .iter()
            .any(|i| i.field == "blob_storage.base_url"));
    }

    #[test]
    fn validate_flags_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.field == "server.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn env_secret_requires_value() {
        assert!(env_secret("VS_TEST_UNSET_VARIABLE_XYZ").is_err());
        std::env::set_var("VS_TEST_SET_VARIABLE_XYZ", "tok");
        assert_eq!(env_secret("VS_TEST_SET_VARIABLE_XYZ").unwrap(), "tok");
        std::env::remove_var("VS_TEST_SET_VARIABLE_XYZ");
    }

    #[test]
    fn toml_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [transcript_api]
            base_url = "https://transcripts.example.com"

            [workflow]
            step_max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transcript_api.base_url, "https://transcripts.example.com");
        assert_eq!(config.workflow.step_max_retries, 5);
    }
}
