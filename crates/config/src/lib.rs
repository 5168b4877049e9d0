//! Configuration loading, validation, and management for Chatline.
//!
//! Loads configuration from `~/.chatline/config.toml` with environment
//! variable overrides. Validates all settings at startup. The resulting
//! [`AppConfig`] is built once and handed to each component constructor.

use chatline_core::queue::{Acks, Compression, StartOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.chatline/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Durable store location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Per-session message cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Event queue, producer and consumer
    #[serde(default)]
    pub queue: QueueConfig,

    /// Context window assembly
    #[serde(default)]
    pub context: ContextConfig,

    /// Generative model endpoint
    #[serde(default)]
    pub model: ModelConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

/// Which implementation backs a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process, lost on exit
    Memory,
    /// The SQLite database named by `database.url`
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (`sqlite://path` or `sqlite::memory:`)
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    format!(
        "sqlite://{}",
        AppConfig::config_dir().join("chatline.sqlite").display()
    )
}
fn default_max_connections() -> u32 {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Maximum cached messages per session; 0 disables trimming
    #[serde(default = "default_cache_max_len")]
    pub max_len: usize,

    /// Sliding expiry refreshed on every append
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_cache_max_len() -> usize {
    100
}
fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_key_prefix() -> String {
    "chat:session".into()
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            max_len: default_cache_max_len(),
            ttl_secs: default_cache_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_dlq_topic")]
    pub dlq_topic: String,

    #[serde(default = "default_partitions")]
    pub partitions: u32,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_topic() -> String {
    "chat.messages".into()
}
fn default_dlq_topic() -> String {
    "chat.messages.dlq".into()
}
fn default_partitions() -> u32 {
    8
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            topic: default_topic(),
            dlq_topic: default_dlq_topic(),
            partitions: default_partitions(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// Whether `send` waits for the transport or hands off to a background batcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default)]
    pub acks: Acks,

    #[serde(default)]
    pub mode: ProducerMode,

    /// Records per flush in async mode
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest a record waits in the async batcher
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Total publish attempts before the error surfaces
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_batch_size() -> usize {
    100
}
fn default_linger_ms() -> u64 {
    10
}
fn default_write_timeout_ms() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    10
}

impl ProducerConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: Acks::default(),
            mode: ProducerMode::default(),
            batch_size: default_batch_size(),
            linger_ms: default_linger_ms(),
            compression: Compression::default(),
            write_timeout_ms: default_write_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Delay policy between handler attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles on each retry
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Where a group with no committed offset begins. Earliest, so messages
    /// published before the first consumer run are still persisted.
    #[serde(default = "default_start_offset")]
    pub start_offset: StartOffset,

    /// Longest a single fetch blocks
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Total handler attempts per envelope before dead-lettering
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,

    /// This instance's index within the group
    #[serde(default)]
    pub member_index: u32,

    /// Number of instances sharing the group
    #[serde(default = "default_members")]
    pub members: u32,
}

fn default_group_id() -> String {
    "chatline-consumer".into()
}
fn default_start_offset() -> StartOffset {
    StartOffset::Earliest
}
fn default_max_wait_ms() -> u64 {
    500
}
fn default_max_retry() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_commit_timeout_ms() -> u64 {
    3000
}
fn default_members() -> u32 {
    1
}

impl ConsumerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.retry_backoff_ms);
        match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let shift = retry.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift)
            }
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            start_offset: default_start_offset(),
            max_wait_ms: default_max_wait_ms(),
            max_retry: default_max_retry(),
            retry_backoff_ms: default_retry_backoff_ms(),
            backoff: BackoffStrategy::default(),
            commit_timeout_ms: default_commit_timeout_ms(),
            member_index: 0,
            members: default_members(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// History size above which older messages are summarized
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Recent messages included verbatim
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Prefix of the system entry carrying the summary
    #[serde(default = "default_summary_label")]
    pub summary_label: String,

    #[serde(default = "default_summary_timeout_ms")]
    pub summary_timeout_ms: u64,
}

fn default_threshold() -> usize {
    20
}
fn default_window() -> usize {
    20
}
fn default_system_prompt() -> String {
    "You are a helpful AI assistant. Answer the user's questions clearly and accurately.".into()
}
fn default_summary_label() -> String {
    "Conversation summary: ".into()
}
fn default_summary_timeout_ms() -> u64 {
    30_000
}

impl ContextConfig {
    pub fn summary_timeout(&self) -> Duration {
        Duration::from_millis(self.summary_timeout_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window: default_window(),
            system_prompt: default_system_prompt(),
            summary_label: default_summary_label(),
            summary_timeout_ms: default_summary_timeout_ms(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Ask the endpoint for SSE streaming replies
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_timeout_secs() -> u64 {
    120
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            stream: true,
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("stream", &self.stream)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.chatline/config.toml).
    ///
    /// Environment variables override the file:
    /// - `CHATLINE_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `CHATLINE_BASE_URL`
    /// - `CHATLINE_MODEL`
    /// - `CHATLINE_DATABASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load configuration from `path`, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(key) = std::env::var("CHATLINE_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        {
            self.model.api_key = Some(key);
        }

        if let Ok(url) = std::env::var("CHATLINE_BASE_URL") {
            self.model.base_url = url;
        }

        if let Ok(model) = std::env::var("CHATLINE_MODEL") {
            self.model.model = model;
        }

        if let Ok(url) = std::env::var("CHATLINE_DATABASE_URL") {
            self.database.url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatline")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.context.window == 0 {
            return Err(ConfigError::ValidationError(
                "context.window must be > 0".into(),
            ));
        }

        if self.queue.partitions == 0 {
            return Err(ConfigError::ValidationError(
                "queue.partitions must be > 0".into(),
            ));
        }

        if self.queue.producer.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "queue.producer.max_attempts must be > 0".into(),
            ));
        }

        if self.queue.consumer.max_retry == 0 {
            return Err(ConfigError::ValidationError(
                "queue.consumer.max_retry must be > 0".into(),
            ));
        }

        if self.queue.consumer.members == 0
            || self.queue.consumer.member_index >= self.queue.consumer.members
        {
            return Err(ConfigError::ValidationError(
                "queue.consumer.member_index must be < members".into(),
            ));
        }

        if self.queue.topic == self.queue.dlq_topic {
            return Err(ConfigError::ValidationError(
                "queue.topic and queue.dlq_topic must differ".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for chatline_core::Error {
    fn from(err: ConfigError) -> Self {
        chatline_core::Error::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.max_len, 100);
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.queue.topic, "chat.messages");
        assert_eq!(config.queue.consumer.max_retry, 3);
        assert_eq!(config.queue.consumer.start_offset, StartOffset::Earliest);
        assert_eq!(config.context.threshold, 20);
        assert_eq!(config.context.window, 20);
    }

    #[test]
    fn producer_defaults() {
        let p = ProducerConfig::default();
        assert_eq!(p.acks, Acks::All);
        assert_eq!(p.compression, Compression::Snappy);
        assert_eq!(p.batch_size, 100);
        assert_eq!(p.linger(), Duration::from_millis(10));
        assert_eq!(p.write_timeout(), Duration::from_secs(10));
        assert_eq!(p.max_attempts, 10);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.queue.dlq_topic, config.queue.dlq_topic);
        assert_eq!(parsed.cache.key_prefix, config.cache.key_prefix);
        assert_eq!(parsed.model.model, config.model.model);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let toml_str = r#"
[cache]
backend = "memory"
max_len = 5

[queue.consumer]
backoff = "exponential"
start_offset = "latest"

[queue.producer]
acks = "leader"
mode = "async"
compression = "zstd"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.cache.backend, Backend::Memory);
        assert_eq!(config.cache.max_len, 5);
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.queue.consumer.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.queue.consumer.start_offset, StartOffset::Latest);
        assert_eq!(config.queue.producer.acks, Acks::Leader);
        assert_eq!(config.queue.producer.mode, ProducerMode::Async);
        assert_eq!(config.queue.producer.compression, Compression::Zstd);
        assert_eq!(config.queue.partitions, 8);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.model.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_budget_rejected() {
        let mut config = AppConfig::default();
        config.queue.consumer.max_retry = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.queue.producer.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn dlq_topic_must_differ() {
        let mut config = AppConfig::default();
        config.queue.dlq_topic = config.queue.topic.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_strategies() {
        let mut c = ConsumerConfig::default();
        assert_eq!(c.backoff_for(1), Duration::from_millis(200));
        assert_eq!(c.backoff_for(3), Duration::from_millis(200));

        c.backoff = BackoffStrategy::Exponential;
        assert_eq!(c.backoff_for(1), Duration::from_millis(200));
        assert_eq!(c.backoff_for(2), Duration::from_millis(400));
        assert_eq!(c.backoff_for(3), Duration::from_millis(800));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.queue.consumer.group_id, "chatline-consumer");
    }

    #[test]
    fn config_file_is_parsed_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[context]\nwindow = 0\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ValidationError(_))
        ));

        std::fs::write(&path, "[context\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.model.api_key = Some("sk-secret-value".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-value"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("chat.messages.dlq"));
        assert!(toml_str.contains("chatline-consumer"));
    }
}
