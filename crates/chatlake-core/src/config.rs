use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// How often the background probe-write runs (seconds).
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 30;
/// Budget for a single probe-write before the lake is declared unwritable.
pub const HEALTH_PROBE_TIMEOUT_MS: u64 = 1_000;
/// Depth of the webhook → writer queue. Deliveries beyond this are written
/// under backpressure, never dropped.
pub const INGEST_QUEUE_DEPTH: usize = 1024;

/// Top-level config (chatlake.toml + CHATLAKE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatlakeConfig {
    #[serde(default = "default_raw_log_dir")]
    pub raw_log_dir: String,
    #[serde(default = "default_partition_root")]
    pub partition_root: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    #[serde(default = "default_metadata_db_path")]
    pub metadata_db_path: String,
    /// Records accumulated per partition before a batch is published.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Columnar codec: "snappy" (default) or "zstd" for archive partitions.
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Days a day-log is kept after its date has passed.
    #[serde(default = "default_retention_days")]
    pub retention_days_raw: u32,
    /// When true, a day-log is only deleted once a completed checkpoint with
    /// a matching content hash exists. Default false: age alone decides.
    #[serde(default)]
    pub retention_requires_compaction: bool,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl Default for ChatlakeConfig {
    fn default() -> Self {
        Self {
            raw_log_dir: default_raw_log_dir(),
            partition_root: default_partition_root(),
            checkpoint_dir: default_checkpoint_dir(),
            metadata_db_path: default_metadata_db_path(),
            batch_size: default_batch_size(),
            compression: default_compression(),
            retention_days_raw: default_retention_days(),
            retention_requires_compaction: false,
            gateway: GatewayConfig::default(),
            locks: LockConfig::default(),
            dedup: DedupConfig::default(),
            llm: LlmConfig::default(),
            analysis: AnalysisConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Advisory-lock acquisition timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_ingest_lock_secs")]
    pub ingest_timeout_secs: u64,
    #[serde(default = "default_compact_lock_secs")]
    pub compact_timeout_secs: u64,
    #[serde(default = "default_job_lock_secs")]
    pub job_timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ingest_timeout_secs: default_ingest_lock_secs(),
            compact_timeout_secs: default_compact_lock_secs(),
            job_timeout_secs: default_job_lock_secs(),
        }
    }
}

/// Dedup index sizing. Below `bloom_threshold` published msg_ids an exact
/// hash set is used; above it, a bloom filter with `bloom_fp_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_bloom_threshold")]
    pub bloom_threshold: usize,
    #[serde(default = "default_bloom_fp_rate")]
    pub bloom_fp_rate: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            bloom_threshold: default_bloom_threshold(),
            bloom_fp_rate: default_bloom_fp_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider identifier. Only OpenAI-compatible endpoints are wired today.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Must come from CHATLAKE_LLM__API_KEY — never from a committed file.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_api_base")]
    pub api_base: String,
    /// Token budget for a single analysis batch. Keep headroom below the
    /// model's hard context limit: the estimator is approximate.
    #[serde(default = "default_max_tokens_per_batch")]
    pub max_tokens_per_batch: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: String::new(),
            api_base: default_llm_api_base(),
            max_tokens_per_batch: default_max_tokens_per_batch(),
            max_attempts: default_max_attempts(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Keyword-similarity score at or above which adjacent topics merge.
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f64,
    /// Additive bonus applied when two topics' time ranges touch or overlap.
    #[serde(default = "default_time_bonus")]
    pub time_bonus: f64,
    /// When set, merged topic summaries are also published as JSON files here.
    pub results_dir: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            merge_threshold: default_merge_threshold(),
            time_bonus: default_time_bonus(),
            results_dir: None,
        }
    }
}

/// Daily job driver: compaction of the previous day's log, raw-log
/// retention, and optional analysis of the configured chatrooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// UTC hour (0-23) at which the daily job fires.
    #[serde(default = "default_compact_hour")]
    pub compact_hour_utc: u32,
    /// Chatrooms analysed after each daily compaction. Empty = skip analysis.
    #[serde(default)]
    pub chatrooms: Vec<String>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compact_hour_utc: default_compact_hour(),
            chatrooms: Vec::new(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_raw_log_dir() -> String {
    "./data/raw".to_string()
}
fn default_partition_root() -> String {
    "./data/lake".to_string()
}
fn default_checkpoint_dir() -> String {
    "./data/checkpoints".to_string()
}
fn default_metadata_db_path() -> String {
    "./data/chatlake.db".to_string()
}
fn default_batch_size() -> usize {
    10_000
}
fn default_compression() -> String {
    "snappy".to_string()
}
fn default_retention_days() -> u32 {
    7
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_ingest_lock_secs() -> u64 {
    5
}
fn default_compact_lock_secs() -> u64 {
    60
}
fn default_job_lock_secs() -> u64 {
    300
}
fn default_bloom_threshold() -> usize {
    1_000_000
}
fn default_bloom_fp_rate() -> f64 {
    0.001
}
fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_api_base() -> String {
    "https://api.openai.com".to_string()
}
fn default_max_tokens_per_batch() -> usize {
    8_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_request_timeout() -> u64 {
    60
}
fn default_merge_threshold() -> f64 {
    0.35
}
fn default_time_bonus() -> f64 {
    0.1
}
fn default_compact_hour() -> u32 {
    1
}

impl ChatlakeConfig {
    /// Load config from a TOML file with CHATLAKE_* env var overrides.
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `CHATLAKE_LLM__API_KEY` → `llm.api_key`,
    /// `CHATLAKE_GATEWAY__PORT` → `gateway.port`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ./chatlake.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("chatlake.toml");

        let config: ChatlakeConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CHATLAKE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ChatlakeConfig::default();
        assert_eq!(cfg.batch_size, 10_000);
        assert_eq!(cfg.compression, "snappy");
        assert_eq!(cfg.retention_days_raw, 7);
        assert!(!cfg.retention_requires_compaction);
        assert_eq!(cfg.locks.ingest_timeout_secs, 5);
        assert_eq!(cfg.locks.compact_timeout_secs, 60);
        assert_eq!(cfg.locks.job_timeout_secs, 300);
        assert_eq!(cfg.llm.max_attempts, 3);
        assert!((cfg.analysis.merge_threshold - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn api_key_defaults_empty() {
        // The key must come from the environment, so a bare config parses
        // with an empty key rather than failing.
        let cfg = ChatlakeConfig::default();
        assert!(cfg.llm.api_key.is_empty());
    }
}
