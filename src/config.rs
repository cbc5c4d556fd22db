//! TOML configuration.
//!
//! The whole file is parsed once into [`Config`] and handed to each
//! component's constructor. Every section except `[db]` is optional and
//! falls back to the defaults below. Secrets never live in the file; they
//! are read from the environment by the provider that needs them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_file_size_kb")]
    pub max_file_size_kb: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            max_file_size_kb: default_max_file_size_kb(),
            allowed_types: default_allowed_types(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_max_file_size_kb() -> u64 {
    10240
}
fn default_allowed_types() -> Vec<String> {
    ["txt", "pdf", "docx", "html", "md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Forwarded to the external extractor; the local chunker is always
    /// sentence-based.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

fn default_strategy() -> String {
    "semantic".to_string()
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_chunk_size() -> usize {
    100
}
fn default_max_chunk_size() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// `"local"` (synchronous sentence chunking) or `"external"`.
    #[serde(default = "default_extraction_mode")]
    pub mode: String,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_initial_delay")]
    pub poll_initial_delay_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_error_delay")]
    pub poll_error_delay_secs: u64,
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
    #[serde(default = "default_poll_window_hours")]
    pub poll_window_hours: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mode: default_extraction_mode(),
            api_url: None,
            timeout_secs: default_extraction_timeout(),
            poll_initial_delay_secs: default_poll_initial_delay(),
            poll_interval_secs: default_poll_interval(),
            poll_error_delay_secs: default_poll_error_delay(),
            max_poll_errors: default_max_poll_errors(),
            poll_window_hours: default_poll_window_hours(),
            webhook_url: None,
        }
    }
}

impl ExtractionConfig {
    pub fn is_external(&self) -> bool {
        self.mode == "external"
    }
}

fn default_extraction_mode() -> String {
    "local".to_string()
}
fn default_extraction_timeout() -> u64 {
    300
}
fn default_poll_initial_delay() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    120
}
fn default_poll_error_delay() -> u64 {
    300
}
fn default_max_poll_errors() -> u32 {
    10
}
fn default_poll_window_hours() -> u64 {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_enabled: true,
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            url: None,
            collection: default_collection(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_vector_provider() -> String {
    "memory".to_string()
}
fn default_collection() -> String {
    "rag_knowledge".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnswerConfig {
    #[serde(default = "default_answer_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_answer_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_answer_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            provider: default_answer_provider(),
            model: None,
            max_tokens: default_answer_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_answer_timeout(),
        }
    }
}

fn default_answer_provider() -> String {
    "openai".to_string()
}
fn default_answer_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f64 {
    0.7
}
fn default_answer_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_true")]
    pub hybrid_enabled: bool,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_true")]
    pub fallback_to_keyword: bool,
    /// `"fixed"` or `"bm25"`.
    #[serde(default = "default_keyword_scoring")]
    pub keyword_scoring: String,
    #[serde(default = "default_fixed_keyword_score")]
    pub fixed_keyword_score: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            similarity_threshold: default_threshold(),
            hybrid_enabled: true,
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            fallback_to_keyword: true,
            keyword_scoring: default_keyword_scoring(),
            fixed_keyword_score: default_fixed_keyword_score(),
        }
    }
}

fn default_limit() -> usize {
    3
}
fn default_threshold() -> f64 {
    0.7
}
fn default_vector_weight() -> f64 {
    0.8
}
fn default_keyword_weight() -> f64 {
    0.2
}
fn default_keyword_scoring() -> String {
    "fixed".to_string()
}
fn default_fixed_keyword_score() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_backoff_multiplier: u32,
    #[serde(default = "default_jitter")]
    pub embedding_jitter_max_secs: u64,
    #[serde(default = "default_vector_sync_delay")]
    pub vector_sync_delay_secs: u64,
    #[serde(default = "default_extraction_window")]
    pub extraction_retry_window_mins: u64,
    #[serde(default = "default_step_window")]
    pub embedding_retry_window_mins: u64,
    #[serde(default = "default_step_window")]
    pub vector_retry_window_mins: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_secs: default_backoff(),
            rate_limit_backoff_multiplier: default_rate_limit_multiplier(),
            embedding_jitter_max_secs: default_jitter(),
            vector_sync_delay_secs: default_vector_sync_delay(),
            extraction_retry_window_mins: default_extraction_window(),
            embedding_retry_window_mins: default_step_window(),
            vector_retry_window_mins: default_step_window(),
            worker_concurrency: default_worker_concurrency(),
            worker_poll_ms: default_worker_poll_ms(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_backoff() -> Vec<u64> {
    vec![30, 120, 300]
}
fn default_rate_limit_multiplier() -> u32 {
    2
}
fn default_jitter() -> u64 {
    30
}
fn default_vector_sync_delay() -> u64 {
    5
}
fn default_extraction_window() -> u64 {
    120
}
fn default_step_window() -> u64 {
    60
}
fn default_worker_concurrency() -> usize {
    8
}
fn default_worker_poll_ms() -> u64 {
    1000
}
fn default_lease_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_true")]
    pub track_searches: bool,
    #[serde(default = "default_true")]
    pub track_usage: bool,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            track_searches: true,
            track_usage: true,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    // Validate search
    if config.search.default_limit < 1 {
        bail!("search.default_limit must be >= 1");
    }
    for (key, value) in [
        ("search.similarity_threshold", config.search.similarity_threshold),
        ("search.vector_weight", config.search.vector_weight),
        ("search.keyword_weight", config.search.keyword_weight),
        ("search.fixed_keyword_score", config.search.fixed_keyword_score),
    ] {
        if !(0.0..=1.0).contains(&value) {
            bail!("{} must be in [0.0, 1.0]", key);
        }
    }
    match config.search.keyword_scoring.as_str() {
        "fixed" | "bm25" => {}
        other => bail!(
            "Unknown search.keyword_scoring: '{}'. Must be fixed or bm25.",
            other
        ),
    }

    // Validate jobs
    if config.jobs.backoff_secs.is_empty() {
        bail!("jobs.backoff_secs must list at least one delay");
    }
    if config.jobs.worker_concurrency == 0 {
        bail!("jobs.worker_concurrency must be > 0");
    }

    // Validate providers
    match config.extraction.mode.as_str() {
        "local" => {}
        "external" => {
            if config.extraction.api_url.is_none() {
                bail!("extraction.api_url must be set when extraction.mode is 'external'");
            }
        }
        other => bail!(
            "Unknown extraction mode: '{}'. Must be local or external.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "cohere" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, cohere, or ollama.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.vector.provider.as_str() {
        "memory" | "qdrant" | "pinecone" | "weaviate" => {}
        other => bail!(
            "Unknown vector provider: '{}'. Must be memory, qdrant, pinecone, or weaviate.",
            other
        ),
    }
    if config.vector.provider != "memory" && config.vector.url.is_none() {
        bail!(
            "vector.url must be set when vector.provider is '{}'",
            config.vector.provider
        );
    }

    match config.answer.provider.as_str() {
        "openai" | "anthropic" => {}
        other => bail!(
            "Unknown answer provider: '{}'. Must be openai or anthropic.",
            other
        ),
    }

    Ok(config)
}
