use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_CONVERSION_COMMAND: &str = "pdftotext -layout {input} {output}";

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ragdesk server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the Qdrant instance that stores every collection.
    pub qdrant_url: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Name of the shared collection seeded from the static corpus.
    pub global_collection_name: String,
    /// Location of the static JSON corpus used to seed the global collection.
    pub knowledge_path: PathBuf,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of the Ollama runtime used for embeddings.
    pub ollama_url: String,
    /// Base URL of the chat model endpoint (Ollama-compatible).
    pub llm_url: String,
    /// Chat model identifier.
    pub llm_model: String,
    /// Optional bearer token for hosted chat endpoints.
    pub llm_api_key: Option<String>,
    /// Sampling temperature sent with every chat request.
    pub llm_temperature: f32,
    /// Optional override for the automatic chunk size selection.
    pub text_splitter_chunk_size: Option<usize>,
    /// Token overlap between adjacent chunks.
    pub text_splitter_chunk_overlap: usize,
    /// Passages returned per retrieval source.
    pub retrieval_top_k: usize,
    /// Root directory under which per-job staging areas are created.
    pub staging_root: PathBuf,
    /// Upload size ceiling in bytes.
    pub max_upload_bytes: usize,
    /// Accepted upload extensions, lowercase and without the dot.
    pub allowed_extensions: Vec<String>,
    /// Command template for the conversion stage.
    pub conversion_command: String,
    /// Optional command template for the enrichment stage.
    pub enrichment_command: Option<String>,
    /// Number of pipeline workers consuming the job queue.
    pub pipeline_workers: usize,
    /// Maximum number of jobs waiting for a worker.
    pub pipeline_queue_capacity: usize,
    /// Shared secret the identity provider presents when opening sessions.
    pub session_issuer_secret: Option<String>,
    /// Idle period after which a session is ended and its collections removed.
    pub session_idle_timeout_secs: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local or hosted Ollama runtime.
    Ollama,
    /// Deterministic byte-hash vectors, useful offline and in tests.
    Hash,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ollama_url =
            load_env_optional("OLLAMA_URL").unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
        Ok(Self {
            qdrant_url: load_env("QDRANT_URL")?,
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            global_collection_name: load_env_optional("GLOBAL_COLLECTION_NAME")
                .unwrap_or_else(|| "static_json_knowledge".into()),
            knowledge_path: load_env_optional("KNOWLEDGE_PATH")
                .unwrap_or_else(|| "data.json".into())
                .into(),
            embedding_provider: load_env_optional("EMBEDDING_PROVIDER")
                .unwrap_or_else(|| "ollama".into())
                .parse()
                .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".into()))?,
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".into()),
            embedding_dimension: parse_or("EMBEDDING_DIMENSION", 768)?,
            llm_url: load_env_optional("LLM_URL").unwrap_or_else(|| ollama_url.clone()),
            ollama_url,
            llm_model: load_env_optional("LLM_MODEL").unwrap_or_else(|| "gpt-oss:120b".into()),
            llm_api_key: load_env_optional("LLM_API_KEY"),
            llm_temperature: parse_or("LLM_TEMPERATURE", 0.7)?,
            text_splitter_chunk_size: parse_optional("TEXT_SPLITTER_CHUNK_SIZE")?,
            text_splitter_chunk_overlap: parse_or("TEXT_SPLITTER_CHUNK_OVERLAP", 50)?,
            retrieval_top_k: parse_or("RETRIEVAL_TOP_K", 3)?,
            staging_root: load_env_optional("STAGING_ROOT")
                .unwrap_or_else(|| "staging".into())
                .into(),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", 1024 * 1024)?,
            allowed_extensions: load_env_optional("ALLOWED_EXTENSIONS")
                .map(|value| parse_extensions(&value))
                .unwrap_or_else(|| vec!["pdf".into()]),
            conversion_command: load_env_optional("CONVERSION_COMMAND")
                .unwrap_or_else(|| DEFAULT_CONVERSION_COMMAND.into()),
            enrichment_command: load_env_optional("ENRICHMENT_COMMAND"),
            pipeline_workers: parse_or("PIPELINE_WORKERS", 2)?,
            pipeline_queue_capacity: parse_or("PIPELINE_QUEUE_CAPACITY", 16)?,
            session_issuer_secret: load_env_optional("SESSION_ISSUER_SECRET"),
            session_idle_timeout_secs: parse_or("SESSION_IDLE_TIMEOUT_SECS", 3600)?,
            server_port: parse_optional("SERVER_PORT")?,
        })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    Ok(parse_optional(key)?.unwrap_or(default))
}

fn parse_extensions(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().trim_start_matches('.').to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "hash" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
///
/// Later calls return the configuration installed by the first one.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = Config::from_env()?;
    tracing::debug!(
        qdrant_url = %config.qdrant_url,
        global_collection = %config.global_collection_name,
        embedding_provider = ?config.embedding_provider,
        llm_model = %config.llm_model,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
