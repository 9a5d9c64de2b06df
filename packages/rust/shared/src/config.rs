//! Application configuration for Tramit.
//!
//! User config lives at `~/.tramit/tramit.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TramitError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tramit.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tramit";

/// Browser-like User-Agent sent with page fetches and searches.
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) tramit/0.1";

// ---------------------------------------------------------------------------
// Config structs (matching tramit.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Completion service settings.
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub embeddings: EmbeddingsConfig,

    #[serde(default)]
    pub crawl: CrawlConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    /// Seed search settings.
    #[serde(default)]
    pub search: SearchConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding one subdirectory per session. `~/` is expanded.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Session used when `--session` is not given.
    #[serde(default = "default_session")]
    pub session: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            session: default_session(),
        }
    }
}

impl DefaultsConfig {
    /// Resolve `data_dir`, expanding a leading `~/`.
    pub fn data_dir_path(&self) -> Result<PathBuf> {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| TramitError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.data_dir)),
        }
    }

    /// Directory for one named session. Names are restricted so they cannot
    /// escape `data_dir`.
    pub fn session_dir(&self, session: &str) -> Result<PathBuf> {
        let valid = !session.is_empty()
            && session
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && session != "."
            && session != "..";
        if !valid {
            return Err(TramitError::validation(format!(
                "invalid session name '{session}': use letters, digits, '-', '_' or '.'"
            )));
        }
        Ok(self.data_dir_path()?.join(session))
    }
}

fn default_data_dir() -> String {
    "~/.tramit/sessions".into()
}
fn default_session() -> String {
    "default".into()
}

/// `[llm]` section: any OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "TRAMIT_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_llm_timeout() -> u64 {
    60
}

/// Which embedder backs the vector index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic offline feature hashing.
    #[default]
    Hashing,
    /// The `/embeddings` endpoint of the `[llm]` service.
    Openai,
}

/// `[embeddings]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Remote embedding model (ignored by the hashing provider).
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Texts per remote embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_dimensions() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}

// ---------------------------------------------------------------------------
// Runtime configs (file section, CLI flags override individual fields)
// ---------------------------------------------------------------------------

/// `[crawl]` section and runtime crawl configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Pages at this depth or deeper are never fetched (seeds are depth 0).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Accepted children per page, in document order.
    #[serde(default = "default_max_links")]
    pub max_links_per_page: usize,

    /// Concurrent child fetches per node.
    #[serde(default = "default_fanout")]
    pub fanout_concurrency: usize,

    /// Simultaneous HTTP fetches across the whole crawl.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Delay before each fetch, in milliseconds. Zero disables it.
    #[serde(default)]
    pub rate_limit_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// CSS selectors for the main content containers. Empty means built-ins.
    #[serde(default)]
    pub content_selectors: Vec<String>,

    /// URL path extensions that are never fetched.
    #[serde(default = "default_skip_extensions")]
    pub skip_extensions: Vec<String>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_links_per_page: default_max_links(),
            fanout_concurrency: default_fanout(),
            max_in_flight: default_max_in_flight(),
            fetch_timeout_secs: default_fetch_timeout(),
            rate_limit_ms: 0,
            user_agent: default_user_agent(),
            content_selectors: Vec::new(),
            skip_extensions: default_skip_extensions(),
        }
    }
}

impl From<&AppConfig> for CrawlConfig {
    fn from(config: &AppConfig) -> Self {
        config.crawl.clone()
    }
}

fn default_max_depth() -> u32 {
    2
}
fn default_max_links() -> usize {
    3
}
fn default_fanout() -> usize {
    3
}
fn default_max_in_flight() -> usize {
    8
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.into()
}
fn default_skip_extensions() -> Vec<String> {
    [
        "pdf", "doc", "docx", "xls", "xlsx", "odt", "ods", "ppt", "pptx", "zip", "rar", "jpg",
        "jpeg", "png", "gif", "svg", "webp", "mp3", "mp4", "avi", "xml", "json", "csv",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[selector]` section and runtime selector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Characters of each candidate shown in the selection prompt.
    #[serde(default = "default_max_source_chars")]
    pub max_source_chars_length: usize,

    /// Candidates per selection batch.
    #[serde(default = "default_max_simultaneous")]
    pub max_simultaneous_sources: usize,

    #[serde(default = "default_true")]
    pub remove_parent_urls: bool,

    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,

    #[serde(default = "default_selector_temperature")]
    pub temperature: f32,

    #[serde(default = "default_selector_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_source_chars_length: default_max_source_chars(),
            max_simultaneous_sources: default_max_simultaneous(),
            remove_parent_urls: true,
            liveness_timeout_secs: default_liveness_timeout(),
            temperature: default_selector_temperature(),
            max_tokens: default_selector_max_tokens(),
            frequency_penalty: default_frequency_penalty(),
        }
    }
}

impl From<&AppConfig> for SelectorConfig {
    fn from(config: &AppConfig) -> Self {
        config.selector.clone()
    }
}

fn default_true() -> bool {
    true
}
fn default_max_source_chars() -> usize {
    500
}
fn default_max_simultaneous() -> usize {
    5
}
fn default_liveness_timeout() -> u64 {
    10
}
fn default_selector_temperature() -> f32 {
    0.1
}
fn default_selector_max_tokens() -> u32 {
    1000
}
fn default_frequency_penalty() -> f32 {
    0.2
}

/// `[store]` section and runtime document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Chunk window, in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks. Must be below `chunk_size`.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunks retrieved per question.
    #[serde(default = "default_k")]
    pub k: usize,

    /// Maximum squared L2 distance kept by searches. `None` keeps everything.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: Option<f32>,

    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,

    /// Phrases that mark a model answer as "not found" (case-insensitive).
    #[serde(default = "default_not_found_markers")]
    pub not_found_markers: Vec<String>,

    #[serde(default = "default_answer_temperature")]
    pub answer_temperature: f32,

    #[serde(default = "default_answer_max_tokens")]
    pub answer_max_tokens: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            k: default_k(),
            relevance_threshold: default_relevance_threshold(),
            preview_chars: default_preview_chars(),
            not_found_markers: default_not_found_markers(),
            answer_temperature: default_answer_temperature(),
            answer_max_tokens: default_answer_max_tokens(),
        }
    }
}

impl StoreConfig {
    /// Reject chunking parameters that could not make progress.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TramitError::validation("chunk_size must be greater than 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(TramitError::validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

impl From<&AppConfig> for StoreConfig {
    fn from(config: &AppConfig) -> Self {
        config.store.clone()
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_k() -> usize {
    3
}
fn default_relevance_threshold() -> Option<f32> {
    Some(1.5)
}
fn default_preview_chars() -> usize {
    200
}
fn default_not_found_markers() -> Vec<String> {
    vec!["NOT_FOUND".into(), "no he trobat".into()]
}
fn default_answer_temperature() -> f32 {
    0.2
}
fn default_answer_max_tokens() -> u32 {
    1000
}

/// `[planner]` section and runtime query planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Reformulated queries per question.
    #[serde(default = "default_query_count")]
    pub query_count: usize,

    /// Description of the searched site, inserted into the planner prompt.
    #[serde(default = "default_site_description")]
    pub site_description: String,

    #[serde(default = "default_planner_temperature")]
    pub temperature: f32,

    #[serde(default = "default_planner_max_tokens")]
    pub max_tokens: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            query_count: default_query_count(),
            site_description: default_site_description(),
            temperature: default_planner_temperature(),
            max_tokens: default_planner_max_tokens(),
        }
    }
}

impl From<&AppConfig> for PlannerConfig {
    fn from(config: &AppConfig) -> Self {
        config.planner.clone()
    }
}

fn default_query_count() -> usize {
    3
}
fn default_site_description() -> String {
    "the Generalitat de Catalunya procedures portal (gencat.cat)".into()
}
fn default_planner_temperature() -> f32 {
    0.3
}
fn default_planner_max_tokens() -> u32 {
    200
}

/// `[search]` section and runtime seed search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// HTML search endpoint queried with `?q=`.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Site restriction appended as `site:<site>`. `None` searches the whole web.
    #[serde(default = "default_search_site", skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,

    #[serde(default = "default_results_per_query")]
    pub results_per_query: usize,

    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            site: default_search_site(),
            results_per_query: default_results_per_query(),
            timeout_secs: default_search_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl From<&AppConfig> for SearchConfig {
    fn from(config: &AppConfig) -> Self {
        config.search.clone()
    }
}

fn default_search_endpoint() -> String {
    "https://html.duckduckgo.com/html/".into()
}
fn default_search_site() -> Option<String> {
    Some("gencat.cat/ca".into())
}
fn default_results_per_query() -> usize {
    2
}
fn default_search_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tramit/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| TramitError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tramit/tramit.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TramitError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TramitError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TramitError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| TramitError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TramitError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the completion service API key from the configured env var.
pub fn resolve_api_key(config: &LlmConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(TramitError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize default");
        assert!(toml_str.contains("TRAMIT_API_KEY"));
        assert!(toml_str.contains("max_links_per_page"));
        assert!(toml_str.contains("gencat.cat/ca"));
    }

    #[test]
    fn config_roundtrip() {
        let toml_str = toml::to_string_pretty(&AppConfig::default()).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.crawl.max_depth, 2);
        assert_eq!(parsed.store.chunk_size, 1000);
        assert_eq!(parsed.store.relevance_threshold, Some(1.5));
        assert_eq!(parsed.embeddings.provider, EmbeddingProvider::Hashing);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[crawl]
max_depth = 4

[embeddings]
provider = "openai"
dimensions = 1536

[search]
results_per_query = 5
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.crawl.max_depth, 4);
        assert_eq!(config.crawl.max_links_per_page, 3);
        assert_eq!(config.embeddings.provider, EmbeddingProvider::Openai);
        assert_eq!(config.search.results_per_query, 5);
        assert_eq!(config.search.site.as_deref(), Some("gencat.cat/ca"));
        assert_eq!(config.selector.max_simultaneous_sources, 5);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let crawl = CrawlConfig::from(&app);
        assert_eq!(crawl.fanout_concurrency, 3);
        assert_eq!(crawl.fetch_timeout_secs, 10);
        assert!(crawl.skip_extensions.iter().any(|e| e == "pdf"));

        let selector = SelectorConfig::from(&app);
        assert_eq!(selector.max_source_chars_length, 500);
        assert!(selector.remove_parent_urls);

        let store = StoreConfig::from(&app);
        assert_eq!(store.k, 3);
        assert_eq!(store.not_found_markers, vec!["NOT_FOUND", "no he trobat"]);

        assert_eq!(PlannerConfig::from(&app).query_count, 3);
    }

    #[test]
    fn store_config_validation() {
        assert!(StoreConfig::default().validate().is_ok());

        let bad = StoreConfig {
            chunk_overlap: 1000,
            ..StoreConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn session_dir_rejects_traversal() {
        let defaults = DefaultsConfig {
            data_dir: "/tmp/tramit".into(),
            session: "default".into(),
        };
        assert_eq!(
            defaults.session_dir("work-1").unwrap(),
            PathBuf::from("/tmp/tramit/work-1")
        );
        assert!(defaults.session_dir("..").is_err());
        assert!(defaults.session_dir("a/b").is_err());
        assert!(defaults.session_dir("").is_err());
    }

    #[test]
    fn api_key_resolution() {
        let config = LlmConfig {
            // Unique name so parallel tests cannot interfere
            api_key_env: "TRAMIT_TEST_NONEXISTENT_KEY_12345".into(),
            ..LlmConfig::default()
        };
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
