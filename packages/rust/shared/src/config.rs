//! Application configuration for PostForge.
//!
//! User config lives at `~/.postforge/postforge.toml`.
//! An [`AppConfig`] is immutable once loaded; switching the active target
//! produces a new value via [`AppConfig::with_active_target`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PostForgeError, Result};
use crate::types::TargetLocator;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "postforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".postforge";

/// Upper bound for any minute-based delay: one week.
const MAX_DELAY_MINUTES: i64 = 7 * 24 * 60;

// ---------------------------------------------------------------------------
// Config structs (matching postforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Name of the `[[targets]]` entry new drafts are published to.
    #[serde(default = "default_active_target")]
    pub active_target: String,

    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    #[serde(default)]
    pub images: ImagesConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Registered target stores.
    #[serde(default = "default_targets")]
    pub targets: Vec<TargetEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            active_target: default_active_target(),
            pipeline: PipelineSection::default(),
            scheduler: SchedulerSection::default(),
            search: SearchConfig::default(),
            openrouter: OpenRouterConfig::default(),
            images: ImagesConfig::default(),
            storage: StorageConfig::default(),
            targets: default_targets(),
        }
    }
}

fn default_active_target() -> String {
    "primary".into()
}
fn default_targets() -> Vec<TargetEntry> {
    vec![TargetEntry {
        name: default_active_target(),
        path: "~/.postforge/targets/primary.db".into(),
        mode: TargetWriteMode::Upsert,
    }]
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Unique links kept from search results.
    #[serde(default = "default_links_per_keyword")]
    pub links_per_keyword: usize,

    /// Documents the scraper tries to collect.
    #[serde(default = "default_scrape_target")]
    pub scrape_target: usize,

    /// Regeneration attempts when a plan comes back incomplete.
    #[serde(default = "default_plan_retries")]
    pub plan_retries: u32,

    /// Excerpts kept per plan heading.
    #[serde(default = "default_max_excerpts")]
    pub max_excerpts: usize,

    /// Upper bound on excerpt chunk length, in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay between launching consecutive keyword jobs.
    #[serde(default = "default_keyword_stagger_secs")]
    pub keyword_stagger_secs: u64,

    /// Spacing of `scheduled_at` between drafts of one batch.
    #[serde(default = "default_post_stagger_minutes")]
    pub post_stagger_minutes: i64,

    /// Deadline for any single external call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Concurrent image generation requests, process-wide.
    #[serde(default = "default_image_concurrency")]
    pub image_concurrency: usize,

    /// Collection drafts target when the batch does not name one.
    #[serde(default = "default_collection")]
    pub default_collection: String,

    /// Category name used when nothing else matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            links_per_keyword: default_links_per_keyword(),
            scrape_target: default_scrape_target(),
            plan_retries: default_plan_retries(),
            max_excerpts: default_max_excerpts(),
            chunk_size: default_chunk_size(),
            keyword_stagger_secs: default_keyword_stagger_secs(),
            post_stagger_minutes: default_post_stagger_minutes(),
            call_timeout_secs: default_call_timeout_secs(),
            image_concurrency: default_image_concurrency(),
            default_collection: default_collection(),
            default_category: None,
            author_id: None,
        }
    }
}

fn default_links_per_keyword() -> usize {
    10
}
fn default_scrape_target() -> usize {
    5
}
fn default_plan_retries() -> u32 {
    2
}
fn default_max_excerpts() -> usize {
    10
}
fn default_chunk_size() -> usize {
    1000
}
fn default_keyword_stagger_secs() -> u64 {
    2
}
fn default_post_stagger_minutes() -> i64 {
    5
}
fn default_call_timeout_secs() -> u64 {
    180
}
fn default_image_concurrency() -> usize {
    2
}
fn default_collection() -> String {
    "posts".into()
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Maximum drafts published per tick.
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,

    /// How far overflow drafts are pushed back.
    #[serde(default = "default_overflow_delay_minutes")]
    pub overflow_delay_minutes: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            batch_cap: default_batch_cap(),
            overflow_delay_minutes: default_overflow_delay_minutes(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    60
}
fn default_batch_cap() -> usize {
    5
}
fn default_overflow_delay_minutes() -> i64 {
    30
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// HTML search endpoint queried with `q` and `kl` parameters.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Minimum readable characters for a scraped page to count.
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            user_agent: default_user_agent(),
            min_text_len: default_min_text_len(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://html.duckduckgo.com/html/".into()
}
fn default_user_agent() -> String {
    format!("postforge/{}", env!("CARGO_PKG_VERSION"))
}
fn default_min_text_len() -> usize {
    100
}

/// `[openrouter]` section, used for plan and content generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// How generated images are made publicly reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageHostMode {
    /// Use the provider's URL as-is.
    #[default]
    Passthrough,
    /// Download into `local_dir` and serve under `public_base_url`.
    Local,
}

/// `[images]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    #[serde(default = "default_image_api_key_env")]
    pub api_key_env: String,

    /// Submission endpoint; the response carries a polling URL.
    #[serde(default = "default_image_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    #[serde(default = "default_image_width")]
    pub width: u32,

    #[serde(default = "default_image_height")]
    pub height: u32,

    #[serde(default)]
    pub host: ImageHostMode,

    #[serde(default = "default_local_dir")]
    pub local_dir: String,

    #[serde(default)]
    pub public_base_url: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_image_api_key_env(),
            endpoint: default_image_endpoint(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            width: default_image_width(),
            height: default_image_height(),
            host: ImageHostMode::default(),
            local_dir: default_local_dir(),
            public_base_url: String::new(),
        }
    }
}

fn default_image_api_key_env() -> String {
    "BFL_API_KEY".into()
}
fn default_image_endpoint() -> String {
    "https://api.bfl.ml/v1/flux-pro-1.1".into()
}
fn default_poll_interval_ms() -> u64 {
    3000
}
fn default_max_polls() -> u32 {
    30
}
fn default_image_width() -> u32 {
    1024
}
fn default_image_height() -> u32 {
    768
}
fn default_local_dir() -> String {
    "~/.postforge/images".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL file holding drafts and unprocessed keywords.
    #[serde(default = "default_source_db")]
    pub source_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            source_db: default_source_db(),
        }
    }
}

fn default_source_db() -> String {
    "~/.postforge/source.db".into()
}

/// How a target store reacts to a slug that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetWriteMode {
    /// Replace the existing document.
    #[default]
    Upsert,
    /// Reject with a duplicate-key error.
    InsertOnly,
}

/// `[[targets]]` entry: a named publish destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub name: String,
    /// Path to the target libSQL database.
    pub path: String,
    #[serde(default)]
    pub mode: TargetWriteMode,
}

impl AppConfig {
    /// Look up a registered target by name.
    pub fn target(&self, name: &str) -> Option<&TargetEntry> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Locator for drafts created under this config.
    pub fn active_locator(&self) -> TargetLocator {
        TargetLocator {
            store: self.active_target.clone(),
            collection: self.pipeline.default_collection.clone(),
        }
    }

    /// A copy of this config with a different active target.
    /// The receiver is left untouched, so in-flight work keeps its snapshot.
    pub fn with_active_target(&self, name: &str) -> Result<AppConfig> {
        if self.target(name).is_none() {
            return Err(PostForgeError::config(format!(
                "no target named {name:?} is registered"
            )));
        }
        let mut next = self.clone();
        next.active_target = name.to_string();
        Ok(next)
    }

    /// Reject configs that would fail at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.batch_cap == 0 {
            return Err(PostForgeError::validation("scheduler.batch_cap must be > 0"));
        }
        if self.pipeline.image_concurrency == 0 {
            return Err(PostForgeError::validation(
                "pipeline.image_concurrency must be > 0",
            ));
        }
        if self.pipeline.call_timeout_secs == 0 {
            return Err(PostForgeError::config("pipeline.call_timeout_secs must be > 0"));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(PostForgeError::config(
                "scheduler.tick_interval_secs must be > 0",
            ));
        }
        minutes(
            "pipeline.post_stagger_minutes",
            self.pipeline.post_stagger_minutes,
            0,
        )?;
        minutes(
            "scheduler.overflow_delay_minutes",
            self.scheduler.overflow_delay_minutes,
            1,
        )?;
        if self.target(&self.active_target).is_none() {
            return Err(PostForgeError::config(format!(
                "active_target {:?} is not in [[targets]]",
                self.active_target
            )));
        }
        if self.images.host == ImageHostMode::Local && self.images.public_base_url.is_empty() {
            return Err(PostForgeError::config(
                "images.public_base_url is required when images.host = \"local\"",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Runtime pipeline settings with durations resolved.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub links_per_keyword: usize,
    pub scrape_target: usize,
    pub plan_retries: u32,
    pub max_excerpts: usize,
    pub chunk_size: usize,
    pub keyword_stagger: Duration,
    pub post_stagger: chrono::Duration,
    pub call_timeout: Duration,
    pub default_category: Option<String>,
    pub author_id: Option<String>,
    pub target: TargetLocator,
}

impl TryFrom<&AppConfig> for PipelineConfig {
    type Error = PostForgeError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let p = &config.pipeline;
        Ok(Self {
            links_per_keyword: p.links_per_keyword,
            scrape_target: p.scrape_target,
            plan_retries: p.plan_retries,
            max_excerpts: p.max_excerpts,
            chunk_size: p.chunk_size,
            keyword_stagger: Duration::from_secs(p.keyword_stagger_secs),
            post_stagger: minutes("pipeline.post_stagger_minutes", p.post_stagger_minutes, 0)?,
            call_timeout: Duration::from_secs(p.call_timeout_secs),
            default_category: p.default_category.clone(),
            author_id: p.author_id.clone(),
            target: config.active_locator(),
        })
    }
}

/// Runtime publish scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub batch_cap: usize,
    pub overflow_delay: chrono::Duration,
}

impl TryFrom<&AppConfig> for SchedulerConfig {
    type Error = PostForgeError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let s = &config.scheduler;
        Ok(Self {
            tick_interval: Duration::from_secs(s.tick_interval_secs),
            batch_cap: s.batch_cap,
            overflow_delay: minutes(
                "scheduler.overflow_delay_minutes",
                s.overflow_delay_minutes,
                1,
            )?,
        })
    }
}

/// A minute count as a duration, bounded to `min..=MAX_DELAY_MINUTES`.
fn minutes(field: &str, value: i64, min: i64) -> Result<chrono::Duration> {
    if !(min..=MAX_DELAY_MINUTES).contains(&value) {
        return Err(PostForgeError::config(format!(
            "{field} must be between {min} and {MAX_DELAY_MINUTES}, got {value}"
        )));
    }
    chrono::Duration::try_minutes(value)
        .ok_or_else(|| PostForgeError::config(format!("{field} is out of range: {value}")))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.postforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| PostForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.postforge/postforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| PostForgeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
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
    let content = std::fs::read_to_string(path).map_err(|e| PostForgeError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PostForgeError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Serialize `config` to `path`, creating parent directories.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PostForgeError::io(parent, e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| PostForgeError::config(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| PostForgeError::io(path, e))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    save_config_to(&AppConfig::default(), &path)?;
    tracing::info!(?path, "created default config file");
    Ok(path)
}

/// Check that the provider API key env vars are set and non-empty.
pub fn validate_api_keys(config: &AppConfig) -> Result<()> {
    for (provider, var_name) in [
        ("OpenRouter", &config.openrouter.api_key_env),
        ("Image provider", &config.images.api_key_env),
    ] {
        match std::env::var(var_name) {
            Ok(val) if !val.is_empty() => {}
            _ => {
                return Err(PostForgeError::config(format!(
                    "{provider} API key not found. Set the {var_name} environment variable."
                )));
            }
        }
    }
    Ok(())
}
