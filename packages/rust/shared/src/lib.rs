//! Shared types, error model, and configuration for PostForge.
//!
//! This crate is the foundation depended on by all other PostForge crates.
//! It provides:
//! - [`PostForgeError`]: the unified error type
//! - Domain types ([`ContentDraft`], [`FailureRecord`], [`Stage`], [`BlogPlan`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], [`SchedulerConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ImageHostMode, ImagesConfig, OpenRouterConfig, PipelineConfig, PipelineSection,
    SchedulerConfig, SchedulerSection, SearchConfig, StorageConfig, TargetEntry, TargetWriteMode,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    save_config_to, validate_api_keys,
};
pub use error::{PostForgeError, Result};
pub use types::{
    BatchRequest, BlogPlan, Candidate, ContentDraft, DraftId, DraftStatus, FailureRecord,
    GeneratedContent, KeywordJob, ScrapedDocument, SectionExcerpts, Stage, TargetLocator,
    UNPROCESSED_STATUS, format_timestamp, parse_timestamp,
};
