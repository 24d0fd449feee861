//! Core domain types for the keyword-to-article pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PostForgeError, Result};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A pipeline stage, used to classify where a keyword job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    LinkExtraction,
    BlogPlan,
    Scraping,
    ImageGeneration,
    ContentGeneration,
    DatabaseSave,
    /// Catch-all for failures outside any single stage.
    PipelineException,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::LinkExtraction => "link_extraction",
            Self::BlogPlan => "blog_plan",
            Self::Scraping => "scraping",
            Self::ImageGeneration => "image_generation",
            Self::ContentGeneration => "content_generation",
            Self::DatabaseSave => "database_save",
            Self::PipelineException => "pipeline_exception",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = PostForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "search" => Ok(Self::Search),
            "link_extraction" => Ok(Self::LinkExtraction),
            "blog_plan" => Ok(Self::BlogPlan),
            "scraping" => Ok(Self::Scraping),
            "image_generation" => Ok(Self::ImageGeneration),
            "content_generation" => Ok(Self::ContentGeneration),
            "database_save" => Ok(Self::DatabaseSave),
            "pipeline_exception" => Ok(Self::PipelineException),
            other => Err(PostForgeError::parse(format!("unknown stage: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Drafts
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for draft identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftId(pub Uuid);

impl DraftId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DraftId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DraftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DraftId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a draft. Only ever moves pending -> published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Published,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
        }
    }
}

impl std::str::FromStr for DraftStatus {
    type Err = PostForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            other => Err(PostForgeError::parse(format!("unknown draft status: {other}"))),
        }
    }
}

/// Where a draft should be published: a named target store plus a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLocator {
    pub store: String,
    pub collection: String,
}

/// A fully generated article waiting for (or done with) publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDraft {
    pub id: DraftId,
    /// The focus keyword the draft was generated for.
    pub keyword: String,
    pub title: String,
    /// HTML body, image tags first.
    pub body: String,
    pub slug: String,
    pub category_ids: Vec<String>,
    pub tag_ids: Vec<String>,
    pub image_urls: Vec<String>,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub target: TargetLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub word_count: u32,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
}

// ---------------------------------------------------------------------------
// Jobs and failures
// ---------------------------------------------------------------------------

/// One keyword to push through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordJob {
    pub text: String,
    pub language: String,
    pub country: String,
    #[serde(default)]
    pub requester: Option<String>,
}

/// What a caller submits: a set of keywords sharing locale and requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub keywords: Vec<String>,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub requester: Option<String>,
    /// Overrides the configured active target for this batch.
    #[serde(default)]
    pub target: Option<TargetLocator>,
}

fn default_country() -> String {
    "us".into()
}
fn default_language() -> String {
    "en".into()
}

impl BatchRequest {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            keywords,
            country: default_country(),
            language: default_language(),
            requester: None,
            target: None,
        }
    }

    /// Trimmed, non-empty keywords with case-insensitive duplicates removed.
    pub fn jobs(&self) -> Vec<KeywordJob> {
        let mut seen = std::collections::HashSet::new();
        self.keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .filter(|k| seen.insert(k.to_lowercase()))
            .map(|k| KeywordJob {
                text: k.to_string(),
                language: self.language.clone(),
                country: self.country.clone(),
                requester: self.requester.clone(),
            })
            .collect()
    }
}

/// Status value for keywords left for manual review.
pub const UNPROCESSED_STATUS: &str = "unprocessed";

/// A keyword that could not be turned into a draft, even after retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub keyword: String,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

impl FailureRecord {
    pub fn new(keyword: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            keyword: keyword.into(),
            stage,
            message: message.into(),
            context: None,
            created_at: Utc::now(),
            status: UNPROCESSED_STATUS.into(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

// ---------------------------------------------------------------------------
// Stage payloads
// ---------------------------------------------------------------------------

/// A category or tag that generated content can be labelled with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Outline returned by the plan generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogPlan {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub headings: Vec<String>,
    #[serde(default)]
    pub image_prompts: Vec<String>,
}

/// A source page reduced to its readable text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedDocument {
    pub title: String,
    pub url: String,
    pub text: String,
}

/// Source snippets selected for one plan heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionExcerpts {
    pub heading: String,
    pub excerpts: Vec<String>,
}

/// Article markup returned by the text generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub markup: String,
    #[serde(default)]
    pub word_count: u32,
    /// Category name the generator picked, if any.
    #[serde(default)]
    pub selected_category: Option<String>,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 form, so stored strings sort in time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PostForgeError::parse(format!("invalid timestamp {s:?}: {e}")))
}
