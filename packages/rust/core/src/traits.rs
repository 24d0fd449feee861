//! Collaborator contracts the pipeline drives.
//!
//! Each external system (search, scraping, text and image generation, the
//! target taxonomy) sits behind a trait so the orchestrator can be run
//! against HTTP adapters in production and counting mocks in tests.

use std::sync::Arc;

use async_trait::async_trait;
use postforge_matcher::LabelMatcher;
use postforge_shared::{
    BlogPlan, Candidate, GeneratedContent, Result, ScrapedDocument, SectionExcerpts,
};
use postforge_storage::TargetStore;

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Result URLs for `keyword`, best first.
    async fn search(&self, keyword: &str, country: &str, language: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait PageScraper: Send + Sync {
    /// Fetch pages from `urls` until `target_count` readable documents are
    /// collected or the list runs out.
    async fn scrape(&self, urls: &[String], target_count: usize) -> Result<Vec<ScrapedDocument>>;
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(&self, keyword: &str, language: &str) -> Result<BlogPlan>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// A hosted image URL, or `None` when the provider produced nothing.
    async fn generate_image(&self, prompt: &str) -> Result<Option<String>>;
}

/// Everything the text generator needs to write one article.
#[derive(Debug, Clone)]
pub struct ContentRequest {
    pub keyword: String,
    pub language: String,
    pub plan: BlogPlan,
    pub excerpts: Vec<SectionExcerpts>,
    /// Category names the generator may pick from.
    pub categories: Vec<Candidate>,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_content(&self, request: &ContentRequest) -> Result<GeneratedContent>;
}

#[async_trait]
pub trait TaxonomySource: Send + Sync {
    async fn list_categories(&self) -> Result<Vec<Candidate>>;
    async fn list_tags(&self) -> Result<Vec<Candidate>>;
}

#[async_trait]
impl TaxonomySource for TargetStore {
    async fn list_categories(&self) -> Result<Vec<Candidate>> {
        TargetStore::list_categories(self).await
    }

    async fn list_tags(&self) -> Result<Vec<Candidate>> {
        TargetStore::list_tags(self).await
    }
}

/// The full set of collaborators one pipeline runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn SearchProvider>,
    pub scraper: Arc<dyn PageScraper>,
    pub planner: Arc<dyn PlanGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub writer: Arc<dyn ContentGenerator>,
    pub taxonomy: Arc<dyn TaxonomySource>,
    pub matcher: Arc<dyn LabelMatcher>,
}
