//! Per-keyword pipeline orchestration.
//!
//! One keyword moves through a fixed stage order:
//!
//! ```text
//! SEARCH -> {PLAN || SCRAPE} -> IMAGE_1 -> {IMAGE_2 || GENERATE} -> CATEGORIZE -> PERSIST
//! ```
//!
//! Every stage writes its output into the keyword's [`StageCache`] as soon as
//! it succeeds. A failure is reported as a [`StageFailure`] naming the stage,
//! which is what the retry coordinator dispatches on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use postforge_shared::{
    BlogPlan, ContentDraft, FailureRecord, GeneratedContent, KeywordJob, PipelineConfig,
    PostForgeError, Result, ScrapedDocument, Stage, TargetLocator,
};
use postforge_storage::Storage;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::StageCache;
use crate::categorize::{Taxonomy, categorize};
use crate::draft::{DraftContext, build_draft};
use crate::excerpts::select_excerpts;
use crate::links::unique_links;
use crate::traits::{Collaborators, ContentRequest, PageScraper};

/// Images every draft must carry.
pub const REQUIRED_IMAGES: usize = 2;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoResults,
    InvalidOutput,
    /// A retry path needed an earlier stage's output that was never cached.
    MissingPrerequisite,
    Timeout,
    Provider,
    QuotaExhausted,
    Storage,
    DuplicateSlug,
    /// The task running the stage panicked or was cancelled.
    Aborted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoResults => "no_results",
            Self::InvalidOutput => "invalid_output",
            Self::MissingPrerequisite => "missing_prerequisite",
            Self::Timeout => "timeout",
            Self::Provider => "provider",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Storage => "storage",
            Self::DuplicateSlug => "duplicate_slug",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage that failed after its local retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage} failed ({kind}): {message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Classify a collaborator error as a failure of `stage`.
    pub fn from_error(stage: Stage, err: &PostForgeError) -> Self {
        let kind = match err {
            PostForgeError::QuotaExhausted { .. } => FailureKind::QuotaExhausted,
            PostForgeError::Timeout { .. } => FailureKind::Timeout,
            PostForgeError::DuplicateKey { .. } => FailureKind::DuplicateSlug,
            PostForgeError::Storage(_) | PostForgeError::Io { .. } => FailureKind::Storage,
            PostForgeError::Parse { .. } | PostForgeError::Validation { .. } => {
                FailureKind::InvalidOutput
            }
            _ => FailureKind::Provider,
        };
        Self::new(stage, kind, err.to_string())
    }

    pub(crate) fn missing(stage: Stage, what: &str) -> Self {
        Self::new(
            stage,
            FailureKind::MissingPrerequisite,
            format!("no cached {what} to resume from"),
        )
    }

    pub fn is_quota(&self) -> bool {
        self.kind == FailureKind::QuotaExhausted
    }

    /// The durable record for a keyword that ended with this failure.
    pub fn to_record(
        &self,
        ctx: &KeywordContext,
        first: Option<&StageFailure>,
        cache: &StageCache,
    ) -> FailureRecord {
        let completed: Vec<&str> = cache.completed().iter().map(Stage::as_str).collect();
        FailureRecord::new(&ctx.job.text, self.stage, &self.message).with_context(
            serde_json::json!({
                "kind": self.kind,
                "first_stage": first.unwrap_or(self).stage,
                "first_error": first.map(|f| f.message.as_str()),
                "completed_stages": completed,
                "batch_id": ctx.batch_id.to_string(),
                "country": ctx.job.country,
                "language": ctx.job.language,
                "requester": ctx.job.requester,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Keyword context and results
// ---------------------------------------------------------------------------

/// What a keyword run needs from its batch.
#[derive(Debug, Clone)]
pub struct KeywordContext {
    pub job: KeywordJob,
    /// Position within the batch. Spaces out publish schedules.
    pub post_index: usize,
    pub batch_id: Uuid,
    pub target: TargetLocator,
    pub taxonomy: Arc<Taxonomy>,
}

/// Outcome of one keyword run, with everything its stages produced.
#[derive(Debug)]
pub struct KeywordRun {
    pub ctx: KeywordContext,
    pub cache: StageCache,
    pub outcome: std::result::Result<ContentDraft, StageFailure>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives single keywords through the stage graph.
#[derive(Clone)]
pub struct Orchestrator {
    collab: Collaborators,
    config: Arc<PipelineConfig>,
    storage: Arc<Storage>,
}

impl Orchestrator {
    pub fn new(collab: Collaborators, config: Arc<PipelineConfig>, storage: Arc<Storage>) -> Self {
        Self {
            collab,
            config,
            storage,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Run every stage for one keyword.
    #[instrument(skip_all, fields(keyword = %ctx.job.text, index = ctx.post_index))]
    pub async fn run_keyword(&self, ctx: KeywordContext) -> KeywordRun {
        let mut cache = StageCache::default();
        let outcome = self.drive(&ctx, &mut cache).await;

        match &outcome {
            Ok(draft) => info!(slug = %draft.slug, scheduled_at = %draft.scheduled_at, "draft created"),
            Err(failure) => warn!(
                stage = %failure.stage,
                kind = %failure.kind,
                error = %failure.message,
                "keyword failed"
            ),
        }

        KeywordRun {
            ctx,
            cache,
            outcome,
        }
    }

    async fn drive(
        &self,
        ctx: &KeywordContext,
        cache: &mut StageCache,
    ) -> std::result::Result<ContentDraft, StageFailure> {
        // --- Search ---
        let links = self.search_links(&ctx.job).await?;
        cache.links = Some(links.clone());

        // --- Plan || Scrape ---
        let scrape = tokio::spawn(scrape_corpus(
            Arc::clone(&self.collab.scraper),
            links,
            self.config.scrape_target,
            self.config.call_timeout,
        ));

        let plan = match self.plan(&ctx.job).await {
            Ok(plan) => plan,
            Err(failure) => {
                // keep the scrape for a plan retry
                if let Ok(corpus) = join_scrape(scrape).await {
                    cache.corpus = Some(corpus);
                }
                return Err(failure);
            }
        };
        cache.plan = Some(plan.clone());

        // --- Image 1, overlapping the rest of the scrape ---
        let first_prompt = plan.image_prompts.first().cloned().unwrap_or_default();
        let (first_image, corpus) = tokio::join!(self.image(&first_prompt), join_scrape(scrape));

        let mut image_failure = None;
        match first_image {
            Ok(url) => cache.images.push(url),
            Err(failure) => image_failure = Some(failure),
        }
        if let Ok(docs) = &corpus {
            cache.corpus = Some(docs.clone());
        }
        if let Some(quota) = image_failure.as_ref().filter(|f| f.is_quota()) {
            return Err(quota.clone());
        }
        let corpus = corpus?;

        // --- Image 2 || Generate ---
        let request = self.content_request(ctx, &plan, &corpus);
        let second_prompt = plan.image_prompts.get(1).cloned().unwrap_or_default();
        let (second_image, content) =
            tokio::join!(self.image(&second_prompt), self.generate(&request));

        if let Ok(content) = &content {
            cache.content = Some(content.clone());
        }
        match second_image {
            Ok(url) => cache.images.push(url),
            Err(failure) => {
                if failure.is_quota() || image_failure.is_none() {
                    image_failure = Some(failure);
                }
            }
        }

        if let Some(quota) = content.as_ref().err().filter(|f| f.is_quota()) {
            return Err(quota.clone());
        }
        if cache.images.len() < REQUIRED_IMAGES {
            return Err(image_failure.unwrap_or_else(|| {
                StageFailure::new(
                    Stage::ImageGeneration,
                    FailureKind::InvalidOutput,
                    format!("{} of {REQUIRED_IMAGES} images generated", cache.images.len()),
                )
            }));
        }
        content?;

        // --- Categorize + Persist ---
        self.finish(ctx, cache).await
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Search with one immediate retry, then reduce to unique links.
    pub(crate) async fn search_links(
        &self,
        job: &KeywordJob,
    ) -> std::result::Result<Vec<String>, StageFailure> {
        let mut results = Vec::new();
        let mut last_error = None;

        for attempt in 1..=2u32 {
            let call = self
                .collab
                .search
                .search(&job.text, &job.country, &job.language);
            match with_timeout(self.config.call_timeout, "search", call).await {
                Ok(found) if !found.is_empty() => {
                    results = found;
                    break;
                }
                Ok(_) => {
                    debug!(attempt, "search returned no results");
                    last_error = None;
                }
                Err(e) if e.is_quota() => return Err(StageFailure::from_error(Stage::Search, &e)),
                Err(e) => {
                    warn!(attempt, error = %e, "search failed");
                    last_error = Some(e);
                }
            }
        }

        if results.is_empty() {
            return Err(match last_error {
                Some(e) => StageFailure::from_error(Stage::Search, &e),
                None => StageFailure::new(
                    Stage::Search,
                    FailureKind::NoResults,
                    "search returned no results",
                ),
            });
        }

        let links = unique_links(&results, self.config.links_per_keyword);
        if links.is_empty() {
            return Err(StageFailure::new(
                Stage::LinkExtraction,
                FailureKind::NoResults,
                format!("none of {} search results were usable links", results.len()),
            ));
        }
        debug!(results = results.len(), links = links.len(), "links extracted");
        Ok(links)
    }

    /// Generate an outline, regenerating while it comes back incomplete.
    pub(crate) async fn plan(&self, job: &KeywordJob) -> std::result::Result<BlogPlan, StageFailure> {
        let attempts = 1 + self.config.plan_retries;
        let mut last = StageFailure::new(
            Stage::BlogPlan,
            FailureKind::InvalidOutput,
            "no plan generated",
        );

        for attempt in 1..=attempts {
            let call = self.collab.planner.generate_plan(&job.text, &job.language);
            match with_timeout(self.config.call_timeout, "plan generation", call).await {
                Ok(plan) => {
                    let plan = tidy_plan(plan);
                    match validate_plan(&plan) {
                        Ok(()) => return Ok(plan),
                        Err(reason) => {
                            warn!(attempt, reason = %reason, "plan incomplete");
                            last = StageFailure::new(
                                Stage::BlogPlan,
                                FailureKind::InvalidOutput,
                                reason,
                            );
                        }
                    }
                }
                Err(e) if e.is_quota() => return Err(StageFailure::from_error(Stage::BlogPlan, &e)),
                Err(e) => {
                    warn!(attempt, error = %e, "plan generation failed");
                    last = StageFailure::from_error(Stage::BlogPlan, &e);
                }
            }
        }
        Err(last)
    }

    /// Scrape the cached link list.
    pub(crate) async fn scrape(
        &self,
        links: &[String],
    ) -> std::result::Result<Vec<ScrapedDocument>, StageFailure> {
        scrape_corpus(
            Arc::clone(&self.collab.scraper),
            links.to_vec(),
            self.config.scrape_target,
            self.config.call_timeout,
        )
        .await
    }

    /// One image, with a single local retry unless the provider is out of quota.
    pub(crate) async fn image(&self, prompt: &str) -> std::result::Result<String, StageFailure> {
        let mut last = StageFailure::new(
            Stage::ImageGeneration,
            FailureKind::InvalidOutput,
            "empty image prompt",
        );
        if prompt.trim().is_empty() {
            return Err(last);
        }

        for attempt in 1..=2u32 {
            let call = self.collab.images.generate_image(prompt);
            match with_timeout(self.config.call_timeout, "image generation", call).await {
                Ok(Some(url)) => return Ok(url),
                Ok(None) => {
                    last = StageFailure::new(
                        Stage::ImageGeneration,
                        FailureKind::InvalidOutput,
                        "provider returned no image",
                    );
                }
                Err(e) if e.is_quota() => {
                    return Err(StageFailure::from_error(Stage::ImageGeneration, &e));
                }
                Err(e) => last = StageFailure::from_error(Stage::ImageGeneration, &e),
            }
            debug!(attempt, error = %last.message, "image attempt failed");
        }
        Err(last)
    }

    /// Article text, with a single local retry unless the provider is out of quota.
    pub(crate) async fn generate(
        &self,
        request: &ContentRequest,
    ) -> std::result::Result<GeneratedContent, StageFailure> {
        let mut last = StageFailure::new(
            Stage::ContentGeneration,
            FailureKind::InvalidOutput,
            "no content generated",
        );

        for attempt in 1..=2u32 {
            let call = self.collab.writer.generate_content(request);
            match with_timeout(self.config.call_timeout, "content generation", call).await {
                Ok(content) if !content.markup.trim().is_empty() => return Ok(content),
                Ok(_) => {
                    last = StageFailure::new(
                        Stage::ContentGeneration,
                        FailureKind::InvalidOutput,
                        "generator returned empty markup",
                    );
                }
                Err(e) if e.is_quota() => {
                    return Err(StageFailure::from_error(Stage::ContentGeneration, &e));
                }
                Err(e) => last = StageFailure::from_error(Stage::ContentGeneration, &e),
            }
            debug!(attempt, error = %last.message, "content attempt failed");
        }
        Err(last)
    }

    pub(crate) fn content_request(
        &self,
        ctx: &KeywordContext,
        plan: &BlogPlan,
        corpus: &[ScrapedDocument],
    ) -> ContentRequest {
        ContentRequest {
            keyword: ctx.job.text.clone(),
            language: ctx.job.language.clone(),
            plan: plan.clone(),
            excerpts: select_excerpts(
                &ctx.job.text,
                plan,
                corpus,
                self.config.max_excerpts,
                self.config.chunk_size,
            ),
            categories: ctx.taxonomy.categories.clone(),
        }
    }

    /// Fill in any missing images and content from the cache, then persist.
    /// Used to finish a keyword after a targeted retry.
    pub(crate) async fn complete(
        &self,
        ctx: &KeywordContext,
        cache: &mut StageCache,
    ) -> std::result::Result<ContentDraft, StageFailure> {
        let plan = cache
            .plan
            .clone()
            .ok_or_else(|| StageFailure::missing(Stage::BlogPlan, "plan"))?;

        while cache.images.len() < REQUIRED_IMAGES {
            let prompt = plan
                .image_prompts
                .get(cache.images.len())
                .ok_or_else(|| StageFailure::missing(Stage::ImageGeneration, "image prompt"))?;
            let url = self.image(prompt).await?;
            cache.images.push(url);
        }

        if cache.content.is_none() {
            let corpus = cache
                .corpus
                .as_ref()
                .ok_or_else(|| StageFailure::missing(Stage::Scraping, "scraped corpus"))?;
            let request = self.content_request(ctx, &plan, corpus);
            cache.content = Some(self.generate(&request).await?);
        }

        self.finish(ctx, cache).await
    }

    /// Categorize and persist a keyword whose plan, images and content are cached.
    pub(crate) async fn finish(
        &self,
        ctx: &KeywordContext,
        cache: &StageCache,
    ) -> std::result::Result<ContentDraft, StageFailure> {
        let (Some(plan), Some(content)) = (&cache.plan, &cache.content) else {
            return Err(StageFailure::missing(Stage::DatabaseSave, "plan or content"));
        };

        let labels = categorize(
            &ctx.job.text,
            content,
            &ctx.taxonomy,
            self.collab.matcher.as_ref(),
            self.config.default_category.as_deref(),
        );
        debug!(source = ?labels.source, categories = labels.category_ids.len(), "labels assigned");

        let draft_ctx = DraftContext {
            job: &ctx.job,
            target: &ctx.target,
            post_index: ctx.post_index,
            now: Utc::now().trunc_subsecs(6),
        };
        let draft = build_draft(
            &draft_ctx,
            &self.config,
            plan,
            content,
            &cache.images,
            labels,
        );

        self.storage
            .insert_draft(&draft)
            .await
            .map_err(|e| StageFailure::from_error(Stage::DatabaseSave, &e))?;
        Ok(draft)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `fut` under `limit`, turning an elapsed deadline into a timeout error.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PostForgeError::timeout(operation, limit.as_secs())),
    }
}

/// Scrape the link list. A provider error or timeout gets one local retry
/// unless it is quota exhaustion; an empty corpus fails straight away.
async fn scrape_corpus(
    scraper: Arc<dyn PageScraper>,
    links: Vec<String>,
    target: usize,
    limit: Duration,
) -> std::result::Result<Vec<ScrapedDocument>, StageFailure> {
    let mut last = StageFailure::new(Stage::Scraping, FailureKind::Provider, "scrape failed");
    for attempt in 1..=2u32 {
        match with_timeout(limit, "scrape", scraper.scrape(&links, target)).await {
            Ok(docs) if !docs.is_empty() => {
                debug!(documents = docs.len(), links = links.len(), "scrape complete");
                return Ok(docs);
            }
            Ok(_) => {
                return Err(StageFailure::new(
                    Stage::Scraping,
                    FailureKind::NoResults,
                    format!("no readable content from {} links", links.len()),
                ));
            }
            Err(e) if e.is_quota() => return Err(StageFailure::from_error(Stage::Scraping, &e)),
            Err(e) => {
                warn!(attempt, error = %e, "scrape failed");
                last = StageFailure::from_error(Stage::Scraping, &e);
            }
        }
    }
    Err(last)
}

async fn join_scrape(
    handle: JoinHandle<std::result::Result<Vec<ScrapedDocument>, StageFailure>>,
) -> std::result::Result<Vec<ScrapedDocument>, StageFailure> {
    handle.await.unwrap_or_else(|e| {
        Err(StageFailure::new(
            Stage::Scraping,
            FailureKind::Aborted,
            format!("scrape task failed: {e}"),
        ))
    })
}

/// Trim entries and drop blanks.
fn tidy_plan(plan: BlogPlan) -> BlogPlan {
    let clean = |items: Vec<String>| -> Vec<String> {
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };
    BlogPlan {
        title: plan.title.trim().to_string(),
        headings: clean(plan.headings),
        image_prompts: clean(plan.image_prompts),
    }
}

fn validate_plan(plan: &BlogPlan) -> std::result::Result<(), String> {
    if plan.headings.is_empty() {
        return Err("plan has no headings".into());
    }
    if plan.image_prompts.len() < REQUIRED_IMAGES {
        return Err(format!(
            "plan has {} image prompts, need {REQUIRED_IMAGES}",
            plan.image_prompts.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Mocks, keyword_context, test_orchestrator};
    use postforge_shared::DraftStatus;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn scenario_explicit_category() {
        let mocks = Mocks::scenario();
        let orch = test_orchestrator(&mocks).await;
        let ctx = keyword_context("acme corp", 0, &mocks);

        let run = orch.run_keyword(ctx).await;
        let draft = run.outcome.expect("draft created");

        assert_eq!(draft.status, DraftStatus::Pending);
        assert_eq!(draft.category_ids, vec!["cat-business".to_string()]);
        assert_eq!(draft.image_urls.len(), 2);
        assert_eq!(draft.slug, "acme-corp-explained");
        assert_eq!(mocks.matcher.calls(), 0);
        // 3 urls in, 2 readable documents out
        assert_eq!(run.cache.corpus.map(|c| c.len()), Some(2));

        let stored = orch
            .storage()
            .find_draft_by_slug("acme-corp-explained")
            .await
            .expect("query")
            .expect("persisted");
        assert_eq!(stored.id, draft.id);
    }

    #[tokio::test]
    async fn scenario_matched_category_is_deterministic() {
        let mut categories = Vec::new();
        for _ in 0..2 {
            let mocks = Mocks::scenario();
            mocks.writer.set_selected_category(None);
            let orch = test_orchestrator(&mocks).await;
            let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
            let draft = run.outcome.expect("draft created");
            assert!(mocks.matcher.calls() > 0);
            categories.push(draft.category_ids);
        }
        assert_eq!(categories[0], categories[1]);
        assert_eq!(categories[0][0], "cat-business");
    }

    #[tokio::test]
    async fn empty_search_is_retried_once() {
        let mocks = Mocks::scenario();
        mocks.search.empty_times.store(1, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        assert!(run.outcome.is_ok());
        assert_eq!(mocks.search.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn search_failure_creates_no_draft() {
        let mocks = Mocks::scenario();
        mocks.search.empty_times.store(5, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        let failure = run.outcome.expect_err("search must fail");
        assert_eq!(failure.stage, Stage::Search);
        assert_eq!(failure.kind, FailureKind::NoResults);
        assert_eq!(mocks.search.calls.load(Ordering::SeqCst), 2);
        assert_eq!(mocks.planner.calls.load(Ordering::SeqCst), 0);
        assert!(orch.storage().list_drafts(None, 10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn unusable_links_fail_link_extraction() {
        let mocks = Mocks::scenario();
        mocks.search.set_urls(vec!["https://www.youtube.com/watch?v=1".into()]);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        assert_eq!(run.outcome.expect_err("fails").stage, Stage::LinkExtraction);
    }

    #[tokio::test]
    async fn incomplete_plan_is_regenerated() {
        let mocks = Mocks::scenario();
        mocks.planner.invalid_times.store(2, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        assert!(run.outcome.is_ok());
        assert_eq!(mocks.planner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn plan_failure_still_caches_scrape() {
        let mocks = Mocks::scenario();
        mocks.planner.invalid_times.store(10, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        let failure = run.outcome.expect_err("plan fails");
        assert_eq!(failure.stage, Stage::BlogPlan);
        assert_eq!(failure.kind, FailureKind::InvalidOutput);
        assert_eq!(mocks.planner.calls.load(Ordering::SeqCst), 3);
        assert!(run.cache.corpus.is_some());
        assert!(run.cache.plan.is_none());
    }

    #[tokio::test]
    async fn empty_scrape_fails_scraping() {
        let mocks = Mocks::scenario();
        mocks.scraper.fail_times.store(1, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        assert_eq!(run.outcome.expect_err("fails").stage, Stage::Scraping);
        assert!(run.cache.plan.is_some());
        assert_eq!(run.cache.images.len(), 1);
        assert_eq!(mocks.writer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scrape_error_is_retried_locally() {
        let mocks = Mocks::scenario();
        mocks.scraper.error_times.store(1, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        assert!(run.outcome.is_ok());
        assert_eq!(mocks.scraper.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn repeated_scrape_error_fails_scraping() {
        let mocks = Mocks::scenario();
        mocks.scraper.error_times.store(2, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        let failure = run.outcome.expect_err("fails");
        assert_eq!(failure.stage, Stage::Scraping);
        assert_eq!(failure.kind, FailureKind::Provider);
        assert_eq!(mocks.scraper.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_image_fails_but_caches_content() {
        let mocks = Mocks::scenario();
        // first image fails twice (call + local retry), second succeeds
        mocks.images.fail_times.store(2, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        let failure = run.outcome.expect_err("image stage fails");
        assert_eq!(failure.stage, Stage::ImageGeneration);
        assert_eq!(run.cache.images.len(), 1);
        assert!(run.cache.content.is_some());
    }

    #[tokio::test]
    async fn transient_image_error_is_retried_locally() {
        let mocks = Mocks::scenario();
        mocks.images.fail_times.store(1, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        assert!(run.outcome.is_ok());
        assert_eq!(mocks.images.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn image_quota_is_not_retried() {
        let mocks = Mocks::scenario();
        mocks.images.quota.store(true, Ordering::SeqCst);
        let orch = test_orchestrator(&mocks).await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        let failure = run.outcome.expect_err("quota");
        assert!(failure.is_quota());
        assert_eq!(failure.stage, Stage::ImageGeneration);
        assert_eq!(mocks.images.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_slug_fails_database_save() {
        let mocks = Mocks::scenario();
        let orch = test_orchestrator(&mocks).await;

        orch.run_keyword(keyword_context("acme corp", 0, &mocks))
            .await
            .outcome
            .expect("first run");
        let failure = orch
            .run_keyword(keyword_context("acme corp", 1, &mocks))
            .await
            .outcome
            .expect_err("slug collision");
        assert_eq!(failure.stage, Stage::DatabaseSave);
        assert_eq!(failure.kind, FailureKind::DuplicateSlug);
    }

    #[tokio::test]
    async fn slow_collaborator_times_out() {
        let mocks = Mocks::scenario();
        mocks.writer.delay_ms.store(500, Ordering::SeqCst);
        let orch = crate::testing::test_orchestrator_with(&mocks, |c| {
            c.call_timeout = Duration::from_millis(50);
        })
        .await;

        let run = orch.run_keyword(keyword_context("acme corp", 0, &mocks)).await;
        let failure = run.outcome.expect_err("timeout");
        assert_eq!(failure.stage, Stage::ContentGeneration);
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[test]
    fn failure_record_carries_context() {
        let mocks = Mocks::scenario();
        let ctx = keyword_context("acme corp", 0, &mocks);
        let cache = StageCache {
            links: Some(vec![]),
            ..StageCache::default()
        };
        let first = StageFailure::new(Stage::ContentGeneration, FailureKind::Provider, "boom");
        let last = StageFailure::new(Stage::ContentGeneration, FailureKind::Timeout, "slow");

        let record = last.to_record(&ctx, Some(&first), &cache);
        assert_eq!(record.stage, Stage::ContentGeneration);
        assert_eq!(record.status, "unprocessed");
        let context = record.context.expect("context");
        assert_eq!(context["first_stage"], "content_generation");
        assert_eq!(context["kind"], "timeout");
        assert_eq!(context["completed_stages"][0], "search");
    }

    #[test]
    fn plan_validation() {
        let plan = tidy_plan(BlogPlan {
            title: " T ".into(),
            headings: vec!["  ".into(), "Intro".into()],
            image_prompts: vec!["a".into(), " ".into()],
        });
        assert_eq!(plan.title, "T");
        assert_eq!(plan.headings, vec!["Intro".to_string()]);
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn error_classification() {
        let f = StageFailure::from_error(
            Stage::DatabaseSave,
            &PostForgeError::DuplicateKey { slug: "x".into() },
        );
        assert_eq!(f.kind, FailureKind::DuplicateSlug);
        let f = StageFailure::from_error(Stage::Search, &PostForgeError::Network("down".into()));
        assert_eq!(f.kind, FailureKind::Provider);
    }
}
