//! Targeted retries for keywords that failed during a batch.
//!
//! Only the stage that failed is re-run. Everything the keyword's cache
//! already holds is reused, missing downstream outputs are filled in, and
//! the keyword is categorized and persisted as if the first run had worked.

use std::collections::HashSet;

use postforge_shared::{ContentDraft, FailureRecord, Stage};
use postforge_storage::Storage;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::StageCache;
use crate::pipeline::{KeywordContext, KeywordRun, Orchestrator, StageFailure};

/// Drafts recovered by retries, and keywords that stayed failed.
#[derive(Debug, Default)]
pub struct RetryOutcome {
    pub recovered: Vec<ContentDraft>,
    pub unprocessed: Vec<FailureRecord>,
    /// A retry hit quota exhaustion and the rest of the phase was skipped.
    pub halted: bool,
}

pub struct RetryCoordinator {
    orchestrator: Orchestrator,
}

impl RetryCoordinator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Retry every failed run once, sequentially.
    ///
    /// Keywords that still fail are written to the unprocessed store and
    /// not attempted again for the rest of the batch. A quota failure stops
    /// the phase: every run not yet retried is recorded without another
    /// provider call.
    #[instrument(skip_all, fields(failed = runs.len()))]
    pub async fn retry_all(&self, runs: Vec<KeywordRun>) -> RetryOutcome {
        let mut outcome = RetryOutcome::default();
        let mut permanent: HashSet<String> = HashSet::new();
        let mut runs = runs.into_iter();

        while let Some(run) = runs.next() {
            let KeywordRun {
                ctx,
                mut cache,
                outcome: result,
            } = run;
            let Err(first) = result else {
                continue;
            };

            let key = ctx.job.text.to_lowercase();
            if permanent.contains(&key) {
                debug!(keyword = %ctx.job.text, "already unprocessed, skipping");
                continue;
            }

            match self.retry_one(&ctx, &mut cache, &first).await {
                Ok(draft) => {
                    info!(keyword = %ctx.job.text, stage = %first.stage, slug = %draft.slug, "recovered by retry");
                    outcome.recovered.push(draft);
                }
                Err(last) => {
                    warn!(
                        keyword = %ctx.job.text,
                        stage = %last.stage,
                        kind = %last.kind,
                        error = %last.message,
                        "retry failed, marking unprocessed"
                    );
                    permanent.insert(key);
                    let record = last.to_record(&ctx, Some(&first), &cache);
                    record_unprocessed(self.orchestrator.storage(), &record).await;
                    outcome.unprocessed.push(record);

                    if last.is_quota() {
                        error!(keyword = %ctx.job.text, "quota exhausted during retries, halting");
                        outcome.halted = true;
                        self.skip_remaining(&mut runs, &mut permanent, &mut outcome).await;
                        break;
                    }
                }
            }
        }

        info!(
            recovered = outcome.recovered.len(),
            unprocessed = outcome.unprocessed.len(),
            "retry phase complete"
        );
        outcome
    }

    async fn skip_remaining(
        &self,
        runs: impl Iterator<Item = KeywordRun>,
        permanent: &mut HashSet<String>,
        outcome: &mut RetryOutcome,
    ) {
        for KeywordRun {
            ctx,
            cache,
            outcome: result,
        } in runs
        {
            let Err(first) = result else {
                continue;
            };
            if !permanent.insert(ctx.job.text.to_lowercase()) {
                continue;
            }
            let record = first.to_record(&ctx, None, &cache);
            record_unprocessed(self.orchestrator.storage(), &record).await;
            outcome.unprocessed.push(record);
        }
    }

    /// Re-run the failed stage for one keyword, then finish it.
    pub(crate) async fn retry_one(
        &self,
        ctx: &KeywordContext,
        cache: &mut StageCache,
        failure: &StageFailure,
    ) -> Result<ContentDraft, StageFailure> {
        if failure.is_quota() {
            return Err(failure.clone());
        }

        match failure.stage {
            Stage::ImageGeneration => {
                // prompt order is lost once an image is missing; redo the set
                if cache.plan.is_none() {
                    return Err(StageFailure::missing(Stage::BlogPlan, "plan"));
                }
                cache.images.clear();
            }
            Stage::ContentGeneration => {
                if cache.plan.is_none() {
                    return Err(StageFailure::missing(Stage::BlogPlan, "plan"));
                }
                if cache.corpus.is_none() {
                    return Err(StageFailure::missing(Stage::Scraping, "scraped corpus"));
                }
                cache.content = None;
            }
            Stage::BlogPlan => {
                let plan = self.orchestrator.plan(&ctx.job).await?;
                cache.replace_plan(plan);
                if cache.corpus.is_none() {
                    cache.corpus = Some(self.rescrape(cache).await?);
                }
            }
            Stage::Scraping => {
                cache.corpus = Some(self.rescrape(cache).await?);
            }
            Stage::Search
            | Stage::LinkExtraction
            | Stage::DatabaseSave
            | Stage::PipelineException => {
                debug!(stage = %failure.stage, "no targeted retry path");
                return Err(failure.clone());
            }
        }

        self.orchestrator.complete(ctx, cache).await
    }

    async fn rescrape(
        &self,
        cache: &StageCache,
    ) -> Result<Vec<postforge_shared::ScrapedDocument>, StageFailure> {
        let links = cache
            .links
            .as_deref()
            .ok_or_else(|| StageFailure::missing(Stage::Search, "link list"))?;
        self.orchestrator.scrape(links).await
    }
}

/// Persist a keyword that will not be retried again.
///
/// A storage error here is logged and swallowed so the rest of the batch
/// still gets recorded.
pub(crate) async fn record_unprocessed(storage: &Storage, record: &FailureRecord) {
    if let Err(e) = storage.insert_failure(record).await {
        error!(keyword = %record.keyword, stage = %record.stage, error = %e, "failed to record unprocessed keyword");
    }
}
