//! Batch submission: fan keywords out to the orchestrator, then retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use postforge_shared::{
    AppConfig, BatchRequest, ContentDraft, FailureRecord, PipelineConfig, PostForgeError, Result,
    Stage,
};
use postforge_storage::Storage;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::StageCache;
use crate::categorize::Taxonomy;
use crate::pipeline::{
    FailureKind, KeywordContext, KeywordRun, Orchestrator, StageFailure, with_timeout,
};
use crate::retry::{RetryCoordinator, record_unprocessed};
use crate::throttle::ThrottledImages;
use crate::traits::Collaborators;

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Callbacks for batch progress, so the CLI can drive a spinner.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a keyword task is launched.
    fn keyword_started(&self, keyword: &str, current: usize, total: usize);
    /// Called when a keyword task finishes its first run.
    fn keyword_finished(&self, keyword: &str, failure: Option<&StageFailure>);
    /// Called when the batch completes.
    fn done(&self, report: &BatchReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn keyword_started(&self, _keyword: &str, _current: usize, _total: usize) {}
    fn keyword_finished(&self, _keyword: &str, _failure: Option<&StageFailure>) {}
    fn done(&self, _report: &BatchReport) {}
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Everything a batch produced.
#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// Drafts created on the first run, by post index.
    pub drafts: Vec<ContentDraft>,
    /// Drafts created by the retry phase.
    pub recovered: Vec<ContentDraft>,
    /// Keywords left for manual review.
    pub unprocessed: Vec<FailureRecord>,
    /// A provider ran out of quota and the batch stopped launching keywords.
    pub halted: bool,
}

impl BatchReport {
    pub fn created(&self) -> usize {
        self.drafts.len() + self.recovered.len()
    }
}

/// Handle for a batch running in the background.
pub struct Submission {
    pub batch_id: Uuid,
    /// Keywords accepted after trimming and de-duplication.
    pub accepted: usize,
    pub handle: JoinHandle<Result<BatchReport>>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Entry point for keyword batches.
///
/// Cheap to clone. The config is an immutable snapshot; use
/// [`Pipeline::reconfigured`] to get a handle bound to a different one.
#[derive(Clone)]
pub struct Pipeline {
    app: Arc<AppConfig>,
    orchestrator: Orchestrator,
}

impl Pipeline {
    /// Build a pipeline. Image calls from every batch on this pipeline
    /// share one concurrency limit.
    pub fn new(
        app: Arc<AppConfig>,
        mut collab: Collaborators,
        storage: Arc<Storage>,
    ) -> Result<Self> {
        let config = Arc::new(PipelineConfig::try_from(app.as_ref())?);
        collab.images = Arc::new(ThrottledImages::new(
            collab.images,
            app.pipeline.image_concurrency,
        ));
        Ok(Self {
            app,
            orchestrator: Orchestrator::new(collab, config, storage),
        })
    }

    /// Same collaborators and image limit, different config.
    pub fn reconfigured(&self, app: Arc<AppConfig>) -> Result<Self> {
        let config = Arc::new(PipelineConfig::try_from(app.as_ref())?);
        Ok(Self {
            app,
            orchestrator: Orchestrator::new(
                self.orchestrator.collaborators().clone(),
                config,
                Arc::clone(self.orchestrator.storage()),
            ),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.app
    }

    /// Accept a batch and run it in the background.
    ///
    /// Returns as soon as the keywords are accepted. The handle may be
    /// awaited for the report or dropped.
    pub fn submit(&self, request: BatchRequest) -> Result<Submission> {
        let accepted = request.jobs().len();
        if accepted == 0 {
            return Err(PostForgeError::validation("batch has no keywords"));
        }
        let batch_id = Uuid::now_v7();
        let pipeline = self.clone();
        let handle =
            tokio::spawn(async move { pipeline.execute(batch_id, request, &SilentProgress).await });

        info!(%batch_id, accepted, "batch accepted");
        Ok(Submission {
            batch_id,
            accepted,
            handle,
        })
    }

    /// Run a batch to completion, retries included.
    pub async fn run_batch(
        &self,
        request: BatchRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        self.execute(Uuid::now_v7(), request, progress).await
    }

    #[instrument(skip_all, fields(batch_id = %batch_id))]
    async fn execute(
        &self,
        batch_id: Uuid,
        request: BatchRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        let jobs = request.jobs();
        if jobs.is_empty() {
            return Err(PostForgeError::validation("batch has no keywords"));
        }
        let config = self.orchestrator.config();
        let target = request.target.clone().unwrap_or_else(|| config.target.clone());
        let stagger = config.keyword_stagger;
        let total = jobs.len();
        info!(keywords = total, target = %target.store, "starting batch");

        // --- Taxonomy, once per batch ---
        progress.phase("Loading taxonomy");
        let taxonomy = Arc::new(self.load_taxonomy().await);

        // --- Launch ---
        progress.phase("Generating drafts");
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut launched: HashMap<tokio::task::Id, KeywordContext> = HashMap::new();
        let mut not_started = Vec::new();

        for (idx, job) in jobs.into_iter().enumerate() {
            let ctx = KeywordContext {
                job,
                post_index: idx,
                batch_id,
                target: target.clone(),
                taxonomy: Arc::clone(&taxonomy),
            };

            if idx > 0 && !stagger.is_zero() && !halted.load(Ordering::SeqCst) {
                tokio::time::sleep(stagger).await;
            }
            if halted.load(Ordering::SeqCst) {
                not_started.push(ctx);
                continue;
            }

            progress.keyword_started(&ctx.job.text, idx + 1, total);
            let orchestrator = self.orchestrator.clone();
            let halt = Arc::clone(&halted);
            let task_ctx = ctx.clone();
            let handle = tasks.spawn(async move {
                let run = orchestrator.run_keyword(task_ctx).await;
                if run.outcome.as_ref().err().is_some_and(StageFailure::is_quota) {
                    halt.store(true, Ordering::SeqCst);
                }
                run
            });
            launched.insert(handle.id(), ctx);
        }

        // --- Drain ---
        let mut drafts = Vec::new();
        let mut failed = Vec::new();
        let mut unprocessed = Vec::new();

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, run)) => {
                    launched.remove(&id);
                    progress.keyword_finished(&run.ctx.job.text, run.outcome.as_ref().err());
                    match run.outcome {
                        Ok(draft) => drafts.push(draft),
                        Err(failure) => failed.push(KeywordRun {
                            ctx: run.ctx,
                            cache: run.cache,
                            outcome: Err(failure),
                        }),
                    }
                }
                Err(e) => {
                    let Some(ctx) = launched.remove(&e.id()) else {
                        continue;
                    };
                    error!(keyword = %ctx.job.text, error = %e, "keyword task aborted");
                    let failure = StageFailure::new(
                        Stage::PipelineException,
                        FailureKind::Aborted,
                        format!("keyword task failed: {e}"),
                    );
                    progress.keyword_finished(&ctx.job.text, Some(&failure));
                    unprocessed.push(failure.to_record(&ctx, None, &StageCache::default()));
                }
            }
        }
        drafts.sort_by_key(|d| d.scheduled_at);

        let mut halted = halted.load(Ordering::SeqCst);
        for ctx in &not_started {
            let failure = StageFailure::new(
                Stage::PipelineException,
                FailureKind::Aborted,
                "batch halted before this keyword started",
            );
            unprocessed.push(failure.to_record(ctx, None, &StageCache::default()));
        }

        // --- Retry, unless a quota ran out ---
        let mut recovered = Vec::new();
        if halted {
            error!(
                failed = failed.len(),
                not_started = not_started.len(),
                "provider quota exhausted, batch halted without retries"
            );
            for run in &failed {
                if let Err(failure) = &run.outcome {
                    unprocessed.push(failure.to_record(&run.ctx, None, &run.cache));
                }
            }
        }
        for record in &unprocessed {
            record_unprocessed(self.orchestrator.storage(), record).await;
        }
        if !halted && !failed.is_empty() {
            progress.phase("Retrying failed keywords");
            let outcome = RetryCoordinator::new(self.orchestrator.clone())
                .retry_all(failed)
                .await;
            recovered = outcome.recovered;
            unprocessed.extend(outcome.unprocessed);
            halted |= outcome.halted;
        }

        let report = BatchReport {
            batch_id,
            drafts,
            recovered,
            unprocessed,
            halted,
        };
        info!(
            created = report.created(),
            unprocessed = report.unprocessed.len(),
            halted,
            "batch complete"
        );
        progress.done(&report);
        Ok(report)
    }

    /// Categories and tags for this batch. A source that cannot be read
    /// yields an empty list so the batch still runs.
    async fn load_taxonomy(&self) -> Taxonomy {
        let source = &self.orchestrator.collaborators().taxonomy;
        let limit = self.orchestrator.config().call_timeout;

        let categories = with_timeout(limit, "list categories", source.list_categories())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load categories");
                Vec::new()
            });
        let tags = with_timeout(limit, "list tags", source.list_tags())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load tags");
                Vec::new()
            });

        info!(categories = categories.len(), tags = tags.len(), "taxonomy loaded");
        Taxonomy { categories, tags }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Mocks, test_app_config, test_storage};
    use postforge_shared::{TargetEntry, TargetWriteMode};
    use std::sync::atomic::Ordering;

    async fn pipeline(mocks: &Mocks, app: AppConfig) -> Pipeline {
        Pipeline::new(Arc::new(app), mocks.collaborators(), test_storage().await)
            .expect("pipeline")
    }

    fn request(keywords: &[&str]) -> BatchRequest {
        let mut request = BatchRequest::new(keywords.iter().map(|k| k.to_string()).collect());
        request.requester = Some("ops@example.com".into());
        request
    }

    #[tokio::test]
    async fn batch_creates_staggered_drafts() {
        let mocks = Mocks::scenario();
        let pipeline = pipeline(&mocks, test_app_config()).await;

        let report = pipeline
            .run_batch(request(&["acme corp", "globex", "initech"]), &SilentProgress)
            .await
            .expect("batch");

        assert!(!report.halted);
        assert_eq!(report.drafts.len(), 3);
        assert!(report.unprocessed.is_empty());
        let offsets: Vec<i64> = report
            .drafts
            .iter()
            .map(|d| (d.scheduled_at - d.created_at).num_minutes())
            .collect();
        assert_eq!(offsets, vec![0, 5, 10]);
        assert!(report.drafts.iter().all(|d| d.requester.as_deref() == Some("ops@example.com")));
    }

    #[tokio::test]
    async fn duplicate_keywords_are_collapsed() {
        let mocks = Mocks::scenario();
        let pipeline = pipeline(&mocks, test_app_config()).await;

        let report = pipeline
            .run_batch(request(&["Acme Corp", " acme corp ", ""]), &SilentProgress)
            .await
            .expect("batch");
        assert_eq!(report.drafts.len(), 1);
        assert_eq!(mocks.search.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let mocks = Mocks::scenario();
        let pipeline = pipeline(&mocks, test_app_config()).await;
        assert!(pipeline.submit(request(&["  "])).is_err());
        assert!(pipeline.run_batch(request(&[]), &SilentProgress).await.is_err());
    }

    #[tokio::test]
    async fn submit_returns_before_completion() {
        let mocks = Mocks::scenario();
        let pipeline = pipeline(&mocks, test_app_config()).await;

        let submission = pipeline.submit(request(&["acme corp", "globex"])).expect("accepted");
        assert_eq!(submission.accepted, 2);

        let report = submission.handle.await.expect("join").expect("batch");
        assert_eq!(report.batch_id, submission.batch_id);
        assert_eq!(report.created(), 2);
    }

    #[tokio::test]
    async fn failed_keyword_is_recovered_by_retry() {
        let mocks = Mocks::scenario();
        mocks.writer.fail_times.store(2, Ordering::SeqCst);
        let pipeline = pipeline(&mocks, test_app_config()).await;

        let report = pipeline
            .run_batch(request(&["acme corp"]), &SilentProgress)
            .await
            .expect("batch");
        assert!(report.drafts.is_empty());
        assert_eq!(report.recovered.len(), 1);
        assert!(report.unprocessed.is_empty());
    }

    #[tokio::test]
    async fn quota_exhaustion_halts_batch() {
        let mocks = Mocks::scenario();
        mocks.images.quota.store(true, Ordering::SeqCst);
        let mut app = test_app_config();
        app.pipeline.keyword_stagger_secs = 1;
        let pipeline = pipeline(&mocks, app).await;

        let report = pipeline
            .run_batch(request(&["acme corp", "globex", "initech"]), &SilentProgress)
            .await
            .expect("batch");

        assert!(report.halted);
        assert_eq!(report.created(), 0);
        assert_eq!(report.unprocessed.len(), 3);
        let never_started = report
            .unprocessed
            .iter()
            .filter(|r| r.stage == Stage::PipelineException)
            .count();
        assert_eq!(never_started, 2);
        // no retry phase
        assert_eq!(mocks.images.calls.load(Ordering::SeqCst), 1);
        assert_eq!(mocks.search.calls.load(Ordering::SeqCst), 1);

        let stored = pipeline
            .orchestrator
            .storage()
            .list_failures(10)
            .await
            .expect("list");
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn unreadable_taxonomy_still_runs() {
        let mocks = Mocks::scenario();
        mocks.taxonomy.fail.store(true, Ordering::SeqCst);
        let pipeline = pipeline(&mocks, test_app_config()).await;

        let report = pipeline
            .run_batch(request(&["acme corp"]), &SilentProgress)
            .await
            .expect("batch");
        assert_eq!(report.drafts.len(), 1);
        assert!(report.drafts[0].category_ids.is_empty());
        assert_eq!(mocks.matcher.calls(), 0);
    }

    #[tokio::test]
    async fn reconfigured_pipeline_leaves_original_untouched() {
        let mocks = Mocks::scenario();
        let mut app = test_app_config();
        app.targets.push(TargetEntry {
            name: "staging".into(),
            path: "~/.postforge/targets/staging.db".into(),
            mode: TargetWriteMode::InsertOnly,
        });
        let original = pipeline(&mocks, app).await;

        let swapped = original
            .reconfigured(Arc::new(
                original.config().with_active_target("staging").expect("known target"),
            ))
            .expect("reconfigure");
        assert_eq!(original.config().active_target, "primary");
        assert_eq!(swapped.config().active_target, "staging");

        let report = swapped
            .run_batch(request(&["acme corp"]), &SilentProgress)
            .await
            .expect("batch");
        assert_eq!(report.drafts[0].target.store, "staging");
    }

    #[tokio::test]
    async fn image_calls_share_one_limit() {
        let mocks = Mocks::scenario();
        mocks.images.delay_ms.store(20, Ordering::SeqCst);
        let pipeline = pipeline(&mocks, test_app_config()).await;

        let report = pipeline
            .run_batch(
                request(&["acme corp", "globex", "initech", "hooli"]),
                &SilentProgress,
            )
            .await
            .expect("batch");
        assert_eq!(report.created(), 4);
        assert!(mocks.images.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
