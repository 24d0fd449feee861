//! Publish scheduler: moves due drafts into their target stores.
//!
//! Each tick publishes at most `batch_cap` of the oldest due drafts and
//! pushes the rest back by `overflow_delay`. Drafts are never dropped and a
//! published draft is never published again.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use postforge_shared::{ContentDraft, PostForgeError, Result, SchedulerConfig};
use postforge_storage::{PublishedDocument, Storage, TargetRegistry};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub published: usize,
    /// Over the cap; rescheduled for a later tick.
    pub deferred: usize,
    /// Already present in the target under the same slug.
    pub duplicates: usize,
    /// Left pending after an error.
    pub failed: usize,
}

enum PublishOutcome {
    Published,
    AlreadyPresent,
}

pub struct PublishScheduler {
    storage: Arc<Storage>,
    registry: Arc<TargetRegistry>,
    config: SchedulerConfig,
}

impl PublishScheduler {
    pub fn new(storage: Arc<Storage>, registry: Arc<TargetRegistry>, config: SchedulerConfig) -> Self {
        Self {
            storage,
            registry,
            config,
        }
    }

    /// Publish whatever is due at `now`.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let now = now.trunc_subsecs(6);
        let due = self.storage.list_due_drafts(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            debug!("nothing due");
            return Ok(report);
        }

        let cap = self.config.batch_cap.max(1);
        let (batch, overflow) = due.split_at(due.len().min(cap));

        let later = now + self.config.overflow_delay;
        for draft in overflow {
            match self.storage.reschedule_draft(&draft.id, later).await {
                Ok(true) => report.deferred += 1,
                Ok(false) => debug!(draft_id = %draft.id, "draft no longer pending"),
                Err(e) => {
                    warn!(draft_id = %draft.id, error = %e, "failed to defer draft");
                    report.failed += 1;
                }
            }
        }

        for draft in batch {
            match self.publish_one(draft, now).await {
                Ok(PublishOutcome::Published) => report.published += 1,
                Ok(PublishOutcome::AlreadyPresent) => report.duplicates += 1,
                Err(e) => {
                    warn!(
                        draft_id = %draft.id,
                        slug = %draft.slug,
                        target = %draft.target.store,
                        error = %e,
                        "publish failed, draft stays pending"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            due = report.due,
            published = report.published,
            deferred = report.deferred,
            duplicates = report.duplicates,
            failed = report.failed,
            "tick complete"
        );
        Ok(report)
    }

    async fn publish_one(&self, draft: &ContentDraft, now: DateTime<Utc>) -> Result<PublishOutcome> {
        let store = self.registry.get(&draft.target.store).await?;
        let collection = &draft.target.collection;
        let doc = PublishedDocument::from_draft(draft, now);

        let outcome = match store.publish(collection, &doc).await {
            Ok(()) => PublishOutcome::Published,
            Err(PostForgeError::DuplicateKey { slug }) => {
                // advance only if the target really holds this slug
                if store.find_by_slug(collection, &slug).await?.is_none() {
                    return Err(PostForgeError::DuplicateKey { slug });
                }
                debug!(slug = %slug, "slug already in target");
                PublishOutcome::AlreadyPresent
            }
            Err(e) => return Err(e),
        };

        if !self.storage.mark_published(&draft.id, now).await? {
            debug!(draft_id = %draft.id, "draft was already published");
        }
        Ok(outcome)
    }

    /// Tick on the configured interval until `shutdown` flips to `true`.
    /// A tick in progress always finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            cap = self.config.batch_cap,
            "scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
