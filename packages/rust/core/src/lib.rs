//! Keyword-to-draft pipeline and publish scheduling for PostForge.
//!
//! This crate drives keywords through search, planning, scraping, image and
//! text generation into pending drafts ([`batch`], [`pipeline`], [`retry`]),
//! and moves due drafts into their target stores ([`scheduler`]).

pub mod batch;
pub mod cache;
pub mod categorize;
pub mod draft;
pub mod excerpts;
pub mod links;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod throttle;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchReport, Pipeline, ProgressReporter, SilentProgress, Submission};
pub use cache::StageCache;
pub use categorize::{CategorySource, Labels, Taxonomy};
pub use pipeline::{FailureKind, KeywordContext, KeywordRun, Orchestrator, StageFailure};
pub use retry::{RetryCoordinator, RetryOutcome};
pub use scheduler::{PublishScheduler, TickReport};
pub use throttle::ThrottledImages;
pub use traits::{
    Collaborators, ContentGenerator, ContentRequest, ImageGenerator, PageScraper, PlanGenerator,
    SearchProvider, TaxonomySource,
};
