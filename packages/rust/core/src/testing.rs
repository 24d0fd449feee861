//! Scripted collaborators for pipeline tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use postforge_matcher::{LabelMatcher, TfIdfMatcher};
use postforge_shared::{
    AppConfig, BlogPlan, Candidate, GeneratedContent, KeywordJob, PipelineConfig, PostForgeError,
    Result, ScrapedDocument,
};
use postforge_storage::Storage;
use uuid::Uuid;

use crate::categorize::Taxonomy;
use crate::pipeline::{KeywordContext, Orchestrator};
use crate::traits::{
    Collaborators, ContentGenerator, ContentRequest, ImageGenerator, PageScraper, PlanGenerator,
    SearchProvider, TaxonomySource,
};

/// Consume one scripted failure, if any are left.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

pub(crate) struct MockSearch {
    urls: Mutex<Vec<String>>,
    /// Calls that return an empty list before results come back.
    pub empty_times: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockSearch {
    pub fn set_urls(&self, urls: Vec<String>) {
        *self.urls.lock().expect("lock") = urls;
    }
}

#[async_trait]
impl SearchProvider for MockSearch {
    async fn search(&self, _keyword: &str, _country: &str, _language: &str) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.empty_times) {
            return Ok(vec![]);
        }
        Ok(self.urls.lock().expect("lock").clone())
    }
}

// ---------------------------------------------------------------------------
// Scraper
// ---------------------------------------------------------------------------

pub(crate) struct MockScraper {
    /// Calls that come back with no readable documents.
    pub fail_times: AtomicUsize,
    /// Calls that fail with a provider error.
    pub error_times: AtomicUsize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl PageScraper for MockScraper {
    async fn scrape(&self, urls: &[String], target_count: usize) -> Result<Vec<ScrapedDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.error_times) {
            return Err(PostForgeError::provider("mock-scraper", "connection reset"));
        }
        if take_one(&self.fail_times) {
            return Ok(vec![]);
        }
        // every third page is unreadable
        Ok(urls
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 2)
            .take(target_count)
            .map(|(_, url)| ScrapedDocument {
                title: "Acme Corp overview".into(),
                url: url.clone(),
                text: "Acme Corp is a business founded in 1950. The company sells anvils and \
                       rockets to corporate customers. Revenue grew in new markets last year. \
                       Its history includes several famous product launches."
                    .into(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

pub(crate) struct MockPlanner {
    /// Calls that return a plan without image prompts.
    pub invalid_times: AtomicUsize,
    pub quota: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl PlanGenerator for MockPlanner {
    async fn generate_plan(&self, keyword: &str, _language: &str) -> Result<BlogPlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.quota.load(Ordering::SeqCst) {
            return Err(PostForgeError::quota("mock-llm", "credits exhausted"));
        }
        let image_prompts = if take_one(&self.invalid_times) {
            vec![]
        } else {
            vec![
                format!("{keyword} headquarters at dawn"),
                format!("{keyword} product lineup"),
            ]
        };
        Ok(BlogPlan {
            title: format!("{keyword} explained"),
            headings: vec!["History".into(), "Products".into(), "Markets".into()],
            image_prompts,
        })
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub(crate) struct MockImages {
    pub fail_times: AtomicUsize,
    pub quota: AtomicBool,
    pub delay_ms: AtomicU64,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockImages {
    pub fn new() -> Self {
        Self {
            fail_times: AtomicUsize::new(0),
            quota: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageGenerator for MockImages {
    async fn generate_image(&self, prompt: &str) -> Result<Option<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.quota.load(Ordering::SeqCst) {
            return Err(PostForgeError::quota("mock-images", "out of credits"));
        }
        if take_one(&self.fail_times) {
            return Err(PostForgeError::provider("mock-images", "render failed"));
        }
        Ok(Some(format!(
            "https://img.example/{call}-{}.png",
            prompt.len()
        )))
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub(crate) struct MockWriter {
    selected_category: Mutex<Option<String>>,
    pub fail_times: AtomicUsize,
    pub quota: AtomicBool,
    pub delay_ms: AtomicU64,
    pub calls: AtomicUsize,
}

impl MockWriter {
    pub fn set_selected_category(&self, category: Option<&str>) {
        *self.selected_category.lock().expect("lock") = category.map(str::to_string);
    }
}

#[async_trait]
impl ContentGenerator for MockWriter {
    async fn generate_content(&self, request: &ContentRequest) -> Result<GeneratedContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.quota.load(Ordering::SeqCst) {
            return Err(PostForgeError::quota("mock-llm", "credits exhausted"));
        }
        if take_one(&self.fail_times) {
            return Err(PostForgeError::provider("mock-llm", "upstream 500"));
        }

        let sections: String = request
            .plan
            .headings
            .iter()
            .map(|h| format!("<h2>{h}</h2><p>{} business revenue corporate markets.</p>", request.keyword))
            .collect();
        Ok(GeneratedContent {
            markup: sections,
            word_count: 0,
            selected_category: self.selected_category.lock().expect("lock").clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Taxonomy + matcher
// ---------------------------------------------------------------------------

pub(crate) struct MockTaxonomy {
    pub categories: Vec<Candidate>,
    pub tags: Vec<Candidate>,
    pub fail: AtomicBool,
}

#[async_trait]
impl TaxonomySource for MockTaxonomy {
    async fn list_categories(&self) -> Result<Vec<Candidate>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PostForgeError::Storage("taxonomy unavailable".into()));
        }
        Ok(self.categories.clone())
    }

    async fn list_tags(&self) -> Result<Vec<Candidate>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PostForgeError::Storage("taxonomy unavailable".into()));
        }
        Ok(self.tags.clone())
    }
}

/// A [`TfIdfMatcher`] that counts how often it is consulted.
#[derive(Default)]
pub(crate) struct CountingMatcher {
    inner: TfIdfMatcher,
    calls: AtomicUsize,
}

impl CountingMatcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LabelMatcher for CountingMatcher {
    fn top_matches(&self, query: &str, candidates: &[Candidate], k: usize) -> Vec<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.top_matches(query, candidates, k)
    }

    fn best_match(&self, query: &str, candidates: &[Candidate]) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.best_match(query, candidates)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// One handle per mock so tests can script and inspect them.
pub(crate) struct Mocks {
    pub search: Arc<MockSearch>,
    pub scraper: Arc<MockScraper>,
    pub planner: Arc<MockPlanner>,
    pub images: Arc<MockImages>,
    pub writer: Arc<MockWriter>,
    pub taxonomy: Arc<MockTaxonomy>,
    pub matcher: Arc<CountingMatcher>,
}

pub(crate) fn candidate(id: &str, name: &str, description: &str) -> Candidate {
    Candidate {
        id: id.into(),
        name: name.into(),
        description: description.into(),
    }
}

impl Mocks {
    /// Three search results (two readable), a three-heading plan with two
    /// image prompts, a generator that names "Business", and no tags.
    pub fn scenario() -> Self {
        Self {
            search: Arc::new(MockSearch {
                urls: Mutex::new(vec![
                    "https://acme.com/about".into(),
                    "https://news.example.org/acme".into(),
                    "https://wiki.example.net/Acme".into(),
                ]),
                empty_times: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }),
            scraper: Arc::new(MockScraper {
                fail_times: AtomicUsize::new(0),
                error_times: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }),
            planner: Arc::new(MockPlanner {
                invalid_times: AtomicUsize::new(0),
                quota: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }),
            images: Arc::new(MockImages::new()),
            writer: Arc::new(MockWriter {
                selected_category: Mutex::new(Some("Business".into())),
                fail_times: AtomicUsize::new(0),
                quota: AtomicBool::new(false),
                delay_ms: AtomicU64::new(0),
                calls: AtomicUsize::new(0),
            }),
            taxonomy: Arc::new(MockTaxonomy {
                categories: vec![
                    candidate(
                        "cat-business",
                        "Business",
                        "companies corporate revenue markets",
                    ),
                    candidate("cat-travel", "Travel", "flights hotels destinations tourism"),
                ],
                tags: vec![],
                fail: AtomicBool::new(false),
            }),
            matcher: Arc::new(CountingMatcher::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            search: self.search.clone(),
            scraper: self.scraper.clone(),
            planner: self.planner.clone(),
            images: self.images.clone(),
            writer: self.writer.clone(),
            taxonomy: self.taxonomy.clone(),
            matcher: self.matcher.clone(),
        }
    }

    pub fn taxonomy(&self) -> Arc<Taxonomy> {
        Arc::new(Taxonomy {
            categories: self.taxonomy.categories.clone(),
            tags: self.taxonomy.tags.clone(),
        })
    }
}

/// Temp-file storage, unique per test.
pub(crate) async fn test_storage() -> Arc<Storage> {
    let tmp = std::env::temp_dir().join(format!("pf_test_{}.db", Uuid::now_v7()));
    Arc::new(Storage::open(&tmp).await.expect("open test db"))
}

/// Default config with short timeouts and no launch stagger.
pub(crate) fn test_app_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pipeline.keyword_stagger_secs = 0;
    config.pipeline.call_timeout_secs = 5;
    config
}

pub(crate) async fn test_orchestrator(mocks: &Mocks) -> Orchestrator {
    test_orchestrator_with(mocks, |_| {}).await
}

pub(crate) async fn test_orchestrator_with(
    mocks: &Mocks,
    tweak: impl FnOnce(&mut PipelineConfig),
) -> Orchestrator {
    let mut config = PipelineConfig::try_from(&test_app_config()).expect("pipeline config");
    tweak(&mut config);
    Orchestrator::new(mocks.collaborators(), Arc::new(config), test_storage().await)
}

pub(crate) fn keyword_context(keyword: &str, post_index: usize, mocks: &Mocks) -> KeywordContext {
    let config = PipelineConfig::try_from(&test_app_config()).expect("pipeline config");
    KeywordContext {
        job: KeywordJob {
            text: keyword.into(),
            language: "en".into(),
            country: "us".into(),
            requester: Some("ops@example.com".into()),
        },
        post_index,
        batch_id: Uuid::now_v7(),
        target: config.target,
        taxonomy: mocks.taxonomy(),
    }
}
