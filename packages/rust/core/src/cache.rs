//! Per-keyword cache of stage outputs.
//!
//! The task processing a keyword owns its cache. Outputs are written the
//! moment a stage succeeds so the retry coordinator can resume past
//! everything that already worked.

use postforge_shared::{BlogPlan, GeneratedContent, ScrapedDocument, Stage};

/// Last successful output of each stage for one keyword.
#[derive(Debug, Clone, Default)]
pub struct StageCache {
    pub links: Option<Vec<String>>,
    pub plan: Option<BlogPlan>,
    pub corpus: Option<Vec<ScrapedDocument>>,
    /// Hosted image URLs in prompt order. Grows as image calls succeed.
    pub images: Vec<String>,
    pub content: Option<GeneratedContent>,
}

impl StageCache {
    /// Stages whose output is present, in pipeline order.
    pub fn completed(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        if self.links.is_some() {
            stages.push(Stage::Search);
        }
        if self.plan.is_some() {
            stages.push(Stage::BlogPlan);
        }
        if self.corpus.is_some() {
            stages.push(Stage::Scraping);
        }
        if !self.images.is_empty() {
            stages.push(Stage::ImageGeneration);
        }
        if self.content.is_some() {
            stages.push(Stage::ContentGeneration);
        }
        stages
    }

    /// Drop the plan and everything derived from it.
    pub fn replace_plan(&mut self, plan: BlogPlan) {
        self.plan = Some(plan);
        self.images.clear();
        self.content = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_follows_pipeline_order() {
        let mut cache = StageCache::default();
        assert!(cache.completed().is_empty());

        cache.content = Some(GeneratedContent::default());
        cache.links = Some(vec!["https://a.example".into()]);
        assert_eq!(cache.completed(), vec![Stage::Search, Stage::ContentGeneration]);
    }

    #[test]
    fn replacing_plan_invalidates_derived_outputs() {
        let mut cache = StageCache {
            plan: Some(BlogPlan::default()),
            images: vec!["https://img.example/1.png".into()],
            content: Some(GeneratedContent::default()),
            corpus: Some(vec![]),
            ..StageCache::default()
        };
        cache.replace_plan(BlogPlan {
            title: "new".into(),
            ..BlogPlan::default()
        });
        assert!(cache.images.is_empty());
        assert!(cache.content.is_none());
        assert!(cache.corpus.is_some());
        assert_eq!(cache.plan.map(|p| p.title).as_deref(), Some("new"));
    }
}
