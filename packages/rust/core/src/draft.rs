//! Turning generated content into a [`ContentDraft`].

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use postforge_shared::{
    BlogPlan, ContentDraft, DraftId, DraftStatus, GeneratedContent, KeywordJob, PipelineConfig,
    TargetLocator,
};
use regex::Regex;

use crate::categorize::Labels;

/// URL-safe slug: lowercase ASCII letters, digits and single hyphens.
pub fn slugify(title: &str) -> String {
    static DISALLOWED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^a-z0-9\s-]").expect("valid regex"));
    static SEPARATORS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[-\s]+").expect("valid regex"));

    let lower = title.trim().to_lowercase();
    let cleaned = DISALLOWED.replace_all(&lower, "");
    SEPARATORS
        .replace_all(cleaned.trim(), "-")
        .trim_matches('-')
        .to_string()
}

/// Text of the first `<h2>` in `markup`, tags stripped.
pub fn first_h2(markup: &str) -> Option<String> {
    static H2: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)<h2[^>]*>(.*?)</h2>").expect("valid regex"));

    H2.captures(markup)
        .map(|c| plain_text(&c[1]))
        .filter(|t| !t.is_empty())
}

/// Markup with tags removed and whitespace collapsed.
pub fn plain_text(markup: &str) -> String {
    static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

    TAG.replace_all(markup, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plan title, else the first `<h2>` of the content, else the keyword.
pub fn resolve_title(plan: &BlogPlan, content: &GeneratedContent, keyword: &str) -> String {
    let planned = plan.title.trim();
    if !planned.is_empty() {
        return planned.to_string();
    }
    first_h2(&content.markup).unwrap_or_else(|| keyword.trim().to_string())
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `<img>` figures for each image URL, in order.
pub fn image_markup(urls: &[String], alt: &str) -> String {
    let alt = escape_attr(alt);
    urls.iter()
        .map(|url| {
            format!(
                "<figure><img src=\"{}\" alt=\"{alt}\" loading=\"lazy\" /></figure>\n",
                escape_attr(url)
            )
        })
        .collect()
}

/// Inputs for [`build_draft`] that come from the batch rather than a stage.
pub struct DraftContext<'a> {
    pub job: &'a KeywordJob,
    pub target: &'a TargetLocator,
    /// Position of the keyword within its batch; spaces out schedules.
    pub post_index: usize,
    pub now: DateTime<Utc>,
}

/// Assemble a pending draft from stage outputs.
pub fn build_draft(
    ctx: &DraftContext<'_>,
    config: &PipelineConfig,
    plan: &BlogPlan,
    content: &GeneratedContent,
    images: &[String],
    labels: Labels,
) -> ContentDraft {
    let id = DraftId::new();
    let title = resolve_title(plan, content, &ctx.job.text);
    let mut slug = slugify(&title);
    if slug.is_empty() {
        slug = slugify(&ctx.job.text);
    }
    if slug.is_empty() {
        // nothing ASCII survived; the id keeps the slug unique
        slug = format!("post-{}", id.0.simple());
    }

    let body = format!("{}{}", image_markup(images, &title), content.markup);
    let word_count = if content.word_count > 0 {
        content.word_count
    } else {
        plain_text(&content.markup).split_whitespace().count() as u32
    };

    let offset = config.post_stagger * i32::try_from(ctx.post_index).unwrap_or(i32::MAX);

    ContentDraft {
        id,
        keyword: ctx.job.text.clone(),
        title,
        body,
        slug,
        category_ids: labels.category_ids,
        tag_ids: labels.tag_ids,
        image_urls: images.to_vec(),
        status: DraftStatus::Pending,
        created_at: ctx.now,
        scheduled_at: ctx.now + offset,
        published_at: None,
        target: ctx.target.clone(),
        author_id: config.author_id.clone(),
        word_count,
        language: ctx.job.language.clone(),
        requester: ctx.job.requester.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postforge_shared::AppConfig;

    #[test]
    fn slugify_cases() {
        assert_eq!(slugify("Acme Corp: The 2026 Guide!"), "acme-corp-the-2026-guide");
        assert_eq!(slugify("  --Hello -- World--  "), "hello-world");
        assert_eq!(slugify("Café déjà vu"), "caf-dj-vu");
        assert_eq!(slugify("日本語"), "");
    }

    #[test]
    fn slug_is_deterministic() {
        assert_eq!(slugify("Same Title"), slugify("Same Title"));
    }

    #[test]
    fn title_fallbacks() {
        let content = GeneratedContent {
            markup: "<p>intro</p><h2 class=\"x\">The <em>Real</em> Title</h2>".into(),
            ..GeneratedContent::default()
        };
        let mut plan = BlogPlan {
            title: "Planned".into(),
            ..BlogPlan::default()
        };
        assert_eq!(resolve_title(&plan, &content, "kw"), "Planned");

        plan.title = "  ".into();
        assert_eq!(resolve_title(&plan, &content, "kw"), "The Real Title");

        assert_eq!(
            resolve_title(&plan, &GeneratedContent::default(), " kw "),
            "kw"
        );
    }

    #[test]
    fn image_markup_escapes_attributes() {
        let html = image_markup(&["https://img.example/a.png?x=1&y=2".into()], "A \"quoted\" alt");
        assert!(html.contains("x=1&amp;y=2"));
        assert!(html.contains("A &quot;quoted&quot; alt"));
    }

    fn job(text: &str) -> KeywordJob {
        KeywordJob {
            text: text.into(),
            language: "en".into(),
            country: "us".into(),
            requester: None,
        }
    }

    #[test]
    fn build_draft_schedules_by_index() {
        let config = PipelineConfig::try_from(&AppConfig::default()).expect("pipeline config");
        let job = job("acme corp");
        let target = config.target.clone();
        let now = Utc::now();
        let ctx = DraftContext {
            job: &job,
            target: &target,
            post_index: 3,
            now,
        };
        let plan = BlogPlan {
            title: "Acme Corp Explained".into(),
            headings: vec!["One".into()],
            image_prompts: vec![],
        };
        let content = GeneratedContent {
            markup: "<h2>One</h2><p>four words right here</p>".into(),
            word_count: 0,
            selected_category: None,
        };
        let images = vec!["https://img.example/1.png".to_string()];

        let draft = build_draft(&ctx, &config, &plan, &content, &images, Labels::default());
        assert_eq!(draft.slug, "acme-corp-explained");
        assert_eq!(draft.status, DraftStatus::Pending);
        assert_eq!(draft.scheduled_at - draft.created_at, chrono::Duration::minutes(15));
        assert!(draft.scheduled_at >= draft.created_at);
        assert!(draft.body.starts_with("<figure><img src=\"https://img.example/1.png\""));
        assert_eq!(draft.word_count, 5);
        assert_eq!(draft.target.collection, "posts");
    }

    #[test]
    fn non_ascii_title_falls_back_to_id_slug() {
        let config = PipelineConfig::try_from(&AppConfig::default()).expect("pipeline config");
        let job = job("東京 観光");
        let target = config.target.clone();
        let ctx = DraftContext {
            job: &job,
            target: &target,
            post_index: 0,
            now: Utc::now(),
        };
        let plan = BlogPlan {
            title: "東京ガイド".into(),
            headings: vec![],
            image_prompts: vec![],
        };
        let content = GeneratedContent {
            markup: "<p>本文</p>".into(),
            word_count: 0,
            selected_category: None,
        };

        let first = build_draft(&ctx, &config, &plan, &content, &[], Labels::default());
        let second = build_draft(&ctx, &config, &plan, &content, &[], Labels::default());
        assert_eq!(first.slug, format!("post-{}", first.id.0.simple()));
        assert_ne!(first.slug, second.slug);
        assert_eq!(slugify(&first.slug), first.slug);
    }
}
