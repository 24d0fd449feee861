//! Category and tag assignment for generated content.

use postforge_matcher::LabelMatcher;
use postforge_shared::{Candidate, GeneratedContent};
use tracing::debug;

use crate::draft::plain_text;

/// Categories considered when falling back to similarity matching.
const CATEGORY_MATCHES: usize = 2;

/// Category/tag candidates available to a batch. Loaded once per batch.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    pub categories: Vec<Candidate>,
    pub tags: Vec<Candidate>,
}

/// How the category was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CategorySource {
    /// The generator named a category that exists.
    Explicit,
    Matched,
    /// Configured default category.
    Default,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    pub category_ids: Vec<String>,
    pub tag_ids: Vec<String>,
    pub source: CategorySource,
}

/// Pick categories and tags for `content`.
///
/// An explicit category from the generator wins when it names a known
/// category (case-insensitive). Otherwise the matcher scores the article
/// text against the categories. Tags are always matched. The matcher is
/// never called with an empty candidate list.
pub fn categorize(
    keyword: &str,
    content: &GeneratedContent,
    taxonomy: &Taxonomy,
    matcher: &dyn LabelMatcher,
    default_category: Option<&str>,
) -> Labels {
    let mut labels = Labels::default();

    let explicit = content
        .selected_category
        .as_deref()
        .and_then(|name| find_by_name(&taxonomy.categories, name));
    if let Some(found) = explicit {
        labels.category_ids.push(found.id.clone());
        labels.source = CategorySource::Explicit;
    }

    let query = format!("{keyword} {}", plain_text(&content.markup));

    if labels.source == CategorySource::None && !taxonomy.categories.is_empty() {
        labels.category_ids = matcher.top_matches(&query, &taxonomy.categories, CATEGORY_MATCHES);
        if !labels.category_ids.is_empty() {
            labels.source = CategorySource::Matched;
        }
    }

    if !taxonomy.tags.is_empty() {
        labels.tag_ids = matcher.best_match(&query, &taxonomy.tags).into_iter().collect();
    }

    with_default(labels, taxonomy, default_category)
}

fn with_default(mut labels: Labels, taxonomy: &Taxonomy, default_category: Option<&str>) -> Labels {
    if labels.source != CategorySource::None {
        return labels;
    }
    if let Some(found) = default_category.and_then(|name| find_by_name(&taxonomy.categories, name)) {
        debug!(category = %found.name, "using default category");
        labels.category_ids.push(found.id.clone());
        labels.source = CategorySource::Default;
    }
    labels
}

fn find_by_name<'a>(candidates: &'a [Candidate], name: &str) -> Option<&'a Candidate> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    candidates
        .iter()
        .find(|c| c.name.trim().eq_ignore_ascii_case(name))
}
