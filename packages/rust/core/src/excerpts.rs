//! Select source excerpts for each planned section.
//!
//! The scraped corpus is split into sentence-aligned chunks, then each plan
//! heading picks the chunks that score best against `"{keyword} {heading}"`.

use std::sync::LazyLock;

use postforge_matcher::{DEFAULT_THRESHOLD, rank};
use postforge_shared::{BlogPlan, ScrapedDocument, SectionExcerpts};
use regex::Regex;

/// Split `text` into chunks of at most `max_chars` characters, breaking on
/// sentence ends where possible.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    static SENTENCE_END: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[.!?]+\s+").expect("valid regex"));

    let max_chars = max_chars.max(1);
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        sentences.push(&text[start..m.end()]);
        start = m.end();
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let len = sentence.chars().count();
        if len > max_chars {
            flush(&mut chunks, &mut current);
            let chars: Vec<char> = sentence.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect::<String>());
            }
            continue;
        }
        let joined = if current.is_empty() {
            len
        } else {
            current.chars().count() + 1 + len
        };
        if joined > max_chars {
            flush(&mut chunks, &mut current);
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    flush(&mut chunks, &mut current);
    chunks
}

fn flush(chunks: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

/// Per-heading excerpts from the corpus, best match first.
pub fn select_excerpts(
    keyword: &str,
    plan: &BlogPlan,
    corpus: &[ScrapedDocument],
    max_excerpts: usize,
    chunk_size: usize,
) -> Vec<SectionExcerpts> {
    let chunks: Vec<String> = corpus
        .iter()
        .flat_map(|doc| chunk_text(&doc.text, chunk_size))
        .collect();

    plan.headings
        .iter()
        .map(|heading| {
            let query = format!("{keyword} {heading}");
            let excerpts = rank(&query, &chunks, DEFAULT_THRESHOLD, max_excerpts)
                .into_iter()
                .map(|(idx, _)| chunks[idx].clone())
                .collect();
            SectionExcerpts {
                heading: heading.clone(),
                excerpts,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_sentence_boundaries() {
        let text = "First sentence here. Second one! Third? Fourth sentence is last.";
        let chunks = chunk_text(text, 40);
        assert_eq!(
            chunks,
            vec![
                "First sentence here. Second one! Third?",
                "Fourth sentence is last."
            ]
        );
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
    }

    #[test]
    fn overlong_sentence_is_split() {
        let text = "a".repeat(25);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "aaaaa");
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("   ", 100).is_empty());
    }

    #[test]
    fn excerpts_follow_headings() {
        let plan = BlogPlan {
            title: "Acme".into(),
            headings: vec!["History".into(), "Products".into()],
            image_prompts: vec![],
        };
        let corpus = vec![ScrapedDocument {
            title: "Acme".into(),
            url: "https://acme.com".into(),
            text: "Acme history began in 1950 with rockets. Acme products include anvils and \
                   rockets. Weather today is sunny."
                .into(),
        }];

        let sections = select_excerpts("acme", &plan, &corpus, 10, 60);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].heading, "History");
        assert!(sections[0].excerpts[0].contains("history"));
        assert!(sections[1].excerpts[0].contains("products"));
        assert!(
            !sections
                .iter()
                .flat_map(|s| &s.excerpts)
                .any(|e| e.contains("Weather"))
        );
    }
}
