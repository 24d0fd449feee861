//! Page fetching and readable-text extraction.
//!
//! Fetches candidate pages concurrently, keeping at most as many requests in
//! flight as documents are still needed, and extracts the visible text of
//! the main content area.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use postforge_core::PageScraper;
use postforge_shared::{PostForgeError, Result, ScrapedDocument, SearchConfig};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::read_capped;

/// Pages larger than this are skipped.
const MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;

/// Elements whose text never counts as article content.
const HIDDEN_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "iframe",
];

pub struct PageFetcher {
    client: Client,
    min_text_len: usize,
    max_body_bytes: u64,
    /// Allow localhost/private IPs (for tests with mock servers).
    allow_localhost: bool,
}

impl PageFetcher {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PostForgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            min_text_len: config.min_text_len,
            max_body_bytes: MAX_RESPONSE_SIZE,
            allow_localhost: false,
        })
    }

    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    #[cfg(test)]
    fn max_body_bytes(mut self, max: u64) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Fetch one page. `Ok(None)` means it had too little readable text.
    async fn fetch(&self, url: Url) -> Result<Option<ScrapedDocument>> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| PostForgeError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostForgeError::Network(format!("{url}: HTTP {status}")));
        }
        let body = read_capped(response, self.max_body_bytes, url.as_str()).await?;
        let body = String::from_utf8_lossy(&body);

        let doc = Html::parse_document(&body);
        let text = extract_text(&doc);
        if text.chars().count() < self.min_text_len {
            debug!(%url, chars = text.len(), "too little text");
            return Ok(None);
        }

        Ok(Some(ScrapedDocument {
            title: extract_title(&doc).unwrap_or_else(|| url.to_string()),
            url: url.to_string(),
            text,
        }))
    }
}

#[async_trait]
impl PageScraper for PageFetcher {
    #[instrument(skip_all, fields(urls = urls.len(), target = target_count))]
    async fn scrape(&self, urls: &[String], target_count: usize) -> Result<Vec<ScrapedDocument>> {
        let mut queue: VecDeque<Url> = urls
            .iter()
            .filter_map(|raw| Url::parse(raw).ok())
            .filter(|url| {
                let blocked = !self.allow_localhost && is_ssrf_target(url);
                if blocked {
                    warn!(%url, "SSRF protection: blocked");
                }
                !blocked
            })
            .collect();

        let mut docs = Vec::new();
        let mut failed = 0usize;

        while docs.len() < target_count && !queue.is_empty() {
            let needed = target_count - docs.len();
            let round: Vec<Url> = queue.drain(..needed.min(queue.len())).collect();

            let results: Vec<(Url, Result<Option<ScrapedDocument>>)> = stream::iter(round)
                .map(|url| async move {
                    let result = self.fetch(url.clone()).await;
                    (url, result)
                })
                .buffered(needed)
                .collect()
                .await;

            for (url, result) in results {
                match result {
                    Ok(Some(doc)) if docs.len() < target_count => docs.push(doc),
                    Ok(Some(_)) => {}
                    Ok(None) => failed += 1,
                    Err(e) => {
                        debug!(%url, error = %e, "fetch failed");
                        failed += 1;
                    }
                }
            }
        }

        info!(documents = docs.len(), skipped = failed, "scrape finished");
        Ok(docs)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Visible text of the main content area, whitespace collapsed.
fn extract_text(doc: &Html) -> String {
    static CONTENT: LazyLock<Vec<Selector>> = LazyLock::new(|| {
        ["main", "article", r#"[role="main"]"#, "body"]
            .iter()
            .map(|s| Selector::parse(s).expect("valid selector"))
            .collect()
    });

    for sel in CONTENT.iter() {
        if let Some(root) = doc.select(sel).next() {
            let text = visible_text(root);
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut words: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| HIDDEN_TAGS.contains(&e.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

fn extract_title(doc: &Html) -> Option<String> {
    static TITLE: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("title, h1").expect("valid selector"));

    doc.select(&TITLE)
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .find(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    let Some(host) = url.host_str() else {
        return true;
    };
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return is_private_ip(&ip);
    }
    host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
