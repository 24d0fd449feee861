//! DuckDuckGo HTML search.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use postforge_core::SearchProvider;
use postforge_shared::{PostForgeError, Result, SearchConfig};
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, instrument};
use url::Url;

/// Result links kept per query, before link extraction narrows them down.
const MAX_RESULTS: usize = 25;

/// Hosts that belong to the search engine itself.
const ENGINE_HOSTS: &[&str] = &["duckduckgo.com", "duck.co"];

pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
}

impl DuckDuckGoSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(3))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| PostForgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    #[instrument(skip_all, fields(keyword = %keyword))]
    async fn search(&self, keyword: &str, country: &str, language: &str) -> Result<Vec<String>> {
        let region = format!("{country}-{language}");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", keyword), ("kl", region.as_str())])
            .send()
            .await
            .map_err(|e| PostForgeError::Network(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostForgeError::provider(
                "duckduckgo",
                format!("HTTP {status}"),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PostForgeError::Network(format!("search body read failed: {e}")))?;
        let links = parse_results(&body, MAX_RESULTS);
        debug!(results = links.len(), "search complete");
        Ok(links)
    }
}

/// Result URLs from a DuckDuckGo HTML results page, in page order.
pub(crate) fn parse_results(html: &str, max: usize) -> Vec<String> {
    static RESULT_LINK: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("a.result__a").expect("valid selector"));

    let doc = Html::parse_document(html);
    let mut links: Vec<String> = Vec::new();

    for el in doc.select(&RESULT_LINK) {
        if links.len() >= max {
            break;
        }
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_result_href(href) else {
            continue;
        };
        if !links.contains(&url) {
            links.push(url);
        }
    }
    links
}

/// Unwrap DuckDuckGo's `/l/?uddg=` redirect and drop engine-internal links.
fn resolve_result_href(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{href}")
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;

    let target = match url.query_pairs().find(|(k, _)| k == "uddg") {
        Some((_, v)) => Url::parse(&v).ok()?,
        None => url,
    };
    if target.scheme() != "http" && target.scheme() != "https" {
        return None;
    }
    let host = target.host_str()?.to_ascii_lowercase();
    if ENGINE_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{h}")))
    {
        return None;
    }
    Some(target.to_string())
}
