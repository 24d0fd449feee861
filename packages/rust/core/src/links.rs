//! Reduce raw search results to a diverse set of scrapeable links.

use std::collections::HashSet;

use url::Url;

/// Hosts that never yield article text worth scraping.
const SOCIAL_DOMAINS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "linkedin.com",
    "pinterest.com",
    "reddit.com",
    "tiktok.com",
    "twitter.com",
    "x.com",
    "youtube.com",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx"];

/// At most `limit` http(s) links, one per base domain, in search order.
pub fn unique_links(results: &[String], limit: usize) -> Vec<String> {
    let mut seen_domains = HashSet::new();
    let mut links = Vec::new();

    for raw in results {
        if links.len() >= limit {
            break;
        }
        let Ok(url) = Url::parse(raw.trim()) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        let Some(host) = url.host_str() else {
            continue;
        };
        let host = host.to_ascii_lowercase();
        if is_social(&host) || is_document(&url) {
            continue;
        }
        if seen_domains.insert(base_domain(&host)) {
            links.push(url.to_string());
        }
    }

    links
}

/// Last two labels of `host`: `news.acme.com` and `acme.com` collide.
fn base_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }
    labels[labels.len() - 2..].join(".")
}

fn is_social(domain: &str) -> bool {
    SOCIAL_DOMAINS
        .iter()
        .any(|s| domain == *s || domain.ends_with(&format!(".{s}")))
}

fn is_document(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    DOCUMENT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn keeps_one_link_per_domain() {
        let results = strings(&[
            "https://www.acme.com/about",
            "https://acme.com/products",
            "https://news.example.org/acme",
        ]);
        assert_eq!(
            unique_links(&results, 10),
            strings(&["https://www.acme.com/about", "https://news.example.org/acme"])
        );
    }

    #[test]
    fn skips_social_documents_and_junk() {
        let results = strings(&[
            "https://m.facebook.com/acme",
            "https://x.com/acme",
            "https://acme.com/report.PDF",
            "ftp://files.acme.com/a",
            "not a url",
            "https://blog.acme.io/post",
        ]);
        assert_eq!(unique_links(&results, 10), strings(&["https://blog.acme.io/post"]));
    }

    #[test]
    fn subdomains_share_a_base_domain() {
        let results = strings(&["https://news.acme.com/a", "https://shop.acme.com/b"]);
        assert_eq!(unique_links(&results, 10), strings(&["https://news.acme.com/a"]));
        assert_eq!(base_domain("localhost"), "localhost");
    }

    #[test]
    fn respects_limit() {
        let results: Vec<String> = (0..20).map(|i| format!("https://site{i}.com/")).collect();
        assert_eq!(unique_links(&results, 10).len(), 10);
        assert!(unique_links(&results, 0).is_empty());
    }
}
