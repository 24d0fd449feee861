//! HTTP adapters for the collaborators the pipeline drives.
//!
//! - [`search`]: DuckDuckGo HTML search
//! - [`scraper`]: page fetching and readable-text extraction
//! - [`llm`]: OpenRouter chat completions for plans and article text
//! - [`images`]: submit-and-poll image generation plus re-hosting strategies

pub mod images;
pub mod llm;
pub mod scraper;
pub mod search;

pub use images::{FluxImageGenerator, ImageHost, LocalDirHost, PassthroughHost, image_host};
pub use llm::OpenRouterClient;
pub use scraper::PageFetcher;
pub use search::DuckDuckGoSearch;

use postforge_shared::{PostForgeError, Result};

/// Read an API key from the environment variable named in config.
pub(crate) fn api_key_from_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(PostForgeError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Read a response body, failing once it passes `max` bytes.
///
/// The declared length is checked up front, and the streamed total is
/// checked as chunks arrive, so unsized and chunked bodies are capped too.
pub(crate) async fn read_capped(
    mut response: reqwest::Response,
    max: u64,
    what: &str,
) -> Result<Vec<u8>> {
    if let Some(len) = response.content_length() {
        if len > max {
            return Err(PostForgeError::validation(format!(
                "{what}: response too large ({len} bytes)"
            )));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| PostForgeError::Network(format!("{what}: body read failed: {e}")))?
    {
        if (body.len() + chunk.len()) as u64 > max {
            return Err(PostForgeError::validation(format!(
                "{what}: response exceeds {max} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// First `max` characters of a response body, for error messages.
pub(crate) fn snippet(body: &str, max: usize) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
