//! OpenRouter chat-completions client for plans and article text.

use std::time::Duration;

use async_trait::async_trait;
use postforge_core::{ContentGenerator, ContentRequest, PlanGenerator};
use postforge_shared::{BlogPlan, GeneratedContent, OpenRouterConfig, PostForgeError, Result};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{api_key_from_env, snippet};

const PROVIDER: &str = "openrouter";

/// Marker line the writer is asked to start its answer with.
const CATEGORY_MARKER: &str = "SELECTED_CATEGORY:";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: String,
}

/// Plan JSON as models actually return it: headings and prompts may be
/// plain strings or objects.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    title: String,
    #[serde(default)]
    headings: Vec<RawEntry>,
    #[serde(default)]
    image_prompts: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Text(String),
    Object {
        #[serde(default, alias = "prompt", alias = "heading")]
        title: String,
    },
}

impl RawEntry {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) | Self::Object { title: s } => s,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenRouterClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterClient {
    /// Build a client, reading the API key from the configured env var.
    pub fn new(config: &OpenRouterConfig) -> Result<Self> {
        let key = api_key_from_env(&config.api_key_env)?;
        Self::with_api_key(config, key)
    }

    pub fn with_api_key(config: &OpenRouterConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PostForgeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: config.default_model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| PostForgeError::config(format!("invalid API key: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-title", HeaderValue::from_static("PostForge"));
        Ok(headers)
    }

    /// One chat completion; returns the assistant message text.
    async fn complete(&self, system: &str, user: &str, json_mode: bool) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.7,
            response_format: json_mode.then(|| serde_json::json!({ "type": "json_object" })),
        };

        debug!(model = %self.model, json_mode, "chat request");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| PostForgeError::Network(format!("{PROVIDER}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PostForgeError::Network(format!("{PROVIDER}: body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| PostForgeError::parse(format!("{PROVIDER} response: {e}")))?;
        if let Some(err) = parsed.error {
            let code = err.code.as_u64().map(|c| c as u16).unwrap_or(500);
            return Err(classify_failure(code, &err.message));
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PostForgeError::provider(PROVIDER, "empty completion"))
    }
}

/// Map an HTTP status and error body to a typed error. Out-of-credit
/// responses become [`PostForgeError::QuotaExhausted`].
fn classify_failure(status: u16, body: &str) -> PostForgeError {
    let lowered = body.to_ascii_lowercase();
    if status == 402
        || lowered.contains("insufficient_quota")
        || lowered.contains("insufficient credits")
    {
        return PostForgeError::quota(PROVIDER, format!("HTTP {status}: {}", snippet(body, 200)));
    }
    PostForgeError::provider(PROVIDER, format!("HTTP {status}: {}", snippet(body, 200)))
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

const PLAN_SYSTEM: &str = "You are an editor planning SEO-friendly blog articles. \
                           Answer with a single JSON object and nothing else.";

fn plan_prompt(keyword: &str, language: &str) -> String {
    format!(
        "Plan a blog article about \"{keyword}\", written in {language}.\n\
         Return JSON with this shape:\n\
         {{\"title\": \"article title\", \"headings\": [\"section heading\", ...], \
         \"image_prompts\": [\"detailed realistic image description\", ...]}}\n\
         Use 6 to 7 descriptive headings without numbering and exactly two image prompts \
         that match the article content."
    )
}

/// The JSON object inside a model answer, tolerating code fences and chatter.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn parse_plan(raw: &str) -> Result<BlogPlan> {
    let json = extract_json(raw)
        .ok_or_else(|| PostForgeError::parse("plan response contains no JSON object"))?;
    let plan: RawPlan = serde_json::from_str(json)
        .map_err(|e| PostForgeError::parse(format!("plan JSON: {e}")))?;
    Ok(BlogPlan {
        title: plan.title,
        headings: plan.headings.into_iter().map(RawEntry::into_text).collect(),
        image_prompts: plan
            .image_prompts
            .into_iter()
            .map(RawEntry::into_text)
            .collect(),
    })
}

#[async_trait]
impl PlanGenerator for OpenRouterClient {
    #[instrument(skip_all, fields(keyword = %keyword))]
    async fn generate_plan(&self, keyword: &str, language: &str) -> Result<BlogPlan> {
        let raw = self
            .complete(PLAN_SYSTEM, &plan_prompt(keyword, language), true)
            .await?;
        parse_plan(&raw)
    }
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

const CONTENT_SYSTEM: &str = "You write well-structured HTML blog articles from research notes. \
                              Use <h2> for sections and <p> for paragraphs. \
                              Do not include <html>, <head> or <body> tags.";

fn content_prompt(request: &ContentRequest) -> String {
    let mut prompt = format!(
        "Write an article titled \"{}\" about \"{}\" in {}.\n",
        request.plan.title, request.keyword, request.language
    );

    if !request.categories.is_empty() {
        let names: Vec<&str> = request.categories.iter().map(|c| c.name.as_str()).collect();
        prompt.push_str(&format!(
            "Start your answer with one line `{CATEGORY_MARKER} <name>` choosing the best \
             category from: {}.\n",
            names.join(", ")
        ));
    }

    prompt.push_str("\nSections and source excerpts:\n");
    for section in &request.excerpts {
        prompt.push_str(&format!("\n## {}\n", section.heading));
        for excerpt in &section.excerpts {
            prompt.push_str(&format!("- {excerpt}\n"));
        }
    }
    prompt
}

/// Split the optional category line off the article markup.
fn parse_content(raw: &str) -> GeneratedContent {
    let mut selected_category = None;
    let mut body_lines = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if selected_category.is_none() {
            if let Some(name) = trimmed.strip_prefix(CATEGORY_MARKER) {
                let name = name.trim().trim_matches(|c| c == '[' || c == ']').trim();
                if !name.is_empty() {
                    selected_category = Some(name.to_string());
                }
                continue;
            }
        }
        if trimmed.starts_with("```") {
            continue;
        }
        body_lines.push(line);
    }

    GeneratedContent {
        markup: body_lines.join("\n").trim().to_string(),
        word_count: 0,
        selected_category,
    }
}

#[async_trait]
impl ContentGenerator for OpenRouterClient {
    #[instrument(skip_all, fields(keyword = %request.keyword))]
    async fn generate_content(&self, request: &ContentRequest) -> Result<GeneratedContent> {
        let raw = self
            .complete(CONTENT_SYSTEM, &content_prompt(request), false)
            .await?;
        Ok(parse_content(&raw))
    }
}
