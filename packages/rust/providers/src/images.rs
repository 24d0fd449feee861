//! Submit-and-poll image generation plus re-hosting strategies.
//!
//! The provider accepts a prompt, answers with a polling URL, and exposes a
//! short-lived sample URL once the render is ready. An [`ImageHost`] then
//! decides where the final URL points.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use postforge_core::ImageGenerator;
use postforge_shared::{ImageHostMode, ImagesConfig, PostForgeError, Result, expand_home};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::{api_key_from_env, read_capped, snippet};

const PROVIDER: &str = "flux";

/// Downloaded images larger than this are refused.
const MAX_IMAGE_SIZE: u64 = 20 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Hosting
// ---------------------------------------------------------------------------

/// Where a generated image ends up.
#[async_trait]
pub trait ImageHost: Send + Sync {
    /// Final public URL for the image currently at `source_url`.
    async fn host(&self, source_url: &str, prompt: &str) -> Result<String>;
}

/// Keep the provider URL.
pub struct PassthroughHost;

#[async_trait]
impl ImageHost for PassthroughHost {
    async fn host(&self, source_url: &str, _prompt: &str) -> Result<String> {
        Ok(source_url.to_string())
    }
}

/// Download into a local directory served under a public base URL.
pub struct LocalDirHost {
    client: Client,
    dir: PathBuf,
    public_base_url: String,
    max_bytes: u64,
}

impl LocalDirHost {
    pub fn new(dir: PathBuf, public_base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PostForgeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            max_bytes: MAX_IMAGE_SIZE,
        })
    }

    #[cfg(test)]
    fn max_bytes(mut self, max: u64) -> Self {
        self.max_bytes = max;
        self
    }
}

#[async_trait]
impl ImageHost for LocalDirHost {
    async fn host(&self, source_url: &str, prompt: &str) -> Result<String> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(|e| PostForgeError::Network(format!("image download failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PostForgeError::provider(
                PROVIDER,
                format!("image download HTTP {status}"),
            ));
        }

        let extension = extension_for(
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let bytes = read_capped(response, self.max_bytes, "image download").await?;

        let name = format!("{}.{extension}", file_stem(prompt, &bytes));
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PostForgeError::io(&self.dir, e))?;
        let path = self.dir.join(&name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PostForgeError::io(&path, e))?;

        debug!(path = %path.display(), size = bytes.len(), "image stored");
        Ok(format!("{}/{name}", self.public_base_url))
    }
}

/// Content-addressed file stem: identical renders share a file.
fn file_stem(prompt: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    digest[..24].to_string()
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        _ => "jpg",
    }
}

/// The host strategy selected by config.
pub fn image_host(config: &ImagesConfig) -> Result<Arc<dyn ImageHost>> {
    Ok(match config.host {
        ImageHostMode::Passthrough => Arc::new(PassthroughHost),
        ImageHostMode::Local => Arc::new(LocalDirHost::new(
            expand_home(&config.local_dir)?,
            &config.public_base_url,
        )?),
    })
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    prompt: &'a str,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: String,
    polling_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
    #[serde(default)]
    result: Option<PollResult>,
}

#[derive(Debug, Deserialize)]
struct PollResult {
    sample: Option<String>,
}

/// What one poll said about the render.
#[derive(Debug, PartialEq, Eq)]
enum RenderState {
    Ready(String),
    Moderated,
    Failed(String),
    Pending,
}

impl From<PollResponse> for RenderState {
    fn from(poll: PollResponse) -> Self {
        match poll.status.as_str() {
            "Ready" => match poll.result.and_then(|r| r.sample) {
                Some(url) => Self::Ready(url),
                None => Self::Failed("ready without a sample URL".into()),
            },
            "Request Moderated" | "Content Moderated" => Self::Moderated,
            "Error" | "Failed" | "Task not found" => Self::Failed(poll.status),
            _ => Self::Pending,
        }
    }
}

pub struct FluxImageGenerator {
    client: Client,
    api_key: String,
    endpoint: String,
    width: u32,
    height: u32,
    poll_interval: Duration,
    max_polls: u32,
    host: Arc<dyn ImageHost>,
}

impl FluxImageGenerator {
    pub fn new(config: &ImagesConfig, host: Arc<dyn ImageHost>) -> Result<Self> {
        let key = api_key_from_env(&config.api_key_env)?;
        Self::with_api_key(config, key, host)
    }

    pub fn with_api_key(
        config: &ImagesConfig,
        api_key: impl Into<String>,
        host: Arc<dyn ImageHost>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PostForgeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: config.endpoint.clone(),
            width: config.width,
            height: config.height,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls.max(1),
            host,
        })
    }

    async fn submit(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-key", &self.api_key)
            .json(&SubmitRequest {
                prompt,
                width: self.width,
                height: self.height,
            })
            .send()
            .await
            .map_err(|e| PostForgeError::Network(format!("{PROVIDER}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {}", snippet(&body, 200));
            return Err(if status.as_u16() == 402 {
                PostForgeError::quota(PROVIDER, message)
            } else {
                PostForgeError::provider(PROVIDER, message)
            });
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| PostForgeError::parse(format!("{PROVIDER} submit response: {e}")))?;
        debug!(task_id = %submitted.id, "render submitted");
        submitted
            .polling_url
            .ok_or_else(|| PostForgeError::parse(format!("{PROVIDER}: no polling_url in response")))
    }

    async fn poll(&self, polling_url: &str) -> Result<RenderState> {
        let response = self
            .client
            .get(polling_url)
            .header("x-key", &self.api_key)
            .send()
            .await
            .map_err(|e| PostForgeError::Network(format!("{PROVIDER} poll: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PostForgeError::provider(
                PROVIDER,
                format!("poll HTTP {status}"),
            ));
        }
        let poll: PollResponse = response
            .json()
            .await
            .map_err(|e| PostForgeError::parse(format!("{PROVIDER} poll response: {e}")))?;
        Ok(poll.into())
    }
}

#[async_trait]
impl ImageGenerator for FluxImageGenerator {
    #[instrument(skip_all, fields(prompt_len = prompt.len()))]
    async fn generate_image(&self, prompt: &str) -> Result<Option<String>> {
        let polling_url = self.submit(prompt).await?;

        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            match self.poll(&polling_url).await? {
                RenderState::Ready(sample) => {
                    info!(attempt, "render ready");
                    return self.host.host(&sample, prompt).await.map(Some);
                }
                RenderState::Moderated => {
                    warn!("render moderated, no image");
                    return Ok(None);
                }
                RenderState::Failed(status) => {
                    return Err(PostForgeError::provider(
                        PROVIDER,
                        format!("render failed: {status}"),
                    ));
                }
                RenderState::Pending => debug!(attempt, "render pending"),
            }
        }

        let waited = self.poll_interval.as_secs() * u64::from(self.max_polls);
        Err(PostForgeError::timeout("image render", waited))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ImagesConfig {
        ImagesConfig {
            endpoint: format!("{}/v1/flux-pro-1.1", server.uri()),
            poll_interval_ms: 5,
            max_polls: 3,
            ..ImagesConfig::default()
        }
    }

    fn generator(server: &MockServer, host: Arc<dyn ImageHost>) -> FluxImageGenerator {
        FluxImageGenerator::with_api_key(&config(server), "img-key", host).expect("client")
    }

    async fn mount_submit(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/flux-pro-1.1"))
            .and(header("x-key", "img-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "task-1",
                "polling_url": format!("{}/v1/get_result?id=task-1", server.uri()),
            })))
            .mount(server)
            .await;
    }

    async fn mount_poll(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/v1/get_result"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    #[test]
    fn poll_states() {
        let ready: PollResponse = serde_json::from_value(serde_json::json!({
            "status": "Ready", "result": { "sample": "https://cdn/x.jpg" }
        }))
        .expect("json");
        assert_eq!(RenderState::from(ready), RenderState::Ready("https://cdn/x.jpg".into()));

        for (status, expected) in [
            ("Pending", RenderState::Pending),
            ("Request Moderated", RenderState::Moderated),
            ("Error", RenderState::Failed("Error".into())),
        ] {
            let poll = PollResponse {
                status: status.into(),
                result: None,
            };
            assert_eq!(RenderState::from(poll), expected);
        }
    }

    #[test]
    fn extension_from_content_type() {
        assert_eq!(extension_for(Some("image/png")), "png");
        assert_eq!(extension_for(Some("image/webp; charset=binary")), "webp");
        assert_eq!(extension_for(None), "jpg");
    }

    #[tokio::test]
    async fn ready_render_returns_sample() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(
            &server,
            serde_json::json!({ "status": "Ready", "result": { "sample": "https://cdn.example/a.jpg" } }),
        )
        .await;

        let url = generator(&server, Arc::new(PassthroughHost))
            .generate_image("a rocket on a launch pad")
            .await
            .expect("image");
        assert_eq!(url.as_deref(), Some("https://cdn.example/a.jpg"));
    }

    #[tokio::test]
    async fn moderated_render_is_none() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(&server, serde_json::json!({ "status": "Request Moderated" })).await;

        let url = generator(&server, Arc::new(PassthroughHost))
            .generate_image("prompt")
            .await
            .expect("no error");
        assert_eq!(url, None);
    }

    #[tokio::test]
    async fn endless_pending_times_out() {
        let server = MockServer::start().await;
        mount_submit(&server).await;
        mount_poll(&server, serde_json::json!({ "status": "Pending" })).await;

        let err = generator(&server, Arc::new(PassthroughHost))
            .generate_image("prompt")
            .await
            .expect_err("timeout");
        assert!(matches!(err, PostForgeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn payment_required_is_quota() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_string("no credits"))
            .mount(&server)
            .await;

        let err = generator(&server, Arc::new(PassthroughHost))
            .generate_image("prompt")
            .await
            .expect_err("quota");
        assert!(err.is_quota());
    }

    #[tokio::test]
    async fn local_host_downloads_into_dir() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sample.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0x89, b'P', b'N', b'G']),
            )
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("pf_images_{}", Uuid::now_v7()));
        let host = LocalDirHost::new(dir.clone(), "https://img.example.com/media/").expect("host");
        let url = host
            .host(&format!("{}/sample.png", server.uri()), "prompt")
            .await
            .expect("hosted");

        assert!(url.starts_with("https://img.example.com/media/"));
        assert!(url.ends_with(".png"));
        let name = url.rsplit('/').next().expect("file name");
        let stored = std::fs::read(dir.join(name)).expect("file written");
        assert_eq!(stored, vec![0x89, b'P', b'N', b'G']);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn local_host_refuses_oversized_download() {
        let source = crate::tests::serve_unsized("image/png", vec![0u8; 16 * 1024]).await;
        let dir = std::env::temp_dir().join(format!("pf_images_{}", Uuid::now_v7()));
        let host = LocalDirHost::new(dir.clone(), "https://img.example.com")
            .expect("host")
            .max_bytes(4 * 1024);

        let err = host.host(&source, "prompt").await.expect_err("over cap");
        assert!(matches!(err, PostForgeError::Validation { .. }));
        assert!(!dir.exists());
    }

    #[test]
    fn host_strategy_from_config() {
        let config = ImagesConfig {
            host: ImageHostMode::Local,
            local_dir: std::env::temp_dir().display().to_string(),
            public_base_url: "https://img.example.com".into(),
            ..ImagesConfig::default()
        };
        assert!(image_host(&config).is_ok());
        assert!(image_host(&ImagesConfig::default()).is_ok());
    }
}
