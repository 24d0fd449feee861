//! Process-wide cap on concurrent image generation calls.

use std::sync::Arc;

use async_trait::async_trait;
use postforge_shared::{PostForgeError, Result};
use tokio::sync::Semaphore;

use crate::traits::ImageGenerator;

/// Wraps an [`ImageGenerator`] so at most `limit` calls run at once,
/// no matter how many keywords are in flight.
pub struct ThrottledImages {
    inner: Arc<dyn ImageGenerator>,
    permits: Arc<Semaphore>,
}

impl ThrottledImages {
    pub fn new(inner: Arc<dyn ImageGenerator>, limit: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl ImageGenerator for ThrottledImages {
    async fn generate_image(&self, prompt: &str) -> Result<Option<String>> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PostForgeError::provider("images", "image limiter closed"))?;
        self.inner.generate_image(prompt).await
    }
}
