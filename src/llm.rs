//! LLM provider abstraction
//!
//! The coordinator only needs a token stream; providers translate the
//! conversation history into their wire format and stream text back.

mod anthropic;
mod error;
mod types;

pub use anthropic::AnthropicService;
pub use error::{LlmError, LlmErrorKind};
pub use types::*;

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

/// Source of model output for one generation
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a token stream for the request
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        (**self).stream(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Logging wrapper for model clients
pub struct LoggingModelClient {
    inner: Arc<dyn ModelClient>,
    model_id: String,
}

impl LoggingModelClient {
    pub fn new(inner: Arc<dyn ModelClient>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl ModelClient for LoggingModelClient {
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream, LlmError> {
        let start = Instant::now();
        let result = self.inner.stream(request).await;
        let duration = start.elapsed();

        match result {
            Ok(stream) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    messages = request.messages.len(),
                    "Model stream opened"
                );
                let model_id = self.model_id.clone();
                let mut tokens = 0usize;
                let logged = stream.inspect(move |item| match item {
                    Ok(_) => tokens += 1,
                    Err(e) => tracing::error!(
                        model = %model_id,
                        tokens,
                        error = %e.message,
                        retryable = e.kind.is_retryable(),
                        "Model stream failed"
                    ),
                });
                Ok(Box::pin(logged))
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "Model stream failed to open"
                );
                Err(e)
            }
        }
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
