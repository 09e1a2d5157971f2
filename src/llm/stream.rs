use reqwest::Client;
use tracing::{debug, info, warn};

use super::payload::{self, ChatRequest};
use super::sse::StreamDecoder;
use super::{ApiSettings, Generation, GenerationRequest};
use crate::error::{GenQueueError, Result};

/// Backend for APIs that stream image frames as server-sent events.
///
/// Each `data:` frame may carry `{"data":[{"url"|"b64_json"}]}`; the body
/// ends with `data: [DONE]` or when the connection closes.
pub struct StreamBackend {
    client: Client,
    settings: ApiSettings,
}

impl StreamBackend {
    pub fn new(settings: ApiSettings) -> Result<Self> {
        let client = settings.http_client()?;

        info!(
            model = %settings.model,
            base_url = %settings.base_url,
            timeout_secs = settings.timeout.as_secs(),
            "stream backend initialized"
        );

        Ok(Self { client, settings })
    }

    pub async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation> {
        let url = self.settings.completions_url();
        let body = ChatRequest::build(&self.settings.model, req, true);

        debug!(
            model = %self.settings.model,
            prompt_len = req.prompt.len(),
            attachments = req.attachments.len(),
            "invoking streamed generation"
        );

        let mut resp = self
            .settings
            .authorize(self.client.post(&url))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenQueueError::Transport {
                status: e.status().map(|s| s.as_u16()),
                message: format!("request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            let error_msg = payload::error_message(&error_text);
            warn!(status = %status, error = %error_msg, "stream API error");
            return Err(GenQueueError::Transport {
                status: Some(status.as_u16()),
                message: error_msg,
            });
        }

        let mut decoder = StreamDecoder::new();
        let mut reads = 0usize;
        while let Some(chunk) = resp.chunk().await.map_err(|e| GenQueueError::Transport {
            status: None,
            message: format!("stream interrupted: {e}"),
        })? {
            reads += 1;
            decoder.feed(&chunk)?;
            if decoder.is_done() {
                break;
            }
        }

        let fragments = decoder.finish()?;
        info!(
            fragments = fragments.len(),
            reads,
            model = %self.settings.model,
            "stream completed"
        );

        Ok(Generation { fragments })
    }
}
