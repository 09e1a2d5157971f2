use reqwest::Client;
use tracing::{debug, info, warn};

use super::payload::{self, ChatRequest, ChatResponse};
use super::{ApiSettings, Generation, GenerationRequest};
use crate::error::{GenQueueError, Result};

/// Backend for APIs that answer with one JSON chat completion.
///
/// The first choice's message content is the result (typically an image
/// URL or markdown referencing one).
pub struct ChatBackend {
    client: Client,
    settings: ApiSettings,
}

impl ChatBackend {
    pub fn new(settings: ApiSettings) -> Result<Self> {
        let client = settings.http_client()?;

        info!(
            model = %settings.model,
            base_url = %settings.base_url,
            timeout_secs = settings.timeout.as_secs(),
            "chat backend initialized"
        );

        Ok(Self { client, settings })
    }

    pub async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation> {
        let url = self.settings.completions_url();
        let body = ChatRequest::build(&self.settings.model, req, false);

        debug!(
            model = %self.settings.model,
            prompt_len = req.prompt.len(),
            attachments = req.attachments.len(),
            history = req.history.len(),
            "invoking chat completions"
        );

        let resp = self
            .settings
            .authorize(self.client.post(&url))
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
            warn!(status = %status, error = %error_msg, "chat API error");
            return Err(GenQueueError::Transport {
                status: Some(status.as_u16()),
                message: error_msg,
            });
        }

        let text = resp.text().await.map_err(|e| GenQueueError::Transport {
            status: Some(status.as_u16()),
            message: format!("failed to read response body: {e}"),
        })?;
        let content = parse_completion(&text)?;

        info!(
            response_len = content.len(),
            model = %self.settings.model,
            "chat response received"
        );

        Ok(Generation {
            fragments: vec![content],
        })
    }
}

/// Extract the first completion's content from a response body.
fn parse_completion(text: &str) -> Result<String> {
    if text.trim().is_empty() {
        return Err(GenQueueError::MalformedResponse("empty response body".into()));
    }

    let chat_resp: ChatResponse = serde_json::from_str(text)
        .map_err(|e| GenQueueError::MalformedResponse(format!("failed to parse response: {e}")))?;

    let choice = chat_resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenQueueError::MalformedResponse("response has no choices".into()))?;

    let content = choice.message.content.unwrap_or_default().trim().to_string();
    if content.is_empty() {
        return Err(GenQueueError::NoResultProduced);
    }
    Ok(content)
}
