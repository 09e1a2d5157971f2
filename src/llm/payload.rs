//! OpenAI-compatible request/response bodies.

use serde::{Deserialize, Serialize};

use super::context::{GenerationRequest, Role};

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize, PartialEq)]
pub(crate) struct ImageUrl {
    pub url: String,
}

impl<'a> ChatRequest<'a> {
    /// History first, then the current user message: prompt text (when
    /// non-empty) followed by one image part per attachment.
    pub fn build(model: &'a str, req: &GenerationRequest<'_>, stream: bool) -> Self {
        let mut messages: Vec<ChatMessage> = req
            .history
            .iter()
            .map(|turn| ChatMessage {
                role: turn.role.as_str(),
                content: vec![ContentPart::Text {
                    text: turn.content.clone(),
                }],
            })
            .collect();

        let mut content = Vec::with_capacity(req.attachments.len() + 1);
        if !req.prompt.is_empty() {
            content.push(ContentPart::Text {
                text: req.prompt.to_string(),
            });
        }
        content.extend(req.attachments.iter().map(|a| ContentPart::ImageUrl {
            image_url: ImageUrl { url: a.data_uri() },
        }));

        messages.push(ChatMessage {
            role: Role::User.as_str(),
            content,
        });

        Self {
            model,
            messages,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChoice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Pull a human-readable message out of an error body, falling back to the
/// raw text.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .map(|e| e.message)
        .unwrap_or_else(|| body.trim().to_string())
}
