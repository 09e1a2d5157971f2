use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An image supplied alongside a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name, kept for display and retry; never sent upstream.
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data,
        }
    }

    /// Read an image from disk, guessing its mime type from the extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { name, mime, data })
    }

    /// `data:<mime>;base64,<payload>` form used in request bodies.
    pub fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime,
            data_encoding::BASE64.encode(&self.data)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One earlier message replayed to the API as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Per-call inputs passed to every `GenerationBackend::generate` invocation.
///
/// All fields borrow from the caller for the duration of the request.
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    /// Sent after the prompt text, in this order.
    pub attachments: &'a [Attachment],
    /// Oldest first.
    pub history: &'a [Turn],
}
