use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenQueueError {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("insufficient balance: {balance} available, {required} required")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("transport error{}: {message}", status_suffix(.status))]
    Transport { status: Option<u16>, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("no result produced")]
    NoResultProduced,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("cancelled before dispatch")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GenQueueError>;

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Coarse classification of a failure, carried on failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientBalance,
    NotAuthenticated,
    Transport,
    MalformedResponse,
    NoResultProduced,
    Upstream,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether this failure ends the whole batch instead of just the item.
    pub fn halts_batch(self) -> bool {
        matches!(
            self,
            ErrorKind::InsufficientBalance | ErrorKind::NotAuthenticated | ErrorKind::Cancelled
        )
    }

    /// Whether credits taken for the item should be handed back.
    pub fn is_refundable(self) -> bool {
        !self.halts_batch()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::NotAuthenticated => "not_authenticated",
            ErrorKind::Transport => "transport",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::NoResultProduced => "no_result_produced",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl GenQueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenQueueError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            GenQueueError::NotAuthenticated => ErrorKind::NotAuthenticated,
            GenQueueError::Transport { .. } | GenQueueError::Http(_) => ErrorKind::Transport,
            GenQueueError::MalformedResponse(_) | GenQueueError::Json(_) => {
                ErrorKind::MalformedResponse
            }
            GenQueueError::NoResultProduced => ErrorKind::NoResultProduced,
            GenQueueError::Upstream(_) => ErrorKind::Upstream,
            GenQueueError::Cancelled => ErrorKind::Cancelled,
            GenQueueError::Config(_) | GenQueueError::Database(_) | GenQueueError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Message shown to the user in the conversation for a failed item.
    pub fn user_message(&self) -> String {
        match self {
            GenQueueError::InsufficientBalance { balance, required } => format!(
                "Not enough credits to continue: {balance} left, {required} needed per image. \
                 The remaining prompts were not sent."
            ),
            GenQueueError::NotAuthenticated => {
                "Please sign in before generating. Nothing was sent.".to_string()
            }
            GenQueueError::Cancelled => {
                "Cancelled before it was sent. No credits were spent.".to_string()
            }
            GenQueueError::NoResultProduced => {
                "The generation finished without producing an image. Credits were returned."
                    .to_string()
            }
            other if other.kind() == ErrorKind::Internal => {
                format!("Something went wrong before the request was sent: {other}.")
            }
            other => format!("Generation failed: {other}. Credits were returned."),
        }
    }
}
