use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::llm::{Attachment, Role, Turn};

/// One message handed to the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEntry {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    /// Prompt that produced this entry, kept on failures so it can be retried.
    pub prompt: Option<String>,
    pub is_error: bool,
}

impl SinkEntry {
    pub fn user(prompt: &str, attachments: &[Attachment]) -> Self {
        Self {
            role: Role::User,
            content: prompt.to_string(),
            attachments: attachments.iter().map(AttachmentRef::from).collect(),
            prompt: None,
            is_error: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            attachments: Vec::new(),
            prompt: None,
            is_error: false,
        }
    }

    /// Failed item: carries the original prompt and attachment references.
    pub fn error(message: impl Into<String>, prompt: &str, attachments: &[Attachment]) -> Self {
        Self {
            role: Role::Assistant,
            content: message.into(),
            attachments: attachments.iter().map(AttachmentRef::from).collect(),
            prompt: Some(prompt.to_string()),
            is_error: true,
        }
    }
}

/// Attachment as recorded in history: identity only, no bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    pub mime: String,
    pub size: usize,
}

impl From<&Attachment> for AttachmentRef {
    fn from(a: &Attachment) -> Self {
        Self {
            name: a.name.clone(),
            mime: a.mime.clone(),
            size: a.data.len(),
        }
    }
}

/// Where completed and failed results go.  Injected into the queue at
/// construction time.
#[async_trait::async_trait]
pub trait ConversationSink: Send + Sync {
    async fn append(&self, actor: &str, entry: SinkEntry) -> Result<()>;

    /// Earlier successful turns to send as context, oldest first.
    async fn history(&self, actor: &str) -> Result<Vec<Turn>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub attachments: Vec<AttachmentRef>,
    pub prompt: Option<String>,
    pub is_error: bool,
    pub created_at: String,
}

/// SQLite-backed conversation history with a per-user window.
pub struct ConversationMemory {
    db: Arc<Mutex<Connection>>,
    window_size: usize,
}

impl ConversationMemory {
    pub fn new(db: Arc<Mutex<Connection>>, window_size: usize) -> Self {
        Self { db, window_size }
    }

    /// Get the most recent messages for a user, oldest first.
    pub async fn recent(&self, actor: &str) -> Result<Vec<ConversationMessage>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, role, content, attachments, prompt, is_error, created_at
             FROM conversation_history
             WHERE user_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut messages = stmt
            .query_map(rusqlite::params![actor, self.window_size as i64], |row| {
                let attachments: String = row.get(3)?;
                Ok(ConversationMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    attachments: serde_json::from_str(&attachments).unwrap_or_default(),
                    prompt: row.get(4)?,
                    is_error: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Reverse so oldest is first
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait::async_trait]
impl ConversationSink for ConversationMemory {
    async fn append(&self, actor: &str, entry: SinkEntry) -> Result<()> {
        let attachments = serde_json::to_string(&entry.attachments)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO conversation_history (user_id, role, content, attachments, prompt, is_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                actor,
                entry.role.as_str(),
                entry.content,
                attachments,
                entry.prompt,
                entry.is_error
            ],
        )?;

        // Prune old messages beyond the window
        db.execute(
            "DELETE FROM conversation_history WHERE user_id = ?2 AND id NOT IN (
                SELECT id FROM conversation_history WHERE user_id = ?2 ORDER BY id DESC LIMIT ?1
            )",
            rusqlite::params![self.window_size as i64, actor],
        )?;

        Ok(())
    }

    async fn history(&self, actor: &str) -> Result<Vec<Turn>> {
        let messages = self.recent(actor).await?;
        Ok(messages
            .into_iter()
            .filter(|m| !m.is_error)
            .filter_map(|m| {
                Role::parse(&m.role).map(|role| Turn {
                    role,
                    content: m.content,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[tokio::test]
    async fn append_and_recent() {
        let conv = ConversationMemory::new(test_db(), 50);
        conv.append("u1", SinkEntry::user("hello", &[])).await.unwrap();
        conv.append("u1", SinkEntry::assistant("https://img/1.png")).await.unwrap();
        let msgs = conv.recent("u1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "hello");
        assert_eq!(msgs[1].role, "assistant");
        assert_eq!(msgs[1].content, "https://img/1.png");
    }

    #[tokio::test]
    async fn window_prunes_old_messages_per_user() {
        let conv = ConversationMemory::new(test_db(), 3);
        for i in 0..5 {
            conv.append("u1", SinkEntry::user(&format!("msg {i}"), &[])).await.unwrap();
        }
        conv.append("u2", SinkEntry::user("other", &[])).await.unwrap();

        let msgs = conv.recent("u1").await.unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].content, "msg 2");
        assert_eq!(msgs[2].content, "msg 4");
        assert_eq!(conv.recent("u2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_entries_keep_prompt_and_attachments() {
        let conv = ConversationMemory::new(test_db(), 50);
        let attachments = vec![Attachment::new("ref.png", "image/png", vec![0; 4])];
        conv.append(
            "u1",
            SinkEntry::error("Generation failed", "a castle at dusk", &attachments),
        )
        .await
        .unwrap();

        let msgs = conv.recent("u1").await.unwrap();
        assert!(msgs[0].is_error);
        assert_eq!(msgs[0].prompt.as_deref(), Some("a castle at dusk"));
        assert_eq!(
            msgs[0].attachments,
            vec![AttachmentRef {
                name: "ref.png".into(),
                mime: "image/png".into(),
                size: 4
            }]
        );
    }

    #[tokio::test]
    async fn history_skips_errors() {
        let conv = ConversationMemory::new(test_db(), 50);
        conv.append("u1", SinkEntry::user("first", &[])).await.unwrap();
        conv.append("u1", SinkEntry::error("boom", "first", &[])).await.unwrap();
        conv.append("u1", SinkEntry::user("second", &[])).await.unwrap();
        conv.append("u1", SinkEntry::assistant("https://img/2.png")).await.unwrap();

        let turns = conv.history("u1").await.unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "https://img/2.png"]);
        assert_eq!(turns[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn recent_empty() {
        let conv = ConversationMemory::new(test_db(), 50);
        assert!(conv.recent("nobody").await.unwrap().is_empty());
    }
}
