use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Idle,
    Processing,
    /// Stop requested; the in-flight item finishes, nothing after it runs.
    Stopping,
}

/// One queued prompt.  `attachments` overrides the batch-wide set when
/// present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub prompt: String,
    pub attachments: Option<Arc<[Attachment]>>,
}

impl From<String> for QueueItem {
    fn from(prompt: String) -> Self {
        Self {
            prompt,
            attachments: None,
        }
    }
}

/// Snapshot consumers read to render progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueProgress {
    pub total_count: usize,
    pub current_index: usize,
    pub is_processing: bool,
    pub status: QueueStatus,
    /// Set by `stop()`, cleared by the next `enqueue()` or `clear()`.
    pub stopped: bool,
}

impl QueueProgress {
    pub fn idle() -> Self {
        Self {
            total_count: 0,
            current_index: 0,
            is_processing: false,
            status: QueueStatus::Idle,
            stopped: false,
        }
    }
}

/// Mutable queue state.  Invariant: `cursor <= items.len()`, and the
/// status is `Idle` whenever `items` is empty.
#[derive(Debug)]
pub(crate) struct QueueState {
    pub actor: String,
    pub batch_id: Option<Uuid>,
    pub items: Vec<QueueItem>,
    pub cursor: usize,
    pub attachments: Arc<[Attachment]>,
    pub status: QueueStatus,
    pub stopped: bool,
    /// Bumped by every `enqueue()` and `clear()`; work tagged with an older
    /// epoch is stale.
    pub epoch: u64,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            actor: String::new(),
            batch_id: None,
            items: Vec::new(),
            cursor: 0,
            attachments: Arc::from(Vec::new()),
            status: QueueStatus::Idle,
            stopped: false,
            epoch: 0,
        }
    }
}

impl QueueState {
    /// Drop the batch and go idle.  Leaves `stopped` and `epoch` alone.
    pub fn reset(&mut self) {
        self.batch_id = None;
        self.items.clear();
        self.cursor = 0;
        self.attachments = Arc::from(Vec::new());
        self.status = QueueStatus::Idle;
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// Prompt and effective attachments at the cursor.
    pub fn current_item(&self) -> Option<(String, Arc<[Attachment]>)> {
        self.items.get(self.cursor).map(|item| {
            let attachments = item
                .attachments
                .clone()
                .unwrap_or_else(|| self.attachments.clone());
            (item.prompt.clone(), attachments)
        })
    }

    pub fn is_last(&self) -> bool {
        self.cursor + 1 >= self.items.len()
    }

    pub fn progress(&self) -> QueueProgress {
        QueueProgress {
            total_count: self.items.len(),
            current_index: self.cursor.min(self.items.len()),
            is_processing: self.status != QueueStatus::Idle && !self.items.is_empty(),
            status: self.status,
            stopped: self.stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(prompts: &[&str]) -> QueueState {
        QueueState {
            items: prompts.iter().map(|p| QueueItem::from(p.to_string())).collect(),
            status: QueueStatus::Processing,
            ..QueueState::default()
        }
    }

    #[test]
    fn empty_state_is_idle() {
        let state = QueueState::default();
        assert_eq!(state.progress(), QueueProgress::idle());
    }

    #[test]
    fn reset_clears_items_and_cursor() {
        let mut state = state_with(&["a", "b"]);
        state.cursor = 1;
        state.stopped = true;
        state.reset();
        let p = state.progress();
        assert_eq!(p.total_count, 0);
        assert_eq!(p.current_index, 0);
        assert!(!p.is_processing);
        assert!(p.stopped);
    }

    #[test]
    fn per_item_attachments_override_shared() {
        let shared: Arc<[Attachment]> = Arc::from(vec![Attachment::new("s.png", "image/png", vec![1])]);
        let own: Arc<[Attachment]> = Arc::from(vec![Attachment::new("o.png", "image/png", vec![2])]);
        let mut state = state_with(&["a"]);
        state.attachments = shared;
        state.items.push(QueueItem {
            prompt: "b".into(),
            attachments: Some(own),
        });

        let (_, first) = state.current_item().unwrap();
        assert_eq!(first[0].name, "s.png");
        state.cursor = 1;
        let (prompt, second) = state.current_item().unwrap();
        assert_eq!(prompt, "b");
        assert_eq!(second[0].name, "o.png");
        assert!(state.is_last());
    }
}
