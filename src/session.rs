use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GenQueueError, Result};
use crate::extract::PromptExtractor;
use crate::llm::{Attachment, GenerationResult};
use crate::quota::QuotaLedger;
use crate::queue::{Pipeline, QueueCoordinator, QueueProgress};

/// What happened to a submitted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Several prompts were found and queued.
    Batch { batch_id: Uuid, count: usize },
    /// The message went out as one prompt and this is its result.
    Single(GenerationResult),
}

/// One signed-in user's entry point: splits a message into prompts and
/// routes it to the batch queue or straight to the pipeline.
pub struct Session {
    actor: Option<String>,
    extractor: PromptExtractor,
    queue: QueueCoordinator,
}

impl Session {
    pub fn new(actor: Option<String>, extractor: PromptExtractor, queue: QueueCoordinator) -> Self {
        Self {
            actor,
            extractor,
            queue,
        }
    }

    pub fn actor(&self) -> Option<&str> {
        self.actor.as_deref()
    }

    pub fn queue(&self) -> &QueueCoordinator {
        &self.queue
    }

    fn pipeline(&self) -> &Arc<Pipeline> {
        self.queue.pipeline()
    }

    /// Submit `text` with optional attachments.  In batch mode a message
    /// holding two or more prompts is queued; anything else is sent as a
    /// single prompt and awaited.
    pub async fn submit(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
        batch_mode: bool,
    ) -> Result<Submission> {
        let actor = self.actor.as_deref().ok_or(GenQueueError::NotAuthenticated)?;

        if batch_mode {
            let prompts = self.extractor.extract(text);
            debug!(actor, found = prompts.len(), "batch extraction");
            if prompts.len() > 1 {
                let count = prompts.len();
                let batch_id = self
                    .queue
                    .enqueue(actor, prompts, attachments)
                    .ok_or_else(|| GenQueueError::Config("batch was empty".into()))?;
                return Ok(Submission::Batch { batch_id, count });
            }
        }

        let prompt = text.trim();
        if prompt.is_empty() && attachments.is_empty() {
            return Err(GenQueueError::Config("nothing to submit".into()));
        }
        info!(actor, prompt_len = prompt.len(), attachments = attachments.len(), "single dispatch");
        let result = self.pipeline().dispatch(actor, prompt, &attachments).await;
        Ok(Submission::Single(result))
    }

    /// Balance of the signed-in user.
    pub async fn balance(&self) -> Result<i64> {
        let actor = self.actor.as_deref().ok_or(GenQueueError::NotAuthenticated)?;
        self.pipeline().gate().ledger().balance(actor).await
    }

    pub fn stop(&self) -> bool {
        self.queue.stop()
    }

    pub fn clear(&self) {
        self.queue.clear()
    }

    pub fn progress(&self) -> QueueProgress {
        self.queue.progress()
    }
}
