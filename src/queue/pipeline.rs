use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::conversation::{ConversationSink, SinkEntry};
use crate::error::GenQueueError;
use crate::llm::{Attachment, GenerationBackend, GenerationRequest, GenerationResult, Role, Turn};
use crate::quota::{CANCEL_REASON, QuotaGate};

/// Liveness check consulted before credits are taken and before the
/// request is sent.
pub type Liveness<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// Work done for a single prompt: charge, generate, refund on failure,
/// deliver.  Shared by the batch queue and direct submissions.
pub struct Pipeline {
    gate: Arc<QuotaGate>,
    backend: Arc<dyn GenerationBackend>,
    sink: Arc<dyn ConversationSink>,
}

impl Pipeline {
    pub fn new(
        gate: Arc<QuotaGate>,
        backend: Arc<dyn GenerationBackend>,
        sink: Arc<dyn ConversationSink>,
    ) -> Self {
        Self {
            gate,
            backend,
            sink,
        }
    }

    pub fn gate(&self) -> &Arc<QuotaGate> {
        &self.gate
    }

    /// Record the user's prompt in the conversation.
    pub async fn announce(&self, actor: &str, prompt: &str, attachments: &[Attachment]) {
        if let Err(e) = self.sink.append(actor, SinkEntry::user(prompt, attachments)).await {
            error!(actor, err = %e, "failed to record prompt");
        }
    }

    /// Authorize, generate and refund.  Once `live` returns `false` nothing
    /// more is charged or sent, and credits already taken are returned.
    /// Never returns an error: every failure becomes a failed
    /// [`GenerationResult`].
    pub async fn run(
        &self,
        actor: &str,
        prompt: &str,
        attachments: &[Attachment],
        live: Liveness<'_>,
    ) -> GenerationResult {
        if !live() {
            debug!(actor, "dispatch cancelled before authorization");
            return GenerationResult::failure(&GenQueueError::Cancelled);
        }

        let auth = match self.gate.authorize(actor).await {
            Ok(auth) => auth,
            Err(e) => {
                info!(actor, err = %e, "generation not authorized");
                return GenerationResult::failure(&e);
            }
        };

        let history = self.context(actor, prompt).await;

        if !live() {
            debug!(actor, "dispatch cancelled after authorization, returning credits");
            if let Err(e) = self.gate.refund(&auth, CANCEL_REASON).await {
                error!(actor, amount = auth.amount, err = %e, "refund failed");
            }
            return GenerationResult::failure(&GenQueueError::Cancelled);
        }

        let req = GenerationRequest {
            prompt,
            attachments,
            history: &history,
        };

        match self.backend.generate(&req).await {
            Ok(generation) => {
                debug!(actor, fragments = generation.fragments.len(), "generation succeeded");
                GenerationResult::success(&generation)
            }
            Err(e) => {
                warn!(actor, backend = self.backend.name(), err = %e, "generation failed");
                if e.kind().is_refundable() {
                    self.gate.refund_failed_generation(&auth).await;
                }
                GenerationResult::failure(&e)
            }
        }
    }

    /// Earlier turns to send as context.  The just-announced prompt is the
    /// request itself, and inline image results are never uploaded again.
    async fn context(&self, actor: &str, prompt: &str) -> Vec<Turn> {
        let mut history = self.sink.history(actor).await.unwrap_or_else(|e| {
            warn!(actor, err = %e, "failed to load history, sending without context");
            Vec::new()
        });
        if history
            .last()
            .is_some_and(|t| t.role == Role::User && t.content == prompt)
        {
            history.pop();
        }
        history.retain(|t| !carries_inline_image(t));
        history
    }

    /// Hand a finished result to the conversation.
    pub async fn deliver(
        &self,
        actor: &str,
        prompt: &str,
        attachments: &[Attachment],
        result: &GenerationResult,
    ) {
        let entry = if result.ok {
            SinkEntry::assistant(result.content.clone())
        } else {
            SinkEntry::error(result.content.clone(), prompt, attachments)
        };
        if let Err(e) = self.sink.append(actor, entry).await {
            error!(actor, err = %e, "failed to deliver result");
        }
    }

    /// One prompt outside any batch: announce, run and deliver.
    pub async fn dispatch(&self, actor: &str, prompt: &str, attachments: &[Attachment]) -> GenerationResult {
        self.announce(actor, prompt, attachments).await;
        let result = self.run(actor, prompt, attachments, &|| true).await;
        self.deliver(actor, prompt, attachments, &result).await;
        result
    }
}

fn carries_inline_image(turn: &Turn) -> bool {
    turn.role == Role::Assistant
        && turn
            .content
            .lines()
            .any(|line| line.trim_start().starts_with("data:"))
}
