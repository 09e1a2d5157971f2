//! Sequential batch dispatch.
//!
//! A [`QueueCoordinator`] owns one batch at a time.  A spawned driver task
//! walks the batch in order: the first item goes out immediately, every
//! later item waits out the pacing delay.  `stop()` lets the in-flight item
//! finish and prevents anything after it; `clear()` drops the batch at once
//! and bumps the epoch so a late result is discarded instead of delivered.

pub(crate) mod pacing;
mod pipeline;
mod state;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::llm::Attachment;
use pacing::Control;
use state::QueueState;

pub use pipeline::Pipeline;
pub use state::{QueueItem, QueueProgress, QueueStatus};

/// Owns the current batch and the task that drives it.
pub struct QueueCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: Arc<Pipeline>,
    pacing: Duration,
    state: Mutex<QueueState>,
    control: watch::Sender<Control>,
    progress: watch::Sender<QueueProgress>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// The item the driver is about to send.
struct Dispatch {
    actor: String,
    batch_id: Option<Uuid>,
    prompt: String,
    attachments: Arc<[Attachment]>,
    index: usize,
    total: usize,
}

impl QueueCoordinator {
    /// Create an idle coordinator.  `pacing` is the wait between the end of
    /// one item and the dispatch of the next.
    pub fn new(pipeline: Arc<Pipeline>, pacing: Duration) -> Self {
        let (control, _) = watch::channel(Control { epoch: 0, stop: false });
        let (progress, _) = watch::channel(QueueProgress::idle());
        Self {
            inner: Arc::new(Inner {
                pipeline,
                pacing,
                state: Mutex::new(QueueState::default()),
                control,
                progress,
                driver: Mutex::new(None),
            }),
        }
    }

    /// The pipeline items are dispatched through, also used for direct
    /// submissions.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// Replace any current batch with `prompts`, all sharing `attachments`,
    /// and start dispatching.  Returns the new batch id, or `None` when
    /// there was nothing to queue.
    pub fn enqueue(&self, actor: &str, prompts: Vec<String>, attachments: Vec<Attachment>) -> Option<Uuid> {
        let items = prompts.into_iter().map(QueueItem::from).collect();
        self.enqueue_items(actor, items, attachments)
    }

    /// Like [`enqueue`](Self::enqueue), but items may carry their own
    /// attachments.
    pub fn enqueue_items(
        &self,
        actor: &str,
        items: Vec<QueueItem>,
        attachments: Vec<Attachment>,
    ) -> Option<Uuid> {
        let mut state = self.inner.lock();
        state.epoch += 1;
        let epoch = state.epoch;
        if state.status != QueueStatus::Idle {
            info!(batch_id = ?state.batch_id, "replacing active batch");
        }
        state.reset();
        state.stopped = false;
        self.inner.control.send_replace(Control { epoch, stop: false });

        if items.is_empty() {
            self.inner.publish(&state);
            return None;
        }

        let batch_id = Uuid::new_v4();
        let count = items.len();
        state.actor = actor.to_string();
        state.batch_id = Some(batch_id);
        state.items = items;
        state.attachments = Arc::from(attachments);
        state.status = QueueStatus::Processing;
        self.inner.publish(&state);
        drop(state);

        info!(%batch_id, actor, count, "batch enqueued");

        let handle = tokio::spawn(drive(self.inner.clone(), epoch));
        // A replaced driver notices the new epoch and exits by itself.
        *self.inner.lock_driver() = Some(handle);
        Some(batch_id)
    }

    /// Prevent dispatch of anything after the in-flight item.  Returns
    /// `false` if there was no running batch.
    pub fn stop(&self) -> bool {
        let mut state = self.inner.lock();
        if state.status != QueueStatus::Processing {
            return false;
        }
        state.status = QueueStatus::Stopping;
        state.stopped = true;
        self.inner.control.send_modify(|c| c.stop = true);
        self.inner.publish(&state);
        info!(
            batch_id = ?state.batch_id,
            index = state.cursor + 1,
            total = state.items.len(),
            "batch stop requested"
        );
        true
    }

    /// Drop the batch immediately.  An item not yet sent is neither charged
    /// nor sent; a request already on the wire is left to finish but its
    /// result is thrown away.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.epoch += 1;
        let epoch = state.epoch;
        let dropped = state.items.len().saturating_sub(state.cursor);
        state.reset();
        state.stopped = false;
        self.inner.control.send_replace(Control { epoch, stop: false });
        self.inner.publish(&state);
        info!(dropped, "queue cleared");
    }

    /// Snapshot of the current batch.
    pub fn progress(&self) -> QueueProgress {
        self.inner.lock().progress()
    }

    /// Receive a new [`QueueProgress`] on every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueueProgress> {
        self.inner.progress.subscribe()
    }

    /// Id of the running batch, `None` when idle.
    pub fn batch_id(&self) -> Option<Uuid> {
        self.inner.lock().batch_id
    }

    /// Wait for the most recently started driver task to exit.
    pub async fn wait_finished(&self) {
        let handle = self.inner.lock_driver().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(err = %e, "queue driver task failed");
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &QueueState) {
        self.progress.send_replace(state.progress());
    }

    fn go_idle(&self, state: &mut QueueState) {
        state.reset();
        self.publish(state);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.lock().is_current(epoch)
    }

    /// Item at the cursor, if this driver should still send it.
    fn next_dispatch(&self, epoch: u64) -> Option<Dispatch> {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return None;
        }
        if state.status != QueueStatus::Processing {
            self.go_idle(&mut state);
            return None;
        }
        let Some((prompt, attachments)) = state.current_item() else {
            self.go_idle(&mut state);
            return None;
        };
        Some(Dispatch {
            actor: state.actor.clone(),
            batch_id: state.batch_id,
            prompt,
            attachments,
            index: state.cursor,
            total: state.items.len(),
        })
    }

    /// Bookkeeping after a delivered result.  Returns `true` when another
    /// item should follow after the pacing delay.
    fn finish_item(&self, epoch: u64, halted: bool) -> bool {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return false;
        }
        if halted {
            warn!(
                batch_id = ?state.batch_id,
                skipped = state.items.len() - state.cursor - 1,
                "batch halted"
            );
            self.go_idle(&mut state);
            return false;
        }
        if state.status == QueueStatus::Stopping {
            info!(batch_id = ?state.batch_id, "batch stopped");
            self.go_idle(&mut state);
            return false;
        }
        if state.is_last() {
            info!(batch_id = ?state.batch_id, total = state.items.len(), "batch finished");
            self.go_idle(&mut state);
            return false;
        }
        true
    }

    /// Move to the next item once the pacing delay has elapsed.
    fn advance(&self, epoch: u64) -> bool {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return false;
        }
        if state.status != QueueStatus::Processing {
            self.go_idle(&mut state);
            return false;
        }
        state.cursor += 1;
        self.publish(&state);
        true
    }

    /// The pacing delay was interrupted: settle a pending stop.
    fn settle_interrupted(&self, epoch: u64) {
        let mut state = self.lock();
        if state.is_current(epoch) && state.status == QueueStatus::Stopping {
            info!(batch_id = ?state.batch_id, "batch stopped during pacing");
            self.go_idle(&mut state);
        }
    }
}

/// Resets the queue if its driver unwinds without finishing the batch.
struct DriverGuard {
    inner: Arc<Inner>,
    epoch: u64,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if state.is_current(self.epoch) && state.status != QueueStatus::Idle {
            error!(batch_id = ?state.batch_id, "queue driver exited mid-batch, resetting queue");
            self.inner.go_idle(&mut state);
        }
    }
}

async fn drive(inner: Arc<Inner>, epoch: u64) {
    let _guard = DriverGuard {
        inner: inner.clone(),
        epoch,
    };
    let mut control = inner.control.subscribe();
    let pipeline = inner.pipeline.clone();

    while let Some(item) = inner.next_dispatch(epoch) {
        info!(
            batch_id = ?item.batch_id,
            index = item.index + 1,
            total = item.total,
            "dispatching queued prompt"
        );

        pipeline.announce(&item.actor, &item.prompt, &item.attachments).await;
        // A clear() during the announce must keep this item from being charged or sent.
        let live = || inner.is_current(epoch);
        let result = pipeline
            .run(&item.actor, &item.prompt, &item.attachments, &live)
            .await;

        if !inner.is_current(epoch) {
            debug!(
                batch_id = ?item.batch_id,
                epoch,
                index = item.index + 1,
                "discarding result of cleared batch"
            );
            return;
        }
        pipeline
            .deliver(&item.actor, &item.prompt, &item.attachments, &result)
            .await;

        let halted = result.error_kind.is_some_and(|k| k.halts_batch());
        if !inner.finish_item(epoch, halted) {
            return;
        }

        if !pacing::pace(inner.pacing, &mut control, epoch).await {
            inner.settle_interrupted(epoch);
            return;
        }
        if !inner.advance(epoch) {
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Doubles shared by the queue and session tests.

    use std::sync::{Arc, Mutex};

    use tokio::sync::{Notify, Semaphore, mpsc};
    use tokio::time::Instant;

    use crate::conversation::{ConversationSink, SinkEntry};
    use crate::db::test_db;
    use crate::error::{GenQueueError, Result};
    use crate::llm::{Generation, GenerationBackend, GenerationRequest, Role, Turn};
    use crate::quota::{QuotaGate, SqliteLedger};

    type Outcome = Box<dyn Fn(&str) -> Result<Generation> + Send + Sync>;

    #[derive(Debug, Clone)]
    pub struct Call {
        pub prompt: String,
        pub history_len: usize,
        pub at: Instant,
    }

    /// Backend whose answer is computed from the prompt.  A gated backend
    /// holds every request until [`release`](Self::release) is called.
    pub struct ScriptedBackend {
        outcome: Outcome,
        gate: Option<Semaphore>,
        calls: Mutex<Vec<Call>>,
        started_tx: mpsc::UnboundedSender<String>,
        started_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    }

    impl ScriptedBackend {
        pub fn with(outcome: impl Fn(&str) -> Result<Generation> + Send + Sync + 'static) -> Arc<Self> {
            Self::build(Box::new(outcome), None)
        }

        pub fn ok() -> Arc<Self> {
            Self::with(image_for)
        }

        pub fn failing(err: impl Fn() -> GenQueueError + Send + Sync + 'static) -> Arc<Self> {
            Self::with(move |_| Err(err()))
        }

        pub fn gated() -> Arc<Self> {
            Self::build(Box::new(image_for), Some(Semaphore::new(0)))
        }

        fn build(outcome: Outcome, gate: Option<Semaphore>) -> Arc<Self> {
            let (started_tx, started_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                outcome,
                gate,
                calls: Mutex::new(Vec::new()),
                started_tx,
                started_rx: Mutex::new(Some(started_rx)),
            })
        }

        /// Receiver of prompts as requests start.  Can be taken once.
        pub fn started(&self) -> mpsc::UnboundedReceiver<String> {
            self.started_rx.lock().unwrap().take().expect("started() taken twice")
        }

        pub fn release(&self, n: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(n);
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn prompts(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.prompt).collect()
        }

        pub fn history_lens(&self) -> Vec<usize> {
            self.calls().into_iter().map(|c| c.history_len).collect()
        }
    }

    fn image_for(prompt: &str) -> Result<Generation> {
        Ok(Generation {
            fragments: vec![format!("https://img/{prompt}.png")],
        })
    }

    #[async_trait::async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, req: &GenerationRequest<'_>) -> Result<Generation> {
            self.calls.lock().unwrap().push(Call {
                prompt: req.prompt.to_string(),
                history_len: req.history.len(),
                at: Instant::now(),
            });
            let _ = self.started_tx.send(req.prompt.to_string());
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            (self.outcome)(req.prompt)
        }
    }

    /// In-memory sink that keeps every entry.  A holding sink records the
    /// matching user prompt, then blocks that append until
    /// [`release`](Self::release).
    #[derive(Default)]
    pub struct RecordingSink {
        entries: Mutex<Vec<SinkEntry>>,
        hold: Option<Hold>,
    }

    struct Hold {
        prompt: String,
        reached: Notify,
        resume: Semaphore,
    }

    impl RecordingSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn holding(prompt: &str) -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(Vec::new()),
                hold: Some(Hold {
                    prompt: prompt.to_string(),
                    reached: Notify::new(),
                    resume: Semaphore::new(0),
                }),
            })
        }

        /// Resolves once the held prompt has been recorded.
        pub async fn held(&self) {
            if let Some(hold) = &self.hold {
                hold.reached.notified().await;
            }
        }

        pub fn release(&self) {
            if let Some(hold) = &self.hold {
                hold.resume.add_permits(1);
            }
        }

        pub fn entries(&self) -> Vec<SinkEntry> {
            self.entries.lock().unwrap().clone()
        }

        pub fn contents(&self) -> Vec<String> {
            self.entries().into_iter().map(|e| e.content).collect()
        }
    }

    #[async_trait::async_trait]
    impl ConversationSink for RecordingSink {
        async fn append(&self, _actor: &str, entry: SinkEntry) -> Result<()> {
            let hold = self
                .hold
                .as_ref()
                .filter(|h| entry.role == Role::User && entry.content == h.prompt);
            self.entries.lock().unwrap().push(entry);
            if let Some(hold) = hold {
                hold.reached.notify_one();
                hold.resume.acquire().await.unwrap().forget();
            }
            Ok(())
        }

        async fn history(&self, _actor: &str) -> Result<Vec<Turn>> {
            Ok(self
                .entries()
                .into_iter()
                .filter(|e| !e.is_error)
                .map(|e| Turn {
                    role: e.role,
                    content: e.content,
                })
                .collect())
        }
    }

    pub fn gate_with(initial: i64, cost: i64) -> Arc<QuotaGate> {
        Arc::new(QuotaGate::new(Arc::new(SqliteLedger::new(test_db(), initial)), cost))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{RecordingSink, ScriptedBackend, gate_with};
    use super::*;
    use crate::error::GenQueueError;
    use crate::llm::{Generation, GenerationBackend};
    use crate::quota::{QuotaGate, QuotaLedger};

    const PACING: Duration = Duration::from_secs(2);

    fn coordinator(
        gate: Arc<QuotaGate>,
        backend: Arc<dyn GenerationBackend>,
        sink: Arc<RecordingSink>,
    ) -> QueueCoordinator {
        QueueCoordinator::new(Arc::new(Pipeline::new(gate, backend, sink)), PACING)
    }

    fn prompts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn assert_consistent(p: &QueueProgress) {
        assert!(p.current_index <= p.total_count, "{p:?}");
        if p.total_count == 0 {
            assert!(!p.is_processing, "{p:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_item_is_not_paced_later_items_are() {
        let backend = ScriptedBackend::ok();
        let sink = RecordingSink::new();
        let queue = coordinator(gate_with(10, 1), backend.clone(), sink.clone());

        let start = tokio::time::Instant::now();
        let batch = queue.enqueue(
            "u1",
            prompts(&[
                "a very long prompt text exceeding twenty chars",
                "another long prompt text exceeding twenty chars",
            ]),
            vec![],
        );
        assert!(batch.is_some());
        queue.wait_finished().await;

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].at, start);
        assert!(calls[1].at - calls[0].at >= PACING);
        assert_eq!(queue.progress(), QueueProgress::idle());
        assert_eq!(queue.batch_id(), None);

        // results land in submission order
        assert_eq!(
            sink.contents(),
            vec![
                "a very long prompt text exceeding twenty chars",
                "https://img/a very long prompt text exceeding twenty chars.png",
                "another long prompt text exceeding twenty chars",
                "https://img/another long prompt text exceeding twenty chars.png",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn progress_tracks_the_cursor() {
        let backend = ScriptedBackend::gated();
        let mut started = backend.started();
        let sink = RecordingSink::new();
        let queue = coordinator(gate_with(10, 1), backend.clone(), sink);

        let mut rx = queue.subscribe();
        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let p = *rx.borrow_and_update();
                seen.push(p);
                if p.total_count == 0 {
                    break;
                }
            }
            seen
        });

        let batch = queue.enqueue("u1", prompts(&["first", "second"]), vec![]);
        assert_eq!(started.recv().await.as_deref(), Some("first"));
        assert_eq!(queue.batch_id(), batch);
        let p = queue.progress();
        assert_eq!((p.total_count, p.current_index, p.is_processing), (2, 0, true));

        backend.release(1);
        assert_eq!(started.recv().await.as_deref(), Some("second"));
        let p = queue.progress();
        assert_eq!((p.total_count, p.current_index, p.is_processing), (2, 1, true));

        backend.release(1);
        queue.wait_finished().await;
        assert_eq!(queue.progress(), QueueProgress::idle());

        let seen = observer.await.unwrap();
        assert!(!seen.is_empty());
        seen.iter().for_each(assert_consistent);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_current_item_finish_and_skips_the_rest() {
        let backend = ScriptedBackend::gated();
        let mut started = backend.started();
        let sink = RecordingSink::new();
        let queue = coordinator(gate_with(10, 1), backend.clone(), sink.clone());

        queue.enqueue("u1", prompts(&["one", "two", "three"]), vec![]);
        assert_eq!(started.recv().await.as_deref(), Some("one"));

        assert!(queue.stop());
        let p = queue.progress();
        assert_eq!(p.status, QueueStatus::Stopping);
        assert!(p.stopped);
        assert!(!queue.stop(), "second stop is a no-op");

        backend.release(1);
        queue.wait_finished().await;

        assert_eq!(backend.prompts(), vec!["one"]);
        assert_eq!(sink.contents(), vec!["one", "https://img/one.png"]);
        let p = queue.progress();
        assert_eq!(p.status, QueueStatus::Idle);
        assert_eq!(p.total_count, 0);
        assert!(p.stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_in_flight_result() {
        let backend = ScriptedBackend::gated();
        let mut started = backend.started();
        let sink = RecordingSink::new();
        let gate = gate_with(10, 1);
        let queue = coordinator(gate.clone(), backend.clone(), sink.clone());

        queue.enqueue("u1", prompts(&["one", "two"]), vec![]);
        assert_eq!(started.recv().await.as_deref(), Some("one"));

        queue.clear();
        assert_eq!(queue.progress(), QueueProgress::idle());

        backend.release(1);
        queue.wait_finished().await;

        assert_eq!(backend.prompts(), vec!["one"]);
        // only the announced prompt, no result
        assert_eq!(sink.contents(), vec!["one"]);
        assert_eq!(queue.progress(), QueueProgress::idle());
        // the discarded request was still paid for
        assert_eq!(gate.ledger().balance("u1").await.unwrap(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_while_announcing_charges_and_sends_nothing() {
        let backend = ScriptedBackend::ok();
        let sink = RecordingSink::holding("two");
        let gate = gate_with(10, 1);
        let queue = coordinator(gate.clone(), backend.clone(), sink.clone());

        queue.enqueue("u1", prompts(&["one", "two"]), vec![]);
        sink.held().await;
        queue.clear();
        sink.release();
        queue.wait_finished().await;

        assert_eq!(backend.prompts(), vec!["one"]);
        assert_eq!(gate.ledger().balance("u1").await.unwrap(), 9);
        assert_eq!(sink.contents(), vec!["one", "https://img/one.png", "two"]);
        assert_eq!(queue.progress(), QueueProgress::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_pacing_skips_remaining_items() {
        let backend = ScriptedBackend::ok();
        let mut started = backend.started();
        let sink = RecordingSink::new();
        let queue = coordinator(gate_with(10, 1), backend.clone(), sink.clone());

        let start = tokio::time::Instant::now();
        queue.enqueue("u1", prompts(&["one", "two", "three"]), vec![]);
        assert_eq!(started.recv().await.as_deref(), Some("one"));
        tokio::time::sleep(PACING / 2).await;

        assert!(queue.stop());
        queue.wait_finished().await;
        // the pacing wait is cut short
        assert!(start.elapsed() < PACING);

        let p = queue.progress();
        assert_eq!(p.status, QueueStatus::Idle);
        assert!(p.stopped);

        tokio::time::sleep(PACING * 2).await;
        assert_eq!(backend.prompts(), vec!["one"]);
        assert_eq!(sink.contents(), vec!["one", "https://img/one.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_during_pacing_prevents_next_dispatch() {
        let backend = ScriptedBackend::ok();
        let mut started = backend.started();
        let sink = RecordingSink::new();
        let queue = coordinator(gate_with(10, 1), backend.clone(), sink.clone());

        queue.enqueue("u1", prompts(&["one", "two"]), vec![]);
        assert_eq!(started.recv().await.as_deref(), Some("one"));
        tokio::time::sleep(PACING / 4).await;

        queue.clear();
        queue.wait_finished().await;
        tokio::time::sleep(PACING * 2).await;

        assert_eq!(backend.prompts(), vec!["one"]);
        assert_eq!(sink.contents(), vec!["one", "https://img/one.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_item_is_refunded_and_queue_advances() {
        let backend = ScriptedBackend::with(|prompt| {
            if prompt.contains("bad") {
                Err(GenQueueError::Transport {
                    status: Some(500),
                    message: "server error".into(),
                })
            } else {
                Ok(Generation {
                    fragments: vec![format!("https://img/{prompt}.png")],
                })
            }
        });
        let sink = RecordingSink::new();
        let gate = gate_with(10, 1);
        let queue = coordinator(gate.clone(), backend.clone(), sink.clone());

        queue.enqueue("u1", prompts(&["good one", "bad one", "good two"]), vec![]);
        queue.wait_finished().await;

        assert_eq!(backend.prompts(), vec!["good one", "bad one", "good two"]);
        assert_eq!(gate.ledger().balance("u1").await.unwrap(), 8);

        let errors: Vec<_> = sink.entries().into_iter().filter(|e| e.is_error).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].prompt.as_deref(), Some("bad one"));
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_balance_halts_with_one_message() {
        let backend = ScriptedBackend::ok();
        let sink = RecordingSink::new();
        let gate = gate_with(1, 1);
        let queue = coordinator(gate.clone(), backend.clone(), sink.clone());

        queue.enqueue("u1", prompts(&["one", "two", "three"]), vec![]);
        queue.wait_finished().await;

        assert_eq!(backend.prompts(), vec!["one"]);
        let errors: Vec<_> = sink.entries().into_iter().filter(|e| e.is_error).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].content.contains("Not enough credits"));
        assert_eq!(gate.ledger().balance("u1").await.unwrap(), 0);
        assert_eq!(queue.progress(), QueueProgress::idle());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_clears_prior_stop_flag() {
        let backend = ScriptedBackend::gated();
        let mut started = backend.started();
        let queue = coordinator(gate_with(10, 1), backend.clone(), RecordingSink::new());

        queue.enqueue("u1", prompts(&["one", "two"]), vec![]);
        started.recv().await;
        queue.stop();
        backend.release(1);
        queue.wait_finished().await;
        assert!(queue.progress().stopped);

        queue.enqueue("u1", prompts(&["three"]), vec![]);
        assert!(!queue.progress().stopped);
        backend.release(1);
        queue.wait_finished().await;
        assert_eq!(backend.prompts(), vec!["one", "three"]);
    }

    #[tokio::test]
    async fn empty_enqueue_and_idle_stop_do_nothing() {
        let queue = coordinator(gate_with(10, 1), ScriptedBackend::ok(), RecordingSink::new());
        assert_eq!(queue.enqueue("u1", vec![], vec![]), None);
        assert!(!queue.stop());
        assert_eq!(queue.progress(), QueueProgress::idle());
        queue.wait_finished().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_backend_leaves_queue_idle() {
        let backend = ScriptedBackend::with(|_| panic!("backend blew up"));
        let queue = coordinator(gate_with(10, 1), backend, RecordingSink::new());

        queue.enqueue("u1", prompts(&["one", "two"]), vec![]);
        queue.wait_finished().await;
        assert_eq!(queue.progress(), QueueProgress::idle());
    }
}
