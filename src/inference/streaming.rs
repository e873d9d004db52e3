//! Streaming bridge
//!
//! Turns one blocking generation call into a cancellable, incrementally
//! consumed sequence of text snapshots.
//!
//! # Architecture
//!
//! The backend call runs on a dedicated worker thread. After every
//! generation step the backend invokes a [`StopCheckpoint`], which either
//! pushes the current token snapshot into a one-slot channel or tells the
//! backend to stop. The consumer side ([`StreamHandle`]) pulls snapshots,
//! decodes each one from the start of the sequence and yields the text.
//!
//! Every exit path (natural end, cancellation, failure, drop) closes the
//! channel and joins the worker before the handle reports
//! [`StreamState::Closed`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::inference::engine::{EngineError, InferenceBackend, Tokenizer};
use crate::types::request::{GenerationRequest, TokenId};

/// Capacity of the handoff channel between worker and consumer
const HANDOFF_CAPACITY: usize = 1;

/// Maps a decoded snapshot to the text shown to the user
pub type ResponseExtractor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Runs once the worker has been joined
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Every token generated so far, prompt included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResult {
    tokens: Vec<TokenId>,
}

impl PartialResult {
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn last_token(&self) -> Option<TokenId> {
        self.tokens.last().copied()
    }
}

/// Why the worker stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced its end-of-sequence token
    EndOfSequence,
    /// `max_new_tokens` was reached
    MaxNewTokens,
    /// Cancellation was requested or the consumer went away
    Cancelled,
}

/// Messages sent from the worker to the consumer
#[derive(Debug)]
pub enum StreamToken {
    /// Current token sequence
    Snapshot(PartialResult),
    /// Generation ended without error
    Done(FinishReason),
    /// Generation failed inside the worker
    Error(EngineError),
}

/// Decision returned to the backend after each generation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSignal {
    /// Keep generating
    Continue,
    /// Stop now and return what has been generated
    Stop,
    /// Stop now and fail the generation with the given reason
    Abort(String),
}

/// Capability the backend calls after every generation step
///
/// `tokens` is the full sequence so far (prompt included). For beam search
/// it is the current best beam.
pub trait StopCheckpoint: Send {
    fn on_step(&mut self, tokens: &[TokenId]) -> CheckpointSignal;
}

/// Shared cancellation flag for one generation
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation
    ///
    /// Returns `true` only for the call that actually set the flag.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A bare cancellation flag works as a checkpoint for non-streaming runs
impl StopCheckpoint for CancelHandle {
    fn on_step(&mut self, _tokens: &[TokenId]) -> CheckpointSignal {
        if self.is_cancelled() {
            CheckpointSignal::Stop
        } else {
            CheckpointSignal::Continue
        }
    }
}

/// Checkpoint installed by the bridge worker
struct HandoffCheckpoint {
    tx: mpsc::Sender<StreamToken>,
    cancel: CancelHandle,
    last_len: usize,
    steps: usize,
    stopped: bool,
}

impl HandoffCheckpoint {
    fn new(tx: mpsc::Sender<StreamToken>, cancel: CancelHandle) -> Self {
        Self {
            tx,
            cancel,
            last_len: 0,
            steps: 0,
            stopped: false,
        }
    }
}

impl StopCheckpoint for HandoffCheckpoint {
    fn on_step(&mut self, tokens: &[TokenId]) -> CheckpointSignal {
        self.steps += 1;

        if self.cancel.is_cancelled() {
            tracing::debug!("Generation stopped by user after {} steps", self.steps);
            self.stopped = true;
            return CheckpointSignal::Stop;
        }

        if tokens.len() < self.last_len {
            return CheckpointSignal::Abort(format!(
                "token snapshot shrank from {} to {} tokens",
                self.last_len,
                tokens.len()
            ));
        }
        self.last_len = tokens.len();

        // Blocks while the previous snapshot has not been consumed
        let snapshot = StreamToken::Snapshot(PartialResult::new(tokens.to_vec()));
        if self.tx.blocking_send(snapshot).is_err() {
            tracing::debug!("Receiver dropped, stopping generation");
            self.stopped = true;
            return CheckpointSignal::Stop;
        }

        CheckpointSignal::Continue
    }
}

/// Lifecycle of a [`StreamHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No worker started yet
    Idle,
    /// Worker is generating
    Running,
    /// Worker finished naturally, remaining items are being delivered
    Draining,
    /// Cancellation was requested
    Cancelled,
    /// Worker reported an error
    Failed,
    /// Worker joined and channel released
    Closed,
}

/// One in-flight generation
///
/// Iterating (or calling [`StreamHandle::next_text`]) yields the decoded text
/// of each snapshot. A failure is yielded once as `Err`; cancellation and
/// natural completion end the sequence without an error.
///
/// The `Iterator` implementation blocks the calling thread and must not be
/// used from inside an async runtime; use `next_text` there.
pub struct StreamHandle {
    id: Uuid,
    state: StreamState,
    request: Option<GenerationRequest>,
    backend: Arc<dyn InferenceBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    cancel: CancelHandle,
    rx: Option<mpsc::Receiver<StreamToken>>,
    worker: Option<JoinHandle<()>>,
    response: Option<ResponseExtractor>,
    on_closed: Option<CloseHook>,
    finish_reason: Option<FinishReason>,
    yielded: usize,
}

impl StreamHandle {
    /// Creates an idle stream for `request`
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        request: GenerationRequest,
    ) -> Self {
        Self::with_cancel_handle(backend, tokenizer, request, CancelHandle::new())
    }

    /// Creates an idle stream whose cancellation flag is shared with the caller
    pub fn with_cancel_handle(
        backend: Arc<dyn InferenceBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        request: GenerationRequest,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: StreamState::Idle,
            request: Some(request),
            backend,
            tokenizer,
            cancel,
            rx: None,
            worker: None,
            response: None,
            on_closed: None,
            finish_reason: None,
            yielded: 0,
        }
    }

    /// Applies `extractor` to every decoded snapshot before it is yielded
    pub fn with_response_extractor(mut self, extractor: ResponseExtractor) -> Self {
        self.response = Some(extractor);
        self
    }

    /// Runs `hook` after the worker thread has exited
    ///
    /// When the handle is dropped inside a tokio runtime the join happens on
    /// a blocking thread, so the hook may run after `drop` returns.
    pub fn on_closed(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_closed = Some(Box::new(hook));
    }

    /// Spawns the worker thread
    ///
    /// Only valid from [`StreamState::Idle`].
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != StreamState::Idle {
            return Err(EngineError::WorkerError(format!(
                "stream {} cannot start from state {:?}",
                self.id, self.state
            )));
        }
        let request = self.request.take().ok_or_else(|| {
            EngineError::WorkerError(format!("stream {} has no request", self.id))
        })?;

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        let backend = Arc::clone(&self.backend);
        let tokenizer = Arc::clone(&self.tokenizer);
        let cancel = self.cancel.clone();

        let worker = thread::Builder::new()
            .name(format!("generate-{}", &self.id.simple().to_string()[..8]))
            .spawn(move || worker_main(backend, tokenizer, request, tx, cancel))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        self.rx = Some(rx);
        self.worker = Some(worker);
        self.state = StreamState::Running;
        tracing::info!(stream = %self.id, "Generation stream started");
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// A cloneable view of this stream's cancellation flag
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Requests early termination
    ///
    /// Idempotent: only the first call has an effect. The worker stops at its
    /// next checkpoint; the consumer yields nothing further.
    pub fn cancel(&mut self) -> bool {
        let first = self.cancel.cancel();
        if first {
            tracing::info!(stream = %self.id, "Cancellation requested");
        }
        match self.state {
            StreamState::Idle => {
                self.state = StreamState::Cancelled;
                self.finish_reason = Some(FinishReason::Cancelled);
                self.close();
            }
            StreamState::Running => {
                self.state = StreamState::Cancelled;
                self.finish_reason = Some(FinishReason::Cancelled);
            }
            _ => {}
        }
        first
    }

    /// Why the stream ended, once known
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Number of text snapshots yielded so far
    pub fn items_yielded(&self) -> usize {
        self.yielded
    }

    /// Pulls the next text snapshot without blocking the async runtime
    pub async fn next_text(&mut self) -> Option<Result<String, EngineError>> {
        loop {
            match self.state {
                StreamState::Idle => {
                    if let Err(e) = self.start() {
                        self.state = StreamState::Failed;
                        return Some(Err(e));
                    }
                }
                StreamState::Running => {}
                StreamState::Draining | StreamState::Cancelled | StreamState::Failed => {
                    self.shutdown().await;
                    return None;
                }
                StreamState::Closed => return None,
            }

            if self.observe_cancel() {
                continue;
            }
            let message = match self.rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };
            if let Some(item) = self.on_message(message) {
                return Some(item);
            }
        }
    }

    /// Releases the channel and joins the worker on a blocking thread
    pub async fn shutdown(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.release_channel();
        let (id, worker, hook) = (self.id, self.worker.take(), self.on_closed.take());
        if let Err(e) = tokio::task::spawn_blocking(move || join_worker(id, worker, hook)).await {
            tracing::error!(stream = %self.id, "Failed to join worker: {}", e);
        }
        self.mark_closed();
    }

    /// Releases the channel and joins the worker, blocking the caller
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.release_channel();
        join_worker(self.id, self.worker.take(), self.on_closed.take());
        self.mark_closed();
    }

    fn observe_cancel(&mut self) -> bool {
        if self.state == StreamState::Running && self.cancel.is_cancelled() {
            self.state = StreamState::Cancelled;
            self.finish_reason = Some(FinishReason::Cancelled);
            return true;
        }
        false
    }

    /// Advances the state machine with one message from the worker
    ///
    /// Returns `None` when the message produced nothing to yield.
    fn on_message(
        &mut self,
        message: Option<StreamToken>,
    ) -> Option<Result<String, EngineError>> {
        if self.observe_cancel() {
            return None;
        }

        match message {
            Some(StreamToken::Snapshot(partial)) => {
                let ended = partial
                    .last_token()
                    .is_some_and(|token| self.tokenizer.is_end_of_sequence(token));
                if ended {
                    tracing::debug!(stream = %self.id, "End of sequence token encountered");
                    self.finish_reason = Some(FinishReason::EndOfSequence);
                    self.state = StreamState::Draining;
                    return None;
                }
                match self.tokenizer.decode(partial.tokens()) {
                    Ok(decoded) => {
                        self.yielded += 1;
                        let text = match &self.response {
                            Some(extract) => extract(&decoded),
                            None => decoded,
                        };
                        Some(Ok(text))
                    }
                    Err(e) => {
                        tracing::error!(stream = %self.id, "Failed to decode snapshot: {}", e);
                        self.cancel.cancel();
                        self.state = StreamState::Failed;
                        Some(Err(e))
                    }
                }
            }
            Some(StreamToken::Done(reason)) => {
                tracing::debug!(stream = %self.id, ?reason, "Worker finished");
                self.finish_reason = Some(reason);
                self.state = if reason == FinishReason::Cancelled {
                    StreamState::Cancelled
                } else {
                    StreamState::Draining
                };
                None
            }
            Some(StreamToken::Error(e)) => {
                tracing::error!(stream = %self.id, "Generation failed: {}", e);
                self.state = StreamState::Failed;
                Some(Err(e))
            }
            None => {
                self.state = StreamState::Failed;
                Some(Err(EngineError::WorkerError(
                    "worker exited without a final message".to_string(),
                )))
            }
        }
    }

    fn release_channel(&mut self) {
        if self.state == StreamState::Running {
            // Nobody will read further snapshots; let the worker stop early
            self.cancel.cancel();
        }
        if let Some(mut rx) = self.rx.take() {
            rx.close();
        }
    }

    fn mark_closed(&mut self) {
        self.state = StreamState::Closed;
        tracing::info!(
            stream = %self.id,
            items = self.yielded,
            reason = ?self.finish_reason,
            "Generation stream closed"
        );
    }
}

impl Iterator for StreamHandle {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                StreamState::Idle => {
                    if let Err(e) = self.start() {
                        self.state = StreamState::Failed;
                        return Some(Err(e));
                    }
                }
                StreamState::Running => {}
                StreamState::Draining | StreamState::Cancelled | StreamState::Failed => {
                    self.close();
                    return None;
                }
                StreamState::Closed => return None,
            }

            if self.observe_cancel() {
                continue;
            }
            let message = match self.rx.as_mut() {
                Some(rx) => rx.blocking_recv(),
                None => None,
            };
            if let Some(item) = self.on_message(message) {
                return Some(item);
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.release_channel();
        let (id, worker, hook) = (self.id, self.worker.take(), self.on_closed.take());
        match tokio::runtime::Handle::try_current() {
            // Joining inline would stall the runtime until the next checkpoint
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_worker(id, worker, hook));
            }
            Err(_) => join_worker(id, worker, hook),
        }
        self.mark_closed();
    }
}

fn join_worker(id: Uuid, worker: Option<JoinHandle<()>>, hook: Option<CloseHook>) {
    if let Some(worker) = worker {
        if worker.join().is_err() {
            tracing::error!(stream = %id, "Worker thread panicked");
        }
    }
    if let Some(hook) = hook {
        hook();
    }
}

/// Worker thread body
///
/// Runs the backend and reports exactly one terminal message. Panics inside
/// the backend are caught here and reported as failures.
fn worker_main(
    backend: Arc<dyn InferenceBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    request: GenerationRequest,
    tx: mpsc::Sender<StreamToken>,
    cancel: CancelHandle,
) {
    let mut checkpoint = HandoffCheckpoint::new(tx.clone(), cancel);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        backend.generate(&request, &mut checkpoint)
    }));

    let terminal = match outcome {
        Ok(Ok(tokens)) => {
            let reason = if checkpoint.stopped {
                FinishReason::Cancelled
            } else if tokens
                .last()
                .is_some_and(|&token| tokenizer.is_end_of_sequence(token))
            {
                FinishReason::EndOfSequence
            } else {
                FinishReason::MaxNewTokens
            };
            tracing::debug!(
                "Generation finished after {} steps ({:?})",
                checkpoint.steps,
                reason
            );
            StreamToken::Done(reason)
        }
        Ok(Err(e)) if checkpoint.stopped => {
            tracing::debug!("Backend returned an error after being stopped: {}", e);
            StreamToken::Done(FinishReason::Cancelled)
        }
        Ok(Err(e)) => StreamToken::Error(e),
        Err(payload) => StreamToken::Error(EngineError::GenerationFailed(format!(
            "generation panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };

    // The consumer may already be gone
    let _ = tx.blocking_send(terminal);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::{ScriptedBackend, WordTokenizer, EOS, EOT};
    use crate::types::request::SamplingParams;
    use std::sync::mpsc as std_mpsc;
    use std::time::{Duration, Instant};

    fn request(max_new_tokens: u32) -> GenerationRequest {
        let params = SamplingParams {
            max_new_tokens,
            ..Default::default()
        };
        GenerationRequest::new("prompt", params, true).expect("valid request")
    }

    fn stream(
        backend: ScriptedBackend,
        max_new_tokens: u32,
    ) -> (Arc<ScriptedBackend>, StreamHandle) {
        let backend = Arc::new(backend);
        let handle = StreamHandle::new(
            backend.clone(),
            Arc::new(WordTokenizer::new()),
            request(max_new_tokens),
        );
        (backend, handle)
    }

    #[test]
    fn test_stream_yields_growing_snapshots_until_eos() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12, EOS]), 16);
        handle.start().expect("start");

        let texts: Vec<String> = handle.by_ref().map(|r| r.expect("no error")).collect();

        assert_eq!(texts.len(), 3);
        for pair in texts.windows(2) {
            assert!(pair[1].len() >= pair[0].len());
        }
        assert!(!texts.last().expect("last").contains(WordTokenizer::EOS_TEXT));
        assert_eq!(handle.finish_reason(), Some(FinishReason::EndOfSequence));
        assert_eq!(handle.state(), StreamState::Closed);
    }

    #[test]
    fn test_end_of_turn_token_ends_stream() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, EOT, 12]), 16);

        let texts: Vec<String> = handle.by_ref().map(|r| r.expect("no error")).collect();

        assert_eq!(texts, vec!["<s> w10", "<s> w10 w11"]);
        assert!(texts.iter().all(|t| !t.contains(WordTokenizer::EOT_TEXT)));
        assert_eq!(handle.finish_reason(), Some(FinishReason::EndOfSequence));
    }

    #[test]
    fn test_single_token_stream_closes_naturally() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12]), 1);

        let items: Vec<_> = handle.by_ref().collect();

        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        assert_eq!(handle.finish_reason(), Some(FinishReason::MaxNewTokens));
        assert_eq!(handle.state(), StreamState::Closed);
    }

    #[test]
    fn test_cancel_before_any_item() {
        let (backend, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12]), 16);

        assert!(handle.cancel());
        assert_eq!(handle.state(), StreamState::Closed);
        assert!(handle.next().is_none());
        assert_eq!(handle.items_yielded(), 0);
        assert_eq!(handle.finish_reason(), Some(FinishReason::Cancelled));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_cancel_right_after_start_yields_nothing() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12]), 16);
        handle.start().expect("start");
        handle.cancel();

        let items: Vec<_> = handle.by_ref().collect();

        assert!(items.is_empty());
        assert_eq!(handle.state(), StreamState::Closed);
    }

    #[test]
    fn test_cancel_mid_stream_stops_worker() {
        let script: Vec<TokenId> = (10..60).collect();
        let (backend, mut handle) = stream(
            ScriptedBackend::new(script).with_step_delay(Duration::from_millis(2)),
            64,
        );
        handle.start().expect("start");

        let mut seen = 0;
        while let Some(item) = handle.next() {
            item.expect("no error");
            seen += 1;
            if seen == 3 {
                handle.cancel();
            }
        }

        assert_eq!(seen, 3);
        assert_eq!(handle.state(), StreamState::Closed);
        // The worker stops within a couple of checkpoints of the request
        assert!(backend.checkpoints() <= 6);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11]), 16);
        handle.start().expect("start");

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!handle.cancel_handle().cancel());
        assert_eq!(handle.state(), StreamState::Cancelled);
        assert!(handle.next().is_none());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let script: Vec<TokenId> = (10..200).collect();
        let (_, mut handle) = stream(
            ScriptedBackend::new(script).with_step_delay(Duration::from_millis(1)),
            256,
        );
        let cancel = handle.cancel_handle();

        let mut seen = 0;
        for item in handle.by_ref() {
            item.expect("no error");
            seen += 1;
            if seen == 5 {
                let cancel = cancel.clone();
                thread::spawn(move || cancel.cancel())
                    .join()
                    .expect("cancel thread");
            }
        }

        assert_eq!(seen, 5);
        assert_eq!(handle.finish_reason(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn test_failure_yields_exactly_one_error() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12, 13]).fail_at(2), 16);

        let items: Vec<_> = handle.by_ref().collect();

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(matches!(items[2], Err(EngineError::GenerationFailed(_))));
        assert!(handle.next().is_none());
        assert_eq!(handle.state(), StreamState::Closed);
    }

    #[test]
    fn test_panic_in_backend_is_reported() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11]).panic_at(1), 16);

        let items: Vec<_> = handle.by_ref().collect();

        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(EngineError::GenerationFailed(msg)) => assert!(msg.contains("panicked")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_shrinking_snapshot_aborts() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12]).shrink_at(1), 16);

        let items: Vec<_> = handle.by_ref().collect();

        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[test]
    fn test_drop_mid_stream_joins_worker() {
        let script: Vec<TokenId> = (10..200).collect();
        let (backend, mut handle) = stream(ScriptedBackend::new(script), 256);
        handle.start().expect("start");
        let _ = handle.next();

        drop(handle);

        assert!(backend.finished());
    }

    #[test]
    fn test_close_hook_runs_after_join() {
        let (backend, mut handle) = stream(ScriptedBackend::new(vec![10, 11, EOS]), 16);
        let (tx, rx) = std_mpsc::channel();
        let watched = backend.clone();
        handle.on_closed(move || {
            let _ = tx.send(watched.finished());
        });

        let _: Vec<_> = handle.by_ref().collect();

        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[tokio::test]
    async fn test_drop_inside_runtime_does_not_block() {
        let script: Vec<TokenId> = (10..20).collect();
        let (backend, mut handle) = stream(
            ScriptedBackend::new(script).with_step_delay(Duration::from_millis(400)),
            16,
        );
        let (tx, rx) = std_mpsc::channel();
        handle.on_closed(move || {
            let _ = tx.send(());
        });
        handle.next_text().await.expect("item").expect("ok");

        let dropped_at = Instant::now();
        drop(handle);
        assert!(dropped_at.elapsed() < Duration::from_millis(200));

        // The worker still exits at its next checkpoint
        let joined = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .expect("join");
        assert!(joined.is_ok());
        assert!(backend.finished());
        assert!(backend.checkpoints() <= 2);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10]), 16);
        handle.start().expect("start");
        assert!(matches!(handle.start(), Err(EngineError::WorkerError(_))));
    }

    #[test]
    fn test_response_extractor_applies_to_snapshots() {
        let (_, handle) = stream(ScriptedBackend::new(vec![10, 11]), 16);
        let mut handle = handle.with_response_extractor(Arc::new(|s: &str| s.to_uppercase()));

        let first = handle.next().expect("item").expect("ok");
        assert_eq!(first, first.to_uppercase());
    }

    #[tokio::test]
    async fn test_next_text_streams_in_async_context() {
        let (_, mut handle) = stream(ScriptedBackend::new(vec![10, 11, 12, EOS]), 16);

        let mut texts = Vec::new();
        while let Some(item) = handle.next_text().await {
            texts.push(item.expect("no error"));
        }

        assert_eq!(texts.len(), 3);
        assert_eq!(handle.state(), StreamState::Closed);
    }

    #[test]
    fn test_cancel_handle_as_checkpoint() {
        let mut cancel = CancelHandle::new();
        assert_eq!(cancel.on_step(&[1]), CheckpointSignal::Continue);
        cancel.cancel();
        assert_eq!(cancel.on_step(&[1]), CheckpointSignal::Stop);
    }
}
