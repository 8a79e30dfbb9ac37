//! Lifecycle of one streamed analysis.
//!
//! [`StreamSession`] is a synchronous state machine fed by whoever owns the
//! transport; [`driver`] wires it to an HTTP request and a [`Renderer`].

pub mod driver;
pub mod follow;
pub mod page;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{AbortHandle, Abortable};
use parking_lot::Mutex;

use crate::error::StreamError;
use crate::stream::{
    ChannelAccumulator, ChannelBuffers, ChunkPipeline, DeltaBatch, RawChunk, RenderSnapshot,
};

pub use driver::{
    drive_stream, run_analysis, spawn_analysis, AnalysisHandle, RenderUpdate, Renderer,
    SessionOutcome,
};
pub use follow::FollowThrottle;
pub use page::AnalysisPage;

/// Session lifecycle states. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Requesting => "requesting",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Shared cancellation token. Clones observe and trigger the same token.
///
/// Futures and streams wrapped with [`CancelToken::attach`] stop at their next
/// poll once the token is cancelled, which also drops (and so aborts) any
/// request they own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    attached: Mutex<Vec<AbortHandle>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` only for the first call.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        for handle in self.inner.attached.lock().drain(..) {
            handle.abort();
        }
        true
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Wrap a future or stream so that cancelling this token aborts it.
    pub fn attach<T>(&self, task: T) -> Abortable<T> {
        let (handle, registration) = AbortHandle::new_pair();
        let mut attached = self.inner.attached.lock();
        if self.is_cancelled() {
            handle.abort();
        } else {
            attached.push(handle);
        }
        Abortable::new(task, registration)
    }
}

/// Delivered once when a session fails, carrying whatever had accumulated.
#[derive(Debug)]
pub struct FailureReport {
    pub partial_answer_text: String,
    pub partial_reasoning_text: String,
    pub error: StreamError,
}

/// One in-flight analysis: pipeline state, channel buffers and lifecycle.
#[derive(Debug)]
pub struct StreamSession {
    state: SessionState,
    pipeline: ChunkPipeline,
    buffers: ChannelBuffers,
    batch: DeltaBatch,
    cancel: CancelToken,
    chunks_processed: u64,
    bytes_received: u64,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    #[must_use]
    pub fn new() -> Self {
        Self::with_cancel_token(CancelToken::new())
    }

    /// Create a session observing an externally held cancellation token.
    #[must_use]
    pub fn with_cancel_token(cancel: CancelToken) -> Self {
        Self {
            state: SessionState::Idle,
            pipeline: ChunkPipeline::new(),
            buffers: ChannelBuffers::new(),
            batch: DeltaBatch::new(),
            cancel,
            chunks_processed: 0,
            bytes_received: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.sync_cancel_state()
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[must_use]
    pub fn buffers(&self) -> &ChannelBuffers {
        &self.buffers
    }

    #[must_use]
    pub fn snapshot(&self) -> RenderSnapshot {
        self.buffers.snapshot()
    }

    #[must_use]
    pub fn chunks_processed(&self) -> u64 {
        self.chunks_processed
    }

    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    #[must_use]
    pub fn malformed_lines(&self) -> u64 {
        self.pipeline.parser().malformed_lines()
    }

    /// `Idle → Requesting`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidState`] from any other state.
    pub fn begin_request(&mut self) -> Result<(), StreamError> {
        self.refresh_cancel_state();
        if self.state != SessionState::Idle {
            return Err(StreamError::InvalidState(format!(
                "cannot start a request from state '{}'",
                self.state
            )));
        }
        self.state = SessionState::Requesting;
        Ok(())
    }

    /// Process one transport chunk.
    ///
    /// Returns the updated snapshot when the chunk was processed, or `None`
    /// when the session is cancelled or already finished.
    pub fn on_chunk(&mut self, chunk: &RawChunk) -> Option<RenderSnapshot> {
        self.refresh_cancel_state();
        match self.state {
            SessionState::Requesting | SessionState::Streaming => {}
            SessionState::Idle => {
                tracing::warn!("chunk received before the request started; ignoring");
                return None;
            }
            _ => return None,
        }
        self.state = SessionState::Streaming;
        self.chunks_processed += 1;
        self.bytes_received += chunk.len() as u64;

        self.batch.clear();
        self.pipeline.process(chunk, &mut self.batch);
        self.apply_batch();
        Some(self.buffers.snapshot())
    }

    /// Transport failed. Moves to `Failed` and returns the report once.
    pub fn on_transport_error(&mut self, error: StreamError) -> Option<FailureReport> {
        self.refresh_cancel_state();
        if self.state.is_terminal() {
            tracing::debug!(state = %self.state, error = %error, "transport error after session ended");
            return None;
        }
        tracing::warn!(error = %error, chunks = self.chunks_processed, "analysis stream failed");
        self.state = SessionState::Failed;
        Some(self.failure_report(error))
    }

    /// Transport reached end of body.
    ///
    /// Flushes any carried-over bytes and the pending line. If no terminal
    /// event was ever seen the session fails with [`StreamError::PrematureEnd`].
    /// Returns the snapshot when the flush completed the session.
    pub fn on_transport_end(&mut self) -> Result<Option<RenderSnapshot>, FailureReport> {
        self.refresh_cancel_state();
        if self.state.is_terminal() {
            return Ok(None);
        }
        self.batch.clear();
        self.pipeline.finish(&mut self.batch);
        self.apply_batch();
        if self.state == SessionState::Completed {
            return Ok(Some(self.buffers.snapshot()));
        }
        match self.on_transport_error(StreamError::PrematureEnd) {
            Some(report) => Err(report),
            None => Ok(None),
        }
    }

    /// Cancel the session. Idempotent; a no-op once completed or failed.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel.cancel();
        self.state = SessionState::Cancelled;
        tracing::debug!(chunks = self.chunks_processed, "analysis session cancelled");
    }

    fn apply_batch(&mut self) {
        let Some(applied) = ChannelAccumulator::apply(&mut self.buffers, &self.batch) else {
            return;
        };
        if applied.completed_now {
            self.state = SessionState::Completed;
            tracing::info!(
                chunks = self.chunks_processed,
                bytes = self.bytes_received,
                answer_len = self.buffers.answer().len(),
                reasoning_len = self.buffers.reasoning().len(),
                malformed_lines = self.pipeline.parser().malformed_lines(),
                "analysis stream completed"
            );
        }
    }

    fn refresh_cancel_state(&mut self) {
        self.state = self.sync_cancel_state();
    }

    fn sync_cancel_state(&self) -> SessionState {
        if self.cancel.is_cancelled() && !self.state.is_terminal() {
            SessionState::Cancelled
        } else {
            self.state
        }
    }

    fn failure_report(&self, error: StreamError) -> FailureReport {
        FailureReport {
            partial_answer_text: self.buffers.answer().to_owned(),
            partial_reasoning_text: self.buffers.reasoning().to_owned(),
            error,
        }
    }
}
