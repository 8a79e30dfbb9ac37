//! Async driver connecting a [`StreamSession`] to an HTTP body stream.

use std::pin::pin;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;

use super::{CancelToken, FailureReport, FollowThrottle, SessionState, StreamSession};
use crate::error::StreamError;
use crate::observability::log_analysis_outcome;
use crate::protocol::chat::ChatCompletionRequest;
use crate::stream::{RawChunk, RenderSnapshot};
use crate::transport::HttpTransport;

/// One snapshot handed to the renderer, plus whether it should scroll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderUpdate {
    pub snapshot: RenderSnapshot,
    pub follow: bool,
}

/// Presentation sink for a running analysis.
///
/// Called from the driver task in chunk order. Nothing is delivered after
/// the session has been cancelled.
pub trait Renderer {
    fn on_update(&mut self, update: &RenderUpdate);

    fn on_failure(&mut self, report: &FailureReport);
}

/// How a driven session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    Completed(RenderSnapshot),
    Failed(FailureReport),
    /// Cancelled; carries the snapshot frozen at cancellation.
    Cancelled(RenderSnapshot),
}

impl SessionOutcome {
    #[must_use]
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed(_) => SessionState::Completed,
            SessionOutcome::Failed(_) => SessionState::Failed,
            SessionOutcome::Cancelled(_) => SessionState::Cancelled,
        }
    }
}

/// Send `request` and stream the response into `renderer` until the session
/// reaches a terminal state.
pub async fn run_analysis<R>(
    transport: &HttpTransport,
    request: &ChatCompletionRequest,
    renderer: &mut R,
    cancel: CancelToken,
    follow_interval: Duration,
) -> SessionOutcome
where
    R: Renderer + ?Sized,
{
    let mut session = StreamSession::with_cancel_token(cancel.clone());
    if let Err(err) = session.begin_request() {
        return settle_after_error(session, err, renderer);
    }

    let body = match cancel.attach(transport.open_stream(request)).await {
        Ok(Ok(body)) => body,
        Ok(Err(err)) => return settle_after_error(session, err, renderer),
        Err(_aborted) => return cancelled(session),
    };
    drive_stream(session, body, renderer, FollowThrottle::new(follow_interval)).await
}

/// Feed `body` into `session` chunk by chunk.
///
/// The session must already be in `Requesting`. The body is wrapped with the
/// session's cancel token, so cancelling stops the loop at the next poll and
/// drops the body.
pub async fn drive_stream<S, R>(
    mut session: StreamSession,
    body: S,
    renderer: &mut R,
    mut follow: FollowThrottle,
) -> SessionOutcome
where
    S: Stream<Item = Result<Bytes, StreamError>>,
    R: Renderer + ?Sized,
{
    let mut body = pin!(session.cancel_token().attach(body));

    loop {
        let next = body.next().await;
        if session.cancel_token().is_cancelled() {
            return cancelled(session);
        }
        match next {
            Some(Ok(bytes)) => {
                let Some(snapshot) = session.on_chunk(&RawChunk::Bytes(bytes)) else {
                    return finished(session);
                };
                let update = RenderUpdate {
                    follow: follow.observe(&snapshot, Instant::now()),
                    snapshot,
                };
                if session.cancel_token().is_cancelled() {
                    return cancelled(session);
                }
                renderer.on_update(&update);
                if update.snapshot.is_complete {
                    return SessionOutcome::Completed(update.snapshot);
                }
            }
            Some(Err(err)) => return settle_after_error(session, err, renderer),
            None => {
                return match session.on_transport_end() {
                    Ok(Some(snapshot)) => {
                        let update = RenderUpdate {
                            follow: follow.observe(&snapshot, Instant::now()),
                            snapshot,
                        };
                        if !session.cancel_token().is_cancelled() {
                            renderer.on_update(&update);
                        }
                        SessionOutcome::Completed(update.snapshot)
                    }
                    Ok(None) => finished(session),
                    Err(report) => fail(&session, report, renderer),
                };
            }
        }
    }
}

fn settle_after_error<R>(
    mut session: StreamSession,
    err: StreamError,
    renderer: &mut R,
) -> SessionOutcome
where
    R: Renderer + ?Sized,
{
    match session.on_transport_error(err) {
        Some(report) => fail(&session, report, renderer),
        None => finished(session),
    }
}

// A cancel landing after the failure was recorded still silences the renderer.
fn fail<R>(session: &StreamSession, report: FailureReport, renderer: &mut R) -> SessionOutcome
where
    R: Renderer + ?Sized,
{
    if !session.cancel_token().is_cancelled() {
        renderer.on_failure(&report);
    }
    SessionOutcome::Failed(report)
}

fn cancelled(mut session: StreamSession) -> SessionOutcome {
    session.cancel();
    SessionOutcome::Cancelled(session.snapshot())
}

// Session already terminal without a report in hand.
fn finished(session: StreamSession) -> SessionOutcome {
    match session.state() {
        SessionState::Completed => SessionOutcome::Completed(session.snapshot()),
        SessionState::Failed => SessionOutcome::Failed(FailureReport {
            partial_answer_text: session.buffers().answer().to_owned(),
            partial_reasoning_text: session.buffers().reasoning().to_owned(),
            error: StreamError::InvalidState("session failed earlier".into()),
        }),
        _ => cancelled(session),
    }
}

/// A spawned analysis.
#[derive(Debug)]
pub struct AnalysisHandle {
    cancel: CancelToken,
    task: JoinHandle<SessionOutcome>,
}

impl AnalysisHandle {
    /// Cancel the analysis and abort its request. Idempotent.
    pub fn cancel(&self) {
        if self.cancel.cancel() {
            tracing::debug!("analysis cancelled by owner");
        }
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the analysis to end. `None` if the task panicked.
    pub async fn join(self) -> Option<SessionOutcome> {
        match self.task.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::error!(error = %err, "analysis task did not complete");
                None
            }
        }
    }
}

/// Spawn [`run_analysis`] on the current tokio runtime.
pub fn spawn_analysis<R>(
    transport: HttpTransport,
    request: ChatCompletionRequest,
    mut renderer: R,
    follow_interval: Duration,
) -> AnalysisHandle
where
    R: Renderer + Send + 'static,
{
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let start_time = Instant::now();
        let outcome =
            run_analysis(&transport, &request, &mut renderer, token, follow_interval).await;
        log_analysis_outcome(&outcome, start_time);
        outcome
    });
    AnalysisHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    #[derive(Default)]
    struct Recording {
        updates: Vec<RenderUpdate>,
        failures: Vec<String>,
    }

    impl Renderer for Recording {
        fn on_update(&mut self, update: &RenderUpdate) {
            self.updates.push(update.clone());
        }

        fn on_failure(&mut self, report: &FailureReport) {
            self.failures.push(report.error.to_string());
        }
    }

    fn started() -> StreamSession {
        let mut session = StreamSession::new();
        session.begin_request().expect("begin");
        session
    }

    fn no_throttle() -> FollowThrottle {
        FollowThrottle::new(Duration::ZERO)
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, StreamError>> {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_drive_to_completion() {
        let mut renderer = Recording::default();
        let body = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"think\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"answer\"},\"finish_reason\":\"stop\"}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        ]);
        let outcome = drive_stream(started(), body, &mut renderer, no_throttle()).await;

        let SessionOutcome::Completed(snapshot) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(snapshot.answer_text, "answer");
        assert_eq!(snapshot.reasoning_text, "think");
        assert_eq!(renderer.updates.len(), 2);
        assert!(renderer.failures.is_empty());
    }

    #[tokio::test]
    async fn test_drive_reports_stream_error_with_partial_text() {
        let mut renderer = Recording::default();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n")),
            Err(StreamError::Transport("connection reset".into())),
        ]);
        let outcome = drive_stream(started(), body, &mut renderer, no_throttle()).await;

        let SessionOutcome::Failed(report) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(report.partial_answer_text, "par");
        assert_eq!(renderer.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_drive_end_without_terminal_fails() {
        let mut renderer = Recording::default();
        let body = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"]);
        let outcome = drive_stream(started(), body, &mut renderer, no_throttle()).await;
        let SessionOutcome::Failed(report) = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(report.error, StreamError::PrematureEnd));
    }

    #[tokio::test]
    async fn test_drive_flushes_done_without_newline() {
        let mut renderer = Recording::default();
        let body = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
            "data: [DONE]",
        ]);
        let outcome = drive_stream(started(), body, &mut renderer, no_throttle()).await;
        assert_eq!(outcome.state(), SessionState::Completed);
        assert!(renderer.updates.last().expect("update").snapshot.is_complete);
    }

    #[tokio::test]
    async fn test_drive_stops_when_token_cancelled() {
        let session = started();
        let token = session.cancel_token().clone();
        token.cancel();
        let mut renderer = Recording::default();
        let body = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"]);
        let outcome = drive_stream(session, body, &mut renderer, no_throttle()).await;
        let SessionOutcome::Cancelled(snapshot) = outcome else {
            panic!("expected cancellation");
        };
        assert_eq!(snapshot.answer_text, "");
        assert!(renderer.updates.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_racing_a_chunk_renders_nothing() {
        let session = started();
        let token = session.cancel_token().clone();
        let mut sent = false;
        // Cancels from inside the body poll, then still hands the chunk over.
        let body = stream::poll_fn(move |_| {
            if sent {
                return std::task::Poll::Ready(None);
            }
            sent = true;
            token.cancel();
            std::task::Poll::Ready(Some(Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
            ))))
        });
        let mut renderer = Recording::default();
        let outcome = drive_stream(session, body, &mut renderer, no_throttle()).await;
        assert_eq!(outcome.state(), SessionState::Cancelled);
        assert!(renderer.updates.is_empty());
        assert!(renderer.failures.is_empty());
    }

    #[test]
    fn test_failure_after_cancel_is_not_rendered() {
        let session = started();
        session.cancel_token().cancel();
        let report = FailureReport {
            partial_answer_text: "partial".into(),
            partial_reasoning_text: String::new(),
            error: StreamError::Transport("reset".into()),
        };
        let mut renderer = Recording::default();
        let outcome = fail(&session, report, &mut renderer);
        assert_eq!(outcome.state(), SessionState::Failed);
        assert!(renderer.failures.is_empty());
    }

    #[test]
    fn test_failure_is_rendered_once() {
        let session = started();
        let report = FailureReport {
            partial_answer_text: String::new(),
            partial_reasoning_text: String::new(),
            error: StreamError::PrematureEnd,
        };
        let mut renderer = Recording::default();
        fail(&session, report, &mut renderer);
        assert_eq!(renderer.failures.len(), 1);
    }
}
