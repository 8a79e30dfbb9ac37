use std::time::Duration;

use parking_lot::Mutex;

use super::driver::{spawn_analysis, AnalysisHandle, Renderer, SessionOutcome};
use super::CancelToken;
use crate::config::AppConfig;
use crate::error::StreamError;
use crate::protocol::chat::ChatCompletionRequest;
use crate::transport::HttpTransport;

/// Owner of at most one running analysis.
///
/// Starting a new analysis cancels the previous one; unloading cancels
/// whatever is running so no request outlives the page.
#[derive(Debug)]
pub struct AnalysisPage {
    transport: HttpTransport,
    follow_interval: Duration,
    active: Mutex<Option<AnalysisHandle>>,
}

impl AnalysisPage {
    #[must_use]
    pub fn new(transport: HttpTransport, follow_interval: Duration) -> Self {
        Self {
            transport,
            follow_interval,
            active: Mutex::new(None),
        }
    }

    /// # Errors
    ///
    /// Fails when the upstream section cannot produce a transport.
    pub fn from_config(config: &AppConfig) -> Result<Self, StreamError> {
        let transport = HttpTransport::new(&config.upstream)?;
        Ok(Self::new(transport, config.features.follow_interval()))
    }

    /// Start an analysis. Must be called inside a tokio runtime.
    ///
    /// Returns the new analysis' cancel token.
    pub fn start<R>(&self, request: ChatCompletionRequest, renderer: R) -> CancelToken
    where
        R: Renderer + Send + 'static,
    {
        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            previous.cancel();
            tracing::debug!("previous analysis replaced");
        }
        let handle = spawn_analysis(
            self.transport.clone(),
            request,
            renderer,
            self.follow_interval,
        );
        let token = handle.cancel_token().clone();
        *active = Some(handle);
        token
    }

    /// `true` while an analysis is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the current analysis, if any, and release it.
    pub async fn wait(&self) -> Option<SessionOutcome> {
        let handle = self.active.lock().take()?;
        handle.join().await
    }

    /// Cancel the current analysis and release it.
    pub fn unload(&self) {
        if let Some(handle) = self.active.lock().take() {
            handle.cancel();
        }
    }
}

impl Drop for AnalysisPage {
    fn drop(&mut self) {
        self.unload();
    }
}
