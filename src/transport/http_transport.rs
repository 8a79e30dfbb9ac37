use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::HeaderValue;

use crate::config::UpstreamConfig;
use crate::error::StreamError;
use crate::protocol::chat::ChatCompletionRequest;

static RUSTLS_PROVIDER_INIT: Once = Once::new();
const UPSTREAM_ERROR_MAX_LEN: usize = 500;

/// Response body of a streaming request, chunk by chunk in arrival order.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

fn build_reqwest_client(
    connect_timeout: Duration,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, StreamError> {
    // No overall timeout: a stalled stream is left to the caller's watchdog.
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| StreamError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| StreamError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// HTTP client for the streaming chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: url::Url,
    authorization: HeaderValue,
}

impl HttpTransport {
    /// Create a transport from the upstream section of the config.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Transport`] when the URL, API key or proxy are
    /// unusable or the client cannot be built.
    pub fn new(config: &UpstreamConfig) -> Result<Self, StreamError> {
        RUSTLS_PROVIDER_INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });

        let url = url::Url::parse(&config.completions_url())
            .map_err(|err| StreamError::Transport(format!("Invalid upstream URL: {err}")))?;
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| StreamError::Transport("API key is not a valid header value".into()))?;
        authorization.set_sensitive(true);
        let client = build_reqwest_client(
            config.connect_timeout(),
            config.use_env_proxy,
            config.proxy.as_deref(),
        )?;
        Ok(Self {
            client,
            url,
            authorization,
        })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// POST `request` and return the body as a chunk stream.
    ///
    /// Dropping the returned stream aborts the request.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Transport`] when the request cannot be sent and
    /// [`StreamError::Upstream`] for any non-success status.
    pub async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<BodyStream, StreamError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(AUTHORIZATION, self.authorization.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .json(request)
            .send()
            .await
            .map_err(|err| StreamError::Transport(format!("Request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let message = sanitize_upstream_error(&body);
            tracing::warn!(status = status.as_u16(), message = %message, "upstream rejected analysis request");
            return Err(StreamError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(url = %self.url, "analysis stream opened");
        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|err| StreamError::Transport(format!("Stream read failed: {err}")))
        })))
    }
}

/// Extract a short, log-safe message from an upstream error body.
#[must_use]
pub fn sanitize_upstream_error(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(msg) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return truncate_chars(msg, UPSTREAM_ERROR_MAX_LEN);
        }
        if let Some(msg) = json.get("message").and_then(|m| m.as_str()) {
            return truncate_chars(msg, UPSTREAM_ERROR_MAX_LEN);
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty response body".to_string();
    }
    truncate_chars(text, UPSTREAM_ERROR_MAX_LEN)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
