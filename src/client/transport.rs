//! The network seam of the streaming client.
//!
//! [`ChatTransport`] is the two calls a session makes: fetch a CSRF token and
//! open an event stream. [`HttpTransport`] implements them over `reqwest`,
//! mapping gate rejections onto [`StreamError`] kinds and decoding the SSE
//! body with an idle timeout.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;

use crate::client::csrf::CsrfToken;
use crate::client::events::StreamEvent;
use crate::client::sse::{decode_event, SseDecoder};
use crate::config::ClientConfig;
use crate::error::StreamError;
use crate::protocol::{
    stream_path, ConversationId, ErrorBody, ErrorKind, StreamRequestBody, TokenResponse,
    CSRF_HEADER, CSRF_TOKEN_PATH,
};

/// Decoded events of one open stream, in arrival order.
pub type EventStream = BoxStream<'static, Result<StreamEvent, StreamError>>;

/// What a session asks the server for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub conversation_id: ConversationId,
    pub content: String,
}

pub trait ChatTransport: Send + Sync + 'static {
    /// Fetch a fresh anti-forgery token from the issuance endpoint.
    fn fetch_token(&self) -> impl Future<Output = Result<CsrfToken, StreamError>> + Send;

    /// Open the response stream for `request`, authenticated with `token`.
    fn open_stream(
        &self,
        request: &StreamRequest,
        token: &str,
    ) -> impl Future<Output = Result<EventStream, StreamError>> + Send;
}

/// `reqwest`-backed transport talking to a sluice server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token_fetch_timeout: Duration,
    open_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_fetch_timeout: config.token_fetch_timeout(),
            open_timeout: config.connect_timeout(),
            idle_timeout: config.stream_idle_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl ChatTransport for HttpTransport {
    async fn fetch_token(&self) -> Result<CsrfToken, StreamError> {
        let response = self
            .client
            .get(self.url(CSRF_TOKEN_PATH))
            .timeout(self.token_fetch_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(rejection_from_response(response).await);
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| StreamError::Protocol(format!("invalid token response: {e}")))?;
        tracing::debug!(expiry = %body.expiry, "fetched csrf token");
        Ok(CsrfToken {
            value: body.token,
            expiry: body.expiry,
        })
    }

    async fn open_stream(
        &self,
        request: &StreamRequest,
        token: &str,
    ) -> Result<EventStream, StreamError> {
        let send = self
            .client
            .post(self.url(&stream_path(&request.conversation_id)))
            .header(CSRF_HEADER, token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&StreamRequestBody {
                content: request.content.clone(),
            })
            .send();

        let response = tokio::time::timeout(self.open_timeout, send)
            .await
            .map_err(|_| StreamError::TransportFailure("timed out opening stream".into()))?
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(rejection_from_response(response).await);
        }

        tracing::debug!(conversation = %request.conversation_id, "stream opened");
        Ok(decode_sse_stream(response.bytes_stream(), self.idle_timeout))
    }
}

fn transport_error(err: reqwest::Error) -> StreamError {
    StreamError::TransportFailure(err.to_string())
}

/// Map a non-2xx response onto the error taxonomy.
///
/// Gate rejections carry a JSON [`ErrorBody`] naming their kind. Anything else
/// is a server or proxy failure: 5xx and 408 are retryable transport failures,
/// the remaining statuses are terminal.
async fn rejection_from_response(response: reqwest::Response) -> StreamError {
    let status = response.status();
    let header_retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let body = response.bytes().await.unwrap_or_default();

    if let Ok(error) = serde_json::from_slice::<ErrorBody>(&body) {
        tracing::debug!(%status, kind = %error.error, "request rejected");
        return StreamError::from_kind(
            error.error,
            error.message,
            error.retry_after.or(header_retry_after),
        );
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        StreamError::TransportFailure(format!("HTTP {status}"))
    } else {
        StreamError::ApplicationStreamError {
            kind: ErrorKind::BadRequest,
            message: format!("HTTP {status}: {}", String::from_utf8_lossy(&body)),
        }
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamEvent, StreamError>>,
    idle_timeout: Duration,
    finished: bool,
}

/// Turn a raw byte stream into decoded events.
///
/// Ends with a `TransportFailure` if the body goes idle for `idle_timeout`,
/// errors, or closes; consumers stop polling after a terminal event so a
/// clean close after `complete` is never observed.
pub fn decode_sse_stream<S, B, E>(body: S, idle_timeout: Duration) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        idle_timeout,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            let failure = match tokio::time::timeout(st.idle_timeout, st.body.next()).await {
                Err(_) => "stream idle timeout".to_string(),
                Ok(None) => "connection closed before stream completed".to_string(),
                Ok(Some(Err(e))) => e.to_string(),
                Ok(Some(Ok(chunk))) => {
                    match st.decoder.push(chunk.as_ref()) {
                        Ok(frames) => {
                            for frame in frames {
                                match decode_event(&frame) {
                                    Ok(Some(event)) => st.pending.push_back(Ok(event)),
                                    Ok(None) => {}
                                    Err(e) => {
                                        st.pending.push_back(Err(e));
                                        st.finished = true;
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            st.pending.push_back(Err(e));
                            st.finished = true;
                        }
                    }
                    continue;
                }
            };

            st.finished = true;
            st.pending
                .push_back(Err(StreamError::TransportFailure(failure)));
        }
    })
    .boxed()
}
