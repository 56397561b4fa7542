use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::protocol::{
    ChatMessage, ConversationId, ErrorBody, ErrorKind, FragmentPayload, Role, StreamErrorPayload,
    StreamRequestBody, TokenResponse, EVENT_COMPLETE, EVENT_ERROR, EVENT_TOKEN,
};
use crate::server::AppState;

const RELAY_BUFFER: usize = 32;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn issue_token(State(state): State<Arc<AppState>>) -> Json<TokenResponse> {
    let token = state.signer.issue();
    tracing::debug!(expiry = %token.expiry, "issued csrf token");
    Json(token)
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: ErrorKind::BadRequest,
        message: message.into(),
        retry_after: None,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn sse_event(name: &'static str, payload: &impl Serialize) -> Result<Event, Infallible> {
    let data = serde_json::to_string(payload).unwrap_or_default();
    Ok(Event::default().event(name).data(data))
}

/// Stream a completion for one user message.
///
/// Emits one `token` event per backend fragment and then exactly one of
/// `complete` (the authoritative assistant message) or `error`.
pub async fn stream_chat(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    body: Result<Json<StreamRequestBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if body.content.trim().is_empty() {
        return bad_request("message content must not be empty");
    }

    let conversation_id = ConversationId::new(conversation_id);
    tracing::info!(
        conversation = %conversation_id,
        chars = body.content.len(),
        model = state.backend.model(),
        "stream opened"
    );

    let (tx, rx) = mpsc::channel(RELAY_BUFFER);
    tokio::spawn(relay(state, conversation_id, body.content, tx));

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response()
}

async fn relay(
    state: Arc<AppState>,
    conversation_id: ConversationId,
    prompt: String,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let started = Instant::now();
    let mut fragments = state.backend.generate(&conversation_id, &prompt);
    let mut content = String::new();
    let mut token_count: u32 = 0;

    while let Some(fragment) = fragments.next().await {
        match fragment {
            Ok(fragment) => {
                content.push_str(&fragment);
                token_count += 1;
                let event = sse_event(EVENT_TOKEN, &FragmentPayload { content: fragment });
                if tx.send(event).await.is_err() {
                    tracing::debug!(conversation = %conversation_id, "client went away mid-stream");
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, error = %e, "backend failed mid-stream");
                let payload = StreamErrorPayload {
                    kind: ErrorKind::ModelError,
                    message: e.to_string(),
                };
                let _ = tx.send(sse_event(EVENT_ERROR, &payload)).await;
                return;
            }
        }
    }

    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let message = ChatMessage {
        id: uuid::Uuid::now_v7().to_string(),
        conversation_id: conversation_id.clone(),
        role: Role::Assistant,
        // Post-processed: the committed text may differ from the raw fragments.
        content: content.trim().to_string(),
        created_at: Utc::now(),
        token_count,
        model: Some(state.backend.model().to_string()),
        latency_ms: Some(latency_ms),
    };
    if tx.send(sse_event(EVENT_COMPLETE, &message)).await.is_ok() {
        tracing::info!(
            conversation = %conversation_id,
            token_count,
            latency_ms,
            "stream completed"
        );
    }
}
