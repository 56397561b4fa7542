//! Wire types shared by the chat server and the streaming client.
//!
//! Defines [`ChatMessage`] (the authoritative message carried by a `complete`
//! event), the CSRF issuance payload [`TokenResponse`], the gate rejection body
//! [`ErrorBody`], and the [`ErrorKind`] vocabulary both sides agree on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the anti-forgery token on mutating requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Token issuance endpoint. Exempt from the forgery check.
pub const CSRF_TOKEN_PATH: &str = "/api/csrf-token";

/// Liveness endpoint. Exempt from the forgery check.
pub const HEALTH_PATH: &str = "/health";

/// SSE event names.
pub const EVENT_TOKEN: &str = "token";
pub const EVENT_COMPLETE: &str = "complete";
pub const EVENT_ERROR: &str = "error";

/// Path of the streaming endpoint for a conversation.
pub fn stream_path(conversation_id: &ConversationId) -> String {
    format!("/api/conversations/{}/stream", conversation_id.as_str())
}

/// Opaque conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as stored in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned UUID v7 for assistant messages; client-generated for
    /// optimistic user messages.
    pub id: String,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Number of tokens the model produced. Zero for user messages.
    #[serde(default)]
    pub token_count: u32,
    /// Model identifier, `None` for user messages.
    #[serde(default)]
    pub model: Option<String>,
    /// Wall time from request to completion, in milliseconds.
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl ChatMessage {
    /// Build a user message for optimistic insertion into history.
    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            conversation_id,
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            token_count: 0,
            model: None,
            latency_ms: None,
        }
    }
}

/// Body of a stream-open request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequestBody {
    pub content: String,
}

/// Payload of a `token` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentPayload {
    pub content: String,
}

/// Payload of an `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

/// Response of the CSRF issuance endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

/// Error kinds shared by gate rejections and stream error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SizeExceeded,
    RateExceeded,
    ForgeryMissing,
    ForgeryInvalid,
    ForgeryExpired,
    OriginRejected,
    ModelError,
    BadRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SizeExceeded => "size_exceeded",
            Self::RateExceeded => "rate_exceeded",
            Self::ForgeryMissing => "forgery_missing",
            Self::ForgeryInvalid => "forgery_invalid",
            Self::ForgeryExpired => "forgery_expired",
            Self::OriginRejected => "origin_rejected",
            Self::ModelError => "model_error",
            Self::BadRequest => "bad_request",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of a rejected request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
    /// Seconds until the client may retry (rate rejections only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let body = ErrorBody {
            error: ErrorKind::ForgeryExpired,
            message: "expired".into(),
            retry_after: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "forgery_expired");
        assert!(json.get("retry_after").is_none());
    }

    #[test]
    fn chat_message_tolerates_missing_accounting_fields() {
        let json = r#"{
            "id": "m1",
            "conversation_id": "c1",
            "role": "assistant",
            "content": "hi",
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.token_count, 0);
        assert!(msg.model.is_none());
    }

    #[test]
    fn stream_path_embeds_conversation() {
        let id = ConversationId::new("abc");
        assert_eq!(stream_path(&id), "/api/conversations/abc/stream");
    }
}
