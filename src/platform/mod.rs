//! Per-platform capabilities: where a room lives and how its payloads read.

mod douyin;
mod taobao;

use std::sync::Arc;

use async_trait::async_trait;
use network_tap::PayloadOrigin;
use serde_json::Value;

use crate::errors::CaptureError;
use crate::model::{CommentDraft, CommentKind, Platform};

pub use douyin::Douyin;
pub use taobao::Taobao;

/// Page text shown once a broadcast is over.
pub const ENDED_MARKER: &str = "直播已结束";

#[async_trait]
pub trait PlatformProfile: Send + Sync {
    fn platform(&self) -> Platform;

    async fn resolve_room_url(&self, room_id: &str) -> Result<String, CaptureError>;

    /// Map one decoded payload to comments. Unknown shapes yield nothing.
    fn extract(&self, origin: PayloadOrigin, payload: &Value) -> Vec<CommentDraft>;

    fn ended_markers(&self) -> &[&'static str] {
        &[ENDED_MARKER]
    }

    /// CSS selector of the comment area, checked after load when present.
    fn comment_area_selector(&self) -> Option<&'static str> {
        None
    }

    fn watches_console(&self) -> bool {
        false
    }
}

/// Chosen once per session.
pub fn profile_for(platform: Platform) -> Arc<dyn PlatformProfile> {
    match platform {
        Platform::Douyin => Arc::new(Douyin),
        Platform::Taobao => Arc::new(Taobao),
    }
}

pub(crate) fn checked_room_id(room_id: &str) -> Result<&str, CaptureError> {
    let trimmed = room_id.trim();
    if trimmed.is_empty() {
        return Err(CaptureError::Config("room id must not be empty".into()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CaptureError::Config(format!(
            "room id {trimmed:?} contains unsupported characters"
        )));
    }
    Ok(trimmed)
}

/// `{user: {nickname}, content}` message body.
pub(crate) fn draft_from(message: &Value, kind: CommentKind) -> CommentDraft {
    let user = message
        .get("user")
        .and_then(|user| user.get("nickname"))
        .and_then(Value::as_str);
    let content = message.get("content").and_then(Value::as_str);
    CommentDraft::new(user, content, kind)
}

pub(crate) fn is_chat(message: &Value) -> bool {
    message.get("type").and_then(Value::as_str) == Some("chat")
}

/// `data.messages` when the payload carries that envelope.
pub(crate) fn data_messages(payload: &Value) -> Option<&Vec<Value>> {
    payload.pointer("/data/messages").and_then(Value::as_array)
}
