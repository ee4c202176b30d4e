use async_trait::async_trait;
use network_tap::PayloadOrigin;
use serde_json::Value;

use super::{checked_room_id, data_messages, draft_from, is_chat, PlatformProfile};
use crate::errors::CaptureError;
use crate::model::{CommentDraft, CommentKind, Platform};

const CHAT_METHOD: &str = "WebcastChatMessage";
const EVENT_METHODS: &[&str] = &[
    "WebcastGiftMessage",
    "WebcastMemberMessage",
    "WebcastSocialMessage",
    "WebcastLikeMessage",
];

pub struct Douyin;

impl Douyin {
    fn messages(payload: &Value) -> Vec<&Value> {
        if let Some(list) = data_messages(payload) {
            return list.iter().collect();
        }
        if let Some(list) = payload.get("messages").and_then(Value::as_array) {
            return list.iter().collect();
        }
        if payload.is_object() {
            return vec![payload];
        }
        Vec::new()
    }

    fn draft(message: &Value) -> Option<CommentDraft> {
        match message.get("method").and_then(Value::as_str) {
            Some(CHAT_METHOD) => Some(draft_from(message, CommentKind::Chat)),
            Some(method) if EVENT_METHODS.contains(&method) => {
                let mut draft = draft_from(message, CommentKind::Other);
                if let Some(describe) = message
                    .get("common")
                    .and_then(|common| common.get("describe"))
                    .and_then(Value::as_str)
                {
                    draft.content = describe.to_string();
                }
                Some(draft)
            }
            Some(_) => None,
            None if is_chat(message) => Some(draft_from(message, CommentKind::Chat)),
            None => None,
        }
    }
}

#[async_trait]
impl PlatformProfile for Douyin {
    fn platform(&self) -> Platform {
        Platform::Douyin
    }

    async fn resolve_room_url(&self, room_id: &str) -> Result<String, CaptureError> {
        Ok(format!(
            "https://live.douyin.com/{}",
            checked_room_id(room_id)?
        ))
    }

    fn extract(&self, _origin: PayloadOrigin, payload: &Value) -> Vec<CommentDraft> {
        Self::messages(payload)
            .into_iter()
            .filter_map(Self::draft)
            .collect()
    }
}
