use async_trait::async_trait;
use network_tap::PayloadOrigin;
use serde_json::Value;

use super::{checked_room_id, data_messages, draft_from, is_chat, PlatformProfile};
use crate::errors::CaptureError;
use crate::model::{CommentDraft, CommentKind, Platform};

pub struct Taobao;

#[async_trait]
impl PlatformProfile for Taobao {
    fn platform(&self) -> Platform {
        Platform::Taobao
    }

    async fn resolve_room_url(&self, room_id: &str) -> Result<String, CaptureError> {
        Ok(format!(
            "https://live.taobao.com/live/{}",
            checked_room_id(room_id)?
        ))
    }

    fn extract(&self, origin: PayloadOrigin, payload: &Value) -> Vec<CommentDraft> {
        match origin {
            PayloadOrigin::Network => batch(payload),
            PayloadOrigin::Socket => single(payload),
            // Logged chat shows up both as a bare message and as an api envelope.
            PayloadOrigin::Console if data_messages(payload).is_some() => batch(payload),
            PayloadOrigin::Console => single(payload),
        }
    }

    fn comment_area_selector(&self) -> Option<&'static str> {
        Some(".chat-container")
    }

    fn watches_console(&self) -> bool {
        true
    }
}

fn batch(payload: &Value) -> Vec<CommentDraft> {
    data_messages(payload)
        .map(|messages| {
            messages
                .iter()
                .filter(|message| is_chat(message))
                .map(|message| draft_from(message, CommentKind::Chat))
                .collect()
        })
        .unwrap_or_default()
}

fn single(payload: &Value) -> Vec<CommentDraft> {
    if is_chat(payload) {
        vec![draft_from(payload, CommentKind::Chat)]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_live_url() {
        assert_eq!(
            Taobao.resolve_room_url("12345").await.unwrap(),
            "https://live.taobao.com/live/12345"
        );
    }

    #[test]
    fn one_comment_per_chat_element() {
        let payload = json!({
            "data": {
                "messages": [
                    {"type": "chat", "user": {"nickname": "Ann"}, "content": "hi"},
                    {"type": "gift", "user": {"nickname": "Bob"}, "content": "rocket"},
                    {"type": "chat", "content": "anonymous"},
                    "not an object"
                ]
            }
        });
        let drafts = Taobao.extract(PayloadOrigin::Network, &payload);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].user, "Ann");
        assert_eq!(drafts[1].user, "unknown user");
        assert_eq!(drafts[1].content, "anonymous");
        assert!(drafts.iter().all(|d| d.kind == CommentKind::Chat));
    }

    #[test]
    fn socket_frame_yields_single_chat() {
        let frame = json!({"type": "chat", "user": {"nickname": "Ann"}, "content": "hi"});
        let drafts = Taobao.extract(PayloadOrigin::Socket, &frame);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].user, "Ann");
        assert_eq!(drafts[0].content, "hi");
        assert_eq!(drafts[0].kind, CommentKind::Chat);
    }

    #[test]
    fn console_json_reads_either_shape() {
        let bare = json!({"type": "chat", "user": {"nickname": "Ann"}, "content": "hi"});
        let drafts = Taobao.extract(PayloadOrigin::Console, &bare);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].content, "hi");

        let envelope = json!({"data": {"messages": [bare.clone(), bare]}});
        assert_eq!(Taobao.extract(PayloadOrigin::Console, &envelope).len(), 2);
        assert!(Taobao
            .extract(PayloadOrigin::Console, &json!({"type": "notice"}))
            .is_empty());
    }

    #[test]
    fn unknown_shapes_yield_nothing() {
        for payload in [
            json!(null),
            json!([1, 2, 3]),
            json!({"data": "flat"}),
            json!({"data": {"messages": {"type": "chat"}}}),
            json!({"type": "heartbeat"}),
        ] {
            assert!(Taobao.extract(PayloadOrigin::Network, &payload).is_empty());
            assert!(Taobao.extract(PayloadOrigin::Socket, &payload).is_empty());
        }
    }
}
