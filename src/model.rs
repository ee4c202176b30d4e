use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// User name recorded when a payload carries none.
pub const DEFAULT_USER: &str = "unknown user";

/// Local wall-clock time with microseconds, e.g. `2024-05-01T20:15:03.123456`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Douyin,
    Taobao,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Douyin => "douyin",
            Platform::Taobao => "taobao",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentKind {
    #[default]
    Chat,
    Other,
}

/// What an extractor knows about a comment before the session stamps it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommentDraft {
    pub user: String,
    pub content: String,
    pub kind: CommentKind,
}

impl CommentDraft {
    pub fn new(user: Option<&str>, content: Option<&str>, kind: CommentKind) -> Self {
        Self {
            user: user.unwrap_or(DEFAULT_USER).to_string(),
            content: content.unwrap_or_default().to_string(),
            kind,
        }
    }
}

/// One captured comment as written to the output file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub timestamp: String,
    pub user: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: CommentKind,
    pub platform: Platform,
    pub room_id: String,
}

impl Comment {
    pub fn stamp(draft: CommentDraft, platform: Platform, room_id: &str) -> Self {
        Self::stamped_at(draft, platform, room_id, Local::now())
    }

    pub fn stamped_at(
        draft: CommentDraft,
        platform: Platform,
        room_id: &str,
        at: DateTime<Local>,
    ) -> Self {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            user: draft.user,
            content: draft.content,
            kind: draft.kind,
            platform,
            room_id: room_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn serializes_with_output_field_names() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 20, 15, 3).unwrap();
        let comment = Comment::stamped_at(
            CommentDraft::new(Some("Ann"), Some("hi"), CommentKind::Chat),
            Platform::Taobao,
            "555",
            at,
        );
        let value = serde_json::to_value(&comment).unwrap();
        assert_eq!(
            value,
            json!({
                "timestamp": "2024-05-01T20:15:03.000000",
                "user": "Ann",
                "content": "hi",
                "type": "chat",
                "platform": "taobao",
                "room_id": "555"
            })
        );
    }

    #[test]
    fn draft_defaults_missing_fields() {
        let draft = CommentDraft::new(None, None, CommentKind::Other);
        assert_eq!(draft.user, DEFAULT_USER);
        assert_eq!(draft.content, "");
    }
}
