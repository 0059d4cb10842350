/// Row types shared between the backend facade and the chat core
use crate::attachments::{self, Attachment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Attachment-only rows may carry `"content": null`
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Public profile of a user (`profiles` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub vibe: Option<String>,
}

/// `conversations` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub is_group: bool,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    /// Canonical pair key for direct conversations, see [`DirectPair::key`]
    #[serde(default)]
    pub direct_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub is_group: bool,
    pub direct_key: Option<String>,
}

/// Result of inserting a conversation
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Conversation),
    /// The store already holds a direct conversation for this pair
    Existing(String),
}

/// `conversation_participants` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: String,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
}

/// `messages` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default, deserialize_with = "attachments::deserialize_lenient")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Idempotency key chosen by the sending client
    #[serde(default)]
    pub client_key: Option<Uuid>,
}

impl MessageRow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Insert payload for `messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub client_key: Option<Uuid>,
}

impl NewMessage {
    /// Text stored in `conversations.last_message` after this send
    pub fn preview(&self) -> String {
        if self.attachments.is_empty() {
            self.content.clone()
        } else {
            "Sent an attachment".to_string()
        }
    }
}

/// Unordered pair of users in a direct conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectPair {
    low: String,
    high: String,
}

impl DirectPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self { low: a.to_string(), high: b.to_string() }
        } else {
            Self { low: b.to_string(), high: a.to_string() }
        }
    }

    /// Canonical key: "dm:{min_id}:{max_id}"
    pub fn key(&self) -> String {
        format!("dm:{}:{}", self.low, self.high)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }
}

/// One row of the conversation list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    /// Everyone in the conversation, including the viewer
    pub participants: Vec<Profile>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_pair_is_unordered() {
        let ab = DirectPair::new("u1", "u2");
        let ba = DirectPair::new("u2", "u1");
        assert_eq!(ab, ba);
        assert_eq!(ab.key(), "dm:u1:u2");
        assert!(ab.contains("u2"));
        assert!(!ab.contains("u3"));
    }

    #[test]
    fn test_message_row_with_string_attachments() {
        let row: MessageRow = serde_json::from_value(json!({
            "id": "7",
            "conversation_id": "c1",
            "sender_id": "u1",
            "content": "",
            "attachments": "[{\"type\":\"audio\",\"url\":\"https://cdn/v.m4a\",\"name\":\"v.m4a\"}]",
            "created_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(row.attachments.len(), 1);
        assert!(row.receiver_id.is_none());
        assert!(!row.is_deleted());
    }

    #[test]
    fn test_message_row_with_garbage_attachments() {
        let row: MessageRow = serde_json::from_value(json!({
            "id": "8",
            "conversation_id": "c1",
            "sender_id": "u1",
            "content": "hello",
            "attachments": "{oops",
            "created_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert!(row.attachments.is_empty());
        assert_eq!(row.content, "hello");
    }

    #[test]
    fn test_message_row_with_null_content() {
        let row: MessageRow = serde_json::from_value(json!({
            "id": "9",
            "conversation_id": "c1",
            "sender_id": "u1",
            "content": null,
            "attachments": [{"type": "image", "url": "https://cdn/p.png", "name": "p.png"}],
            "created_at": "2024-05-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(row.content, "");
        assert_eq!(row.attachments.len(), 1);
    }

    #[test]
    fn test_preview_text() {
        let mut msg = NewMessage {
            conversation_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            receiver_id: None,
            content: "yo".to_string(),
            attachments: Vec::new(),
            client_key: None,
        };
        assert_eq!(msg.preview(), "yo");

        msg.attachments.push(Attachment {
            kind: crate::attachments::AttachmentKind::File,
            url: "https://cdn/a.pdf".to_string(),
            name: "a.pdf".to_string(),
        });
        assert_eq!(msg.preview(), "Sent an attachment");
    }
}
