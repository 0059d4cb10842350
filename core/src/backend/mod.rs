/// Backend facade: the hosted store, object storage and realtime channels
/// the chat core runs against
pub mod memory;

use crate::error::Result;
use crate::types::{
    Conversation, InsertOutcome, MessageRow, NewConversation, NewMessage, Participant, Profile,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use memory::MemoryBackend;

/// Broadcast event name for typing signals
pub const TYPING_EVENT: &str = "typing";

/// Realtime topic of one conversation
pub fn conversation_topic(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

/// Payload announced on a channel's presence registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Missing on transient entries
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub online_at: Option<DateTime<Utc>>,
}

impl PresenceMeta {
    pub fn online(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            online_at: Some(Utc::now()),
        }
    }
}

/// Presence registry snapshot: presence key -> announced payloads
pub type PresenceState = HashMap<String, Vec<PresenceMeta>>;

/// Payload of a typing broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Events delivered on a realtime channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageInserted(MessageRow),
    MessageUpdated(MessageRow),
    Broadcast { event: String, payload: Value },
    PresenceSync(PresenceState),
}

/// Sending half of a channel subscription
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Send an ephemeral application event to the other subscribers
    async fn broadcast(&self, event: &str, payload: Value) -> Result<()>;

    /// Announce (or replace) this subscriber's presence payload
    async fn track(&self, meta: PresenceMeta) -> Result<()>;

    /// Leave the channel, dropping this subscriber's presence
    async fn unsubscribe(&self) -> Result<()>;
}

pub struct Subscription {
    pub topic: String,
    pub handle: Arc<dyn ChannelHandle>,
    pub events: broadcast::Receiver<ChannelEvent>,
}

/// Operations the chat core needs from the hosted backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Authenticated user id, `None` when signed out
    async fn current_user(&self) -> Result<Option<String>>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    /// Case-insensitive match on username or full name
    async fn search_profiles(&self, query: &str, limit: usize) -> Result<Vec<Profile>>;

    async fn conversation_profiles(&self, conversation_id: &str) -> Result<Vec<Profile>>;

    /// Ids of every conversation the user participates in, in creation order
    async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>>;

    /// The subset of `among` in which `user_id` also participates
    async fn conversation_ids_with_member(
        &self,
        user_id: &str,
        among: &[String],
    ) -> Result<Vec<String>>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    async fn insert_conversation(&self, new: NewConversation) -> Result<InsertOutcome>;

    async fn update_conversation_preview(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Upsert; rows that already exist keep their read cursor
    async fn insert_participants(&self, rows: Vec<Participant>) -> Result<()>;

    async fn participations(&self, user_id: &str) -> Result<Vec<Participant>>;

    async fn participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>>;

    /// Advance the read cursor to `at` unless it is already there or later.
    /// Conditional in the store (`last_read_at IS NULL OR last_read_at < at`);
    /// returns the cursor in effect afterwards.
    async fn set_last_read_at(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Most recent messages, newest first
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<MessageRow>>;

    async fn insert_message(&self, new: NewMessage) -> Result<MessageRow>;

    async fn soft_delete_message(&self, message_id: &str, at: DateTime<Utc>) -> Result<MessageRow>;

    /// Batch count of messages newer than each cursor; a `None` cursor counts everything
    async fn count_unread(
        &self,
        cursors: &[(String, Option<DateTime<Utc>>)],
    ) -> Result<HashMap<String, u64>>;

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
        upsert: bool,
    ) -> Result<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}
