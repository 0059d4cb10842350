/// In-process backend: tables, row-level checks, object storage and realtime
/// fan-out held in memory. Clones share state; `signed_in` gives each client
/// its own session over the same data.
use super::{
    conversation_topic, Backend, ChannelEvent, ChannelHandle, PresenceMeta, PresenceState,
    Subscription,
};
use crate::error::{ChatError, Result};
use crate::types::{
    Conversation, InsertOutcome, MessageRow, NewConversation, NewMessage, Participant, Profile,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    profiles: Vec<Profile>,
    conversations: Vec<Conversation>,
    participants: Vec<Participant>,
    messages: Vec<MessageRow>,
    objects: HashMap<String, Bytes>,
    next_message_id: u64,
}

struct Topic {
    sender: broadcast::Sender<ChannelEvent>,
    presence: PresenceState,
}

impl Topic {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            presence: PresenceState::new(),
        }
    }

    fn publish(&self, event: ChannelEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

#[derive(Default)]
struct Failures {
    message_insert: Option<String>,
    upload: Option<String>,
}

struct Shared {
    tables: RwLock<Tables>,
    topics: RwLock<HashMap<String, Topic>>,
    failures: RwLock<Failures>,
    enforce_direct_pairs: bool,
}

#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    user: Option<String>,
}

impl MemoryBackend {
    /// Store with a uniqueness constraint on direct-conversation pairs
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Store without the pair constraint: concurrent resolvers may both create
    pub fn without_pair_constraint() -> Self {
        Self::build(false)
    }

    fn build(enforce_direct_pairs: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                topics: RwLock::new(HashMap::new()),
                failures: RwLock::new(Failures::default()),
                enforce_direct_pairs,
            }),
            user: None,
        }
    }

    /// A session for `user_id` over the same data
    pub fn signed_in(&self, user_id: &str) -> Self {
        Self {
            shared: self.shared.clone(),
            user: Some(user_id.to_string()),
        }
    }

    pub fn signed_out(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            user: None,
        }
    }

    /// Seed a profile (normally created by the signup trigger)
    pub async fn add_profile(&self, profile: Profile) {
        let mut tables = self.shared.tables.write().await;
        tables.profiles.retain(|p| p.id != profile.id);
        tables.profiles.push(profile);
    }

    /// Make every message insert fail with `reason` until cleared
    pub async fn fail_message_inserts(&self, reason: Option<&str>) {
        self.shared.failures.write().await.message_insert = reason.map(str::to_string);
    }

    /// Make every upload fail with `reason` until cleared
    pub async fn fail_uploads(&self, reason: Option<&str>) {
        self.shared.failures.write().await.upload = reason.map(str::to_string);
    }

    pub async fn participants_of(&self, conversation_id: &str) -> Vec<Participant> {
        let tables = self.shared.tables.read().await;
        tables
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn conversation_count(&self) -> usize {
        self.shared.tables.read().await.conversations.len()
    }

    pub async fn stored_object(&self, bucket: &str, path: &str) -> Option<Bytes> {
        let tables = self.shared.tables.read().await;
        tables.objects.get(&object_key(bucket, path)).cloned()
    }

    fn require_user(&self) -> Result<&str> {
        self.user
            .as_deref()
            .ok_or_else(|| ChatError::Unauthorized("no authenticated user".to_string()))
    }

    async fn publish(&self, topic: &str, event: ChannelEvent) {
        let topics = self.shared.topics.read().await;
        if let Some(t) = topics.get(topic) {
            t.publish(event);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key(bucket: &str, path: &str) -> String {
    format!("{}/{}", bucket, path)
}

fn is_participant(tables: &Tables, conversation_id: &str, user_id: &str) -> bool {
    tables
        .participants
        .iter()
        .any(|p| p.conversation_id == conversation_id && p.user_id == user_id)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn current_user(&self) -> Result<Option<String>> {
        Ok(self.user.clone())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let tables = self.shared.tables.read().await;
        Ok(tables.profiles.iter().find(|p| p.id == user_id).cloned())
    }

    async fn search_profiles(&self, query: &str, limit: usize) -> Result<Vec<Profile>> {
        let needle = query.to_lowercase();
        let tables = self.shared.tables.read().await;
        Ok(tables
            .profiles
            .iter()
            .filter(|p| {
                p.username.to_lowercase().contains(&needle)
                    || p
                        .full_name
                        .as_deref()
                        .map(|n| n.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn conversation_profiles(&self, conversation_id: &str) -> Result<Vec<Profile>> {
        let tables = self.shared.tables.read().await;
        Ok(tables
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .filter_map(|p| tables.profiles.iter().find(|profile| profile.id == p.user_id))
            .cloned()
            .collect())
    }

    async fn conversation_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.require_user()?;
        let tables = self.shared.tables.read().await;
        let mut ids: Vec<String> = Vec::new();
        for p in tables.participants.iter().filter(|p| p.user_id == user_id) {
            if !ids.contains(&p.conversation_id) {
                ids.push(p.conversation_id.clone());
            }
        }
        Ok(ids)
    }

    async fn conversation_ids_with_member(
        &self,
        user_id: &str,
        among: &[String],
    ) -> Result<Vec<String>> {
        self.require_user()?;
        let tables = self.shared.tables.read().await;
        let mut ids: Vec<String> = Vec::new();
        for p in tables
            .participants
            .iter()
            .filter(|p| p.user_id == user_id && among.contains(&p.conversation_id))
        {
            if !ids.contains(&p.conversation_id) {
                ids.push(p.conversation_id.clone());
            }
        }
        Ok(ids)
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let tables = self.shared.tables.read().await;
        Ok(tables
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn insert_conversation(&self, new: NewConversation) -> Result<InsertOutcome> {
        self.require_user()?;
        let mut tables = self.shared.tables.write().await;

        if self.shared.enforce_direct_pairs && !new.is_group {
            if let Some(key) = new.direct_key.as_deref() {
                if let Some(existing) = tables
                    .conversations
                    .iter()
                    .find(|c| !c.is_group && c.direct_key.as_deref() == Some(key))
                {
                    debug!("Direct pair {} already has conversation {}", key, existing.id);
                    return Ok(InsertOutcome::Existing(existing.id.clone()));
                }
            }
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            is_group: new.is_group,
            last_message: None,
            last_message_at: None,
            direct_key: new.direct_key,
        };
        tables.conversations.push(conversation.clone());
        Ok(InsertOutcome::Created(conversation))
    }

    async fn update_conversation_preview(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.require_user()?;
        let mut tables = self.shared.tables.write().await;
        let conversation = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;

        if conversation.last_message_at.map_or(true, |prev| at >= prev) {
            conversation.last_message = Some(last_message.to_string());
            conversation.last_message_at = Some(at);
        }
        Ok(())
    }

    async fn insert_participants(&self, rows: Vec<Participant>) -> Result<()> {
        self.require_user()?;
        let mut tables = self.shared.tables.write().await;
        for row in rows {
            if !is_participant(&tables, &row.conversation_id, &row.user_id) {
                tables.participants.push(row);
            }
        }
        Ok(())
    }

    async fn participations(&self, user_id: &str) -> Result<Vec<Participant>> {
        self.require_user()?;
        let tables = self.shared.tables.read().await;
        Ok(tables
            .participants
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn participant(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>> {
        self.require_user()?;
        let tables = self.shared.tables.read().await;
        Ok(tables
            .participants
            .iter()
            .find(|p| p.conversation_id == conversation_id && p.user_id == user_id)
            .cloned())
    }

    async fn set_last_read_at(
        &self,
        conversation_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if self.require_user()? != user_id {
            return Err(ChatError::Unauthorized(
                "read cursors belong to their own user".to_string(),
            ));
        }
        let mut tables = self.shared.tables.write().await;
        let row = tables
            .participants
            .iter_mut()
            .find(|p| p.conversation_id == conversation_id && p.user_id == user_id)
            .ok_or_else(|| ChatError::NotFound(format!("participant row in {}", conversation_id)))?;
        if row.last_read_at.map_or(true, |current| current < at) {
            row.last_read_at = Some(at);
        }
        Ok(row.last_read_at)
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        self.require_user()?;
        let tables = self.shared.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, new: NewMessage) -> Result<MessageRow> {
        let user = self.require_user()?.to_string();
        if let Some(reason) = self.shared.failures.read().await.message_insert.clone() {
            return Err(ChatError::Backend(reason));
        }
        if user != new.sender_id {
            return Err(ChatError::Unauthorized(
                "messages must be sent as the signed-in user".to_string(),
            ));
        }
        if new.content.trim().is_empty() && new.attachments.is_empty() {
            return Err(ChatError::Backend(
                "message needs content or an attachment".to_string(),
            ));
        }

        let row = {
            let mut tables = self.shared.tables.write().await;
            if !is_participant(&tables, &new.conversation_id, &user) {
                return Err(ChatError::Unauthorized(format!(
                    "not a participant of {}",
                    new.conversation_id
                )));
            }
            tables.next_message_id += 1;
            let row = MessageRow {
                id: tables.next_message_id.to_string(),
                conversation_id: new.conversation_id,
                sender_id: new.sender_id,
                receiver_id: new.receiver_id,
                content: new.content,
                attachments: new.attachments,
                created_at: Utc::now(),
                deleted_at: None,
                client_key: new.client_key,
            };
            tables.messages.push(row.clone());
            row
        };

        self.publish(
            &conversation_topic(&row.conversation_id),
            ChannelEvent::MessageInserted(row.clone()),
        )
        .await;
        Ok(row)
    }

    async fn soft_delete_message(&self, message_id: &str, at: DateTime<Utc>) -> Result<MessageRow> {
        let user = self.require_user()?.to_string();
        let row = {
            let mut tables = self.shared.tables.write().await;
            let message = tables
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
            if message.sender_id != user {
                return Err(ChatError::Unauthorized(
                    "only the sender can delete a message".to_string(),
                ));
            }
            if message.deleted_at.is_none() {
                message.deleted_at = Some(at);
            }
            message.clone()
        };

        self.publish(
            &conversation_topic(&row.conversation_id),
            ChannelEvent::MessageUpdated(row.clone()),
        )
        .await;
        Ok(row)
    }

    async fn count_unread(
        &self,
        cursors: &[(String, Option<DateTime<Utc>>)],
    ) -> Result<HashMap<String, u64>> {
        self.require_user()?;
        let tables = self.shared.tables.read().await;
        let mut counts = HashMap::new();
        for (conversation_id, cursor) in cursors {
            let count = tables
                .messages
                .iter()
                .filter(|m| &m.conversation_id == conversation_id)
                .filter(|m| cursor.map_or(true, |c| m.created_at > c))
                .count() as u64;
            counts.insert(conversation_id.clone(), count);
        }
        Ok(counts)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        _content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        self.require_user()?;
        if let Some(reason) = self.shared.failures.read().await.upload.clone() {
            return Err(ChatError::Backend(reason));
        }
        let key = object_key(bucket, path);
        let mut tables = self.shared.tables.write().await;
        if !upsert && tables.objects.contains_key(&key) {
            return Err(ChatError::Backend(format!("object {} already exists", key)));
        }
        tables.objects.insert(key, data);
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://storage/{}/{}", bucket, path)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.require_user()?;
        let events = {
            let mut topics = self.shared.topics.write().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(Topic::new)
                .sender
                .subscribe()
        };

        let handle = MemoryChannel {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            key: Uuid::new_v4().to_string(),
        };
        debug!("Subscribed to {} as {}", topic, handle.key);

        Ok(Subscription {
            topic: topic.to_string(),
            handle: Arc::new(handle),
            events,
        })
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    topic: String,
    key: String,
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<()> {
        let topics = self.shared.topics.read().await;
        let topic = topics
            .get(&self.topic)
            .ok_or_else(|| ChatError::Channel(format!("{} is closed", self.topic)))?;
        topic.publish(ChannelEvent::Broadcast {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    async fn track(&self, meta: PresenceMeta) -> Result<()> {
        let mut topics = self.shared.topics.write().await;
        let topic = topics
            .get_mut(&self.topic)
            .ok_or_else(|| ChatError::Channel(format!("{} is closed", self.topic)))?;
        topic.presence.insert(self.key.clone(), vec![meta]);
        let snapshot = topic.presence.clone();
        topic.publish(ChannelEvent::PresenceSync(snapshot));
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let mut topics = self.shared.topics.write().await;
        if let Some(topic) = topics.get_mut(&self.topic) {
            if topic.presence.remove(&self.key).is_some() {
                let snapshot = topic.presence.clone();
                topic.publish(ChannelEvent::PresenceSync(snapshot));
            }
        }
        Ok(())
    }
}
