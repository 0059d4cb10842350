/// Unread counts and read cursors
use crate::backend::Backend;
use crate::error::{ChatError, Result};
use crate::types::{ConversationSummary, MessageRow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Messages created strictly after the cursor. A missing cursor means the
/// conversation was never read, so everything counts.
pub fn unread_count(messages: &[MessageRow], last_read_at: Option<DateTime<Utc>>) -> u64 {
    messages
        .iter()
        .filter(|m| last_read_at.map_or(true, |cursor| m.created_at > cursor))
        .count() as u64
}

/// Per-user read position that only moves forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor(Option<DateTime<Utc>>);

impl ReadCursor {
    pub fn new(at: Option<DateTime<Utc>>) -> Self {
        Self(at)
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// Move to `to` if that is later; returns whether it moved
    pub fn advance(&mut self, to: DateTime<Utc>) -> bool {
        match self.0 {
            Some(current) if current >= to => false,
            _ => {
                self.0 = Some(to);
                true
            }
        }
    }
}

/// Read-cursor writes and the conversation list
pub struct ReadTracker<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> ReadTracker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    async fn require_user(&self) -> Result<String> {
        self.backend
            .current_user()
            .await?
            .ok_or_else(|| ChatError::Unauthorized("no authenticated user".to_string()))
    }

    /// Mark everything up to now as read
    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.mark_read_at(conversation_id, Utc::now()).await
    }

    /// Advance the caller's cursor to `at`. Never moves it backward; returns
    /// the cursor in effect afterwards.
    pub async fn mark_read_at(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let user_id = self.require_user().await?;
        let participant = self
            .backend
            .participant(conversation_id, &user_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;

        let mut cursor = ReadCursor::new(participant.last_read_at);
        if !cursor.advance(at) {
            debug!("Read cursor for {} already at or past {}", conversation_id, at);
            return Ok(cursor.get());
        }

        // The store applies the same guard, so overlapping calls cannot regress it
        self.backend
            .set_last_read_at(conversation_id, &user_id, at)
            .await
    }

    /// The caller's conversations with participants and unread counts, most
    /// recently active first. Read failures degrade to an empty list.
    pub async fn inbox(&self) -> Result<Vec<ConversationSummary>> {
        let user_id = self.require_user().await?;

        let participations = match self.backend.participations(&user_id).await {
            Ok(p) => p,
            Err(e) if e.is_unauthorized() => return Err(e),
            Err(e) => {
                warn!("Failed to load conversations: {}", e);
                return Ok(Vec::new());
            }
        };
        if participations.is_empty() {
            return Ok(Vec::new());
        }

        let cursors: Vec<(String, Option<DateTime<Utc>>)> = participations
            .iter()
            .map(|p| (p.conversation_id.clone(), p.last_read_at))
            .collect();
        let counts: HashMap<String, u64> = match self.backend.count_unread(&cursors).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to count unread messages: {}", e);
                HashMap::new()
            }
        };

        let mut summaries = Vec::with_capacity(participations.len());
        for participation in participations {
            let conversation_id = &participation.conversation_id;
            let conversation = match self.backend.get_conversation(conversation_id).await {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load conversation {}: {}", conversation_id, e);
                    continue;
                }
            };
            let participants = self
                .backend
                .conversation_profiles(&conversation.id)
                .await
                .unwrap_or_else(|e| {
                    warn!("Failed to load participants of {}: {}", conversation.id, e);
                    Vec::new()
                });

            summaries.push(ConversationSummary {
                unread_count: counts.get(&conversation.id).copied().unwrap_or(0),
                last_read_at: participation.last_read_at,
                participants,
                conversation,
            });
        }

        // Newest activity first, never-messaged conversations last
        summaries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
        });
        Ok(summaries)
    }
}
