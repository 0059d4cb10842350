/// Direct-conversation resolution
///
/// Finds the non-group conversation shared by two users or creates it. The
/// lookup is read-then-write; stores that enforce uniqueness on the canonical
/// pair key answer a losing insert with the existing id, so concurrent
/// resolvers converge. Without that constraint a true race can still yield
/// two conversations for one pair.
use crate::backend::Backend;
use crate::error::{ChatError, Result};
use crate::types::{DirectPair, InsertOutcome, NewConversation, Participant};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct ConversationResolver<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> ConversationResolver<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub async fn resolve_direct_conversation(
        &self,
        self_id: &str,
        other_id: &str,
    ) -> Result<String> {
        if self_id == other_id {
            return Err(ChatError::Validation(
                "Cannot start a conversation with yourself".to_string(),
            ));
        }

        if let Some(existing) = self.find_direct(self_id, other_id).await? {
            debug!("Found direct conversation {} for {} and {}", existing, self_id, other_id);
            return Ok(existing);
        }

        let pair = DirectPair::new(self_id, other_id);
        let outcome = self
            .backend
            .insert_conversation(NewConversation {
                is_group: false,
                direct_key: Some(pair.key()),
            })
            .await?;

        let (conversation_id, created) = match outcome {
            InsertOutcome::Existing(id) => {
                debug!("Lost creation race for {}, using {}", pair.key(), id);
                (id, false)
            }
            InsertOutcome::Created(conversation) => (conversation.id, true),
        };

        // Both paths upsert: a pair conversation never stays without members
        if let Err(e) = self
            .add_participants(&conversation_id, self_id, other_id)
            .await
        {
            error!("Failed to add participants to {}: {}", conversation_id, e);
            return Err(e);
        }

        if created {
            info!("Created direct conversation {} ({})", conversation_id, pair.key());
        }
        Ok(conversation_id)
    }

    async fn add_participants(
        &self,
        conversation_id: &str,
        self_id: &str,
        other_id: &str,
    ) -> Result<()> {
        let rows = [self_id, other_id]
            .into_iter()
            .map(|user_id| Participant {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                last_read_at: None,
            })
            .collect();
        self.backend.insert_participants(rows).await
    }

    /// First non-group conversation both users belong to, in membership order
    async fn find_direct(&self, self_id: &str, other_id: &str) -> Result<Option<String>> {
        let mine = self.backend.conversation_ids_for_user(self_id).await?;
        if mine.is_empty() {
            return Ok(None);
        }

        let shared = self
            .backend
            .conversation_ids_with_member(other_id, &mine)
            .await?;

        for id in shared {
            if let Some(conversation) = self.backend.get_conversation(&id).await? {
                if !conversation.is_group {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }
}
