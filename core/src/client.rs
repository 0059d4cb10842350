/// Entry point for a signed-in chat client
use crate::backend::Backend;
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::resolver::ConversationResolver;
use crate::types::{ConversationSummary, Profile};
use crate::unread::ReadTracker;
use crate::view::ConversationView;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

pub struct ChatClient<B: Backend> {
    backend: Arc<B>,
    config: Config,
    resolver: ConversationResolver<B>,
    reads: ReadTracker<B>,
}

impl<B: Backend> ChatClient<B> {
    pub fn new(backend: B, config: Config) -> Self {
        Self::with_backend(Arc::new(backend), config)
    }

    pub fn with_backend(backend: Arc<B>, config: Config) -> Self {
        Self {
            resolver: ConversationResolver::new(backend.clone()),
            reads: ReadTracker::new(backend.clone()),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Signed-in user id, or `Unauthorized`
    pub async fn current_user(&self) -> Result<String> {
        self.backend
            .current_user()
            .await?
            .ok_or_else(|| ChatError::Unauthorized("no authenticated user".to_string()))
    }

    pub async fn own_profile(&self) -> Result<Profile> {
        let user_id = self.current_user().await?;
        self.backend
            .get_profile(&user_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("profile {}", user_id)))
    }

    /// Direct conversation with `other_id`, created on first contact
    pub async fn resolve_direct(&self, other_id: &str) -> Result<String> {
        let user_id = self.current_user().await?;
        self.resolver
            .resolve_direct_conversation(&user_id, other_id)
            .await
    }

    pub async fn open_conversation(&self, conversation_id: &str) -> Result<ConversationView<B>> {
        let user_id = self.current_user().await?;
        ConversationView::open(
            self.backend.clone(),
            self.config.clone(),
            &user_id,
            conversation_id,
        )
        .await
    }

    /// Resolve the direct conversation with `other_id` and open it
    pub async fn start_direct(&self, other_id: &str) -> Result<ConversationView<B>> {
        let conversation_id = self.resolve_direct(other_id).await?;
        self.open_conversation(&conversation_id).await
    }

    pub async fn inbox(&self) -> Result<Vec<ConversationSummary>> {
        self.reads.inbox().await
    }

    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.reads.mark_as_read(conversation_id).await
    }

    pub async fn mark_read_at(
        &self,
        conversation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.reads.mark_read_at(conversation_id, at).await
    }

    /// Users matching `query` by username or full name, excluding the caller.
    /// Short queries return nothing.
    pub async fn search_users(&self, query: &str) -> Result<Vec<Profile>> {
        let user_id = self.current_user().await?;
        let query = query.trim();
        if query.chars().count() < self.config.search_min_chars {
            return Ok(Vec::new());
        }

        let limit = self.config.search_limit;
        match self.backend.search_profiles(query, limit + 1).await {
            Ok(found) => Ok(found
                .into_iter()
                .filter(|p| p.id != user_id)
                .take(limit)
                .collect()),
            Err(e) => {
                warn!("User search failed: {}", e);
                Ok(Vec::new())
            }
        }
    }
}
