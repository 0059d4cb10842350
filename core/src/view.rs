/// One open conversation: history snapshot, realtime subscription, the send
/// path and typing/presence state
use crate::attachments::{self, Attachment, AttachmentKind};
use crate::backend::{
    conversation_topic, Backend, ChannelEvent, ChannelHandle, PresenceMeta, TypingPayload,
    TYPING_EVENT,
};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::presence::PresenceTracker;
use crate::timeline::{Applied, TempIdClock, Timeline, TimelineAction, TimelineEntry};
use crate::types::{MessageRow, NewMessage};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{unfold, Stream};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A file picked for sending
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Effect of one realtime event on the view
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    Timeline(Applied),
    Typing,
    Presence,
    Ignored,
}

pub struct ConversationView<B: Backend> {
    backend: Arc<B>,
    config: Config,
    self_id: String,
    other_id: Option<String>,
    timeline: Timeline,
    presence: PresenceTracker,
    temp_ids: TempIdClock,
    channel: Arc<dyn ChannelHandle>,
    events: broadcast::Receiver<ChannelEvent>,
}

impl<B: Backend> ConversationView<B> {
    /// Subscribe to the conversation channel, load recent history and
    /// announce presence
    pub async fn open(
        backend: Arc<B>,
        config: Config,
        self_id: &str,
        conversation_id: &str,
    ) -> Result<Self> {
        let conversation = backend
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", conversation_id)))?;

        let other_id = if conversation.is_group {
            None
        } else {
            backend
                .conversation_profiles(conversation_id)
                .await?
                .into_iter()
                .map(|p| p.id)
                .find(|id| id != self_id)
        };

        // Subscribe before fetching so nothing falls between the two
        let subscription = backend.subscribe(&conversation_topic(conversation_id)).await?;

        let mut view = Self {
            presence: PresenceTracker::new(self_id, config.typing_window, config.typing_decay),
            timeline: Timeline::new(conversation_id, self_id),
            temp_ids: TempIdClock::new(),
            channel: subscription.handle,
            events: subscription.events,
            self_id: self_id.to_string(),
            other_id,
            backend,
            config,
        };

        view.refresh().await?;

        if let Err(e) = view.channel.track(PresenceMeta::online(self_id)).await {
            warn!("Failed to announce presence on {}: {}", subscription.topic, e);
        }

        info!("Opened conversation {} ({} messages)", conversation_id, view.timeline.len());
        Ok(view)
    }

    /// Reload the most recent history. Transient failures keep the current
    /// entries and are only logged.
    pub async fn refresh(&mut self) -> Result<()> {
        match self
            .backend
            .recent_messages(self.timeline.conversation_id(), self.config.history_limit)
            .await
        {
            Ok(rows) => {
                self.timeline.apply(TimelineAction::Snapshot(rows));
                Ok(())
            }
            Err(e) if e.is_unauthorized() => Err(e),
            Err(e) => {
                warn!("Failed to load messages for {}: {}", self.timeline.conversation_id(), e);
                Ok(())
            }
        }
    }

    pub fn conversation_id(&self) -> &str {
        self.timeline.conversation_id()
    }

    pub fn other_user_id(&self) -> Option<&str> {
        self.other_id.as_deref()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Whether the other party is typing right now
    pub fn is_typing(&self) -> bool {
        self.presence.is_typing(Instant::now())
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn other_party_online(&self) -> bool {
        self.presence.other_party_online()
    }

    /// Apply one realtime event
    pub fn handle_event(&mut self, event: ChannelEvent, now: Instant) -> ViewChange {
        match event {
            ChannelEvent::MessageInserted(row) => {
                ViewChange::Timeline(self.timeline.apply(TimelineAction::Inserted(row)))
            }
            ChannelEvent::MessageUpdated(row) => {
                ViewChange::Timeline(self.timeline.apply(TimelineAction::Updated(row)))
            }
            ChannelEvent::Broadcast { event, payload } if event == TYPING_EVENT => {
                match serde_json::from_value::<TypingPayload>(payload) {
                    Ok(typing) => {
                        if self.presence.on_typing_broadcast(&typing, now) {
                            ViewChange::Typing
                        } else {
                            ViewChange::Ignored
                        }
                    }
                    Err(e) => {
                        debug!("Ignoring malformed typing payload: {}", e);
                        ViewChange::Ignored
                    }
                }
            }
            ChannelEvent::Broadcast { .. } => ViewChange::Ignored,
            ChannelEvent::PresenceSync(state) => {
                self.presence.on_presence_sync(&state);
                ViewChange::Presence
            }
        }
    }

    /// Apply every event already queued on the channel without waiting
    pub async fn pump(&mut self) -> Result<Vec<ViewChange>> {
        let mut changes = Vec::new();
        let mut lagged = false;
        loop {
            match self.events.try_recv() {
                Ok(event) => changes.push(self.handle_event(event, Instant::now())),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Conversation {} lagged {} events", self.conversation_id(), n);
                    lagged = true;
                }
                Err(TryRecvError::Closed) => {
                    return Err(ChatError::Channel(format!(
                        "channel for {} closed",
                        self.conversation_id()
                    )))
                }
            }
        }
        if lagged {
            self.refresh().await?;
        }
        Ok(changes)
    }

    /// Wait for the next realtime event and apply it
    pub async fn next_event(&mut self) -> Result<ViewChange> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Ok(self.handle_event(event, Instant::now())),
                Err(RecvError::Lagged(n)) => {
                    warn!("Conversation {} lagged {} events", self.conversation_id(), n);
                    self.refresh().await?;
                }
                Err(RecvError::Closed) => {
                    return Err(ChatError::Channel(format!(
                        "channel for {} closed",
                        self.conversation_id()
                    )))
                }
            }
        }
    }

    /// Realtime changes as a stream for a render loop; ends when the channel
    /// closes or a refresh after lag fails
    pub fn changes(&mut self) -> impl Stream<Item = ViewChange> + '_ {
        unfold(self, |view| async move {
            match view.next_event().await {
                Ok(change) => Some((change, view)),
                Err(e) => {
                    debug!("Change stream for {} ended: {}", view.conversation_id(), e);
                    None
                }
            }
        })
    }

    /// Local keystroke: broadcast a typing signal unless one is already live
    pub async fn on_input(&mut self) -> Result<()> {
        let Some(payload) = self.presence.on_local_input(Instant::now()) else {
            return Ok(());
        };
        let payload = serde_json::to_value(payload)?;
        if let Err(e) = self.channel.broadcast(TYPING_EVENT, payload).await {
            warn!("Failed to broadcast typing on {}: {}", self.conversation_id(), e);
        }
        Ok(())
    }

    pub async fn send_text(&mut self, content: &str) -> Result<MessageRow> {
        self.send(content, Vec::new()).await
    }

    /// Upload a file and send it as an attachment-only message. Nothing is
    /// sent when the upload fails.
    pub async fn send_attachment(&mut self, upload: Upload) -> Result<MessageRow> {
        let path = attachments::upload_path(
            self.conversation_id(),
            &upload.file_name,
            Utc::now().timestamp_millis(),
        );
        let bucket = self.config.attachment_bucket.clone();

        if let Err(e) = self
            .backend
            .upload(&bucket, &path, upload.data, &upload.content_type, false)
            .await
        {
            error!("Upload of {} failed: {}", upload.file_name, e);
            return Err(match e {
                ChatError::Unauthorized(_) => e,
                other => ChatError::Upload(other.to_string()),
            });
        }

        let attachment = Attachment {
            kind: AttachmentKind::from_mime(&upload.content_type),
            url: self.backend.public_url(&bucket, &path),
            name: upload.file_name,
        };
        self.send("", vec![attachment]).await
    }

    async fn send(&mut self, content: &str, attachments: Vec<Attachment>) -> Result<MessageRow> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::Validation("Message is empty".to_string()));
        }
        if content.chars().count() > self.config.max_message_len {
            return Err(ChatError::Validation(format!(
                "Message is longer than {} characters",
                self.config.max_message_len
            )));
        }

        let message = NewMessage {
            conversation_id: self.conversation_id().to_string(),
            sender_id: self.self_id.clone(),
            receiver_id: self.other_id.clone(),
            content: content.to_string(),
            attachments,
            client_key: Some(Uuid::new_v4()),
        };

        let temp_id = self.temp_ids.next();
        self.timeline.apply(TimelineAction::Optimistic(TimelineEntry::optimistic(
            temp_id,
            &message,
            Utc::now(),
        )));
        self.presence.on_local_send();

        let row = match self.backend.insert_message(message.clone()).await {
            Ok(row) => row,
            Err(e) => {
                self.timeline.apply(TimelineAction::SendFailed { temp_id });
                error!("Failed to send message in {}: {}", self.conversation_id(), e);
                return Err(match e {
                    ChatError::Unauthorized(_) => e,
                    other => ChatError::Send(other.to_string()),
                });
            }
        };

        self.timeline.apply(TimelineAction::Inserted(row.clone()));

        if let Err(e) = self
            .backend
            .update_conversation_preview(self.conversation_id(), &message.preview(), row.created_at)
            .await
        {
            warn!("Failed to update preview of {}: {}", self.conversation_id(), e);
        }
        Ok(row)
    }

    /// Soft-delete one of the local user's messages
    pub async fn delete_message(&mut self, message_id: &str) -> Result<()> {
        let entry = self
            .timeline
            .get(message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        if entry.sender_id != self.self_id {
            return Err(ChatError::Unauthorized(
                "You can only delete your own messages".to_string(),
            ));
        }
        if entry.is_deleted() {
            return Ok(());
        }

        let row = self
            .backend
            .soft_delete_message(message_id, Utc::now())
            .await?;
        self.timeline.apply(TimelineAction::Updated(row));
        Ok(())
    }

    /// Leave the channel
    pub async fn close(self) -> Result<()> {
        self.channel.unsubscribe().await
    }
}
