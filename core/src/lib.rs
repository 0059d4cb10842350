/// VibeChat core - conversation resolution and realtime message reconciliation
///
/// Persistence, auth, storage and pub/sub belong to a hosted backend reached
/// through the `Backend` facade. This crate decides which direct
/// conversation two users share, keeps each open conversation's timeline
/// consistent across optimistic sends and realtime echoes, and tracks
/// typing, presence and unread state.

pub mod attachments;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod presence;
pub mod resolver;
pub mod timeline;
pub mod types;
pub mod unread;
pub mod view;

pub use backend::{Backend, MemoryBackend};
pub use client::ChatClient;
pub use config::Config;
pub use error::{ChatError, Result};
pub use view::ConversationView;
