/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_ATTACHMENT_BUCKET: &str = "chat-attachments";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of most recent messages loaded when a conversation opens
    pub history_limit: usize,

    /// How long the local user counts as typing after their last keystroke
    pub typing_window: Duration,

    /// How long a remote typing broadcast keeps the indicator on
    pub typing_decay: Duration,

    /// Maximum message length in characters
    pub max_message_len: usize,

    /// Storage bucket for message attachments
    pub attachment_bucket: String,

    /// Shortest query that triggers a user search
    pub search_min_chars: usize,

    /// Maximum number of search results
    pub search_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_limit: 50,
            typing_window: Duration::from_secs(3),
            typing_decay: Duration::from_secs(3),
            max_message_len: 2000,
            attachment_bucket: DEFAULT_ATTACHMENT_BUCKET.to_string(),
            search_min_chars: 2,
            search_limit: 10,
        }
    }
}

impl Config {
    /// Defaults with `VIBECHAT_*` environment overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides taken from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("VIBECHAT_HISTORY_LIMIT") {
            config.history_limit = parse_positive("VIBECHAT_HISTORY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("VIBECHAT_TYPING_WINDOW_MS") {
            config.typing_window =
                Duration::from_millis(parse_positive("VIBECHAT_TYPING_WINDOW_MS", &v)? as u64);
        }
        if let Some(v) = lookup("VIBECHAT_TYPING_DECAY_MS") {
            config.typing_decay =
                Duration::from_millis(parse_positive("VIBECHAT_TYPING_DECAY_MS", &v)? as u64);
        }
        if let Some(v) = lookup("VIBECHAT_MAX_MESSAGE_LEN") {
            config.max_message_len = parse_positive("VIBECHAT_MAX_MESSAGE_LEN", &v)?;
        }
        if let Some(v) = lookup("VIBECHAT_SEARCH_LIMIT") {
            config.search_limit = parse_positive("VIBECHAT_SEARCH_LIMIT", &v)?;
        }
        if let Some(v) = lookup("VIBECHAT_ATTACHMENT_BUCKET") {
            let bucket = v.trim();
            if bucket.is_empty() {
                return Err(ChatError::Config(
                    "VIBECHAT_ATTACHMENT_BUCKET must not be empty".to_string(),
                ));
            }
            config.attachment_bucket = bucket.to_string();
        }

        Ok(config)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ChatError::Config(format!(
            "{} must be a positive number, got '{}'",
            key, value
        ))),
    }
}
