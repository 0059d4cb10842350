/// Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// No signed-in user, or a row-level policy rejected the call
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether the caller should be sent back to the login entry point
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ChatError::Unauthorized(_))
    }

    /// Short text for the dismissible notification shown to the user
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Unauthorized(_) => "Please sign in again".to_string(),
            ChatError::Send(_) => "Failed to send message".to_string(),
            ChatError::Upload(_) => "Upload failed".to_string(),
            ChatError::Validation(reason) => reason.clone(),
            ChatError::NotFound(_) => "Conversation not found".to_string(),
            _ => "Something went wrong".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
