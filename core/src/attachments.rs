/// Message attachments
///
/// Rows written by older clients store attachments as a JSON-encoded string
/// instead of an array. Both shapes are normalized here; anything unparsable
/// becomes an empty list so the message still renders as text.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
    File,
}

impl AttachmentKind {
    /// Classify an upload by its MIME type
    pub fn from_mime(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.starts_with("image/") {
            AttachmentKind::Image
        } else if content_type.starts_with("audio/") {
            AttachmentKind::Audio
        } else {
            AttachmentKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
}

/// Normalize a raw `attachments` column value
pub fn normalize(value: &Value) -> Vec<Attachment> {
    match value {
        Value::Null => Vec::new(),
        Value::String(encoded) => match serde_json::from_str::<Value>(encoded) {
            // One level of string encoding only
            Ok(Value::Array(items)) => from_items(&items),
            Ok(_) | Err(_) => {
                debug!("Ignoring malformed attachment payload");
                Vec::new()
            }
        },
        Value::Array(items) => from_items(items),
        _ => {
            debug!("Ignoring attachment payload of unexpected shape");
            Vec::new()
        }
    }
}

fn from_items(items: &[Value]) -> Vec<Attachment> {
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<Attachment>(item.clone()).ok())
        .collect()
}

/// Serde hook for the `attachments` field of message rows
pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Vec<Attachment>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.map(|v| normalize(&v)).unwrap_or_default())
}

/// Storage path for a new attachment: `<conversation>/<millis>-<nonce>.<ext>`
pub fn upload_path(conversation_id: &str, file_name: &str, now_millis: i64) -> String {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && !ext.contains('/'))
        .unwrap_or("bin");
    let nonce: u32 = rand::random();
    format!("{}/{}-{:08x}.{}", conversation_id, now_millis, nonce, ext)
}
