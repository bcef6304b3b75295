//! Shared domain model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to the entity a view, notification, or message relates to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EntityRef {
    Channel(String),
    Conversation(String),
}

impl EntityRef {
    pub fn id(&self) -> &str {
        match self {
            EntityRef::Channel(id) | EntityRef::Conversation(id) => id,
        }
    }

    /// Topic segment for this entity, e.g. `channel:42`.
    pub fn topic_segment(&self) -> String {
        match self {
            EntityRef::Channel(id) => format!("channel:{id}"),
            EntityRef::Conversation(id) => format!("conversation:{id}"),
        }
    }
}

/// A server-pushed notification, cached client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// The entity this notification relates to, channel taking precedence
    /// when both references are set.
    pub fn entity(&self) -> Option<EntityRef> {
        if let Some(id) = &self.channel_id {
            return Some(EntityRef::Channel(id.clone()));
        }
        self.conversation_id
            .as_ref()
            .map(|id| EntityRef::Conversation(id.clone()))
    }
}
