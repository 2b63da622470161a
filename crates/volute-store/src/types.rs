use serde::{Deserialize, Serialize};
use volute_core::types::{ContentBlock, ConversationKind, MessageRole, UserKind, UserRole};

/// A registered account, human (`brain`) or agent (`mind`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: UserRole,
    pub user_type: UserKind,
    pub created_at: String,
}

impl User {
    /// The implicit identity behind a valid daemon bearer token. Never
    /// stored; bypasses participant checks.
    pub fn daemon() -> Self {
        Self {
            id: 0,
            username: "daemon".to_string(),
            password_hash: String::new(),
            role: UserRole::Admin,
            user_type: UserKind::Brain,
            created_at: String::new(),
        }
    }

    pub fn is_daemon(&self) -> bool {
        self.id == 0
    }
}

/// A browser session cookie row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque random id, doubles as the cookie value.
    pub id: String,
    pub user_id: i64,
    /// Unix milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// None for daemon-internal channels.
    pub mind_name: Option<String>,
    /// Origin URI such as `discord:<id>`, `volute:<conv>`, `system:*`.
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    /// Unique among channel conversations; None otherwise.
    pub name: Option<String>,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user: User,
    pub role: ParticipantRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Member,
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipantRole::Owner => write!(f, "owner"),
            ParticipantRole::Member => write!(f, "member"),
        }
    }
}

impl std::str::FromStr for ParticipantRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "owner" => Ok(ParticipantRole::Owner),
            "member" => Ok(ParticipantRole::Member),
            other => Err(format!("unknown participant role: {}", other)),
        }
    }
}

/// A persisted conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub sender_name: Option<String>,
    pub content: Vec<ContentBlock>,
    pub created_at: String,
}

/// One row of a mind's append-only history trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub mind: String,
    pub channel: Option<String>,
    pub session: Option<String>,
    pub sender: Option<String>,
    pub message_id: Option<i64>,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

/// A message parked for an offline mind, replayed on its next start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEntry {
    pub id: i64,
    pub mind: String,
    pub session: Option<String>,
    pub channel: Option<String>,
    pub sender: Option<String>,
    pub status: DeliveryStatus,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// A persisted activity event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRow {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub mind: String,
    pub summary: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}
