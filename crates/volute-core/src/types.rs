use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// One block of message content, as stored in conversations and sent to minds.
///
/// Serialized with a `type` tag so the wire form matches the daemon's JSON
/// contract: `{"type":"text","text":"hi"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Image {
        media_type: String,
        /// Base64-encoded image bytes.
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// The text payload, when this block carries one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One NDJSON line of a mind's streaming response.
///
/// The stream always terminates with `Done`; `Usage` appears once per
/// completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MindEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    Image {
        media_type: String,
        data: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    Done,
}

/// Maturity flag for a mind. Seeds are gated from scheduling, connectors,
/// and variants until they are sprouted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Seed,
    Sprouted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Seed => write!(f, "seed"),
            Stage::Sprouted => write!(f, "sprouted"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "seed" => Ok(Stage::Seed),
            "sprouted" => Ok(Stage::Sprouted),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// Account role hierarchy. The first registered user becomes `Admin`;
/// everyone after starts as `Pending` until promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Pending,
    Admin,
    User,
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, UserRole::Admin)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Pending => write!(f, "pending"),
            UserRole::Admin => write!(f, "admin"),
            UserRole::User => write!(f, "user"),
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UserRole::Pending),
            "admin" => Ok(UserRole::Admin),
            "user" => Ok(UserRole::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Whether an account is a human or one of the daemon's own minds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    #[default]
    Brain,
    Mind,
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKind::Brain => write!(f, "brain"),
            UserKind::Mind => write!(f, "mind"),
        }
    }
}

impl std::str::FromStr for UserKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "brain" => Ok(UserKind::Brain),
            "mind" => Ok(UserKind::Mind),
            other => Err(format!("unknown user type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Dm,
    Group,
    Channel,
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKind::Dm => write!(f, "dm"),
            ConversationKind::Group => write!(f, "group"),
            ConversationKind::Channel => write!(f, "channel"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dm" => Ok(ConversationKind::Dm),
            "group" => Ok(ConversationKind::Group),
            "channel" => Ok(ConversationKind::Channel),
            other => Err(format!("unknown conversation type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("unknown message role: {}", other)),
        }
    }
}

/// Kinds of activity the daemon persists and broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    MindStarted,
    MindStopped,
    MindActive,
    MindIdle,
    MindDone,
    PageUpdated,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityKind::MindStarted => "mind_started",
            ActivityKind::MindStopped => "mind_stopped",
            ActivityKind::MindActive => "mind_active",
            ActivityKind::MindIdle => "mind_idle",
            ActivityKind::MindDone => "mind_done",
            ActivityKind::PageUpdated => "page_updated",
        };
        f.write_str(s)
    }
}

/// A mind address: either a base mind (`alice`) or one of its variants
/// (`alice@experiment`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MindRef {
    pub base: String,
    pub variant: Option<String>,
}

impl MindRef {
    /// Parse `base` or `base@variant`. Empty components are rejected.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.split_once('@') {
            None => {
                if s.is_empty() {
                    return Err(CoreError::InvalidMindRef(s.to_string()));
                }
                Ok(Self {
                    base: s.to_string(),
                    variant: None,
                })
            }
            Some((base, variant)) => {
                if base.is_empty() || variant.is_empty() || variant.contains('@') {
                    return Err(CoreError::InvalidMindRef(s.to_string()));
                }
                Ok(Self {
                    base: base.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
        }
    }

    pub fn is_variant(&self) -> bool {
        self.variant.is_some()
    }

    /// Canonical string form: `base` or `base@variant`.
    pub fn canonical(&self) -> String {
        match &self.variant {
            Some(v) => format!("{}@{}", self.base, v),
            None => self.base.clone(),
        }
    }
}

impl fmt::Display for MindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// The conversation id inside a `volute:<id>` channel URI, if this channel
/// names one.
pub fn volute_conversation(channel: &str) -> Option<&str> {
    channel.strip_prefix("volute:").filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_wire_shape() {
        let block = ContentBlock::text("hi");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hi"}));
    }

    #[test]
    fn mind_event_done_parses() {
        let ev: MindEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(ev, MindEvent::Done);
    }

    #[test]
    fn mind_event_usage_parses() {
        let ev: MindEvent =
            serde_json::from_str(r#"{"type":"usage","input_tokens":10,"output_tokens":5}"#)
                .unwrap();
        assert_eq!(
            ev,
            MindEvent::Usage {
                input_tokens: 10,
                output_tokens: 5
            }
        );
    }

    #[test]
    fn mind_ref_base_only() {
        let r = MindRef::parse("alice").unwrap();
        assert_eq!(r.base, "alice");
        assert!(!r.is_variant());
        assert_eq!(r.canonical(), "alice");
    }

    #[test]
    fn mind_ref_with_variant() {
        let r = MindRef::parse("alice@exp").unwrap();
        assert_eq!(r.variant.as_deref(), Some("exp"));
        assert_eq!(r.canonical(), "alice@exp");
    }

    #[test]
    fn mind_ref_rejects_empty_parts() {
        assert!(MindRef::parse("").is_err());
        assert!(MindRef::parse("@exp").is_err());
        assert!(MindRef::parse("alice@").is_err());
        assert!(MindRef::parse("a@b@c").is_err());
    }

    #[test]
    fn volute_channel_extraction() {
        assert_eq!(volute_conversation("volute:abc"), Some("abc"));
        assert_eq!(volute_conversation("discord:123"), None);
        assert_eq!(volute_conversation("volute:"), None);
    }
}
