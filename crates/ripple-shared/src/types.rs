use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatId(pub Uuid);

impl ChatId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Topic carrying authoritative row events and read receipts.
    pub fn chat_topic(&self) -> String {
        format!("chat:{}", self.0)
    }

    /// Topic carrying call signaling payloads.  The chat id doubles as the
    /// call id: at most one active call per chat.
    pub fn call_topic(&self) -> String {
        format!("call:{}", self.0)
    }

    /// Topic carrying ephemeral typing broadcasts.
    pub fn typing_topic(&self) -> String {
        format!("typing:{}", self.0)
    }
}

impl Default for ChatId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-assigned durable message identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated identifier for a not-yet-acknowledged message.
/// Replaced by a [`MessageId`] once the backend confirms the send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProvisionalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProvisionalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CallLogId(pub Uuid);

impl CallLogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallLogId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

/// Delivery lifecycle of a single message bubble.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Missed,
    Declined,
    Failed,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Declined => "declined",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub role: ChatRole,
    pub joined_at: DateTime<Utc>,
}

/// A conversation (private or group).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    /// Display name; only meaningful for group chats.
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_group: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

impl Chat {
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.iter().any(|p| p.user_id == user)
    }
}

/// An authoritative message row as the backend stores it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub body: Option<String>,
    /// Opaque reference produced by the storage collaborator.
    pub media_url: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub reply_to: Option<MessageId>,
    pub edited: bool,
    pub forwarded: bool,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload of an outbound send before the backend has seen it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageDraft {
    pub body: Option<String>,
    pub media_url: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub reply_to: Option<MessageId>,
    pub forwarded: bool,
}

impl MessageDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// A draft with neither text nor media carries nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.body.as_deref().map_or(true, |b| b.trim().is_empty()) && self.media_url.is_none()
    }
}

/// Last known liveness of a single user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub viewing_chat: Option<ChatId>,
}

/// A call attempt as persisted by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallLogEntry {
    pub chat_id: ChatId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub kind: CallKind,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
}
