use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed-width RFC 3339 timestamps so stored values sort the same way as
/// text and as instants.
pub mod ts {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn now() -> String {
        format(&Utc::now())
    }

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => serializer.serialize_str(&super::format(dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw))),
                None => Ok(None),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    #[serde(rename = "full_name")]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, with = "ts::option")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// A profile flagged online whose `last_seen` is older than `stale_after`
    /// is treated as offline; the process that set it online may have died
    /// before writing the offline flag.
    pub fn is_effectively_online(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.is_online {
            return false;
        }
        match self.last_seen {
            Some(seen) => now - seen <= stale_after,
            None => false,
        }
    }
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(rename = "full_name", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.display_name.is_none()
            && self.avatar_url.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    pub created_by: Uuid,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn ordering_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "ts")]
    pub joined_at: DateTime<Utc>,
    #[serde(default, with = "ts::option")]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "member".to_string()
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            "system" => Ok(MessageKind::System),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Timeline order: creation time, then id for equal timestamps.
    pub fn ordering_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Per-recipient delivery state. `Sent` is never stored; it is the absence
/// of a status row.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    /// Stored states that sit strictly below this one.
    pub fn lower_stored(&self) -> Vec<DeliveryStatus> {
        [DeliveryStatus::Delivered, DeliveryStatus::Read]
            .into_iter()
            .filter(|s| s < self)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStatus {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub status: DeliveryStatus,
    #[serde(with = "ts")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts")]
    pub updated_at: DateTime<Utc>,
}

/// A message row with its sender profile and recipient status rows embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithDetails {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub sender: Option<Profile>,
    #[serde(default, rename = "message_status")]
    pub statuses: Vec<MessageStatus>,
}

impl MessageWithDetails {
    pub fn bare(message: Message) -> Self {
        MessageWithDetails {
            message,
            sender: None,
            statuses: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.message.id
    }

    pub fn ordering_key(&self) -> (DateTime<Utc>, Uuid) {
        self.message.ordering_key()
    }

    pub fn status_for(&self, user_id: Uuid) -> DeliveryStatus {
        self.statuses
            .iter()
            .find(|s| s.user_id == user_id)
            .map(|s| s.status)
            .unwrap_or(DeliveryStatus::Sent)
    }

    /// Check-mark state shown to the sender: read by anyone, else delivered
    /// to anyone, else sent. `None` when `viewer` did not send the message.
    pub fn aggregate_status(&self, viewer: Uuid) -> Option<DeliveryStatus> {
        if self.message.sender_id != viewer {
            return None;
        }
        Some(
            self.statuses
                .iter()
                .map(|s| s.status)
                .max()
                .unwrap_or(DeliveryStatus::Sent),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantWithProfile {
    #[serde(flatten)]
    pub participant: Participant,
    #[serde(default)]
    pub profile: Option<Profile>,
}

/// A conversation as shown in the contact list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    #[serde(default)]
    pub participants: Vec<ParticipantWithProfile>,
    #[serde(default)]
    pub last_message: Option<MessageWithDetails>,
}

impl ConversationSummary {
    pub fn id(&self) -> Uuid {
        self.conversation.id
    }

    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.participants
            .iter()
            .any(|p| p.participant.user_id == user_id && p.participant.is_active())
    }

    pub fn other_participant(&self, viewer: Uuid) -> Option<&ParticipantWithProfile> {
        self.participants
            .iter()
            .find(|p| p.participant.user_id != viewer && p.participant.is_active())
    }

    /// Most recent activity: the last message if any, else creation time.
    pub fn activity_key(&self) -> (DateTime<Utc>, Uuid) {
        match &self.last_message {
            Some(last) => last.ordering_key(),
            None => self.conversation.ordering_key(),
        }
    }

    /// Replaces `last_message` if `candidate` sorts after it. Returns whether
    /// anything changed.
    pub fn offer_last_message(&mut self, candidate: MessageWithDetails) -> bool {
        let newer = match &self.last_message {
            Some(current) => candidate.ordering_key() >= current.ordering_key(),
            None => true,
        };
        if newer {
            self.last_message = Some(candidate);
        }
        newer
    }
}
