//! Record types for every buffered fact.
//!
//! Each record corresponds to one row in a fact table. Records are created by
//! the ingest gateway, buffered by the event buffer (serialized to the journal
//! as JSON), and applied to the store by the batch flusher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The logical category of a buffered record.
///
/// Determines the target fact table and the apply policy used by the flusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Message,
    MessageEdit,
    Mention,
    VoiceSession,
    VoiceAggregate,
    Emoji,
    Invite,
    MemberEvent,
}

impl RecordKind {
    /// All kinds, in flush order.
    pub const ALL: [RecordKind; 8] = [
        RecordKind::Message,
        RecordKind::MessageEdit,
        RecordKind::Mention,
        RecordKind::VoiceSession,
        RecordKind::VoiceAggregate,
        RecordKind::Emoji,
        RecordKind::Invite,
        RecordKind::MemberEvent,
    ];

    /// Stable string name, used in journal rows and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::MessageEdit => "message_edit",
            Self::Mention => "mention",
            Self::VoiceSession => "voice_session",
            Self::VoiceAggregate => "voice_aggregate",
            Self::Emoji => "emoji",
            Self::Invite => "invite",
            Self::MemberEvent => "member_event",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `message_tracking` fact table.
///
/// `message_id` is the dedup key: redelivery of the same message must not
/// produce a second row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub message_id: i64,
    /// Display name, already passed through the privacy codec.
    pub display_name: String,
    pub length: i32,
    pub mention_ids: Vec<i64>,
    pub has_attachment: bool,
    pub has_embed: bool,
    pub created_at: DateTime<Utc>,
    pub is_bot: bool,
}

/// One row of the `message_edits` fact table (append-only edit history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEditRecord {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub message_id: i64,
    pub new_length: i32,
    pub edited_at: DateTime<Utc>,
}

/// One row of the `mention_tracking` fact table.
///
/// Dedup key is `(message_id, mentioned_user_id)`: one row per mentioned user
/// per message, however often the event is redelivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionRecord {
    pub tenant_id: i64,
    pub mentioned_user_id: i64,
    pub mentioner_user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub message_id: i64,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the `voice_sessions` fact table (append-only session history).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSessionRecord {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub display_name: String,
    pub join_time: DateTime<Utc>,
    pub leave_time: DateTime<Utc>,
    pub duration_seconds: i64,
    /// 8-bit mask over the voice attributes at session close.
    pub state_flags: u8,
    // Convenience booleans mirrored from the mask for cheap filtering.
    pub afk: bool,
    pub muted: bool,
    pub deafened: bool,
    pub streaming: bool,
}

/// An incremental delta for the `voice_time_aggregates` table.
///
/// Applied as an upsert keyed by `(tenant, user, channel, state_flags)`;
/// `duration_seconds` only ever grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceTimeAggregate {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub state_flags: u8,
    /// Human-readable label for the flag combination (see [`crate::flags::state_category`]).
    pub state_category: String,
    pub duration_seconds: i64,
    pub last_updated: DateTime<Utc>,
}

/// Where an emoji usage was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmojiUsageType {
    Message,
    Reaction,
}

impl EmojiUsageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reaction => "reaction",
        }
    }
}

/// One row of the `emoji_usage` fact table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmojiUsageRecord {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub emoji_token: String,
    pub is_custom: bool,
    pub usage_count: i64,
    pub last_used: DateTime<Utc>,
    pub usage_type: EmojiUsageType,
}

/// Classification of an invite event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteType {
    Valid,
    Suspicious,
    Left,
}

impl InviteType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Suspicious => "suspicious",
            Self::Left => "left",
        }
    }
}

/// One row of the `invite_events` fact table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteEvent {
    pub tenant_id: i64,
    pub inviter_id: i64,
    pub invitee_id: Option<i64>,
    pub invite_code: String,
    pub invite_type: InviteType,
    pub created_at: DateTime<Utc>,
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberEventKind {
    Joined,
    Left,
}

impl MemberEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Left => "left",
        }
    }
}

/// One row of the `member_events` fact table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEvent {
    pub tenant_id: i64,
    pub user_id: i64,
    pub event_kind: MemberEventKind,
    pub display_name: String,
    pub occurred_at: DateTime<Utc>,
}

/// The typed payload of a buffered record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
    Message(MessageRecord),
    MessageEdit(MessageEditRecord),
    Mention(MentionRecord),
    VoiceSession(VoiceSessionRecord),
    VoiceAggregate(VoiceTimeAggregate),
    Emoji(EmojiUsageRecord),
    Invite(InviteEvent),
    MemberEvent(MemberEvent),
}

impl EventRecord {
    /// The batch lane this record belongs to.
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Message(_) => RecordKind::Message,
            Self::MessageEdit(_) => RecordKind::MessageEdit,
            Self::Mention(_) => RecordKind::Mention,
            Self::VoiceSession(_) => RecordKind::VoiceSession,
            Self::VoiceAggregate(_) => RecordKind::VoiceAggregate,
            Self::Emoji(_) => RecordKind::Emoji,
            Self::Invite(_) => RecordKind::Invite,
            Self::MemberEvent(_) => RecordKind::MemberEvent,
        }
    }

    /// Reject records with missing or nonsensical required fields.
    ///
    /// Enqueue-time check: a record that fails here is counted and dropped,
    /// never retried.
    pub fn validate(&self) -> Result<()> {
        fn require_id(field: &'static str, value: i64) -> Result<()> {
            if value > 0 {
                Ok(())
            } else {
                Err(Error::InvalidField {
                    field,
                    reason: format!("must be a positive id, got {value}"),
                })
            }
        }

        match self {
            Self::Message(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("user_id", r.user_id)?;
                require_id("channel_id", r.channel_id)?;
                require_id("message_id", r.message_id)?;
                if r.length < 0 {
                    return Err(Error::InvalidField {
                        field: "length",
                        reason: "must be non-negative".to_string(),
                    });
                }
                Ok(())
            }
            Self::MessageEdit(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("user_id", r.user_id)?;
                require_id("message_id", r.message_id)
            }
            Self::Mention(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("mentioned_user_id", r.mentioned_user_id)?;
                require_id("mentioner_user_id", r.mentioner_user_id)?;
                require_id("message_id", r.message_id)
            }
            Self::VoiceSession(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("user_id", r.user_id)?;
                require_id("channel_id", r.channel_id)?;
                if r.duration_seconds < 0 {
                    return Err(Error::InvalidField {
                        field: "duration_seconds",
                        reason: "must be non-negative".to_string(),
                    });
                }
                Ok(())
            }
            Self::VoiceAggregate(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("user_id", r.user_id)?;
                require_id("channel_id", r.channel_id)?;
                if r.duration_seconds < 0 {
                    return Err(Error::InvalidField {
                        field: "duration_seconds",
                        reason: "delta must be non-negative".to_string(),
                    });
                }
                Ok(())
            }
            Self::Emoji(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("user_id", r.user_id)?;
                if r.emoji_token.is_empty() {
                    return Err(Error::InvalidField {
                        field: "emoji_token",
                        reason: "must not be empty".to_string(),
                    });
                }
                Ok(())
            }
            Self::Invite(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("inviter_id", r.inviter_id)?;
                if r.invite_code.is_empty() {
                    return Err(Error::InvalidField {
                        field: "invite_code",
                        reason: "must not be empty".to_string(),
                    });
                }
                Ok(())
            }
            Self::MemberEvent(r) => {
                require_id("tenant_id", r.tenant_id)?;
                require_id("user_id", r.user_id)
            }
        }
    }
}

/// A record held by the event buffer until flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub record: EventRecord,
    pub enqueued_at: DateTime<Utc>,
}

impl BufferedRecord {
    pub fn new(record: EventRecord) -> Self {
        Self {
            record,
            enqueued_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.record.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_message(message_id: i64) -> MessageRecord {
        MessageRecord {
            tenant_id: 100,
            user_id: 200,
            channel_id: 300,
            category_id: Some(400),
            message_id,
            display_name: "enc:abc".to_string(),
            length: 5,
            mention_ids: vec![],
            has_attachment: false,
            has_embed: false,
            created_at: Utc::now(),
            is_bot: false,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_message() {
        let record = EventRecord::Message(sample_message(1));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_tenant() {
        let mut msg = sample_message(1);
        msg.tenant_id = 0;
        let err = EventRecord::Message(msg).validate().unwrap_err();
        assert!(err.to_string().contains("tenant_id"));
    }

    #[test]
    fn test_validate_rejects_negative_length() {
        let mut msg = sample_message(1);
        msg.length = -1;
        assert!(EventRecord::Message(msg).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_emoji_token() {
        let record = EventRecord::Emoji(EmojiUsageRecord {
            tenant_id: 1,
            user_id: 2,
            channel_id: 3,
            category_id: None,
            emoji_token: String::new(),
            is_custom: false,
            usage_count: 1,
            last_used: Utc::now(),
            usage_type: EmojiUsageType::Reaction,
        });
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_record_kind_mapping() {
        let record = EventRecord::Message(sample_message(1));
        assert_eq!(record.kind(), RecordKind::Message);
        assert_eq!(record.kind().as_str(), "message");
    }

    #[test]
    fn test_journal_round_trip() {
        let buffered = BufferedRecord::new(EventRecord::Message(sample_message(7)));
        let json = serde_json::to_string(&buffered).unwrap();
        let back: BufferedRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), RecordKind::Message);
        match back.record {
            EventRecord::Message(m) => assert_eq!(m.message_id, 7),
            other => panic!("unexpected record: {other:?}"),
        }
    }
}
