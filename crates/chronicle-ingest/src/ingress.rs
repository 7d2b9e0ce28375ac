//! Ingest gateway: turns platform events into buffered records.
//!
//! This is the write-side entry point. Each handler is fire-and-forget from
//! the caller's perspective: events are validated, rate limited, stripped of
//! plain display names, fanned out into one or more records, and enqueued.
//! When the journal cannot accept writes the gateway degrades to synchronous
//! direct writes rather than dropping events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chronicle_core::flags::VoiceAttributes;
use chronicle_core::privacy::NameCodec;
use chronicle_core::{
    EmojiUsageRecord, EmojiUsageType, EventRecord, InviteEvent, InviteType, MemberEvent,
    MemberEventKind, MentionRecord, MessageEditRecord, MessageRecord,
};

use crate::buffer::EventBuffer;
use crate::error::Error;
use crate::flusher::DirectWriteFallback;
use crate::ratelimit::{Action, RateLimiter};
use crate::supervisor::MediaHealth;
use crate::voice::VoiceSessionTracker;

/// A message as delivered by the platform gateway.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub category_id: Option<i64>,
    pub message_id: i64,
    pub display_name: String,
    pub content: String,
    pub mention_ids: Vec<i64>,
    pub has_attachment: bool,
    pub has_embed: bool,
    pub created_at: DateTime<Utc>,
    pub is_bot: bool,
}

/// A voice state update: `channel_id` of `None` means the user left voice.
#[derive(Debug, Clone)]
pub struct IncomingVoiceState {
    pub tenant_id: i64,
    pub user_id: i64,
    pub channel_id: Option<i64>,
    pub category_id: Option<i64>,
    pub display_name: String,
    pub attrs: VoiceAttributes,
    pub at: DateTime<Utc>,
}

/// Write-side entry point shared by the gateway adapter.
pub struct IngestGateway {
    buffer: Arc<EventBuffer>,
    fallback: DirectWriteFallback,
    health: MediaHealth,
    limiter: RateLimiter,
    names: NameCodec,
    voice: Arc<VoiceSessionTracker>,
}

impl IngestGateway {
    pub fn new(
        buffer: Arc<EventBuffer>,
        fallback: DirectWriteFallback,
        health: MediaHealth,
        names: NameCodec,
        voice: Arc<VoiceSessionTracker>,
    ) -> Self {
        Self {
            buffer,
            fallback,
            health,
            limiter: RateLimiter::new(),
            names,
            voice,
        }
    }

    pub fn voice_tracker(&self) -> &Arc<VoiceSessionTracker> {
        &self.voice
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Buffer a record; fall back to a direct store write while the journal
    /// is reported down or when journaling fails. Errors never propagate to
    /// the event source.
    async fn submit(&self, record: EventRecord) {
        if !self.health.journal_ok() {
            if let Err(e) = record.validate() {
                tracing::debug!("dropping invalid record: {}", e);
                return;
            }
            self.write_through(record).await;
            return;
        }
        match self.buffer.enqueue(record.clone()) {
            Ok(()) => {}
            Err(Error::Core(e)) => {
                tracing::debug!("dropping invalid record: {}", e);
            }
            Err(e) => {
                tracing::warn!("journal write failed, writing directly: {}", e);
                self.write_through(record).await;
            }
        }
    }

    async fn write_through(&self, record: EventRecord) {
        if let Err(e) = self
            .fallback
            .write(chronicle_core::BufferedRecord::new(record))
            .await
        {
            tracing::error!("direct write failed, event lost: {}", e);
        }
    }

    async fn submit_all(&self, records: Vec<EventRecord>) {
        for record in records {
            self.submit(record).await;
        }
    }

    /// Message created: one message row, one mention row per mentioned user,
    /// and emoji usage rows for custom emojis in the content.
    pub async fn message_created(&self, msg: IncomingMessage) {
        if !self.limiter.check(Action::Message, msg.user_id) {
            return;
        }

        let display_name = self.names.encode(&msg.display_name);
        let length = msg.content.chars().count() as i32;

        self.submit(EventRecord::Message(MessageRecord {
            tenant_id: msg.tenant_id,
            user_id: msg.user_id,
            channel_id: msg.channel_id,
            category_id: msg.category_id,
            message_id: msg.message_id,
            display_name: display_name.clone(),
            length,
            mention_ids: msg.mention_ids.clone(),
            has_attachment: msg.has_attachment,
            has_embed: msg.has_embed,
            created_at: msg.created_at,
            is_bot: msg.is_bot,
        }))
        .await;

        if !msg.mention_ids.is_empty() && self.limiter.check(Action::Mention, msg.user_id) {
            for &mentioned in &msg.mention_ids {
                self.submit(EventRecord::Mention(MentionRecord {
                    tenant_id: msg.tenant_id,
                    mentioned_user_id: mentioned,
                    mentioner_user_id: msg.user_id,
                    channel_id: msg.channel_id,
                    category_id: msg.category_id,
                    message_id: msg.message_id,
                    display_name: display_name.clone(),
                    created_at: msg.created_at,
                }))
                .await;
            }
        }

        let emojis = scan_custom_emojis(&msg.content);
        if !emojis.is_empty() && self.limiter.check(Action::EmojiScan, msg.user_id) {
            for (token, count) in emojis {
                self.submit(EventRecord::Emoji(EmojiUsageRecord {
                    tenant_id: msg.tenant_id,
                    user_id: msg.user_id,
                    channel_id: msg.channel_id,
                    category_id: msg.category_id,
                    emoji_token: token,
                    is_custom: true,
                    usage_count: count,
                    last_used: msg.created_at,
                    usage_type: EmojiUsageType::Message,
                }))
                .await;
            }
        }
    }

    /// Message edited: append one edit-history row.
    #[allow(clippy::too_many_arguments)]
    pub async fn message_edited(
        &self,
        tenant_id: i64,
        user_id: i64,
        channel_id: i64,
        category_id: Option<i64>,
        message_id: i64,
        new_content: &str,
        edited_at: DateTime<Utc>,
    ) {
        if !self.limiter.check(Action::Edit, user_id) {
            return;
        }
        self.submit(EventRecord::MessageEdit(MessageEditRecord {
            tenant_id,
            user_id,
            channel_id,
            category_id,
            message_id,
            new_length: new_content.chars().count() as i32,
            edited_at,
        }))
        .await;
    }

    /// Reaction added to a message.
    #[allow(clippy::too_many_arguments)]
    pub async fn reaction_added(
        &self,
        tenant_id: i64,
        user_id: i64,
        channel_id: i64,
        category_id: Option<i64>,
        emoji_token: String,
        is_custom: bool,
        at: DateTime<Utc>,
    ) {
        if !self.limiter.check(Action::Reaction, user_id) {
            return;
        }
        self.submit(EventRecord::Emoji(EmojiUsageRecord {
            tenant_id,
            user_id,
            channel_id,
            category_id,
            emoji_token,
            is_custom,
            usage_count: 1,
            last_used: at,
            usage_type: EmojiUsageType::Reaction,
        }))
        .await;
    }

    /// Voice state changed: join, leave, move, or flag change.
    pub async fn voice_state_changed(&self, update: IncomingVoiceState) {
        let records = match update.channel_id {
            Some(channel_id) => {
                let mut out = self.voice.handle_join(
                    update.tenant_id,
                    update.user_id,
                    channel_id,
                    update.category_id,
                    self.names.encode(&update.display_name),
                    update.attrs,
                    update.at,
                );
                // Same-channel updates arrive as flag changes.
                out.extend(self.voice.handle_state(
                    update.tenant_id,
                    update.user_id,
                    update.attrs,
                    update.at,
                ));
                out
            }
            None => self.voice.handle_leave(update.tenant_id, update.user_id, update.at),
        };
        self.submit_all(records).await;
    }

    /// Member joined or left the community.
    pub async fn member_changed(
        &self,
        tenant_id: i64,
        user_id: i64,
        kind: MemberEventKind,
        display_name: &str,
        at: DateTime<Utc>,
    ) {
        self.submit(EventRecord::MemberEvent(MemberEvent {
            tenant_id,
            user_id,
            event_kind: kind,
            display_name: self.names.encode(display_name),
            occurred_at: at,
        }))
        .await;
    }

    /// Invite used (or classified as suspicious / a leave-rejoin).
    pub async fn invite_used(
        &self,
        tenant_id: i64,
        inviter_id: i64,
        invitee_id: Option<i64>,
        invite_code: String,
        invite_type: InviteType,
        at: DateTime<Utc>,
    ) {
        self.submit(EventRecord::Invite(InviteEvent {
            tenant_id,
            inviter_id,
            invitee_id,
            invite_code,
            invite_type,
            created_at: at,
        }))
        .await;
    }

    /// Periodic sampler tick: persist progress for long voice sessions.
    pub async fn sample_voice(&self) {
        let records = self.voice.sample_at(Utc::now());
        self.submit_all(records).await;
    }

    /// Stale-session sweep.
    pub async fn cleanup_voice(&self) {
        let records = self.voice.cleanup_stale_at(Utc::now());
        self.submit_all(records).await;
        self.limiter.prune();
    }

    /// Shutdown: close every tracked session so no voice time is lost.
    pub async fn close_voice_sessions(&self) {
        let records = self.voice.close_all_at(Utc::now());
        self.submit_all(records).await;
    }
}

/// Count custom emoji tokens (`<:name:id>` / `<a:name:id>`) in content.
///
/// Unicode emojis are left to the reaction path; scanning message bodies for
/// them would need a full grapheme table for little analytic gain.
fn scan_custom_emojis(content: &str) -> HashMap<String, i64> {
    let mut counts = HashMap::new();
    let bytes = content.as_bytes();
    let mut i = 0;
    while let Some(open) = content[i..].find('<') {
        let start = i + open;
        let Some(close_rel) = content[start..].find('>') else {
            break;
        };
        let end = start + close_rel;
        let inner = &content[start + 1..end];
        let body = inner.strip_prefix("a:").or_else(|| inner.strip_prefix(':'));
        if let Some(body) = body {
            let mut parts = body.splitn(2, ':');
            let name = parts.next().unwrap_or("");
            let id = parts.next().unwrap_or("");
            if !name.is_empty() && !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
                *counts.entry(name.to_string()).or_insert(0) += 1;
            }
        }
        i = end + 1;
        if i >= bytes.len() {
            break;
        }
    }
    counts
}
